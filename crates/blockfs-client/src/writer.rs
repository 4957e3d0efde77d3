//! Write-path orchestrator: buffers caller bytes into checksummed chunks and
//! packets, hands them to the background streamer, and implements the
//! flush / sync / close / abort contract.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use blockfs_proto::Packet;
use blockfs_types::{ChecksumParams, SequenceNumber};

use crate::client::SessionCtx;
use crate::error::{ClientError, ClientResult};
use crate::queue::StreamShared;
use crate::streamer::{AppendSetup, DataStreamer};

/// A file opened for writing.
///
/// Caller bytes are collected into checksum-chunk-sized pieces; a packet is
/// enqueued once it holds `chunks_per_packet` chunks or the block boundary
/// is reached. Two background workers (the data streamer and, per pipeline,
/// a response processor) move packets to storage nodes; the writer blocks
/// only on backpressure and on the explicit flush points.
pub struct FileWriter {
    ctx: Arc<SessionCtx>,
    shared: Arc<StreamShared>,
    streamer: Option<JoinHandle<()>>,
    path: String,
    params: ChecksumParams,
    block_size: u64,
    chunks_per_packet: usize,
    /// Offset within the current block where the next chunk lands.
    bytes_in_block: u64,
    chunk_buf: Vec<u8>,
    /// Bytes a chunk must reach before it is emitted. Normally the checksum
    /// chunk width; smaller while topping up an appended partial chunk.
    chunk_target: usize,
    /// Set while the first chunk after an append must exactly fill the
    /// existing partial checksum chunk.
    append_chunk: bool,
    next_seqno: i64,
    last_flush_offset: u64,
    current_packet: Option<Packet>,
}

impl FileWriter {
    /// Create `path` and open it for writing.
    pub(crate) async fn create(
        ctx: Arc<SessionCtx>,
        path: &str,
        overwrite: bool,
    ) -> ClientResult<Self> {
        ctx.check_open()?;
        let config = &ctx.config;
        if config.bytes_per_checksum == 0
            || config.block_size % config.bytes_per_checksum as u64 != 0
        {
            return Err(ClientError::Internal(format!(
                "block size {} is not a multiple of the checksum chunk width {}",
                config.block_size, config.bytes_per_checksum
            )));
        }
        ctx.namenode
            .create(
                path,
                &ctx.client_name,
                overwrite,
                config.replication,
                config.block_size,
            )
            .await?;
        Ok(Self::start(ctx, path, None, 0))
    }

    /// Reopen `path` for append.
    pub(crate) async fn append(ctx: Arc<SessionCtx>, path: &str) -> ClientResult<Self> {
        ctx.check_open()?;
        let last_block = ctx.namenode.append(path, &ctx.client_name).await?;
        let setup = last_block.map(|lb| AppendSetup {
            block: lb.block.clone(),
            token: lb.token,
            nodes: lb.nodes,
        });
        let bytes_in_block = setup.as_ref().map(|s| s.block.len).unwrap_or(0);
        Ok(Self::start(ctx, path, setup, bytes_in_block))
    }

    fn start(
        ctx: Arc<SessionCtx>,
        path: &str,
        append_setup: Option<AppendSetup>,
        bytes_in_block: u64,
    ) -> Self {
        let config = &ctx.config;
        let params = config.checksum_params();
        let block_size = config.block_size;
        let bpc = config.bytes_per_checksum as usize;

        let shared = Arc::new(StreamShared::new(config.max_pending_packets));
        ctx.begin_file_lease(path, Arc::clone(&shared));

        // An appended partial chunk is first topped up to a chunk boundary
        // with a dedicated single-chunk packet.
        let used_in_chunk = (bytes_in_block % bpc as u64) as usize;
        let (chunk_target, append_chunk) = if append_setup.is_some() && used_in_chunk > 0 {
            (bpc - used_in_chunk, true)
        } else {
            (bpc, false)
        };

        let streamer = DataStreamer::new(
            Arc::clone(&shared),
            Arc::clone(&ctx),
            path.to_string(),
            params,
            block_size,
            append_setup,
        );
        let handle = tokio::spawn(streamer.run());

        let chunks_per_packet = config.chunks_per_packet(config.write_packet_size);
        Self {
            ctx,
            shared,
            streamer: Some(handle),
            path: path.to_string(),
            params,
            block_size,
            chunks_per_packet,
            bytes_in_block,
            chunk_buf: Vec::with_capacity(bpc),
            chunk_target,
            append_chunk,
            next_seqno: 0,
            last_flush_offset: 0,
            current_packet: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn check(&self) -> ClientResult<()> {
        self.ctx.check_open()?;
        let st = self.shared.lock().await;
        if st.closed {
            return Err(st.error.clone().unwrap_or(ClientError::StreamClosed));
        }
        Ok(())
    }

    fn take_seqno(&mut self) -> SequenceNumber {
        let s = SequenceNumber(self.next_seqno);
        self.next_seqno += 1;
        s
    }

    async fn enqueue_current_packet(&mut self) {
        if let Some(pkt) = self.current_packet.take() {
            debug!(
                path = %self.path,
                seqno = %pkt.seqno,
                len = pkt.data_len(),
                last = pkt.last_in_block,
                "queueing packet"
            );
            self.shared
                .mutate(|st| {
                    st.last_queued = pkt.seqno;
                    st.pending.push_back(pkt);
                })
                .await;
        }
    }

    /// Emit the buffered chunk into the current packet, rolling the packet
    /// (and block accounting) when a boundary is reached.
    async fn flush_chunk(&mut self) -> ClientResult<()> {
        debug_assert!(!self.chunk_buf.is_empty());
        self.shared.wait_for_space().await?;

        if self.current_packet.is_none() {
            let max_chunks = if self.append_chunk {
                1
            } else {
                self.chunks_per_packet
            };
            self.current_packet = Some(Packet::new(
                self.params,
                self.bytes_in_block,
                self.take_seqno(),
                max_chunks,
            ));
        }
        let pkt = self.current_packet.as_mut().expect("just ensured");
        pkt.write_chunk(&self.chunk_buf);
        self.bytes_in_block += self.chunk_buf.len() as u64;
        self.chunk_buf.clear();

        let packet_full = pkt.is_full();
        let block_full = self.bytes_in_block == self.block_size;
        if packet_full || block_full {
            if block_full {
                let pkt = self.current_packet.as_mut().expect("still current");
                pkt.last_in_block = true;
            }
            self.enqueue_current_packet().await;
            if block_full {
                self.bytes_in_block = 0;
                self.last_flush_offset = 0;
            }
            if self.append_chunk {
                // The partial chunk is now aligned; resume full-size chunks.
                self.append_chunk = false;
                self.chunk_target = self.params.bytes_per_checksum as usize;
            }
            // The last packet of a block may be smaller than the target.
            let space_left = self.block_size - self.bytes_in_block;
            let psize = (self.ctx.config.write_packet_size as u64).min(space_left.max(1)) as usize;
            self.chunks_per_packet = self.ctx.config.chunks_per_packet(psize);
        }
        Ok(())
    }

    /// Buffer `data`, emitting chunks and packets as boundaries fill.
    /// Applies backpressure when pending + in-flight packets exceed the cap.
    pub async fn write(&mut self, mut data: &[u8]) -> ClientResult<()> {
        self.check().await?;
        while !data.is_empty() {
            let room = self.chunk_target - self.chunk_buf.len();
            let take = room.min(data.len());
            self.chunk_buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.chunk_buf.len() == self.chunk_target {
                self.flush_chunk().await?;
            }
        }
        Ok(())
    }

    /// Enqueue any partially filled packet and block until its sequence
    /// number (and everything before it) is acknowledged.
    pub async fn flush(&mut self) -> ClientResult<()> {
        self.check().await?;
        self.enqueue_current_packet().await;
        let target = self.shared.lock().await.last_queued;
        self.shared.wait_for_acked(target).await
    }

    /// Push buffered bytes — including a partial checksum chunk — into the
    /// pipeline and wait for acknowledgement. The partial chunk's bytes stay
    /// buffered so later writes extend the same chunk position; receivers
    /// tolerate the replay at identical offsets. When blocks were allocated
    /// since the previous sync, also persists allocations on the metadata
    /// service so concurrent readers can find them.
    pub async fn sync(&mut self) -> ClientResult<()> {
        self.check().await?;
        let result: ClientResult<()> = async {
            let saved_bytes = self.bytes_in_block;
            let had_packet = self.current_packet.is_some();

            if !self.chunk_buf.is_empty() {
                self.shared.wait_for_space().await?;
                if self.current_packet.is_none() {
                    let max_chunks = if self.append_chunk {
                        1
                    } else {
                        self.chunks_per_packet
                    };
                    self.current_packet = Some(Packet::new(
                        self.params,
                        self.bytes_in_block,
                        self.take_seqno(),
                        max_chunks,
                    ));
                }
                let pkt = self.current_packet.as_mut().expect("just ensured");
                pkt.write_chunk(&self.chunk_buf);
                self.bytes_in_block += self.chunk_buf.len() as u64;
                // Buffer deliberately kept.
            }

            if self.last_flush_offset != self.bytes_in_block {
                self.last_flush_offset = self.bytes_in_block;
                self.enqueue_current_packet().await;
            } else {
                // Everything up to here was already sent; discard the
                // packet and reclaim its unused sequence number.
                if !had_packet && self.current_packet.is_some() {
                    self.next_seqno -= 1;
                }
                self.current_packet = None;
            }
            self.bytes_in_block = saved_bytes;

            let target = self.shared.lock().await.last_queued;
            self.shared.wait_for_acked(target).await?;

            let persist = self
                .shared
                .mutate(|st| {
                    let p = st.persist_blocks && !st.closed;
                    st.persist_blocks = false;
                    p
                })
                .await;
            if persist {
                self.ctx
                    .namenode
                    .fsync(&self.path, &self.ctx.client_name)
                    .await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(path = %self.path, "error while syncing: {e}");
            self.shared
                .mutate(|st| {
                    if !st.closed {
                        st.set_error_once(e.clone());
                        st.closed = true;
                    }
                })
                .await;
            self.stop_workers(true).await;
            return Err(e);
        }
        Ok(())
    }

    /// Replicas currently in the pipeline for the block being written, or
    /// the file's replication target when no pipeline is up. The pipeline
    /// can be smaller than the target while failed nodes await re-replication.
    pub async fn current_replica_count(&self) -> usize {
        self.shared
            .lock()
            .await
            .pipeline_len
            .unwrap_or(self.ctx.config.replication as usize)
    }

    async fn stop_workers(&mut self, abort: bool) {
        self.shared.notify();
        if let Some(handle) = self.streamer.take() {
            if abort {
                handle.abort();
            }
            let _ = handle.await;
        }
    }

    /// Flush everything, mark the final packet, wait for full drainage,
    /// stop the workers, and run the completion protocol. Idempotent: a
    /// second close re-raises the stored fatal error if one occurred, else
    /// is a no-op.
    pub async fn close(&mut self) -> ClientResult<()> {
        {
            let st = self.shared.lock().await;
            if st.closed {
                self.ctx.end_file_lease(&self.path);
                return match st.error.clone() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }
        }
        let result = self.close_internal().await;
        self.ctx.end_file_lease(&self.path);
        result
    }

    async fn close_internal(&mut self) -> ClientResult<()> {
        let flushed: ClientResult<()> = async {
            self.ctx.check_open()?;
            if !self.chunk_buf.is_empty() {
                self.flush_chunk().await?;
            }
            // Mark the last packet of the last block; an empty payload
            // packet carries the flag if nothing is pending.
            if self.current_packet.is_none() && self.bytes_in_block != 0 {
                let seqno = self.take_seqno();
                self.current_packet = Some(Packet::new(
                    self.params,
                    self.bytes_in_block,
                    seqno,
                    self.chunks_per_packet,
                ));
            }
            if let Some(pkt) = self.current_packet.as_mut() {
                pkt.last_in_block = true;
            }
            self.enqueue_current_packet().await;
            let target = self.shared.lock().await.last_queued;
            self.shared.wait_for_acked(target).await?;
            Ok(())
        }
        .await;

        if let Err(e) = flushed {
            self.shared
                .mutate(|st| {
                    if !st.closed {
                        st.set_error_once(e.clone());
                        st.closed = true;
                    }
                })
                .await;
            self.stop_workers(true).await;
            return Err(e);
        }

        // All data acknowledged; release the workers.
        self.shared.mutate(|st| st.closed = true).await;
        self.stop_workers(false).await;
        if let Some(e) = self.shared.lock().await.error.clone() {
            return Err(e);
        }

        // Completion can lag while replicas report in; retry with a fixed
        // delay bounded by the client-wide timeout.
        let start = Instant::now();
        loop {
            if self
                .ctx
                .namenode
                .complete(&self.path, &self.ctx.client_name)
                .await?
            {
                return Ok(());
            }
            if !self.ctx.is_running() || start.elapsed() >= self.ctx.config.client_timeout {
                let e = ClientError::CompleteTimeout(format!(
                    "unable to complete {} (client running: {})",
                    self.path,
                    self.ctx.is_running()
                ));
                self.shared.mutate(|st| st.set_error_once(e.clone())).await;
                return Err(e);
            }
            tokio::time::sleep(self.ctx.config.complete_retry_delay).await;
        }
    }

    /// Immediate teardown: no flush, no completion. Releases the lease.
    /// Used for lease-timeout handling and forced teardown.
    pub async fn abort(&mut self) -> ClientResult<()> {
        self.shared
            .mutate(|st| {
                if !st.closed {
                    st.set_error_once(ClientError::LeaseExpired(format!(
                        "write lease on {} given up by abort",
                        self.path
                    )));
                    st.closed = true;
                }
            })
            .await;
        self.stop_workers(true).await;
        self.ctx.end_file_lease(&self.path);
        Ok(())
    }
}
