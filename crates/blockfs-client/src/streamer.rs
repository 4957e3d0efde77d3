//! Background workers of the write path.
//!
//! Each open output stream runs exactly one [`DataStreamer`] task; each
//! active pipeline connection additionally runs one response-processor task
//! draining acknowledgements. The streamer owns block allocation, pipeline
//! establishment, packet transmission, and pipeline recovery; it exits when
//! the stream closes or recovery declares the stream dead.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use blockfs_net::{io as net_io, IoStream, NetError};
use blockfs_proto::{
    end_of_block_marker, op::Status, Packet, PipelineAck, WriteBlockRequest, WriteSetupAck,
};
use blockfs_types::{AccessToken, Block, ChecksumParams, LocatedBlock, NodeAddress};

use crate::client::SessionCtx;
use crate::error::{ClientError, ClientResult};
use crate::queue::StreamShared;

struct PipelineConn {
    writer: WriteHalf<Box<dyn IoStream>>,
    responder: JoinHandle<()>,
}

/// Initial pipeline state when reopening a file whose last block is
/// partially filled. Streaming may only start after an append-recovery pass
/// (no replica accused, generation stamp bumped) has fenced stale writers.
pub(crate) struct AppendSetup {
    pub block: Block,
    pub token: AccessToken,
    pub nodes: Vec<NodeAddress>,
}

pub(crate) struct DataStreamer {
    shared: Arc<StreamShared>,
    ctx: Arc<SessionCtx>,
    path: String,
    params: ChecksumParams,
    block_size: u64,

    block: Option<Block>,
    token: AccessToken,
    nodes: Vec<NodeAddress>,
    /// Nodes that failed pipeline setup; never offered by `add_block` again.
    excluded: Vec<NodeAddress>,
    recovery_error_count: u32,
    /// Append semantics for the next recovery pass.
    is_append: bool,
    append_setup: Option<AppendSetup>,
    conn: Option<PipelineConn>,
}

impl DataStreamer {
    pub fn new(
        shared: Arc<StreamShared>,
        ctx: Arc<SessionCtx>,
        path: String,
        params: ChecksumParams,
        block_size: u64,
        append_setup: Option<AppendSetup>,
    ) -> Self {
        Self {
            shared,
            ctx,
            path,
            params,
            block_size,
            block: None,
            token: AccessToken::empty(),
            nodes: Vec::new(),
            excluded: Vec::new(),
            recovery_error_count: 0,
            is_append: append_setup.is_some(),
            append_setup,
            conn: None,
        }
    }

    pub async fn run(mut self) {
        // Append: adopt the existing last-block pipeline and force a
        // no-eviction recovery pass before any packet flows.
        if let Some(setup) = self.append_setup.take() {
            self.block = Some(setup.block);
            self.token = setup.token;
            self.nodes = setup.nodes;
            self.shared
                .mutate(|st| {
                    st.has_error = true;
                    st.error_index = None;
                })
                .await;
        }

        let mut last_packet_at = Instant::now();
        loop {
            let (closed, has_error) = {
                let st = self.shared.lock().await;
                (st.closed, st.has_error)
            };
            if has_error && !closed {
                if !self.process_error().await {
                    break;
                }
                continue;
            }
            if closed {
                break;
            }

            // Wait for a packet, a state change, or (on an idle open
            // pipeline) the heartbeat deadline.
            let wait = self.shared.wait_until(|st| {
                if st.closed || st.has_error || !st.pending.is_empty() {
                    Some(())
                } else {
                    None
                }
            });
            if self.conn.is_some() {
                let deadline = self.ctx.config.heartbeat_interval();
                let elapsed = last_packet_at.elapsed();
                if elapsed < deadline {
                    if tokio::time::timeout(deadline - elapsed, wait).await.is_err() {
                        debug!(path = %self.path, "pipeline idle, sending heartbeat");
                    }
                } else {
                    drop(wait);
                }
            } else {
                wait.await;
            }

            let (closed, has_error, one) = {
                let st = self.shared.lock().await;
                let one = match st.pending.front() {
                    Some(p) => p.clone(),
                    None => Packet::heartbeat(self.params),
                };
                (st.closed, st.has_error, one)
            };
            if closed || has_error {
                continue;
            }
            if one.is_heartbeat() && self.conn.is_none() {
                continue;
            }

            if self.conn.is_none() {
                debug!(path = %self.path, "allocating new block");
                if let Err(e) = self.next_block_output_stream().await {
                    warn!(path = %self.path, "could not set up block pipeline: {e}");
                    self.fail_stream(e).await;
                    break;
                }
            }

            if one.offset_in_block >= self.block_size {
                self.fail_stream(ClientError::Internal(format!(
                    "packet offset {} beyond block size {}",
                    one.offset_in_block, self.block_size
                )))
                .await;
                break;
            }

            // Move the packet to the in-flight queue before transmission;
            // heartbeats are not queued for acknowledgement.
            if !one.is_heartbeat() {
                self.shared
                    .mutate(|st| {
                        if let Some(p) = st.pending.pop_front() {
                            st.inflight.push_back(p);
                        }
                    })
                    .await;
            }

            match self.send_packet(&one).await {
                Ok(()) => {
                    last_packet_at = Instant::now();
                    debug!(
                        path = %self.path,
                        seqno = %one.seqno,
                        offset = one.offset_in_block,
                        last = one.last_in_block,
                        "wrote packet"
                    );
                }
                Err(e) => {
                    // A bare send failure does not identify a replica; if
                    // the reconnect also fails, setup will accuse index 0.
                    self.shared.raise_error(ClientError::Net(e), None).await;
                    continue;
                }
            }

            if one.last_in_block {
                // Block finished: wait for every ack, then retire the
                // pipeline and await the next block.
                let drained = self
                    .shared
                    .wait_until(|st| {
                        if st.has_error || st.closed {
                            Some(false)
                        } else if st.inflight.is_empty() {
                            Some(true)
                        } else {
                            None
                        }
                    })
                    .await;
                if !drained {
                    continue;
                }
                debug!(path = %self.path, block = ?self.block, "closing finished block");
                self.teardown_conn(false).await;
                self.block = None;
                self.nodes.clear();
                self.shared.mutate(|st| st.pipeline_len = None).await;
            }
        }

        self.teardown_conn(true).await;
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<(), NetError> {
        let conn = self.conn.as_mut().expect("pipeline established");
        conn.writer.write_all(&packet.encode()).await?;
        if packet.last_in_block {
            conn.writer.write_all(&end_of_block_marker()).await?;
        }
        conn.writer.flush().await?;
        Ok(())
    }

    /// Allocate the next block and connect its pipeline, abandoning the
    /// block and excluding the first bad node on setup failure.
    async fn next_block_output_stream(&mut self) -> ClientResult<()> {
        let mut retries = self.ctx.config.block_write_retries;
        loop {
            self.shared
                .mutate(|st| {
                    if !st.closed {
                        st.has_error = false;
                        st.error = None;
                        st.error_index = None;
                    }
                })
                .await;

            let lb = self.locate_following_block().await?;
            if lb.nodes.is_empty() {
                return Err(ClientError::Internal(format!(
                    "metadata service allocated {} with no replicas",
                    lb.block
                )));
            }
            self.block = Some(lb.block.clone());
            self.token = lb.token.clone();
            self.nodes = lb.nodes.clone();

            match self.create_block_output_stream(false).await {
                Ok(()) => return Ok(()),
                Err((e, bad_index)) => {
                    let block = self.block.clone().expect("just set");
                    info!(block = %block, "abandoning block after setup failure: {e}");
                    if let Err(abandon_err) = self
                        .ctx
                        .namenode
                        .abandon_block(&block, &self.path, &self.ctx.client_name)
                        .await
                    {
                        info!(block = %block, "abandon failed: {abandon_err}");
                    }
                    if let Some(i) = bad_index {
                        if i < self.nodes.len() {
                            info!(node = %self.nodes[i], "excluding node");
                            self.excluded.push(self.nodes[i].clone());
                        }
                    }
                    if retries == 0 {
                        return Err(e);
                    }
                    retries -= 1;
                }
            }
        }
    }

    /// Ask the metadata service for the next block, waiting out transient
    /// "previous block not yet replicated" answers with doubling back-off.
    async fn locate_following_block(&mut self) -> ClientResult<LocatedBlock> {
        let mut retries = self.ctx.config.locate_block_retries;
        let mut sleep = self.ctx.config.locate_block_retry_delay;
        loop {
            match self
                .ctx
                .namenode
                .add_block(&self.path, &self.ctx.client_name, &self.excluded)
                .await
            {
                Ok(lb) => return Ok(lb),
                Err(e @ ClientError::NotYetReplicated(_)) => {
                    if retries == 0 {
                        return Err(e);
                    }
                    retries -= 1;
                    warn!(path = %self.path, retries, "previous block not yet replicated, waiting");
                    tokio::time::sleep(sleep).await;
                    sleep *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Connect to the first node of the pipeline and run the setup
    /// handshake. On failure, names the pipeline index to evict; an empty
    /// failing-node name still accuses index 0 by convention.
    async fn create_block_output_stream(
        &mut self,
        is_recovery: bool,
    ) -> Result<(), (ClientError, Option<usize>)> {
        let block = self.block.clone().expect("block allocated");
        let first = self.nodes[0].clone();
        debug!(pipeline = ?self.nodes, recovery = is_recovery, "connecting pipeline");

        // Without a reply naming the culprit, the node we failed to talk to
        // is index 0 by convention.
        let setup: ClientResult<(
            WriteHalf<Box<dyn IoStream>>,
            ReadHalf<Box<dyn IoStream>>,
            WriteSetupAck,
        )> = async {
            let stream = self.ctx.connector.connect(&first).await?;
            let (mut read_half, mut write_half) = tokio::io::split(stream);

            let request = WriteBlockRequest {
                block: block.clone(),
                pipeline_size: self.nodes.len() as u32,
                is_recovery,
                client_name: self.ctx.client_name.clone(),
                downstream: self.nodes[1..].to_vec(),
                token: self.token.clone(),
                params: self.params,
            };
            write_half
                .write_all(&request.encode())
                .await
                .map_err(|e| ClientError::Net(e.into()))?;
            write_half
                .flush()
                .await
                .map_err(|e| ClientError::Net(e.into()))?;

            let raw_status = net_io::read_u16(&mut read_half).await?;
            let status = Status::from_wire(raw_status).ok_or_else(|| {
                ClientError::ProtocolViolation(format!(
                    "unknown pipeline setup status {raw_status}"
                ))
            })?;
            let first_bad_node = net_io::read_string(&mut read_half).await?;
            Ok((
                write_half,
                read_half,
                WriteSetupAck {
                    status,
                    first_bad_node,
                },
            ))
        }
        .await;

        let (write_half, read_half, ack) = setup.map_err(|e| (e, Some(0)))?;
        if !ack.status.is_success() {
            let index = if ack.first_bad_node.is_empty() {
                0
            } else {
                self.nodes
                    .iter()
                    .position(|n| n.to_string() == ack.first_bad_node)
                    .unwrap_or(0)
            };
            let err = if ack.status == Status::ErrorAccessToken {
                ClientError::AccessTokenInvalid(format!(
                    "pipeline setup for {block} refused, first bad node {:?}",
                    ack.first_bad_node
                ))
            } else {
                ClientError::Net(NetError::Io(format!(
                    "bad pipeline setup ack, first bad node {:?}",
                    ack.first_bad_node
                )))
            };
            return Err((err, Some(index)));
        }

        let responder = tokio::spawn(response_loop(read_half, Arc::clone(&self.shared)));
        self.conn = Some(PipelineConn {
            writer: write_half,
            responder,
        });
        let pipeline_len = self.nodes.len();
        self.shared
            .mutate(|st| {
                st.persist_blocks = true;
                st.pipeline_len = Some(pipeline_len);
            })
            .await;
        Ok(())
    }

    /// Pipeline recovery. Returns `false` when the stream is dead.
    async fn process_error(&mut self) -> bool {
        // The responder owns the last read of the old connection; stop it
        // before touching anything else.
        self.teardown_conn(true).await;

        // At-least-once redelivery: everything unacknowledged goes back to
        // the front of the pending queue with its original sequence number.
        let error_index = self
            .shared
            .mutate(|st| {
                while let Some(p) = st.inflight.pop_back() {
                    st.pending.push_front(p);
                }
                st.error_index.take()
            })
            .await;

        if self.block.is_none() || self.nodes.is_empty() {
            self.fail_stream(ClientError::Internal(format!(
                "could not get block locations for {}, aborting",
                self.path
            )))
            .await;
            return false;
        }

        // Remove exactly the accused node, never more than one per pass.
        if let Some(i) = error_index {
            if self.nodes.len() <= 1 {
                self.fail_stream(ClientError::AllNodesFailed(format!(
                    "{:?} for {}",
                    self.nodes, self.path
                )))
                .await;
                return false;
            }
            if i < self.nodes.len() {
                warn!(block = ?self.block, node = %self.nodes[i], "evicting bad pipeline node");
                self.nodes.remove(i);
            }
        }

        // Deterministic primary: the least node by endpoint order, so
        // concurrent clients recovering the same block pick the same
        // coordinator.
        let primary = self
            .nodes
            .iter()
            .min()
            .cloned()
            .expect("non-empty pipeline");
        let block = self.block.clone().expect("checked above");
        let recovered = self
            .ctx
            .datanodes
            .recover_block(&primary, &block, self.is_append, &self.nodes)
            .await;

        let lb = match recovered {
            Ok(lb) => lb,
            Err(e) => {
                self.recovery_error_count += 1;
                warn!(
                    %primary,
                    attempt = self.recovery_error_count,
                    "block recovery attempt failed: {e}"
                );
                if self.recovery_error_count > self.ctx.config.recovery_max_retries {
                    if self.nodes.len() > 1 {
                        // The coordinator itself looks bad: evict it and
                        // start the count over.
                        if let Some(pos) = self.nodes.iter().position(|n| *n == primary) {
                            warn!(%primary, "marking recovery coordinator as bad");
                            self.nodes.remove(pos);
                        }
                        self.recovery_error_count = 0;
                        tokio::time::sleep(self.ctx.config.recovery_retry_delay).await;
                        return true;
                    }
                    self.fail_stream(ClientError::RecoveryFailed(format!(
                        "recovery of {block} through {primary} failed {} times",
                        self.recovery_error_count
                    )))
                    .await;
                    return false;
                }
                tokio::time::sleep(self.ctx.config.recovery_retry_delay).await;
                return true;
            }
        };

        // Rebind to the recovered block identity and reconnect.
        self.recovery_error_count = 0;
        self.is_append = false;
        self.block = Some(lb.block);
        self.token = lb.token;
        if !lb.nodes.is_empty() {
            self.nodes = lb.nodes;
        }
        self.shared
            .mutate(|st| {
                if !st.closed {
                    st.has_error = false;
                    st.error = None;
                    st.error_index = None;
                }
            })
            .await;

        if let Err((e, idx)) = self.create_block_output_stream(true).await {
            self.shared.raise_error(e, idx).await;
        }
        true
    }

    /// Mark the stream permanently dead and wake everyone.
    async fn fail_stream(&mut self, err: ClientError) {
        warn!(path = %self.path, "write stream aborted: {err}");
        self.shared
            .mutate(|st| {
                st.error = Some(err);
                st.closed = true;
            })
            .await;
    }

    async fn teardown_conn(&mut self, abort_responder: bool) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.writer.shutdown().await;
            if abort_responder {
                conn.responder.abort();
            }
            let _ = conn.responder.await;
        }
    }
}

/// Response processor: drains acknowledgement frames from the pipeline's
/// reply channel, matching each to the head of the in-flight queue.
async fn response_loop(mut read_half: ReadHalf<Box<dyn IoStream>>, shared: Arc<StreamShared>) {
    let mut seen_last = false;
    while !seen_last {
        let frame: ClientResult<PipelineAck> = async {
            let seqno = net_io::read_i64(&mut read_half).await?;
            let count = net_io::read_u16(&mut read_half).await? as usize;
            let mut replies = Vec::with_capacity(count);
            for _ in 0..count {
                let raw = net_io::read_u16(&mut read_half).await?;
                replies.push(Status::from_wire(raw).ok_or(ClientError::ProtocolViolation(
                    format!("unknown ack status {raw}"),
                ))?);
            }
            Ok(PipelineAck::new(blockfs_types::SequenceNumber(seqno), replies))
        }
        .await;

        let ack = match frame {
            Ok(ack) => ack,
            Err(e) => {
                let closed = shared.lock().await.closed;
                if !closed {
                    warn!("response processor read failed: {e}");
                    shared.raise_error(e, None).await;
                }
                return;
            }
        };
        debug!(seqno = %ack.seqno, replies = ?ack.replies, "received ack");

        // A non-success reply names the first failing replica by index.
        if let Some(bad) = ack.first_bad_index() {
            shared
                .raise_error(
                    ClientError::Internal(format!(
                        "bad ack {:?} from replica {bad}",
                        ack.replies[bad]
                    )),
                    Some(bad),
                )
                .await;
            return;
        }

        // Heartbeats are acknowledged but never queued.
        if ack.seqno.is_heartbeat() {
            continue;
        }

        // Strict FIFO: the ack must match both the head of the in-flight
        // queue and `last_acked + 1`. A gap or repeat is a protocol
        // violation that kills the stream outright.
        let outcome = shared
            .mutate(|st| match st.inflight.front() {
                None => Err(ClientError::ProtocolViolation(format!(
                    "ack {} with empty in-flight queue",
                    ack.seqno
                ))),
                Some(head) if head.seqno != ack.seqno => Err(ClientError::ProtocolViolation(
                    format!("expected ack for {}, received {}", head.seqno, ack.seqno),
                )),
                Some(_) => {
                    if ack.seqno != st.last_acked.next() {
                        return Err(ClientError::ProtocolViolation(format!(
                            "ack {} does not follow {}",
                            ack.seqno, st.last_acked
                        )));
                    }
                    let p = st.inflight.pop_front().expect("head checked");
                    st.last_acked = ack.seqno;
                    Ok(p.last_in_block)
                }
            })
            .await;

        match outcome {
            Ok(last) => seen_last = last,
            Err(e) => {
                warn!("fatal ack violation: {e}");
                shared
                    .mutate(|st| {
                        st.set_error_once(e);
                        st.closed = true;
                    })
                    .await;
                return;
            }
        }
    }
}
