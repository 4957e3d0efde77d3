//! Read-path orchestrator: maps file offsets to blocks through a cached,
//! lazily extended location list, selects live replicas, and drives block
//! readers with transparent dead-replica fail-over.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use blockfs_net::is_local_address;
use blockfs_types::{Block, LocatedBlock, LocatedBlocks, NodeAddress};

use crate::block_reader::{read_full, BlockReader, RemoteBlockReader};
use crate::client::SessionCtx;
use crate::error::{ClientError, ClientResult};
use crate::local_reader::LocalBlockReader;

struct CurrentRead {
    reader: Box<dyn BlockReader>,
    node: NodeAddress,
    block: Block,
}

/// A file opened for reading.
///
/// All reading happens synchronously on the caller's task, including replica
/// fail-over; there are no background workers on the read path. Methods take
/// `&mut self`, so concurrent use of one reader requires external
/// serialization by design.
pub struct FileReader {
    ctx: Arc<SessionCtx>,
    path: String,
    verify: bool,
    /// Cleared permanently when short-circuit access is denied.
    short_circuit: bool,
    cache: LocatedBlocks,
    /// Replicas known unreachable or corrupt for this stream. Cleared when
    /// the location cache is refreshed; never outlives the stream.
    dead_nodes: HashSet<NodeAddress>,
    pos: u64,
    /// Inclusive end of the current block; `None` forces a reconnect on the
    /// next read.
    block_end: Option<u64>,
    current: Option<CurrentRead>,
    /// Location-refetch rounds since the last user-facing call.
    failures: u32,
    closed: bool,
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader").finish_non_exhaustive()
    }
}

impl FileReader {
    pub(crate) async fn open(ctx: Arc<SessionCtx>, path: &str) -> ClientResult<Self> {
        ctx.check_open()?;
        let verify = ctx.config.verify_checksums;
        let short_circuit = ctx.config.short_circuit_reads;
        let mut reader = Self {
            ctx,
            path: path.to_string(),
            verify,
            short_circuit,
            cache: LocatedBlocks::default(),
            dead_nodes: HashSet::new(),
            pos: 0,
            block_end: None,
            current: None,
            failures: 0,
            closed: false,
        };
        reader.open_info().await?;
        Ok(reader)
    }

    /// Grab the open-file info from the metadata service.
    ///
    /// When a cluster restarts, storage nodes may not have reported in yet
    /// and the last block of a file under construction can come back with no
    /// replicas; retry a few times before giving up.
    async fn open_info(&mut self) -> ClientResult<()> {
        let mut retries = self.ctx.config.open_info_retries;
        while retries > 0 {
            if self.fetch_located_blocks().await? {
                return Ok(());
            }
            retries -= 1;
            warn!(
                path = %self.path,
                retries, "last block locations unavailable, retrying"
            );
            tokio::time::sleep(self.ctx.config.open_info_retry_delay).await;
        }
        Err(ClientError::Internal(format!(
            "could not obtain the last block locations of {}",
            self.path
        )))
    }

    /// Fetch a fresh prefetch window of locations. Returns `false` when the
    /// last block of an under-construction file has no replicas yet.
    async fn fetch_located_blocks(&mut self) -> ClientResult<bool> {
        let mut new_info = self
            .ctx
            .namenode
            .get_block_locations(&self.path, 0, self.ctx.config.prefetch_size())
            .await?;

        if !self.cache.is_empty()
            && !self.cache.under_construction
            && !new_info.under_construction
        {
            for (old, new) in self.cache.blocks.iter().zip(new_info.blocks.iter()) {
                if old.block != new.block {
                    return Err(ClientError::Internal(format!(
                        "block list for {} has changed",
                        self.path
                    )));
                }
            }
        }

        let updated = self.update_last_block_length(&mut new_info).await?;
        self.cache = new_info;
        Ok(updated)
    }

    /// For a file under construction, learn the true length of its last
    /// block from one of the replicas; the node's answer overrides the
    /// metadata service.
    async fn update_last_block_length(&self, info: &mut LocatedBlocks) -> ClientResult<bool> {
        if !info.under_construction || info.is_empty() {
            return Ok(true);
        }
        let file_length = info.file_length;
        let last = info.blocks.last_mut().expect("non-empty");
        if last.end_offset() != file_length {
            return Ok(true);
        }
        if last.nodes.is_empty() {
            return Ok(false);
        }

        let mut fresh: Option<Block> = None;
        for node in &last.nodes {
            match self.ctx.datanodes.get_block_info(node, &last.block).await {
                Ok(block) => {
                    fresh = Some(block);
                    break;
                }
                Err(e) => {
                    info!(%node, block = %last.block, "failed to get block info: {e}");
                }
            }
        }
        let fresh = fresh.ok_or_else(|| {
            ClientError::Internal(format!(
                "failed to get length of {} from any replica",
                last.block
            ))
        })?;

        let delta = fresh.len as i64 - last.block.len as i64;
        last.block.len = fresh.len;
        info.file_length = (info.file_length as i64 + delta) as u64;
        debug!(
            block = %last.block,
            file_length = info.file_length,
            "corrected last block length"
        );
        Ok(true)
    }

    pub fn file_length(&self) -> u64 {
        self.cache.file_length
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Bytes between the cursor and end of file.
    pub fn available(&self) -> u64 {
        self.file_length().saturating_sub(self.pos)
    }

    /// The replica currently being read from, if a connection is live.
    pub fn current_node(&self) -> Option<&NodeAddress> {
        self.current.as_ref().map(|c| &c.node)
    }

    /// Find the cached block containing `offset`, extending the cache from
    /// the metadata service when needed.
    async fn get_block_at(
        &mut self,
        offset: u64,
        update_position: bool,
    ) -> ClientResult<LocatedBlock> {
        let idx = match self.cache.find_block(offset) {
            Ok(idx) => idx,
            Err(insert_at) => {
                let fetched = self
                    .ctx
                    .namenode
                    .get_block_locations(&self.path, offset, self.ctx.config.prefetch_size())
                    .await?;
                self.cache.insert_range(insert_at, fetched.blocks);
                self.cache.find_block(offset).map_err(|_| {
                    ClientError::Internal(format!(
                        "could not find target position {offset} in {}",
                        self.path
                    ))
                })?
            }
        };
        let blk = self.cache.get(idx).expect("index from find_block").clone();
        if update_position {
            self.pos = offset;
            self.block_end = Some(blk.end_offset() - 1);
        }
        Ok(blk)
    }

    /// Refetch locations covering `offset` unconditionally (used to refresh
    /// an expired access token).
    async fn fetch_block_at(&mut self, offset: u64) -> ClientResult<()> {
        let insert_at = match self.cache.find_block(offset) {
            Ok(idx) => idx,
            Err(idx) => idx,
        };
        let fetched = self
            .ctx
            .namenode
            .get_block_locations(&self.path, offset, self.ctx.config.prefetch_size())
            .await?;
        self.cache.insert_range(insert_at, fetched.blocks);
        Ok(())
    }

    /// Blocks covering `[offset, offset + length)`, extending the cache as
    /// needed. The returned run is contiguous and non-overlapping.
    async fn block_range(&mut self, offset: u64, length: u64) -> ClientResult<Vec<LocatedBlock>> {
        let mut out = Vec::new();
        let mut cur = offset;
        let end = offset + length;
        while cur < end {
            match self.cache.find_block(cur) {
                Ok(idx) => {
                    let blk = self.cache.get(idx).expect("found").clone();
                    cur = blk.end_offset();
                    out.push(blk);
                }
                Err(insert_at) => {
                    let fetched = self
                        .ctx
                        .namenode
                        .get_block_locations(&self.path, cur, end - cur)
                        .await?;
                    if fetched.is_empty() {
                        return Err(ClientError::Internal(format!(
                            "no blocks cover offset {cur} of {}",
                            self.path
                        )));
                    }
                    self.cache.insert_range(insert_at, fetched.blocks);
                }
            }
        }
        Ok(out)
    }

    /// Pick the first replica not in the dead set. When the whole round is
    /// exhausted, sleep, clear the dead set, refetch locations, and count a
    /// block-acquire failure.
    async fn choose_datanode(
        &mut self,
        block: &LocatedBlock,
    ) -> ClientResult<(NodeAddress, LocatedBlock)> {
        let mut block = block.clone();
        loop {
            if let Some(node) = block
                .nodes
                .iter()
                .find(|n| !self.dead_nodes.contains(*n))
            {
                return Ok((node.clone(), block));
            }

            if self.failures >= self.ctx.config.max_block_acquire_failures {
                return Err(ClientError::BlockAcquireFailed {
                    block: block.block.to_string(),
                    attempts: self.failures,
                });
            }
            info!(
                block = %block.block,
                "no live replica, refetching locations and retrying"
            );
            tokio::time::sleep(self.ctx.config.refetch_locations_delay).await;
            self.dead_nodes.clear();
            self.open_info().await?;
            block = self.get_block_at(block.start_offset, false).await?;
            self.failures += 1;
        }
    }

    fn should_short_circuit(&self, node: &NodeAddress) -> bool {
        self.short_circuit && !self.cache.under_construction && is_local_address(node)
    }

    async fn open_local(
        &self,
        node: &NodeAddress,
        block: &LocatedBlock,
        offset_into_block: u64,
    ) -> ClientResult<Box<dyn BlockReader>> {
        let paths = self
            .ctx
            .datanodes
            .local_block_paths(node, &block.block, &block.token)
            .await?;
        let reader =
            LocalBlockReader::open(&paths, &block.block, offset_into_block, self.verify).await?;
        Ok(Box::new(reader))
    }

    async fn open_remote(
        &self,
        node: &NodeAddress,
        block: &LocatedBlock,
        offset_into_block: u64,
    ) -> ClientResult<Box<dyn BlockReader>> {
        let stream = self.ctx.connector.connect(node).await?;
        let reader = RemoteBlockReader::open(
            stream,
            &block.block,
            &block.token,
            &self.ctx.client_name,
            offset_into_block,
            block.block.len - offset_into_block,
            self.verify,
        )
        .await?;
        Ok(Box::new(reader))
    }

    /// Connect to the best replica for the block containing `target` and
    /// make it the current reader.
    async fn block_seek_to(&mut self, target: u64) -> ClientResult<()> {
        if target >= self.file_length() {
            return Err(ClientError::Internal(
                "attempted to read past end of file".into(),
            ));
        }
        if let Some(mut cur) = self.current.take() {
            cur.reader.close().await;
        }

        let mut refetch_token = 1;
        loop {
            let target_block = self.get_block_at(target, true).await?;
            let offset_into_block = target - target_block.start_offset;
            let (node, target_block) = self.choose_datanode(&target_block).await?;

            if self.should_short_circuit(&node) {
                match self.open_local(&node, &target_block, offset_into_block).await {
                    Ok(reader) => {
                        self.current = Some(CurrentRead {
                            reader,
                            node,
                            block: target_block.block,
                        });
                        return Ok(());
                    }
                    Err(ClientError::AccessDenied(msg)) => {
                        // Access-control failure permanently disables
                        // short-circuit for this stream.
                        warn!("short circuit access failed: {msg}");
                        self.short_circuit = false;
                    }
                    Err(e) if e.is_token_error() && refetch_token > 0 => {
                        refetch_token -= 1;
                        self.fetch_block_at(target).await?;
                        continue;
                    }
                    Err(e) => {
                        info!(
                            block = %target_block.block,
                            "local read failed ({e}), falling back to the network path"
                        );
                    }
                }
            }

            match self.open_remote(&node, &target_block, offset_into_block).await {
                Ok(reader) => {
                    self.current = Some(CurrentRead {
                        reader,
                        node,
                        block: target_block.block,
                    });
                    return Ok(());
                }
                Err(e) if e.is_token_error() && refetch_token > 0 => {
                    refetch_token -= 1;
                    self.fetch_block_at(target).await?;
                }
                Err(e) => {
                    warn!(%node, "failed to connect ({e}), adding to dead nodes");
                    self.dead_nodes.insert(node);
                }
            }
        }
    }

    /// Reconnect to a (possibly identical) replica for the current position.
    async fn seek_to_block_source(&mut self, target: u64) -> ClientResult<()> {
        self.block_seek_to(target).await
    }

    /// Force selection of a replica other than the current one; used after
    /// checksum or I/O failure. Returns whether a distinct replica was found.
    pub async fn seek_to_new_source(&mut self, target: u64) -> ClientResult<bool> {
        let Some(old_node) = self.current.as_ref().map(|c| c.node.clone()) else {
            self.block_seek_to(target).await?;
            return Ok(true);
        };
        let was_dead = self.dead_nodes.contains(&old_node);
        self.dead_nodes.insert(old_node.clone());
        let result = self.block_seek_to(target).await;
        if !was_dead {
            // block_seek_to may have cleared and repopulated the dead set;
            // dropping our temporary mark afterwards is fine either way.
            self.dead_nodes.remove(&old_node);
        }
        result?;
        let new_node = self.current.as_ref().expect("just connected").node.clone();
        Ok(new_node != old_node)
    }

    /// Report a corrupt replica for out-of-band repair; best effort.
    async fn report_checksum_failure(&self, block: &Block, node: &NodeAddress) {
        let located = LocatedBlock::new(
            block.clone(),
            0,
            vec![node.clone()],
            blockfs_types::AccessToken::empty(),
        );
        if let Err(e) = self.ctx.namenode.report_bad_blocks(&[located]).await {
            info!(block = %block, "error reporting corrupt block, bad replica remains: {e}");
        }
    }

    /// Read from the current block reader, retrying the same node once for
    /// transient connection drops. Checksum failures mark the node dead,
    /// fire the bad-block report, and propagate immediately.
    async fn read_buffer(&mut self, buf: &mut [u8]) -> ClientResult<usize> {
        let mut retry_current = true;
        loop {
            let result = {
                let cur = self
                    .current
                    .as_mut()
                    .ok_or_else(|| ClientError::Internal("no block reader".into()))?;
                cur.reader.read(buf).await
            };
            let (node, block) = {
                let cur = self.current.as_ref().expect("checked above");
                (cur.node.clone(), cur.block.clone())
            };
            match result {
                Ok(n) => return Ok(n),
                Err(e @ ClientError::ChecksumMismatch { .. }) => {
                    warn!(block = %block, %node, "checksum error: {e}");
                    self.report_checksum_failure(&block, &node).await;
                    self.dead_nodes.insert(node);
                    return Err(e);
                }
                Err(e) => {
                    if retry_current {
                        // One same-node retry covers a node dropping an idle
                        // connection without the replica being bad.
                        retry_current = false;
                        self.seek_to_block_source(self.pos).await?;
                    } else {
                        warn!(block = %block, %node, "read failed: {e}");
                        self.dead_nodes.insert(node);
                        if !self.seek_to_new_source(self.pos).await? {
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Sequential read at the stream cursor. `Ok(0)` signals end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> ClientResult<usize> {
        self.ctx.check_open()?;
        if self.closed {
            return Err(ClientError::StreamClosed);
        }
        self.failures = 0;
        if buf.is_empty() || self.pos >= self.file_length() {
            return Ok(0);
        }

        let mut retries = self.ctx.config.read_retries;
        loop {
            let attempt: ClientResult<usize> = async {
                match self.block_end {
                    Some(end) if self.pos <= end => {}
                    _ => self.block_seek_to(self.pos).await?,
                }
                let end = self.block_end.expect("set by block_seek_to");
                let real_len = (buf.len() as u64).min(end - self.pos + 1) as usize;
                let n = self.read_buffer(&mut buf[..real_len]).await?;
                if n == 0 {
                    return Err(ClientError::Internal(
                        "unexpected end of stream from replica".into(),
                    ));
                }
                Ok(n)
            }
            .await;

            match attempt {
                Ok(n) => {
                    self.pos += n as u64;
                    return Ok(n);
                }
                Err(e @ ClientError::ChecksumMismatch { .. }) => return Err(e),
                Err(e) => {
                    self.block_end = None;
                    if let Some(cur) = &self.current {
                        self.dead_nodes.insert(cur.node.clone());
                    }
                    retries -= 1;
                    if retries == 0 {
                        return Err(e);
                    }
                    warn!(path = %self.path, "read failed, retrying: {e}");
                }
            }
        }
    }

    /// Positional read: fills `buf` from `position` without touching the
    /// sequential cursor. Returns the bytes read, clamped at end of file.
    pub async fn read_at(&mut self, position: u64, buf: &mut [u8]) -> ClientResult<usize> {
        self.ctx.check_open()?;
        if self.closed {
            return Err(ClientError::StreamClosed);
        }
        self.failures = 0;
        let file_len = self.file_length();
        if position >= file_len || buf.is_empty() {
            return Ok(0);
        }
        let real_len = (buf.len() as u64).min(file_len - position) as usize;

        let range = self.block_range(position, real_len as u64).await?;
        let mut pos = position;
        let mut off = 0usize;
        let mut remaining = real_len as u64;
        for blk in range {
            let start_in_block = pos - blk.start_offset;
            let to_read = remaining.min(blk.block.len - start_in_block);
            self.fetch_block_byte_range(
                &blk,
                start_in_block,
                &mut buf[off..off + to_read as usize],
            )
            .await?;
            remaining -= to_read;
            pos += to_read;
            off += to_read as usize;
        }
        debug_assert_eq!(remaining, 0);
        Ok(real_len)
    }

    /// Fetch one in-block range with its own replica-selection loop,
    /// mirroring the sequential path's retry and dead-node logic but scoped
    /// to this call.
    async fn fetch_block_byte_range(
        &mut self,
        located: &LocatedBlock,
        start_in_block: u64,
        out: &mut [u8],
    ) -> ClientResult<()> {
        let mut refetch_token = 1;
        loop {
            // Locations may have been refreshed since the range was built.
            let block = self.get_block_at(located.start_offset, false).await?;
            let (node, block) = self.choose_datanode(&block).await?;

            let opened = if self.should_short_circuit(&node) {
                match self.open_local(&node, &block, start_in_block).await {
                    Ok(r) => Ok(r),
                    Err(ClientError::AccessDenied(msg)) => {
                        warn!("short circuit access failed: {msg}");
                        self.short_circuit = false;
                        self.open_remote(&node, &block, start_in_block).await
                    }
                    Err(e) => Err(e),
                }
            } else {
                self.open_remote(&node, &block, start_in_block).await
            };

            let result: ClientResult<()> = match opened {
                Ok(mut reader) => {
                    let r = read_full(reader.as_mut(), out).await;
                    reader.close().await;
                    match r {
                        Ok(n) if n == out.len() => Ok(()),
                        Ok(n) => Err(ClientError::Internal(format!(
                            "truncated read: expected {}, got {n}",
                            out.len()
                        ))),
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e @ ClientError::ChecksumMismatch { .. }) => {
                    warn!(block = %block.block, %node, "checksum error: {e}");
                    self.report_checksum_failure(&block.block, &node).await;
                    self.dead_nodes.insert(node);
                    return Err(e);
                }
                Err(e) if e.is_token_error() && refetch_token > 0 => {
                    refetch_token -= 1;
                    self.fetch_block_at(located.start_offset).await?;
                }
                Err(e) => {
                    warn!(%node, block = %block.block, "replica fetch failed: {e}");
                    self.dead_nodes.insert(node);
                }
            }
        }
    }

    /// Move the cursor. Seeks within the current block and a bounded forward
    /// distance skip on the open connection to reuse buffered socket data;
    /// anything else defers the reconnect to the next read.
    pub async fn seek(&mut self, target: u64) -> ClientResult<()> {
        if self.closed {
            return Err(ClientError::StreamClosed);
        }
        if target > self.file_length() {
            return Err(ClientError::Internal("cannot seek past end of file".into()));
        }

        if let Some(end) = self.block_end {
            if self.pos <= target && target <= end {
                let diff = target - self.pos;
                if diff <= self.ctx.config.forward_seek_limit {
                    if let Some(cur) = self.current.as_mut() {
                        match cur.reader.skip(diff).await {
                            Ok(skipped) => {
                                self.pos += skipped;
                                if self.pos == target {
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                debug!("skip during seek failed, reconnecting lazily: {e}");
                            }
                        }
                    }
                }
            }
        }
        self.pos = target;
        self.block_end = None;
        Ok(())
    }

    /// Idempotent close; the reader is unusable afterwards.
    pub async fn close(&mut self) -> ClientResult<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(mut cur) = self.current.take() {
            cur.reader.close().await;
        }
        self.closed = true;
        Ok(())
    }
}
