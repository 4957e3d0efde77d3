//! Scripted fakes for the data-path tests: an in-memory metadata service,
//! a per-node admin mock, and duplex-stream storage nodes that speak the
//! real wire protocol.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};

use blockfs_net::{io as net_io, Connector, IoStream, NetError};
use blockfs_proto::{op::Status, PacketHeader, PipelineAck, WriteSetupAck, PACKET_HEADER_LEN};
use blockfs_types::{
    AccessToken, Block, BlockId, ChecksumParams, GenerationStamp, LocatedBlock, LocatedBlocks,
    NodeAddress, SequenceNumber,
};

use crate::client::{Client, SessionCtx};
use crate::error::{ClientError, ClientResult};
use crate::namenode::{DatanodeAdmin, FileStatus, LocalBlockPaths, Namenode};

/// Call at the top of a test to see client traces while chasing a failure.
#[allow(dead_code)]
pub(crate) fn init_test_logging() {
    let config = blockfs_logging::LogConfig {
        level: "debug".into(),
        ..Default::default()
    };
    let _guard = blockfs_logging::init_logging(&config);
}

/// Shrunk sizes and delays so scenarios run in milliseconds.
pub(crate) fn small_config() -> crate::ClientConfig {
    crate::ClientConfig {
        block_size: 64,
        replication: 3,
        bytes_per_checksum: 8,
        // A few 8-byte chunks per packet after the 25-byte header.
        write_packet_size: 52,
        max_pending_packets: 16,
        socket_timeout: Duration::from_secs(20),
        connect_timeout: Duration::from_secs(5),
        prefetch_blocks: 10,
        max_block_acquire_failures: 3,
        read_retries: 2,
        forward_seek_limit: 128 * 1024,
        open_info_retries: 3,
        open_info_retry_delay: Duration::from_millis(20),
        refetch_locations_delay: Duration::from_millis(10),
        block_write_retries: 3,
        locate_block_retries: 5,
        locate_block_retry_delay: Duration::from_millis(10),
        recovery_max_retries: 5,
        recovery_retry_delay: Duration::from_millis(20),
        complete_retry_delay: Duration::from_millis(10),
        client_timeout: Duration::from_secs(10),
        short_circuit_reads: false,
        verify_checksums: true,
    }
}

/// Write a replica's data and checksum-metadata files into `dir`.
pub(crate) fn write_local_block_files(
    dir: &Path,
    data: &[u8],
    params: &ChecksumParams,
) -> LocalBlockPaths {
    let data_path = dir.join("blk.data");
    let meta_path = dir.join("blk.meta");
    std::fs::write(&data_path, data).unwrap();

    let mut meta = Vec::new();
    meta.extend_from_slice(&crate::local_reader::LOCAL_META_VERSION.to_be_bytes());
    blockfs_proto::wire::put_checksum_header(&mut meta, params);
    for chunk in data.chunks(params.bytes_per_checksum as usize) {
        meta.extend_from_slice(&params.compute(chunk).to_be_bytes());
    }
    std::fs::write(&meta_path, meta).unwrap();
    LocalBlockPaths {
        data_path,
        meta_path,
    }
}

// ---------------------------------------------------------------------------
// Read-serving fake node
// ---------------------------------------------------------------------------

pub(crate) struct ReadServeOptions {
    pub corrupt_at: Option<usize>,
    pub status: Status,
    pub checksum_ok_probe: Option<Arc<AtomicBool>>,
    pub chunks_per_packet: usize,
}

impl Default for ReadServeOptions {
    fn default() -> Self {
        Self {
            corrupt_at: None,
            status: Status::Success,
            checksum_ok_probe: None,
            chunks_per_packet: 2,
        }
    }
}

impl ReadServeOptions {
    pub fn with_checksum_ok_probe() -> (Arc<AtomicBool>, Self) {
        let probe = Arc::new(AtomicBool::new(false));
        (
            Arc::clone(&probe),
            Self {
                checksum_ok_probe: Some(Arc::clone(&probe)),
                ..Default::default()
            },
        )
    }
}

/// Answer one read-block request on `stream`, serving `data` as the block.
pub(crate) async fn serve_read_block(
    mut stream: DuplexStream,
    data: Vec<u8>,
    params: ChecksumParams,
    opts: ReadServeOptions,
) {
    // Parse the request; the fields we do not script against are ignored.
    let Ok(_version) = net_io::read_u16(&mut stream).await else {
        return;
    };
    let _opcode = net_io::read_u8(&mut stream).await.unwrap();
    let _id = net_io::read_u64(&mut stream).await.unwrap();
    let _gen = net_io::read_u64(&mut stream).await.unwrap();
    let start = net_io::read_u64(&mut stream).await.unwrap();
    let len = net_io::read_u64(&mut stream).await.unwrap();
    let _client = net_io::read_string(&mut stream).await.unwrap();
    let _token = net_io::read_byte_string(&mut stream).await.unwrap();

    serve_read_data(&mut stream, &data, params, start, len, &opts).await;
}

/// Stream `[start, start + len)` of `data` as checksummed packets.
pub(crate) async fn serve_read_data(
    stream: &mut (impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin),
    data: &[u8],
    params: ChecksumParams,
    start: u64,
    len: u64,
    opts: &ReadServeOptions,
) {
    if opts.status != Status::Success {
        let _ = stream.write_all(&(opts.status as u16).to_be_bytes()).await;
        return;
    }

    let bpc = params.bytes_per_checksum as u64;
    let aligned = start - start % bpc;
    let end = (start + len).min(data.len() as u64);

    // Success preamble: status, checksum header, first chunk offset.
    let mut preamble = Vec::new();
    preamble.extend_from_slice(&(Status::Success as u16).to_be_bytes());
    blockfs_proto::wire::put_checksum_header(&mut preamble, &params);
    preamble.extend_from_slice(&aligned.to_be_bytes());
    if stream.write_all(&preamble).await.is_err() {
        return;
    }

    let packet_bytes = bpc as usize * opts.chunks_per_packet;
    let mut offset = aligned;
    let mut seqno = 0i64;
    loop {
        let remaining = end.saturating_sub(offset) as usize;
        let take = remaining.min(packet_bytes);
        let payload = &data[offset as usize..offset as usize + take];
        let last = take == remaining;

        // Checksums over the true data; corruption applied afterwards.
        let mut checksums = Vec::new();
        for chunk in payload.chunks(bpc as usize) {
            checksums.extend_from_slice(&params.compute(chunk).to_be_bytes());
        }
        let mut wire_payload = payload.to_vec();
        if let Some(corrupt) = opts.corrupt_at {
            let corrupt = corrupt as u64;
            if corrupt >= offset && corrupt < offset + take as u64 {
                wire_payload[(corrupt - offset) as usize] ^= 0x01;
            }
        }

        let header = PacketHeader {
            packet_len: 4 + checksums.len() as u32 + wire_payload.len() as u32,
            offset_in_block: offset,
            seqno: SequenceNumber(seqno),
            last_in_block: last,
            data_len: wire_payload.len() as u32,
        };
        let mut frame = Vec::with_capacity(PACKET_HEADER_LEN + checksums.len() + wire_payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&checksums);
        frame.extend_from_slice(&wire_payload);
        if stream.write_all(&frame).await.is_err() {
            return;
        }

        offset += take as u64;
        seqno += 1;
        if last {
            break;
        }
    }

    // Best-effort trailing checksum-ok status from the client.
    if let Some(probe) = &opts.checksum_ok_probe {
        if let Ok(raw) = net_io::read_u16(stream).await {
            if raw == Status::ChecksumOk as u16 {
                probe.store(true, Ordering::SeqCst);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster-wide shared scripting state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) enum NodeBehavior {
    Normal,
    /// Refuse new connections outright.
    Refuse,
    /// Serve reads with one data byte flipped at this block offset.
    CorruptAt(usize),
}

struct FailPlan {
    node: NodeAddress,
    replica_index: usize,
    after_acks: usize,
}

pub(crate) struct ClusterShared {
    config: crate::ClientConfig,
    /// Block contents served to readers, keyed by block id.
    read_blocks: Mutex<HashMap<u64, Vec<u8>>>,
    /// Bytes received from writers, keyed by block id, offset-addressed.
    write_blocks: Mutex<HashMap<u64, Vec<u8>>>,
    /// Arrival order of data packets: (block id, seqno).
    packet_log: Mutex<Vec<(u64, i64)>>,
    behaviors: DashMap<NodeAddress, NodeBehavior>,
    connections: DashMap<NodeAddress, usize>,
    accepted_token: Mutex<Vec<u8>>,
    hold_acks: AtomicBool,
    skip_ack_once: AtomicBool,
    fail_plan: Mutex<Option<FailPlan>>,
    heartbeats: AtomicUsize,
}

impl ClusterShared {
    fn behavior(&self, node: &NodeAddress) -> NodeBehavior {
        self.behaviors
            .get(node)
            .map(|b| b.clone())
            .unwrap_or(NodeBehavior::Normal)
    }

    fn token_ok(&self, token: &AccessToken) -> bool {
        token.as_bytes() == self.accepted_token.lock().as_slice()
    }
}

// ---------------------------------------------------------------------------
// Fake connector: duplex pipes to scripted node tasks
// ---------------------------------------------------------------------------

struct FakeConnector {
    shared: Arc<ClusterShared>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, addr: &NodeAddress) -> Result<Box<dyn IoStream>, NetError> {
        *self.shared.connections.entry(addr.clone()).or_insert(0) += 1;
        match self.shared.behavior(addr) {
            NodeBehavior::Refuse => Err(NetError::ConnectFailed {
                addr: addr.to_string(),
                reason: "connection refused".into(),
            }),
            _ => {
                let (client_end, server_end) = tokio::io::duplex(1 << 20);
                let shared = Arc::clone(&self.shared);
                let addr = addr.clone();
                tokio::spawn(serve_node(shared, addr, server_end));
                Ok(Box::new(client_end))
            }
        }
    }
}

/// One scripted storage node connection: dispatch on the request opcode.
async fn serve_node(shared: Arc<ClusterShared>, addr: NodeAddress, mut stream: DuplexStream) {
    let Ok(_version) = net_io::read_u16(&mut stream).await else {
        return;
    };
    let Ok(opcode) = net_io::read_u8(&mut stream).await else {
        return;
    };
    match opcode {
        81 => serve_read(shared, addr, stream).await,
        80 => serve_write(shared, addr, stream).await,
        85 => serve_block_checksum(shared, stream).await,
        _ => {}
    }
}

async fn serve_read(shared: Arc<ClusterShared>, addr: NodeAddress, mut stream: DuplexStream) {
    let id = net_io::read_u64(&mut stream).await.unwrap();
    let _gen = net_io::read_u64(&mut stream).await.unwrap();
    let start = net_io::read_u64(&mut stream).await.unwrap();
    let len = net_io::read_u64(&mut stream).await.unwrap();
    let _client = net_io::read_string(&mut stream).await.unwrap();
    let token = AccessToken(net_io::read_byte_string(&mut stream).await.unwrap());

    if !shared.token_ok(&token) {
        let _ = stream
            .write_all(&(Status::ErrorAccessToken as u16).to_be_bytes())
            .await;
        return;
    }
    let Some(data) = shared.read_blocks.lock().get(&id).cloned() else {
        let _ = stream.write_all(&(Status::Error as u16).to_be_bytes()).await;
        return;
    };
    let opts = ReadServeOptions {
        corrupt_at: match shared.behavior(&addr) {
            NodeBehavior::CorruptAt(i) => Some(i),
            _ => None,
        },
        ..Default::default()
    };
    let params = ChecksumParams::crc32c(shared.config.bytes_per_checksum);
    serve_read_data(&mut stream, &data, params, start, len, &opts).await;
}

async fn serve_write(shared: Arc<ClusterShared>, addr: NodeAddress, mut stream: DuplexStream) {
    let id = net_io::read_u64(&mut stream).await.unwrap();
    let _gen = net_io::read_u64(&mut stream).await.unwrap();
    let pipeline_size = net_io::read_u32(&mut stream).await.unwrap() as usize;
    let _recovery = net_io::read_u8(&mut stream).await.unwrap();
    let _client = net_io::read_string(&mut stream).await.unwrap();
    let downstream = net_io::read_u32(&mut stream).await.unwrap();
    for _ in 0..downstream {
        let _ = net_io::read_string(&mut stream).await.unwrap();
    }
    let token = AccessToken(net_io::read_byte_string(&mut stream).await.unwrap());
    let params = {
        let raw = net_io::read_exact_vec(&mut stream, blockfs_proto::wire::CHECKSUM_HEADER_LEN)
            .await
            .unwrap();
        let mut slice = raw.as_slice();
        blockfs_proto::wire::get_checksum_header(&mut slice).unwrap()
    };

    if !shared.token_ok(&token) {
        let ack = WriteSetupAck {
            status: Status::ErrorAccessToken,
            first_bad_node: String::new(),
        };
        let _ = stream.write_all(&ack.encode()).await;
        return;
    }
    if stream.write_all(&WriteSetupAck::success().encode()).await.is_err() {
        return;
    }

    let mut acks_sent = 0usize;
    loop {
        // Next packet length, or the end-of-block marker.
        let Ok(packet_len) = net_io::read_u32(&mut stream).await else {
            return;
        };
        if packet_len == 0 {
            return;
        }
        let Ok(rest) = net_io::read_exact_vec(&mut stream, PACKET_HEADER_LEN - 4).await else {
            return;
        };
        let mut raw = [0u8; PACKET_HEADER_LEN];
        raw[0..4].copy_from_slice(&packet_len.to_be_bytes());
        raw[4..].copy_from_slice(&rest);
        let header = PacketHeader::decode(&raw);

        let Ok(_checksums) =
            net_io::read_exact_vec(&mut stream, header.checksums_len(&params)).await
        else {
            return;
        };
        let Ok(payload) = net_io::read_exact_vec(&mut stream, header.data_len as usize).await
        else {
            return;
        };

        if header.seqno.is_heartbeat() {
            shared.heartbeats.fetch_add(1, Ordering::SeqCst);
            let ack = PipelineAck::success(SequenceNumber::HEARTBEAT, pipeline_size);
            if stream.write_all(&ack.encode()).await.is_err() {
                return;
            }
            continue;
        }

        // Offset-addressed application; replays of the same offsets are
        // harmless by construction.
        {
            let mut blocks = shared.write_blocks.lock();
            let buf = blocks.entry(id).or_default();
            let end = header.offset_in_block as usize + payload.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[header.offset_in_block as usize..end].copy_from_slice(&payload);
        }
        shared.packet_log.lock().push((id, header.seqno.0));

        // Scripted mid-block replica failure.
        let fire = {
            let mut plan = shared.fail_plan.lock();
            match plan.as_ref() {
                Some(p) if p.node == addr && acks_sent >= p.after_acks => {
                    let index = p.replica_index;
                    *plan = None;
                    Some(index)
                }
                _ => None,
            }
        };
        if let Some(bad_index) = fire {
            let mut replies = vec![Status::Success; pipeline_size];
            replies[bad_index] = Status::Error;
            let ack = PipelineAck::new(header.seqno, replies);
            let _ = stream.write_all(&ack.encode()).await;
            return;
        }

        if shared.skip_ack_once.swap(false, Ordering::SeqCst) {
            continue;
        }
        while shared.hold_acks.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let ack = PipelineAck::success(header.seqno, pipeline_size);
        if stream.write_all(&ack.encode()).await.is_err() {
            return;
        }
        acks_sent += 1;
    }
}

async fn serve_block_checksum(shared: Arc<ClusterShared>, mut stream: DuplexStream) {
    let id = net_io::read_u64(&mut stream).await.unwrap();
    let _gen = net_io::read_u64(&mut stream).await.unwrap();
    let token = AccessToken(net_io::read_byte_string(&mut stream).await.unwrap());

    if !shared.token_ok(&token) {
        let _ = stream
            .write_all(&(Status::ErrorAccessToken as u16).to_be_bytes())
            .await;
        return;
    }
    let Some(data) = shared.read_blocks.lock().get(&id).cloned() else {
        let _ = stream.write_all(&(Status::Error as u16).to_be_bytes()).await;
        return;
    };

    let bpc = shared.config.bytes_per_checksum;
    let mut crcs = Vec::new();
    for chunk in data.chunks(bpc as usize) {
        crcs.extend_from_slice(&crc32c::crc32c(chunk).to_be_bytes());
    }
    let md5 = md5::compute(&crcs);

    let mut reply = Vec::new();
    reply.extend_from_slice(&(Status::Success as u16).to_be_bytes());
    reply.extend_from_slice(&bpc.to_be_bytes());
    reply.extend_from_slice(&(shared.config.block_size / bpc as u64).to_be_bytes());
    reply.extend_from_slice(&md5.0);
    let _ = stream.write_all(&reply).await;
}

// ---------------------------------------------------------------------------
// Mock metadata service
// ---------------------------------------------------------------------------

struct NnFile {
    blocks: Vec<LocatedBlock>,
    file_length: u64,
    under_construction: bool,
    replication: u32,
}

struct NnState {
    files: HashMap<String, NnFile>,
    dirs: HashSet<String>,
    write_pipeline: Vec<NodeAddress>,
    issued_token: Vec<u8>,
    stale_token: Option<(Vec<u8>, u32)>,
    next_block_id: u64,
    fail_add_block: u32,
    completed: HashSet<String>,
}

pub(crate) struct MockNamenode {
    shared: Arc<ClusterShared>,
    state: Mutex<NnState>,
    location_fetches: AtomicUsize,
    lease_renewals: AtomicUsize,
    fsync_counts: Mutex<HashMap<String, usize>>,
    complete_calls: Mutex<HashMap<String, usize>>,
    bad_blocks: Mutex<Vec<LocatedBlock>>,
}

impl MockNamenode {
    fn new(shared: Arc<ClusterShared>) -> Self {
        Self {
            shared,
            state: Mutex::new(NnState {
                files: HashMap::new(),
                dirs: HashSet::new(),
                write_pipeline: Vec::new(),
                issued_token: b"tok0".to_vec(),
                stale_token: None,
                next_block_id: 1000,
                fail_add_block: 0,
                completed: HashSet::new(),
            }),
            location_fetches: AtomicUsize::new(0),
            lease_renewals: AtomicUsize::new(0),
            fsync_counts: Mutex::new(HashMap::new()),
            complete_calls: Mutex::new(HashMap::new()),
            bad_blocks: Mutex::new(Vec::new()),
        }
    }

    fn next_token(state: &mut NnState) -> AccessToken {
        if let Some((stale, remaining)) = state.stale_token.take() {
            if remaining > 0 {
                let token = AccessToken(stale.clone());
                if remaining > 1 {
                    state.stale_token = Some((stale, remaining - 1));
                }
                return token;
            }
        }
        AccessToken(state.issued_token.clone())
    }

    pub fn location_fetches(&self) -> usize {
        self.location_fetches.load(Ordering::SeqCst)
    }

    pub fn lease_renewals(&self) -> usize {
        self.lease_renewals.load(Ordering::SeqCst)
    }

    pub fn bad_block_reports(&self) -> Vec<LocatedBlock> {
        self.bad_blocks.lock().clone()
    }

    pub fn fsync_count(&self, path: &str) -> usize {
        self.fsync_counts.lock().get(path).copied().unwrap_or(0)
    }

    pub fn completed(&self, path: &str) -> bool {
        self.state.lock().completed.contains(path)
    }

    pub fn complete_calls(&self, path: &str) -> usize {
        self.complete_calls.lock().get(path).copied().unwrap_or(0)
    }

    pub fn fail_next_add_block_not_replicated(&self, n: u32) {
        self.state.lock().fail_add_block = n;
    }
}

#[async_trait]
impl Namenode for MockNamenode {
    async fn get_block_locations(
        &self,
        path: &str,
        _offset: u64,
        _length: u64,
    ) -> ClientResult<LocatedBlocks> {
        self.location_fetches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let token = Self::next_token(&mut state);
        let file = state
            .files
            .get(path)
            .ok_or_else(|| ClientError::NotFound(path.to_string()))?;
        let mut blocks = file.blocks.clone();
        for b in &mut blocks {
            b.token = token.clone();
        }
        Ok(LocatedBlocks::new(
            file.file_length,
            file.under_construction,
            blocks,
        ))
    }

    async fn create(
        &self,
        path: &str,
        _client_name: &str,
        overwrite: bool,
        replication: u32,
        _block_size: u64,
    ) -> ClientResult<()> {
        let mut state = self.state.lock();
        if state.files.contains_key(path) && !overwrite {
            return Err(ClientError::FileAlreadyExists(path.to_string()));
        }
        state.completed.remove(path);
        state.files.insert(
            path.to_string(),
            NnFile {
                blocks: Vec::new(),
                file_length: 0,
                under_construction: true,
                replication,
            },
        );
        Ok(())
    }

    async fn append(&self, path: &str, _client_name: &str) -> ClientResult<Option<LocatedBlock>> {
        let block_size = self.shared.config.block_size;
        let mut state = self.state.lock();
        let token = Self::next_token(&mut state);
        state.completed.remove(path);
        let pipeline = state.write_pipeline.clone();
        let file = state
            .files
            .get_mut(path)
            .ok_or_else(|| ClientError::NotFound(path.to_string()))?;
        file.under_construction = true;
        match file.blocks.last() {
            Some(last) if last.block.len > 0 && last.block.len < block_size => {
                let mut lb = last.clone();
                lb.token = token;
                if lb.nodes.is_empty() {
                    lb.nodes = pipeline;
                }
                Ok(Some(lb))
            }
            _ => Ok(None),
        }
    }

    async fn add_block(
        &self,
        path: &str,
        _client_name: &str,
        excluded: &[NodeAddress],
    ) -> ClientResult<LocatedBlock> {
        let mut state = self.state.lock();
        let written = self.shared.write_blocks.lock();
        if state.fail_add_block > 0 {
            state.fail_add_block -= 1;
            return Err(ClientError::NotYetReplicated(path.to_string()));
        }
        let nodes: Vec<NodeAddress> = state
            .write_pipeline
            .iter()
            .filter(|n| !excluded.contains(n))
            .cloned()
            .collect();
        if nodes.is_empty() {
            return Err(ClientError::Internal(
                "no usable nodes for allocation".into(),
            ));
        }
        let id = state.next_block_id;
        state.next_block_id += 1;
        let token = Self::next_token(&mut state);
        let file = state
            .files
            .get_mut(path)
            .ok_or_else(|| ClientError::NotFound(path.to_string()))?;
        let start_offset: u64 = file
            .blocks
            .iter()
            .map(|b| written.get(&b.block.id.0).map(|d| d.len() as u64).unwrap_or(0))
            .sum();
        let lb = LocatedBlock::new(
            Block::new(BlockId(id), GenerationStamp(1), 0),
            start_offset,
            nodes,
            token,
        );
        file.blocks.push(lb.clone());
        Ok(lb)
    }

    async fn abandon_block(
        &self,
        block: &Block,
        path: &str,
        _client_name: &str,
    ) -> ClientResult<()> {
        let mut state = self.state.lock();
        if let Some(file) = state.files.get_mut(path) {
            file.blocks.retain(|b| b.block.id != block.id);
        }
        Ok(())
    }

    async fn complete(&self, path: &str, _client_name: &str) -> ClientResult<bool> {
        *self
            .complete_calls
            .lock()
            .entry(path.to_string())
            .or_insert(0) += 1;
        let mut state = self.state.lock();
        state.completed.insert(path.to_string());
        if let Some(file) = state.files.get_mut(path) {
            file.under_construction = false;
        }
        Ok(true)
    }

    async fn fsync(&self, path: &str, _client_name: &str) -> ClientResult<()> {
        *self
            .fsync_counts
            .lock()
            .entry(path.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn report_bad_blocks(&self, blocks: &[LocatedBlock]) -> ClientResult<()> {
        self.bad_blocks.lock().extend_from_slice(blocks);
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> ClientResult<bool> {
        let mut state = self.state.lock();
        match state.files.remove(src) {
            Some(file) => {
                state.files.insert(dst.to_string(), file);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, path: &str, _recursive: bool) -> ClientResult<bool> {
        let mut state = self.state.lock();
        Ok(state.files.remove(path).is_some() || state.dirs.remove(path))
    }

    async fn mkdirs(&self, path: &str) -> ClientResult<bool> {
        self.state.lock().dirs.insert(path.to_string());
        Ok(true)
    }

    async fn set_replication(&self, path: &str, replication: u32) -> ClientResult<bool> {
        let mut state = self.state.lock();
        match state.files.get_mut(path) {
            Some(file) => {
                file.replication = replication;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn file_info(&self, path: &str) -> ClientResult<Option<FileStatus>> {
        let state = self.state.lock();
        Ok(state.files.get(path).map(|f| FileStatus {
            path: path.to_string(),
            length: f.file_length,
            block_size: self.shared.config.block_size,
            replication: f.replication,
            is_dir: false,
        }))
    }

    async fn renew_lease(&self, _client_name: &str) -> ClientResult<()> {
        self.lease_renewals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock per-node admin RPC
// ---------------------------------------------------------------------------

pub(crate) struct MockDatanodeAdmin {
    shared: Arc<ClusterShared>,
    recoveries: Mutex<Vec<(NodeAddress, Vec<NodeAddress>)>>,
    recovery_append_flags: Mutex<Vec<bool>>,
    deny_local: AtomicBool,
    local_paths: DashMap<u64, LocalBlockPaths>,
}

impl MockDatanodeAdmin {
    fn new(shared: Arc<ClusterShared>) -> Self {
        Self {
            shared,
            recoveries: Mutex::new(Vec::new()),
            recovery_append_flags: Mutex::new(Vec::new()),
            deny_local: AtomicBool::new(false),
            local_paths: DashMap::new(),
        }
    }

    pub fn recoveries(&self) -> Vec<(NodeAddress, Vec<NodeAddress>)> {
        self.recoveries.lock().clone()
    }

    pub fn recoveries_for_append(&self) -> Vec<bool> {
        self.recovery_append_flags.lock().clone()
    }

    pub fn deny_local_paths(&self) {
        self.deny_local.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatanodeAdmin for MockDatanodeAdmin {
    async fn recover_block(
        &self,
        primary: &NodeAddress,
        block: &Block,
        is_append: bool,
        pipeline: &[NodeAddress],
    ) -> ClientResult<LocatedBlock> {
        self.recoveries
            .lock()
            .push((primary.clone(), pipeline.to_vec()));
        self.recovery_append_flags.lock().push(is_append);

        // Agreed length: what the surviving replicas actually hold.
        let len = self
            .shared
            .write_blocks
            .lock()
            .get(&block.id.0)
            .map(|d| d.len() as u64)
            .unwrap_or(block.len);
        Ok(LocatedBlock::new(
            Block::new(block.id, GenerationStamp(block.generation.0 + 1), len),
            0,
            pipeline.to_vec(),
            AccessToken(self.shared.accepted_token.lock().clone()),
        ))
    }

    async fn get_block_info(&self, _node: &NodeAddress, block: &Block) -> ClientResult<Block> {
        let stores = [&self.shared.read_blocks, &self.shared.write_blocks];
        for store in stores {
            if let Some(data) = store.lock().get(&block.id.0) {
                return Ok(Block::new(block.id, block.generation, data.len() as u64));
            }
        }
        Err(ClientError::NotFound(format!("{}", block)))
    }

    async fn local_block_paths(
        &self,
        _node: &NodeAddress,
        block: &Block,
        _token: &AccessToken,
    ) -> ClientResult<LocalBlockPaths> {
        if self.deny_local.load(Ordering::SeqCst) {
            return Err(ClientError::AccessDenied(
                "short-circuit access not permitted".into(),
            ));
        }
        self.local_paths
            .get(&block.id.0)
            .map(|p| p.clone())
            .ok_or_else(|| ClientError::Io(format!("no local replica of {block}")))
    }
}

// ---------------------------------------------------------------------------
// TestCluster
// ---------------------------------------------------------------------------

/// A scripted cluster: mock metadata service, mock node admin, and fake
/// storage nodes behind an in-memory connector.
pub(crate) struct TestCluster {
    pub shared: Arc<ClusterShared>,
    pub namenode: Arc<MockNamenode>,
    pub datanodes: Arc<MockDatanodeAdmin>,
    client: Client,
}

impl TestCluster {
    pub fn new(config: crate::ClientConfig) -> Self {
        let shared = Arc::new(ClusterShared {
            config: config.clone(),
            read_blocks: Mutex::new(HashMap::new()),
            write_blocks: Mutex::new(HashMap::new()),
            packet_log: Mutex::new(Vec::new()),
            behaviors: DashMap::new(),
            connections: DashMap::new(),
            accepted_token: Mutex::new(b"tok0".to_vec()),
            hold_acks: AtomicBool::new(false),
            skip_ack_once: AtomicBool::new(false),
            fail_plan: Mutex::new(None),
            heartbeats: AtomicUsize::new(0),
        });
        let namenode = Arc::new(MockNamenode::new(Arc::clone(&shared)));
        let datanodes = Arc::new(MockDatanodeAdmin::new(Arc::clone(&shared)));
        let connector = Arc::new(FakeConnector {
            shared: Arc::clone(&shared),
        });
        let client = Client::new(
            Arc::clone(&namenode) as Arc<dyn Namenode>,
            Arc::clone(&datanodes) as Arc<dyn DatanodeAdmin>,
            connector,
            config,
        );
        Self {
            shared,
            namenode,
            datanodes,
            client,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn ctx(&self) -> Arc<SessionCtx> {
        self.client.ctx()
    }

    pub fn node(&self, i: u16) -> NodeAddress {
        NodeAddress::new(format!("node-{i}"), 9000 + i)
    }

    pub fn set_node_behavior(&self, node: NodeAddress, behavior: NodeBehavior) {
        self.shared.behaviors.insert(node, behavior);
    }

    pub fn connections_to(&self, node: &NodeAddress) -> usize {
        self.shared
            .connections
            .get(node)
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Register a finalized block of `path` with its served content.
    pub fn add_stored_block(
        &self,
        path: &str,
        start_offset: u64,
        data: Vec<u8>,
        nodes: Vec<NodeAddress>,
    ) {
        let len = data.len() as u64;
        self.add_stored_block_with_reported_len(path, start_offset, data, nodes, len, false);
    }

    /// Like `add_stored_block`, but the metadata service believes the block
    /// holds `reported_len` bytes (under-construction length correction).
    pub fn add_stored_block_with_reported_len(
        &self,
        path: &str,
        start_offset: u64,
        data: Vec<u8>,
        nodes: Vec<NodeAddress>,
        reported_len: u64,
        under_construction: bool,
    ) {
        let mut state = self.namenode.state.lock();
        let id = state.next_block_id;
        state.next_block_id += 1;
        self.shared.read_blocks.lock().insert(id, data);

        let replication = nodes.len().max(1) as u32;
        let file = state.files.entry(path.to_string()).or_insert(NnFile {
            blocks: Vec::new(),
            file_length: 0,
            under_construction,
            replication,
        });
        file.under_construction = under_construction;
        file.blocks.push(LocatedBlock::new(
            Block::new(BlockId(id), GenerationStamp(1), reported_len),
            start_offset,
            nodes,
            AccessToken(b"tok0".to_vec()),
        ));
        file.file_length = file.file_length.max(start_offset + reported_len);
    }

    /// Pipeline handed out by `add_block` for new blocks.
    pub fn set_write_pipeline(&self, nodes: Vec<NodeAddress>) {
        self.namenode.state.lock().write_pipeline = nodes;
    }

    /// Bytes received for `path`, concatenated in block order.
    pub fn written_bytes(&self, path: &str) -> Vec<u8> {
        let state = self.namenode.state.lock();
        let written = self.shared.write_blocks.lock();
        let mut out = Vec::new();
        if let Some(file) = state.files.get(path) {
            for b in &file.blocks {
                if let Some(data) = written.get(&b.block.id.0) {
                    out.extend_from_slice(data);
                }
            }
        }
        out
    }

    pub fn blocks_written(&self, path: &str) -> usize {
        let state = self.namenode.state.lock();
        let written = self.shared.write_blocks.lock();
        state
            .files
            .get(path)
            .map(|f| {
                f.blocks
                    .iter()
                    .filter(|b| written.get(&b.block.id.0).map(|d| !d.is_empty()).unwrap_or(false))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Data-packet sequence numbers received for `path`, in arrival order.
    pub fn packet_seqnos(&self, path: &str) -> Vec<i64> {
        let state = self.namenode.state.lock();
        let ids: HashSet<u64> = state
            .files
            .get(path)
            .map(|f| f.blocks.iter().map(|b| b.block.id.0).collect())
            .unwrap_or_default();
        self.shared
            .packet_log
            .lock()
            .iter()
            .filter(|(id, _)| ids.contains(id))
            .map(|(_, s)| *s)
            .collect()
    }

    /// Make the bytes written to `path` servable to readers.
    pub fn publish_written_file(&self, path: &str) {
        let mut state = self.namenode.state.lock();
        let written = self.shared.write_blocks.lock();
        let mut read_blocks = self.shared.read_blocks.lock();
        if let Some(file) = state.files.get_mut(path) {
            let mut offset = 0u64;
            for b in &mut file.blocks {
                let data = written.get(&b.block.id.0).cloned().unwrap_or_default();
                b.block.len = data.len() as u64;
                b.start_offset = offset;
                offset += data.len() as u64;
                read_blocks.insert(b.block.id.0, data);
            }
            file.file_length = offset;
            file.under_construction = false;
        }
    }

    /// Finalize a written file so a fresh writer can append to it.
    pub fn prepare_append(&self, path: &str) {
        self.publish_written_file(path);
    }

    pub fn heartbeats_received(&self) -> usize {
        self.shared.heartbeats.load(Ordering::SeqCst)
    }

    pub fn hold_acks(&self) {
        self.shared.hold_acks.store(true, Ordering::SeqCst);
    }

    pub fn release_acks(&self) {
        self.shared.hold_acks.store(false, Ordering::SeqCst);
    }

    pub fn skip_one_ack(&self) {
        self.shared.skip_ack_once.store(true, Ordering::SeqCst);
    }

    /// Have the connection to `node` report replica `replica_index` as
    /// failed once it has acknowledged `after_acks` packets.
    pub fn fail_replica_after(&self, node: NodeAddress, replica_index: usize, after_acks: usize) {
        *self.shared.fail_plan.lock() = Some(FailPlan {
            node,
            replica_index,
            after_acks,
        });
    }

    /// All currently cached tokens become invalid; the next location fetch
    /// still hands out the stale token, later fetches carry the fresh one.
    pub fn expire_tokens_once(&self) {
        *self.shared.accepted_token.lock() = b"tok1".to_vec();
        let mut state = self.namenode.state.lock();
        state.stale_token = Some((b"tok0".to_vec(), 1));
        state.issued_token = b"tok1".to_vec();
    }

    /// Write the on-disk files of the replica at (`path`, `start_offset`)
    /// and register them for short-circuit resolution.
    pub fn materialize_local_replica(&self, path: &str, start_offset: u64) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let (id, data) = {
            let state = self.namenode.state.lock();
            let file = state.files.get(path).expect("file registered");
            let blk = file
                .blocks
                .iter()
                .find(|b| b.start_offset == start_offset)
                .expect("block registered");
            let data = self
                .shared
                .read_blocks
                .lock()
                .get(&blk.block.id.0)
                .cloned()
                .expect("block data stored");
            (blk.block.id.0, data)
        };
        let params = ChecksumParams::crc32c(self.shared.config.bytes_per_checksum);
        let paths = write_local_block_files(dir.path(), &data, &params);
        self.datanodes.local_paths.insert(id, paths);
        dir
    }
}
