//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use blockfs_proto::PACKET_HEADER_LEN;
use blockfs_types::ChecksumParams;

/// Tunables for one client session.
///
/// The defaults are the documented production values; tests shrink the
/// delays and queue caps to keep scenarios fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Default size of a newly allocated block.
    pub block_size: u64,

    /// Default replication factor for created files.
    pub replication: u32,

    /// Width of one checksum chunk.
    pub bytes_per_checksum: u32,

    /// Target size of one write packet, header included.
    pub write_packet_size: usize,

    /// Cap on pending + in-flight packets; writers block above it.
    pub max_pending_packets: usize,

    /// Socket read timeout. Half of this is the idle interval after which
    /// the streamer sends a heartbeat packet.
    #[serde(with = "duration_secs")]
    pub socket_timeout: Duration,

    /// Timeout for establishing a storage-node connection.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// How many blocks' worth of locations to prefetch on open.
    pub prefetch_blocks: u64,

    /// Location-refetch rounds tolerated while acquiring a block for read.
    pub max_block_acquire_failures: u32,

    /// Read-buffer level retries in `FileReader::read`.
    pub read_retries: u32,

    /// Longest forward seek serviced by skipping on the open connection.
    pub forward_seek_limit: u64,

    /// Attempts to learn the last block's locations when opening a file
    /// under construction whose replicas have not reported in yet.
    pub open_info_retries: u32,

    /// Delay between those attempts.
    #[serde(with = "duration_secs")]
    pub open_info_retry_delay: Duration,

    /// Sleep before refetching locations after exhausting a replica round.
    #[serde(with = "duration_secs")]
    pub refetch_locations_delay: Duration,

    /// Attempts to set up a fresh block pipeline before giving up.
    pub block_write_retries: u32,

    /// Retries of block allocation when the metadata service reports the
    /// previous block is not yet replicated.
    pub locate_block_retries: u32,

    /// Initial sleep for those retries; doubles each attempt.
    #[serde(with = "duration_secs")]
    pub locate_block_retry_delay: Duration,

    /// Attempts to run block recovery through a primary node.
    pub recovery_max_retries: u32,

    /// Sleep between recovery attempts.
    #[serde(with = "duration_secs")]
    pub recovery_retry_delay: Duration,

    /// Sleep between `complete` attempts while closing a file.
    #[serde(with = "duration_secs")]
    pub complete_retry_delay: Duration,

    /// Overall budget for client-wide operations such as completing a file.
    #[serde(with = "duration_secs")]
    pub client_timeout: Duration,

    /// Read a local replica directly from disk when possible.
    pub short_circuit_reads: bool,

    /// Verify chunk checksums on the read path.
    pub verify_checksums: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024 * 1024,
            replication: 3,
            bytes_per_checksum: 512,
            write_packet_size: 64 * 1024,
            max_pending_packets: 80,
            socket_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(60),
            prefetch_blocks: 10,
            max_block_acquire_failures: 3,
            read_retries: 2,
            forward_seek_limit: 128 * 1024,
            open_info_retries: 3,
            open_info_retry_delay: Duration::from_secs(4),
            refetch_locations_delay: Duration::from_secs(3),
            block_write_retries: 3,
            locate_block_retries: 5,
            locate_block_retry_delay: Duration::from_millis(400),
            recovery_max_retries: 5,
            recovery_retry_delay: Duration::from_secs(1),
            complete_retry_delay: Duration::from_millis(400),
            client_timeout: Duration::from_secs(60),
            short_circuit_reads: false,
            verify_checksums: true,
        }
    }
}

impl ClientConfig {
    /// Checksum parameters implied by this configuration.
    pub fn checksum_params(&self) -> ChecksumParams {
        ChecksumParams::crc32c(self.bytes_per_checksum)
    }

    /// Prefetch window in bytes for location fetches.
    pub fn prefetch_size(&self) -> u64 {
        self.prefetch_blocks * self.block_size
    }

    /// How many chunks go in a packet aimed at `target_size` bytes.
    ///
    /// Rounds up, so a packet may slightly overshoot the target; at least
    /// one chunk per packet keeps progress possible with any setting.
    pub fn chunks_per_packet(&self, target_size: usize) -> usize {
        let params = self.checksum_params();
        let chunk = self.bytes_per_checksum as usize + params.checksum_size();
        let body = target_size.saturating_sub(PACKET_HEADER_LEN);
        body.div_ceil(chunk).max(1)
    }

    /// Idle interval after which the streamer emits a heartbeat.
    pub fn heartbeat_interval(&self) -> Duration {
        self.socket_timeout / 2
    }
}

/// Serde helper that serialises `Duration` as floating-point seconds.
mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
