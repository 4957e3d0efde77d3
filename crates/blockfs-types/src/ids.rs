strong_type!(BlockId, u64);
strong_type!(GenerationStamp, u64);
strong_type!(SequenceNumber, i64);

impl SequenceNumber {
    /// Reserved sequence number carried by heartbeat packets. Heartbeats
    /// keep an idle pipeline connection alive and are never queued for
    /// acknowledgement.
    pub const HEARTBEAT: SequenceNumber = SequenceNumber(-1);

    /// Returns `true` if this is the reserved heartbeat sequence number.
    pub fn is_heartbeat(&self) -> bool {
        *self == Self::HEARTBEAT
    }

    /// The sequence number immediately following this one.
    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0 + 1)
    }
}
