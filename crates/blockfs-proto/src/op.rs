/// Version of the data-transfer protocol. Sent first in every request; a
/// storage node refuses mismatched versions outright.
pub const DATA_TRANSFER_VERSION: u16 = 17;

/// Operation codes understood by storage nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    WriteBlock = 80,
    ReadBlock = 81,
    BlockChecksum = 85,
}

impl Opcode {
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            80 => Some(Opcode::WriteBlock),
            81 => Some(Opcode::ReadBlock),
            85 => Some(Opcode::BlockChecksum),
            _ => None,
        }
    }
}

/// Status codes carried in replies and pipeline acknowledgements.
///
/// `ChecksumOk` is only ever sent client-to-node, as the best-effort signal
/// that a whole block was read with every chunk checksum verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Success = 0,
    Error = 1,
    ErrorChecksum = 2,
    ErrorInvalid = 3,
    ErrorExists = 4,
    ErrorAccessToken = 5,
    ChecksumOk = 6,
}

impl Status {
    pub fn from_wire(val: u16) -> Option<Self> {
        match val {
            0 => Some(Status::Success),
            1 => Some(Status::Error),
            2 => Some(Status::ErrorChecksum),
            3 => Some(Status::ErrorInvalid),
            4 => Some(Status::ErrorExists),
            5 => Some(Status::ErrorAccessToken),
            6 => Some(Status::ChecksumOk),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}
