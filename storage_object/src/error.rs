//! Status vocabulary shared by the metadata service, the non-paged pipeline
//! and the state machines.

use strum_macros::Display;

/// Outcome the metadata service reports for a single metadata operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MetadataStatus {
    Ok,
    IoCorrectable,
    IoUncorrectable,
    IoRetryable,
    IoNotRetryable,
    Busy,
    Timeout,
    Aborted,
    Cancelled,
    Failure,
}

/// Status carried back to whoever issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PacketStatus {
    Ok,
    /// Retryable: the operation may succeed if reissued.
    Busy,
    /// Not retryable.
    Failed,
    Cancelled,
    GenericFailure,
}

impl PacketStatus {
    pub fn is_ok(self) -> bool {
        self == PacketStatus::Ok
    }
}

/// Map a metadata operation status onto the packet status seen by the caller.
pub fn translate_metadata_status(status: MetadataStatus) -> PacketStatus {
    match status {
        // correctable still returned good data
        MetadataStatus::Ok | MetadataStatus::IoCorrectable => PacketStatus::Ok,
        MetadataStatus::Busy
        | MetadataStatus::Timeout
        | MetadataStatus::Aborted
        | MetadataStatus::IoRetryable => PacketStatus::Busy,
        MetadataStatus::IoNotRetryable
        | MetadataStatus::Failure
        | MetadataStatus::IoUncorrectable => PacketStatus::Failed,
        MetadataStatus::Cancelled => PacketStatus::Cancelled,
    }
}

/// Completion of one asynchronous metadata-service request: the transport
/// status of the request itself plus the status of the metadata operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub packet: PacketStatus,
    pub metadata: MetadataStatus,
}

impl Completion {
    pub const OK: Completion = Completion {
        packet: PacketStatus::Ok,
        metadata: MetadataStatus::Ok,
    };

    /// The request was delivered but the metadata operation failed.
    pub fn metadata_failure(metadata: MetadataStatus) -> Self {
        Completion {
            packet: PacketStatus::Ok,
            metadata,
        }
    }

    /// The request itself failed before the metadata operation ran.
    pub fn packet_failure(packet: PacketStatus) -> Self {
        Completion {
            packet,
            metadata: MetadataStatus::Failure,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.packet.is_ok() && self.metadata == MetadataStatus::Ok
    }

    /// Single status for the caller: a failed packet wins, otherwise the
    /// translated metadata status.
    pub fn status(&self) -> PacketStatus {
        if !self.packet.is_ok() {
            self.packet
        } else {
            translate_metadata_status(self.metadata)
        }
    }
}

/// Failures of the non-paged metadata pipeline.
#[derive(Debug, thiserror::Error)]
pub enum NpError {
    #[error("record data of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("range {offset}..{end} is outside the {record_size} byte non-paged record")]
    OutOfRange {
        offset: usize,
        end: usize,
        record_size: usize,
    },
    #[error("non-paged record of {len} bytes is shorter than its header")]
    RecordTooShort { len: usize },
    #[error("non-paged metadata operation failed: {0}")]
    Metadata(PacketStatus),
    #[error("non-paged distributed lock not acquired: {0}")]
    LockNotAcquired(PacketStatus),
}

impl NpError {
    /// Status surfaced on the caller's packet.
    pub fn packet_status(&self) -> PacketStatus {
        match self {
            NpError::Metadata(status) => *status,
            // lock failures are reported as generic failure whatever the cause
            NpError::LockNotAcquired(_) => PacketStatus::GenericFailure,
            NpError::PayloadTooLarge { .. }
            | NpError::OutOfRange { .. }
            | NpError::RecordTooShort { .. } => PacketStatus::GenericFailure,
        }
    }
}
