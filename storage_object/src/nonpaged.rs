//! Non-paged (NP) metadata: the small per-object record kept resident on both
//! SPs and persisted through the metadata service.
//!
//! Record layout, little endian:
//!
//! ```text
//! 0   version header size   u32
//! 4   object id             u32
//! 8   generation            u64
//! 16  nonpaged state        u32
//! 20  background op bitmask u32   (bit set = operation disabled)
//! 24  class data
//! ```
//!
//! Every mutation goes through [`MetadataService::nonpaged_operation`], which
//! mirrors it to the peer. Payloads are validated before anything is issued,
//! so a rejected request leaves the record untouched.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{error, info, instrument, warn};

use crate::ObjectId;
use crate::error::{Completion, MetadataStatus, NpError, PacketStatus};
use crate::metadata_memory::ClusteredFlags;
use crate::metadata_service::{MetadataService, NonPagedOp};
use crate::object::StorageObject;

pub const NONPAGED_HEADER_SIZE: usize = 24;
/// Largest payload a single update may carry.
pub const MAX_DATA_SIZE: usize = 256;

const VERSION_SIZE_OFFSET: usize = 0;
const OBJECT_ID_OFFSET: usize = 4;
const GENERATION_OFFSET: usize = 8;
const STATE_OFFSET: usize = 16;
const BITMASK_OFFSET: usize = 20;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::FromRepr,
)]
#[repr(u32)]
pub enum NonPagedState {
    Invalid = 0,
    Uninitialized = 1,
    Initialized = 2,
}

/// Background operations that can be disabled through the NP bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[repr(u32)]
pub enum BackgroundOperation {
    MetadataRebuild = 0x01,
    Rebuild = 0x02,
    ErrorVerify = 0x04,
    ReadWriteVerify = 0x08,
    ReadOnlyVerify = 0x10,
    IncompleteWriteVerify = 0x20,
    SystemVerify = 0x40,
    EncryptionRekey = 0x80,
}

impl BackgroundOperation {
    pub fn bit(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonPagedRecord {
    bytes: Vec<u8>,
}

impl NonPagedRecord {
    /// Zeroed record with `data_size` bytes of class data.
    pub fn new(data_size: usize) -> Self {
        NonPagedRecord {
            bytes: vec![0; NONPAGED_HEADER_SIZE + data_size],
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, NpError> {
        if bytes.len() < NONPAGED_HEADER_SIZE {
            return Err(NpError::RecordTooShort { len: bytes.len() });
        }
        Ok(NonPagedRecord { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn data_size(&self) -> usize {
        self.bytes.len() - NONPAGED_HEADER_SIZE
    }

    pub fn class_data(&self) -> &[u8] {
        &self.bytes[NONPAGED_HEADER_SIZE..]
    }

    pub fn version_size(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[VERSION_SIZE_OFFSET..])
    }

    pub fn object_id(&self) -> ObjectId {
        ObjectId(LittleEndian::read_u32(&self.bytes[OBJECT_ID_OFFSET..]))
    }

    pub fn generation(&self) -> u64 {
        LittleEndian::read_u64(&self.bytes[GENERATION_OFFSET..])
    }

    /// Unknown encodings read as `Invalid`.
    pub fn state(&self) -> NonPagedState {
        NonPagedState::from_repr(LittleEndian::read_u32(&self.bytes[STATE_OFFSET..]))
            .unwrap_or(NonPagedState::Invalid)
    }

    pub fn operation_bitmask(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[BITMASK_OFFSET..])
    }

    pub fn set_signature(&mut self, object_id: ObjectId, generation: u64) {
        LittleEndian::write_u32(&mut self.bytes[OBJECT_ID_OFFSET..], object_id.0);
        LittleEndian::write_u64(&mut self.bytes[GENERATION_OFFSET..], generation);
    }

    pub fn set_state(&mut self, state: NonPagedState) {
        LittleEndian::write_u32(&mut self.bytes[STATE_OFFSET..], state as u32);
    }

    pub fn zero(&mut self) {
        self.bytes.fill(0);
    }

    /// Change the amount of class data, keeping the existing prefix.
    pub fn resize(&mut self, data_size: usize) {
        self.bytes.resize(NONPAGED_HEADER_SIZE + data_size, 0);
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, NpError> {
        self.check_range(offset, size_of::<u64>())?;
        Ok(LittleEndian::read_u64(&self.bytes[offset..]))
    }

    pub fn check_range(&self, offset: usize, size: usize) -> Result<(), NpError> {
        let end = offset.checked_add(size).unwrap_or(usize::MAX);
        if offset >= self.bytes.len() || end > self.bytes.len() {
            return Err(NpError::OutOfRange {
                offset,
                end,
                record_size: self.bytes.len(),
            });
        }
        Ok(())
    }

    /// Apply `update` to the record. Nothing changes on error.
    pub fn apply(&mut self, update: &NpUpdate) -> Result<(), NpError> {
        self.check_range(update.offset, update.span())?;
        let len = update.data.len();
        for r in 0..update.repeat() {
            let base = update.offset + r * len;
            let dst = &mut self.bytes[base..base + len];
            for (d, s) in dst.iter_mut().zip(&update.data) {
                match update.kind {
                    UpdateKind::Write => *d = *s,
                    UpdateKind::SetBits => *d |= *s,
                    UpdateKind::ClearBits => *d &= !*s,
                }
            }
        }
        Ok(())
    }

    /// Apply a checkpoint update. Returns whether the checkpoint moved.
    pub fn apply_checkpoint(&mut self, update: &CheckpointUpdate) -> Result<bool, NpError> {
        let current = self.read_u64(update.offset)?;
        if update.second_offset != 0 {
            self.check_range(update.second_offset, size_of::<u64>())?;
        }
        let new = match update.kind {
            // only ever moves back
            CheckpointKind::Set => (update.checkpoint < current).then_some(update.checkpoint),
            CheckpointKind::Force => Some(update.checkpoint),
            CheckpointKind::Incr { repeat_count } => (current == update.checkpoint)
                .then(|| current.saturating_add(u64::from(repeat_count.max(1)))),
        };
        let Some(new) = new else {
            return Ok(false);
        };
        LittleEndian::write_u64(&mut self.bytes[update.offset..], new);
        if update.second_offset != 0 {
            LittleEndian::write_u64(&mut self.bytes[update.second_offset..], new);
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Write,
    SetBits,
    ClearBits,
}

/// Byte update of the record: `data` applied `repeat_count` times back to back
/// starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpUpdate {
    pub kind: UpdateKind,
    pub offset: usize,
    pub data: Vec<u8>,
    pub repeat_count: u32,
}

impl NpUpdate {
    pub fn new(kind: UpdateKind, offset: usize, data: &[u8], repeat_count: u32) -> Self {
        NpUpdate {
            kind,
            offset,
            data: data.to_vec(),
            repeat_count,
        }
    }

    /// A repeat count of 0 means once.
    pub fn repeat(&self) -> usize {
        self.repeat_count.max(1) as usize
    }

    pub fn span(&self) -> usize {
        self.data.len().saturating_mul(self.repeat())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Lower the checkpoint; a larger value is ignored.
    Set,
    Force,
    /// Advance by `repeat_count` if the checkpoint still equals the given one.
    Incr { repeat_count: u32 },
}

/// Update of a u64 checkpoint, mirrored to `second_offset` when it is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointUpdate {
    pub kind: CheckpointKind,
    pub offset: usize,
    pub second_offset: usize,
    pub checkpoint: u64,
}

/// Outcome of a verify-write of the whole record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteVerifyResult {
    pub success: bool,
    pub retryable: bool,
}

impl WriteVerifyResult {
    fn classify(completion: Completion) -> Self {
        if !completion.packet.is_ok() {
            return WriteVerifyResult {
                success: false,
                retryable: false,
            };
        }
        match completion.metadata {
            MetadataStatus::Ok => WriteVerifyResult {
                success: true,
                retryable: false,
            },
            other => WriteVerifyResult {
                success: false,
                retryable: other == MetadataStatus::IoCorrectable,
            },
        }
    }
}

impl<M: MetadataService> StorageObject<M> {
    async fn issue_nonpaged(&self, op: NonPagedOp) -> Result<(), NpError> {
        let completion = self.metadata().nonpaged_operation(self.id(), op).await;
        let status = completion.status();
        if !status.is_ok() {
            error!(
                "non-paged operation failed, packet {} metadata {}",
                completion.packet, completion.metadata
            );
            return Err(NpError::Metadata(status));
        }
        Ok(())
    }

    fn validate_update(&self, update: &NpUpdate) -> Result<(), NpError> {
        if update.data.len() > MAX_DATA_SIZE {
            let err = NpError::PayloadTooLarge {
                size: update.data.len(),
                max: MAX_DATA_SIZE,
            };
            error!("{err}");
            return Err(err);
        }
        self.np_record()
            .read()
            .check_range(update.offset, update.span())
            .inspect_err(|e| error!("{e}"))
    }

    async fn update_nonpaged(&self, update: NpUpdate) -> Result<(), NpError> {
        self.validate_update(&update)?;
        self.issue_nonpaged(NonPagedOp::Update(update)).await
    }

    async fn checkpoint_nonpaged(&self, update: CheckpointUpdate, peer: bool) -> Result<(), NpError> {
        {
            let record = self.np_record().read();
            record
                .check_range(update.offset, size_of::<u64>())
                .and_then(|()| match update.second_offset {
                    0 => Ok(()),
                    second => record.check_range(second, size_of::<u64>()),
                })
                .inspect_err(|e| error!("{e}"))?;
        }
        self.issue_nonpaged(NonPagedOp::Checkpoint { update, peer })
            .await
    }

    pub async fn nonpaged_write(
        &self,
        offset: usize,
        data: &[u8],
        repeat_count: u32,
    ) -> Result<(), NpError> {
        self.update_nonpaged(NpUpdate::new(UpdateKind::Write, offset, data, repeat_count))
            .await
    }

    pub async fn nonpaged_set_bits(
        &self,
        offset: usize,
        data: &[u8],
        repeat_count: u32,
    ) -> Result<(), NpError> {
        self.update_nonpaged(NpUpdate::new(UpdateKind::SetBits, offset, data, repeat_count))
            .await
    }

    pub async fn nonpaged_clear_bits(
        &self,
        offset: usize,
        data: &[u8],
        repeat_count: u32,
    ) -> Result<(), NpError> {
        self.update_nonpaged(NpUpdate::new(UpdateKind::ClearBits, offset, data, repeat_count))
            .await
    }

    pub async fn nonpaged_write_persist(
        &self,
        offset: usize,
        data: &[u8],
        repeat_count: u32,
    ) -> Result<(), NpError> {
        self.nonpaged_write(offset, data, repeat_count).await?;
        self.nonpaged_persist().await
    }

    pub async fn nonpaged_set_bits_persist(
        &self,
        offset: usize,
        data: &[u8],
        repeat_count: u32,
    ) -> Result<(), NpError> {
        self.nonpaged_set_bits(offset, data, repeat_count).await?;
        self.nonpaged_persist().await
    }

    pub async fn nonpaged_clear_bits_persist(
        &self,
        offset: usize,
        data: &[u8],
        repeat_count: u32,
    ) -> Result<(), NpError> {
        self.nonpaged_clear_bits(offset, data, repeat_count).await?;
        self.nonpaged_persist().await
    }

    pub async fn set_checkpoint(
        &self,
        offset: usize,
        second_offset: usize,
        checkpoint: u64,
    ) -> Result<(), NpError> {
        let update = CheckpointUpdate {
            kind: CheckpointKind::Set,
            offset,
            second_offset,
            checkpoint,
        };
        self.checkpoint_nonpaged(update, true).await
    }

    pub async fn force_set_checkpoint(
        &self,
        offset: usize,
        second_offset: usize,
        checkpoint: u64,
    ) -> Result<(), NpError> {
        let update = CheckpointUpdate {
            kind: CheckpointKind::Force,
            offset,
            second_offset,
            checkpoint,
        };
        self.checkpoint_nonpaged(update, true).await
    }

    pub async fn set_checkpoint_persist(
        &self,
        offset: usize,
        second_offset: usize,
        checkpoint: u64,
    ) -> Result<(), NpError> {
        self.set_checkpoint(offset, second_offset, checkpoint).await?;
        self.nonpaged_persist().await
    }

    pub async fn incr_checkpoint(
        &self,
        offset: usize,
        second_offset: usize,
        checkpoint: u64,
        repeat_count: u32,
    ) -> Result<(), NpError> {
        let update = CheckpointUpdate {
            kind: CheckpointKind::Incr { repeat_count },
            offset,
            second_offset,
            checkpoint,
        };
        self.checkpoint_nonpaged(update, true).await
    }

    /// Like [`Self::incr_checkpoint`] but the peer's copy is left alone.
    pub async fn incr_checkpoint_no_peer(
        &self,
        offset: usize,
        second_offset: usize,
        checkpoint: u64,
        repeat_count: u32,
    ) -> Result<(), NpError> {
        let update = CheckpointUpdate {
            kind: CheckpointKind::Incr { repeat_count },
            offset,
            second_offset,
            checkpoint,
        };
        self.checkpoint_nonpaged(update, false).await
    }

    pub async fn incr_checkpoint_persist(
        &self,
        offset: usize,
        second_offset: usize,
        checkpoint: u64,
        repeat_count: u32,
    ) -> Result<(), NpError> {
        self.incr_checkpoint(offset, second_offset, checkpoint, repeat_count)
            .await?;
        self.nonpaged_persist().await
    }

    /// Persist the record, then run the post-persist hook.
    pub async fn nonpaged_persist(&self) -> Result<(), NpError> {
        self.issue_nonpaged(NonPagedOp::Persist).await?;
        self.nonpaged_post_persist().await
    }

    /// Tell the peer the record is on disk and leave initial configuration.
    async fn nonpaged_post_persist(&self) -> Result<(), NpError> {
        let res = self.issue_nonpaged(NonPagedOp::PostPersist).await;
        // the record is persisted whatever the peer made of it
        self.lock().initial_configuration = false;
        res
    }

    /// Reload the record from its persisted copy.
    pub async fn nonpaged_read_persist(&self) -> Result<(), NpError> {
        self.issue_nonpaged(NonPagedOp::ReadPersist).await
    }

    pub fn nonpaged_zero(&self) {
        self.np_record().write().zero();
    }

    pub async fn nonpaged_init(&self, data_size: usize) -> Result<(), NpError> {
        self.issue_nonpaged(NonPagedOp::Init { data_size })
            .await
            .map_err(|_| NpError::Metadata(PacketStatus::GenericFailure))
    }

    /// The record carries this object's signature.
    pub fn is_nonpaged_initialized(&self) -> bool {
        let record = self.np_record().read();
        if record.object_id() == self.id() && record.generation() == self.generation() {
            return true;
        }
        if record.object_id().0 != 0 || record.generation() != 0 {
            info!(
                "wrong non-paged signature: object {} != {}, generation {:#x} != {:#x}",
                record.object_id(),
                self.id(),
                record.generation(),
                self.generation()
            );
        }
        false
    }

    pub fn is_metadata_initialized(&self) -> bool {
        self.is_nonpaged_initialized() && self.nonpaged_state() == NonPagedState::Initialized
    }

    pub fn is_nonpaged_state_valid(&self) -> bool {
        self.nonpaged_state() != NonPagedState::Invalid
    }

    pub fn nonpaged_state(&self) -> NonPagedState {
        self.np_record().read().state()
    }

    /// Header of a freshly created record for this object.
    pub fn default_nonpaged_header(&self) -> [u8; NONPAGED_HEADER_SIZE] {
        let record = self.np_record().read();
        if (record.object_id().0 != 0 || record.generation() != 0)
            && !matches!(
                record.state(),
                NonPagedState::Invalid | NonPagedState::Uninitialized
            )
        {
            // A re-created object can legitimately find a stale signature here.
            error!(
                "object {} generation {:#x} not zero as expected, state {}",
                record.object_id(),
                record.generation(),
                record.state()
            );
        }

        let mut header = [0u8; NONPAGED_HEADER_SIZE];
        LittleEndian::write_u32(&mut header[VERSION_SIZE_OFFSET..], record.len() as u32);
        LittleEndian::write_u32(&mut header[OBJECT_ID_OFFSET..], self.id().0);
        LittleEndian::write_u64(&mut header[GENERATION_OFFSET..], self.generation());
        LittleEndian::write_u32(&mut header[STATE_OFFSET..], NonPagedState::Uninitialized as u32);
        // keep whatever background operations were already disabled
        LittleEndian::write_u32(&mut header[BITMASK_OFFSET..], record.operation_bitmask());
        header
    }

    #[instrument(skip_all, fields(object_id = %self.id()))]
    pub async fn set_default_nonpaged_metadata(&self) -> Result<(), NpError> {
        let header = self.default_nonpaged_header();
        self.nonpaged_write_persist(0, &header, 1).await
    }

    /// Write and persist the NP state; a peer waiting for our NP is told
    /// through metadata memory.
    pub async fn set_nonpaged_metadata_state(&self, state: NonPagedState) -> Result<(), NpError> {
        self.nonpaged_write_persist(STATE_OFFSET, &(state as u32).to_le_bytes(), 1)
            .await?;
        let st = self.lock();
        if st
            .memory
            .is_peer_clustered_flag_set(ClusteredFlags::PEER_NONPAGED_REQUEST)
        {
            st.memory.schedule_update();
        }
        Ok(())
    }

    pub fn is_background_operation_enabled(&self, op: BackgroundOperation) -> bool {
        self.np_record().read().operation_bitmask() & op.bit() == 0
    }

    pub async fn enable_background_operation(&self, op: BackgroundOperation) -> Result<(), NpError> {
        if self.is_background_operation_enabled(op) {
            warn!("background operation {op} already enabled");
            return Ok(());
        }
        self.nonpaged_clear_bits_persist(BITMASK_OFFSET, &op.bit().to_le_bytes(), 1)
            .await
    }

    pub async fn disable_background_operation(&self, op: BackgroundOperation) -> Result<(), NpError> {
        if !self.is_background_operation_enabled(op) {
            warn!("background operation {op} already disabled");
            return Ok(());
        }
        self.nonpaged_set_bits_persist(BITMASK_OFFSET, &op.bit().to_le_bytes(), 1)
            .await
    }

    /// Verify-write the whole record under the NP lock.
    ///
    /// Failing to get the lock is retryable and leaves no lock held.
    #[instrument(skip_all, fields(object_id = %self.id()))]
    pub async fn nonpaged_write_verify(&self) -> WriteVerifyResult {
        let lock = match self.acquire_np_lock().await {
            Ok(lock) => lock,
            Err(e) => {
                warn!("write verify: {e}");
                return WriteVerifyResult {
                    success: false,
                    retryable: true,
                };
            }
        };

        let completion = self
            .metadata()
            .nonpaged_operation(self.id(), NonPagedOp::WriteVerify)
            .await;
        let result = WriteVerifyResult::classify(completion);
        if !result.success {
            warn!(
                "write verify failed, packet {} metadata {}, retryable {}",
                completion.packet, completion.metadata, result.retryable
            );
        }

        lock.release().await;
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn repeated_updates() {
        let mut record = NonPagedRecord::new(8);
        record
            .apply(&NpUpdate::new(UpdateKind::Write, 24, &[0xf0, 0x0f], 3))
            .unwrap();
        assert_eq!(record.class_data(), &[0xf0, 0x0f, 0xf0, 0x0f, 0xf0, 0x0f, 0, 0]);

        record
            .apply(&NpUpdate::new(UpdateKind::SetBits, 30, &[0x01], 0))
            .unwrap();
        record
            .apply(&NpUpdate::new(UpdateKind::ClearBits, 24, &[0x30], 1))
            .unwrap();
        assert_eq!(record.class_data(), &[0xc0, 0x0f, 0xf0, 0x0f, 0xf0, 0x0f, 0x01, 0]);
    }

    #[test]
    fn out_of_range_update_leaves_record_alone() {
        let mut record = NonPagedRecord::new(4);
        let before = record.clone();
        let err = record
            .apply(&NpUpdate::new(UpdateKind::Write, 26, &[1, 2], 2))
            .unwrap_err();
        assert!(matches!(err, NpError::OutOfRange { offset: 26, end: 30, record_size: 28 }));
        assert!(record.apply(&NpUpdate::new(UpdateKind::Write, 28, &[], 1)).is_err());
        assert_eq!(record, before);
    }

    #[test]
    fn checkpoint_rules() {
        let mut record = NonPagedRecord::new(16);
        let at = |kind, checkpoint| CheckpointUpdate {
            kind,
            offset: 24,
            second_offset: 32,
            checkpoint,
        };
        assert!(record.apply_checkpoint(&at(CheckpointKind::Force, 100)).unwrap());
        assert_eq!(record.read_u64(32).unwrap(), 100);

        // set only lowers
        assert!(!record.apply_checkpoint(&at(CheckpointKind::Set, 200)).unwrap());
        assert!(record.apply_checkpoint(&at(CheckpointKind::Set, 50)).unwrap());
        assert_eq!(record.read_u64(24).unwrap(), 50);

        // increment only from the expected value
        let incr = CheckpointKind::Incr { repeat_count: 4 };
        assert!(!record.apply_checkpoint(&at(incr, 49)).unwrap());
        assert!(record.apply_checkpoint(&at(incr, 50)).unwrap());
        assert_eq!(record.read_u64(24).unwrap(), 54);
        assert_eq!(record.read_u64(32).unwrap(), 54);

        let mut bad = at(CheckpointKind::Force, 1);
        bad.second_offset = 36;
        assert!(record.apply_checkpoint(&bad).is_err());
        assert_eq!(record.read_u64(24).unwrap(), 54);
    }

    #[test]
    fn header_fields() {
        let mut record = NonPagedRecord::new(0);
        assert_eq!(record.state(), NonPagedState::Invalid);
        record.set_signature(ObjectId(0x108), 0x3a);
        record.set_state(NonPagedState::Initialized);
        assert_eq!(record.object_id(), ObjectId(0x108));
        assert_eq!(record.generation(), 0x3a);
        assert_eq!(record.state(), NonPagedState::Initialized);
        assert!(NonPagedRecord::from_bytes(vec![0; 10]).is_err());
    }

    #[test]
    fn write_verify_classification() {
        let ok = WriteVerifyResult::classify(Completion::OK);
        assert_eq!(ok, WriteVerifyResult { success: true, retryable: false });

        let correctable =
            WriteVerifyResult::classify(Completion::metadata_failure(MetadataStatus::IoCorrectable));
        assert_eq!(correctable, WriteVerifyResult { success: false, retryable: true });

        let bad = WriteVerifyResult::classify(Completion::metadata_failure(MetadataStatus::IoUncorrectable));
        assert_eq!(bad, WriteVerifyResult { success: false, retryable: false });

        let failed = WriteVerifyResult::classify(Completion::packet_failure(PacketStatus::Busy));
        assert!(!failed.retryable);
    }
}
