//! Metadata memory: the small per-object block each SP keeps in memory and
//! mirrors to its peer.
//!
//! The local block is only mutated under the object lock. Every change is
//! followed by a [`MetadataMemoryUpdate`] pushed onto an outbound channel; the
//! peer link drains that channel on its own schedule, so writers never wait
//! for the peer. The peer's block arrives through a [`PeerMirror`] and is never
//! modified locally.
//!
//! On the wire the block is `flags u64 | lifecycle_state u32 | power_save_state
//! u32 | last_io_time u64`, little endian. The quiesce state shares the flags
//! word as a one-of bit field; in memory it is the [`QuiesceState`] enum.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::ObjectId;

pub const METADATA_MEMORY_SIZE: usize = 24;

const FLAGS_OFFSET: usize = 0;
const LIFECYCLE_OFFSET: usize = 8;
const POWER_SAVE_OFFSET: usize = 12;
const LAST_IO_TIME_OFFSET: usize = 16;

bitflags! {
    /// Clustered flags: state bits visible to both SPs. The quiesce state
    /// field of the flags word is not part of this set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct ClusteredFlags: u64 {
        const JOINED = 1 << 0;
        const QUIESCING = 1 << 1;
        const QUIESCED = 1 << 2;
        const HIBERNATE_READY = 1 << 3;
        const ACTIVATE_REQ = 1 << 4;
        const ACTIVATE_STARTED = 1 << 5;
        const PASSIVE_REQ = 1 << 6;
        const PASSIVE_STARTED = 1 << 7;
        const NONPAGED_INITIALIZED = 1 << 8;
        /// Peer asked to be told when our non-paged metadata becomes valid.
        const PEER_NONPAGED_REQUEST = 1 << 9;
        /// Drain outstanding I/O at the transport before quiescing.
        const QUIESCE_HOLD = 1 << 10;
    }
}

/// Where this SP is in the quiesce/unquiesce handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, strum_macros::Display)]
pub enum QuiesceState {
    #[default]
    NotStarted,
    Ready,
    Complete,
    UnquiesceReady,
}

impl QuiesceState {
    const READY_BIT: u64 = 1 << 32;
    const COMPLETE_BIT: u64 = 1 << 33;
    const UNQUIESCE_READY_BIT: u64 = 1 << 34;

    pub const WIRE_MASK: u64 = Self::READY_BIT | Self::COMPLETE_BIT | Self::UNQUIESCE_READY_BIT;

    pub fn to_wire_bits(self) -> u64 {
        match self {
            QuiesceState::NotStarted => 0,
            QuiesceState::Ready => Self::READY_BIT,
            QuiesceState::Complete => Self::COMPLETE_BIT,
            QuiesceState::UnquiesceReady => Self::UNQUIESCE_READY_BIT,
        }
    }

    /// Decode the state field of a flags word. More than one state bit is
    /// not a valid encoding.
    pub fn from_wire_bits(flags: u64) -> Result<Self, MetadataMemoryError> {
        match flags & Self::WIRE_MASK {
            0 => Ok(QuiesceState::NotStarted),
            Self::READY_BIT => Ok(QuiesceState::Ready),
            Self::COMPLETE_BIT => Ok(QuiesceState::Complete),
            Self::UNQUIESCE_READY_BIT => Ok(QuiesceState::UnquiesceReady),
            other => Err(MetadataMemoryError::InvalidQuiesceState(other)),
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum MetadataMemoryError {
    #[error("metadata memory image is {0} bytes, expected {METADATA_MEMORY_SIZE}")]
    BadImageSize(usize),
    #[error("invalid quiesce state encoding {0:#x}")]
    InvalidQuiesceState(u64),
    #[error("invalid range {offset}+{size}, metadata memory size {METADATA_MEMORY_SIZE}")]
    InvalidRange { offset: usize, size: usize },
    #[error("no peer metadata memory")]
    NoPeerMemory,
}

/// Decoded metadata memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetadataMemory {
    /// Never carries quiesce state bits; those live in `quiesce_state`.
    pub flags: ClusteredFlags,
    pub quiesce_state: QuiesceState,
    pub lifecycle_state: u32,
    pub power_save_state: u32,
    pub last_io_time: u64,
}

impl MetadataMemory {
    pub fn to_wire(&self) -> [u8; METADATA_MEMORY_SIZE] {
        let mut buf = [0u8; METADATA_MEMORY_SIZE];
        LittleEndian::write_u64(
            &mut buf[FLAGS_OFFSET..LIFECYCLE_OFFSET],
            self.flags.bits() | self.quiesce_state.to_wire_bits(),
        );
        LittleEndian::write_u32(
            &mut buf[LIFECYCLE_OFFSET..POWER_SAVE_OFFSET],
            self.lifecycle_state,
        );
        LittleEndian::write_u32(
            &mut buf[POWER_SAVE_OFFSET..LAST_IO_TIME_OFFSET],
            self.power_save_state,
        );
        LittleEndian::write_u64(&mut buf[LAST_IO_TIME_OFFSET..], self.last_io_time);
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self, MetadataMemoryError> {
        if buf.len() != METADATA_MEMORY_SIZE {
            return Err(MetadataMemoryError::BadImageSize(buf.len()));
        }
        let flags = LittleEndian::read_u64(&buf[FLAGS_OFFSET..LIFECYCLE_OFFSET]);
        Ok(MetadataMemory {
            flags: ClusteredFlags::from_bits_truncate(flags),
            quiesce_state: QuiesceState::from_wire_bits(flags)?,
            lifecycle_state: LittleEndian::read_u32(&buf[LIFECYCLE_OFFSET..POWER_SAVE_OFFSET]),
            power_save_state: LittleEndian::read_u32(&buf[POWER_SAVE_OFFSET..LAST_IO_TIME_OFFSET]),
            last_io_time: LittleEndian::read_u64(&buf[LAST_IO_TIME_OFFSET..]),
        })
    }
}

/// A local block that must be pushed to the peer.
#[derive(Debug, Clone)]
pub struct MetadataMemoryUpdate {
    pub object_id: ObjectId,
    pub image: [u8; METADATA_MEMORY_SIZE],
}

/// Transport-side handle that refreshes our view of the peer's block.
#[derive(Debug)]
pub struct PeerMirror {
    tx: watch::Sender<Option<MetadataMemory>>,
}

impl PeerMirror {
    /// Install a block received from the peer.
    pub fn apply_image(&self, image: &[u8]) -> Result<(), MetadataMemoryError> {
        let memory = MetadataMemory::from_wire(image)?;
        self.tx.send_replace(Some(memory));
        Ok(())
    }

    /// The peer's memory is gone, e.g. the peer object was destroyed.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }
}

/// Local metadata memory plus the read-only peer view.
#[derive(Debug)]
pub struct MetadataMemorySync {
    object_id: ObjectId,
    local: MetadataMemory,
    peer_rx: watch::Receiver<Option<MetadataMemory>>,
    update_tx: mpsc::UnboundedSender<MetadataMemoryUpdate>,
}

/// Create the synchronizer, the peer mirror feeding it, and the receiving end
/// of its outbound update queue.
pub fn channel(
    object_id: ObjectId,
) -> (
    MetadataMemorySync,
    PeerMirror,
    mpsc::UnboundedReceiver<MetadataMemoryUpdate>,
) {
    let (peer_tx, peer_rx) = watch::channel(None);
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let sync = MetadataMemorySync {
        object_id,
        local: MetadataMemory::default(),
        peer_rx,
        update_tx,
    };
    (sync, PeerMirror { tx: peer_tx }, update_rx)
}

impl MetadataMemorySync {
    pub fn local(&self) -> &MetadataMemory {
        &self.local
    }

    /// Snapshot of the peer's block, if we have one.
    pub fn peer(&self) -> Option<MetadataMemory> {
        *self.peer_rx.borrow()
    }

    pub fn quiesce_state_local(&self) -> QuiesceState {
        self.local.quiesce_state
    }

    /// Without peer memory the peer counts as not started.
    pub fn quiesce_state_peer(&self) -> QuiesceState {
        self.peer().map(|m| m.quiesce_state).unwrap_or_default()
    }

    /// Returns whether the state changed. An unchanged state schedules nothing.
    pub fn set_quiesce_state_local_and_update_peer(&mut self, state: QuiesceState) -> bool {
        if self.local.quiesce_state == state {
            return false;
        }
        debug!(
            "quiesce state {} -> {}",
            self.local.quiesce_state, state
        );
        self.local.quiesce_state = state;
        self.schedule_update();
        true
    }

    pub fn is_clustered_flag_set(&self, flags: ClusteredFlags) -> bool {
        self.local.flags.contains(flags)
    }

    pub fn is_peer_clustered_flag_set(&self, flags: ClusteredFlags) -> bool {
        self.peer().is_some_and(|m| m.flags.contains(flags))
    }

    pub fn is_any_peer_clustered_flag_set(&self, flags: ClusteredFlags) -> bool {
        self.peer().is_some_and(|m| m.flags.intersects(flags))
    }

    /// Returns whether anything changed; only a change is propagated.
    pub fn set_clustered_flag(&mut self, flags: ClusteredFlags) -> bool {
        if self.local.flags.contains(flags) {
            return false;
        }
        self.local.flags.insert(flags);
        self.schedule_update();
        true
    }

    /// Returns whether anything changed; only a change is propagated.
    pub fn clear_clustered_flag(&mut self, flags: ClusteredFlags) -> bool {
        if !self.local.flags.intersects(flags) {
            return false;
        }
        self.local.flags.remove(flags);
        self.schedule_update();
        true
    }

    pub fn lifecycle_state(&self) -> u32 {
        self.local.lifecycle_state
    }

    pub fn peer_lifecycle_state(&self) -> Option<u32> {
        self.peer().map(|m| m.lifecycle_state)
    }

    pub fn set_lifecycle_state(&mut self, state: u32) {
        if self.local.lifecycle_state != state {
            self.local.lifecycle_state = state;
            self.schedule_update();
        }
    }

    pub fn power_save_state(&self) -> u32 {
        self.local.power_save_state
    }

    pub fn peer_power_save_state(&self) -> Option<u32> {
        self.peer().map(|m| m.power_save_state)
    }

    pub fn set_power_save_state(&mut self, state: u32) {
        if self.local.power_save_state != state {
            self.local.power_save_state = state;
            self.schedule_update();
        }
    }

    pub fn last_io_time(&self) -> u64 {
        self.local.last_io_time
    }

    pub fn peer_last_io_time(&self) -> Option<u64> {
        self.peer().map(|m| m.last_io_time)
    }

    /// Last I/O time is refreshed on the data path and is not pushed on its own.
    pub fn set_last_io_time(&mut self, time: u64) {
        self.local.last_io_time = time;
    }

    /// Copy up to `buf.len()` bytes of the local or peer wire image.
    pub fn read(&self, is_peer: bool, buf: &mut [u8]) -> Result<usize, MetadataMemoryError> {
        let image = if is_peer {
            self.peer()
                .ok_or(MetadataMemoryError::NoPeerMemory)?
                .to_wire()
        } else {
            self.local.to_wire()
        };
        let len = image.len().min(buf.len());
        buf[..len].copy_from_slice(&image[..len]);
        Ok(len)
    }

    /// Bitwise update of `offset..offset + size` of the local wire image.
    ///
    /// `buffer` and `mask` are indexed like the image; a set mask bit takes the
    /// bit from `buffer`. Nothing changes on error.
    pub fn update(
        &mut self,
        buffer: &[u8],
        mask: &[u8],
        offset: usize,
        size: usize,
    ) -> Result<(), MetadataMemoryError> {
        let end = offset.checked_add(size);
        let in_range = offset < METADATA_MEMORY_SIZE
            && end.is_some_and(|end| end <= METADATA_MEMORY_SIZE && end <= buffer.len() && end <= mask.len());
        if !in_range {
            return Err(MetadataMemoryError::InvalidRange { offset, size });
        }

        let mut image = self.local.to_wire();
        for i in offset..offset + size {
            if mask[i] != 0 {
                image[i] = (image[i] & !mask[i]) | (buffer[i] & mask[i]);
            }
        }
        self.local = MetadataMemory::from_wire(&image)?;
        self.schedule_update();
        Ok(())
    }

    /// Queue the current local block for delivery to the peer.
    pub fn schedule_update(&self) {
        let update = MetadataMemoryUpdate {
            object_id: self.object_id,
            image: self.local.to_wire(),
        };
        if self.update_tx.send(update).is_err() {
            warn!("metadata memory update dropped, peer link is gone");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<MetadataMemoryUpdate>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[test]
    fn wire_image_keeps_state_out_of_flags() {
        let memory = MetadataMemory {
            flags: ClusteredFlags::JOINED | ClusteredFlags::QUIESCE_HOLD,
            quiesce_state: QuiesceState::Complete,
            lifecycle_state: 3,
            power_save_state: 1,
            last_io_time: 0xdead_beef,
        };
        let image = memory.to_wire();
        let decoded = MetadataMemory::from_wire(&image).unwrap();
        assert_eq!(decoded, memory);
        assert_eq!(decoded.flags.bits() & QuiesceState::WIRE_MASK, 0);

        // bits we do not know are dropped
        let mut image = MetadataMemory::default().to_wire();
        LittleEndian::write_u64(&mut image[..8], (1 << 20) | ClusteredFlags::JOINED.bits());
        let decoded = MetadataMemory::from_wire(&image).unwrap();
        assert_eq!(decoded.flags, ClusteredFlags::JOINED);
        assert_eq!(decoded.quiesce_state, QuiesceState::NotStarted);
    }

    #[test]
    fn two_state_bits_are_rejected() {
        let mut image = MetadataMemory::default().to_wire();
        let bits = QuiesceState::Ready.to_wire_bits() | QuiesceState::Complete.to_wire_bits();
        LittleEndian::write_u64(&mut image[..8], bits);
        assert_eq!(
            MetadataMemory::from_wire(&image),
            Err(MetadataMemoryError::InvalidQuiesceState(bits))
        );
        assert_eq!(
            MetadataMemory::from_wire(&image[..10]),
            Err(MetadataMemoryError::BadImageSize(10))
        );
    }

    #[test]
    fn flag_changes_schedule_updates_once() {
        let (mut sync, _mirror, mut rx) = channel(ObjectId(1));

        assert!(sync.set_clustered_flag(ClusteredFlags::QUIESCING));
        assert!(!sync.set_clustered_flag(ClusteredFlags::QUIESCING));
        assert_eq!(drain(&mut rx), 1);

        assert!(sync.clear_clustered_flag(ClusteredFlags::QUIESCING));
        assert!(!sync.clear_clustered_flag(ClusteredFlags::QUIESCING));
        assert_eq!(drain(&mut rx), 1);

        assert!(sync.set_quiesce_state_local_and_update_peer(QuiesceState::Ready));
        assert!(!sync.set_quiesce_state_local_and_update_peer(QuiesceState::Ready));
        let update = rx.try_recv().unwrap();
        assert_eq!(
            MetadataMemory::from_wire(&update.image).unwrap().quiesce_state,
            QuiesceState::Ready
        );
        assert_eq!(update.object_id, ObjectId(1));
    }

    #[test]
    fn peer_view_follows_mirror() {
        let (sync, mirror, _rx) = channel(ObjectId(1));
        assert_eq!(sync.quiesce_state_peer(), QuiesceState::NotStarted);
        assert!(!sync.is_peer_clustered_flag_set(ClusteredFlags::JOINED));

        let peer = MetadataMemory {
            flags: ClusteredFlags::JOINED | ClusteredFlags::QUIESCING,
            quiesce_state: QuiesceState::Ready,
            ..Default::default()
        };
        mirror.apply_image(&peer.to_wire()).unwrap();
        assert_eq!(sync.quiesce_state_peer(), QuiesceState::Ready);
        assert!(sync.is_peer_clustered_flag_set(ClusteredFlags::JOINED | ClusteredFlags::QUIESCING));
        assert!(!sync.is_peer_clustered_flag_set(ClusteredFlags::JOINED | ClusteredFlags::QUIESCED));
        assert!(sync.is_any_peer_clustered_flag_set(ClusteredFlags::JOINED | ClusteredFlags::QUIESCED));

        mirror.clear();
        assert_eq!(sync.peer(), None);
    }

    #[test]
    fn masked_update_touches_only_masked_bits() {
        let (mut sync, _mirror, mut rx) = channel(ObjectId(1));
        sync.set_lifecycle_state(0xff);
        drain(&mut rx);

        let mut buffer = [0u8; METADATA_MEMORY_SIZE];
        let mut mask = [0u8; METADATA_MEMORY_SIZE];
        buffer[LIFECYCLE_OFFSET] = 0x00;
        mask[LIFECYCLE_OFFSET] = 0x0f;
        buffer[POWER_SAVE_OFFSET] = 0x05;
        mask[POWER_SAVE_OFFSET] = 0xff;

        sync.update(&buffer, &mask, LIFECYCLE_OFFSET, 8).unwrap();
        assert_eq!(sync.lifecycle_state(), 0xf0);
        assert_eq!(sync.power_save_state(), 5);
        assert_eq!(drain(&mut rx), 1);

        assert_eq!(
            sync.update(&buffer, &mask, 20, 8),
            Err(MetadataMemoryError::InvalidRange { offset: 20, size: 8 })
        );
        assert_eq!(sync.power_save_state(), 5);
        assert_eq!(drain(&mut rx), 0);
    }

    #[test]
    fn read_copies_at_most_buffer_len() {
        let (mut sync, _mirror, _rx) = channel(ObjectId(1));
        sync.set_lifecycle_state(7);
        let mut small = [0u8; 12];
        assert_eq!(sync.read(false, &mut small).unwrap(), 12);
        assert_eq!(LittleEndian::read_u32(&small[8..12]), 7);

        let mut big = [0u8; 64];
        assert_eq!(sync.read(false, &mut big).unwrap(), METADATA_MEMORY_SIZE);
        assert_eq!(
            sync.read(true, &mut big),
            Err(MetadataMemoryError::NoPeerMemory)
        );
    }
}
