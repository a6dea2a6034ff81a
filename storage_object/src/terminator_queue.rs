//! The terminator queue: requests parked on the object while they wait for
//! completion or for a stripe lock.
//!
//! Lock order: object lock, then terminator lock, then per-IOTS lock. The
//! transport queue lock may be taken while the terminator lock is held and is
//! always released before it; [`TerminatorGuard`] is the only way to take both.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::collaborators::{BlockTransport, RaidLibrary, TransportQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IotsId(pub u64);

impl std::fmt::Display for IotsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "iots-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum IotsStatus {
    AtLibrary,
    NotStartedToLibrary,
    WaitingForQuiesce,
    NotUsed,
    Invalid,
}

/// Mutable part of an IOTS, guarded by the per-IOTS lock.
#[derive(Debug)]
pub struct IotsState {
    pub status: IotsStatus,
    /// The library wants the whole IOTS restarted on unquiesce.
    pub restart_iots: bool,
    /// Handed to a restart queue.
    pub restart: bool,
    /// Linked on a wait queue.
    pub on_wait_queue: bool,
    /// The library parked this IOTS while quiescing.
    pub quiesced: bool,
    /// Sub-requests parked by the library.
    pub quiesced_siots: u32,
    /// Sub-requests still running in the library.
    pub active_siots: u32,
    /// A completion callback is installed. Must be clear before the IOTS is
    /// first started to the library.
    pub callback_armed: bool,
}

impl IotsState {
    pub fn new(status: IotsStatus) -> Self {
        IotsState {
            status,
            restart_iots: false,
            restart: false,
            on_wait_queue: false,
            quiesced: false,
            quiesced_siots: 0,
            active_siots: 0,
            callback_armed: false,
        }
    }

    pub fn set_as_not_used(&mut self) {
        self.status = IotsStatus::NotUsed;
    }
}

/// One decomposed in-flight request.
#[derive(Debug)]
pub struct Iots {
    id: IotsId,
    priority: u32,
    background: bool,
    metadata_request: bool,
    master_packet: Option<u64>,
    state: Mutex<IotsState>,
}

pub type IotsRef = Arc<Iots>;

impl Iots {
    pub fn new(id: IotsId, status: IotsStatus) -> Self {
        Iots {
            id,
            priority: 0,
            background: false,
            metadata_request: false,
            master_packet: None,
            state: Mutex::new(IotsState::new(status)),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Issued by a background operation of the object rather than by a host.
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Metadata sub-request of `master_packet`, which is not itself on the
    /// terminator queue.
    pub fn metadata_request(mut self, master_packet: Option<u64>) -> Self {
        self.metadata_request = true;
        self.master_packet = master_packet;
        self
    }

    pub fn id(&self) -> IotsId {
        self.id
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn is_metadata(&self) -> bool {
        self.metadata_request
    }

    pub fn master_packet(&self) -> Option<u64> {
        self.master_packet
    }

    /// Take the per-IOTS lock.
    pub fn lock(&self) -> MutexGuard<'_, IotsState> {
        self.state.lock()
    }
}

/// Something to resume on unquiesce.
#[derive(Debug, Clone)]
pub enum RestartEntry {
    Iots(IotsRef),
    Siots { iots: IotsRef, count: u32 },
}

#[derive(Debug, Default)]
pub struct RestartQueue {
    entries: Vec<RestartEntry>,
}

impl RestartQueue {
    pub fn push(&mut self, entry: RestartEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for RestartQueue {
    type Item = RestartEntry;
    type IntoIter = std::vec::IntoIter<RestartEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Result of one pass over the terminator queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanResult {
    pub quiesced: bool,
    pub outstanding_io: u32,
    pub terminator_count: u32,
    pub iots_count: u32,
    /// Highest packet priority seen.
    pub max_priority: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestartCounts {
    pub found: u32,
    pub iots: u32,
}

#[derive(Debug, Default)]
pub struct TerminatorQueue {
    queue: Mutex<VecDeque<IotsRef>>,
}

impl TerminatorQueue {
    pub fn push(&self, iots: IotsRef) {
        self.queue.lock().push_back(iots);
    }

    pub fn remove(&self, id: IotsId) -> Option<IotsRef> {
        let mut queue = self.queue.lock();
        let pos = queue.iter().position(|i| i.id() == id)?;
        queue.remove(pos)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn lock(&self) -> TerminatorGuard<'_> {
        TerminatorGuard {
            transport: None,
            queue: self.queue.lock(),
        }
    }

    /// Decide whether every outstanding request is parked on this queue.
    ///
    /// Stops at the first IOTS the library cannot quiesce. `count_metadata`
    /// enables counting master packets of metadata sub-requests, which only
    /// RAID and virtual drive objects issue.
    pub fn scan_quiesce(
        &self,
        raid: &dyn RaidLibrary,
        transport: &dyn BlockTransport,
        count_metadata: bool,
        pass_thru: bool,
    ) -> ScanResult {
        let mut guard = self.lock();
        let mut result = ScanResult::default();
        let mut metadata_req = false;

        for iots in guard.queue.iter() {
            result.terminator_count += 1;
            metadata_req = count_metadata && raid.is_metadata_request(iots);

            let mut state = iots.lock();
            match state.status {
                IotsStatus::AtLibrary => {
                    let quiesced = match raid.quiesce_with_lock(iots, &mut state) {
                        Ok(quiesced) => quiesced,
                        Err(e) => {
                            error!("quiesce of {} at library failed: {e:#}", iots.id());
                            false
                        }
                    };
                    if !quiesced {
                        // everything behind it has to wait for this one anyway
                        break;
                    }
                    result.iots_count += 1;
                    if metadata_req {
                        result.iots_count += 1;
                    }
                }
                IotsStatus::NotStartedToLibrary => {
                    result.iots_count += 1;
                    if metadata_req {
                        if iots.master_packet().is_some() {
                            result.iots_count += 1;
                        } else {
                            warn!("metadata {} without master packet", iots.id());
                        }
                    }
                }
                IotsStatus::WaitingForQuiesce => result.iots_count += 1,
                IotsStatus::NotUsed | IotsStatus::Invalid => {}
            }
            drop(state);
            result.max_priority = result.max_priority.max(iots.priority());
        }

        // Requests still in flight below us are not on the queue yet.
        result.outstanding_io = guard.lock_transport(transport).outstanding_io;
        drop(guard);

        result.quiesced = result.outstanding_io == result.iots_count
            || (pass_thru && result.outstanding_io == 0);

        info!(
            "quiesced: {} pass-thru: {} metadata: {} outstanding: {} terminator: {} iots: {}",
            result.quiesced,
            pass_thru,
            metadata_req,
            result.outstanding_io,
            result.terminator_count,
            result.iots_count
        );
        result
    }

    /// Number of IOTS the library has already parked.
    pub fn count_quiesced_ios(&self) -> u32 {
        let guard = self.lock();
        guard
            .queue
            .iter()
            .filter(|iots| iots.lock().quiesced)
            .count() as u32
    }

    /// Cancel background requests still at the library. Host I/O is left alone.
    pub fn abort_monitor_ops(&self, raid: &dyn RaidLibrary) -> anyhow::Result<()> {
        let guard = self.lock();
        for iots in guard.queue.iter() {
            let mut state = iots.lock();
            match state.status {
                IotsStatus::Invalid => {
                    warn!("{} has invalid status, skipping abort", iots.id());
                }
                IotsStatus::AtLibrary if iots.is_background() => {
                    raid.abort_monitor_op(iots, &mut state)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Terminator queue lock, optionally together with the transport queue lock.
///
/// The transport lock can only be taken through this guard, after the
/// terminator lock, and is released first on drop.
pub struct TerminatorGuard<'a> {
    // field order is drop order
    transport: Option<MutexGuard<'a, TransportQueue>>,
    queue: MutexGuard<'a, VecDeque<IotsRef>>,
}

impl<'a> TerminatorGuard<'a> {
    pub fn iter(&self) -> impl Iterator<Item = &IotsRef> {
        self.queue.iter()
    }

    pub fn lock_transport(&mut self, transport: &'a dyn BlockTransport) -> &mut TransportQueue {
        &mut **self
            .transport
            .get_or_insert_with(|| transport.queue_lock().lock())
    }

    /// Build the restart list for unquiesce. The caller holds the object lock.
    pub fn collect_restarts(&self, raid: &dyn RaidLibrary) -> (RestartQueue, RestartCounts) {
        let mut restart = RestartQueue::default();
        let mut counts = RestartCounts::default();

        for iots in self.queue.iter() {
            let mut state = iots.lock();
            if state.restart_iots {
                state.restart_iots = false;
                if state.on_wait_queue {
                    error!("critical: {} is already on a wait queue", iots.id());
                }
                state.restart = true;
                // not used while it sits on the restart queue
                state.set_as_not_used();
                state.on_wait_queue = true;
                restart.push(RestartEntry::Iots(Arc::clone(iots)));
                counts.iots += 1;
            } else {
                match state.status {
                    IotsStatus::NotStartedToLibrary => {
                        if state.callback_armed {
                            error!("{} has a completion callback before start", iots.id());
                        }
                        state.set_as_not_used();
                        if state.on_wait_queue {
                            error!("critical: {} is already on a wait queue", iots.id());
                        }
                        state.on_wait_queue = true;
                        restart.push(RestartEntry::Iots(Arc::clone(iots)));
                    }
                    IotsStatus::NotUsed => {}
                    IotsStatus::WaitingForQuiesce => {
                        error!("{} should be started already", iots.id());
                    }
                    IotsStatus::AtLibrary | IotsStatus::Invalid => {
                        raid.get_quiesced_ts_to_restart(iots, &mut state, &mut restart);
                    }
                }
            }
            counts.found += 1;
        }
        (restart, counts)
    }
}

impl Drop for TerminatorGuard<'_> {
    fn drop(&mut self) {
        // inner lock first
        self.transport.take();
    }
}
