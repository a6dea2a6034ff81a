//! In-process stand-ins for the RAID library, the block transport server and
//! the inter-SP link, plus harnesses wiring one or two SPs around them.
//!
//! Used by the tests and by the `storage_object_sim` binary.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::bail;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::collaborators::{BlockTransport, CmiTransport, RaidLibrary, TransportQueue};
use crate::config::StorageObjectConf;
use crate::control_file::{InMemoryStorage, Storage};
use crate::metadata_memory::{MetadataMemoryUpdate, PeerMirror};
use crate::metadata_service::{LocalMetadataService, MetadataService};
use crate::nonpaged::NonPagedRecord;
use crate::object::{PeerLink, StorageObject};
use crate::terminator_queue::{
    Iots, IotsId, IotsRef, IotsState, IotsStatus, RestartEntry, RestartQueue,
};

pub type SimMetadata<S = InMemoryStorage> = LocalMetadataService<S>;

/// RAID library that parks an IOTS once none of its sub-requests run.
#[derive(Debug, Default)]
pub struct SimRaidLibrary {
    aborted: Mutex<Vec<IotsId>>,
    restarted: Mutex<Vec<IotsId>>,
    fail_abort: AtomicBool,
}

impl SimRaidLibrary {
    /// IOTS cancelled through `abort_monitor_op`, in order.
    pub fn aborted(&self) -> Vec<IotsId> {
        self.aborted.lock().clone()
    }

    /// IOTS resumed through `restart_common_queue`, in order.
    pub fn restarted(&self) -> Vec<IotsId> {
        self.restarted.lock().clone()
    }

    pub fn fail_abort(&self, fail: bool) {
        self.fail_abort.store(fail, Ordering::Relaxed);
    }
}

impl RaidLibrary for SimRaidLibrary {
    fn is_metadata_request(&self, iots: &Iots) -> bool {
        iots.is_metadata()
    }

    fn quiesce_with_lock(&self, _iots: &Iots, state: &mut IotsState) -> anyhow::Result<bool> {
        if state.active_siots > 0 {
            return Ok(false);
        }
        state.quiesced = true;
        Ok(true)
    }

    fn get_quiesced_ts_to_restart(
        &self,
        iots: &IotsRef,
        state: &mut IotsState,
        restart: &mut RestartQueue,
    ) {
        if state.quiesced_siots > 0 {
            restart.push(RestartEntry::Siots {
                iots: Arc::clone(iots),
                count: state.quiesced_siots,
            });
            state.quiesced_siots = 0;
        }
        state.quiesced = false;
    }

    fn abort_monitor_op(&self, iots: &Iots, _state: &mut IotsState) -> anyhow::Result<()> {
        if self.fail_abort.load(Ordering::Relaxed) {
            bail!("library refused to abort {}", iots.id());
        }
        self.aborted.lock().push(iots.id());
        Ok(())
    }

    fn restart_common_queue(&self, queue: RestartQueue) -> usize {
        let mut restarted = self.restarted.lock();
        let mut n = 0;
        for entry in queue {
            let id = match entry {
                RestartEntry::Iots(iots) => {
                    let mut state = iots.lock();
                    state.status = IotsStatus::AtLibrary;
                    state.on_wait_queue = false;
                    state.restart = false;
                    state.quiesced = false;
                    iots.id()
                }
                RestartEntry::Siots { iots, count } => {
                    debug!("restarting {count} sub-requests of {}", iots.id());
                    iots.id()
                }
            };
            restarted.push(id);
            n += 1;
        }
        n
    }
}

/// Block transport server with a settable in-flight count.
#[derive(Debug, Default)]
pub struct SimTransport {
    queue: parking_lot::Mutex<TransportQueue>,
    fail_process: AtomicBool,
}

impl SimTransport {
    pub fn set_outstanding(&self, count: u32) {
        self.queue.lock().outstanding_io = count;
    }

    /// A new host request arrives; it waits while the transport is held.
    pub fn submit(&self, id: u64) {
        let mut queue = self.queue.lock();
        if queue.held {
            queue.waiting.push_back((id, Instant::now()));
        } else {
            queue.outstanding_io += 1;
        }
    }

    pub fn waiting(&self) -> usize {
        self.queue.lock().waiting.len()
    }

    pub fn fail_process(&self, fail: bool) {
        self.fail_process.store(fail, Ordering::Relaxed);
    }
}

impl BlockTransport for SimTransport {
    fn queue_lock(&self) -> &parking_lot::Mutex<TransportQueue> {
        &self.queue
    }

    fn process_io_from_queue(&self) -> anyhow::Result<()> {
        let mut queue = self.queue.lock();
        queue.held = false;
        if self.fail_process.load(Ordering::Relaxed) {
            bail!("transport refused to start {} queued requests", queue.waiting.len());
        }
        let started: VecDeque<_> = std::mem::take(&mut queue.waiting);
        queue.outstanding_io += started.len() as u32;
        Ok(())
    }
}

/// Inter-SP link delivering metadata memory to the peer while the metadata
/// service reports the link up.
pub struct SimCmi<S = InMemoryStorage> {
    metadata: Arc<SimMetadata<S>>,
    peer: Mutex<Option<Arc<PeerMirror>>>,
}

impl<S: Storage + 'static> SimCmi<S> {
    pub fn new(metadata: Arc<SimMetadata<S>>) -> Self {
        SimCmi {
            metadata,
            peer: Mutex::new(None),
        }
    }

    pub fn connect(&self, peer: Arc<PeerMirror>) {
        *self.peer.lock() = Some(peer);
    }
}

impl<S: Storage + 'static> CmiTransport for SimCmi<S> {
    fn push_metadata_memory(&self, update: &MetadataMemoryUpdate) -> anyhow::Result<()> {
        if !self.metadata.cmi_peer_alive() {
            debug!("link down, metadata memory of {} not delivered", update.object_id);
            return Ok(());
        }
        if let Some(peer) = self.peer.lock().as_ref() {
            peer.apply_image(&update.image)?;
        }
        Ok(())
    }
}

/// One SP: the object and the collaborators around it.
pub struct SimSp<S = InMemoryStorage> {
    pub object: Arc<StorageObject<SimMetadata<S>>>,
    pub metadata: Arc<SimMetadata<S>>,
    pub raid: Arc<SimRaidLibrary>,
    pub transport: Arc<SimTransport>,
    pub cmi: Arc<SimCmi<S>>,
    /// Installs blocks received from the peer.
    pub mirror: Arc<PeerMirror>,
    /// Local blocks waiting for the link.
    pub updates: mpsc::UnboundedReceiver<MetadataMemoryUpdate>,
}

impl SimSp<InMemoryStorage> {
    /// An SP without a peer.
    pub fn solo(conf: StorageObjectConf) -> anyhow::Result<Self> {
        let storage = InMemoryStorage::new(NonPagedRecord::new(conf.nonpaged_data_size));
        Self::build(&conf, SimMetadata::<InMemoryStorage>::new(), storage)
    }
}

impl<S: Storage + 'static> SimSp<S> {
    /// Register `storage` with `metadata` and create the object on top.
    pub fn build(
        conf: &StorageObjectConf,
        metadata: Arc<SimMetadata<S>>,
        storage: S,
    ) -> anyhow::Result<Self> {
        metadata.register(conf.object_id, storage);
        let raid = Arc::new(SimRaidLibrary::default());
        let transport = Arc::new(SimTransport::default());
        let (object, PeerLink { mirror, updates }) = StorageObject::new(
            conf,
            Arc::clone(&raid) as Arc<dyn RaidLibrary>,
            Arc::clone(&transport) as Arc<dyn BlockTransport>,
            Arc::clone(&metadata),
        )?;
        Ok(SimSp {
            object: Arc::new(object),
            cmi: Arc::new(SimCmi::new(Arc::clone(&metadata))),
            metadata,
            raid,
            transport,
            mirror: Arc::new(mirror),
            updates,
        })
    }

    /// Push every queued local block over the link.
    pub fn flush(&mut self) -> anyhow::Result<usize> {
        let mut n = 0;
        while let Ok(update) = self.updates.try_recv() {
            self.cmi.push_metadata_memory(&update)?;
            n += 1;
        }
        Ok(n)
    }
}

/// Two SPs owning the same object.
pub struct SimCluster<S = InMemoryStorage> {
    pub a: SimSp<S>,
    pub b: SimSp<S>,
}

impl SimCluster<InMemoryStorage> {
    pub fn pair(conf: StorageObjectConf) -> anyhow::Result<Self> {
        let (ma, mb) = SimMetadata::<InMemoryStorage>::pair();
        let storage = || InMemoryStorage::new(NonPagedRecord::new(conf.nonpaged_data_size));
        let a = SimSp::build(&conf, ma, storage())?;
        let b = SimSp::build(&conf, mb, storage())?;
        Ok(Self::connect(a, b))
    }
}

impl<S: Storage + 'static> SimCluster<S> {
    /// Cross-wire the links of two SPs whose metadata services are paired.
    pub fn connect(a: SimSp<S>, b: SimSp<S>) -> Self {
        a.cmi.connect(Arc::clone(&b.mirror));
        b.cmi.connect(Arc::clone(&a.mirror));
        SimCluster { a, b }
    }

    /// Deliver queued metadata memory in both directions.
    pub fn pump(&mut self) {
        for sp in [&mut self.a, &mut self.b] {
            if let Err(e) = sp.flush() {
                error!("metadata memory delivery failed: {e:#}");
            }
        }
    }

    /// Join both SPs and let each see the other.
    pub fn join(&mut self) {
        self.a.object.join();
        self.b.object.join();
        self.pump();
    }

    /// One monitor cycle on both SPs, followed by delivery.
    pub fn quiesce_step(&mut self, pass_thru: bool) -> (bool, bool) {
        let a = self.a.object.quiesce_io_requests(pass_thru);
        self.pump();
        let b = self.b.object.quiesce_io_requests(pass_thru);
        self.pump();
        (a, b)
    }

    pub fn unquiesce_step(&mut self) -> (bool, bool) {
        let a = self.a.object.unquiesce_io_requests();
        self.pump();
        let b = self.b.object.unquiesce_io_requests();
        self.pump();
        (a, b)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata_memory::{ClusteredFlags, QuiesceState};

    #[test]
    fn link_down_stops_delivery() {
        let mut cluster = SimCluster::pair(Default::default()).unwrap();
        cluster.join();
        assert!(cluster.a.object.is_peer_clustered_flag_set(ClusteredFlags::JOINED));

        cluster.b.metadata.set_cmi_up(false);
        cluster.b.object.set_quiesce_hold();
        cluster.pump();
        assert!(!cluster.a.object.is_peer_clustered_flag_set(ClusteredFlags::QUIESCE_HOLD));

        cluster.b.metadata.set_cmi_up(true);
        cluster.b.object.clear_quiesce_hold();
        cluster.b.object.set_quiesce_hold();
        cluster.pump();
        assert!(cluster.a.object.is_peer_clustered_flag_set(ClusteredFlags::QUIESCE_HOLD));
    }

    #[test]
    fn paired_quiesce_and_unquiesce() {
        let mut cluster = SimCluster::pair(Default::default()).unwrap();
        cluster.join();

        let mut rounds = 0;
        while cluster.quiesce_step(false) != (true, true) {
            rounds += 1;
            assert!(rounds < 10, "quiesce did not converge");
        }
        assert_eq!(cluster.a.object.quiesce_state(), QuiesceState::Complete);
        assert_eq!(cluster.b.object.peer_quiesce_state(), QuiesceState::Complete);

        let mut rounds = 0;
        while cluster.unquiesce_step() != (true, true) {
            rounds += 1;
            assert!(rounds < 10, "unquiesce did not converge");
        }
        assert_eq!(cluster.a.object.quiesce_state(), QuiesceState::NotStarted);
        assert_eq!(cluster.b.object.quiesce_state(), QuiesceState::NotStarted);
    }

    #[test]
    fn held_transport_queues_new_requests() {
        let sp = SimSp::solo(Default::default()).unwrap();
        sp.transport.hold();
        sp.transport.submit(1);
        sp.transport.submit(2);
        assert_eq!(sp.transport.waiting(), 2);
        assert!(sp.transport.lowest_ready_latency_time().is_some());

        sp.transport.process_io_from_queue().unwrap();
        assert_eq!(sp.transport.waiting(), 0);
        assert_eq!(sp.transport.outstanding_io_count(), 2);
    }
}
