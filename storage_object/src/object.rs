//! The storage object as seen by one SP.

use std::sync::Arc;

use anyhow::Context;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::ObjectId;
use crate::collaborators::{BlockTransport, RaidLibrary};
use crate::config::{ObjectClass, StorageObjectConf};
use crate::handshake::{Outcome, PeerView};
use crate::metadata_memory::{
    self, ClusteredFlags, MetadataMemoryError, MetadataMemorySync, MetadataMemoryUpdate,
    PeerMirror, QuiesceState,
};
use crate::metadata_service::MetadataService;
use crate::nonpaged::NonPagedRecord;
use crate::terminator_queue::TerminatorQueue;

/// State guarded by the object lock.
#[derive(Debug)]
pub struct ObjectState {
    pub memory: MetadataMemorySync,
    /// An unquiesce is owed once the current quiesce is over.
    pub unquiesce_armed: bool,
    /// Quiesce was requested by the user; a later unquiesce is not implied.
    /// Local to this SP.
    pub user_initiated_quiesce: bool,
    /// Highest packet priority seen while quiescing.
    pub resource_priority: u32,
    /// Set until the non-paged record is first persisted.
    pub initial_configuration: bool,
}

/// The ends of the metadata memory link that belong to the CMI transport.
pub struct PeerLink {
    /// Install blocks received from the peer here.
    pub mirror: PeerMirror,
    /// Local blocks waiting to be pushed to the peer.
    pub updates: mpsc::UnboundedReceiver<MetadataMemoryUpdate>,
}

pub struct StorageObject<M> {
    id: ObjectId,
    generation: u64,
    class: ObjectClass,
    number_of_stripes: u64,

    state: Mutex<ObjectState>,
    terminator: TerminatorQueue,
    np_record: Arc<RwLock<NonPagedRecord>>,

    raid: Arc<dyn RaidLibrary>,
    transport: Arc<dyn BlockTransport>,
    metadata: Arc<M>,
}

impl<M: MetadataService> StorageObject<M> {
    /// The metadata service must already serve the object's non-paged record.
    pub fn new(
        conf: &StorageObjectConf,
        raid: Arc<dyn RaidLibrary>,
        transport: Arc<dyn BlockTransport>,
        metadata: Arc<M>,
    ) -> anyhow::Result<(Self, PeerLink)> {
        let np_record = metadata
            .nonpaged_record(conf.object_id)
            .with_context(|| format!("no non-paged record for object {}", conf.object_id))?;
        let (memory, mirror, updates) = metadata_memory::channel(conf.object_id);

        let object = StorageObject {
            id: conf.object_id,
            generation: conf.generation,
            class: conf.class,
            number_of_stripes: conf.number_of_stripes,
            state: Mutex::new(ObjectState {
                memory,
                unquiesce_armed: false,
                user_initiated_quiesce: conf.user_initiated_quiesce,
                resource_priority: 0,
                initial_configuration: true,
            }),
            terminator: TerminatorQueue::default(),
            np_record,
            raid,
            transport,
            metadata,
        };
        Ok((object, PeerLink { mirror, updates }))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn class(&self) -> ObjectClass {
        self.class
    }

    pub fn number_of_stripes(&self) -> u64 {
        self.number_of_stripes
    }

    pub fn terminator_queue(&self) -> &TerminatorQueue {
        &self.terminator
    }

    pub fn raid(&self) -> &dyn RaidLibrary {
        self.raid.as_ref()
    }

    pub fn transport(&self) -> &dyn BlockTransport {
        self.transport.as_ref()
    }

    pub fn metadata(&self) -> &Arc<M> {
        &self.metadata
    }

    pub fn np_record(&self) -> &RwLock<NonPagedRecord> {
        &self.np_record
    }

    /// Take the object lock. Taken before the terminator lock when both are
    /// needed.
    pub fn lock(&self) -> MutexGuard<'_, ObjectState> {
        self.state.lock()
    }

    /// Advertise this SP's instance of the object to the peer.
    pub fn join(&self) {
        if self.lock().memory.set_clustered_flag(ClusteredFlags::JOINED) {
            info!("object {} joined", self.id);
        }
    }

    pub fn peer_view(&self, memory: &MetadataMemorySync) -> PeerView {
        let present = self.metadata.cmi_peer_alive() && self.metadata.is_peer_object_alive(self.id);
        PeerView {
            present,
            joined: present && memory.is_peer_clustered_flag_set(ClusteredFlags::JOINED),
            state: memory.quiesce_state_peer(),
        }
    }

    /// Apply the side effects of a handshake check. The abort gate opens before
    /// the new state is published.
    pub(crate) fn apply_outcome(&self, st: &mut ObjectState, outcome: &Outcome, check: &str) {
        if let Some(local) = outcome.violation {
            error!("critical: {check} check found local quiesce state {local}");
        }
        if outcome.arm_unquiesce {
            st.unquiesce_armed = true;
        }
        if outcome.clear_abort {
            self.metadata.clear_abort(self.id);
        }
        if let Some(state) = outcome.set_local {
            st.memory.set_quiesce_state_local_and_update_peer(state);
        }
    }

    pub fn quiesce_state(&self) -> QuiesceState {
        self.lock().memory.quiesce_state_local()
    }

    pub fn peer_quiesce_state(&self) -> QuiesceState {
        self.lock().memory.quiesce_state_peer()
    }

    pub fn set_clustered_flag(&self, flags: ClusteredFlags) -> bool {
        self.lock().memory.set_clustered_flag(flags)
    }

    pub fn clear_clustered_flag(&self, flags: ClusteredFlags) -> bool {
        self.lock().memory.clear_clustered_flag(flags)
    }

    pub fn is_clustered_flag_set(&self, flags: ClusteredFlags) -> bool {
        self.lock().memory.is_clustered_flag_set(flags)
    }

    pub fn is_peer_clustered_flag_set(&self, flags: ClusteredFlags) -> bool {
        self.lock().memory.is_peer_clustered_flag_set(flags)
    }

    pub fn is_any_peer_clustered_flag_set(&self, flags: ClusteredFlags) -> bool {
        self.lock().memory.is_any_peer_clustered_flag_set(flags)
    }

    /// Ask for quiescing to drain outstanding I/O at the transport.
    pub fn set_quiesce_hold(&self) -> bool {
        self.set_clustered_flag(ClusteredFlags::QUIESCE_HOLD)
    }

    pub fn clear_quiesce_hold(&self) -> bool {
        self.clear_clustered_flag(ClusteredFlags::QUIESCE_HOLD)
    }

    pub fn set_user_initiated_quiesce(&self, on: bool) {
        self.lock().user_initiated_quiesce = on;
    }

    pub fn is_user_initiated_quiesce(&self) -> bool {
        self.lock().user_initiated_quiesce
    }

    pub fn abort_requested(&self) -> bool {
        self.metadata.is_abort_set(self.id)
    }

    pub fn clear_abort(&self) {
        self.metadata.clear_abort(self.id)
    }

    pub fn resource_priority(&self) -> u32 {
        self.lock().resource_priority
    }

    pub fn is_unquiesce_armed(&self) -> bool {
        self.lock().unquiesce_armed
    }

    pub fn is_initial_configuration(&self) -> bool {
        self.lock().initial_configuration
    }

    pub fn lifecycle_state(&self) -> u32 {
        self.lock().memory.lifecycle_state()
    }

    pub fn peer_lifecycle_state(&self) -> Option<u32> {
        self.lock().memory.peer_lifecycle_state()
    }

    pub fn set_lifecycle_state(&self, state: u32) {
        self.lock().memory.set_lifecycle_state(state)
    }

    pub fn power_save_state(&self) -> u32 {
        self.lock().memory.power_save_state()
    }

    pub fn peer_power_save_state(&self) -> Option<u32> {
        self.lock().memory.peer_power_save_state()
    }

    pub fn set_power_save_state(&self, state: u32) {
        self.lock().memory.set_power_save_state(state)
    }

    pub fn last_io_time(&self) -> u64 {
        self.lock().memory.last_io_time()
    }

    pub fn peer_last_io_time(&self) -> Option<u64> {
        self.lock().memory.peer_last_io_time()
    }

    pub fn set_last_io_time(&self, time: u64) {
        self.lock().memory.set_last_io_time(time)
    }

    pub fn metadata_memory_read(
        &self,
        is_peer: bool,
        buf: &mut [u8],
    ) -> Result<usize, MetadataMemoryError> {
        self.lock().memory.read(is_peer, buf)
    }

    pub fn metadata_memory_update(
        &self,
        buffer: &[u8],
        mask: &[u8],
        offset: usize,
        size: usize,
    ) -> Result<(), MetadataMemoryError> {
        self.lock()
            .memory
            .update(buffer, mask, offset, size)
            .inspect_err(|e| error!("metadata memory update of {}: {e}", self.id))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimSp;

    #[test]
    fn peer_view_needs_link_and_joined_flag() {
        let mut cluster = crate::sim::SimCluster::pair(Default::default()).unwrap();
        let a = Arc::clone(&cluster.a.object);

        let view = a.peer_view(&a.lock().memory);
        assert!(view.present);
        assert!(!view.joined);

        cluster.b.object.join();
        cluster.pump();
        assert!(a.peer_view(&a.lock().memory).joined);

        cluster.a.metadata.set_cmi_up(false);
        let view = a.peer_view(&a.lock().memory);
        assert!(!view.present);
        assert!(!view.joined);
    }

    #[test]
    fn flag_helpers() {
        let sp = SimSp::solo(Default::default()).unwrap();
        let obj = &sp.object;
        assert!(obj.set_quiesce_hold());
        assert!(!obj.set_quiesce_hold());
        assert!(obj.is_clustered_flag_set(ClusteredFlags::QUIESCE_HOLD));
        assert!(obj.clear_quiesce_hold());

        // user-initiated quiesce stays off the wire
        let before = obj.lock().memory.local().to_wire();
        obj.set_user_initiated_quiesce(true);
        assert!(obj.is_user_initiated_quiesce());
        assert_eq!(obj.lock().memory.local().to_wire(), before);
        obj.set_user_initiated_quiesce(false);
        assert!(!obj.is_user_initiated_quiesce());

        obj.set_lifecycle_state(4);
        obj.set_power_save_state(1);
        let mut buf = [0u8; 16];
        assert_eq!(obj.metadata_memory_read(false, &mut buf).unwrap(), 16);
        assert_eq!(u32::from_le_bytes(buf[8..12].try_into().unwrap()), 4);
        assert!(obj.metadata_memory_read(true, &mut buf).is_err());
        assert!(obj.is_initial_configuration());
    }
}
