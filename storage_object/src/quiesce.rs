//! Quiescing: stop new I/O, wait for in-flight I/O to park, and agree with the
//! peer that the object is quiesced.
//!
//! [`StorageObject::quiesce_io_requests`] is called once per monitor cycle and
//! never blocks. `false` means "not yet, call again".

use tracing::{info, instrument};

use crate::handshake;
use crate::metadata_memory::ClusteredFlags;
use crate::metadata_service::MetadataService;
use crate::object::StorageObject;
use crate::terminator_queue::ScanResult;

impl<M: MetadataService> StorageObject<M> {
    /// Run one step of quiescing. Returns true once the object is quiesced.
    ///
    /// `pass_thru` accepts an empty transport as quiesced even if requests
    /// are still parked on the terminator queue.
    #[instrument(skip_all, fields(object_id = %self.id()))]
    pub fn quiesce_io_requests(&self, pass_thru: bool) -> bool {
        if !self.quiesce_start_check() {
            return false;
        }

        let drain = {
            let mut st = self.lock();
            let view = self.peer_view(&st.memory);
            let mut drain = handshake::should_quiesce_drain(
                st.memory.is_clustered_flag_set(ClusteredFlags::QUIESCE_HOLD),
                &view,
                st.memory.is_peer_clustered_flag_set(ClusteredFlags::QUIESCE_HOLD),
            );
            if drain && self.abort_requested() {
                info!("abort requested, not draining");
                drain = false;
                st.memory.clear_clustered_flag(ClusteredFlags::QUIESCE_HOLD);
            }
            drain
        };

        let mut io_quiesced = false;
        if drain {
            let transport = self.transport();
            if !transport.is_hold_set() {
                transport.hold();
            }
            let outstanding_io = transport.outstanding_io_count();
            io_quiesced = outstanding_io == 0;
            if !io_quiesced {
                let quiesced_io = self.terminator_queue().count_quiesced_ios();
                if quiesced_io == 0 {
                    info!("waiting for {outstanding_io} requests to drain");
                    return false;
                }
                // The library already parked some requests: quiesce them in
                // place from the next cycle on.
                info!("{quiesced_io} quiesced requests found, clearing quiesce hold");
                self.clear_quiesce_hold();
            } else {
                info!("outstanding requests drained");
            }
        }

        let mut st = self.lock();
        if st.memory.set_clustered_flag(ClusteredFlags::QUIESCING) {
            info!("marking object quiescing");
        }

        if !drain {
            let transport = self.transport();
            if !transport.is_hold_set() {
                transport.hold();
            }
            let scan = self.scan_terminator_queue(pass_thru);
            st.resource_priority = st.resource_priority.max(scan.max_priority);
            io_quiesced = scan.quiesced;
        }

        if !io_quiesced {
            info!("object not quiesced, transport held: {}", self.transport().is_hold_set());
            return false;
        }

        // A peer that stopped draining takes us out of drain as well.
        let view = self.peer_view(&st.memory);
        if st.memory.is_clustered_flag_set(ClusteredFlags::QUIESCE_HOLD)
            && view.present
            && !st.memory.is_peer_clustered_flag_set(ClusteredFlags::QUIESCE_HOLD)
        {
            info!("peer cleared quiesce hold");
            st.memory.clear_clustered_flag(ClusteredFlags::QUIESCE_HOLD);
        }

        let outcome = handshake::complete_check(st.memory.quiesce_state_local(), &view);
        self.apply_outcome(&mut st, &outcome, "quiesce complete");
        if !outcome.proceeds() {
            return false;
        }

        st.memory.clear_clustered_flag(ClusteredFlags::QUIESCING);
        st.memory.set_clustered_flag(ClusteredFlags::QUIESCED);
        info!("object quiesced");
        true
    }

    /// Publish that we want to quiesce and check the peer agrees.
    fn quiesce_start_check(&self) -> bool {
        let mut st = self.lock();
        let view = self.peer_view(&st.memory);
        let outcome = handshake::start_check(
            st.memory.quiesce_state_local(),
            &view,
            st.user_initiated_quiesce,
        );
        self.apply_outcome(&mut st, &outcome, "quiesce start");
        outcome.proceeds()
    }

    /// Scan the terminator queue. The caller holds the object lock.
    fn scan_terminator_queue(&self, pass_thru: bool) -> ScanResult {
        self.terminator_queue().scan_quiesce(
            self.raid(),
            self.transport(),
            self.class().issues_metadata_requests(),
            pass_thru,
        )
    }

    /// Whether quiescing has been started and not yet undone.
    pub fn is_quiescing(&self) -> bool {
        self.is_clustered_flag_set(ClusteredFlags::QUIESCING)
    }

    pub fn is_quiesced(&self) -> bool {
        self.is_clustered_flag_set(ClusteredFlags::QUIESCED)
    }

    /// Cancel background requests that are still in the library, e.g. when the
    /// abort gate is raised while quiescing.
    pub fn abort_monitor_ops(&self) -> anyhow::Result<()> {
        self.terminator_queue().abort_monitor_ops(self.raid())
    }
}
