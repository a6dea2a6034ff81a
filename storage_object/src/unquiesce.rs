//! Unquiescing: agree with the peer, then restart everything parked while the
//! object was quiesced and lift the transport hold.

use tracing::{error, info, instrument, warn};

use crate::handshake;
use crate::metadata_memory::{ClusteredFlags, QuiesceState};
use crate::metadata_service::MetadataService;
use crate::object::StorageObject;

impl<M: MetadataService> StorageObject<M> {
    /// Run one step of unquiescing. Returns true once I/O has been restarted.
    ///
    /// Calling it again after it returned true restarts nothing twice: requests
    /// already handed back to the library are `NotUsed` or running.
    #[instrument(skip_all, fields(object_id = %self.id()))]
    pub fn unquiesce_io_requests(&self) -> bool {
        {
            let mut st = self.lock();
            let view = self.peer_view(&st.memory);
            if view.joined && st.memory.is_peer_clustered_flag_set(ClusteredFlags::QUIESCING) {
                info!("peer is still quiescing, waiting");
                return false;
            }
            st.memory.clear_clustered_flag(ClusteredFlags::QUIESCE_HOLD);

            let local = st.memory.quiesce_state_local();
            let outcome = handshake::unquiesce_check(local, &view);
            if local == QuiesceState::NotStarted {
                warn!("unquiesce requested but object is already unquiesced");
            }
            self.apply_outcome(&mut st, &outcome, "unquiesce");
            if !outcome.proceeds() {
                return false;
            }
            st.resource_priority = 0;
        }

        let restart_io = self.metadata().restart_io(self.id());

        let restarted = {
            let mut st = self.lock();
            let guard = self.terminator_queue().lock();
            // cleared first so restarted requests do not see a quiesced object
            st.memory.clear_clustered_flag(ClusteredFlags::QUIESCED);
            let (restart, counts) = guard.collect_restarts(self.raid());
            drop(guard);
            drop(st);

            let queued = restart.len();
            let restarted = self.raid().restart_common_queue(restart);
            info!(
                "restarting {queued} entries of {} queued requests, {} flagged for full restart, {restarted} restarted",
                counts.found, counts.iots
            );
            restarted
        };

        if let Err(status) = restart_io {
            error!("metadata restart of I/O failed: {status}");
        }

        if let Err(e) = self.transport().process_io_from_queue() {
            error!("failed to resume queued transport I/O: {e:#}");
        }

        let mut st = self.lock();
        st.memory
            .set_quiesce_state_local_and_update_peer(QuiesceState::NotStarted);
        st.unquiesce_armed = false;
        info!("object unquiesced, {restarted} requests restarted");
        true
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::collaborators::BlockTransport;
    use crate::error::MetadataStatus;
    use crate::sim::{SimCluster, SimSp};
    use crate::terminator_queue::{Iots, IotsId, IotsStatus};

    use super::*;

    fn quiesce_solo(sp: &SimSp) {
        assert!(!sp.object.quiesce_io_requests(false));
        assert!(sp.object.quiesce_io_requests(false));
    }

    #[test]
    fn solo_round_trip() {
        let sp = SimSp::solo(Default::default()).unwrap();
        let obj = &sp.object;
        obj.set_quiesce_hold();
        quiesce_solo(&sp);
        assert!(sp.transport.is_hold_set());

        assert!(obj.unquiesce_io_requests());
        assert_eq!(obj.quiesce_state(), QuiesceState::NotStarted);
        assert!(!obj.is_clustered_flag_set(ClusteredFlags::QUIESCE_HOLD));
        assert!(!obj.is_quiesced());
        assert!(!obj.is_unquiesce_armed());
        assert!(!sp.transport.is_hold_set());
        assert_eq!(sp.metadata.restart_io_calls(), 1);
    }

    #[test]
    fn restarts_parked_requests_once() {
        let sp = SimSp::solo(Default::default()).unwrap();
        let obj = &sp.object;
        let parked = Iots::new(IotsId(1), IotsStatus::AtLibrary).with_priority(5);
        {
            let mut s = parked.lock();
            s.quiesced = true;
            s.quiesced_siots = 2;
        }
        obj.terminator_queue().push(Arc::new(parked));
        obj.terminator_queue()
            .push(Arc::new(Iots::new(IotsId(2), IotsStatus::NotStartedToLibrary)));
        sp.transport.set_outstanding(2);

        quiesce_solo(&sp);
        assert_eq!(obj.resource_priority(), 5);

        assert!(obj.unquiesce_io_requests());
        assert_eq!(obj.resource_priority(), 0);
        assert_eq!(sp.raid.restarted(), vec![IotsId(1), IotsId(2)]);

        // second call is harmless
        assert!(obj.unquiesce_io_requests());
        assert_eq!(sp.raid.restarted(), vec![IotsId(1), IotsId(2)]);
        assert_eq!(obj.quiesce_state(), QuiesceState::NotStarted);
    }

    #[test]
    fn restart_io_failure_is_absorbed() {
        let sp = SimSp::solo(Default::default()).unwrap();
        quiesce_solo(&sp);
        sp.metadata.faults().restart_io = Some(MetadataStatus::Failure);
        sp.transport.fail_process(true);

        assert!(sp.object.unquiesce_io_requests());
        assert_eq!(sp.object.quiesce_state(), QuiesceState::NotStarted);
    }

    #[test]
    fn unquiesce_from_ready_is_a_violation() {
        let sp = SimSp::solo(Default::default()).unwrap();
        assert!(!sp.object.quiesce_io_requests(false));
        assert_eq!(sp.object.quiesce_state(), QuiesceState::Ready);

        assert!(!sp.object.unquiesce_io_requests());
        assert_eq!(sp.object.quiesce_state(), QuiesceState::Ready);
        assert_eq!(sp.metadata.restart_io_calls(), 0);
    }

    #[test]
    fn waits_for_quiescing_peer() {
        let mut cluster = SimCluster::pair(Default::default()).unwrap();
        cluster.join();
        let (a, b) = (Arc::clone(&cluster.a.object), Arc::clone(&cluster.b.object));

        b.set_clustered_flag(ClusteredFlags::QUIESCING);
        cluster.pump();
        assert!(!a.unquiesce_io_requests());
        assert_eq!(cluster.a.metadata.restart_io_calls(), 0);

        b.clear_clustered_flag(ClusteredFlags::QUIESCING);
        cluster.pump();
        assert!(a.unquiesce_io_requests());
    }

    #[test]
    fn abort_gate_opens_before_unquiesce_ready() {
        let sp = SimSp::solo(Default::default()).unwrap();
        quiesce_solo(&sp);
        sp.metadata.raise_abort(sp.object.id());
        assert!(sp.object.abort_requested());

        assert!(sp.object.unquiesce_io_requests());
        assert!(!sp.object.abort_requested());
    }
}
