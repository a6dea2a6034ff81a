//! Interfaces of the layers this crate drives but does not own: the RAID
//! library that executes IOTS, the block transport server that admits new I/O
//! into the object, and the inter-SP link.

use std::collections::VecDeque;
use std::time::Duration;

use crate::metadata_memory::MetadataMemoryUpdate;
use crate::terminator_queue::{Iots, IotsRef, IotsState, RestartQueue};

/// RAID library operations on individual IOTS.
///
/// Every method taking an [`IotsState`] is called with that IOTS locked.
pub trait RaidLibrary: Send + Sync {
    /// The IOTS is a metadata sub-request with a master packet of its own.
    fn is_metadata_request(&self, iots: &Iots) -> bool;

    /// Try to park the IOTS in place. Returns whether it is now quiesced.
    fn quiesce_with_lock(&self, iots: &Iots, state: &mut IotsState) -> anyhow::Result<bool>;

    /// Queue whatever parts of the IOTS were parked while quiescing.
    fn get_quiesced_ts_to_restart(
        &self,
        iots: &IotsRef,
        state: &mut IotsState,
        restart: &mut RestartQueue,
    );

    /// Cancel a background operation that is still in the library.
    fn abort_monitor_op(&self, iots: &Iots, state: &mut IotsState) -> anyhow::Result<()>;

    /// Resume everything on `queue`. Returns how many entries were restarted.
    fn restart_common_queue(&self, queue: RestartQueue) -> usize;
}

/// Requests admitted by the block transport server but not yet started.
#[derive(Debug, Default)]
pub struct TransportQueue {
    /// Requests in flight below the transport server.
    pub outstanding_io: u32,
    /// New requests are queued instead of started.
    pub held: bool,
    /// Requests waiting for the hold to be lifted, with their arrival time.
    pub waiting: VecDeque<(u64, std::time::Instant)>,
}

/// The block transport server in front of the object.
pub trait BlockTransport: Send + Sync {
    /// Lock over the transport queue. When taken together with the terminator
    /// lock it must be taken second; see [`crate::terminator_queue::TerminatorGuard`].
    fn queue_lock(&self) -> &parking_lot::Mutex<TransportQueue>;

    fn hold(&self) {
        self.queue_lock().lock().held = true;
    }

    fn is_hold_set(&self) -> bool {
        self.queue_lock().lock().held
    }

    fn outstanding_io_count(&self) -> u32 {
        self.queue_lock().lock().outstanding_io
    }

    /// Lift the hold and start the queued requests.
    fn process_io_from_queue(&self) -> anyhow::Result<()>;

    /// How long the oldest queued request has been waiting.
    fn lowest_ready_latency_time(&self) -> Option<Duration> {
        self.queue_lock()
            .lock()
            .waiting
            .front()
            .map(|(_, since)| since.elapsed())
    }
}

/// Inter-SP messaging: delivers our metadata memory block to the peer.
pub trait CmiTransport: Send + Sync {
    fn push_metadata_memory(&self, update: &MetadataMemoryUpdate) -> anyhow::Result<()>;
}
