//! The per-object monitor task.
//!
//! Runs one quiesce or unquiesce step per monitor cycle, follows the peer when
//! it starts either handshake, and pushes queued metadata memory over the
//! inter-SP link. It exits when its cancellation token fires.
//!
//! Steps never block, so the monitor must not either: nothing here waits on
//! the peer other than by trying again on the next tick.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::collaborators::CmiTransport;
use crate::metadata_memory::{ClusteredFlags, MetadataMemoryUpdate, QuiesceState};
use crate::metadata_service::MetadataService;
use crate::object::StorageObject;

/// What the monitor is currently driving the object towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Idle,
    Quiesce { pass_thru: bool },
    Unquiesce,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub target: Target,
    pub cycles: u64,
    pub quiesce_state: QuiesceState,
    pub peer_quiesce_state: QuiesceState,
    pub quiescing: bool,
    pub quiesced: bool,
    pub unquiesce_armed: bool,
    pub resource_priority: u32,
    /// Age of the oldest request held at the transport server.
    #[serde(with = "humantime_serde")]
    pub queued_io_latency: Option<Duration>,
}

pub enum MonitorCtlMessage {
    /// Quiesce the object; answered once it is quiesced.
    Quiesce {
        pass_thru: bool,
        done: oneshot::Sender<()>,
    },
    /// Unquiesce the object; answered once I/O is restarted.
    Unquiesce(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<MonitorSnapshot>),
}

impl std::fmt::Debug for MonitorCtlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorCtlMessage::Quiesce { pass_thru, .. } => {
                write!(f, "Quiesce {{ pass_thru: {pass_thru} }}")
            }
            MonitorCtlMessage::Unquiesce(_) => write!(f, "Unquiesce"),
            MonitorCtlMessage::Snapshot(_) => write!(f, "Snapshot"),
        }
    }
}

/// Handle for sending requests to a running monitor.
pub struct ObjectMonitorCtl {
    monitor_tx: mpsc::UnboundedSender<MonitorCtlMessage>,

    // moved out by bootstrap_monitor()
    init_monitor_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<MonitorCtlMessage>>>,
}

impl Default for ObjectMonitorCtl {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectMonitorCtl {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        ObjectMonitorCtl {
            monitor_tx: tx,
            init_monitor_rx: parking_lot::Mutex::new(Some(rx)),
        }
    }

    /// Quiesce and wait until the object is quiesced. Waits indefinitely
    /// while the peer does not agree.
    pub async fn quiesce(&self, pass_thru: bool) -> anyhow::Result<()> {
        let (done, rx) = oneshot::channel();
        self.monitor_tx
            .send(MonitorCtlMessage::Quiesce { pass_thru, done })?;
        rx.await
            .map_err(|_| anyhow::anyhow!("monitor exited before the object was quiesced"))
    }

    pub async fn unquiesce(&self) -> anyhow::Result<()> {
        let (done, rx) = oneshot::channel();
        self.monitor_tx.send(MonitorCtlMessage::Unquiesce(done))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("monitor exited before the object was unquiesced"))
    }

    pub async fn snapshot(&self) -> anyhow::Result<MonitorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.monitor_tx.send(MonitorCtlMessage::Snapshot(tx))?;
        rx.await
            .map_err(|e| anyhow::anyhow!("response read fail: {e:?}"))
    }

    /// Hand out the receiving end. Returns None after the first call.
    pub fn bootstrap_monitor(&self) -> Option<mpsc::UnboundedReceiver<MonitorCtlMessage>> {
        self.init_monitor_rx.lock().take()
    }
}

struct Monitor<M: MetadataService> {
    object: Arc<StorageObject<M>>,
    cmi: Arc<dyn CmiTransport>,
    target: Target,
    /// Requests answered when the current target is reached.
    waiters: Vec<oneshot::Sender<()>>,
    cycles: u64,
}

impl<M: MetadataService> Monitor<M> {
    fn handle_message(&mut self, msg: MonitorCtlMessage) {
        debug!("received {msg:?}");
        match msg {
            MonitorCtlMessage::Quiesce { pass_thru, done } => {
                self.set_target(Target::Quiesce { pass_thru });
                self.waiters.push(done);
            }
            MonitorCtlMessage::Unquiesce(done) => {
                self.set_target(Target::Unquiesce);
                self.waiters.push(done);
            }
            MonitorCtlMessage::Snapshot(tx) => {
                let _ = tx.send(self.snapshot());
            }
        }
    }

    fn set_target(&mut self, target: Target) {
        if self.target == target {
            return;
        }
        if !self.waiters.is_empty() {
            // a later request supersedes the pending one
            warn!(
                "{} requests for {} dropped, now driving {target}",
                self.waiters.len(),
                self.target
            );
            self.waiters.clear();
        }
        info!("monitor target {} -> {target}", self.target);
        self.target = target;
    }

    /// Start the handshake the peer has started.
    fn follow_peer(&mut self) {
        let object = &self.object;
        let (view, local, quiesced) = {
            let st = object.lock();
            (
                object.peer_view(&st.memory),
                st.memory.quiesce_state_local(),
                st.memory.is_clustered_flag_set(ClusteredFlags::QUIESCED),
            )
        };
        if !view.joined {
            return;
        }
        match view.state {
            QuiesceState::Ready | QuiesceState::Complete
                if !quiesced && local == QuiesceState::NotStarted =>
            {
                info!("peer is quiescing, following");
                self.set_target(Target::Quiesce { pass_thru: false });
            }
            QuiesceState::UnquiesceReady if quiesced => {
                info!("peer is unquiescing, following");
                self.set_target(Target::Unquiesce);
            }
            _ => {}
        }
    }

    fn cycle(&mut self) {
        self.cycles += 1;
        if self.target == Target::Idle {
            self.follow_peer();
        }

        let done = match self.target {
            Target::Idle => return,
            Target::Quiesce { pass_thru } => {
                if self.object.is_quiescing() && self.object.abort_requested() {
                    info!("abort raised while quiescing, aborting background operations");
                    if let Err(e) = self.object.abort_monitor_ops() {
                        error!("failed to abort background operations: {e:#}");
                    }
                }
                self.object.quiesce_io_requests(pass_thru)
            }
            Target::Unquiesce => self.object.unquiesce_io_requests(),
        };

        if done {
            info!("{} reached after {} cycles", self.target, self.cycles);
            self.target = match self.target {
                // only a user-initiated quiesce stays in place until asked
                Target::Quiesce { .. } if self.object.is_unquiesce_armed() => {
                    info!("unquiesce armed, unquiescing");
                    Target::Unquiesce
                }
                _ => Target::Idle,
            };
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn push_update(&self, update: &MetadataMemoryUpdate) {
        if let Err(e) = self.cmi.push_metadata_memory(update) {
            error!("failed to push metadata memory to peer: {e:#}");
        }
    }

    fn snapshot(&self) -> MonitorSnapshot {
        let object = &self.object;
        let queued_io_latency = object.transport().lowest_ready_latency_time();
        let st = object.lock();
        MonitorSnapshot {
            target: self.target,
            cycles: self.cycles,
            quiesce_state: st.memory.quiesce_state_local(),
            peer_quiesce_state: st.memory.quiesce_state_peer(),
            quiescing: st.memory.is_clustered_flag_set(ClusteredFlags::QUIESCING),
            quiesced: st.memory.is_clustered_flag_set(ClusteredFlags::QUIESCED),
            unquiesce_armed: st.unquiesce_armed,
            resource_priority: st.resource_priority,
            queued_io_latency,
        }
    }
}

/// Drive `object` until `cancel` fires. `updates` is the object's outbound
/// metadata memory queue; `monitor_rx` comes from
/// [`ObjectMonitorCtl::bootstrap_monitor`].
#[instrument(name = "monitor", skip_all, fields(object_id = %object.id()))]
pub async fn main_task<M: MetadataService>(
    object: Arc<StorageObject<M>>,
    mut updates: mpsc::UnboundedReceiver<MetadataMemoryUpdate>,
    cmi: Arc<dyn CmiTransport>,
    interval: Duration,
    cancel: CancellationToken,
    mut monitor_rx: mpsc::UnboundedReceiver<MonitorCtlMessage>,
) {
    let defer_cancel = cancel.clone();
    scopeguard::defer! {
        if defer_cancel.is_cancelled() {
            info!("monitor task finished");
        } else {
            warn!("monitor task finished prematurely");
        }
    };

    let mut mon = Monitor {
        object,
        cmi,
        target: Target::Idle,
        waiters: Vec::new(),
        cycles: 0,
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut ctl_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                mon.cycle();
            }
            Some(update) = updates.recv() => {
                mon.push_update(&update);
            }
            msg = monitor_rx.recv(), if ctl_open => match msg {
                Some(msg) => mon.handle_message(msg),
                // all handles are gone, keep cycling until cancelled
                None => {
                    debug!("monitor control channel closed");
                    ctl_open = false;
                }
            },
        }
    }

    // last word to the peer
    while let Ok(update) = updates.try_recv() {
        mon.push_update(&update);
    }
    if !mon.waiters.is_empty() {
        warn!("{} requests for {} abandoned", mon.waiters.len(), mon.target);
    }
}
