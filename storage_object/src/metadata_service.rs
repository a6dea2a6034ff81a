//! The metadata/CMI service: peer liveness, the abort gate, non-paged record
//! storage and stripe locks.
//!
//! [`LocalMetadataService`] is a complete in-process implementation. Two of
//! them can be paired to stand in for the two SPs; every non-paged update is
//! then mirrored into the peer's copy of the record.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{error, warn};

use crate::ObjectId;
use crate::control_file::Storage;
use crate::error::{Completion, MetadataStatus, PacketStatus};
use crate::nonpaged::{CheckpointUpdate, NonPagedRecord, NpUpdate};

/// Asynchronous operations on the non-paged record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonPagedOp {
    Update(NpUpdate),
    /// `peer: false` leaves the peer's copy alone.
    Checkpoint { update: CheckpointUpdate, peer: bool },
    /// Persist the whole record and read it back.
    WriteVerify,
    Persist,
    /// The record was persisted; let the peer know.
    PostPersist,
    Init { data_size: usize },
    /// Replace the in-memory record with the persisted one.
    ReadPersist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum StripeLockOp {
    WriteLock,
    WriteUnlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeLockRequest {
    pub op: StripeLockOp,
    pub stripe: u64,
    pub count: u64,
}

pub trait MetadataService: Send + Sync + 'static {
    /// The inter-SP link is up.
    fn cmi_peer_alive(&self) -> bool;

    /// The peer SP has an instance of this object.
    fn is_peer_object_alive(&self, object_id: ObjectId) -> bool;

    /// Metadata requests of this object are being rejected.
    fn is_abort_set(&self, object_id: ObjectId) -> bool;

    fn clear_abort(&self, object_id: ObjectId);

    /// Resume metadata I/O held while the object was quiesced.
    fn restart_io(&self, object_id: ObjectId) -> Result<(), MetadataStatus>;

    fn nonpaged_record(&self, object_id: ObjectId) -> Option<Arc<RwLock<NonPagedRecord>>>;

    fn nonpaged_operation(
        &self,
        object_id: ObjectId,
        op: NonPagedOp,
    ) -> impl Future<Output = Completion> + Send;

    /// Lock requests wait until the stripe is free.
    fn stripe_lock(
        &self,
        object_id: ObjectId,
        request: StripeLockRequest,
    ) -> impl Future<Output = Completion> + Send;
}

/// Stripe write locks shared by both SPs.
#[derive(Debug, Default)]
pub struct StripeLockTable {
    held: Mutex<HashSet<(ObjectId, u64)>>,
    released: Notify,
}

impl StripeLockTable {
    pub async fn lock(&self, object_id: ObjectId, stripe: u64) {
        loop {
            // registered before the check so a release in between is not lost
            let released = self.released.notified();
            if self.held.lock().insert((object_id, stripe)) {
                return;
            }
            released.await;
        }
    }

    /// Returns false if the stripe was not locked.
    pub fn unlock(&self, object_id: ObjectId, stripe: u64) -> bool {
        let removed = self.held.lock().remove(&(object_id, stripe));
        self.released.notify_waiters();
        removed
    }

    pub fn is_locked(&self, object_id: ObjectId, stripe: u64) -> bool {
        self.held.lock().contains(&(object_id, stripe))
    }
}

/// Failures to report instead of running the operation.
#[derive(Debug, Default)]
pub struct Faults {
    /// Every stripe lock request fails with this status.
    pub stripe_lock: Option<PacketStatus>,
    /// The next non-paged operation completes with this.
    pub next_nonpaged: Option<Completion>,
    pub restart_io: Option<MetadataStatus>,
    /// The next post-persist notification completes with this.
    pub post_persist: Option<Completion>,
}

struct NonPagedEntry<S> {
    record: Arc<RwLock<NonPagedRecord>>,
    storage: tokio::sync::Mutex<S>,
}

pub struct LocalMetadataService<S> {
    objects: Mutex<HashMap<ObjectId, Arc<NonPagedEntry<S>>>>,
    peer: Mutex<Weak<LocalMetadataService<S>>>,
    cmi_up: AtomicBool,
    aborted: Mutex<HashSet<ObjectId>>,
    stripe_locks: Arc<StripeLockTable>,
    faults: Mutex<Faults>,
    restart_io_calls: AtomicU64,
}

impl<S: Storage + 'static> LocalMetadataService<S> {
    /// Service of a single SP without a peer.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_lock_table(Arc::default()))
    }

    /// Services of two SPs sharing stripe locks, with the link up.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let locks = Arc::new(StripeLockTable::default());
        let a = Arc::new(Self::with_lock_table(Arc::clone(&locks)));
        let b = Arc::new(Self::with_lock_table(locks));
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        (a, b)
    }

    fn with_lock_table(stripe_locks: Arc<StripeLockTable>) -> Self {
        LocalMetadataService {
            objects: Mutex::new(HashMap::new()),
            peer: Mutex::new(Weak::new()),
            cmi_up: AtomicBool::new(true),
            aborted: Mutex::new(HashSet::new()),
            stripe_locks,
            faults: Mutex::new(Faults::default()),
            restart_io_calls: AtomicU64::new(0),
        }
    }

    /// Serve `object_id`, seeding the in-memory record from `storage`.
    pub fn register(&self, object_id: ObjectId, storage: S) -> Arc<RwLock<NonPagedRecord>> {
        let record = Arc::new(RwLock::new((*storage).clone()));
        let entry = NonPagedEntry {
            record: Arc::clone(&record),
            storage: tokio::sync::Mutex::new(storage),
        };
        self.objects.lock().insert(object_id, Arc::new(entry));
        record
    }

    /// The object is gone from this SP.
    pub fn unregister(&self, object_id: ObjectId) {
        self.objects.lock().remove(&object_id);
    }

    pub fn set_cmi_up(&self, up: bool) {
        self.cmi_up.store(up, Ordering::Relaxed);
    }

    pub fn raise_abort(&self, object_id: ObjectId) {
        self.aborted.lock().insert(object_id);
    }

    pub fn faults(&self) -> parking_lot::MutexGuard<'_, Faults> {
        self.faults.lock()
    }

    pub fn stripe_locks(&self) -> &StripeLockTable {
        &self.stripe_locks
    }

    pub fn restart_io_calls(&self) -> u64 {
        self.restart_io_calls.load(Ordering::Relaxed)
    }

    fn entry(&self, object_id: ObjectId) -> Option<Arc<NonPagedEntry<S>>> {
        self.objects.lock().get(&object_id).cloned()
    }

    fn live_peer(&self) -> Option<Arc<Self>> {
        if !self.cmi_up.load(Ordering::Relaxed) {
            return None;
        }
        self.peer.lock().upgrade()
    }

    /// Run `f` on the peer's copy of the record, if there is one.
    fn mirror_to_peer<R>(
        &self,
        object_id: ObjectId,
        f: impl FnOnce(&mut NonPagedRecord) -> Result<R, crate::error::NpError>,
    ) {
        let Some(entry) = self.live_peer().and_then(|peer| peer.entry(object_id)) else {
            return;
        };
        if let Err(e) = f(&mut entry.record.write()) {
            warn!("peer copy of non-paged record of {object_id} not updated: {e}");
        }
    }

    async fn persist(entry: &NonPagedEntry<S>) -> Result<NonPagedRecord, MetadataStatus> {
        let snapshot = entry.record.read().clone();
        let mut storage = entry.storage.lock().await;
        match storage.persist(&snapshot).await {
            Ok(()) => Ok(snapshot),
            Err(e) => {
                error!("failed to persist non-paged record: {e:#}");
                Err(MetadataStatus::IoUncorrectable)
            }
        }
    }
}

impl<S: Storage + 'static> MetadataService for LocalMetadataService<S> {
    fn cmi_peer_alive(&self) -> bool {
        self.live_peer().is_some()
    }

    fn is_peer_object_alive(&self, object_id: ObjectId) -> bool {
        self.live_peer()
            .is_some_and(|peer| peer.entry(object_id).is_some())
    }

    fn is_abort_set(&self, object_id: ObjectId) -> bool {
        self.aborted.lock().contains(&object_id)
    }

    fn clear_abort(&self, object_id: ObjectId) {
        self.aborted.lock().remove(&object_id);
    }

    fn restart_io(&self, _object_id: ObjectId) -> Result<(), MetadataStatus> {
        self.restart_io_calls.fetch_add(1, Ordering::Relaxed);
        match self.faults.lock().restart_io {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn nonpaged_record(&self, object_id: ObjectId) -> Option<Arc<RwLock<NonPagedRecord>>> {
        self.entry(object_id).map(|e| Arc::clone(&e.record))
    }

    async fn nonpaged_operation(&self, object_id: ObjectId, op: NonPagedOp) -> Completion {
        let fault = self.faults.lock().next_nonpaged.take();
        if let Some(completion) = fault {
            return completion;
        }
        let Some(entry) = self.entry(object_id) else {
            return Completion::packet_failure(PacketStatus::GenericFailure);
        };

        match op {
            NonPagedOp::Update(update) => {
                let applied = entry.record.write().apply(&update);
                if let Err(e) = applied {
                    error!("non-paged update of {object_id} rejected: {e}");
                    return Completion::metadata_failure(MetadataStatus::Failure);
                }
                self.mirror_to_peer(object_id, |r| r.apply(&update));
                Completion::OK
            }
            NonPagedOp::Checkpoint { update, peer } => {
                let applied = entry.record.write().apply_checkpoint(&update);
                if let Err(e) = applied {
                    error!("checkpoint update of {object_id} rejected: {e}");
                    return Completion::metadata_failure(MetadataStatus::Failure);
                }
                if peer {
                    self.mirror_to_peer(object_id, |r| r.apply_checkpoint(&update));
                }
                Completion::OK
            }
            NonPagedOp::Persist => match Self::persist(&entry).await {
                Ok(_) => Completion::OK,
                Err(status) => Completion::metadata_failure(status),
            },
            NonPagedOp::WriteVerify => match Self::persist(&entry).await {
                Ok(written) => {
                    let storage = entry.storage.lock().await;
                    match storage.read_back().await {
                        Ok(read) if read == written => Completion::OK,
                        Ok(_) => {
                            error!("non-paged record of {object_id} read back differs from what was written");
                            Completion::metadata_failure(MetadataStatus::IoUncorrectable)
                        }
                        Err(e) => {
                            error!("failed to read back non-paged record of {object_id}: {e:#}");
                            Completion::metadata_failure(MetadataStatus::IoUncorrectable)
                        }
                    }
                }
                Err(status) => Completion::metadata_failure(status),
            },
            NonPagedOp::PostPersist => {
                let fault = self.faults.lock().post_persist.take();
                if let Some(completion) = fault {
                    return completion;
                }
                let persisted = entry.record.read().clone();
                self.mirror_to_peer(object_id, |r| {
                    *r = persisted;
                    Ok(())
                });
                Completion::OK
            }
            NonPagedOp::Init { data_size } => {
                entry.record.write().resize(data_size);
                Completion::OK
            }
            NonPagedOp::ReadPersist => {
                let persisted = (**entry.storage.lock().await).clone();
                *entry.record.write() = persisted;
                Completion::OK
            }
        }
    }

    async fn stripe_lock(&self, object_id: ObjectId, request: StripeLockRequest) -> Completion {
        match request.op {
            StripeLockOp::WriteLock => {
                let fault = self.faults.lock().stripe_lock;
                if let Some(status) = fault {
                    return Completion::packet_failure(status);
                }
                self.stripe_locks.lock(object_id, request.stripe).await;
                Completion::OK
            }
            StripeLockOp::WriteUnlock => {
                if self.stripe_locks.unlock(object_id, request.stripe) {
                    Completion::OK
                } else {
                    warn!("unlock of stripe {} of {object_id} which is not locked", request.stripe);
                    Completion::metadata_failure(MetadataStatus::Failure)
                }
            }
        }
    }
}
