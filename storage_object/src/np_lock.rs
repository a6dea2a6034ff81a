//! Distributed lock over the non-paged metadata.
//!
//! The last stripe of the object is reserved for it and never covers user
//! data. Both SPs take it before a write+persist sequence of the NP record.

use std::sync::Arc;

use tracing::{debug, error};

use crate::ObjectId;
use crate::error::{Completion, NpError, PacketStatus};
use crate::metadata_service::{MetadataService, StripeLockOp, StripeLockRequest};
use crate::object::StorageObject;

/// Held NP lock.
///
/// Call [`NpLockGuard::release`]. A guard dropped without it, e.g. because the
/// owning future was cancelled, releases the lock from a spawned task.
pub struct NpLockGuard<M: MetadataService> {
    metadata: Arc<M>,
    object_id: ObjectId,
    stripe: u64,
    count: u64,
    reserved_stripe: u64,
    released: bool,
}

impl<M: MetadataService> NpLockGuard<M> {
    pub fn stripe(&self) -> u64 {
        self.stripe
    }

    fn unlock_request(&self) -> StripeLockRequest {
        if self.stripe != self.reserved_stripe || self.count != 1 {
            error!(
                "np lock release: stripe {}+{} is not the reserved stripe {}",
                self.stripe, self.count, self.reserved_stripe
            );
        }
        StripeLockRequest {
            op: StripeLockOp::WriteUnlock,
            stripe: self.stripe,
            count: self.count,
        }
    }

    /// Release the lock. The guard is gone whatever the outcome.
    pub async fn release(mut self) -> Completion {
        let request = self.unlock_request();
        let completion = self.metadata.stripe_lock(self.object_id, request).await;
        self.released = true;
        if !completion.is_ok() {
            error!(
                "np lock release failed, packet {} metadata {}",
                completion.packet, completion.metadata
            );
        }
        completion
    }
}

impl<M: MetadataService> Drop for NpLockGuard<M> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let request = self.unlock_request();
        let metadata = Arc::clone(&self.metadata);
        let object_id = self.object_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("np lock of {object_id} dropped while held, releasing in background");
                handle.spawn(async move {
                    let completion = metadata.stripe_lock(object_id, request).await;
                    if !completion.is_ok() {
                        error!("background np lock release of {object_id} failed");
                    }
                });
            }
            Err(_) => error!("critical: np lock of {object_id} dropped outside of a runtime"),
        }
    }
}

impl<M: MetadataService> StorageObject<M> {
    /// Write-lock the reserved NP stripe. On failure nothing is held.
    pub async fn acquire_np_lock(&self) -> Result<NpLockGuard<M>, NpError> {
        let Some(reserved_stripe) = self.number_of_stripes().checked_sub(1) else {
            error!("object {} has no stripes to lock", self.id());
            return Err(NpError::LockNotAcquired(PacketStatus::GenericFailure));
        };
        let request = StripeLockRequest {
            op: StripeLockOp::WriteLock,
            stripe: reserved_stripe,
            count: 1,
        };
        let completion = self.metadata().stripe_lock(self.id(), request).await;
        let status = completion.status();
        if !status.is_ok() {
            error!(
                "np lock failed, packet {} metadata {}",
                completion.packet, completion.metadata
            );
            return Err(NpError::LockNotAcquired(status));
        }
        Ok(NpLockGuard {
            metadata: Arc::clone(self.metadata()),
            object_id: self.id(),
            stripe: reserved_stripe,
            count: 1,
            reserved_stripe,
            released: false,
        })
    }
}
