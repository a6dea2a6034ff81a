//! Non-paged metadata updates, persistence and the NP lock across two SPs.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use storage_object::ObjectId;
use storage_object::config::StorageObjectConf;
use storage_object::control_file::{FileStorage, Storage};
use storage_object::error::{Completion, MetadataStatus, NpError, PacketStatus};
use storage_object::metadata_memory::ClusteredFlags;
use storage_object::nonpaged::{
    BackgroundOperation, MAX_DATA_SIZE, NONPAGED_HEADER_SIZE, NonPagedRecord, NonPagedState,
    WriteVerifyResult,
};
use storage_object::sim::{SimCluster, SimMetadata, SimSp};

const DATA: usize = NONPAGED_HEADER_SIZE;

fn init() {
    utils::logging::init_for_tests();
}

#[tokio::test]
async fn oversized_write_fails_without_mutation() {
    init();
    let sp = SimSp::solo(Default::default()).unwrap();
    let obj = &sp.object;
    let before = obj.np_record().read().clone();

    let payload = vec![0xab; MAX_DATA_SIZE + 1];
    let err = obj.nonpaged_write(DATA, &payload, 1).await.unwrap_err();
    assert!(matches!(err, NpError::PayloadTooLarge { .. }));
    assert_eq!(err.packet_status(), PacketStatus::GenericFailure);

    let err = obj.nonpaged_write_persist(DATA, &payload, 1).await.unwrap_err();
    assert_eq!(err.packet_status(), PacketStatus::GenericFailure);
    assert_eq!(*obj.np_record().read(), before);
    assert!(obj.is_initial_configuration());
}

#[tokio::test]
async fn updates_reach_the_peer_copy() {
    init();
    let cluster = SimCluster::pair(Default::default()).unwrap();
    let (a, b) = (&cluster.a.object, &cluster.b.object);

    a.nonpaged_write(DATA, &[1, 2, 3, 4], 2).await.unwrap();
    a.nonpaged_set_bits(DATA, &[0x80], 1).await.unwrap();
    a.nonpaged_clear_bits(DATA + 1, &[0x02], 1).await.unwrap();
    let expected = [0x81, 0x00, 3, 4, 1, 2, 3, 4];
    assert_eq!(&a.np_record().read().class_data()[..8], &expected);
    assert_eq!(&b.np_record().read().class_data()[..8], &expected);

    // the no-peer checkpoint variant stays local
    a.force_set_checkpoint(DATA + 8, 0, 10).await.unwrap();
    a.incr_checkpoint_no_peer(DATA + 8, 0, 10, 5).await.unwrap();
    assert_eq!(a.np_record().read().read_u64(DATA + 8).unwrap(), 15);
    assert_eq!(b.np_record().read().read_u64(DATA + 8).unwrap(), 10);

    a.set_checkpoint_persist(DATA + 8, DATA + 16, 7).await.unwrap();
    assert_eq!(b.np_record().read().read_u64(DATA + 16).unwrap(), 7);
    assert!(!a.is_initial_configuration());
}

#[tokio::test]
async fn default_metadata_and_state() {
    init();
    let conf = StorageObjectConf {
        object_id: ObjectId(0x42),
        generation: 9,
        ..Default::default()
    };
    let mut cluster = SimCluster::pair(conf).unwrap();
    cluster.join();
    let (a, b) = (Arc::clone(&cluster.a.object), Arc::clone(&cluster.b.object));
    assert!(!a.is_nonpaged_initialized());
    assert!(!a.is_nonpaged_state_valid());

    a.set_default_nonpaged_metadata().await.unwrap();
    assert!(a.is_nonpaged_initialized());
    assert!(!a.is_metadata_initialized());
    assert_eq!(a.nonpaged_state(), NonPagedState::Uninitialized);
    assert!(b.is_nonpaged_initialized());

    // b waits for our record; setting the state tells it through metadata memory
    b.set_clustered_flag(ClusteredFlags::PEER_NONPAGED_REQUEST);
    cluster.pump();
    while cluster.a.updates.try_recv().is_ok() {}
    a.set_nonpaged_metadata_state(NonPagedState::Initialized)
        .await
        .unwrap();
    assert!(a.is_metadata_initialized());
    assert!(cluster.a.updates.try_recv().is_ok());

    // a stale signature is reported, not refused
    a.set_default_nonpaged_metadata().await.unwrap();
    assert_eq!(a.nonpaged_state(), NonPagedState::Uninitialized);
}

#[tokio::test]
async fn failed_post_persist_still_ends_initial_configuration() {
    init();
    let sp = SimSp::solo(Default::default()).unwrap();
    let obj = &sp.object;
    assert!(obj.is_initial_configuration());

    sp.metadata.faults().post_persist =
        Some(Completion::packet_failure(PacketStatus::Failed));
    let err = obj.nonpaged_write_persist(DATA, &[7], 1).await.unwrap_err();
    assert!(matches!(err, NpError::Metadata(_)));
    assert!(!obj.is_initial_configuration());
    // the record itself made it to storage
    obj.nonpaged_read_persist().await.unwrap();
    assert_eq!(obj.np_record().read().class_data()[0], 7);
}

#[tokio::test]
async fn background_operations_toggle() {
    init();
    let sp = SimSp::solo(Default::default()).unwrap();
    let obj = &sp.object;
    let op = BackgroundOperation::ReadWriteVerify;
    assert!(obj.is_background_operation_enabled(op));

    obj.disable_background_operation(op).await.unwrap();
    assert!(!obj.is_background_operation_enabled(op));
    assert!(obj.is_background_operation_enabled(BackgroundOperation::Rebuild));
    assert_eq!(obj.np_record().read().operation_bitmask(), 0x08);

    // repeating is a no-op
    obj.disable_background_operation(op).await.unwrap();
    obj.enable_background_operation(op).await.unwrap();
    assert_eq!(obj.np_record().read().operation_bitmask(), 0);
}

#[tokio::test]
async fn write_verify_outcomes() {
    init();
    let sp = SimSp::solo(Default::default()).unwrap();
    let obj = &sp.object;
    let reserved = obj.number_of_stripes() - 1;

    let ok = obj.nonpaged_write_verify().await;
    assert_eq!(ok, WriteVerifyResult { success: true, retryable: false });
    assert!(!sp.metadata.stripe_locks().is_locked(obj.id(), reserved));

    // lock failure is retryable and leaves nothing held
    sp.metadata.faults().stripe_lock = Some(PacketStatus::Busy);
    let busy = obj.nonpaged_write_verify().await;
    assert_eq!(busy, WriteVerifyResult { success: false, retryable: true });
    assert!(!sp.metadata.stripe_locks().is_locked(obj.id(), reserved));
    sp.metadata.faults().stripe_lock = None;

    sp.metadata.faults().next_nonpaged =
        Some(Completion::metadata_failure(MetadataStatus::IoUncorrectable));
    let bad = obj.nonpaged_write_verify().await;
    assert_eq!(bad, WriteVerifyResult { success: false, retryable: false });
    assert!(!sp.metadata.stripe_locks().is_locked(obj.id(), reserved));
}

/// Acknowledges every persist but never changes what is on the medium.
struct LostWrites {
    cache: NonPagedRecord,
    medium: NonPagedRecord,
}

impl Deref for LostWrites {
    type Target = NonPagedRecord;

    fn deref(&self) -> &NonPagedRecord {
        &self.cache
    }
}

impl Storage for LostWrites {
    async fn persist(&mut self, s: &NonPagedRecord) -> anyhow::Result<()> {
        self.cache = s.clone();
        Ok(())
    }

    async fn read_back(&self) -> anyhow::Result<NonPagedRecord> {
        Ok(self.medium.clone())
    }

    fn last_persist_at(&self) -> Instant {
        Instant::now()
    }
}

#[tokio::test]
async fn write_verify_reads_back_the_medium() {
    init();
    let conf = StorageObjectConf::default();
    let record = NonPagedRecord::new(conf.nonpaged_data_size);
    let storage = LostWrites {
        cache: record.clone(),
        medium: record,
    };
    let sp = SimSp::build(&conf, SimMetadata::<LostWrites>::new(), storage).unwrap();
    let obj = &sp.object;

    // nothing changed yet, so the stale medium still matches
    let ok = obj.nonpaged_write_verify().await;
    assert_eq!(ok, WriteVerifyResult { success: true, retryable: false });

    obj.nonpaged_write(DATA, &[0x11; 4], 1).await.unwrap();
    let lost = obj.nonpaged_write_verify().await;
    assert_eq!(lost, WriteVerifyResult { success: false, retryable: false });
    assert!(!sp.metadata.stripe_locks().is_locked(obj.id(), obj.number_of_stripes() - 1));
}

#[tokio::test]
async fn record_survives_restart_on_disk() -> anyhow::Result<()> {
    init();
    let dir = camino_tempfile::tempdir()?;
    let conf = StorageObjectConf {
        workdir: dir.path().to_owned(),
        no_sync: true,
        ..Default::default()
    };

    {
        let storage =
            FileStorage::open(&conf.object_dir(), conf.nonpaged_data_size, conf.no_sync).await?;
        let sp = SimSp::build(&conf, SimMetadata::<FileStorage>::new(), storage)?;
        let lock = sp.object.acquire_np_lock().await?;
        sp.object.set_default_nonpaged_metadata().await?;
        sp.object.nonpaged_write_persist(DATA, &[0x5a; 4], 1).await?;
        assert!(lock.release().await.is_ok());
        // lost on restart
        sp.object.nonpaged_write(DATA + 4, &[1], 1).await?;
    }

    let storage =
        FileStorage::open(&conf.object_dir(), conf.nonpaged_data_size, conf.no_sync).await?;
    let sp = SimSp::build(&conf, SimMetadata::<FileStorage>::new(), storage)?;
    assert!(sp.object.is_nonpaged_initialized());
    assert_eq!(&sp.object.np_record().read().class_data()[..5], &[0x5a, 0x5a, 0x5a, 0x5a, 0]);

    // read_persist drops unpersisted changes
    sp.object.nonpaged_write(DATA, &[0; 4], 1).await?;
    sp.object.nonpaged_read_persist().await?;
    assert_eq!(sp.object.np_record().read().class_data()[0], 0x5a);

    sp.object.nonpaged_zero();
    assert!(!sp.object.is_nonpaged_initialized());
    Ok(())
}
