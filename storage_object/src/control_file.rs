//! Persisted image of the non-paged metadata record.

use anyhow::{Context, Result, bail, ensure};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use utils::crashsafe::durable_rename;

use std::future::Future;
use std::io::Read;
use std::ops::Deref;
use std::time::Instant;

use crate::nonpaged::NonPagedRecord;

pub const NP_MAGIC: u32 = 0x4e50_5245u32;
pub const NP_FORMAT_VERSION: u32 = 1;

pub const CONTROL_FILE_NAME: &str = "nonpaged.control";
// needed to atomically update the state using `rename`
const CONTROL_FILE_NAME_PARTIAL: &str = "nonpaged.control.partial";
pub const CHECKSUM_SIZE: usize = size_of::<u32>();

/// Storage keeps the last persisted record inside of it and derefs to it.
pub trait Storage: Deref<Target = NonPagedRecord> + Send + Sync {
    /// Persist the record durably and update the internal copy.
    fn persist(&mut self, s: &NonPagedRecord) -> impl Future<Output = Result<()>> + Send;

    /// Read the record back from the backing medium, bypassing the internal
    /// copy.
    fn read_back(&self) -> impl Future<Output = Result<NonPagedRecord>> + Send;

    /// Timestamp of last persist.
    fn last_persist_at(&self) -> Instant;
}

#[derive(Debug)]
pub struct FileStorage {
    dir: Utf8PathBuf,
    no_sync: bool,

    /// Last record persisted to disk.
    state: NonPagedRecord,
    /// Not preserved across restarts.
    last_persist_at: Instant,
}

impl FileStorage {
    /// Initialize storage by loading the record from disk.
    pub fn restore_new(dir: &Utf8Path, no_sync: bool) -> Result<FileStorage> {
        let state = Self::load_control_file(dir.join(CONTROL_FILE_NAME))?;

        Ok(FileStorage {
            dir: dir.to_path_buf(),
            no_sync,
            state,
            last_persist_at: Instant::now(),
        })
    }

    /// Create and reliably persist a new control file at given location.
    pub async fn create_new(
        dir: &Utf8Path,
        state: NonPagedRecord,
        no_sync: bool,
    ) -> Result<FileStorage> {
        let mut store = FileStorage {
            dir: dir.to_path_buf(),
            no_sync,
            state: state.clone(),
            last_persist_at: Instant::now(),
        };
        store.persist(&state).await?;
        Ok(store)
    }

    /// Restore the record if a control file exists, otherwise start from a
    /// zeroed record of `data_size` class bytes.
    pub async fn open(dir: &Utf8Path, data_size: usize, no_sync: bool) -> Result<FileStorage> {
        if dir.join(CONTROL_FILE_NAME).exists() {
            return Self::restore_new(dir, no_sync);
        }
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {dir}"))?;
        Self::create_new(dir, NonPagedRecord::new(data_size), no_sync).await
    }

    /// Check the magic/version in the on-disk data and deserialize it.
    fn deser_record(buf: &mut &[u8]) -> Result<NonPagedRecord> {
        let magic = buf.read_u32::<LittleEndian>()?;
        if magic != NP_MAGIC {
            bail!("bad control file magic: {:X}, expected {:X}", magic, NP_MAGIC);
        }
        let version = buf.read_u32::<LittleEndian>()?;
        if version != NP_FORMAT_VERSION {
            bail!("unsupported control file version {version}");
        }
        Ok(NonPagedRecord::from_bytes(buf.to_vec())?)
    }

    /// Read in the control file.
    pub fn load_control_file(path: Utf8PathBuf) -> Result<NonPagedRecord> {
        let mut control_file = std::fs::File::open(&path)
            .with_context(|| format!("failed to open control file at {path}"))?;

        let mut buf = Vec::new();
        control_file
            .read_to_end(&mut buf)
            .context("failed to read control file")?;
        Self::parse_control_file(&path, &buf)
    }

    /// Verify the checksum of a control file image and deserialize it.
    fn parse_control_file(path: &Utf8Path, buf: &[u8]) -> Result<NonPagedRecord> {
        ensure!(
            buf.len() >= 2 * size_of::<u32>() + CHECKSUM_SIZE,
            "control file {path} is truncated"
        );

        let calculated_checksum = crc32c::crc32c(&buf[..buf.len() - CHECKSUM_SIZE]);

        let expected_checksum_bytes: &[u8; CHECKSUM_SIZE] =
            buf[buf.len() - CHECKSUM_SIZE..].try_into()?;
        let expected_checksum = u32::from_le_bytes(*expected_checksum_bytes);

        ensure!(
            calculated_checksum == expected_checksum,
            format!(
                "non-paged control file checksum mismatch: expected {} got {}",
                expected_checksum, calculated_checksum
            )
        );

        Self::deser_record(&mut &buf[..buf.len() - CHECKSUM_SIZE])
            .with_context(|| format!("while reading control file {path}"))
    }
}

impl Deref for FileStorage {
    type Target = NonPagedRecord;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl NonPagedRecord {
    pub(crate) fn write_to_buf(&self) -> Result<Vec<u8>> {
        let mut buf: Vec<u8> = Vec::with_capacity(self.len() + 3 * size_of::<u32>());
        WriteBytesExt::write_u32::<LittleEndian>(&mut buf, NP_MAGIC)?;
        WriteBytesExt::write_u32::<LittleEndian>(&mut buf, NP_FORMAT_VERSION)?;
        buf.extend_from_slice(self.as_bytes());

        let checksum = crc32c::crc32c(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }
}

impl Storage for FileStorage {
    async fn persist(&mut self, s: &NonPagedRecord) -> Result<()> {
        let control_partial_path = self.dir.join(CONTROL_FILE_NAME_PARTIAL);
        let mut control_partial = File::create(&control_partial_path).await.with_context(|| {
            format!("failed to create partial control file at: {control_partial_path}")
        })?;

        let buf: Vec<u8> = s.write_to_buf()?;

        control_partial.write_all(&buf).await.with_context(|| {
            format!("failed to write non-paged record into control file at: {control_partial_path}")
        })?;
        control_partial.flush().await.with_context(|| {
            format!("failed to flush non-paged record into control file at: {control_partial_path}")
        })?;

        let control_path = self.dir.join(CONTROL_FILE_NAME);
        durable_rename(&control_partial_path, &control_path, !self.no_sync).await?;

        self.state = s.clone();
        self.last_persist_at = Instant::now();
        Ok(())
    }

    async fn read_back(&self) -> Result<NonPagedRecord> {
        let path = self.dir.join(CONTROL_FILE_NAME);
        let buf = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read control file at {path}"))?;
        Self::parse_control_file(&path, &buf)
    }

    fn last_persist_at(&self) -> Instant {
        self.last_persist_at
    }
}

/// Storage that keeps the persisted record in memory only.
#[derive(Debug)]
pub struct InMemoryStorage {
    state: NonPagedRecord,
    last_persist_at: Instant,
}

impl InMemoryStorage {
    pub fn new(state: NonPagedRecord) -> Self {
        InMemoryStorage {
            state,
            last_persist_at: Instant::now(),
        }
    }
}

impl Deref for InMemoryStorage {
    type Target = NonPagedRecord;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl Storage for InMemoryStorage {
    async fn persist(&mut self, s: &NonPagedRecord) -> Result<()> {
        self.state = s.clone();
        self.last_persist_at = Instant::now();
        Ok(())
    }

    async fn read_back(&self) -> Result<NonPagedRecord> {
        Ok(self.state.clone())
    }

    fn last_persist_at(&self) -> Instant {
        self.last_persist_at
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ObjectId;
    use crate::nonpaged::NonPagedState;
    use tokio::fs;

    const NO_SYNC: bool = true;

    #[tokio::test]
    async fn test_read_write_nonpaged_record() -> anyhow::Result<()> {
        let tempdir = camino_tempfile::tempdir()?;
        let mut record = NonPagedRecord::new(16);
        let mut storage = FileStorage::create_new(tempdir.path(), record.clone(), NO_SYNC).await?;

        record.set_signature(ObjectId(0x108), 7);
        record.set_state(NonPagedState::Initialized);
        storage.persist(&record).await?;

        let loaded = FileStorage::load_control_file(tempdir.path().join(CONTROL_FILE_NAME))?;
        assert_eq!(loaded, record);
        assert_eq!(*storage, record);

        let restored = FileStorage::restore_new(tempdir.path(), NO_SYNC)?;
        assert_eq!(restored.generation(), 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_nonpaged_record_checksum_mismatch() -> anyhow::Result<()> {
        let tempdir = camino_tempfile::tempdir()?;
        let record = NonPagedRecord::new(8);
        FileStorage::create_new(tempdir.path(), record, NO_SYNC).await?;

        // Change the first byte to fail checksum validation.
        let ctrl_path = tempdir.path().join(CONTROL_FILE_NAME);
        let mut data = fs::read(&ctrl_path).await?;
        data[0] = data[0].wrapping_add(1);
        fs::write(&ctrl_path, &data).await?;

        match FileStorage::load_control_file(ctrl_path) {
            Err(err) => assert!(err.to_string().contains("control file checksum mismatch")),
            Ok(_) => panic!("expected checksum error"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn read_back_sees_the_file_not_the_cache() -> anyhow::Result<()> {
        let tempdir = camino_tempfile::tempdir()?;
        let mut record = NonPagedRecord::new(8);
        let mut storage = FileStorage::create_new(tempdir.path(), record.clone(), NO_SYNC).await?;
        record.set_signature(ObjectId(9), 2);
        storage.persist(&record).await?;
        assert_eq!(storage.read_back().await?, record);

        let ctrl_path = tempdir.path().join(CONTROL_FILE_NAME);
        let data = fs::read(&ctrl_path).await?;
        fs::write(&ctrl_path, &data[..data.len() / 2]).await?;
        assert!(storage.read_back().await.is_err());
        assert_eq!(*storage, record);
        Ok(())
    }

    #[tokio::test]
    async fn open_creates_then_restores() -> anyhow::Result<()> {
        let tempdir = camino_tempfile::tempdir()?;
        let dir = tempdir.path().join("obj");
        let mut storage = FileStorage::open(&dir, 32, NO_SYNC).await?;
        assert_eq!(storage.data_size(), 32);

        let mut record = (*storage).clone();
        record.set_signature(ObjectId(3), 1);
        storage.persist(&record).await?;

        let reopened = FileStorage::open(&dir, 32, NO_SYNC).await?;
        assert_eq!(reopened.object_id(), ObjectId(3));
        Ok(())
    }
}
