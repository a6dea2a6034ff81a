use std::io;

use camino::Utf8Path;

async fn fsync_async(path: &Utf8Path) -> io::Result<()> {
    tokio::fs::File::open(path).await?.sync_all().await
}

/// Rename `old_path` over `new_path`, making the rename survive a crash.
///
/// The file itself is synced before the rename and the parent directory after it,
/// so readers observe either the old contents or the complete new contents.
pub async fn durable_rename(
    old_path: impl AsRef<Utf8Path>,
    new_path: impl AsRef<Utf8Path>,
    do_fsync: bool,
) -> io::Result<()> {
    let old_path = old_path.as_ref();
    let new_path = new_path.as_ref();

    if do_fsync {
        fsync_async(old_path).await?;
    }

    tokio::fs::rename(old_path, new_path).await?;

    if do_fsync {
        let parent = new_path
            .parent()
            .ok_or_else(|| io::Error::other(format!("{new_path} has no parent directory")))?;
        fsync_async(parent).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn durable_rename_replaces_target() -> anyhow::Result<()> {
        let tempdir = camino_tempfile::tempdir()?;
        let target = tempdir.path().join("record");
        let partial = tempdir.path().join("record.partial");

        tokio::fs::write(&target, b"old").await?;
        tokio::fs::write(&partial, b"new").await?;
        durable_rename(&partial, &target, true).await?;

        assert_eq!(tokio::fs::read(&target).await?, b"new");
        assert!(!partial.exists());
        Ok(())
    }
}
