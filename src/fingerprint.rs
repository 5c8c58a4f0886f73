//! Content fingerprints and the on-disk blob cache.
//!
//! A fingerprint is a structural summary of file content: SHA-256 hash plus
//! size and mtime. Fingerprints are taken lazily; see the version module for
//! when. Blobs for fingerprinted content are staged into `<db>/newcache`
//! during a run and renamed over `<db>/cache` when the run finishes, so a
//! later run can commit a version whose producer was not re-executed.

use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: [u8; 32],
    pub size: u64,
    pub mtime: i64,
}

impl Fingerprint {
    /// Fingerprint a byte buffer, stamping it with the current time.
    /// Used by tests and by pipe-fed content; real files go through
    /// `of_file` so the mtime matches the filesystem.
    pub fn of_bytes(bytes: &[u8], mtime: i64) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Fingerprint {
            hash: hasher.finalize().into(),
            size: bytes.len() as u64,
            mtime,
        }
    }

    /// Two fingerprints describe the same content when hash and size agree.
    /// mtime is advisory only; touch(1) must not look like an edit.
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        self.hash == other.hash && self.size == other.size
    }

    pub fn hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Hash a file's content from disk.
pub fn of_file(path: &Path) -> std::io::Result<Fingerprint> {
    let meta = std::fs::metadata(path)?;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 << 10];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Fingerprint {
        hash: hasher.finalize().into(),
        size: meta.len(),
        mtime: meta.mtime(),
    })
}

/// The content cache under the database directory.  `cache` holds blobs from
/// the previous run; `newcache` stages blobs for the next one.
pub struct BlobCache {
    cache: PathBuf,
    newcache: PathBuf,
}

impl BlobCache {
    pub fn new(db_dir: &Path) -> std::io::Result<BlobCache> {
        let cache = db_dir.join("cache");
        let newcache = db_dir.join("newcache");
        std::fs::create_dir_all(&cache)?;
        std::fs::create_dir_all(&newcache)?;
        Ok(BlobCache { cache, newcache })
    }

    fn blob_path(&self, dir: &Path, fp: &Fingerprint) -> PathBuf {
        dir.join(fp.hex())
    }

    /// True if a blob for this fingerprint is available to restore.
    pub fn has(&self, fp: &Fingerprint) -> bool {
        self.blob_path(&self.cache, fp).exists() || self.blob_path(&self.newcache, fp).exists()
    }

    /// Copy a file's content into the staging cache.
    pub fn stage(&self, src: &Path, fp: &Fingerprint) -> std::io::Result<()> {
        let dest = self.blob_path(&self.newcache, fp);
        if dest.exists() {
            return Ok(());
        }
        std::fs::copy(src, &dest)?;
        Ok(())
    }

    /// Write a cached blob to `dest`.
    pub fn restore(&self, fp: &Fingerprint, dest: &Path) -> std::io::Result<()> {
        let mut src = self.blob_path(&self.newcache, fp);
        if !src.exists() {
            src = self.blob_path(&self.cache, fp);
        }
        std::fs::copy(&src, dest)?;
        Ok(())
    }

    /// Replace the previous run's cache with the staged one.
    pub fn swap(&self) -> std::io::Result<()> {
        std::fs::remove_dir_all(&self.cache)?;
        std::fs::rename(&self.newcache, &self.cache)?;
        std::fs::create_dir_all(&self.newcache)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_fingerprint_matches_bytes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello")?;
        let fp = of_file(&path)?;
        assert!(fp.same_content(&Fingerprint::of_bytes(b"hello", 0)));
        assert!(!fp.same_content(&Fingerprint::of_bytes(b"hello!", 0)));
        Ok(())
    }

    #[test]
    fn stage_swap_restore() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = dir.path().join("db");
        std::fs::create_dir_all(&db)?;
        let cache = BlobCache::new(&db)?;

        let src = dir.path().join("src");
        std::fs::write(&src, b"content")?;
        let fp = of_file(&src)?;
        cache.stage(&src, &fp)?;
        assert!(cache.has(&fp));

        cache.swap()?;
        assert!(cache.has(&fp));

        let dest = dir.path().join("dest");
        cache.restore(&fp, &dest)?;
        assert_eq!(std::fs::read(&dest)?, b"content");
        Ok(())
    }
}
