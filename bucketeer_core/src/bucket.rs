use crate::corpus::CorpusEntry;
use crate::fingerprint::Fingerprint;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, DirBuilder, File};
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DIR_MODE: u32 = 0o700;

#[derive(Error, Debug)]
pub enum BucketError {
    #[error("Unable to create {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unable to open output directory {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unable to flock() output directory {path:?} (another instance running?): {errno}")]
    Locked { path: PathBuf, errno: Errno },
    #[error("Failed to copy {from:?} to {to:?}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl BucketError {
    /// Copy failures are reported and skipped; anything else stops the batch.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BucketError::Copy { .. })
    }
}

/// The output root, exclusively locked for as long as this value lives.
///
/// The lock is an advisory `flock` on a close-on-exec descriptor, so traced
/// children never inherit it.
pub struct OutputRoot {
    path: PathBuf,
    _lock: Flock<File>,
}

impl std::fmt::Debug for OutputRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRoot").field("path", &self.path).finish()
    }
}

impl OutputRoot {
    /// Creates the output root if needed and takes the instance lock.
    ///
    /// # Arguments
    /// * `path`: Directory that will hold one subdirectory per fingerprint.
    ///   Its parent must already exist.
    ///
    /// # Returns
    /// The locked root, or `BucketError::Locked` when another instance already
    /// holds it. Every other error comes from creating or opening the directory.
    pub fn create_locked(path: &Path) -> Result<Self, BucketError> {
        create_dir_if_missing(path)?;

        let dir = File::open(path).map_err(|source| BucketError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let lock = Flock::lock(dir, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            BucketError::Locked {
                path: path.to_path_buf(),
                errno,
            }
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bucket_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.path.join(fingerprint.to_key())
    }

    /// Copies `entry` into the bucket named by `fingerprint`, creating the
    /// bucket on first use. An existing bucket is reused as is.
    ///
    /// # Arguments
    /// * `fingerprint`: Stack fingerprint of the crash; its key names the bucket.
    /// * `entry`: The crashing corpus file, copied under its original name.
    ///
    /// # Returns
    /// The path of the copy. `BucketError::Copy` is recoverable (see
    /// [`BucketError::is_recoverable`]); failing to create the bucket is not.
    pub fn bucket(
        &self,
        fingerprint: &Fingerprint,
        entry: &CorpusEntry,
    ) -> Result<PathBuf, BucketError> {
        let dir = self.bucket_dir(fingerprint);
        create_dir_if_missing(&dir)?;

        let destination = dir.join(entry.file_name());
        fs::copy(entry.path(), &destination).map_err(|source| BucketError::Copy {
            from: entry.path().to_path_buf(),
            to: destination.clone(),
            source,
        })?;
        Ok(destination)
    }
}

fn create_dir_if_missing(path: &Path) -> Result<(), BucketError> {
    match DirBuilder::new().mode(DIR_MODE).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(BucketError::CreateDir {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FrameId;
    use tempfile::tempdir;

    fn fingerprint(offsets: &[u16]) -> Fingerprint {
        Fingerprint::from_walk(offsets.iter().map(|o| FrameId::Offset(*o)).collect())
    }

    fn entry(dir: &Path, name: &str, data: &[u8]) -> CorpusEntry {
        let path = dir.join(name);
        fs::write(&path, data).unwrap();
        CorpusEntry::new(path, name.into(), data.len() as u64)
    }

    #[test]
    fn creates_root_and_buckets_by_fingerprint() {
        let inputs = tempdir().unwrap();
        let out = tempdir().unwrap();
        let root_path = out.path().join("triage");
        let root = OutputRoot::create_locked(&root_path).unwrap();
        assert!(root_path.is_dir());

        let fp = fingerprint(&[0x1, 0x2a, 0xfff]);
        let copied = root.bucket(&fp, &entry(inputs.path(), "id_000", b"AAAA")).unwrap();
        assert_eq!(copied, root_path.join("fff02a001").join("id_000"));
        assert_eq!(fs::read(&copied).unwrap(), b"AAAA");

        // Reusing an existing bucket is not an error.
        let second = root.bucket(&fp, &entry(inputs.path(), "id_007", b"BB")).unwrap();
        assert_eq!(second, root_path.join("fff02a001").join("id_007"));
        assert_eq!(fs::read_dir(root_path.join("fff02a001")).unwrap().count(), 2);
    }

    #[test]
    fn second_instance_cannot_lock_the_same_root() {
        let out = tempdir().unwrap();
        let first = OutputRoot::create_locked(out.path()).unwrap();
        assert!(matches!(
            OutputRoot::create_locked(out.path()),
            Err(BucketError::Locked { .. })
        ));
        drop(first);
        assert!(OutputRoot::create_locked(out.path()).is_ok());
    }

    #[test]
    fn copy_failure_is_recoverable() {
        let out = tempdir().unwrap();
        let root = OutputRoot::create_locked(out.path()).unwrap();
        let vanished = CorpusEntry::new(out.path().join("gone"), "gone".into(), 3);

        let err = root.bucket(&fingerprint(&[0xabc]), &vanished).unwrap_err();
        assert!(err.is_recoverable());
        // The bucket directory itself was still created.
        assert!(out.path().join("abc").is_dir());
    }

    #[test]
    fn unusable_root_is_fatal() {
        let out = tempdir().unwrap();
        let file = out.path().join("plain-file");
        fs::write(&file, b"x").unwrap();
        let err = OutputRoot::create_locked(&file.join("sub")).unwrap_err();
        assert!(!err.is_recoverable());
    }
}
