use nix::unistd::{AccessFlags, access};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while enumerating the input corpus. All of them abort the batch.
#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("Unable to open input directory {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unable to access {path:?}: {source}")]
    Access {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A regular, non-empty, readable file from the input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    path: PathBuf,
    file_name: OsString,
    size: u64,
}

impl CorpusEntry {
    pub fn new(path: PathBuf, file_name: OsString, size: u64) -> Self {
        Self {
            path,
            file_name,
            size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base name the entry keeps when copied into a bucket.
    pub fn file_name(&self) -> &OsString {
        &self.file_name
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Lists the replayable files of `input_dir` in lexicographic order.
///
/// Directories, special files, symlinks and empty files are skipped. Any entry
/// that cannot be stat'ed or read aborts the scan, dangling symlinks included.
///
/// # Arguments
/// * `input_dir`: Directory holding the inputs to triage. It is not recursed into.
///
/// # Returns
/// The entries to replay, sorted by file name.
pub fn scan_input_dir(input_dir: &Path) -> Result<Vec<CorpusEntry>, CorpusError> {
    let read_dir = fs::read_dir(input_dir).map_err(|source| CorpusError::ReadDir {
        path: input_dir.to_path_buf(),
        source,
    })?;

    let mut names = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| CorpusError::ReadDir {
            path: input_dir.to_path_buf(),
            source,
        })?;
        names.push(entry.file_name());
    }
    names.sort();

    let mut entries = Vec::with_capacity(names.len());
    for file_name in names {
        let path = input_dir.join(&file_name);
        let metadata = fs::symlink_metadata(&path).map_err(|source| CorpusError::Access {
            path: path.clone(),
            source,
        })?;
        access(&path, AccessFlags::R_OK).map_err(|errno| CorpusError::Access {
            path: path.clone(),
            source: errno.into(),
        })?;

        if !metadata.file_type().is_file() {
            log::debug!("Skipping {path:?}: not a regular file");
            continue;
        }
        if metadata.len() == 0 {
            log::debug!("Skipping {path:?}: empty file");
            continue;
        }
        entries.push(CorpusEntry::new(path, file_name, metadata.len()));
    }

    Ok(entries)
}
