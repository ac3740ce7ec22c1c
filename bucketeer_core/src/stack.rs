use crate::arch::WORD_SIZE;
use crate::fingerprint::{Fingerprint, FrameId};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;

/// Frame pointer assumed once the saved caller pointer could not be read.
/// It matches the all-ones word a failed `PTRACE_PEEKDATA` returns.
pub const LOST_FRAME_POINTER: u64 = u64::MAX;

/// Source of 8-byte words from a stopped process's address space.
///
/// The stack walk only depends on this trait, so it can run against a live
/// tracee or against an in-memory stack image.
pub trait FrameReader {
    /// Reads the word stored at `address`.
    ///
    /// # Arguments
    /// * `address`: Virtual address in the inspected process.
    ///
    /// # Returns
    /// The word on success. A failed read is an `Err`, never a magic value,
    /// so a stored zero or all-ones word is still reported as readable.
    fn read_word(&self, address: u64) -> Result<u64, Errno>;
}

/// Reads the memory of a ptrace-stopped child with `PTRACE_PEEKDATA`.
///
/// A word of all ones is a legal value, so failure is decided by errno rather
/// than by the returned word; `ptrace::read` clears errno before the call and
/// checks it afterwards.
#[derive(Debug, Clone, Copy)]
pub struct TraceeMemory {
    pid: Pid,
}

impl TraceeMemory {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }
}

impl FrameReader for TraceeMemory {
    fn read_word(&self, address: u64) -> Result<u64, Errno> {
        let word = ptrace::read(self.pid, address as ptrace::AddressType)?;
        Ok(word as u64)
    }
}

/// Walks a frame-pointer chain and reduces it to a [`Fingerprint`].
///
/// Each frame layout is `[fp] = caller fp`, `[fp + 8] = return address`. The
/// walk never stops early: a failed read turns into a sentinel frame so every
/// fingerprint has exactly `frame_count` frames.
#[derive(Debug, Clone, Copy)]
pub struct StackHasher {
    frame_count: usize,
}

impl StackHasher {
    pub const DEFAULT_FRAME_COUNT: usize = 6;
    /// Deeper walks than this tend to run off the end of usable frame chains.
    pub const RELIABLE_FRAME_COUNT: usize = 10;

    pub fn new(frame_count: usize) -> Self {
        Self { frame_count }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Walks `frame_count` frames starting at `frame_pointer`.
    ///
    /// Every iteration issues exactly two reads: the return address at
    /// `fp + 8` and the saved caller frame pointer at `fp`. A failed advance
    /// leaves [`LOST_FRAME_POINTER`] behind, which wraps the next return-address
    /// read into the unmapped first page, so the remaining frames come out as
    /// sentinels without the walk ever ending early.
    ///
    /// # Arguments
    /// * `reader`: Memory of the stopped process, usually a [`TraceeMemory`].
    /// * `frame_pointer`: Value of the frame-pointer register at the fault.
    ///
    /// # Returns
    /// A [`Fingerprint`] of exactly `frame_count` frames, outermost first.
    pub fn hash<R: FrameReader + ?Sized>(&self, reader: &R, frame_pointer: u64) -> Fingerprint {
        let mut walked = Vec::with_capacity(self.frame_count);
        let mut fp = frame_pointer;

        for _ in 0..self.frame_count {
            let frame = reader
                .read_word(fp.wrapping_add(WORD_SIZE))
                .map(FrameId::from_return_address)
                .unwrap_or(FrameId::Unreadable);
            walked.push(frame);

            fp = reader.read_word(fp).unwrap_or(LOST_FRAME_POINTER);
        }

        Fingerprint::from_walk(walked)
    }
}

impl Default for StackHasher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_FRAME_COUNT)
    }
}
