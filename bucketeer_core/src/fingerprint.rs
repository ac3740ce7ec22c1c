use std::fmt;

/// Width of one rendered frame identifier.
pub const FRAME_ID_WIDTH: usize = 3;

/// Rendering used for a frame whose return address could not be read.
pub const UNREADABLE_FRAME: &str = "XXX";

const FRAME_ID_MASK: u64 = 0xfff;

/// One walked stack frame, reduced to the low 12 bits of its return address.
///
/// Only the page offset of the return address is kept, which survives ASLR
/// and keeps the identifier stable across runs of the same binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameId {
    Offset(u16),
    Unreadable,
}

impl FrameId {
    pub fn from_return_address(address: u64) -> Self {
        FrameId::Offset((address & FRAME_ID_MASK) as u16)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameId::Offset(offset) => write!(f, "{offset:03x}"),
            FrameId::Unreadable => f.write_str(UNREADABLE_FRAME),
        }
    }
}

/// Stable key of a crash, built from the frame-pointer chain at the fault.
///
/// Frames are stored outermost first, innermost (closest to the fault) last,
/// which is also the order they are rendered in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    frames: Vec<FrameId>,
}

impl Fingerprint {
    /// Builds a fingerprint from frames listed innermost first, as a walk
    /// discovers them.
    pub fn from_walk(mut walked: Vec<FrameId>) -> Self {
        walked.reverse();
        Self { frames: walked }
    }

    /// Fingerprint for an abnormal death that never passed through a fault stop.
    pub fn unresolved(frame_count: usize) -> Self {
        Self {
            frames: vec![FrameId::Unreadable; frame_count],
        }
    }

    pub fn frames(&self) -> &[FrameId] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Length of the rendered key, always `3 × frame_count`.
    pub fn rendered_len(&self) -> usize {
        self.frames.len() * FRAME_ID_WIDTH
    }

    pub fn is_unresolved(&self) -> bool {
        self.frames.iter().all(|frame| *frame == FrameId::Unreadable)
    }

    /// Renders the key used as a bucket directory name.
    pub fn to_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            write!(f, "{frame}")?;
        }
        Ok(())
    }
}
