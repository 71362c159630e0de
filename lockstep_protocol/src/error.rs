// Frame-level protocol faults.
//
// Every variant is fatal to the connection that produced it: a malformed or
// oversized frame means the two ends disagree about the protocol, so there is
// nothing sensible to retry.

/// A violation of the frame format or its size ceilings.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("malformed frame header {0:#04x}")]
    MalformedHeader(u8),
    #[error("frame payload of {len} bytes exceeds the {max} byte chunk size")]
    ChunkTooLarge { len: usize, max: usize },
    #[error("message of {len} bytes exceeds the {max} byte ceiling")]
    MessageTooLarge { len: usize, max: usize },
    #[error("kind {0} is not fragmentable in the current state")]
    NotFragmentable(u8),
    #[error("fragment of kind {got} arrived while kind {expected} was being reassembled")]
    InterleavedFragment { expected: u8, got: u8 },
    #[error("continuation fragment of kind {0} without a first fragment")]
    OrphanFragment(u8),
    #[error("first fragment of kind {0} is missing its length prefix")]
    MissingLength(u8),
    #[error("reassembled {actual} bytes but the first fragment declared {declared}")]
    LengthMismatch { declared: usize, actual: usize },
}
