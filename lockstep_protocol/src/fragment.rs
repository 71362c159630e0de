// Message fragmentation and reassembly.
//
// A message whose payload fits in one chunk goes out as a single frame tagged
// `None`. Anything larger is split into `More` frames followed by one `End`
// frame; only the first frame carries a 4-byte big-endian total length right
// after its header byte:
//
//   first:  [hdr More][len u32 BE][chunk]
//   middle: [hdr More][chunk]
//   last:   [hdr End ][chunk]
//
// Whether a kind may arrive fragmented is decided by the receiving state, so
// `Reassembler::push` takes that policy as a closure and refuses a first
// fragment the policy does not allow. The reassembler holds at most one
// partial message; it is cleared on completion and on any fault.

use bytes::Bytes;

use crate::error::FrameError;
use crate::wire::{FragTag, decode_header, encode_header};

/// Default payload bytes per frame.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Default ceiling for a reassembled message.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Bytes of the length prefix on a first fragment.
const LENGTH_PREFIX: usize = 4;

/// Size ceilings shared by both directions of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLimits {
    pub chunk_size: usize,
    pub max_message_size: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl FrameLimits {
    /// Largest raw frame these limits can produce: header, length prefix and
    /// one full chunk.
    pub fn max_frame_size(&self) -> usize {
        1 + LENGTH_PREFIX + self.chunk_size
    }
}

/// A complete logical message: kind plus payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub kind: u8,
    pub payload: Bytes,
}

/// Split a payload into wire frames.
pub fn fragment(kind: u8, payload: &[u8], limits: &FrameLimits) -> Result<Vec<Vec<u8>>, FrameError> {
    if payload.len() > limits.max_message_size {
        return Err(FrameError::MessageTooLarge {
            len: payload.len(),
            max: limits.max_message_size,
        });
    }

    if payload.len() <= limits.chunk_size {
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(encode_header(kind, FragTag::None));
        frame.extend_from_slice(payload);
        return Ok(vec![frame]);
    }

    let chunks: Vec<&[u8]> = payload.chunks(limits.chunk_size).collect();
    let last = chunks.len() - 1;
    let mut frames = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.into_iter().enumerate() {
        let tag = if i == last { FragTag::End } else { FragTag::More };
        let mut frame = Vec::with_capacity(1 + LENGTH_PREFIX + chunk.len());
        frame.push(encode_header(kind, tag));
        if i == 0 {
            #[expect(clippy::cast_possible_truncation)]
            let total = (payload.len() as u32).to_be_bytes();
            frame.extend_from_slice(&total);
        }
        frame.extend_from_slice(chunk);
        frames.push(frame);
    }
    Ok(frames)
}

struct Partial {
    kind: u8,
    declared: usize,
    buf: Vec<u8>,
}

/// Incoming reassembly state for one direction of a connection.
pub struct Reassembler {
    limits: FrameLimits,
    partial: Option<Partial>,
}

impl Reassembler {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            limits,
            partial: None,
        }
    }

    /// True while a fragmented message is half-received.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Feed one raw frame. Returns the message once it is complete.
    ///
    /// `fragmentable` answers whether the current state accepts a kind in
    /// fragmented form. It is consulted once, on the first fragment.
    pub fn push(
        &mut self,
        frame: &[u8],
        fragmentable: impl Fn(u8) -> bool,
    ) -> Result<Option<RawMessage>, FrameError> {
        let result = self.push_inner(frame, fragmentable);
        if result.is_err() {
            self.partial = None;
        }
        result
    }

    fn push_inner(
        &mut self,
        frame: &[u8],
        fragmentable: impl Fn(u8) -> bool,
    ) -> Result<Option<RawMessage>, FrameError> {
        let (&header, body) = frame.split_first().ok_or(FrameError::Empty)?;
        let (kind, tag) = decode_header(header)?;

        match (tag, self.partial.as_mut()) {
            (FragTag::None, None) => {
                self.check_chunk(body.len())?;
                Ok(Some(RawMessage {
                    kind,
                    payload: Bytes::copy_from_slice(body),
                }))
            }
            (FragTag::None, Some(partial)) => Err(FrameError::InterleavedFragment {
                expected: partial.kind,
                got: kind,
            }),
            (FragTag::More, None) => {
                if !fragmentable(kind) {
                    return Err(FrameError::NotFragmentable(kind));
                }
                if body.len() < LENGTH_PREFIX {
                    return Err(FrameError::MissingLength(kind));
                }
                let (len_bytes, chunk) = body.split_at(LENGTH_PREFIX);
                let mut prefix = [0u8; LENGTH_PREFIX];
                prefix.copy_from_slice(len_bytes);
                let declared = u32::from_be_bytes(prefix) as usize;
                if declared > self.limits.max_message_size {
                    return Err(FrameError::MessageTooLarge {
                        len: declared,
                        max: self.limits.max_message_size,
                    });
                }
                self.check_chunk(chunk.len())?;
                if chunk.len() > declared {
                    return Err(FrameError::LengthMismatch {
                        declared,
                        actual: chunk.len(),
                    });
                }
                let mut buf = Vec::with_capacity(declared);
                buf.extend_from_slice(chunk);
                self.partial = Some(Partial {
                    kind,
                    declared,
                    buf,
                });
                Ok(None)
            }
            (FragTag::End, None) => Err(FrameError::OrphanFragment(kind)),
            (FragTag::More | FragTag::End, Some(partial)) => {
                if partial.kind != kind {
                    return Err(FrameError::InterleavedFragment {
                        expected: partial.kind,
                        got: kind,
                    });
                }
                if body.len() > self.limits.chunk_size {
                    return Err(FrameError::ChunkTooLarge {
                        len: body.len(),
                        max: self.limits.chunk_size,
                    });
                }
                let actual = partial.buf.len() + body.len();
                if actual > partial.declared {
                    return Err(FrameError::LengthMismatch {
                        declared: partial.declared,
                        actual,
                    });
                }
                partial.buf.extend_from_slice(body);
                if tag == FragTag::More {
                    return Ok(None);
                }
                if actual != partial.declared {
                    return Err(FrameError::LengthMismatch {
                        declared: partial.declared,
                        actual,
                    });
                }
                let done = self.partial.take().map(|p| RawMessage {
                    kind: p.kind,
                    payload: Bytes::from(p.buf),
                });
                Ok(done)
            }
        }
    }

    fn check_chunk(&self, len: usize) -> Result<(), FrameError> {
        if len > self.limits.chunk_size {
            return Err(FrameError::ChunkTooLarge {
                len,
                max: self.limits.chunk_size,
            });
        }
        Ok(())
    }
}
