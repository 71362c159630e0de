// Frame header codec.
//
// One byte per frame: the packet kind in the low six bits and a two-bit
// fragmentation tag in the high bits.
//
//   7 6 | 5 4 3 2 1 0
//   tag | kind
//
// Tag values: `0x00` whole message, `0x40` more fragments follow, `0x80` last
// fragment. `0xC0` is unused and rejected on decode. Kind 63 is reserved for
// the out-of-band disconnect notice, which every state accepts.

use crate::error::FrameError;

/// Bits of the header byte that carry the kind.
pub const KIND_MASK: u8 = 0x3F;

/// Bits of the header byte that carry the fragmentation tag.
pub const TAG_MASK: u8 = 0xC0;

/// Out-of-band "special disconnect" kind, legal in every state.
pub const SPECIAL_DISCONNECT: u8 = 63;

/// Fragmentation tag of a single frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragTag {
    /// The frame carries a whole message.
    None = 0x00,
    /// More fragments of the same message follow.
    More = 0x40,
    /// Final fragment of a message.
    End = 0x80,
}

/// Encode a header byte. A kind outside `0..=63` is a programmer error.
pub fn encode_header(kind: u8, tag: FragTag) -> u8 {
    assert!(
        kind <= KIND_MASK,
        "packet kind {kind} does not fit in {} bits",
        KIND_MASK.count_ones()
    );
    kind | tag as u8
}

/// Decode a header byte into `(kind, tag)`.
pub fn decode_header(byte: u8) -> Result<(u8, FragTag), FrameError> {
    let tag = match byte & TAG_MASK {
        0x00 => FragTag::None,
        0x40 => FragTag::More,
        0x80 => FragTag::End,
        _ => return Err(FrameError::MalformedHeader(byte)),
    };
    Ok((byte & KIND_MASK, tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_kind_and_tag() {
        assert_eq!(encode_header(5, FragTag::None), 0x05);
        assert_eq!(encode_header(5, FragTag::More), 0x45);
        assert_eq!(encode_header(5, FragTag::End), 0x85);
        assert_eq!(encode_header(SPECIAL_DISCONNECT, FragTag::None), 0x3F);
    }

    #[test]
    fn every_kind_and_tag_decodes_back() {
        for kind in 0..=KIND_MASK {
            for tag in [FragTag::None, FragTag::More, FragTag::End] {
                assert_eq!(decode_header(encode_header(kind, tag)), Ok((kind, tag)));
            }
        }
    }

    #[test]
    fn unused_tag_is_malformed() {
        assert_eq!(decode_header(0xC3), Err(FrameError::MalformedHeader(0xC3)));
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn oversized_kind_fails_fast() {
        encode_header(64, FragTag::None);
    }
}
