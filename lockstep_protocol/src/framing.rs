// Length-delimited packet framing over byte streams.
//
// Stream transports (TCP) have no packet boundaries, so each raw wire frame
// produced by `fragment.rs` is written as a 4-byte big-endian length prefix
// followed by the frame bytes. Both functions operate on raw `&[u8]` /
// `Vec<u8>` and know nothing about headers or kinds.
//
// The caller passes the largest packet it is willing to read. Raw frames never
// exceed `FrameLimits::max_frame_size()`, so anything larger is a malformed or
// malicious length prefix and is refused before allocating.

use std::io::{self, Read, Write};

/// Write a length-delimited packet: 4-byte big-endian length, then payload.
pub fn write_packet<W: Write>(writer: &mut W, packet: &[u8], max_len: usize) -> io::Result<()> {
    let len = packet.len();
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("packet too large: {len} bytes (max {max_len})"),
        ));
    }
    #[expect(clippy::cast_possible_truncation)]
    let len_bytes = (len as u32).to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(packet)?;
    writer.flush()?;
    Ok(())
}

/// Read a length-delimited packet: 4-byte big-endian length, then payload.
///
/// Returns `UnexpectedEof` if the stream closes before or during a packet and
/// `InvalidData` if the length exceeds `max_len`.
pub fn read_packet<R: Read>(reader: &mut R, max_len: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("packet too large: {len} bytes (max {max_len})"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::fragment::{FrameLimits, fragment};

    #[test]
    fn fragmented_message_streams_at_the_frame_bound() {
        let limits = FrameLimits::default();
        let max = limits.max_frame_size();
        let payload = vec![7u8; limits.chunk_size * 2 + 3];
        let frames = fragment(5, &payload, &limits).unwrap();
        // The opening fragment carries the total length and fills the bound.
        assert_eq!(frames[0].len(), max);

        let mut buf = Vec::new();
        for frame in &frames {
            write_packet(&mut buf, frame, max).unwrap();
        }
        let mut cursor = Cursor::new(&buf);
        for frame in &frames {
            assert_eq!(&read_packet(&mut cursor, max).unwrap(), frame);
        }
        let err = read_packet(&mut cursor, max).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn one_byte_past_the_frame_bound_is_refused() {
        let max = FrameLimits::default().max_frame_size();
        let mut buf = Vec::new();
        let err = write_packet(&mut buf, &vec![0u8; max + 1], max).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());

        // A hostile prefix is refused before its body is awaited.
        let prefix = ((max + 1) as u32).to_be_bytes();
        let err = read_packet(&mut Cursor::new(prefix.to_vec()), max).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn empty_frame_and_truncated_prefix() {
        let mut buf = Vec::new();
        write_packet(&mut buf, &[], 16).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);
        assert!(read_packet(&mut Cursor::new(&buf), 16).unwrap().is_empty());

        let err = read_packet(&mut Cursor::new(vec![0u8, 1]), 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn body_cut_short_is_eof() {
        let mut buf = Vec::new();
        write_packet(&mut buf, b"relay", 16).unwrap();
        buf.truncate(buf.len() - 2);
        let err = read_packet(&mut Cursor::new(&buf), 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
