//! Length-prefixed CBOR frames.
//!
//! ```text
//! | len: u32 (big-endian) | CBOR body (len bytes) |
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serializes `message` and writes it as one frame.
///
/// # Errors
///
/// Fails if the message cannot be encoded, is too large, or the write fails.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> ProtocolResult<()> {
    let mut body = Vec::new();
    ciborium::into_writer(message, &mut body).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: body.len(),
        max: MAX_FRAME_LEN,
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` if the stream ends cleanly before a new frame.
///
/// # Errors
///
/// Fails on I/O errors, oversized frames, a stream that ends inside a
/// frame, or a body that does not decode as `T`.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> ProtocolResult<Option<T>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ProtocolError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ProtocolError::Truncated,
        _ => ProtocolError::Io(e),
    })?;
    ciborium::from_reader(body.as_slice())
        .map(Some)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Request, Response};
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn frames_follow_each_other() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::FailedTransactions).unwrap();
        write_frame(
            &mut buf,
            &Request::CreateFile {
                session: 3,
                path: "/a".into(),
                directory: false,
            },
        )
        .unwrap();

        let mut cursor = Cursor::new(buf);
        let first: Request = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(first, Request::FailedTransactions);
        let second: Request = read_frame(&mut cursor).unwrap().unwrap();
        assert!(matches!(second, Request::CreateFile { session: 3, .. }));
        assert!(read_frame::<_, Request>(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn length_is_big_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Response::Done).unwrap();
        let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(len, buf.len() - 4);
    }

    #[test]
    fn truncated_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Response::Names(vec!["x".into()])).unwrap();
        buf.pop();
        let err = read_frame::<_, Response>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));

        let err = read_frame::<_, Response>(&mut Cursor::new(vec![0u8, 0])).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));
    }

    #[test]
    fn oversized_frame_rejected() {
        let header = u32::MAX.to_be_bytes().to_vec();
        let err = read_frame::<_, Response>(&mut Cursor::new(header)).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn garbage_body_is_decode_error() {
        let mut buf = 3u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0xff, 0xff, 0xff]);
        let err = read_frame::<_, Request>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    proptest! {
        #[test]
        fn arbitrary_input_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut cursor = Cursor::new(bytes);
            while let Ok(Some(_)) = read_frame::<_, Request>(&mut cursor) {}
        }

        #[test]
        fn written_data_reads_back(data in proptest::collection::vec(any::<u8>(), 0..2048), stream in any::<u32>()) {
            let mut buf = Vec::new();
            let request = Request::Write { stream, data };
            write_frame(&mut buf, &request).unwrap();
            let decoded: Request = read_frame(&mut Cursor::new(buf)).unwrap().unwrap();
            prop_assert_eq!(decoded, request);
        }
    }
}
