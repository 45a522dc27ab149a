use crate::common::{FaceLockError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};

/// Upper bound on one frame body; uploads are the largest messages.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Writes `message` as a u32 little-endian length followed by its bincode body.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = bincode::serialize(message)
        .map_err(|e| FaceLockError::Protocol(format!("failed to serialize message: {}", e)))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(FaceLockError::Protocol(format!(
            "message too large: {} bytes", body.len()
        )));
    }

    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the connection cleanly
/// before sending another frame.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(FaceLockError::Protocol(format!("frame too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let message = bincode::deserialize(&body)
        .map_err(|e| FaceLockError::Protocol(format!("failed to deserialize message: {}", e)))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_is_length_prefixed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &"unlock".to_string()).unwrap();
        let body_len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(body_len, buf.len() - 4);

        let decoded: Option<String> = read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded.as_deref(), Some("unlock"));
    }

    #[test]
    fn empty_stream_is_a_clean_close() {
        let decoded: Option<String> = read_frame(&mut Cursor::new(Vec::new())).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn oversized_length_is_rejected_before_allocating() {
        let mut buf = ((MAX_FRAME_BYTES + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        let result: Result<Option<String>> = read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(FaceLockError::Protocol(_))));
    }
}
