//! Wire codec for transport messages
//!
//! Frame format:
//! ```text
//! +-----------------------------------+
//! |          Frame length (4B)        |
//! +-----------------------------------+
//! |          Header count (2B)        |
//! +-----------------------------------+
//! | per header:                       |
//! |   key len (2B) | key bytes        |
//! |   value len (2B) | value bytes    |
//! +-----------------------------------+
//! |          Body length (4B)         |
//! +-----------------------------------+
//! |          Body bytes               |
//! +-----------------------------------+
//! ```
//!
//! The frame length covers everything after itself. Decoding is
//! incremental: a partial buffer yields `None` until the frame is whole.

use super::{Message, TransportError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum encoded frame size (64 KB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Encode a message into a length-delimited frame
pub fn encode(msg: &Message) -> Result<BytesMut, TransportError> {
    let mut size = 2 + 4 + msg.body.len();
    for (k, v) in &msg.header {
        size += 4 + k.len() + v.len();
    }

    if size > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge(size, MAX_MESSAGE_SIZE));
    }

    let mut buf = BytesMut::with_capacity(4 + size);
    buf.put_u32(size as u32);
    buf.put_u16(msg.header.len() as u16);

    for (k, v) in &msg.header {
        buf.put_u16(k.len() as u16);
        buf.extend_from_slice(k.as_bytes());
        buf.put_u16(v.len() as u16);
        buf.extend_from_slice(v.as_bytes());
    }

    buf.put_u32(msg.body.len() as u32);
    buf.extend_from_slice(&msg.body);

    Ok(buf)
}

/// Decode one message from the buffer, consuming its bytes.
///
/// Returns `Ok(None)` when the buffer does not yet hold a whole frame.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, TransportError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    // peek at the frame length without consuming
    let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if frame_len > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge(frame_len, MAX_MESSAGE_SIZE));
    }

    if buf.len() < 4 + frame_len {
        return Ok(None);
    }

    buf.advance(4);
    let mut frame = buf.split_to(frame_len);

    let header_count = read_u16(&mut frame)? as usize;
    let mut msg = Message::new();

    for _ in 0..header_count {
        let key = read_string(&mut frame)?;
        let value = read_string(&mut frame)?;
        msg.header.insert(key, value);
    }

    let body_len = read_u32(&mut frame)? as usize;
    if frame.len() < body_len {
        return Err(TransportError::InvalidFrame(format!(
            "body length {} exceeds frame remainder {}",
            body_len,
            frame.len()
        )));
    }
    msg.body = frame.split_to(body_len).freeze();

    Ok(Some(msg))
}

fn read_u16(buf: &mut BytesMut) -> Result<u16, TransportError> {
    if buf.len() < 2 {
        return Err(TransportError::InvalidFrame("truncated u16".to_string()));
    }
    Ok(buf.get_u16())
}

fn read_u32(buf: &mut BytesMut) -> Result<u32, TransportError> {
    if buf.len() < 4 {
        return Err(TransportError::InvalidFrame("truncated u32".to_string()));
    }
    Ok(buf.get_u32())
}

fn read_string(buf: &mut BytesMut) -> Result<String, TransportError> {
    let len = read_u16(buf)? as usize;
    if buf.len() < len {
        return Err(TransportError::InvalidFrame("truncated string".to_string()));
    }
    let bytes: Bytes = buf.split_to(len).freeze();
    String::from_utf8(bytes.to_vec())
        .map_err(|_| TransportError::InvalidFrame("header is not utf-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let original = Message::from_body("hello world")
            .with_header("Content-Type", "text/plain")
            .with_header("X-Test", "1");

        let mut encoded = encode(&original).unwrap();
        let decoded = decode(&mut encoded).unwrap().unwrap();

        assert_eq!(decoded, original);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_decode_partial() {
        let msg = Message::from_body("partial");
        let encoded = encode(&msg).unwrap();

        // feed the frame one byte short
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(decode(&mut buf).unwrap().is_none());

        // complete it
        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.body, msg.body);
    }

    #[test]
    fn test_decode_two_frames() {
        let a = Message::from_body("first");
        let b = Message::from_body("second").with_header("seq", "2");

        let mut buf = encode(&a).unwrap();
        buf.extend_from_slice(&encode(&b).unwrap());

        assert_eq!(decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), b);
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_too_large() {
        let msg = Message::from_body(vec![0u8; MAX_MESSAGE_SIZE + 1]);
        assert!(matches!(
            encode(&msg),
            Err(TransportError::MessageTooLarge(_, _))
        ));
    }

    #[test]
    fn test_empty_message() {
        let msg = Message::new();
        let mut encoded = encode(&msg).unwrap();
        let decoded = decode(&mut encoded).unwrap().unwrap();
        assert!(decoded.header.is_empty());
        assert!(decoded.body.is_empty());
    }
}
