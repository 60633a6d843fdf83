//! `multipart/x-mixed-replace` framing for live viewers

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Boundary token separating parts
pub const BOUNDARY: &str = "frame";

/// Content type of a live stream response
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Content type of each part
pub const PART_CONTENT_TYPE: &str = "image/jpeg";

/// Frame one image as a multipart part
///
/// ```text
/// --frame\r\n
/// Content-Type: image/jpeg\r\n
/// Content-Length: N\r\n
/// \r\n
/// <N bytes>\r\n
/// ```
#[must_use]
pub fn encode_part(image: &[u8]) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: {PART_CONTENT_TYPE}\r\nContent-Length: {}\r\n\r\n",
        image.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + image.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(image);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Decode a base64 image as sent by devices
///
/// Accepts plain base64 or a `data:` URL; surrounding whitespace is ignored.
///
/// # Errors
///
/// Returns `Error::Validation` for empty or malformed input
pub fn decode_image(raw: &str) -> Result<Bytes> {
    let raw = raw.trim();
    let encoded = match raw.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, data)| data),
        None => raw,
    };
    if encoded.is_empty() {
        return Err(Error::Validation("frame must not be empty".to_string()));
    }

    STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|e| Error::Validation(format!("frame is not valid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_carries_length_and_trailing_crlf() {
        let part = encode_part(b"\xff\xd8jpeg");
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 6\r\n\r\n"));
        assert!(part.ends_with(b"jpeg\r\n"));
    }

    #[test]
    fn decodes_plain_and_data_url() {
        assert_eq!(decode_image("aGVsbG8=").unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(
            decode_image(" data:image/jpeg;base64,aGVsbG8=\n").unwrap(),
            Bytes::from_static(b"hello")
        );
        assert!(matches!(decode_image("  "), Err(Error::Validation(_))));
        assert!(matches!(decode_image("not base64!"), Err(Error::Validation(_))));
    }
}
