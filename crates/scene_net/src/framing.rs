//! Two-byte little-endian prefixes.
//!
//! System request frames are `[u16 request id][body]`; scene frames are
//! `[u16 route index][payload]`. Both use the same prefix helpers.

use crate::error::NetError;

/// Size of the id / route-index prefix in bytes.
pub const PREFIX_LEN: usize = 2;

/// Prepend `id` (little-endian) to `body`.
#[must_use]
pub fn prefix(id: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREFIX_LEN + body.len());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Split a frame into its leading id and the remaining body.
///
/// # Errors
///
/// Returns [`NetError::Frame`] if the frame is shorter than [`PREFIX_LEN`].
pub fn split_prefix(frame: &[u8]) -> Result<(u16, &[u8]), NetError> {
    if frame.len() < PREFIX_LEN {
        return Err(NetError::Frame(format!(
            "expected at least {PREFIX_LEN} bytes, got {}",
            frame.len()
        )));
    }
    let id = u16::from_le_bytes([frame[0], frame[1]]);
    Ok((id, &frame[PREFIX_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_is_little_endian() {
        let frame = prefix(0x0102, b"abc");
        assert_eq!(frame, vec![0x02, 0x01, b'a', b'b', b'c']);
    }

    #[test]
    fn test_split_prefix() {
        let (id, body) = split_prefix(&[0xff, 0x00, 9]).unwrap();
        assert_eq!(id, 255);
        assert_eq!(body, &[9]);
    }

    #[test]
    fn test_split_prefix_exact_length_has_empty_body() {
        let (id, body) = split_prefix(&[1, 0]).unwrap();
        assert_eq!(id, 1);
        assert!(body.is_empty());
    }

    #[test]
    fn test_split_prefix_too_short() {
        assert!(matches!(split_prefix(&[1]), Err(NetError::Frame(_))));
        assert!(split_prefix(&[]).is_err());
    }
}
