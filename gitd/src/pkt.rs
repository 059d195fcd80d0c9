//! Packet-line framing for the Git wire protocol.
//!
//! A line of content `s` travels as a four-hex-digit length prefix equal
//! to `len(s) + 4` in lowercase hex, followed by `s`. The flush packet is
//! the literal `0000`.

use std::io::Read;

use crate::error::{Error, Result};

/// The flush packet.
pub const FLUSH: &[u8] = b"0000";

/// Largest payload a single packet-line may carry.
const MAX_PAYLOAD: usize = 65516;

/// Frame `payload` as a single packet-line.
pub fn pkt_line(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(format!("{:04x}", payload.len() + 4).as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Frame a UTF-8 line as a packet-line.
pub fn pkt_line_str(payload: &str) -> Vec<u8> {
    pkt_line(payload.as_bytes())
}

/// Read one packet-line from `r`.
///
/// Returns `None` for a flush packet, `Some(payload)` otherwise.
pub fn read_pkt_line(r: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;

    let len_str = std::str::from_utf8(&len_buf)
        .map_err(|_| Error::invalid_input("packet length is not ASCII hex"))?;
    let len = usize::from_str_radix(len_str, 16)
        .map_err(|_| Error::invalid_input(format!("bad packet length {:?}", len_str)))?;

    if len == 0 {
        return Ok(None);
    }
    if len < 4 || len - 4 > MAX_PAYLOAD {
        return Err(Error::invalid_input(format!("bad packet length {}", len)));
    }

    let mut payload = vec![0u8; len - 4];
    r.read_exact(&mut payload)?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_with_hex_prefix() {
        assert_eq!(
            pkt_line_str("# service=git-upload-pack\n"),
            b"001e# service=git-upload-pack\n".to_vec()
        );
    }

    #[test]
    fn empty_payload_is_0004() {
        assert_eq!(pkt_line(b""), b"0004".to_vec());
    }

    #[test]
    fn read_round_trip() {
        let framed = pkt_line_str("git-upload-pack /demo.git\0host=example.com\0");
        let mut cur = std::io::Cursor::new(framed);
        let payload = read_pkt_line(&mut cur).unwrap().unwrap();
        assert_eq!(payload, b"git-upload-pack /demo.git\0host=example.com\0");
    }

    #[test]
    fn read_flush_is_none() {
        let mut cur = std::io::Cursor::new(FLUSH.to_vec());
        assert!(read_pkt_line(&mut cur).unwrap().is_none());
    }

    #[test]
    fn read_rejects_garbage_length() {
        let mut cur = std::io::Cursor::new(b"zzzzpayload".to_vec());
        assert!(read_pkt_line(&mut cur).is_err());
        let mut cur = std::io::Cursor::new(b"0002".to_vec());
        assert!(read_pkt_line(&mut cur).is_err());
    }
}
