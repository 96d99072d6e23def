//! QMUX frame encode/decode: the 1-byte marker, 2-byte length, flags,
//! service/client routing, control flags, transaction id, message id and
//! message-scoped TLV body that every QMI exchange is wrapped in.

use super::QmiError;

const QMUX_MARKER: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlags {
    /// A caller-initiated request.
    Request,
    /// A reply correlated to a request by transaction id.
    Response,
    /// An unsolicited indication; carries no transaction the caller awaits.
    Indication,
}

impl ControlFlags {
    fn bits(self) -> u8 {
        match self {
            ControlFlags::Request => 0x00,
            ControlFlags::Response => 0x01,
            ControlFlags::Indication => 0x02,
        }
    }

    fn from_bits(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(ControlFlags::Request),
            0x01 => Some(ControlFlags::Response),
            0x02 => Some(ControlFlags::Indication),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QmuxFrame {
    pub service: u8,
    pub client_id: u8,
    pub control_flags: ControlFlags,
    pub transaction_id: u16,
    pub message_id: u16,
    pub body: Vec<u8>,
}

/// Serialize a frame onto the wire, including the 1-byte QMUX marker and the
/// 2-byte total-length prefix (length counts everything after itself).
pub fn encode(frame: &QmuxFrame) -> Vec<u8> {
    let msg_len = frame.body.len() as u16;
    // service header (flags, service, client) + qmi header (control-flags,
    // transaction-id, message-id, message-length) + body.
    let payload_len = 1 + 1 + 1 + 1 + 2 + 2 + 2 + frame.body.len();
    let total_len = (payload_len + 2) as u16; // + the length field itself

    let mut out = Vec::with_capacity(1 + 2 + payload_len);
    out.push(QMUX_MARKER);
    out.extend_from_slice(&total_len.to_le_bytes());
    out.push(0x80); // qmux flags: always a service message
    out.push(frame.service);
    out.push(frame.client_id);
    out.push(frame.control_flags.bits());
    out.extend_from_slice(&frame.transaction_id.to_le_bytes());
    out.extend_from_slice(&frame.message_id.to_le_bytes());
    out.extend_from_slice(&msg_len.to_le_bytes());
    out.extend_from_slice(&frame.body);
    out
}

/// Parse one QMUX frame out of a complete buffer (the caller is responsible
/// for knowing the frame boundary, typically from a length-prefixed read).
pub fn decode(data: &[u8]) -> Result<QmuxFrame, QmiError> {
    if data.len() < 3 || data[0] != QMUX_MARKER {
        return Err(QmiError::Framing("missing qmux marker".into()));
    }
    let total_len = u16::from_le_bytes([data[1], data[2]]) as usize;
    let declared = total_len
        .checked_sub(2)
        .ok_or_else(|| QmiError::Framing("declared length shorter than its own field".into()))?;
    if data.len() < 3 + declared {
        return Err(QmiError::Framing("frame shorter than declared length".into()));
    }
    if data.len() < 13 {
        return Err(QmiError::Framing("truncated qmux header".into()));
    }
    let service = data[4];
    let client_id = data[5];
    let control_flags = ControlFlags::from_bits(data[6])
        .ok_or_else(|| QmiError::Framing(format!("unknown control flags {:#x}", data[6])))?;
    let transaction_id = u16::from_le_bytes([data[7], data[8]]);
    let message_id = u16::from_le_bytes([data[9], data[10]]);
    let message_len = u16::from_le_bytes([data[11], data[12]]) as usize;
    if data.len() < 13 + message_len {
        return Err(QmiError::Framing("truncated message body".into()));
    }
    let body = data[13..13 + message_len].to_vec();

    Ok(QmuxFrame { service, client_id, control_flags, transaction_id, message_id, body })
}

/// Read the declared total frame length from a buffer that starts with the
/// QMUX marker, so the port knows how many more bytes to read before
/// calling [`decode`].
pub fn declared_len(header: &[u8; 3]) -> Result<usize, QmiError> {
    if header[0] != QMUX_MARKER {
        return Err(QmiError::Framing("missing qmux marker".into()));
    }
    let total_len = u16::from_le_bytes([header[1], header[2]]) as usize;
    // total_len counts itself onward from the length field; the marker byte
    // is one additional byte before it.
    Ok(1 + total_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let frame = QmuxFrame {
            service: 0x02,
            client_id: 0x01,
            control_flags: ControlFlags::Request,
            transaction_id: 7,
            message_id: 0x0020,
            body: vec![0x01, 0x04, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef],
        };
        let bytes = encode(&frame);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn declared_len_matches_encoded_size() {
        let frame = QmuxFrame {
            service: 0x03,
            client_id: 0x02,
            control_flags: ControlFlags::Response,
            transaction_id: 1,
            message_id: 0x0021,
            body: vec![],
        };
        let bytes = encode(&frame);
        let mut header = [0u8; 3];
        header.copy_from_slice(&bytes[0..3]);
        assert_eq!(declared_len(&header).unwrap(), bytes.len());
    }

    #[test]
    fn rejects_bad_marker() {
        assert!(decode(&[0x00, 0x00, 0x00]).is_err());
    }
}
