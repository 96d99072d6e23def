//! 3GPP TS 23.040 SMS PDU codec: submit encode, deliver decode, and the
//! supporting address/timestamp/DCS/GSM-7 modules.

pub mod address;
pub mod dcs;
pub mod gsm7;
pub mod timestamp;

use thiserror::Error;

use address::{Address, AddressType};
use dcs::Alphabet;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum PduError {
    #[error("invalid address")]
    InvalidAddress,
    #[error("encoded user data would exceed a single part")]
    EncodingTooLong,
    #[error("unsupported message type indicator")]
    UnsupportedMti,
    #[error("pdu truncated")]
    Truncated,
    #[error("character '{0}' is not representable in the selected alphabet")]
    UnencodableChar(char),
}

const MTI_DELIVER: u8 = 0x00;
const MTI_SUBMIT: u8 = 0x01;
const MAX_UDL_OCTETS: usize = 140;

/// User data header concatenation info, when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concatenation {
    pub reference: u16,
    pub total_parts: u8,
    pub sequence: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverFields {
    pub smsc: Option<String>,
    pub sender: String,
    pub timestamp: String,
    pub text: String,
    pub data_coding_scheme: u8,
    pub concatenation: Option<Concatenation>,
}

fn encode_smsc(smsc: Option<&str>) -> Result<Vec<u8>, PduError> {
    match smsc {
        None => Ok(vec![0x00]),
        Some(number) => {
            let addr = Address::new(number)?;
            let addr_bytes = encode_address_type_and_digits(&addr);
            let mut out = Vec::with_capacity(1 + addr_bytes.len());
            out.push(addr_bytes.len() as u8);
            out.extend_from_slice(&addr_bytes);
            Ok(out)
        }
    }
}

/// Encode just the type-of-address octet plus BCD digits (used by the SMSC
/// block, which counts length in octets rather than semi-octets).
fn encode_address_type_and_digits(addr: &Address) -> Vec<u8> {
    let full = address::encode(addr);
    // address::encode emits [len][type][digits...]; drop the leading
    // semi-octet length byte for the SMSC form.
    full[1..].to_vec()
}

fn decode_smsc(data: &[u8]) -> Result<(Option<String>, usize), PduError> {
    if data.is_empty() {
        return Err(PduError::Truncated);
    }
    let len = data[0] as usize;
    if len == 0 {
        return Ok((None, 1));
    }
    if data.len() < 1 + len {
        return Err(PduError::Truncated);
    }
    let type_byte = data[1];
    let digit_octets = len - 1;
    let digits = address::bcd_unpack(&data[2..2 + digit_octets]);
    let ty_bits = (type_byte >> 4) & 0x7;
    let display = if ty_bits == 1 { format!("+{digits}") } else { digits };
    Ok((Some(display), 1 + len))
}

/// Encode a SUBMIT TPDU. Returns the full byte buffer (SMSC block + TPDU)
/// and the offset of the first TPDU octet (i.e. the length of the SMSC
/// block).
pub fn encode_submit(
    dst_number: &str,
    text: &str,
    smsc: Option<&str>,
    validity: u8,
    class: Option<u8>,
) -> Result<(Vec<u8>, usize), PduError> {
    let mut out = encode_smsc(smsc)?;
    let msg_start_offset = out.len();

    let dst = Address::new(dst_number)?;

    let septets = gsm7::encode_septets(text);
    let (alphabet, udl, ud) = match septets {
        Ok(septets) => {
            if septets.len() > 160 {
                return Err(PduError::EncodingTooLong);
            }
            (Alphabet::Gsm7, septets.len() as u8, gsm7::pack(&septets, 0))
        }
        Err(_) => {
            let units: Vec<u8> =
                text.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
            if units.len() > MAX_UDL_OCTETS {
                return Err(PduError::EncodingTooLong);
            }
            (Alphabet::Ucs2, units.len() as u8, units)
        }
    };

    let flags: u8 = MTI_SUBMIT | if validity > 0 { 0b0001_0000 } else { 0 }; // TP-VPF = relative
    out.push(flags);
    out.push(0x00); // TP-MR, assigned by the modem
    out.extend_from_slice(&address::encode(&dst));
    out.push(0x00); // TP-PID
    out.push(dcs::encode(alphabet, class.unwrap_or(0)));
    if validity > 0 {
        out.push(encode_relative_vp(validity));
    }
    out.push(udl);
    out.extend_from_slice(&ud);

    Ok((out, msg_start_offset))
}

/// Encode a TP-VP relative-format validity period per 23.040 §9.2.3.12.1.
/// `minutes` is the caller's requested validity in minutes; the wire value
/// is the 5-minute-bucket index (`minutes` here never exceeds a `u8`, so
/// only the 0..=143 "up to 12 hours" range of the table is reachable).
fn encode_relative_vp(minutes: u8) -> u8 {
    (((minutes as u16 + 4) / 5).saturating_sub(1)) as u8
}

/// Decode a DELIVER TPDU (optionally prefixed by an SMSC block, as produced
/// by a modem's raw PDU read).
pub fn decode_deliver(bytes: &[u8]) -> Result<DeliverFields, PduError> {
    let (smsc, mut offset) = decode_smsc(bytes)?;

    if bytes.len() <= offset {
        return Err(PduError::Truncated);
    }
    let flags = bytes[offset];
    offset += 1;
    if flags & 0x03 != MTI_DELIVER {
        return Err(PduError::UnsupportedMti);
    }
    let udhi = flags & 0x40 != 0;

    let (sender, consumed) = address::decode(&bytes[offset..])?;
    offset += consumed;

    if bytes.len() < offset + 2 {
        return Err(PduError::Truncated);
    }
    offset += 1; // TP-PID
    let dcs_byte = bytes[offset];
    offset += 1;
    let dcs = dcs::decode(dcs_byte);

    if bytes.len() < offset + 7 {
        return Err(PduError::Truncated);
    }
    let ts = timestamp::decode(&bytes[offset..offset + 7])?;
    offset += 7;

    if bytes.is_empty() || offset >= bytes.len() {
        return Err(PduError::Truncated);
    }
    let udl = bytes[offset] as usize;
    offset += 1;
    let ud = &bytes[offset..];

    let mut concatenation = None;
    let mut header_octets = 0usize;
    let mut padding_bits = 0usize;

    if udhi {
        if ud.is_empty() {
            return Err(PduError::Truncated);
        }
        let udhl = ud[0] as usize;
        header_octets = 1 + udhl;
        if ud.len() < header_octets {
            return Err(PduError::Truncated);
        }
        concatenation = parse_concatenation(&ud[1..header_octets]);
        padding_bits = (7 - ((header_octets * 8) % 7)) % 7;
    }

    let text = match dcs.alphabet {
        Alphabet::Gsm7 => {
            let header_septets = if header_octets > 0 {
                ((header_octets * 8) + padding_bits) / 7
            } else {
                0
            };
            let septet_count = udl.saturating_sub(header_septets);
            let bit_offset = header_octets * 8 + padding_bits;
            let septets = gsm7::unpack(ud, bit_offset, septet_count);
            gsm7::decode_septets(&septets)
        }
        Alphabet::EightBit => {
            let payload = &ud[header_octets..];
            String::from_utf8_lossy(payload).into_owned()
        }
        Alphabet::Ucs2 => {
            let payload = &ud[header_octets..];
            let units: Vec<u16> =
                payload.chunks(2).filter(|c| c.len() == 2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
            String::from_utf16_lossy(&units)
        }
    };

    Ok(DeliverFields {
        smsc,
        sender: sender.display(),
        timestamp: ts.render(),
        text,
        data_coding_scheme: dcs_byte,
        concatenation,
    })
}

fn parse_concatenation(ies: &[u8]) -> Option<Concatenation> {
    let mut i = 0;
    while i + 1 < ies.len() {
        let id = ies[i];
        let len = ies[i + 1] as usize;
        if i + 2 + len > ies.len() {
            return None;
        }
        let data = &ies[i + 2..i + 2 + len];
        match id {
            0x00 if len == 3 => {
                return Some(Concatenation {
                    reference: data[0] as u16,
                    total_parts: data[1],
                    sequence: data[2],
                });
            }
            0x08 if len == 4 => {
                return Some(Concatenation {
                    reference: u16::from_be_bytes([data[0], data[1]]),
                    total_parts: data[2],
                    sequence: data[3],
                });
            }
            _ => {}
        }
        i += 2 + len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_smsc_prefix_matches_reference() {
        let (bytes, offset) =
            encode_submit("+15555551234", "hello", Some("+19037029920"), 5, Some(0)).unwrap();
        assert_eq!(offset, 8);
        assert_eq!(&bytes[0..8], &[0x07, 0x91, 0x91, 0x30, 0x07, 0x92, 0x29, 0xF0]);
    }

    #[test]
    fn submit_no_smsc_offset_is_one() {
        let (bytes, offset) =
            encode_submit("+15556661234", "Test", None, 5, None).unwrap();
        assert_eq!(offset, 1);
        assert_eq!(bytes[0], 0x00);
    }

    #[test]
    fn gsm7_submit_roundtrips_through_deliver_shape() {
        // Build a DELIVER-shaped PDU by hand using the same encode helpers,
        // to exercise decode_deliver's GSM-7 path end to end.
        let text = "Hello there";
        let septets = gsm7::encode_septets(text).unwrap();
        let mut pdu = vec![0x00]; // no SMSC
        pdu.push(MTI_DELIVER);
        pdu.extend_from_slice(&address::encode(&Address::new("+15551234567").unwrap()));
        pdu.push(0x00); // PID
        pdu.push(dcs::encode(Alphabet::Gsm7, 0));
        pdu.extend_from_slice(&timestamp::encode(&timestamp::Timestamp {
            year: 24,
            month: 1,
            day: 2,
            hour: 3,
            minute: 4,
            second: 5,
            tz_quarters: 0,
        }));
        pdu.push(septets.len() as u8);
        pdu.extend_from_slice(&gsm7::pack(&septets, 0));

        let decoded = decode_deliver(&pdu).unwrap();
        assert_eq!(decoded.text, text);
        assert_eq!(decoded.sender, "+15551234567");
    }

    #[test]
    fn ucs2_submit_decode_roundtrip() {
        let text = "тест";
        let (bytes, offset) = encode_submit("+15555551234", text, None, 0, None).unwrap();
        // Re-frame the SUBMIT TPDU as a DELIVER for decode by flipping MTI
        // and inserting a timestamp, exercising the UCS-2 decode path.
        let mut deliver = vec![0x00u8];
        let flags = bytes[offset];
        deliver.push(flags & !0x03); // MTI = DELIVER
        let mut rest = bytes[offset + 2..].to_vec(); // skip flags + TP-MR
        let addr_len = 2 + ((rest[0] as usize + 1) / 2);
        deliver.extend_from_slice(&rest[..addr_len]);
        rest.drain(..addr_len);
        deliver.push(rest[0]); // PID
        deliver.push(rest[1]); // DCS
        deliver.extend_from_slice(&timestamp::encode(&timestamp::Timestamp {
            year: 24,
            month: 1,
            day: 2,
            hour: 3,
            minute: 4,
            second: 5,
            tz_quarters: 0,
        }));
        deliver.extend_from_slice(&rest[2..]); // UDL + UD

        let decoded = decode_deliver(&deliver).unwrap();
        assert_eq!(decoded.text, text);
    }

    #[test]
    fn unencodable_alphanumeric_address_falls_back() {
        assert_eq!(Address::new("not-a-number").unwrap_err(), PduError::InvalidAddress);
    }

    #[test]
    fn too_long_gsm7_message_is_rejected() {
        let text = "A".repeat(161);
        assert_eq!(
            encode_submit("+15551234567", &text, None, 0, None).unwrap_err(),
            PduError::EncodingTooLong
        );
    }

    // The five reference vectors below reproduce real deliver/submit PDUs
    // (alphanumeric sender, GSM-7 with extension chars, UDHI padding, and
    // two submit encodes) byte-for-byte.

    #[test]
    fn decode_alphanumeric_sender_ucs2() {
        let pdu: &[u8] = &[
            0x07, 0x91, 0x97, 0x30, 0x07, 0x11, 0x11, 0xf1, 0x04, 0x14, 0xd0, 0x49, 0x37, 0xbd,
            0x2c, 0x77, 0x97, 0xe9, 0xd3, 0xe6, 0x14, 0x00, 0x08, 0x11, 0x30, 0x92, 0x91, 0x02,
            0x40, 0x61, 0x08, 0x04, 0x42, 0x04, 0x35, 0x04, 0x41, 0x04, 0x42,
        ];
        let decoded = decode_deliver(pdu).unwrap();
        assert_eq!(decoded.smsc.as_deref(), Some("+79037011111"));
        assert_eq!(decoded.sender, "InternetSMS");
        assert_eq!(decoded.timestamp, "110329192004+04");
        assert_eq!(decoded.text, "тест");
    }

    #[test]
    fn decode_gsm7_with_extension_chars() {
        let pdu: &[u8] = &[
            0x07, 0x91, 0x21, 0x04, 0x44, 0x29, 0x61, 0xf4, 0x04, 0x0b, 0x91, 0x61, 0x71, 0x95,
            0x72, 0x91, 0xf8, 0x00, 0x00, 0x11, 0x20, 0x82, 0x11, 0x05, 0x05, 0x0a, 0x6a, 0xc8,
            0xb2, 0xbc, 0x7c, 0x9a, 0x83, 0xc2, 0x20, 0xf6, 0xdb, 0x7d, 0x2e, 0xcb, 0x41, 0xed,
            0xf2, 0x7c, 0x1e, 0x3e, 0x97, 0x41, 0x1b, 0xde, 0x06, 0x75, 0x4f, 0xd3, 0xd1, 0xa0,
            0xf9, 0xbb, 0x5d, 0x06, 0x95, 0xf1, 0xf4, 0xb2, 0x9b, 0x5c, 0x26, 0x83, 0xc6, 0xe8,
            0xb0, 0x3c, 0x3c, 0xa6, 0x97, 0xe5, 0xf3, 0x4d, 0x6a, 0xe3, 0x03, 0xd1, 0xd1, 0xf2,
            0xf7, 0xdd, 0x0d, 0x4a, 0xbb, 0x59, 0xa0, 0x79, 0x7d, 0x8c, 0x06, 0x85, 0xe7, 0xa0,
            0x00, 0x28, 0xec, 0x26, 0x83, 0x2a, 0x96, 0x0b, 0x28, 0xec, 0x26, 0x83, 0xbe, 0x60,
            0x50, 0x78, 0x0e, 0xba, 0x97, 0xd9, 0x6c, 0x17,
        ];
        let decoded = decode_deliver(pdu).unwrap();
        assert_eq!(decoded.smsc.as_deref(), Some("+12404492164"));
        assert_eq!(decoded.sender, "+16175927198");
        assert_eq!(decoded.timestamp, "110228115050-05");
        assert_eq!(
            decoded.text,
            "Here's a longer message [{with some extended characters}] thrown in, \
             such as £ and ΩΠΨ and §¿ as well."
        );
    }

    #[test]
    fn decode_udhi_concatenation_padding() {
        let pdu = crate::hex::decode(
            "07911356131313F64004850120390011609232239180A0060804001002\
             01D7327BFD6EB340E2321BF46E83EA7790F59D1E97DBE1341B442F83C4\
             65763D3DA797E56537C81D0ECB41AB59CC1693C16031D96C064241E56\
             56838AF03A96230982A269BCD462917C8FA4E8FCBED709A0D7ABBE9F6\
             B0FB5C7683D27350984D4FABC9A0B33C4C4FCF5D20EBFB2D079DCB627\
             93DBD06D9C36E50FB2D4E97D9A0B49B5E96BBCB",
        )
        .unwrap();
        let decoded = decode_deliver(&pdu).unwrap();
        assert_eq!(decoded.smsc.as_deref(), Some("+31653131316"));
        assert_eq!(decoded.timestamp, "110629233219+02");
        assert!(decoded.concatenation.is_some());
        assert!(decoded
            .text
            .starts_with("Welkom, bel om uw Voicemail te beluisteren naar +31612001233"));
    }

    #[test]
    fn encode_submit_ucs2_with_smsc_matches_reference() {
        let (bytes, offset) = encode_submit(
            "+15555551234",
            "Да здравствует король, детка!",
            Some("+19037029920"),
            5,
            Some(0),
        )
        .unwrap();
        assert_eq!(offset, 8);
        assert_eq!(bytes.len(), 80);
        assert_eq!(&bytes[0..8], &[0x07, 0x91, 0x91, 0x30, 0x07, 0x92, 0x29, 0xF0]);
        let expected_tail: &[u8] = &[
            0x11, 0x00, 0x0B, 0x91, 0x51, 0x55, 0x55, 0x15, 0x32, 0xF4, 0x00, 0x08, 0x00, 0x3A,
            0x04, 0x14, 0x04, 0x30, 0x00, 0x20, 0x04, 0x37, 0x04, 0x34, 0x04, 0x40, 0x04, 0x30,
            0x04, 0x32, 0x04, 0x41, 0x04, 0x42, 0x04, 0x32, 0x04, 0x43, 0x04, 0x35, 0x04, 0x42,
            0x00, 0x20, 0x04, 0x3A, 0x04, 0x3E, 0x04, 0x40, 0x04, 0x3E, 0x04, 0x3B, 0x04, 0x4C,
            0x00, 0x2C, 0x00, 0x20, 0x04, 0x34, 0x04, 0x35, 0x04, 0x42, 0x04, 0x3A, 0x04, 0x30,
            0x00, 0x21,
        ];
        assert_eq!(&bytes[8..], expected_tail);
    }

    #[test]
    fn encode_submit_gsm7_final_septet_own_octet_matches_reference() {
        let (bytes, offset) =
            encode_submit("+15556661234", "This is really cool ΔΔΔΔΔ", None, 5, None).unwrap();
        assert_eq!(offset, 1);
        let expected: &[u8] = &[
            0x00, 0x11, 0x00, 0x0B, 0x91, 0x51, 0x55, 0x66, 0x16, 0x32, 0xF4, 0x00, 0x00, 0x00,
            0x19, 0x54, 0x74, 0x7A, 0x0E, 0x4A, 0xCF, 0x41, 0xF2, 0x72, 0x98, 0xCD, 0xCE, 0x83,
            0xC6, 0xEF, 0x37, 0x1B, 0x04, 0x81, 0x40, 0x20, 0x10,
        ];
        assert_eq!(bytes, expected);
    }
}
