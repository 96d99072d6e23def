//! TLV (type/length/value) helpers for QMI message bodies.

use super::QmiError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub ty: u8,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(ty: u8, value: Vec<u8>) -> Self {
        Self { ty, value }
    }

    pub fn u8(ty: u8, v: u8) -> Self {
        Self { ty, value: vec![v] }
    }

    pub fn u16_le(ty: u8, v: u16) -> Self {
        Self { ty, value: v.to_le_bytes().to_vec() }
    }

    pub fn u32_le(ty: u8, v: u32) -> Self {
        Self { ty, value: v.to_le_bytes().to_vec() }
    }

    pub fn string(ty: u8, s: &str) -> Self {
        let mut value = Vec::with_capacity(1 + s.len());
        value.push(s.len() as u8);
        value.extend_from_slice(s.as_bytes());
        Self { ty, value }
    }
}

/// Serialize a sequence of TLVs: each as `[type: u8][length: u16 LE][value]`.
pub fn encode(tlvs: &[Tlv]) -> Vec<u8> {
    let mut out = Vec::new();
    for tlv in tlvs {
        out.push(tlv.ty);
        out.extend_from_slice(&(tlv.value.len() as u16).to_le_bytes());
        out.extend_from_slice(&tlv.value);
    }
    out
}

/// Parse a TLV sequence out of a message body.
pub fn decode(mut data: &[u8]) -> Result<Vec<Tlv>, QmiError> {
    let mut out = Vec::new();
    while !data.is_empty() {
        if data.len() < 3 {
            return Err(QmiError::Framing("truncated tlv header".into()));
        }
        let ty = data[0];
        let len = u16::from_le_bytes([data[1], data[2]]) as usize;
        if data.len() < 3 + len {
            return Err(QmiError::Framing("truncated tlv value".into()));
        }
        out.push(Tlv { ty, value: data[3..3 + len].to_vec() });
        data = &data[3 + len..];
    }
    Ok(out)
}

/// Find the first TLV of the given type.
pub fn find(tlvs: &[Tlv], ty: u8) -> Option<&Tlv> {
    tlvs.iter().find(|t| t.ty == ty)
}

/// Read the universal QMI `Result` TLV (type 0x02): `u16 result, u16 error`.
pub fn read_result(tlvs: &[Tlv]) -> Option<super::QmiResult> {
    let tlv = find(tlvs, 0x02)?;
    if tlv.value.len() < 4 {
        return None;
    }
    let result = u16::from_le_bytes([tlv.value[0], tlv.value[1]]);
    let error_code = u16::from_le_bytes([tlv.value[2], tlv.value[3]]);
    Some(super::QmiResult { success: result == 0, error_code })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let tlvs = vec![Tlv::u8(0x01, 4), Tlv::u16_le(0x10, 0xABCD)];
        let bytes = encode(&tlvs);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, tlvs);
    }

    #[test]
    fn result_tlv_success() {
        let tlvs = vec![Tlv::new(0x02, vec![0x00, 0x00, 0x00, 0x00])];
        let result = read_result(&tlvs).unwrap();
        assert!(result.success);
    }

    #[test]
    fn result_tlv_failure_carries_code() {
        let tlvs = vec![Tlv::new(0x02, vec![0x01, 0x00, 0x67, 0x00])];
        let result = read_result(&tlvs).unwrap();
        assert!(!result.success);
        assert_eq!(result.error_code, super::super::QMI_ERR_NO_EFFECT);
    }
}
