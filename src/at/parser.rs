//! Final-response token recognition and small line-parsing helpers, folded
//! in from the same place the original ModemManager kept its generic
//! string/number utilities — this crate's scope only needs them for the AT
//! backend, so they live next to its parser rather than in a standalone
//! module.

use super::{AtError, FinalResponse};

/// Classify a trimmed line as a final-response token, if it is one.
pub fn classify_final(line: &str) -> Option<FinalResponse> {
    if line == "OK" {
        return Some(FinalResponse::Ok);
    }
    if line == "ERROR" {
        return Some(FinalResponse::Err(AtError::EquipmentError(-1)));
    }
    if line == "NO CARRIER" {
        return Some(FinalResponse::Err(AtError::NoCarrier));
    }
    if line == "BUSY" {
        return Some(FinalResponse::Err(AtError::Busy));
    }
    if line == "NO ANSWER" {
        return Some(FinalResponse::Err(AtError::NoAnswer));
    }
    if let Some(rest) = line.strip_prefix("+CME ERROR: ") {
        return parse_int(rest).map(AtError::EquipmentError).map(FinalResponse::Err);
    }
    if let Some(rest) = line.strip_prefix("+CMS ERROR: ") {
        return parse_int(rest).map(AtError::SmsError).map(FinalResponse::Err);
    }
    None
}

fn parse_int(s: &str) -> Option<i32> {
    s.trim().parse().ok()
}

/// Trim the trailing `\r\n` / leading whitespace the way every AT line needs
/// before classification.
pub fn trim_line(raw: &str) -> &str {
    raw.trim_matches(|c| c == '\r' || c == '\n' || c == ' ')
}

/// Parse a boolean-ish "0"/"1" field, used by several vendor status lines.
pub fn parse_bool_digit(s: &str) -> Option<bool> {
    match s.trim() {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

/// Split a comma-separated response body into trimmed, quote-stripped
/// fields, e.g. `%CPININFO: 3,10,3,10` -> ["3","10","3","10"].
pub fn split_fields(body: &str) -> Vec<String> {
    body.split(',').map(|f| f.trim().trim_matches('"').to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ok() {
        assert_eq!(classify_final("OK"), Some(FinalResponse::Ok));
    }

    #[test]
    fn classifies_cme_error() {
        assert_eq!(
            classify_final("+CME ERROR: 10"),
            Some(FinalResponse::Err(AtError::EquipmentError(10)))
        );
    }

    #[test]
    fn non_final_line_is_none() {
        assert_eq!(classify_final("+CREG: 0,1"), None);
    }

    #[test]
    fn splits_fields() {
        assert_eq!(
            split_fields("3,10,3,10"),
            vec!["3".to_string(), "10".to_string(), "3".to_string(), "10".to_string()]
        );
    }
}
