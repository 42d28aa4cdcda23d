//! Shared value objects used across multiple bounded contexts

use serde::{Deserialize, Serialize};
use std::fmt;

/// Remote contact, always in international format (`+CC...`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(String);

impl ContactId {
    /// Normalize a dialled number or URI into a contact id
    pub fn parse(input: &str, country_code: &str) -> Option<Self> {
        let number = extract_number_from_uri(input);
        format_number_to_international(&number, country_code).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `sip:+CC...@domain;user=phone`
    pub fn to_sip_uri(&self, domain: &str) -> String {
        format_to_sip_uri(&self.0, domain)
    }

    /// `tel:+CC...`
    pub fn to_tel_uri(&self) -> String {
        format!("tel:{}", self.0)
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Minimum digits of a routable number
const MIN_NUMBER_DIGITS: usize = 4;
/// E.164 maximum
const MAX_NUMBER_DIGITS: usize = 15;

/// Convert a local or international number to `+CC...` form.
///
/// Visual separators are dropped; `00` and a national `0` prefix are
/// rewritten. Returns `None` when anything but digits remains.
pub fn format_number_to_international(number: &str, country_code: &str) -> Option<String> {
    let cleaned: String = number
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')' | '/'))
        .collect();

    let country = country_code.trim_start_matches('+');
    let international = if let Some(rest) = cleaned.strip_prefix('+') {
        format!("+{}", rest)
    } else if let Some(rest) = cleaned.strip_prefix("00") {
        format!("+{}", rest)
    } else if let Some(rest) = cleaned.strip_prefix('0') {
        format!("+{}{}", country, rest)
    } else {
        format!("+{}{}", country, cleaned)
    };

    let digits = &international[1..];
    if digits.len() < MIN_NUMBER_DIGITS
        || digits.len() > MAX_NUMBER_DIGITS
        || !digits.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some(international)
}

/// Build a SIP URI for a telephone number
pub fn format_to_sip_uri(number: &str, domain: &str) -> String {
    if number.starts_with("sip:") || number.starts_with("tel:") {
        return number.to_string();
    }
    format!("sip:{}@{};user=phone", number, domain)
}

/// User part of a SIP or tel URI, with display name and brackets removed
pub fn extract_number_from_uri(uri: &str) -> String {
    let mut value = uri.trim();
    if let (Some(start), Some(end)) = (value.find('<'), value.rfind('>')) {
        if start < end {
            value = &value[start + 1..end];
        }
    }
    let value = value
        .strip_prefix("sip:")
        .or_else(|| value.strip_prefix("sips:"))
        .or_else(|| value.strip_prefix("tel:"))
        .unwrap_or(value);
    let value = value.split('@').next().unwrap_or(value);
    value.split(';').next().unwrap_or(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number_to_international() {
        assert_eq!(
            format_number_to_international("06 12 34 56 78", "+33"),
            Some("+33612345678".to_string())
        );
        assert_eq!(
            format_number_to_international("0033612345678", "+33"),
            Some("+33612345678".to_string())
        );
        assert_eq!(
            format_number_to_international("+1 (555) 123-4567", "+33"),
            Some("+15551234567".to_string())
        );
        assert_eq!(format_number_to_international("12", "+33"), None);
        assert_eq!(format_number_to_international("06abc", "+33"), None);
    }

    #[test]
    fn test_extract_number_from_uri() {
        assert_eq!(
            extract_number_from_uri("\"Bob\" <sip:+33612345678@ims.example.com;user=phone>"),
            "+33612345678"
        );
        assert_eq!(extract_number_from_uri("tel:+33612345678"), "+33612345678");
        assert_eq!(extract_number_from_uri("+33612345678"), "+33612345678");
    }

    #[test]
    fn test_contact_id() {
        let contact = ContactId::parse("sip:0612345678@ims.example.com", "33").unwrap();
        assert_eq!(contact.as_str(), "+33612345678");
        assert_eq!(
            contact.to_sip_uri("ims.example.com"),
            "sip:+33612345678@ims.example.com;user=phone"
        );
        assert_eq!(contact.to_tel_uri(), "tel:+33612345678");
        assert!(ContactId::parse("sip:bob@example.com", "33").is_none());
    }
}
