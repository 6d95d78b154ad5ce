use regex::Regex;

use crate::error::ChatError;

pub const WHATSAPP_SCHEME: &str = "whatsapp:";

/// Canonical counterparty address: `+` followed by 10 to 15 digits, with any
/// `whatsapp:` scheme and common separators removed. A missing `+` is added so
/// `5511999990000` and `+5511999990000` name the same counterparty.
pub fn normalize_address(raw: &str) -> Result<String, ChatError> {
    let trimmed = raw.trim();
    let without_scheme = trimmed.strip_prefix(WHATSAPP_SCHEME).unwrap_or(trimmed);
    let compact = without_scheme
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect::<String>();

    let valid = Regex::new(r"^\+?[0-9]{10,15}$")
        .map(|re| re.is_match(&compact))
        .unwrap_or(false);
    if !valid {
        return Err(ChatError::Validation(format!(
            "invalid address '{trimmed}', expected +<country><number>"
        )));
    }
    if compact.starts_with('+') {
        Ok(compact)
    } else {
        Ok(format!("+{compact}"))
    }
}

/// Address in the form the outbound provider expects.
pub fn whatsapp_destination(address: &str) -> String {
    if address.starts_with(WHATSAPP_SCHEME) {
        address.to_string()
    } else {
        format!("{WHATSAPP_SCHEME}{address}")
    }
}

pub fn address_digits(address: &str) -> String {
    address.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn validate_body(raw: &str, max_chars: usize) -> Result<String, ChatError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ChatError::Validation("message body is empty".into()));
    }
    let length = trimmed.chars().count();
    if length > max_chars {
        return Err(ChatError::Validation(format!(
            "message body has {length} characters, maximum is {max_chars}"
        )));
    }
    Ok(trimmed.to_string())
}
