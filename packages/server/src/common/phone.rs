// E.164 phone number validation.

use lazy_static::lazy_static;
use regex::Regex;

use crate::common::CoreError;

lazy_static! {
    // + followed by a country code (no leading zero) and 7-15 digits total.
    static ref E164: Regex = Regex::new(r"^\+[1-9]\d{6,14}$").expect("E.164 regex is valid");
}

pub fn is_valid_e164(phone: &str) -> bool {
    E164.is_match(phone)
}

pub fn validate_e164(phone: &str) -> Result<(), CoreError> {
    if is_valid_e164(phone) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "'{}' is not a valid E.164 phone number",
            phone
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_valid_numbers() {
        assert!(is_valid_e164("+14155550101"));
        assert!(is_valid_e164("+442071838750"));
        assert!(is_valid_e164("+61291234567"));
    }

    #[test]
    fn test_rejects_invalid_numbers() {
        assert!(!is_valid_e164("14155550101")); // missing +
        assert!(!is_valid_e164("+04155550101")); // leading zero country code
        assert!(!is_valid_e164("+14155")); // too short
        assert!(!is_valid_e164("+1415555010155555")); // too long
        assert!(!is_valid_e164("+1 415 555 0101")); // spaces
        assert!(!is_valid_e164(""));
    }

    #[test]
    fn test_validate_reports_the_offending_value() {
        let err = validate_e164("bogus").unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}
