use crate::error::BookingError;
use crate::models::ContactInfo;
use crate::pii::Masked;

const MAX_EMAIL_LEN: usize = 254;
const MAX_LOCAL_PART_LEN: usize = 64;
const MAX_LABEL_LEN: usize = 63;
const LOCAL_PART_SYMBOLS: &str = "!#$%&'*+-/=?^_`{|}~.";

/// Stateless contact validation, constructed once and handed to the services that need it.
#[derive(Debug, Clone, Copy)]
pub struct ContactValidator {
    min_phone_digits: usize,
    max_phone_digits: usize,
}

impl Default for ContactValidator {
    fn default() -> Self {
        Self::new(10, 15)
    }
}

impl ContactValidator {
    pub const fn new(min_phone_digits: usize, max_phone_digits: usize) -> Self {
        Self {
            min_phone_digits,
            max_phone_digits,
        }
    }

    /// Validates both fields and returns them trimmed.
    pub fn validate(&self, email: &str, phone_number: &str) -> Result<ContactInfo, BookingError> {
        let phone_number = self.validate_phone(phone_number)?;
        let email = self.validate_email(email)?;
        Ok(ContactInfo {
            email: Masked::new(email),
            phone_number: Masked::new(phone_number),
        })
    }

    /// Digits with an optional leading `+`, within the configured digit count.
    pub fn validate_phone(&self, phone_number: &str) -> Result<String, BookingError> {
        let phone_number = phone_number.trim();
        let digits = phone_number.strip_prefix('+').unwrap_or(phone_number);

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(BookingError::InvalidContact(
                "phone number must contain only digits".to_string(),
            ));
        }
        if digits.len() < self.min_phone_digits || digits.len() > self.max_phone_digits {
            return Err(BookingError::InvalidContact(format!(
                "phone number must have between {} and {} digits",
                self.min_phone_digits, self.max_phone_digits
            )));
        }
        Ok(phone_number.to_string())
    }

    pub fn validate_email(&self, email: &str) -> Result<String, BookingError> {
        let email = email.trim();
        let invalid = || BookingError::InvalidContact("email address is not valid".to_string());

        if email.is_empty() || email.len() > MAX_EMAIL_LEN {
            return Err(invalid());
        }
        let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
        if !is_valid_local_part(local) || !is_valid_domain(domain) {
            return Err(invalid());
        }
        Ok(email.to_string())
    }

    pub fn is_valid_email(&self, email: &str) -> bool {
        self.validate_email(email).is_ok()
    }
}

fn is_valid_local_part(local: &str) -> bool {
    !local.is_empty()
        && local.len() <= MAX_LOCAL_PART_LEN
        && !local.starts_with('.')
        && !local.ends_with('.')
        && !local.contains("..")
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || LOCAL_PART_SYMBOLS.contains(c))
}

fn is_valid_domain(domain: &str) -> bool {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    let tld_ok = labels
        .last()
        .map(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()))
        .unwrap_or(false);
    labels_ok && tld_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_valid_contact() {
        let validator = ContactValidator::default();
        let contact = validator.validate(" jane.doe+movies@example.co.uk ", "+14155550100").unwrap();
        assert_eq!(contact.email(), "jane.doe+movies@example.co.uk");
        assert_eq!(contact.phone_number(), "+14155550100");
    }

    #[test]
    fn test_phone_digit_bounds() {
        let validator = ContactValidator::default();
        assert!(validator.validate_phone("123456789").is_err());
        assert!(validator.validate_phone("1234567890").is_ok());
        assert!(validator.validate_phone("123456789012345").is_ok());
        assert!(validator.validate_phone("1234567890123456").is_err());
        assert!(validator.validate_phone("415-555-0100").is_err());
        assert!(validator.validate_phone("").is_err());
    }

    #[test]
    fn test_rejects_malformed_email() {
        let validator = ContactValidator::default();
        for bad in [
            "",
            "plainaddress",
            "@example.com",
            "jane@",
            "jane@example",
            "jane@@example.com",
            "jane..doe@example.com",
            "jane doe@example.com",
            "jane@-example.com",
            "jane@example.c0m",
        ] {
            assert!(!validator.is_valid_email(bad), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_errors_are_validation_kind() {
        let err = ContactValidator::default().validate("nope", "4155550100").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
