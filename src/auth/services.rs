use lazy_static::lazy_static;
use rand::{
    distributions::{Alphanumeric, DistString},
    rngs::OsRng,
};
use regex::Regex;

use crate::auth::error::FieldError;

/// Length of session and confirmation token values (~285 bits).
pub const TOKEN_LEN: usize = 48;
pub const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 1024;

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Fresh opaque token from the OS CSPRNG.
pub fn generate_token() -> String {
    Alphanumeric.sample_string(&mut OsRng, TOKEN_LEN)
}

pub(crate) fn check_email(field: &'static str, email: &str, errors: &mut Vec<FieldError>) {
    if email.is_empty() {
        errors.push(FieldError::new(field, "is required"));
    } else if !is_valid_email(email) {
        errors.push(FieldError::new(field, "is not a valid email address"));
    }
}

pub(crate) fn check_password(field: &'static str, password: &str, errors: &mut Vec<FieldError>) {
    if password.len() < MIN_PASSWORD_LEN {
        errors.push(FieldError::new(
            field,
            format!("must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    } else if password.len() > MAX_PASSWORD_LEN {
        errors.push(FieldError::new(field, "is too long"));
    }
}
