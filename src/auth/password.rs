use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use lazy_static::lazy_static;
use rand::rngs::OsRng;
use tracing::error;

lazy_static! {
    /// Verified against when the email is unknown, so a miss costs the same
    /// Argon2 work as a wrong password.
    static ref DUMMY_HASH: String =
        hash_password("blog-auth-timing-equalizer").unwrap_or_default();
}

pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

/// Argon2 compares the derived output in constant time.
pub fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

/// Burns one verification and always reports a mismatch.
pub fn verify_against_dummy(plain: &str) {
    let _ = verify_password(plain, &DUMMY_HASH);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_password_gets_a_fresh_salt_per_account() {
        let a = hash_password("password1").unwrap();
        let b = hash_password("password1").unwrap();
        assert_ne!(a, b);
        assert!(verify_password("password1", &a).unwrap());
        assert!(verify_password("password1", &b).unwrap());
        assert!(!verify_password("password2", &a).unwrap());
    }

    #[test]
    fn unreadable_stored_hash_is_an_error_not_a_mismatch() {
        // login turns this into InvalidCredentials after logging it
        assert!(verify_password("password1", "").is_err());
        assert!(verify_password("password1", "plaintext-password1").is_err());
    }

    #[test]
    fn dummy_hash_costs_a_real_verification() {
        assert!(DUMMY_HASH.starts_with("$argon2id$"));
        assert!(!verify_password("password1", &DUMMY_HASH).unwrap());
        verify_against_dummy("password1");
    }
}
