use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub session_ttl_minutes: i64,
    pub activation_ttl_minutes: i64,
    pub password_reset_ttl_minutes: i64,
    pub email_change_ttl_minutes: i64,
    pub account_deletion_ttl_minutes: i64,
    /// 0 disables the background purge.
    pub purge_interval_minutes: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_minutes: 60 * 24 * 7,
            activation_ttl_minutes: 60 * 24,
            password_reset_ttl_minutes: 60 * 24,
            email_change_ttl_minutes: 60,
            account_deletion_ttl_minutes: 60,
            purge_interval_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Required unless the server runs against the in-memory store.
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub auth: AuthConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AuthConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            session_ttl_minutes: env_or("SESSION_TTL_MINUTES", d.session_ttl_minutes),
            activation_ttl_minutes: env_or("ACTIVATION_TTL_MINUTES", d.activation_ttl_minutes),
            password_reset_ttl_minutes: env_or(
                "PASSWORD_RESET_TTL_MINUTES",
                d.password_reset_ttl_minutes,
            ),
            email_change_ttl_minutes: env_or("EMAIL_CHANGE_TTL_MINUTES", d.email_change_ttl_minutes),
            account_deletion_ttl_minutes: env_or(
                "ACCOUNT_DELETION_TTL_MINUTES",
                d.account_deletion_ttl_minutes,
            ),
            purge_interval_minutes: env_or("PURGE_INTERVAL_MINUTES", d.purge_interval_minutes),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = match std::env::var("APP_PORT") {
            Ok(v) => v.parse().with_context(|| format!("invalid APP_PORT {v:?}"))?,
            Err(_) => 8080,
        };
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            host: std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port,
            auth: AuthConfig::from_env(),
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            host: "0.0.0.0".into(),
            port: 8080,
            auth: AuthConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_bounded_windows() {
        let cfg = AuthConfig::default();
        assert_eq!(cfg.activation_ttl_minutes, 1440);
        assert_eq!(cfg.password_reset_ttl_minutes, 1440);
        assert!(cfg.email_change_ttl_minutes < cfg.activation_ttl_minutes);
        assert!(cfg.account_deletion_ttl_minutes < cfg.activation_ttl_minutes);
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("BLOG_AUTH_TEST_GARBAGE_TTL", "not-a-number");
        assert_eq!(env_or("BLOG_AUTH_TEST_GARBAGE_TTL", 42i64), 42);
        std::env::set_var("BLOG_AUTH_TEST_GOOD_TTL", "7");
        assert_eq!(env_or("BLOG_AUTH_TEST_GOOD_TTL", 42i64), 7);
    }
}
