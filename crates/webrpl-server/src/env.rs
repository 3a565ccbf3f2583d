use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::path::PathBuf;

use crate::crypto::DEFAULT_ITERATIONS;
use crate::error::{Error, Result};

pub fn normalize_env_value(raw: String) -> String {
    let trimmed = raw.trim();

    if let Some(inner) = trimmed.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return inner.trim().to_string();
    }

    trimmed.to_string()
}

pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(normalize_env_value)
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw}"))),
        None => Ok(default),
    }
}

#[derive(Debug, Clone)]
pub struct BrevoConfig {
    pub api_key: String,
    pub sender_email: String,
    pub sender_name: Option<String>,
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root credential: signs session tokens and seeds the reserved admin password.
    pub secret_key: String,
    pub database_url: String,
    pub bind_addr: SocketAddr,
    /// Root of the template store; also served under `/static`.
    pub static_dir: PathBuf,
    /// Externally reachable origin used when rewriting `@@` in uploaded templates.
    pub public_base_url: String,
    pub password_iterations: NonZeroU32,
    pub hash_workers: usize,
    pub otp_length: usize,
    pub brevo: Option<BrevoConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let Some(secret_key) = env_string("SECRET_KEY") else {
            return Err(Error::Signing("SECRET_KEY is required".to_string()));
        };

        let brevo = match (env_string("BREVO_API_KEY"), env_string("BREVO_SENDER_EMAIL")) {
            (Some(api_key), Some(sender_email)) => Some(BrevoConfig {
                api_key,
                sender_email,
                sender_name: env_string("BREVO_SENDER_NAME"),
            }),
            _ => None,
        };

        let iterations: u32 = env_parse("PASSWORD_ITERATIONS", DEFAULT_ITERATIONS)?;
        let password_iterations = NonZeroU32::new(iterations)
            .ok_or_else(|| Error::Config("PASSWORD_ITERATIONS must be non-zero".to_string()))?;

        Ok(Self {
            secret_key,
            database_url: env_string("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://./db/data.db?mode=rwc".to_string()),
            bind_addr: env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            static_dir: env_string("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./static")),
            public_base_url: env_string("PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            password_iterations,
            hash_workers: env_parse("HASH_WORKERS", 4usize)?,
            otp_length: env_parse("OTP_LENGTH", 4usize)?,
            brevo,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_wrapping_quotes() {
        assert_eq!(normalize_env_value("  \"abc\" ".to_string()), "abc");
        assert_eq!(normalize_env_value("'x y'".to_string()), "x y");
        assert_eq!(normalize_env_value("plain".to_string()), "plain");
        assert_eq!(normalize_env_value("\"unbalanced".to_string()), "\"unbalanced");
    }
}
