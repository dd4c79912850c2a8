use std::time::Duration;

use anyhow::Context;

/// Secrets and lifetimes for the two token kinds. All four values are
/// required at startup; there are no defaults for signing secrets.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub access_secret: String,
    pub access_expiry: Duration,
    pub refresh_secret: String,
    pub refresh_expiry: Duration,
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub tokens: TokenConfig,
    pub media: MediaConfig,
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

/// Parses an expiry value such as "30s", "15m", "2h" or "7d". A bare
/// number is taken as seconds.
pub fn parse_expiry(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    anyhow::ensure!(!raw.is_empty(), "empty expiry value");
    let (value, multiplier) = match raw.as_bytes()[raw.len() - 1] {
        b's' => (&raw[..raw.len() - 1], 1),
        b'm' => (&raw[..raw.len() - 1], 60),
        b'h' => (&raw[..raw.len() - 1], 60 * 60),
        b'd' => (&raw[..raw.len() - 1], 60 * 60 * 24),
        _ => (raw, 1),
    };
    let n: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("invalid expiry value {raw:?}"))?;
    Ok(Duration::from_secs(n * multiplier))
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = required("DATABASE_URL")?;
        let tokens = TokenConfig {
            access_secret: required("ACCESS_TOKEN_SECRET")?,
            access_expiry: parse_expiry(&required("ACCESS_TOKEN_EXPIRY")?)?,
            refresh_secret: required("REFRESH_TOKEN_SECRET")?,
            refresh_expiry: parse_expiry(&required("REFRESH_TOKEN_EXPIRY")?)?,
        };
        let media = MediaConfig {
            endpoint: required("MINIO_ENDPOINT")?,
            bucket: required("MINIO_BUCKET")?,
            access_key: required("MINIO_ACCESS_KEY")?,
            secret_key: required("MINIO_SECRET_KEY")?,
        };
        Ok(Self {
            database_url,
            tokens,
            media,
        })
    }
}
