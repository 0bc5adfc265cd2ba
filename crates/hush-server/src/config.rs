use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use hush_api::service::MAX_PAGE_SIZE;
use hush_crypto::keys::{DEFAULT_RSA_BITS, MIN_RSA_BITS};

const DEV_TOKEN_KEY: &str = "dev-secret-change-me";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid {expected}: {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{var} must be at least {min}, got {value}")]
    TooSmall { var: &'static str, min: usize, value: usize },
}

/// Server settings, read once at startup.
#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub token_key: String,
    pub rsa_bits: usize,
    pub page_size: u32,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_path", &self.db_path)
            .field("rsa_bits", &self.rsa_bits)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("HUSH_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = parse(&lookup, "HUSH_PORT", "port number", 3000u16)?;
        let db_path = PathBuf::from(lookup("HUSH_DB_PATH").unwrap_or_else(|| "hush.db".into()));

        let token_key = match lookup("HUSH_TOKEN_KEY").filter(|k| !k.is_empty()) {
            Some(key) => key,
            None => {
                warn!("HUSH_TOKEN_KEY not set, using the development secret");
                DEV_TOKEN_KEY.to_string()
            }
        };

        let rsa_bits = parse(&lookup, "HUSH_RSA_BITS", "key size", DEFAULT_RSA_BITS)?;
        if rsa_bits < MIN_RSA_BITS {
            return Err(ConfigError::TooSmall {
                var: "HUSH_RSA_BITS",
                min: MIN_RSA_BITS,
                value: rsa_bits,
            });
        }

        let page_size = parse(&lookup, "HUSH_PAGE_SIZE", "page size", 10u32)?.clamp(1, MAX_PAGE_SIZE);

        Ok(Self {
            host,
            port,
            db_path,
            token_key,
            rsa_bits,
            page_size,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse().map_err(|_| ConfigError::Invalid {
            var: "HUSH_HOST",
            expected: "bind address",
            value: raw,
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { var, expected, value }),
    }
}
