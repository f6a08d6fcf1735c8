use std::env;

use thiserror::Error;

use crate::session::DEFAULT_COLLECTION;

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_SESSION_TTL: u64 = 86_400; // one day
const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];
const DEFAULT_ICE_POOL_SIZE: u8 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub candidate_pool_size: u8,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: DEFAULT_STUN_URLS.iter().map(|url| url.to_string()).collect(),
            candidate_pool_size: DEFAULT_ICE_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub redis_url: String,
    pub session_ttl_seconds: u64,
    pub collection: String,
    pub ice: IceConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset and blank values fall
    /// back to the defaults, unparsable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let stun_urls = match var("HUDDLE_STUN_URLS") {
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.ice.stun_urls,
        };

        Ok(Self {
            redis_url: var("REDIS_URL").unwrap_or(defaults.redis_url),
            session_ttl_seconds: parse(
                "HUDDLE_SESSION_TTL",
                var("HUDDLE_SESSION_TTL"),
                "a number of seconds",
                defaults.session_ttl_seconds,
            )?,
            collection: var("HUDDLE_COLLECTION").unwrap_or(defaults.collection),
            ice: IceConfig {
                stun_urls,
                candidate_pool_size: parse(
                    "HUDDLE_ICE_POOL_SIZE",
                    var("HUDDLE_ICE_POOL_SIZE"),
                    "an integer between 0 and 255",
                    defaults.ice.candidate_pool_size,
                )?,
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            session_ttl_seconds: DEFAULT_SESSION_TTL,
            collection: DEFAULT_COLLECTION.to_string(),
            ice: IceConfig::default(),
        }
    }
}

fn parse<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid {
                name,
                expected,
                value,
            }),
    }
}
