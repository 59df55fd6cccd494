use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

/// Which persistent store backs the L3 tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Fs,
    S3,
    R2,
}

impl std::str::FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fs" => Ok(StorageKind::Fs),
            "s3" => Ok(StorageKind::S3),
            "r2" => Ok(StorageKind::R2),
            other => Err(format!("unknown storage backend: {other}")),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("{0} is required when STORAGE_BACKEND is an object store")]
    MissingObjectStoreSetting(&'static str),
    #[error("S3_ENDPOINT is required when STORAGE_BACKEND=r2")]
    MissingR2Endpoint,
    #[error("API_KEYS must be non-empty when API_KEYS_ENABLED=true")]
    EmptyApiKeys,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub storage_backend: StorageKind,
    pub cache_dir: PathBuf,
    pub redis_url: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    /// Hostnames the fetcher may contact, lower-cased, exact match.
    pub allowed_domains: HashSet<String>,
    pub max_image_size_bytes: usize,
    pub upstream_timeout_ms: u64,
    pub rate_limit_per_minute: u64,
    pub cors_origins: Vec<String>,
    pub api_keys_enabled: bool,
    pub api_keys: HashSet<String>,
    pub edge_cache_ttl_seconds: u64,
    /// Host used to reconstruct the upstream URL for stable-path requests.
    pub canonical_upstream_host: String,
}

pub const DEFAULT_MAX_IMAGE_SIZE: usize = 25 * 1024 * 1024;
pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_EDGE_TTL_SECONDS: u64 = 3600;
pub const DEFAULT_CANONICAL_HOST: &str = "prod-files-secure.s3.us-west-2.amazonaws.com";

/// The hostname families the fetcher will contact out of the box. The
/// `www.notion.so/image/...` front is parseable but deliberately absent:
/// it is a rewriting CDN, not a file origin.
pub fn default_allowed_domains() -> HashSet<String> {
    [
        "prod-files-secure.s3.us-west-2.amazonaws.com",
        "s3.us-west-2.amazonaws.com",
        "file.notion.so",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            log_level: "info".into(),
            storage_backend: StorageKind::Fs,
            cache_dir: PathBuf::from("./cache"),
            redis_url: None,
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
            s3_access_key: None,
            s3_secret_key: None,
            allowed_domains: default_allowed_domains(),
            max_image_size_bytes: DEFAULT_MAX_IMAGE_SIZE,
            upstream_timeout_ms: DEFAULT_UPSTREAM_TIMEOUT_MS,
            rate_limit_per_minute: 60,
            cors_origins: vec!["*".into()],
            api_keys_enabled: false,
            api_keys: HashSet::new(),
            edge_cache_ttl_seconds: DEFAULT_EDGE_TTL_SECONDS,
            canonical_upstream_host: DEFAULT_CANONICAL_HOST.into(),
        }
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

fn env_bool(name: &'static str) -> Result<Option<bool>, ConfigError> {
    match env(name) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid { name, value: raw }),
        },
    }
}

fn split_csv(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Config {
    /// Builds the configuration from the process environment. Any invalid or
    /// incomplete setting is fatal: the caller is expected to abort startup.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        if let Some(host) = env("HOST") {
            cfg.host = host;
        }
        if let Some(port) = env_parsed::<u16>("PORT")? {
            cfg.port = port;
        }
        if let Some(level) = env("LOG_LEVEL") {
            cfg.log_level = level;
        }
        if let Some(backend) = env_parsed::<StorageKind>("STORAGE_BACKEND")? {
            cfg.storage_backend = backend;
        }
        if let Some(dir) = env("CACHE_DIR") {
            cfg.cache_dir = PathBuf::from(dir);
        }
        cfg.redis_url = env("REDIS_URL");
        cfg.s3_bucket = env("S3_BUCKET");
        cfg.s3_region = env("S3_REGION");
        cfg.s3_endpoint = env("S3_ENDPOINT");
        cfg.s3_access_key = env("S3_ACCESS_KEY");
        cfg.s3_secret_key = env("S3_SECRET_KEY");
        if let Some(domains) = env("ALLOWED_DOMAINS") {
            cfg.allowed_domains = split_csv(&domains)
                .map(|d| d.to_ascii_lowercase())
                .collect();
        }
        if let Some(max) = env_parsed::<usize>("MAX_IMAGE_SIZE_BYTES")? {
            cfg.max_image_size_bytes = max;
        }
        if let Some(timeout) = env_parsed::<u64>("UPSTREAM_TIMEOUT_MS")? {
            cfg.upstream_timeout_ms = timeout;
        }
        if let Some(limit) = env_parsed::<u64>("RATE_LIMIT_PER_MINUTE")? {
            cfg.rate_limit_per_minute = limit;
        }
        if let Some(origins) = env("CORS_ORIGINS") {
            cfg.cors_origins = split_csv(&origins).collect();
        }
        if let Some(enabled) = env_bool("API_KEYS_ENABLED")? {
            cfg.api_keys_enabled = enabled;
        }
        if let Some(keys) = env("API_KEYS") {
            cfg.api_keys = split_csv(&keys).collect();
        }
        if let Some(ttl) = env_parsed::<u64>("EDGE_CACHE_TTL_SECONDS")? {
            cfg.edge_cache_ttl_seconds = ttl;
        }
        if let Some(host) = env("CANONICAL_UPSTREAM_HOST") {
            cfg.canonical_upstream_host = host.to_ascii_lowercase();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.storage_backend, StorageKind::S3 | StorageKind::R2) {
            if self.s3_bucket.is_none() {
                return Err(ConfigError::MissingObjectStoreSetting("S3_BUCKET"));
            }
            if self.s3_access_key.is_none() {
                return Err(ConfigError::MissingObjectStoreSetting("S3_ACCESS_KEY"));
            }
            if self.s3_secret_key.is_none() {
                return Err(ConfigError::MissingObjectStoreSetting("S3_SECRET_KEY"));
            }
            if self.storage_backend == StorageKind::R2 && self.s3_endpoint.is_none() {
                return Err(ConfigError::MissingR2Endpoint);
            }
        }
        if self.api_keys_enabled && self.api_keys.is_empty() {
            return Err(ConfigError::EmptyApiKeys);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_store_backend_requires_credentials() {
        let cfg = Config {
            storage_backend: StorageKind::S3,
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingObjectStoreSetting("S3_BUCKET"))
        ));

        let cfg = Config {
            storage_backend: StorageKind::S3,
            s3_bucket: Some("imgs".into()),
            s3_access_key: Some("ak".into()),
            s3_secret_key: Some("sk".into()),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn r2_requires_endpoint() {
        let cfg = Config {
            storage_backend: StorageKind::R2,
            s3_bucket: Some("imgs".into()),
            s3_access_key: Some("ak".into()),
            s3_secret_key: Some("sk".into()),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingR2Endpoint)));
    }

    #[test]
    fn api_keys_must_accompany_the_flag() {
        let cfg = Config {
            api_keys_enabled: true,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyApiKeys)));
    }

    #[test]
    fn default_allowlist_covers_three_families() {
        let domains = default_allowed_domains();
        assert_eq!(domains.len(), 3);
        assert!(domains.contains("file.notion.so"));
        assert!(!domains.contains("www.notion.so"));
    }
}
