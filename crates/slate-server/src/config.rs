//! Server configuration for Slate.
//!
//! Loads configuration from an optional `config.json` in the working
//! directory, then from environment variables, which win. Every setting has
//! a default; a value that does not parse is logged and the default kept.
//!
//! Durations accept bare seconds (`90`) or unit-suffixed parts (`500ms`,
//! `30s`, `15m`, `1h30m`, `1d`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use slate_core::login::{DEFAULT_LOCK_DURATION, DEFAULT_MAX_ATTEMPTS};
use slate_core::repository::Mode;
use slate_core::session::{DEFAULT_SESSION_TTL, SessionCodec};
use slate_core::store::DEFAULT_LOCK_TIMEOUT;

/// Name of the optional configuration file.
pub const CONFIG_FILE: &str = "config.json";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONCURRENCY: usize = 1024;

/// Storage engine behind shared mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// redb in a temporary directory, removed on shutdown.
    Redb,
    /// In-process maps.
    Memory,
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Shared store or per-session copies.
    pub mode: Mode,
    /// Storage engine for shared mode.
    pub storage: StorageKind,
    /// A redb snapshot to use instead of the packaged seed.
    pub seed_path: Option<PathBuf>,
    /// Directory served under `/static`.
    pub static_dir: PathBuf,
    /// Idle lifetime of a session.
    pub session_ttl: Duration,
    /// How the session store re-encodes values.
    pub session_codec: SessionCodec,
    /// Upper bound on handling one request.
    pub request_timeout: Duration,
    /// Upper bound on waiting for the content store lock.
    pub store_lock_timeout: Duration,
    /// Maximum number of requests handled at once.
    pub concurrency: usize,
    pub auth_user: String,
    pub auth_pass: String,
    /// Failed logins before lockout.
    pub login_limit: u32,
    /// How long a lockout lasts.
    pub login_lock: Duration,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("log_level", &self.log_level)
            .field("mode", &self.mode)
            .field("storage", &self.storage)
            .field("seed_path", &self.seed_path)
            .field("static_dir", &self.static_dir)
            .field("session_ttl", &self.session_ttl)
            .field("session_codec", &self.session_codec)
            .field("request_timeout", &self.request_timeout)
            .field("store_lock_timeout", &self.store_lock_timeout)
            .field("concurrency", &self.concurrency)
            .field("auth_user", &self.auth_user)
            .field("auth_pass", &"<redacted>")
            .field("login_limit", &self.login_limit)
            .field("login_lock", &self.login_lock)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            log_level: "info".to_owned(),
            mode: Mode::Session,
            storage: StorageKind::Redb,
            seed_path: None,
            static_dir: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/assets/static")),
            session_ttl: DEFAULT_SESSION_TTL,
            session_codec: SessionCodec::Native,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            store_lock_timeout: DEFAULT_LOCK_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
            auth_user: String::new(),
            auth_pass: String::new(),
            login_limit: DEFAULT_MAX_ATTEMPTS,
            login_lock: DEFAULT_LOCK_DURATION,
        }
    }
}

/// Settings accepted from `config.json`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// `host:port`, or `:port` for every interface.
    pub address: Option<String>,
    /// Duration string or whole seconds.
    pub request_timeout: Option<serde_json::Value>,
    pub concurrency: Option<usize>,
}

impl FileConfig {
    /// Read `path` if it exists. A missing file is `None`; an unreadable or
    /// malformed one is logged and ignored.
    pub fn load(path: &Path) -> Option<Self> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not read config file");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not decode config file");
                None
            }
        }
    }
}

impl ServerConfig {
    /// Load configuration from `config.json` and environment variables.
    ///
    /// Environment variables:
    /// - `SLATE_BIND_ADDR`: full bind address (overrides `PORT`, default: `127.0.0.1:8080`)
    /// - `PORT`: port to bind on, all interfaces
    /// - `SLATE_LOG_LEVEL`: log filter (default: `info`)
    /// - `SLATE_MODE`: `session` or `shared` (default: `session`)
    /// - `SLATE_STORAGE`: `redb` or `memory` (default: `redb`)
    /// - `SLATE_SEED_PATH`: redb snapshot replacing the packaged seed
    /// - `SLATE_STATIC_DIR`: directory served under `/static`
    /// - `SLATE_SESSION_TTL`: session idle lifetime (default: `24h`)
    /// - `SLATE_SESSION_CODEC`: `native` or `json` (default: `native`)
    /// - `SLATE_REQUEST_TIMEOUT`: per-request bound (default: `10s`)
    /// - `SLATE_STORE_LOCK_TIMEOUT`: store lock bound (default: `1s`)
    /// - `SLATE_CONCURRENCY`: in-flight request cap (default: `1024`)
    /// - `AUTH_USER` / `AUTH_PASS`: the login credentials
    /// - `LOGIN_LIMIT_ATTEMPT`: failures before lockout (default: `5`)
    /// - `LOGIN_LOCK_DURATION`: lockout length (default: `1h`)
    #[must_use]
    pub fn from_env() -> Self {
        let file = FileConfig::load(Path::new(CONFIG_FILE));
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Build from an optional file config and a variable lookup.
    pub fn from_sources(file: Option<FileConfig>, var: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let file = file.unwrap_or_default();

        if let Some(addr) = file.address.as_deref().and_then(parse_addr) {
            cfg.bind_addr = addr;
        }
        if let Some(value) = &file.request_timeout {
            let parsed = match value {
                serde_json::Value::Number(n) => n.as_u64().map(Duration::from_secs),
                serde_json::Value::String(s) => parse_duration(s),
                _ => None,
            };
            match parsed {
                Some(d) if !d.is_zero() => cfg.request_timeout = d,
                _ => tracing::warn!(value = %value, "invalid request_timeout in config file, using default"),
            }
        }
        if let Some(n) = file.concurrency.filter(|n| *n > 0) {
            cfg.concurrency = n;
        }

        // Priority: SLATE_BIND_ADDR > PORT > config file > default.
        if let Some(addr) = var("SLATE_BIND_ADDR") {
            match addr.parse() {
                Ok(a) => cfg.bind_addr = a,
                Err(_) => warn_invalid("SLATE_BIND_ADDR", &addr),
            }
        } else if let Some(port) = var("PORT") {
            match port.parse::<u16>() {
                Ok(p) => cfg.bind_addr = SocketAddr::from(([0, 0, 0, 0], p)),
                Err(_) => warn_invalid("PORT", &port),
            }
        }

        if let Some(level) = var("SLATE_LOG_LEVEL") {
            cfg.log_level = level;
        }

        if let Some(mode) = var("SLATE_MODE") {
            match mode.to_lowercase().as_str() {
                "session" => cfg.mode = Mode::Session,
                "shared" => cfg.mode = Mode::Shared,
                _ => warn_invalid("SLATE_MODE", &mode),
            }
        }

        if let Some(storage) = var("SLATE_STORAGE") {
            match storage.to_lowercase().as_str() {
                "redb" => cfg.storage = StorageKind::Redb,
                "memory" => cfg.storage = StorageKind::Memory,
                _ => warn_invalid("SLATE_STORAGE", &storage),
            }
        }

        cfg.seed_path = var("SLATE_SEED_PATH").map(PathBuf::from);
        if let Some(dir) = var("SLATE_STATIC_DIR") {
            cfg.static_dir = PathBuf::from(dir);
        }

        if let Some(codec) = var("SLATE_SESSION_CODEC") {
            match codec.to_lowercase().as_str() {
                "native" => cfg.session_codec = SessionCodec::Native,
                "json" => cfg.session_codec = SessionCodec::Json,
                _ => warn_invalid("SLATE_SESSION_CODEC", &codec),
            }
        }

        duration_var(&var, "SLATE_SESSION_TTL", &mut cfg.session_ttl);
        duration_var(&var, "SLATE_REQUEST_TIMEOUT", &mut cfg.request_timeout);
        duration_var(&var, "SLATE_STORE_LOCK_TIMEOUT", &mut cfg.store_lock_timeout);
        duration_var(&var, "LOGIN_LOCK_DURATION", &mut cfg.login_lock);

        if let Some(n) = var("SLATE_CONCURRENCY") {
            match n.parse::<usize>() {
                Ok(n) if n > 0 => cfg.concurrency = n,
                _ => warn_invalid("SLATE_CONCURRENCY", &n),
            }
        }

        cfg.auth_user = var("AUTH_USER").unwrap_or_default();
        cfg.auth_pass = var("AUTH_PASS").unwrap_or_default();

        if let Some(limit) = var("LOGIN_LIMIT_ATTEMPT") {
            match limit.parse::<u32>() {
                Ok(n) if n > 0 => cfg.login_limit = n,
                _ => warn_invalid("LOGIN_LIMIT_ATTEMPT", &limit),
            }
        }

        cfg
    }
}

fn warn_invalid(key: &str, value: &str) {
    tracing::warn!(key, value, "invalid configuration value, using default");
}

fn duration_var(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    if let Some(raw) = var(key) {
        match parse_duration(&raw) {
            Some(d) if !d.is_zero() => *slot = d,
            _ => warn_invalid(key, &raw),
        }
    }
}

/// Parse `host:port`, or `:port` meaning every interface.
fn parse_addr(raw: &str) -> Option<SocketAddr> {
    let raw = raw.trim();
    if let Some(port) = raw.strip_prefix(':') {
        return port.parse::<u16>().ok().map(|p| SocketAddr::from(([0, 0, 0, 0], p)));
    }
    match raw.parse() {
        Ok(a) => Some(a),
        Err(_) => {
            warn_invalid("address", raw);
            None
        }
    }
}

/// Parse a duration: bare seconds or a run of `<number><unit>` parts with
/// units `ms`, `s`, `m`, `h`, `d`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let n: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n.checked_mul(60)?),
            "h" => Duration::from_secs(n.checked_mul(3600)?),
            "d" => Duration::from_secs(n.checked_mul(86_400)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit_len..];
    }
    Some(total)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_env(pairs: &[(&str, &str)]) -> ServerConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_sources(None, |k| env.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = with_env(&[]);
        assert_eq!(cfg.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(cfg.mode, Mode::Session);
        assert_eq!(cfg.storage, StorageKind::Redb);
        assert_eq!(cfg.login_limit, 5);
        assert_eq!(cfg.login_lock, Duration::from_secs(3600));
        assert_eq!(cfg.session_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.store_lock_timeout, Duration::from_secs(1));
    }

    #[test]
    fn bind_addr_beats_port() {
        let cfg = with_env(&[("SLATE_BIND_ADDR", "127.0.0.1:9000"), ("PORT", "7000")]);
        assert_eq!(cfg.bind_addr.port(), 9000);
        let cfg = with_env(&[("PORT", "7000")]);
        assert_eq!(cfg.bind_addr, SocketAddr::from(([0, 0, 0, 0], 7000)));
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let cfg = with_env(&[
            ("LOGIN_LIMIT_ATTEMPT", "0"),
            ("LOGIN_LOCK_DURATION", "soon"),
            ("SLATE_MODE", "both"),
        ]);
        assert_eq!(cfg.login_limit, 5);
        assert_eq!(cfg.login_lock, Duration::from_secs(3600));
        assert_eq!(cfg.mode, Mode::Session);
    }

    #[test]
    fn env_overrides_take_effect() {
        let cfg = with_env(&[
            ("SLATE_MODE", "shared"),
            ("SLATE_STORAGE", "memory"),
            ("LOGIN_LIMIT_ATTEMPT", "3"),
            ("LOGIN_LOCK_DURATION", "15m"),
            ("AUTH_USER", "admin"),
            ("SLATE_SESSION_CODEC", "json"),
        ]);
        assert_eq!(cfg.mode, Mode::Shared);
        assert_eq!(cfg.storage, StorageKind::Memory);
        assert_eq!(cfg.login_limit, 3);
        assert_eq!(cfg.login_lock, Duration::from_secs(900));
        assert_eq!(cfg.auth_user, "admin");
        assert_eq!(cfg.session_codec, SessionCodec::Json);
    }

    #[test]
    fn file_config_applies_under_env() {
        let file: FileConfig =
            serde_json::from_str(r#"{"address": ":9100", "request_timeout": "30s"}"#).unwrap();
        let cfg = ServerConfig::from_sources(Some(file), |_| None);
        assert_eq!(cfg.bind_addr, SocketAddr::from(([0, 0, 0, 0], 9100)));
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));

        let file: FileConfig = serde_json::from_str(r#"{"address": ":9100"}"#).unwrap();
        let cfg = ServerConfig::from_sources(Some(file), |k| (k == "PORT").then(|| "7000".to_owned()));
        assert_eq!(cfg.bind_addr.port(), 7000);
    }

    #[test]
    fn missing_config_file_is_none() {
        let path = std::env::temp_dir().join("slate-no-such-dir").join(CONFIG_FILE);
        assert!(FileConfig::load(&path).is_none());
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2d"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_duration("1x"), None);
        assert_eq!(parse_duration("h"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn debug_hides_password() {
        let cfg = with_env(&[("AUTH_PASS", "hunter2")]);
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }
}
