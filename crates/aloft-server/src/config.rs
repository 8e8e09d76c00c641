//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// CORS configuration.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Identity Verifier (C1) settings.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Permission Resolver (C2) scope-name overrides.
    #[serde(default)]
    pub permissions: PermissionsConfig,

    /// Permission Registrar (C5) settings.
    #[serde(default)]
    pub registrar: RegistrarConfig,

    /// Push Fan-out (C7) settings.
    #[serde(default)]
    pub push: PushConfig,

    /// Channel defaults applied across the Channel Store, Cache, and Agent.
    #[serde(default)]
    pub channel: ChannelDefaultsConfig,
}

/// CORS (Cross-Origin Resource Sharing) configuration.
///
/// By default, CORS is **restrictive** (same-origin only). To allow cross-origin
/// requests, set `allowed_origins` to a list of origin URLs or `["*"]` for
/// permissive mode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CorsConfig {
    /// List of allowed origins. Empty = same-origin only. `["*"]` = allow all.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Public base URL advertised in `pttStart`'s `websocket_url` field.
    #[serde(default = "default_websocket_base_url")]
    pub websocket_base_url: String,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_db_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    #[serde(default = "default_db_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "aloft_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Where the Identity Verifier (C1) obtains its signing keys.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_issuer")]
    pub issuer: String,

    #[serde(default = "default_identity_audience")]
    pub audience: String,

    /// HMAC shared secret. Used when `jwks_url` is unset (self-hosted
    /// deployments without a separate identity provider).
    #[serde(default)]
    pub hmac_secret: Option<String>,

    /// Remote JWKS document URL. Takes precedence over `hmac_secret` when set.
    #[serde(default)]
    pub jwks_url: Option<String>,

    #[serde(default = "default_jwks_refresh_interval_secs")]
    pub jwks_refresh_interval_secs: u64,
}

/// Recognized scope names for the Permission Resolver (C2). The resolver
/// itself keeps these fixed; this section exists so deployments can see
/// (and in a future revision, override) the names at the server boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default = "default_read_permission")]
    pub read_permission: String,

    #[serde(default = "default_write_permission")]
    pub write_permission: String,

    #[serde(default = "default_admin_permission")]
    pub admin_permission: String,

    #[serde(default = "default_tenant_admin_permission")]
    pub tenant_admin_permission: String,

    #[serde(default = "default_access_permission_prefix")]
    pub access_permission_prefix: String,
}

/// Management API credentials used by the Permission Registrar (C5).
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrarConfig {
    #[serde(default)]
    pub management_api_url: String,

    #[serde(default)]
    pub management_api_token: String,

    #[serde(default = "default_registrar_queue_capacity")]
    pub queue_capacity: usize,
}

/// Push gateway credentials used by Push Fan-out (C7).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub gateway_url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,
}

/// Defaults shared by the Channel Store, Cache, and Agent.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelDefaultsConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_participant_timeout_secs")]
    pub participant_timeout_secs: u64,

    #[serde(default = "default_max_transmission_duration_secs")]
    pub max_transmission_duration_secs: u64,

    #[serde(default = "default_max_participants")]
    pub max_participants_default: u32,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_websocket_base_url() -> String {
    "ws://127.0.0.1:3000".to_string()
}

fn default_db_path() -> String {
    "aloft.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_busy_timeout_ms() -> u64 {
    5_000
}

fn default_db_pool_max_size() -> u32 {
    8
}

fn default_identity_issuer() -> String {
    "https://identity.aloft.example".to_string()
}

fn default_identity_audience() -> String {
    "aloft-api".to_string()
}

fn default_jwks_refresh_interval_secs() -> u64 {
    600
}

fn default_read_permission() -> String {
    "read:api".to_string()
}

fn default_write_permission() -> String {
    "write:api".to_string()
}

fn default_admin_permission() -> String {
    "admin:api".to_string()
}

fn default_tenant_admin_permission() -> String {
    "tenant:admin".to_string()
}

fn default_access_permission_prefix() -> String {
    "access:".to_string()
}

fn default_registrar_queue_capacity() -> usize {
    256
}

fn default_cache_ttl_secs() -> u64 {
    aloft_types::constants::CACHE_TTL_SECS
}

fn default_participant_timeout_secs() -> u64 {
    aloft_types::constants::PARTICIPANT_TIMEOUT_SECS
}

fn default_max_transmission_duration_secs() -> u64 {
    aloft_types::constants::MAX_TRANSMISSION_DURATION_SECS
}

fn default_max_participants() -> u32 {
    aloft_types::constants::DEFAULT_MAX_PARTICIPANTS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_base_url: default_websocket_base_url(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_db_busy_timeout_ms(),
            pool_max_size: default_db_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            issuer: default_identity_issuer(),
            audience: default_identity_audience(),
            hmac_secret: None,
            jwks_url: None,
            jwks_refresh_interval_secs: default_jwks_refresh_interval_secs(),
        }
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            read_permission: default_read_permission(),
            write_permission: default_write_permission(),
            admin_permission: default_admin_permission(),
            tenant_admin_permission: default_tenant_admin_permission(),
            access_permission_prefix: default_access_permission_prefix(),
        }
    }
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            management_api_url: String::new(),
            management_api_token: String::new(),
            queue_capacity: default_registrar_queue_capacity(),
        }
    }
}

impl Default for ChannelDefaultsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            participant_timeout_secs: default_participant_timeout_secs(),
            max_transmission_duration_secs: default_max_transmission_duration_secs(),
            max_participants_default: default_max_participants(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment variable value was invalid for the expected type.
    #[error("invalid environment variable {name}: {reason}")]
    InvalidEnvVar { name: &'static str, reason: String },

    /// Configuration value is outside the allowed range.
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

const MIN_DB_BUSY_TIMEOUT_MS: u64 = 1;
const MAX_DB_BUSY_TIMEOUT_MS: u64 = 60_000;
const MIN_DB_POOL_MAX_SIZE: u32 = 1;
const MAX_DB_POOL_MAX_SIZE: u32 = 64;

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if !(MIN_DB_BUSY_TIMEOUT_MS..=MAX_DB_BUSY_TIMEOUT_MS).contains(&config.database.busy_timeout_ms)
    {
        return Err(ConfigError::InvalidValue {
            field: "database.busy_timeout_ms",
            reason: format!(
                "must be in range {MIN_DB_BUSY_TIMEOUT_MS}..={MAX_DB_BUSY_TIMEOUT_MS}, got {}",
                config.database.busy_timeout_ms
            ),
        });
    }

    if !(MIN_DB_POOL_MAX_SIZE..=MAX_DB_POOL_MAX_SIZE).contains(&config.database.pool_max_size) {
        return Err(ConfigError::InvalidValue {
            field: "database.pool_max_size",
            reason: format!(
                "must be in range {MIN_DB_POOL_MAX_SIZE}..={MAX_DB_POOL_MAX_SIZE}, got {}",
                config.database.pool_max_size
            ),
        });
    }

    if config.channel.max_transmission_duration_secs == 0 {
        return Err(ConfigError::InvalidValue {
            field: "channel.max_transmission_duration_secs",
            reason: "must be greater than zero".to_string(),
        });
    }

    if config.channel.max_participants_default == 0 {
        return Err(ConfigError::InvalidValue {
            field: "channel.max_participants_default",
            reason: "must be greater than zero".to_string(),
        });
    }

    Ok(())
}

fn parse_env_var<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => {
            let parsed = raw.parse::<T>().map_err(|err| ConfigError::InvalidEnvVar {
                name,
                reason: err.to_string(),
            })?;
            Ok(Some(parsed))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnvVar {
            name,
            reason: "value is not valid unicode".to_string(),
        }),
    }
}

fn parse_env_bool(name: &'static str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let normalized = raw.trim().to_ascii_lowercase();
            let parsed = match normalized.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
            .ok_or_else(|| ConfigError::InvalidEnvVar {
                name,
                reason: format!("expected one of [true,false,1,0,yes,no,on,off], got '{raw}'"),
            })?;
            Ok(Some(parsed))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnvVar {
            name,
            reason: "value is not valid unicode".to_string(),
        }),
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides (all `ALOFT_`-prefixed):
/// `ALOFT_HOST`, `ALOFT_PORT`, `ALOFT_WEBSOCKET_BASE_URL`, `ALOFT_DB_PATH`,
/// `ALOFT_DB_BUSY_TIMEOUT_MS`, `ALOFT_DB_POOL_MAX_SIZE`, `ALOFT_LOG_LEVEL`,
/// `ALOFT_LOG_JSON`, `ALOFT_CORS_ORIGINS` (comma-separated or `*`),
/// `ALOFT_IDENTITY_ISSUER`, `ALOFT_IDENTITY_AUDIENCE`, `ALOFT_IDENTITY_HMAC_SECRET`,
/// `ALOFT_IDENTITY_JWKS_URL`, `ALOFT_REGISTRAR_API_URL`, `ALOFT_REGISTRAR_API_TOKEN`,
/// `ALOFT_PUSH_GATEWAY_URL`, `ALOFT_PUSH_API_KEY`, `ALOFT_CACHE_TTL_SECS`,
/// `ALOFT_PARTICIPANT_TIMEOUT_SECS`, `ALOFT_MAX_TRANSMISSION_DURATION_SECS`,
/// `ALOFT_MAX_PARTICIPANTS_DEFAULT`.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Some(host) = parse_env_var("ALOFT_HOST")? {
        config.server.host = host;
    }
    if let Some(port) = parse_env_var("ALOFT_PORT")? {
        config.server.port = port;
    }
    if let Some(val) = parse_env_var::<String>("ALOFT_WEBSOCKET_BASE_URL")? {
        config.server.websocket_base_url = val;
    }
    if let Some(db_path) = parse_env_var::<String>("ALOFT_DB_PATH")? {
        config.database.path = db_path;
    }
    if let Some(timeout) = parse_env_var("ALOFT_DB_BUSY_TIMEOUT_MS")? {
        config.database.busy_timeout_ms = timeout;
    }
    if let Some(max_size) = parse_env_var("ALOFT_DB_POOL_MAX_SIZE")? {
        config.database.pool_max_size = max_size;
    }
    if let Some(level) = parse_env_var::<String>("ALOFT_LOG_LEVEL")? {
        config.logging.level = level;
    }
    if let Some(json) = parse_env_bool("ALOFT_LOG_JSON")? {
        config.logging.json = json;
    }
    if let Ok(origins) = std::env::var("ALOFT_CORS_ORIGINS") {
        config.cors.allowed_origins = origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(val) = parse_env_var::<String>("ALOFT_IDENTITY_ISSUER")? {
        config.identity.issuer = val;
    }
    if let Some(val) = parse_env_var::<String>("ALOFT_IDENTITY_AUDIENCE")? {
        config.identity.audience = val;
    }
    if let Some(val) = parse_env_var::<String>("ALOFT_IDENTITY_HMAC_SECRET")? {
        config.identity.hmac_secret = Some(val);
    }
    if let Some(val) = parse_env_var::<String>("ALOFT_IDENTITY_JWKS_URL")? {
        config.identity.jwks_url = Some(val);
    }
    if let Some(val) = parse_env_var::<String>("ALOFT_REGISTRAR_API_URL")? {
        config.registrar.management_api_url = val;
    }
    if let Some(val) = parse_env_var::<String>("ALOFT_REGISTRAR_API_TOKEN")? {
        config.registrar.management_api_token = val;
    }
    if let Some(val) = parse_env_var::<String>("ALOFT_PUSH_GATEWAY_URL")? {
        config.push.gateway_url = Some(val);
    }
    if let Some(val) = parse_env_var::<String>("ALOFT_PUSH_API_KEY")? {
        config.push.api_key = Some(val);
    }
    if let Some(val) = parse_env_var("ALOFT_CACHE_TTL_SECS")? {
        config.channel.cache_ttl_secs = val;
    }
    if let Some(val) = parse_env_var("ALOFT_PARTICIPANT_TIMEOUT_SECS")? {
        config.channel.participant_timeout_secs = val;
    }
    if let Some(val) = parse_env_var("ALOFT_MAX_TRANSMISSION_DURATION_SECS")? {
        config.channel.max_transmission_duration_secs = val;
    }
    if let Some(val) = parse_env_var("ALOFT_MAX_PARTICIPANTS_DEFAULT")? {
        config.channel.max_participants_default = val;
    }

    validate_config(&config)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Mutex, OnceLock};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_env() {
        for name in [
            "ALOFT_HOST",
            "ALOFT_PORT",
            "ALOFT_WEBSOCKET_BASE_URL",
            "ALOFT_DB_PATH",
            "ALOFT_DB_BUSY_TIMEOUT_MS",
            "ALOFT_DB_POOL_MAX_SIZE",
            "ALOFT_LOG_LEVEL",
            "ALOFT_LOG_JSON",
            "ALOFT_CORS_ORIGINS",
            "ALOFT_CACHE_TTL_SECS",
            "ALOFT_MAX_TRANSMISSION_DURATION_SECS",
        ] {
            std::env::remove_var(name);
        }
    }

    fn write_temp_config(contents: &str) -> String {
        let unique_suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be after unix epoch")
            .as_nanos();
        let file_name = format!("aloft-config-{unique_suffix}.toml");
        let path = std::env::temp_dir().join(file_name);
        fs::write(&path, contents).expect("failed to write temp config");
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn defaults_are_loaded_when_file_missing() {
        let _guard = env_lock().lock().expect("env lock poisoned");
        clear_env();

        let cfg = load_config(Some("this-file-does-not-exist.toml")).expect("load should succeed");

        assert_eq!(cfg.server.host, default_host());
        assert_eq!(cfg.server.port, default_port());
        assert_eq!(cfg.database.path, default_db_path());
        assert_eq!(cfg.channel.cache_ttl_secs, aloft_types::constants::CACHE_TTL_SECS);
        assert_eq!(
            cfg.channel.max_transmission_duration_secs,
            aloft_types::constants::MAX_TRANSMISSION_DURATION_SECS
        );
        assert!(cfg.cors.allowed_origins.is_empty());
    }

    #[test]
    fn explicit_config_path_is_loaded() {
        let _guard = env_lock().lock().expect("env lock poisoned");
        clear_env();

        let path = write_temp_config(
            r#"
[server]
host = "0.0.0.0"
port = 4567

[database]
path = "path-from-file.db"
busy_timeout_ms = 15000
pool_max_size = 32

[logging]
level = "trace"
json = true

[cors]
allowed_origins = ["https://aloft.example"]
"#,
        );

        let cfg = load_config(Some(path.as_str())).expect("load should succeed");

        assert_eq!(cfg.server.host, IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        assert_eq!(cfg.server.port, 4567);
        assert_eq!(cfg.database.path, "path-from-file.db");
        assert_eq!(cfg.database.busy_timeout_ms, 15_000);
        assert_eq!(cfg.database.pool_max_size, 32);
        assert_eq!(cfg.logging.level, "trace");
        assert!(cfg.logging.json);
        assert_eq!(cfg.cors.allowed_origins, vec!["https://aloft.example".to_string()]);

        fs::remove_file(path).expect("failed to remove temp config");
    }

    #[test]
    fn env_overrides_are_applied() {
        let _guard = env_lock().lock().expect("env lock poisoned");
        clear_env();

        std::env::set_var("ALOFT_HOST", "0.0.0.0");
        std::env::set_var("ALOFT_PORT", "9876");
        std::env::set_var("ALOFT_DB_PATH", "custom.db");
        std::env::set_var("ALOFT_DB_BUSY_TIMEOUT_MS", "12000");
        std::env::set_var("ALOFT_DB_POOL_MAX_SIZE", "16");
        std::env::set_var("ALOFT_LOG_LEVEL", "debug");
        std::env::set_var("ALOFT_LOG_JSON", "yes");
        std::env::set_var("ALOFT_CORS_ORIGINS", "https://a.example, https://b.example");

        let cfg = load_config(None).expect("load should succeed");

        assert_eq!(cfg.server.host, IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        assert_eq!(cfg.server.port, 9876);
        assert_eq!(cfg.database.path, "custom.db");
        assert_eq!(cfg.database.busy_timeout_ms, 12_000);
        assert_eq!(cfg.database.pool_max_size, 16);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
        assert_eq!(
            cfg.cors.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );

        clear_env();
    }

    #[test]
    fn invalid_port_env_returns_error() {
        let _guard = env_lock().lock().expect("env lock poisoned");
        clear_env();

        std::env::set_var("ALOFT_PORT", "invalid-port");

        let err = load_config(None).expect_err("load should fail for invalid port");
        match err {
            ConfigError::InvalidEnvVar { name, .. } => assert_eq!(name, "ALOFT_PORT"),
            other => panic!("unexpected error: {other}"),
        }

        clear_env();
    }

    #[test]
    fn invalid_json_bool_env_returns_error() {
        let _guard = env_lock().lock().expect("env lock poisoned");
        clear_env();

        std::env::set_var("ALOFT_LOG_JSON", "definitely");

        let err = load_config(None).expect_err("load should fail for invalid bool value");
        match err {
            ConfigError::InvalidEnvVar { name, .. } => assert_eq!(name, "ALOFT_LOG_JSON"),
            other => panic!("unexpected error: {other}"),
        }

        clear_env();
    }

    #[test]
    fn out_of_range_busy_timeout_returns_error() {
        let _guard = env_lock().lock().expect("env lock poisoned");
        clear_env();

        std::env::set_var("ALOFT_DB_BUSY_TIMEOUT_MS", "0");

        let err = load_config(None).expect_err("load should fail for out-of-range timeout");
        match err {
            ConfigError::InvalidValue { field, .. } => {
                assert_eq!(field, "database.busy_timeout_ms")
            }
            other => panic!("unexpected error: {other}"),
        }

        clear_env();
    }

    #[test]
    fn zero_max_transmission_duration_returns_error() {
        let _guard = env_lock().lock().expect("env lock poisoned");
        clear_env();

        std::env::set_var("ALOFT_MAX_TRANSMISSION_DURATION_SECS", "0");

        let err = load_config(None).expect_err("load should fail for zero duration cap");
        match err {
            ConfigError::InvalidValue { field, .. } => {
                assert_eq!(field, "channel.max_transmission_duration_secs")
            }
            other => panic!("unexpected error: {other}"),
        }

        clear_env();
    }
}
