//! Process settings and raw service configuration sources
//!
//! Two independent sources describe services: a service map file (YAML, or
//! TOML when the path ends in `.toml`) and `SERVICE_<HOST>_<FIELD>`
//! environment variables. Both are loaded into [`PartialService`] maps keyed
//! by lower-cased host; merging them is the resolver's job.

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::wol::default_broadcast_addr;

/// Prefix of per-service environment variables
pub const SERVICE_ENV_PREFIX: &str = "SERVICE_";

/// A configurable field of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceField {
    BaseUrl,
    AwakeCheckEndpoint,
    MacAddress,
    PollInterval,
    MaxRetries,
    RequestTimeout,
    AwakeRequestTimeout,
}

impl ServiceField {
    pub const ALL: [ServiceField; 7] = [
        ServiceField::BaseUrl,
        ServiceField::AwakeCheckEndpoint,
        ServiceField::MacAddress,
        ServiceField::PollInterval,
        ServiceField::MaxRetries,
        ServiceField::RequestTimeout,
        ServiceField::AwakeRequestTimeout,
    ];

    /// Key used in the service map file
    pub fn key(&self) -> &'static str {
        match self {
            ServiceField::BaseUrl => "base_url",
            ServiceField::AwakeCheckEndpoint => "awake_check_endpoint",
            ServiceField::MacAddress => "mac_address",
            ServiceField::PollInterval => "poll_interval",
            ServiceField::MaxRetries => "max_retries",
            ServiceField::RequestTimeout => "request_timeout",
            ServiceField::AwakeRequestTimeout => "awake_request_timeout",
        }
    }

    /// Suffix used in `SERVICE_<HOST>_<FIELD>` variable names
    pub fn env_suffix(&self) -> &'static str {
        match self {
            ServiceField::BaseUrl => "BASE_URL",
            ServiceField::AwakeCheckEndpoint => "AWAKE_CHECK_ENDPOINT",
            ServiceField::MacAddress => "MAC_ADDRESS",
            ServiceField::PollInterval => "POLL_INTERVAL",
            ServiceField::MaxRetries => "MAX_RETRIES",
            ServiceField::RequestTimeout => "REQUEST_TIMEOUT",
            ServiceField::AwakeRequestTimeout => "AWAKE_REQUEST_TIMEOUT",
        }
    }
}

/// Service configuration as written in one source. Every field is optional;
/// missing required fields are detected after merging.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct PartialService {
    pub base_url: Option<String>,
    pub awake_check_endpoint: Option<String>,
    pub mac_address: Option<String>,
    /// Seconds between wake attempts
    pub poll_interval: Option<u64>,
    pub max_retries: Option<u32>,
    /// Seconds
    pub request_timeout: Option<u64>,
    /// Seconds
    pub awake_request_timeout: Option<u64>,
}

impl PartialService {
    /// Set a single field from its textual form
    pub fn set(&mut self, field: ServiceField, value: &str) -> Result<(), std::num::ParseIntError> {
        let value = value.trim();
        match field {
            ServiceField::BaseUrl => self.base_url = Some(value.to_string()),
            ServiceField::AwakeCheckEndpoint => self.awake_check_endpoint = Some(value.to_string()),
            ServiceField::MacAddress => self.mac_address = Some(value.to_string()),
            ServiceField::PollInterval => self.poll_interval = Some(value.parse()?),
            ServiceField::MaxRetries => self.max_retries = Some(value.parse()?),
            ServiceField::RequestTimeout => self.request_timeout = Some(value.parse()?),
            ServiceField::AwakeRequestTimeout => self.awake_request_timeout = Some(value.parse()?),
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        *self == PartialService::default()
    }
}

/// Service maps keyed by lower-cased host
pub type ServiceMap = HashMap<String, PartialService>;

/// A service file entry whose values could not be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEntry {
    /// Lower-cased host
    pub host: String,
    pub reason: String,
}

/// Contents of the service map file. Entries are read one host at a time,
/// so a badly typed value only rejects its own host.
#[derive(Debug, Clone, Default)]
pub struct ServiceFile {
    pub services: ServiceMap,
    /// Sorted by host
    pub rejected: Vec<RejectedEntry>,
}

impl ServiceFile {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.rejected.is_empty()
    }
}

/// Probe result interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AwakePolicy {
    /// Any HTTP response means the service is awake
    #[default]
    AnyResponse,
    /// Only 2xx responses mean the service is awake
    SuccessStatus,
}

impl std::str::FromStr for AwakePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "any-response" => Ok(AwakePolicy::AnyResponse),
            "success" | "2xx" => Ok(AwakePolicy::SuccessStatus),
            other => anyhow::bail!("unknown awake check policy '{}' (expected 'any' or 'success')", other),
        }
    }
}

/// Process-wide fallbacks for the optional service fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalDefaults {
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub awake_request_timeout: Duration,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(default_poll_interval()),
            max_retries: default_max_retries(),
            request_timeout: Duration::from_secs(default_request_timeout()),
            awake_request_timeout: Duration::from_secs(default_request_timeout()),
        }
    }
}

impl GlobalDefaults {
    fn from_env_map(vars: &HashMap<String, String>) -> anyhow::Result<Self> {
        let poll_interval = parse_var(vars, "GLOBAL_POLL_INTERVAL")?.unwrap_or_else(default_poll_interval);
        let max_retries = parse_var(vars, "GLOBAL_MAX_RETRIES")?.unwrap_or_else(default_max_retries);
        let request_timeout =
            parse_var(vars, "GLOBAL_REQUEST_TIMEOUT")?.unwrap_or_else(default_request_timeout);
        let awake_request_timeout =
            parse_var(vars, "GLOBAL_AWAKE_REQUEST_TIMEOUT")?.unwrap_or(request_timeout);

        if request_timeout == 0 {
            anyhow::bail!("GLOBAL_REQUEST_TIMEOUT must be greater than 0");
        }
        if awake_request_timeout == 0 {
            anyhow::bail!("GLOBAL_AWAKE_REQUEST_TIMEOUT must be greater than 0");
        }

        Ok(Self {
            poll_interval: Duration::from_secs(poll_interval),
            max_retries,
            request_timeout: Duration::from_secs(request_timeout),
            awake_request_timeout: Duration::from_secs(awake_request_timeout),
        })
    }
}

/// Process settings, read once from the environment at startup
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub bind: String,
    pub services_config_path: PathBuf,
    pub log_level: String,
    pub defaults: GlobalDefaults,
    pub awake_policy: AwakePolicy,
    /// Destination of magic packets
    pub wol_target: SocketAddr,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            bind: default_bind_address(),
            services_config_path: PathBuf::from(default_services_config_path()),
            log_level: default_log_level(),
            defaults: GlobalDefaults::default(),
            awake_policy: AwakePolicy::default(),
            wol_target: default_broadcast_addr(),
        }
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(process_env())
    }

    pub fn from_vars<I>(vars: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let port = parse_var(&vars, "SERVER_PORT")?.unwrap_or_else(default_server_port);
        let bind = vars
            .get("SERVER_BIND")
            .map(|v| v.trim().to_string())
            .unwrap_or_else(default_bind_address);
        let services_config_path = vars
            .get("SERVICES_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(default_services_config_path()));
        let log_level = vars
            .get("LOG_LEVEL")
            .map(|v| v.trim().to_uppercase())
            .unwrap_or_else(default_log_level);
        let awake_policy = match vars.get("AWAKE_CHECK_POLICY") {
            Some(value) => value.parse()?,
            None => AwakePolicy::default(),
        };
        let wol_target = match vars.get("WOL_BROADCAST_ADDRESS") {
            Some(value) => parse_wol_target(value)?,
            None => default_broadcast_addr(),
        };

        Ok(Self {
            port,
            bind,
            services_config_path,
            log_level,
            defaults: GlobalDefaults::from_env_map(&vars)?,
            awake_policy,
            wol_target,
        })
    }

    pub fn log_directive(&self) -> &'static str {
        log_directive(&self.log_level)
    }
}

/// Map a `LOG_LEVEL` value to a tracing filter directive
pub fn log_directive(level: &str) -> &'static str {
    match level.trim().to_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" | "FATAL" => "error",
        _ => "info",
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    vars.get(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {}: '{}'", name, value))
        })
        .transpose()
}

/// Accepts `ip:port` or a bare IP (port 9 assumed)
fn parse_wol_target(value: &str) -> anyhow::Result<SocketAddr> {
    let value = value.trim();
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: std::net::IpAddr = value
        .parse()
        .with_context(|| format!("invalid value for WOL_BROADCAST_ADDRESS: '{}'", value))?;
    Ok(SocketAddr::new(ip, crate::wol::WOL_PORT))
}

/// The process environment, without entries that are not valid UTF-8
pub fn process_env() -> Vec<(String, String)> {
    utf8_vars(std::env::vars_os())
}

fn utf8_vars<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (Ok(key), Err(_)) => {
                warn!(key, "Ignoring environment variable with a non-UTF-8 value");
                None
            }
            (Err(key), _) => {
                warn!(key = %key.to_string_lossy(), "Ignoring environment variable with a non-UTF-8 name");
                None
            }
        })
        .collect()
}

/// Both raw service sources, as loaded
#[derive(Debug, Clone, Default)]
pub struct RawConfigSources {
    pub file: ServiceFile,
    pub env: ServiceMap,
}

impl RawConfigSources {
    /// Read the service map file and the current process environment
    pub fn load(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            file: load_service_file(&settings.services_config_path)?,
            env: env_service_overrides(process_env()),
        })
    }
}

/// Load the service map file. A missing file is an empty map; a file that
/// is not valid YAML/TOML, or not a mapping of hosts, is an error.
pub fn load_service_file(path: &Path) -> anyhow::Result<ServiceFile> {
    if !path.exists() {
        warn!(path = %path.display(), "Service config file not found");
        return Ok(ServiceFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read service config {}", path.display()))?;

    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    let services = if is_toml {
        parse_toml_services(&content)
    } else {
        parse_yaml_services(&content)
    }
    .with_context(|| format!("failed to parse service config {}", path.display()))?;

    debug!(
        path = %path.display(),
        services = services.services.len(),
        rejected = services.rejected.len(),
        "Loaded service config file"
    );
    Ok(services)
}

/// Parse a YAML service map (`host: {base_url: ..., ...}`)
pub fn parse_yaml_services(content: &str) -> anyhow::Result<ServiceFile> {
    let raw: Option<HashMap<String, serde_yaml::Value>> = serde_yaml::from_str(content)?;
    Ok(collect_entries(raw.unwrap_or_default(), |value| {
        // A bare `host:` line is an empty entry
        serde_yaml::from_value::<Option<PartialService>>(value)
            .map(Option::unwrap_or_default)
            .map_err(|e| e.to_string())
    }))
}

/// Parse a TOML service map (`["host"]` tables)
pub fn parse_toml_services(content: &str) -> anyhow::Result<ServiceFile> {
    let raw: toml::Table = toml::from_str(content)?;
    Ok(collect_entries(raw, |value| {
        value.try_into::<PartialService>().map_err(|e| e.to_string())
    }))
}

fn collect_entries<I, V, F>(raw: I, convert: F) -> ServiceFile
where
    I: IntoIterator<Item = (String, V)>,
    F: Fn(V) -> Result<PartialService, String>,
{
    let mut file = ServiceFile::default();
    for (host, value) in raw {
        let key = host.trim().to_lowercase();
        if file.services.contains_key(&key) || file.rejected.iter().any(|r| r.host == key) {
            warn!(host = %host, "Duplicate service host after case folding, later entry wins");
            file.services.remove(&key);
            file.rejected.retain(|r| r.host != key);
        }
        match convert(value) {
            Ok(service) => {
                file.services.insert(key, service);
            }
            Err(reason) => {
                warn!(host = %key, reason, "Service entry has invalid values");
                file.rejected.push(RejectedEntry { host: key, reason });
            }
        }
    }
    file.rejected.sort_by(|a, b| a.host.cmp(&b.host));
    file
}

/// Split `SERVICE_<HOST>_<FIELD>` into host and field, using the longest matching field suffix
pub fn parse_service_env_key(key: &str) -> Option<(String, ServiceField)> {
    let rest = key.strip_prefix(SERVICE_ENV_PREFIX)?;

    // An empty head (`SERVICE_BASE_URL`) yields an empty host for the caller to reject
    let field = ServiceField::ALL
        .iter()
        .filter(|field| {
            rest.strip_suffix(field.env_suffix())
                .map(|head| head.is_empty() || head.ends_with('_'))
                .unwrap_or(false)
        })
        .max_by_key(|field| field.env_suffix().len())?;

    let head = &rest[..rest.len() - field.env_suffix().len()];
    let host = head.strip_suffix('_').unwrap_or(head);
    Some((host.to_lowercase(), *field))
}

/// Collect per-field service overrides from environment variables
pub fn env_service_overrides<I>(vars: I) -> ServiceMap
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut services = ServiceMap::new();
    let mut applied = 0usize;

    for (key, value) in vars {
        if !key.starts_with(SERVICE_ENV_PREFIX) {
            continue;
        }

        let Some((host, field)) = parse_service_env_key(&key) else {
            debug!(key, "Ignoring env var without a known service field suffix");
            continue;
        };

        if host.is_empty() {
            warn!(key, "Ignoring env var with a field suffix but no host");
            continue;
        }

        let service = services.entry(host.clone()).or_default();
        match service.set(field, &value) {
            Ok(()) => {
                debug!(host, field = field.key(), key, "Applied service override from env");
                applied += 1;
            }
            Err(e) => {
                error!(host, field = field.key(), key, value, error = %e, "Invalid numeric value in env override, ignoring");
            }
        }
    }

    services.retain(|_, service| !service.is_empty());
    info!(applied, hosts = services.len(), "Scanned environment for service overrides");
    services
}

// Default value functions
fn default_server_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_services_config_path() -> &'static str {
    "/config/services.yaml"
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    10
}

fn default_request_timeout() -> u64 {
    5
}
