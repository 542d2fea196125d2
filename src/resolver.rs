//! Merges the raw service sources into fully-defaulted [`ServiceRecord`]s
//!
//! Per host and per field the environment wins over the file, and the file
//! wins over [`GlobalDefaults`]. A host that ends up without a required
//! field, or with a value that cannot be used, is excluded and reported
//! instead of failing the whole resolution.

use hyper::Uri;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use thiserror::Error;

use crate::config::{GlobalDefaults, PartialService, RawConfigSources, ServiceField, ServiceMap};
use crate::wol::{MacAddress, MacAddressError};

/// Resolved, immutable configuration for one proxied host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Lower-cased host this record answers for
    pub host: String,
    /// Absolute `http://` URL prefix, without trailing slash
    pub base_url: String,
    /// Path appended to `base_url` for awake checks, always starting with `/`
    pub awake_check_path: String,
    pub mac_address: MacAddress,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub awake_request_timeout: Duration,
}

impl ServiceRecord {
    pub fn awake_check_url(&self) -> String {
        format!("{}{}", self.base_url, self.awake_check_path)
    }

    /// Target URL for a forwarded request, keeping its path and query
    pub fn forward_url(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }

    /// Upper bound on the wake phase when every attempt fails, `None` on overflow
    pub fn worst_case_wake_time(&self) -> Option<Duration> {
        self.poll_interval
            .checked_add(self.awake_request_timeout)?
            .checked_mul(self.max_retries)?
            .checked_add(self.awake_request_timeout)
    }
}

#[cfg(test)]
impl ServiceRecord {
    /// Record with short timings pointing at `base_url`
    pub(crate) fn for_tests(base_url: &str) -> Self {
        Self {
            host: "test.lan".to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            awake_check_path: "/health".to_string(),
            mac_address: MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            poll_interval: Duration::from_secs(1),
            max_retries: 3,
            request_timeout: Duration::from_secs(5),
            awake_request_timeout: Duration::from_secs(1),
        }
    }
}

/// Why a host's merged configuration was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceConfigError {
    #[error("missing required field '{}'", .0.key())]
    MissingField(ServiceField),
    #[error("invalid mac_address: {0}")]
    InvalidMacAddress(#[from] MacAddressError),
    #[error("invalid base_url '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("'{}' must be greater than 0", .0.key())]
    ZeroTimeout(ServiceField),
    #[error("unreadable entry in service file: {0}")]
    InvalidEntry(String),
}

/// A host excluded from the registry
#[derive(Debug, PartialEq, Eq)]
pub struct ConfigIssue {
    pub host: String,
    pub error: ServiceConfigError,
}

/// Result of merging both sources
#[derive(Debug, Default)]
pub struct Resolution {
    pub services: HashMap<String, ServiceRecord>,
    /// Excluded hosts, sorted by host
    pub issues: Vec<ConfigIssue>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Resolve both raw sources with the given defaults. Hosts whose file entry
/// could not be read are excluded even when the environment defines them.
pub fn resolve_sources(sources: &RawConfigSources, defaults: &GlobalDefaults) -> Resolution {
    let mut resolution = resolve(&sources.file.services, &sources.env, defaults);

    for entry in &sources.file.rejected {
        resolution.services.remove(&entry.host);
        resolution.issues.retain(|issue| issue.host != entry.host);
        resolution.issues.push(ConfigIssue {
            host: entry.host.clone(),
            error: ServiceConfigError::InvalidEntry(entry.reason.clone()),
        });
    }
    resolution.issues.sort_by(|a, b| a.host.cmp(&b.host));

    resolution
}

/// Merge file and env service maps, field by field, over the global defaults
pub fn resolve(file: &ServiceMap, env: &ServiceMap, defaults: &GlobalDefaults) -> Resolution {
    let file = lowercase_keys(file);
    let env = lowercase_keys(env);

    let hosts: BTreeSet<&String> = file.keys().chain(env.keys()).collect();

    let mut resolution = Resolution::default();
    for host in hosts {
        let merged = merge(file.get(host).copied(), env.get(host).copied());
        match build_record(host, &merged, defaults) {
            Ok(record) => {
                resolution.services.insert(host.clone(), record);
            }
            Err(error) => resolution.issues.push(ConfigIssue {
                host: host.clone(),
                error,
            }),
        }
    }

    resolution
}

fn lowercase_keys(map: &ServiceMap) -> HashMap<String, &PartialService> {
    map.iter()
        .map(|(host, service)| (host.trim().to_lowercase(), service))
        .collect()
}

/// Field-level merge: each field independently prefers `env` over `file`
fn merge(file: Option<&PartialService>, env: Option<&PartialService>) -> PartialService {
    fn pick<T: Clone>(
        env: Option<&PartialService>,
        file: Option<&PartialService>,
        get: impl Fn(&PartialService) -> &Option<T>,
    ) -> Option<T> {
        env.and_then(|s| get(s).clone())
            .or_else(|| file.and_then(|s| get(s).clone()))
    }

    PartialService {
        base_url: pick(env, file, |s| &s.base_url),
        awake_check_endpoint: pick(env, file, |s| &s.awake_check_endpoint),
        mac_address: pick(env, file, |s| &s.mac_address),
        poll_interval: pick(env, file, |s| &s.poll_interval),
        max_retries: pick(env, file, |s| &s.max_retries),
        request_timeout: pick(env, file, |s| &s.request_timeout),
        awake_request_timeout: pick(env, file, |s| &s.awake_request_timeout),
    }
}

fn build_record(
    host: &str,
    merged: &PartialService,
    defaults: &GlobalDefaults,
) -> Result<ServiceRecord, ServiceConfigError> {
    let base_url = required(&merged.base_url, ServiceField::BaseUrl)?;
    let awake_check_endpoint = required(&merged.awake_check_endpoint, ServiceField::AwakeCheckEndpoint)?;
    let mac_address = required(&merged.mac_address, ServiceField::MacAddress)?;

    let base_url = normalize_base_url(base_url)?;
    let mac_address: MacAddress = mac_address.parse()?;

    let awake_check_path = if awake_check_endpoint.starts_with('/') {
        awake_check_endpoint.to_string()
    } else {
        format!("/{}", awake_check_endpoint)
    };

    let request_timeout = merged
        .request_timeout
        .map(Duration::from_secs)
        .unwrap_or(defaults.request_timeout);
    let awake_request_timeout = merged
        .awake_request_timeout
        .map(Duration::from_secs)
        .unwrap_or(defaults.awake_request_timeout);

    if request_timeout.is_zero() {
        return Err(ServiceConfigError::ZeroTimeout(ServiceField::RequestTimeout));
    }
    if awake_request_timeout.is_zero() {
        return Err(ServiceConfigError::ZeroTimeout(ServiceField::AwakeRequestTimeout));
    }

    Ok(ServiceRecord {
        host: host.to_string(),
        base_url,
        awake_check_path,
        mac_address,
        poll_interval: merged
            .poll_interval
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval),
        max_retries: merged.max_retries.unwrap_or(defaults.max_retries),
        request_timeout,
        awake_request_timeout,
    })
}

fn required(value: &Option<String>, field: ServiceField) -> Result<&str, ServiceConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ServiceConfigError::MissingField(field))
}

fn normalize_base_url(url: &str) -> Result<String, ServiceConfigError> {
    let invalid = |reason: &str| ServiceConfigError::InvalidBaseUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let uri = url.parse::<Uri>().map_err(|e| invalid(&e.to_string()))?;

    match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
        Some(_) => return Err(invalid("only http:// backends are supported")),
        None => return Err(invalid("must be an absolute URL")),
    }
    if uri.authority().is_none() {
        return Err(invalid("missing host"));
    }
    if uri.query().is_some() {
        return Err(invalid("must not contain a query"));
    }

    Ok(url.trim_end_matches('/').to_string())
}
