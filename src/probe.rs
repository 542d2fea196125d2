//! Awake checks against a service's check endpoint

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::AwakePolicy;
use crate::pool::ConnectionPool;
use crate::resolver::ServiceRecord;

/// Result of a single awake check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Awake,
    Unresponsive,
}

impl ProbeOutcome {
    pub fn is_awake(&self) -> bool {
        matches!(self, ProbeOutcome::Awake)
    }
}

/// Decides whether a service is currently awake.
///
/// Implementations must finish within `record.awake_request_timeout` and
/// report failures as [`ProbeOutcome::Unresponsive`] rather than erroring.
pub trait AwakeProbe: Send + Sync {
    fn probe<'a>(&'a self, record: &'a ServiceRecord) -> impl Future<Output = ProbeOutcome> + Send + 'a;
}

/// Probes over HTTP using the shared connection pool
pub struct HttpProber {
    pool: Arc<ConnectionPool>,
    policy: AwakePolicy,
}

impl HttpProber {
    pub fn new(pool: Arc<ConnectionPool>, policy: AwakePolicy) -> Self {
        Self { pool, policy }
    }

    async fn check(&self, record: &ServiceRecord) -> ProbeOutcome {
        let url = record.awake_check_url();
        let timeout = record.awake_request_timeout;

        match tokio::time::timeout(timeout, self.pool.check(&url)).await {
            Ok(Ok(status)) => {
                let awake = match self.policy {
                    AwakePolicy::AnyResponse => true,
                    AwakePolicy::SuccessStatus => status.is_success(),
                };
                if awake {
                    debug!(host = %record.host, url, status = status.as_u16(), "Awake check succeeded");
                    ProbeOutcome::Awake
                } else {
                    info!(host = %record.host, url, status = status.as_u16(), "Awake check answered with non-success status, considering not awake");
                    ProbeOutcome::Unresponsive
                }
            }
            Ok(Err(e)) => {
                info!(host = %record.host, url, error = %e, "Awake check failed");
                ProbeOutcome::Unresponsive
            }
            Err(_) => {
                info!(host = %record.host, url, timeout_secs = timeout.as_secs_f64(), "Awake check timed out");
                ProbeOutcome::Unresponsive
            }
        }
    }
}

impl AwakeProbe for HttpProber {
    fn probe<'a>(&'a self, record: &'a ServiceRecord) -> impl Future<Output = ProbeOutcome> + Send + 'a {
        self.check(record)
    }
}
