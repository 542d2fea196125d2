//! Wake-and-forward state machine
//!
//! For every inbound request the engine probes the service, and while it is
//! unresponsive sends a magic packet, waits `poll_interval` and probes again,
//! up to `max_retries` times. Once awake the request is forwarded; if the
//! retry budget runs out nothing is forwarded.
//!
//! The engine holds no per-host state. Concurrent requests to the same cold
//! service each run their own loop, and dropping the future (for example when
//! the client disconnects) abandons any pending wait or probe.

use hyper::{Request, Response};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::pool::{PoolError, ProxyBody};
use crate::probe::AwakeProbe;
use crate::resolver::ServiceRecord;
use crate::wol::PacketSender;

/// Sends a request to a service once it is awake
pub trait Forwarder: Send + Sync {
    fn forward<'a>(
        &'a self,
        record: &'a ServiceRecord,
        req: Request<ProxyBody>,
    ) -> impl Future<Output = Result<Response<ProxyBody>, PoolError>> + Send + 'a;
}

impl<T: Forwarder> Forwarder for Arc<T> {
    fn forward<'a>(
        &'a self,
        record: &'a ServiceRecord,
        req: Request<ProxyBody>,
    ) -> impl Future<Output = Result<Response<ProxyBody>, PoolError>> + Send + 'a {
        (**self).forward(record, req)
    }
}

/// How the wake phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// First probe succeeded, no packet sent
    AlreadyAwake,
    /// Service answered after `attempts` wake attempts
    Woke { attempts: u32 },
    /// Retry budget consumed without an awake signal
    Exhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("service {host} did not wake after {attempts} attempts")]
    WakeExhausted { host: String, attempts: u32 },
    #[error("request to {host} failed after it woke up: {source}")]
    ForwardFailed {
        host: String,
        #[source]
        source: PoolError,
    },
    #[error("request to {host} timed out after {timeout:?}")]
    ForwardTimeout { host: String, timeout: Duration },
}

/// Drives probing, waking and forwarding for single requests
pub struct WakeEngine<P, S, F> {
    prober: P,
    sender: S,
    forwarder: F,
}

impl<P, S, F> WakeEngine<P, S, F>
where
    P: AwakeProbe,
    S: PacketSender,
    F: Forwarder,
{
    pub fn new(prober: P, sender: S, forwarder: F) -> Self {
        Self {
            prober,
            sender,
            forwarder,
        }
    }

    pub fn prober(&self) -> &P {
        &self.prober
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    pub fn forwarder(&self) -> &F {
        &self.forwarder
    }

    /// Probe, and wake the service if needed
    pub async fn wake(&self, record: &ServiceRecord) -> WakeOutcome {
        if self.prober.probe(record).await.is_awake() {
            debug!(host = %record.host, "Service already awake");
            return WakeOutcome::AlreadyAwake;
        }

        for attempt in 1..=record.max_retries {
            info!(
                host = %record.host,
                attempt,
                max_retries = record.max_retries,
                poll_interval_secs = record.poll_interval.as_secs(),
                "Service not awake, sending magic packet"
            );

            // Delivery is not confirmed; the next probe decides
            if let Err(e) = self.sender.send(&record.mac_address) {
                warn!(host = %record.host, attempt, error = %e, "Magic packet send failed");
            }

            tokio::time::sleep(record.poll_interval).await;

            if self.prober.probe(record).await.is_awake() {
                info!(host = %record.host, attempt, "Service is awake");
                return WakeOutcome::Woke { attempts: attempt };
            }
        }

        error!(
            host = %record.host,
            max_retries = record.max_retries,
            "Service did not wake up"
        );
        WakeOutcome::Exhausted {
            attempts: record.max_retries,
        }
    }

    /// Wake the service if needed, then forward `req` and return the backend's response
    pub async fn handle(
        &self,
        record: &ServiceRecord,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, EngineError> {
        if let WakeOutcome::Exhausted { attempts } = self.wake(record).await {
            return Err(EngineError::WakeExhausted {
                host: record.host.clone(),
                attempts,
            });
        }

        let timeout = record.request_timeout;
        match tokio::time::timeout(timeout, self.forwarder.forward(record, req)).await {
            Ok(Ok(response)) => {
                info!(host = %record.host, status = response.status().as_u16(), "Proxied response from backend");
                Ok(response)
            }
            Ok(Err(source)) => Err(EngineError::ForwardFailed {
                host: record.host.clone(),
                source,
            }),
            Err(_) => Err(EngineError::ForwardTimeout {
                host: record.host.clone(),
                timeout,
            }),
        }
    }
}
