//! Connection health monitor.
//!
//! Probes the backend once at startup, then on a fixed interval, and on
//! demand after the user opens the interstitial bypass link. Each cycle makes
//! up to `retry_count` attempts and publishes exactly one [`ConnectionStatus`].
//!
//! Classification per attempt:
//!
//! | Outcome                              | Result                          | Retried |
//! |--------------------------------------|---------------------------------|---------|
//! | attempt timed out                    | `Disconnected(Timeout)`         | no      |
//! | network failure on every candidate   | `Disconnected(NetworkFailure)`  | yes     |
//! | `text/html` response (interstitial)  | `Disconnected(Interstitial)`    | yes     |
//! | 2xx with `{"status": "ok"}`          | `Connected`                     | -       |
//! | 2xx with anything else               | `Disconnected(ServiceError)`    | no      |
//! | non-2xx                              | `Disconnected(ServiceError(code))` | no   |

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use reqwest::header::CONTENT_TYPE;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, Dialect};
use crate::transport::config_headers;
use crate::types::{EndpointRequest, HealthResponse};

/// Why the backend is considered unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The probe did not answer within the request timeout.
    Timeout,
    /// Connection refused, DNS failure and the like, on every attempt.
    NetworkFailure,
    /// The tunnel served its interstitial page instead of the API.
    Interstitial,
    /// The user opened the bypass link; a re-probe is scheduled.
    BypassPending,
    /// The backend answered but is not healthy. Carries the HTTP status when
    /// it was not a success.
    ServiceError(Option<u16>),
}

/// Link state machine: `Unknown -> {Connected, Disconnected(reason)}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No probe has completed yet.
    Unknown,
    /// Last probe succeeded.
    Connected,
    /// Last probe failed.
    Disconnected(DisconnectReason),
}

/// Published result of a probe cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Machine-readable state.
    pub state: LinkState,
    /// Human-readable explanation for the status line.
    pub reason_text: String,
}

impl ConnectionStatus {
    /// Status before the first probe.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            state: LinkState::Unknown,
            reason_text: "Checking connection...".to_string(),
        }
    }

    /// Healthy backend.
    #[must_use]
    pub fn connected() -> Self {
        Self {
            state: LinkState::Connected,
            reason_text: "Connected".to_string(),
        }
    }

    /// Unreachable backend with the standard text for `reason`.
    #[must_use]
    pub fn disconnected(reason: DisconnectReason) -> Self {
        let reason_text = match reason {
            DisconnectReason::Timeout => "Connection timeout".to_string(),
            DisconnectReason::NetworkFailure => "Network error - check tunnel URL".to_string(),
            DisconnectReason::Interstitial => "Click to bypass interstitial page".to_string(),
            DisconnectReason::BypassPending => "Waiting for bypass...".to_string(),
            DisconnectReason::ServiceError(None) => "Service unavailable".to_string(),
            DisconnectReason::ServiceError(Some(403)) => {
                "Access denied - check tunnel URL".to_string()
            }
            DisconnectReason::ServiceError(Some(502 | 503)) => {
                "Backend service unavailable".to_string()
            }
            DisconnectReason::ServiceError(Some(code)) => format!("Server error ({code})"),
        };
        Self {
            state: LinkState::Disconnected(reason),
            reason_text,
        }
    }

    /// Whether chat turns may be sent.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Connected)
    }

    /// Whether the interstitial bypass action is available.
    #[must_use]
    pub const fn offers_bypass(&self) -> bool {
        matches!(
            self.state,
            LinkState::Disconnected(DisconnectReason::Interstitial)
        )
    }
}

/// Read-only view of the published status, consulted before each send.
pub trait StatusSource: Send + Sync {
    /// Snapshot of the latest published status.
    fn current_status(&self) -> ConnectionStatus;
}

impl StatusSource for ConnectionStatus {
    fn current_status(&self) -> ConnectionStatus {
        self.clone()
    }
}

/// Handle returned by [`HealthMonitor::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

/// Outcome of a single probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AttemptOutcome {
    Healthy,
    Unhealthy,
    HttpStatus(u16),
    Interstitial,
    Timeout,
    Network(String),
}

struct Inner {
    config: Arc<ClientConfig>,
    client: reqwest::Client,
    status: RwLock<ConnectionStatus>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
    cycle: tokio::sync::Mutex<()>,
    bypass_pending: AtomicBool,
}

/// Periodic and on-demand liveness prober.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("status", &*self.inner.status.read())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor. No probe runs until [`probe`](Self::probe) or
    /// [`spawn_periodic`](Self::spawn_periodic) is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: Arc<ClientConfig>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                status: RwLock::new(ConnectionStatus::unknown()),
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                cycle: tokio::sync::Mutex::new(()),
                bypass_pending: AtomicBool::new(false),
            }),
        })
    }

    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.read().clone()
    }

    /// Register a callback run after every publication, in registration order.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Store and publish a cycle result. While a bypass is pending only
    /// `Connected` replaces `BypassPending`.
    fn settle(&self, mut status: ConnectionStatus) -> ConnectionStatus {
        {
            let mut current = self.inner.status.write();
            if self.inner.bypass_pending.load(Ordering::Acquire) {
                if status.is_connected() {
                    self.inner.bypass_pending.store(false, Ordering::Release);
                } else {
                    status = ConnectionStatus::disconnected(DisconnectReason::BypassPending);
                }
            }
            current.clone_from(&status);
        }
        tracing::info!(state = ?status.state, reason = %status.reason_text, "Health probe finished");
        self.notify(&status);
        status
    }

    fn notify(&self, status: &ConnectionStatus) {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let subscribers: Vec<Subscriber> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in subscribers {
            callback(status);
        }
    }

    /// Run one probe cycle and publish its result.
    ///
    /// Concurrent calls are serialized; each publishes once. While a bypass
    /// is pending, any result other than `Connected` is published as
    /// `BypassPending` until the scheduled re-probe runs.
    pub async fn probe(&self) -> ConnectionStatus {
        let _cycle = self.inner.cycle.lock().await;
        let status = self.run_cycle().await;
        self.settle(status)
    }

    /// The re-probe scheduled by [`begin_bypass`](Self::begin_bypass); its
    /// result is published as is.
    async fn finish_bypass(&self) -> ConnectionStatus {
        let _cycle = self.inner.cycle.lock().await;
        self.inner.bypass_pending.store(false, Ordering::Release);
        let status = self.run_cycle().await;
        self.settle(status)
    }

    async fn run_cycle(&self) -> ConnectionStatus {
        let api = &self.inner.config.api;
        let attempts = api.retry_count.max(1);

        for attempt in 1..=attempts {
            let outcome = self.attempt().await;

            let retry_reason = match outcome {
                AttemptOutcome::Healthy => return ConnectionStatus::connected(),
                AttemptOutcome::Unhealthy => {
                    return ConnectionStatus::disconnected(DisconnectReason::ServiceError(None))
                }
                AttemptOutcome::HttpStatus(code) => {
                    return ConnectionStatus::disconnected(DisconnectReason::ServiceError(Some(
                        code,
                    )))
                }
                AttemptOutcome::Timeout => {
                    return ConnectionStatus::disconnected(DisconnectReason::Timeout)
                }
                AttemptOutcome::Interstitial => DisconnectReason::Interstitial,
                AttemptOutcome::Network(error) => {
                    tracing::debug!(attempt, error = %error, "Backend unreachable");
                    DisconnectReason::NetworkFailure
                }
            };

            if attempt == attempts {
                return ConnectionStatus::disconnected(retry_reason);
            }

            let backoff = api.retry_base_delay() * attempt;
            tracing::debug!(attempt, backoff_ms = backoff.as_millis() as u64, reason = ?retry_reason, "Retrying probe");
            tokio::time::sleep(backoff).await;
        }

        // Unreachable with attempts >= 1.
        ConnectionStatus::disconnected(DisconnectReason::NetworkFailure)
    }

    /// Ordered candidate URLs for one attempt: skip-flagged first, then plain.
    fn candidates(&self) -> [String; 2] {
        let api = &self.inner.config.api;
        let url = api.health_url();
        [api.with_skip_param(&url), url]
    }

    fn build_request(&self, url: &str) -> reqwest::RequestBuilder {
        let api = &self.inner.config.api;
        let headers = config_headers(api);
        match api.dialect {
            Dialect::OpenAi => self.inner.client.get(url).headers(headers),
            Dialect::SingleEndpoint => self
                .inner
                .client
                .post(url)
                .headers(headers)
                .json(&EndpointRequest::Health),
        }
    }

    /// One attempt: first candidate that answers wins; the whole attempt,
    /// body included, is bounded by the request timeout.
    async fn attempt(&self) -> AttemptOutcome {
        let timeout = self.inner.config.api.timeout();
        let work = async {
            let mut last_error = String::new();
            for url in self.candidates() {
                match self.build_request(&url).send().await {
                    Ok(response) => return Self::classify(response).await,
                    Err(e) if e.is_timeout() => return AttemptOutcome::Timeout,
                    Err(e) => {
                        tracing::debug!(url = %url, error = %e, "Probe candidate failed");
                        last_error = e.to_string();
                    }
                }
            }
            AttemptOutcome::Network(last_error)
        };

        tokio::time::timeout(timeout, work)
            .await
            .unwrap_or(AttemptOutcome::Timeout)
    }

    async fn classify(response: reqwest::Response) -> AttemptOutcome {
        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"));
        if is_html {
            return AttemptOutcome::Interstitial;
        }

        let status = response.status();
        if !status.is_success() {
            return AttemptOutcome::HttpStatus(status.as_u16());
        }

        match response.json::<HealthResponse>().await {
            Ok(body) if body.status.as_deref() == Some("ok") => AttemptOutcome::Healthy,
            Ok(_) => AttemptOutcome::Unhealthy,
            Err(e) if e.is_timeout() => AttemptOutcome::Timeout,
            Err(e) => {
                tracing::debug!(error = %e, "Health body is not the expected JSON");
                AttemptOutcome::Unhealthy
            }
        }
    }

    /// Probe now, then every `health_check_interval` until `shutdown` fires.
    pub fn spawn_periodic(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        let period = self.inner.config.ui.health_check_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        monitor.probe().await;
                    }
                }
            }
            tracing::debug!("Health monitor stopped");
        })
    }

    /// Start the interstitial bypass: returns the page the user should open
    /// and schedules one re-probe after the configured delay.
    ///
    /// Only available while the status is `Disconnected(Interstitial)`;
    /// returns `None` otherwise, including while a bypass is already pending.
    /// Sends are blocked meanwhile because the published status is
    /// `Disconnected(BypassPending)`.
    pub fn begin_bypass(&self) -> Option<String> {
        let pending = ConnectionStatus::disconnected(DisconnectReason::BypassPending);
        {
            let mut status = self.inner.status.write();
            if !status.offers_bypass() {
                return None;
            }
            self.inner.bypass_pending.store(true, Ordering::Release);
            *status = pending.clone();
        }
        self.notify(&pending);

        let config = &self.inner.config;
        let url = config.api.bypass_url();
        let delay = config.ui.bypass_reprobe_delay();
        tracing::info!(url = %url, delay_ms = delay.as_millis() as u64, "Interstitial bypass started");

        let monitor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            monitor.finish_bypass().await;
        });

        Some(url)
    }
}

impl StatusSource for HealthMonitor {
    fn current_status(&self) -> ConnectionStatus {
        self.status()
    }
}
