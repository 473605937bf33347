//! Resilient HTTP client shared by every adapter.
//!
//! Wraps `reqwest` with per-host request spacing, a per-host circuit
//! breaker, bounded retries with exponential backoff and jitter, and
//! User-Agent rotation. Stateful adapters get a sticky [`Session`] that
//! keeps cookies and a fixed User-Agent while still flowing through the
//! shared limiter and breaker.

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use licita_core::error::AppError;

type HostLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Retry attempts per fetch (first try included).
const MAX_ATTEMPTS: u32 = 3;

/// Exponential backoff base and cap.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Default User-Agent pool: current mainstream browsers, rotated per
/// request so one scraper does not present a single fingerprint all day.
fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:127.0) Gecko/20100101 Firefox/127.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:127.0) Gecko/20100101 Firefox/127.0",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Client behavior knobs; defaults match the documented contract.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Minimum spacing between requests to one host.
    pub rate_limit_per_host: Duration,
    /// Consecutive transport failures before a host's circuit opens.
    pub circuit_fail_threshold: u32,
    /// How long an open circuit rejects requests outright.
    pub circuit_cooldown: Duration,
    /// Default per-request timeout; adapters may override per request.
    pub default_timeout: Duration,
    pub user_agents: Vec<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            rate_limit_per_host: Duration::from_secs(1),
            circuit_fail_threshold: 5,
            circuit_cooldown: Duration::from_secs(5 * 60),
            default_timeout: Duration::from_secs(600),
            user_agents: default_user_agents(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Breaker {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// An outbound request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    /// Form-encoded body for POSTs (VIEWSTATE postbacks, GeneXus events).
    pub form: Option<Vec<(String, String)>>,
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: Vec::new(),
            form: None,
            timeout: None,
        }
    }

    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            url: url.into(),
            method: Method::POST,
            headers: Vec::new(),
            form: Some(form),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A completed response with its body already read.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub final_url: String,
    pub bytes: Vec<u8>,
}

impl FetchResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, AppError> {
        serde_json::from_slice(&self.bytes).map_err(|e| AppError::Decoding(e.to_string()))
    }
}

struct Shared {
    plain: reqwest::Client,
    limiter: HostLimiter,
    breakers: Mutex<HashMap<String, Breaker>>,
    settings: HttpSettings,
}

/// The process-global resilient client. Cheap to clone; all clones share
/// the per-host limiter and circuit-breaker state.
#[derive(Clone)]
pub struct FetchClient {
    shared: Arc<Shared>,
}

impl FetchClient {
    pub fn new(settings: HttpSettings) -> Result<Self, AppError> {
        let plain = reqwest::Client::builder()
            .gzip(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| AppError::Generic(format!("failed to build HTTP client: {}", e)))?;

        let period = settings.rate_limit_per_host.max(Duration::from_millis(1));
        let quota = Quota::with_period(period)
            .ok_or_else(|| AppError::Generic("invalid rate-limit period".to_string()))?;

        Ok(Self {
            shared: Arc::new(Shared {
                plain,
                limiter: RateLimiter::keyed(quota),
                breakers: Mutex::new(HashMap::new()),
                settings,
            }),
        })
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.shared.settings
    }

    /// Fetches through the shared limiter/breaker with a per-request
    /// User-Agent drawn from the pool.
    pub async fn fetch(
        &self,
        request: FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, AppError> {
        let ua = self.pick_user_agent();
        self.execute(&self.shared.plain, &ua, request, cancel).await
    }

    /// Opens a sticky session: its own cookie jar and a User-Agent that
    /// stays fixed for the session's lifetime. Needed by WebForms and
    /// GeneXus portals whose paging state lives in cookies + hidden fields.
    pub fn session(&self) -> Result<Session, AppError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| AppError::Generic(format!("failed to build session client: {}", e)))?;
        Ok(Session {
            base: self.clone(),
            client,
            user_agent: self.pick_user_agent(),
        })
    }

    fn pick_user_agent(&self) -> String {
        let pool = &self.shared.settings.user_agents;
        pool.choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| "licita/0.1".to_string())
    }

    async fn execute(
        &self,
        client: &reqwest::Client,
        user_agent: &str,
        request: FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, AppError> {
        let parsed = Url::parse(&request.url)
            .map_err(|_| AppError::InvalidUrl(request.url.clone()))?;
        let host = parsed.host_str().unwrap_or("").to_string();
        if host.is_empty() {
            return Err(AppError::InvalidUrl(request.url.clone()));
        }

        self.check_breaker(&host)?;
        let timeout = request
            .timeout
            .unwrap_or(self.shared.settings.default_timeout);

        let mut last_error = AppError::Generic("no attempts made".to_string());
        for attempt in 1..=MAX_ATTEMPTS {
            tokio::select! {
                _ = self.shared.limiter.until_key_ready(&host) => {}
                _ = cancel.cancelled() => return Err(AppError::JobCancelled),
            }

            let mut builder = client
                .request(request.method.clone(), parsed.clone())
                .header(reqwest::header::USER_AGENT, user_agent)
                .timeout(timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(form) = &request.form {
                builder = builder.form(form);
            }

            let outcome = tokio::select! {
                r = builder.send() => r,
                _ = cancel.cancelled() => return Err(AppError::JobCancelled),
            };

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let final_url = response.url().to_string();
                        let body = tokio::select! {
                            b = response.bytes() => b,
                            _ = cancel.cancelled() => return Err(AppError::JobCancelled),
                        };
                        return match body {
                            Ok(bytes) => {
                                self.record_success(&host);
                                Ok(FetchResponse {
                                    status: status.as_u16(),
                                    final_url,
                                    bytes: bytes.to_vec(),
                                })
                            }
                            Err(e) => {
                                self.record_failure(&host);
                                Err(AppError::Decoding(e.to_string()))
                            }
                        };
                    }

                    if status.as_u16() == 429 {
                        last_error = AppError::RateLimited(host.clone());
                        self.record_failure(&host);
                    } else if status.is_server_error() {
                        last_error = AppError::Http {
                            status: status.as_u16(),
                            url: request.url.clone(),
                        };
                        self.record_failure(&host);
                    } else {
                        // 4xx: the host is answering fine, we asked for the
                        // wrong thing. No breaker penalty, no retry.
                        return Err(AppError::Http {
                            status: status.as_u16(),
                            url: request.url.clone(),
                        });
                    }
                }
                Err(e) => {
                    last_error = if e.is_timeout() {
                        AppError::Timeout(timeout.as_secs())
                    } else {
                        AppError::Connection(e.to_string())
                    };
                    self.record_failure(&host);
                }
            }

            if attempt < MAX_ATTEMPTS {
                let backoff = backoff_with_jitter(attempt);
                tracing::debug!(
                    host = %host,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying after {}", last_error
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(AppError::JobCancelled),
                }
                // The breaker may have opened while we were failing.
                self.check_breaker(&host)?;
            }
        }

        Err(last_error)
    }

    fn check_breaker(&self, host: &str) -> Result<(), AppError> {
        let mut breakers = self.shared.breakers.lock().expect("breaker lock");
        match breakers.get_mut(host) {
            Some(Breaker::Open { until }) => {
                if Instant::now() < *until {
                    Err(AppError::CircuitOpen(host.to_string()))
                } else {
                    // Cooldown elapsed; let one probe through.
                    breakers.insert(host.to_string(), Breaker::HalfOpen);
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    fn record_success(&self, host: &str) {
        let mut breakers = self.shared.breakers.lock().expect("breaker lock");
        breakers.insert(host.to_string(), Breaker::Closed { failures: 0 });
    }

    fn record_failure(&self, host: &str) {
        let mut breakers = self.shared.breakers.lock().expect("breaker lock");
        let threshold = self.shared.settings.circuit_fail_threshold;
        let cooldown = self.shared.settings.circuit_cooldown;
        let next = match breakers
            .get(host)
            .copied()
            .unwrap_or(Breaker::Closed { failures: 0 })
        {
            Breaker::Closed { failures } => {
                let failures = failures + 1;
                if failures >= threshold {
                    tracing::warn!(host = %host, failures, "circuit opened");
                    Breaker::Open {
                        until: Instant::now() + cooldown,
                    }
                } else {
                    Breaker::Closed { failures }
                }
            }
            // A failed half-open probe re-opens for a full cooldown.
            Breaker::HalfOpen | Breaker::Open { .. } => Breaker::Open {
                until: Instant::now() + cooldown,
            },
        };
        breakers.insert(host.to_string(), next);
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE
        .checked_mul(2u32.saturating_pow(attempt - 1))
        .unwrap_or(BACKOFF_CAP)
        .min(BACKOFF_CAP);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
    exp + jitter
}

/// Sticky cookie session bound to the shared limiter and breaker.
pub struct Session {
    base: FetchClient,
    client: reqwest::Client,
    user_agent: String,
}

impl Session {
    pub async fn fetch(
        &self,
        request: FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, AppError> {
        self.base
            .execute(&self.client, &self.user_agent, request, cancel)
            .await
    }
}
