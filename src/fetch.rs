//! HTTP fetch client: bounded concurrency, politeness throttle, retries.
//!
//! One [`FetchClient`] is built per source and owns that source's cookie
//! jar, semaphore and rate-limiter state exclusively — nothing is shared
//! across sources. The client never raises fetch failures to the caller:
//! every request produces a [`FetchOutcome`] and callers branch on its
//! success flag.
//!
//! # Retry strategy
//!
//! Failures (timeout, connection error, non-2xx other than 404) are
//! retried up to `retries` times with exponential backoff
//! (`retry_seconds * 2^attempt`) plus a small random jitter. On every
//! retry after the first, the domain's session cookies are refreshed by
//! re-fetching the base URL — anti-bot setups rotate cookies, and a stale
//! jar turns every request into a challenge page. A 404 is terminal and
//! reported as a clean not-found; discovery uses it as a stopping signal.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Instant, sleep};
use tracing::{debug, instrument, trace, warn};
use url::Url;

use crate::config::{AuthConfig, SourceDescriptor};
use crate::error::ScrapeError;
use crate::models::{FetchErrorKind, FetchOutcome};

/// Hard per-request timeout. Exceeding it is a retryable failure, never a
/// crawl-wide abort.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (compatible; news_trawler/",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Capability to fetch and probe URLs.
///
/// Discovery and the per-source pipeline are generic over this trait, so a
/// source selects exactly one implementation at construction ([`FetchClient`]
/// or [`crate::browser::BrowserClient`]) and tests substitute counting or
/// scripted fakes.
pub trait Fetcher: Send + Sync {
    /// Fetch one URL. Never fails; inspect the outcome.
    fn fetch(&self, url: &str) -> impl std::future::Future<Output = FetchOutcome> + Send;

    /// Fetch many URLs with bounded concurrency. Outcome order does not
    /// match input order; correlate by URL. Every input URL yields exactly
    /// one outcome.
    fn fetch_many(
        &self,
        urls: Vec<String>,
    ) -> impl std::future::Future<Output = Vec<FetchOutcome>> + Send;

    /// Lightweight accessibility check (HEAD, falling back to GET where the
    /// server rejects HEAD). Used by discovery to test candidate pages.
    fn probe(
        &self,
        urls: &[String],
    ) -> impl std::future::Future<Output = HashMap<String, bool>> + Send;
}

/// Enforces a minimum spacing between request dispatches.
///
/// A simple global politeness throttle per client instance, not per URL:
/// the next dispatch waits until `min_delay` has passed since the previous
/// one was released.
#[derive(Debug)]
pub(crate) struct Throttle {
    last_dispatch: Mutex<Option<Instant>>,
    min_delay: Duration,
}

impl Throttle {
    pub(crate) fn new(min_delay: Duration) -> Self {
        Self {
            last_dispatch: Mutex::new(None),
            min_delay,
        }
    }

    /// Wait until the spacing requirement is met, then claim the dispatch
    /// slot. Held under the lock so concurrent callers serialize their
    /// dispatch times instead of stampeding when the delay elapses.
    pub(crate) async fn wait(&self) {
        if self.min_delay.is_zero() {
            return;
        }
        let mut last = self.last_dispatch.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_delay;
            let now = Instant::now();
            if ready_at > now {
                sleep(ready_at - now).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Exponential backoff for the given (zero-based) attempt, capped.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Maximum jitter applied on top of a backoff delay, as a fraction of it.
const JITTER_FRACTION: f64 = 0.125;

/// Backoff delay plus a proportional jitter, capped. `jitter` must lie in
/// `0.0..=JITTER_FRACTION`. Proportional (not fixed-range) jitter keeps
/// the wait sequence nondecreasing even for sub-second backoff bases:
/// `delay * (1 + 1/8)` never exceeds the next doubling, and past the cap
/// every wait clamps to the same value.
pub(crate) fn retry_delay(base: Duration, attempt: u32, jitter: f64) -> Duration {
    backoff_delay(base, attempt)
        .mul_f64(1.0 + jitter)
        .min(MAX_BACKOFF)
}

/// The per-source HTTP client.
pub struct FetchClient {
    client: reqwest::Client,
    base_url: Url,
    semaphore: Semaphore,
    throttle: Throttle,
    retries: u32,
    backoff_base: Duration,
    auth: Option<AuthConfig>,
}

impl FetchClient {
    /// Build a client from a validated descriptor. The cookie store is
    /// enabled so session cookies survive across requests and refreshes.
    pub fn new(descriptor: &SourceDescriptor) -> Result<Self, ScrapeError> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &descriptor.headers {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| ScrapeError::config(&descriptor.name, format!("bad header `{key}`: {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| ScrapeError::config(&descriptor.name, format!("bad header value for `{key}`: {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .default_headers(headers)
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: descriptor.base_url.clone(),
            semaphore: Semaphore::new(descriptor.concurrency),
            throttle: Throttle::new(Duration::from_secs_f64(descriptor.rate_limit)),
            retries: descriptor.retries,
            backoff_base: Duration::from_secs_f64(descriptor.retry_seconds),
            auth: descriptor.auth.clone(),
        })
    }

    /// Build a request with the source's credentials applied. Every
    /// outgoing request (GET, HEAD probe, cookie refresh) goes through
    /// here so an authenticated source never sends a bare request.
    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(auth) = &self.auth {
            req = req.basic_auth(&auth.username, Some(&auth.password));
        }
        req
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, url)
    }

    /// Re-fetch the base URL so the cookie store picks up fresh session
    /// cookies. Failures are logged and ignored; the retry proceeds either
    /// way.
    async fn refresh_cookies(&self) {
        match self.get(self.base_url.as_str()).send().await {
            Ok(resp) => debug!(status = resp.status().as_u16(), "refreshed session cookies"),
            Err(e) => debug!(error = %e, "cookie refresh failed"),
        }
    }

    /// One attempt: dispatch (after throttling) and classify the response.
    /// `Ok` is a terminal outcome (success or clean 404); `Err` carries a
    /// retryable classification.
    async fn attempt(&self, url: &str) -> Result<FetchOutcome, (FetchErrorKind, String, Option<u16>)> {
        self.throttle.wait().await;
        match self.get(url).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status == StatusCode::NOT_FOUND {
                    return Ok(FetchOutcome::failure(
                        url,
                        Some(404),
                        FetchErrorKind::NotFound,
                        "not found",
                    ));
                }
                if status.is_success() {
                    match resp.text().await {
                        Ok(body) => Ok(FetchOutcome::success(url, status.as_u16(), body)),
                        Err(e) => Err((FetchErrorKind::Other, format!("body read failed: {e}"), Some(status.as_u16()))),
                    }
                } else {
                    Err((
                        FetchErrorKind::Status,
                        format!("HTTP {}", status.as_u16()),
                        Some(status.as_u16()),
                    ))
                }
            }
            Err(e) => {
                let kind = if e.is_timeout() {
                    FetchErrorKind::Timeout
                } else if e.is_connect() {
                    FetchErrorKind::Connection
                } else {
                    FetchErrorKind::Other
                };
                Err((kind, e.to_string(), None))
            }
        }
    }

    async fn probe_one(&self, url: &str) -> bool {
        // Acquire on a non-Arc semaphore cannot fail while the client lives.
        let Ok(_permit) = self.semaphore.acquire().await else {
            return false;
        };
        self.throttle.wait().await;
        let head = self.request(reqwest::Method::HEAD, url).send().await;
        match head {
            Ok(resp)
                if resp.status() == StatusCode::METHOD_NOT_ALLOWED
                    || resp.status() == StatusCode::NOT_IMPLEMENTED =>
            {
                // Server rejects HEAD; fall back to GET, discarding the body.
                self.throttle.wait().await;
                match self.get(url).send().await {
                    Ok(resp) => resp.status().is_success(),
                    Err(e) => {
                        trace!(%url, error = %e, "probe GET fallback failed");
                        false
                    }
                }
            }
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                trace!(%url, error = %e, "probe failed");
                false
            }
        }
    }
}

impl Fetcher for FetchClient {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, url: &str) -> FetchOutcome {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return FetchOutcome::failure(url, None, FetchErrorKind::Other, "client shut down");
        };

        let mut attempt = 0u32;
        loop {
            match self.attempt(url).await {
                Ok(outcome) => return outcome,
                Err((kind, message, status)) => {
                    if attempt >= self.retries {
                        warn!(%url, attempts = attempt + 1, %message, "fetch exhausted retries");
                        return FetchOutcome::failure(url, status, kind, message);
                    }
                    // Refresh cookies before every retry after the first;
                    // expired anti-bot cookies are the usual culprit by then.
                    if attempt >= 1 {
                        self.refresh_cookies().await;
                    }
                    let jitter = rand::rng().random_range(0.0..=JITTER_FRACTION);
                    let delay = retry_delay(self.backoff_base, attempt, jitter);
                    debug!(%url, attempt = attempt + 1, ?delay, %message, "fetch attempt failed; backing off");
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    #[instrument(level = "debug", skip_all, fields(count = urls.len()))]
    async fn fetch_many(&self, urls: Vec<String>) -> Vec<FetchOutcome> {
        // The semaphore already bounds in-flight requests; the stream just
        // keeps enough futures alive to saturate it.
        let width = self.semaphore.available_permits().max(1);
        stream::iter(urls)
            .map(|url| async move { self.fetch(&url).await })
            .buffer_unordered(width)
            .collect()
            .await
    }

    #[instrument(level = "debug", skip_all, fields(count = urls.len()))]
    async fn probe(&self, urls: &[String]) -> HashMap<String, bool> {
        let width = self.semaphore.available_permits().max(1);
        stream::iter(urls.iter().cloned())
            .map(|url| async move {
                let ok = self.probe_one(&url).await;
                (url, ok)
            })
            .buffer_unordered(width)
            .collect()
            .await
    }
}

impl std::fmt::Debug for FetchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchClient")
            .field("base_url", &self.base_url.as_str())
            .field("retries", &self.retries)
            .field("backoff_base", &self.backoff_base)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_is_capped() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 30), MAX_BACKOFF);
        // Shift overflow saturates rather than panicking.
        assert_eq!(backoff_delay(base, 40), MAX_BACKOFF);
    }

    #[test]
    fn test_backoff_monotone_nondecreasing() {
        let base = Duration::from_millis(500);
        let mut prev = Duration::ZERO;
        for attempt in 0..12 {
            let d = backoff_delay(base, attempt);
            assert!(d >= prev, "attempt {attempt} shrank the delay");
            prev = d;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_enforces_spacing() {
        let throttle = Throttle::new(Duration::from_millis(100));

        throttle.wait().await;
        let first = Instant::now();
        throttle.wait().await;
        let second = Instant::now();

        assert!(second - first >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_throttle_is_free() {
        let throttle = Throttle::new(Duration::ZERO);
        let before = Instant::now();
        throttle.wait().await;
        throttle.wait().await;
        assert_eq!(Instant::now(), before);
    }

    /// Request accounting for the loopback test server.
    #[derive(Default)]
    struct ServerStats {
        counts: std::sync::Mutex<HashMap<String, usize>>,
        inflight: AtomicUsize,
        max_inflight: AtomicUsize,
    }

    impl ServerStats {
        fn hits(&self, path: &str) -> usize {
            self.counts.lock().unwrap().get(path).copied().unwrap_or(0)
        }
    }

    /// One parsed incoming request, as much of it as the tests care about.
    struct ParsedRequest {
        path: String,
        /// Whether the request carried basic-auth credentials.
        authorized: bool,
    }

    /// Minimal HTTP/1.1 server on a loopback port. The handler maps
    /// (request, per-path hit number) to (status, body); every connection
    /// is closed after one response.
    async fn spawn_server<H>(handler: H) -> (std::net::SocketAddr, Arc<ServerStats>)
    where
        H: Fn(&ParsedRequest, usize) -> (u16, String) + Send + Sync + 'static,
    {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(ServerStats::default());
        let handler = Arc::new(handler);

        let loop_stats = Arc::clone(&stats);
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let stats = Arc::clone(&loop_stats);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let now = stats.inflight.fetch_add(1, Ordering::SeqCst) + 1;
                    stats.max_inflight.fetch_max(now, Ordering::SeqCst);

                    let mut buf = vec![0u8; 8192];
                    let mut read = 0;
                    while read < buf.len() {
                        match sock.read(&mut buf[read..]).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => read += n,
                        }
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let head = String::from_utf8_lossy(&buf[..read]).into_owned();
                    let request = ParsedRequest {
                        path: head.split_whitespace().nth(1).unwrap_or("/").to_string(),
                        authorized: head.to_lowercase().contains("authorization: basic"),
                    };
                    let hits = {
                        let mut counts = stats.counts.lock().unwrap();
                        let c = counts.entry(request.path.clone()).or_insert(0);
                        *c += 1;
                        *c
                    };
                    // Hold the connection briefly so overlap is measurable.
                    tokio::time::sleep(Duration::from_millis(20)).await;

                    let (status, body) = handler(&request, hits);
                    let resp = format!(
                        "HTTP/1.1 {status} Test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    stats.inflight.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        (addr, stats)
    }

    fn descriptor_for(
        addr: std::net::SocketAddr,
        concurrency: usize,
        retries: u32,
        extra: &str,
    ) -> SourceDescriptor {
        let yaml = format!(
            r#"
name: loopback
country: cl
base_url: http://{addr}
listing:
  type: category
  urls: ["http://{addr}/economia"]
selectors:
  thumbnail:
    container: div.card
    title: h2::text
    url: a::attr(href)
  article:
    body: p::text
concurrency: {concurrency}
rate_limit: 0
retries: {retries}
retry_seconds: 0.001
{extra}"#
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loopback.yaml");
        std::fs::write(&path, yaml).unwrap();
        crate::config::load_source_file(&path).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_retries_until_success_and_refreshes_cookies() {
        let (addr, stats) = spawn_server(|req, hits| match req.path.as_str() {
            "/flaky" if hits < 3 => (500, String::new()),
            "/flaky" => (200, "ok".to_string()),
            _ => (200, String::new()),
        })
        .await;

        let client = FetchClient::new(&descriptor_for(addr, 2, 2, "")).unwrap();
        let outcome = client.fetch(&format!("http://{addr}/flaky")).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.body.as_deref(), Some("ok"));
        assert_eq!(stats.hits("/flaky"), 3);
        // Cookie refresh re-fetches the base URL before the second retry.
        assert_eq!(stats.hits("/"), 1);
    }

    #[tokio::test]
    async fn test_fetch_exhausts_retries_into_failed_outcome() {
        let (addr, stats) = spawn_server(|_, _| (500, String::new())).await;

        let client = FetchClient::new(&descriptor_for(addr, 2, 1, "")).unwrap();
        let outcome = client.fetch(&format!("http://{addr}/broken")).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.status, Some(500));
        assert!(matches!(outcome.error, Some((FetchErrorKind::Status, _))));
        // retries: 1 means two attempts total.
        assert_eq!(stats.hits("/broken"), 2);
    }

    #[tokio::test]
    async fn test_fetch_404_is_terminal() {
        let (addr, stats) = spawn_server(|_, _| (404, String::new())).await;

        let client = FetchClient::new(&descriptor_for(addr, 2, 3, "")).unwrap();
        let outcome = client.fetch(&format!("http://{addr}/gone")).await;

        assert!(outcome.is_not_found());
        assert_eq!(stats.hits("/gone"), 1);
    }

    #[tokio::test]
    async fn test_fetch_many_bounded_by_concurrency() {
        let (addr, stats) = spawn_server(|_, _| (200, "page".to_string())).await;

        let client = FetchClient::new(&descriptor_for(addr, 2, 0, "")).unwrap();
        let urls: Vec<String> = (0..6).map(|i| format!("http://{addr}/p/{i}")).collect();
        let outcomes = client.fetch_many(urls).await;

        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.is_success()));
        assert!(
            stats.max_inflight.load(Ordering::SeqCst) <= 2,
            "more than `concurrency` requests were in flight"
        );
    }

    #[tokio::test]
    async fn test_probe_sends_credentials_like_fetch() {
        // Server demands basic auth on every request, HEAD included.
        let (addr, _stats) = spawn_server(|req, _| {
            if req.authorized {
                (200, "ok".to_string())
            } else {
                (401, String::new())
            }
        })
        .await;

        let desc = descriptor_for(addr, 2, 0, "auth:\n  username: bot\n  password: hunter2\n");
        let client = FetchClient::new(&desc).unwrap();
        let url = format!("http://{addr}/protegido");

        let outcome = client.fetch(&url).await;
        assert!(outcome.is_success());

        // The probe must see the same page as accessible.
        let probes = client.probe(std::slice::from_ref(&url)).await;
        assert_eq!(probes.get(&url), Some(&true));
    }

    #[test]
    fn test_retry_delay_nondecreasing_for_subsecond_base() {
        // Worst case against monotonicity: maximal jitter on one wait,
        // none on the next, with a base well under a second.
        let base = Duration::from_millis(200);
        for attempt in 0..12 {
            let jittered = retry_delay(base, attempt, JITTER_FRACTION);
            let next_bare = retry_delay(base, attempt + 1, 0.0);
            assert!(
                jittered <= next_bare,
                "attempt {attempt}: {jittered:?} > {next_bare:?}"
            );
        }
    }

    #[test]
    fn test_retry_delay_capped_regardless_of_jitter() {
        let base = Duration::from_secs(2);
        assert_eq!(retry_delay(base, 30, JITTER_FRACTION), MAX_BACKOFF);
        assert_eq!(retry_delay(base, 31, 0.0), MAX_BACKOFF);
    }
}
