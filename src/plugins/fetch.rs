//! HTTP fetch pool backing `ctx.fetch`.
//!
//! Requests run on the host tokio runtime, capped by a semaphore; over-cap
//! requests wait for a permit rather than failing. The VM never blocks: the
//! op registers a pending promise and the pool resolves it with a `Settle`
//! task once the response (or error) is in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;

use super::scheduler::{Scheduler, Task};

/// Maximum in-flight fetch requests per plugin.
pub const MAX_CONCURRENT_FETCH_REQUESTS: usize = 10;

/// Default request timeout.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(35);

/// Request shape accepted from scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: FetchMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Overrides the default timeout, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Send a browser-like header profile for Cloudflare-fronted hosts.
    #[serde(default)]
    pub bypass_cloudflare: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FetchMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl FetchMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            FetchMethod::Get => reqwest::Method::GET,
            FetchMethod::Post => reqwest::Method::POST,
            FetchMethod::Put => reqwest::Method::PUT,
            FetchMethod::Delete => reqwest::Method::DELETE,
            FetchMethod::Patch => reqwest::Method::PATCH,
            FetchMethod::Head => reqwest::Method::HEAD,
            FetchMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// Response delivered back to the script.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Tracks tokio tasks spawned on behalf of one plugin (fetches, downloads,
/// commands) so unload can abort them all.
#[derive(Default)]
pub struct IoTaskSet {
    handles: Mutex<Vec<AbortHandle>>,
}

impl IoTaskSet {
    pub fn track(&self, handle: AbortHandle) {
        let mut handles = self.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub fn abort_all(&self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

/// Per-plugin fetch pool.
#[derive(Clone)]
pub struct FetchPool {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

impl FetchPool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_FETCH_REQUESTS)),
        }
    }

    /// Register the pending promise and run the request on the IO runtime.
    pub fn spawn(
        &self,
        io: &tokio::runtime::Handle,
        scheduler: Scheduler,
        tasks: &IoTaskSet,
        pending_id: String,
        request: FetchRequest,
    ) {
        let client = self.client.clone();
        let semaphore = self.semaphore.clone();

        let handle = io.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let (ok, value) = match execute(&client, request).await {
                Ok(response) => match serde_json::to_value(&response) {
                    Ok(value) => (true, value),
                    Err(e) => (false, json!(e.to_string())),
                },
                Err(message) => (false, json!(message)),
            };

            scheduler.schedule(Task::Settle {
                pending_id,
                ok,
                value,
            });
        });
        tasks.track(handle.abort_handle());
    }

    /// Permits currently available, for tests and diagnostics.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for FetchPool {
    fn default() -> Self {
        Self::new()
    }
}

async fn execute(client: &reqwest::Client, request: FetchRequest) -> Result<FetchResponse, String> {
    let url = url::Url::parse(&request.url)
        .map_err(|e| format!("invalid URL '{}': {e}", request.url))?;

    let timeout = request
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(FETCH_TIMEOUT);

    let mut builder = client
        .request(request.method.as_reqwest(), url)
        .timeout(timeout);

    if request.bypass_cloudflare {
        builder = builder
            .header(
                "User-Agent",
                "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0",
            )
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header("Accept-Language", "en-US,en;q=0.5");
    }

    for (key, value) in &request.headers {
        builder = builder.header(key.as_str(), value.as_str());
    }

    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = builder.send().await.map_err(|e| format!("request failed: {e}"))?;

    let status = response.status().as_u16();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let body = response
        .text()
        .await
        .map_err(|e| format!("failed to read response body: {e}"))?;

    Ok(FetchResponse {
        status,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: FetchRequest =
            serde_json::from_value(json!({"url": "https://example.com"})).unwrap();
        assert_eq!(request.method, FetchMethod::Get);
        assert!(request.headers.is_empty());
        assert!(!request.bypass_cloudflare);
        assert_eq!(request.timeout_secs, None);
    }

    #[test]
    fn test_method_parsing_is_uppercase() {
        let request: FetchRequest =
            serde_json::from_value(json!({"url": "https://example.com", "method": "POST"}))
                .unwrap();
        assert_eq!(request.method, FetchMethod::Post);
        assert_eq!(request.method.as_reqwest(), reqwest::Method::POST);
    }

    #[test]
    fn test_pool_caps_permits() {
        let pool = FetchPool::new();
        assert_eq!(pool.available(), MAX_CONCURRENT_FETCH_REQUESTS);

        let permits: Vec<_> = (0..MAX_CONCURRENT_FETCH_REQUESTS)
            .map(|_| pool.semaphore.clone().try_acquire_owned().unwrap())
            .collect();

        // Over-cap acquisition waits (try_acquire fails).
        assert!(pool.semaphore.clone().try_acquire_owned().is_err());
        drop(permits);
        assert_eq!(pool.available(), MAX_CONCURRENT_FETCH_REQUESTS);
    }
}
