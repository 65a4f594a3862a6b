//! HTTP transport (component C's collaborator): a small trait so the
//! scheduler can run against a real `ureq` client or an in-memory fake in
//! tests, mirroring the "isolate behind an interface, fake it for tests"
//! design note.
//!
//! `get` hands back the response body as a `Read` rather than a buffered
//! `Vec<u8>` - callers that need a real on-disk `.partial` for resumable
//! downloads (`scheduler::fetch_one`) stream straight from the socket into
//! the file as bytes arrive (spec.md §3 invariant 3 / §5), instead of
//! holding the whole artifact in memory and only writing it out on success.

use std::{
    collections::HashMap,
    io::{Cursor, Read},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{format_err, Error};
use base64::encode as base64_encode;

use crate::config::Config;

/// Result of a single GET attempt. The body is a stream, not a buffer - read
/// it once, in order, via `body` or [`FetchOutcome::into_body`].
pub struct FetchOutcome {
    pub status: u16,
    /// `true` if the server honored a Range request (HTTP 206).
    pub partial: bool,
    pub last_modified: Option<String>,
    pub body: Box<dyn Read + Send>,
}

impl FetchOutcome {
    /// Read the whole response body into memory. Used by callers (Release
    /// acquisition) that need the complete object at once rather than
    /// streaming it straight to disk.
    pub fn into_body(mut self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        self.body.read_to_end(&mut data)?;
        Ok(data)
    }
}

fn empty_outcome(status: u16, last_modified: Option<String>) -> FetchOutcome {
    FetchOutcome {
        status,
        partial: false,
        last_modified,
        body: Box::new(std::io::empty()),
    }
}

/// What the caller already has on disk, used for resume and
/// If-Modified-Since.
#[derive(Debug, Clone, Default)]
pub struct FetchCondition {
    pub resume_from: Option<u64>,
    pub if_modified_since: Option<String>,
}

pub trait Transport: Send + Sync {
    /// Fetch `url`. Implementations apply `condition` as Range/
    /// If-Modified-Since headers; a 304 response is surfaced via
    /// `status == 304` with an empty body rather than an error, and a 416
    /// (Range Not Satisfiable) is surfaced via `status == 416` rather than
    /// an `Err`, so callers can discard a stale partial and restart from
    /// zero (spec.md §4.C point 1 / §7) instead of treating it as just
    /// another failed attempt.
    fn get(&self, url: &str, condition: &FetchCondition) -> Result<FetchOutcome, Error>;
}

/// `ureq`-backed transport used outside of tests.
pub struct UreqTransport {
    agent: ureq::Agent,
    proxy_auth_header: Option<String>,
    max_response_bytes: u64,
}

impl UreqTransport {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let mut builder = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(config.connect_timeout_secs))
            .timeout_read(Duration::from_secs(config.idle_timeout_secs));

        if config.use_proxy {
            if let Some(proxy_url) = config.https_proxy.as_ref().or(config.http_proxy.as_ref()) {
                let proxy = ureq::Proxy::new(proxy_url)
                    .map_err(|err| format_err!("invalid proxy URL '{proxy_url}': {err}"))?;
                builder = builder.proxy(proxy);
            }
        }

        let proxy_auth_header = match (&config.proxy_user, &config.proxy_password) {
            (Some(user), Some(password)) => Some(format!(
                "Basic {}",
                base64_encode(format!("{user}:{password}"))
            )),
            _ => None,
        };

        Ok(UreqTransport {
            agent: builder.build(),
            proxy_auth_header,
            max_response_bytes: 1024 * 1024 * 1024,
        })
    }
}

impl Transport for UreqTransport {
    fn get(&self, url: &str, condition: &FetchCondition) -> Result<FetchOutcome, Error> {
        let mut request = self
            .agent
            .get(url)
            .set("User-Agent", concat!("apt-mirror/", env!("CARGO_PKG_VERSION")));

        if let Some(offset) = condition.resume_from {
            request = request.set("Range", &format!("bytes={offset}-"));
        }
        if let Some(since) = &condition.if_modified_since {
            request = request.set("If-Modified-Since", since);
        }
        if let Some(auth) = &self.proxy_auth_header {
            request = request.set("Proxy-Authorization", auth);
        }

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(304, response)) => response,
            // A Range request past the resource's end: the caller's stale
            // partial no longer lines up with what the server has. Surface
            // it like the fake transport does so `fetch_one` can discard
            // the partial and restart from zero, rather than letting it
            // fall through to the generic HTTP-error `Err` below.
            Err(ureq::Error::Status(416, response)) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(format_err!("GET {url} failed with HTTP {code}"));
            }
            Err(err) => return Err(format_err!("GET {url} failed: {err}")),
        };

        let status = response.status();
        let last_modified = response.header("Last-Modified").map(str::to_string);
        let partial = status == 206;

        if status == 304 || status == 416 {
            return Ok(empty_outcome(status, last_modified));
        }

        let reader = response.into_reader().take(self.max_response_bytes);

        Ok(FetchOutcome {
            status,
            partial,
            last_modified,
            body: Box::new(reader),
        })
    }
}

/// In-memory fake transport used by tests: maps a URL to a canned
/// response, and records which URLs were requested along with any
/// resume offsets that were applied.
#[derive(Default)]
pub struct FakeTransport {
    responses: HashMap<String, Vec<u8>>,
    calls: Arc<Mutex<Vec<(String, Option<u64>)>>>,
    last_modified: HashMap<String, String>,
    /// URLs that answer any conditional GET (any `if_modified_since`) with
    /// 304, regardless of the exact value sent - standing in for "the
    /// caller's locally-promoted copy is still current" without needing the
    /// test to predict the real mtime-derived header string.
    not_modified: std::collections::HashSet<String>,
    /// Fixed status codes (e.g. 401/403) returned unconditionally for a URL,
    /// taking priority over `responses`.
    statuses: HashMap<String, u16>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.responses.insert(url.into(), body.into());
        self
    }

    pub fn with_last_modified(mut self, url: impl Into<String>, value: impl Into<String>) -> Self {
        self.last_modified.insert(url.into(), value.into());
        self
    }

    pub fn with_not_modified(mut self, url: impl Into<String>) -> Self {
        self.not_modified.insert(url.into());
        self
    }

    pub fn with_status(mut self, url: impl Into<String>, status: u16) -> Self {
        self.statuses.insert(url.into(), status);
        self
    }

    pub fn calls(&self) -> Vec<(String, Option<u64>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Transport for FakeTransport {
    fn get(&self, url: &str, condition: &FetchCondition) -> Result<FetchOutcome, Error> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), condition.resume_from));

        if let Some(status) = self.statuses.get(url) {
            return Ok(empty_outcome(*status, None));
        }

        if condition.if_modified_since.is_some() && self.not_modified.contains(url) {
            return Ok(empty_outcome(304, self.last_modified.get(url).cloned()));
        }

        if let (Some(since), Some(known)) =
            (&condition.if_modified_since, self.last_modified.get(url))
        {
            if since == known {
                return Ok(empty_outcome(304, Some(known.clone())));
            }
        }

        let Some(data) = self.responses.get(url) else {
            return Ok(empty_outcome(404, None));
        };

        let (status, body) = match condition.resume_from {
            Some(offset) if (offset as usize) < data.len() => {
                (206, data[offset as usize..].to_vec())
            }
            Some(offset) if (offset as usize) == data.len() => (416, Vec::new()),
            _ => (200, data.clone()),
        };

        Ok(FetchOutcome {
            status,
            partial: status == 206,
            last_modified: self.last_modified.get(url).cloned(),
            body: Box::new(Cursor::new(body)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_transport_serves_full_and_ranged_responses() {
        let transport = FakeTransport::new().with_response("http://x/Release", b"hello world".to_vec());

        let full = transport.get("http://x/Release", &FetchCondition::default()).unwrap();
        assert_eq!(full.status, 200);
        assert_eq!(full.into_body().unwrap(), b"hello world");

        let condition = FetchCondition {
            resume_from: Some(6),
            ..Default::default()
        };
        let partial = transport.get("http://x/Release", &condition).unwrap();
        assert_eq!(partial.status, 206);
        assert!(partial.partial);
        assert_eq!(partial.into_body().unwrap(), b"world");
    }

    #[test]
    fn fake_transport_returns_416_past_the_end_for_a_resume_request() {
        let transport = FakeTransport::new().with_response("http://x/p.deb", b"full contents".to_vec());

        let condition = FetchCondition {
            resume_from: Some("full contents".len() as u64),
            ..Default::default()
        };
        let outcome = transport.get("http://x/p.deb", &condition).unwrap();
        assert_eq!(outcome.status, 416);
        assert!(outcome.into_body().unwrap().is_empty());
    }

    #[test]
    fn fake_transport_returns_304_when_not_modified() {
        let transport = FakeTransport::new()
            .with_response("http://x/Release", b"data".to_vec())
            .with_last_modified("http://x/Release", "Tue, 01 Jan 2030 00:00:00 GMT");

        let condition = FetchCondition {
            if_modified_since: Some("Tue, 01 Jan 2030 00:00:00 GMT".to_string()),
            ..Default::default()
        };
        let response = transport.get("http://x/Release", &condition).unwrap();
        assert_eq!(response.status, 304);
        assert!(response.into_body().unwrap().is_empty());
    }

    #[test]
    fn fake_transport_missing_url_returns_404_status() {
        let transport = FakeTransport::new();
        let outcome = transport.get("http://x/missing", &FetchCondition::default()).unwrap();
        assert_eq!(outcome.status, 404);
    }
}
