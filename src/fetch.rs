//! Guest-visible outbound HTTP fetch.
//!
//! Untrusted code gets a `fetch(url, options)` that always resolves to
//! `{body, status}`. The policies enforced here keep it from becoming an
//! attack surface: a process-wide concurrency cap, a hard wall-clock
//! timeout, DNS-level SSRF rejection of private address space, and a forced
//! `User-Agent`. Context headers (`x-potat-data[-N]`) identify the caller
//! to cooperating endpoints.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::context;

/// Identifying string sent with every outbound request.
pub const USER_AGENT: &str = "potat-eval/0.1 (sandboxed fetch)";

/// URL prefix that always receives context headers.
const DATA_HEADER_PREFIX: &str = "https://fun.joet.me";

/// Concurrent outbound fetches in this process.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Options accepted from the guest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub headers: Option<Value>,
    pub body: Option<Value>,
    pub with_data_headers: Option<Value>,
}

/// Shared fetch state for one worker process.
pub struct FetchEnv {
    client: reqwest::Client,
    timeout: Duration,
    max_concurrency: usize,
}

impl FetchEnv {
    /// Build the shared client with the SSRF-guarding resolver installed.
    pub fn new(fetch_timeout_ms: u64, max_concurrency: usize) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .dns_resolver(Arc::new(SsrfResolver))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self {
            client,
            timeout: Duration::from_millis(fetch_timeout_ms),
            max_concurrency,
        })
    }

    /// Perform a guest fetch.
    ///
    /// `Ok` carries the `{body, status}` object, including the shaped
    /// 408/429/400 outcomes. `Err` carries a message to be thrown inside
    /// the guest (disallowed literal address, unusable URL).
    pub async fn fetch(
        &self,
        url: &str,
        options: FetchOptions,
        msg: &Value,
    ) -> Result<Value, String> {
        let parsed: reqwest::Url = url
            .parse()
            .map_err(|e| format!("Invalid URL: {e}"))?;

        // Literal addresses never reach DNS, so check them here.
        if let Some(host) = parsed.host_str() {
            let bare = host.trim_start_matches('[').trim_end_matches(']');
            if let Ok(addr) = bare.parse::<IpAddr>()
                && is_disallowed_ip(addr)
            {
                return Err(format!("Access to {addr} is disallowed"));
            }
        }

        let Some(_permit) = FetchPermit::acquire(self.max_concurrency) else {
            return Ok(json!({"status": 429, "body": "Too many requests."}));
        };

        let method = options
            .method
            .as_deref()
            .and_then(|m| reqwest::Method::from_bytes(m.to_uppercase().as_bytes()).ok())
            .unwrap_or(reqwest::Method::GET);

        let mut request = self
            .client
            .request(method, parsed)
            .timeout(self.timeout);

        if let Some(Value::Object(headers)) = &options.headers {
            for (name, value) in headers {
                // The forced User-Agent below must be the only one sent;
                // header() appends rather than replaces.
                if name.eq_ignore_ascii_case("user-agent") {
                    continue;
                }
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.header(name.as_str(), value);
            }
        }
        // Forced regardless of caller-supplied headers.
        request = request.header(reqwest::header::USER_AGENT, USER_AGENT);

        if is_truthy(options.with_data_headers.as_ref()) || url.starts_with(DATA_HEADER_PREFIX) {
            for (depth, ctx) in context::context_chain(msg).iter().enumerate() {
                let name = if depth == 0 {
                    "x-potat-data".to_string()
                } else {
                    format!("x-potat-data-{depth}")
                };
                let encoded = urlencoding::encode(&ctx.to_string()).into_owned();
                request = request.header(name.as_str(), encoded);
            }
        }

        if let Some(body) = &options.body {
            let body = match body {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.body(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                let body = match serde_json::from_str::<Value>(&text) {
                    Ok(parsed) => parsed,
                    Err(_) => Value::String(text),
                };
                Ok(json!({"status": status, "body": body}))
            }
            Err(err) if err.is_timeout() => {
                Ok(json!({"status": 408, "body": "Request timed out."}))
            }
            Err(err) => {
                let cause = innermost_message(&err);
                Ok(json!({
                    "status": 400,
                    "body": format!("Request failed - Error: {cause}"),
                }))
            }
        }
    }
}

/// Walk a reqwest error's source chain to its most specific message.
fn innermost_message(err: &reqwest::Error) -> String {
    let mut source: &dyn std::error::Error = err;
    while let Some(next) = source.source() {
        source = next;
    }
    source.to_string()
}

/// JavaScript-ish truthiness for option values.
fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Object(_)) | Some(Value::Array(_)) => true,
        _ => false,
    }
}

/// RAII slot in the process-wide fetch budget.
///
/// Incremented before any await point, decremented on drop, so the counter
/// can never drift under cooperative scheduling.
struct FetchPermit;

impl FetchPermit {
    fn acquire(max: usize) -> Option<Self> {
        let mut current = IN_FLIGHT.load(Ordering::SeqCst);
        loop {
            if current >= max {
                return None;
            }
            match IN_FLIGHT.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(Self),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Drop for FetchPermit {
    fn drop(&mut self) {
        IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    }
}

/// DNS resolver that refuses to hand back private address space.
///
/// Every resolution for every connection attempt goes through here, so
/// rebinding tricks that alternate public/private answers still fail on the
/// lookup that matters.
#[derive(Debug, Default)]
struct SsrfResolver;

impl Resolve for SsrfResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .collect();

            if let Some(bad) = addrs.iter().find(|a| is_disallowed_ip(a.ip())) {
                let err = std::io::Error::other(format!("Access to {} is disallowed", bad.ip()));
                return Err(Box::new(err) as Box<dyn std::error::Error + Send + Sync>);
            }

            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

/// Private, loopback, link-local, and unspecified address space, with the
/// IPv6 equivalents (including IPv4-mapped forms).
pub fn is_disallowed_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_disallowed_ip(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1918_ranges_disallowed() {
        for ip in ["10.0.0.1", "172.16.5.5", "172.31.255.1", "192.168.1.1"] {
            assert!(is_disallowed_ip(ip.parse().unwrap()), "{ip}");
        }
        // Just outside 172.16/12.
        assert!(!is_disallowed_ip("172.32.0.1".parse().unwrap()));
    }

    #[test]
    fn test_loopback_and_link_local_disallowed() {
        assert!(is_disallowed_ip("127.0.0.1".parse().unwrap()));
        assert!(is_disallowed_ip("127.8.8.8".parse().unwrap()));
        assert!(is_disallowed_ip("169.254.1.1".parse().unwrap()));
        assert!(is_disallowed_ip("0.0.0.0".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_equivalents_disallowed() {
        assert!(is_disallowed_ip("::1".parse().unwrap()));
        assert!(is_disallowed_ip("::".parse().unwrap()));
        assert!(is_disallowed_ip("fe80::1".parse().unwrap()));
        assert!(is_disallowed_ip("fc00::1".parse().unwrap()));
        assert!(is_disallowed_ip("fd12:3456::1".parse().unwrap()));
        // IPv4-mapped loopback.
        assert!(is_disallowed_ip("::ffff:127.0.0.1".parse().unwrap()));
        assert!(is_disallowed_ip("::ffff:10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_public_addresses_allowed() {
        assert!(!is_disallowed_ip("1.1.1.1".parse().unwrap()));
        assert!(!is_disallowed_ip("93.184.216.34".parse().unwrap()));
        assert!(!is_disallowed_ip("2606:4700:4700::1111".parse().unwrap()));
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(Some(&json!(true))));
        assert!(is_truthy(Some(&json!(1))));
        assert!(is_truthy(Some(&json!("yes"))));
        assert!(is_truthy(Some(&json!({}))));
        assert!(!is_truthy(Some(&json!(false))));
        assert!(!is_truthy(Some(&json!(0))));
        assert!(!is_truthy(Some(&json!(""))));
        assert!(!is_truthy(Some(&json!(null))));
        assert!(!is_truthy(None));
    }

    #[test]
    fn test_permit_caps_concurrency() {
        let a = FetchPermit::acquire(2);
        let b = FetchPermit::acquire(2);
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(FetchPermit::acquire(2).is_none());
        drop(a);
        assert!(FetchPermit::acquire(2).is_some());
        drop(b);
    }

    #[tokio::test]
    async fn test_literal_private_host_rejected() {
        let env = FetchEnv::new(1000, 5).unwrap();
        let err = env
            .fetch("http://127.0.0.1/x", FetchOptions::default(), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, "Access to 127.0.0.1 is disallowed");

        let err = env
            .fetch("http://[::1]:8080/", FetchOptions::default(), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, "Access to ::1 is disallowed");
    }
}
