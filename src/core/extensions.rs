use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use http::HeaderMap;
use http::header::STRICT_TRANSPORT_SECURITY;

use crate::util::lock_unpoisoned;

/// URL rewriting for hosts that asked to be reached over https only.
pub trait HstsPolicy: Send + Sync {
    /// Returns the URL to dispatch to, upgraded when the host is known.
    fn secure_url(&self, url: &str) -> String;

    /// Learns from a response received for `url`.
    fn observe_response(&self, url: &str, headers: &HeaderMap);
}

#[derive(Debug, Default)]
pub struct NoHsts;

impl HstsPolicy for NoHsts {
    fn secure_url(&self, url: &str) -> String {
        url.to_owned()
    }

    fn observe_response(&self, _url: &str, _headers: &HeaderMap) {}
}

#[derive(Clone, Copy, Debug)]
struct HstsEntry {
    expires_at: Instant,
    include_subdomains: bool,
}

/// Process-local HSTS cache fed by `Strict-Transport-Security` headers seen
/// on https responses.
#[derive(Debug, Default)]
pub struct MemoryHsts {
    hosts: Mutex<HashMap<String, HstsEntry>>,
}

impl MemoryHsts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `host` for `max_age` without having seen a header.
    pub fn preload(&self, host: &str, max_age: Duration, include_subdomains: bool) {
        lock_unpoisoned(&self.hosts).insert(
            host.to_ascii_lowercase(),
            HstsEntry {
                expires_at: Instant::now() + max_age,
                include_subdomains,
            },
        );
    }

    pub fn is_known(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let now = Instant::now();
        let mut hosts = lock_unpoisoned(&self.hosts);
        hosts.retain(|_, entry| entry.expires_at > now);
        if hosts.contains_key(&host) {
            return true;
        }
        let mut parent = host.as_str();
        while let Some((_, rest)) = parent.split_once('.') {
            if hosts
                .get(rest)
                .is_some_and(|entry| entry.include_subdomains)
            {
                return true;
            }
            parent = rest;
        }
        false
    }
}

impl HstsPolicy for MemoryHsts {
    fn secure_url(&self, url: &str) -> String {
        let Ok(mut parsed) = url::Url::parse(url) else {
            return url.to_owned();
        };
        if parsed.scheme() != "http" {
            return url.to_owned();
        }
        let Some(host) = parsed.host_str().map(str::to_owned) else {
            return url.to_owned();
        };
        if !self.is_known(&host) {
            return url.to_owned();
        }
        // An explicit port 80 has no https meaning; let it fall back to 443.
        if parsed.port() == Some(80) && parsed.set_port(None).is_err() {
            return url.to_owned();
        }
        if parsed.set_scheme("https").is_err() {
            return url.to_owned();
        }
        parsed.to_string()
    }

    fn observe_response(&self, url: &str, headers: &HeaderMap) {
        let Ok(parsed) = url::Url::parse(url) else {
            return;
        };
        // Headers received over plain http must be ignored.
        if parsed.scheme() != "https" {
            return;
        }
        let Some(host) = parsed.host_str() else {
            return;
        };
        let Some(directives) = headers
            .get(STRICT_TRANSPORT_SECURITY)
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };

        let mut max_age = None;
        let mut include_subdomains = false;
        for directive in directives.split(';').map(str::trim) {
            if directive.eq_ignore_ascii_case("includesubdomains") {
                include_subdomains = true;
            } else if let Some((name, value)) = directive.split_once('=')
                && name.trim().eq_ignore_ascii_case("max-age")
            {
                max_age = value.trim().trim_matches('"').parse::<u64>().ok();
            }
        }

        let Some(max_age) = max_age else {
            return;
        };
        let host = host.to_ascii_lowercase();
        let mut hosts = lock_unpoisoned(&self.hosts);
        if max_age == 0 {
            hosts.remove(&host);
            return;
        }
        hosts.insert(
            host,
            HstsEntry {
                expires_at: Instant::now() + Duration::from_secs(max_age),
                include_subdomains,
            },
        );
    }
}
