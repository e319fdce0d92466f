//! Upstream endpoint table, per-endpoint health and the DNS cache.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The two upstream front doors. Same protocol, different origin tags.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: &'static str,
    pub origin: &'static str,
    host_template: &'static str,
    path: &'static str,
}

impl Endpoint {
    pub fn url(&self, region: &str) -> String {
        format!("{}{}", self.host(region), self.path)
    }

    pub fn host(&self, region: &str) -> String {
        self.host_template.replace("{region}", region)
    }
}

pub const ENDPOINTS: &[Endpoint] = &[
    Endpoint {
        id: "codewhisperer",
        origin: "AI_EDITOR",
        host_template: "https://codewhisperer.{region}.amazonaws.com",
        path: "/generateAssistantResponse",
    },
    Endpoint {
        id: "q",
        origin: "CHAT",
        host_template: "https://q.{region}.amazonaws.com",
        path: "/sendMessageStreaming",
    },
];

// ── Endpoint health ─────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct EndpointStats {
    consecutive_errors: u32,
    last_error: Option<Instant>,
    successes: u64,
    failures: u64,
    ewma_latency_ms: f64,
}

impl EndpointStats {
    fn sample_size(&self) -> u64 {
        self.successes + self.failures
    }

    fn success_rate(&self) -> f64 {
        if self.sample_size() == 0 {
            1.0
        } else {
            self.successes as f64 / self.sample_size() as f64
        }
    }

    /// Three consecutive errors inside the last 30 s puts the endpoint at
    /// the back of the line.
    fn recently_failing(&self) -> bool {
        self.consecutive_errors >= 3
            && self
                .last_error
                .is_some_and(|t| t.elapsed() < Duration::from_secs(30))
    }
}

#[derive(Default)]
pub struct EndpointHealth {
    stats: Mutex<HashMap<&'static str, EndpointStats>>,
}

impl EndpointHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, id: &'static str, latency: Duration) {
        let mut stats = self.stats.lock().unwrap();
        let s = stats.entry(id).or_default();
        s.successes += 1;
        s.consecutive_errors = 0;
        let ms = latency.as_millis() as f64;
        s.ewma_latency_ms = if s.ewma_latency_ms == 0.0 {
            ms
        } else {
            s.ewma_latency_ms * 0.7 + ms * 0.3
        };
    }

    pub fn record_failure(&self, id: &'static str) {
        let mut stats = self.stats.lock().unwrap();
        let s = stats.entry(id).or_default();
        s.failures += 1;
        s.consecutive_errors += 1;
        s.last_error = Some(Instant::now());
    }

    /// Order endpoints for a request: caller preference first, recently
    /// failing endpoints last, then success rate (when the difference is
    /// meaningful over a real sample), then latency.
    pub fn ordered(&self, preferred: Option<&str>) -> Vec<&'static Endpoint> {
        let stats = self.stats.lock().unwrap();
        let mut endpoints: Vec<&'static Endpoint> = ENDPOINTS.iter().collect();

        endpoints.sort_by(|a, b| {
            if let Some(pref) = preferred {
                match ((a.id == pref) as i8, (b.id == pref) as i8) {
                    (1, 0) => return std::cmp::Ordering::Less,
                    (0, 1) => return std::cmp::Ordering::Greater,
                    _ => {}
                }
            }

            let sa = stats.get(a.id).cloned().unwrap_or_default();
            let sb = stats.get(b.id).cloned().unwrap_or_default();

            match (sa.recently_failing(), sb.recently_failing()) {
                (false, true) => return std::cmp::Ordering::Less,
                (true, false) => return std::cmp::Ordering::Greater,
                _ => {}
            }

            if sa.sample_size() >= 5 && sb.sample_size() >= 5 {
                let diff = sa.success_rate() - sb.success_rate();
                if diff.abs() > 0.10 {
                    return sb
                        .success_rate()
                        .partial_cmp(&sa.success_rate())
                        .unwrap_or(std::cmp::Ordering::Equal);
                }
            }

            sa.ewma_latency_ms
                .partial_cmp(&sb.ewma_latency_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        endpoints
    }
}

// ── DNS cache ───────────────────────────────────────────────────

struct DnsEntry {
    addrs: Vec<IpAddr>,
    refreshed: Instant,
}

/// Resolution cache: fresh for 5 minutes, reusable for 30 when the
/// resolver is down.
#[derive(Default)]
pub struct DnsCache {
    entries: Mutex<HashMap<String, DnsEntry>>,
}

const DNS_FRESH: Duration = Duration::from_secs(300);
const DNS_STALE_LIMIT: Duration = Duration::from_secs(1800);

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `host` (no scheme, no port). Serves cached addresses while
    /// fresh; on resolver failure falls back to stale entries up to the
    /// 30-minute limit.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, String> {
        {
            let entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get(host) {
                if entry.refreshed.elapsed() < DNS_FRESH {
                    return Ok(entry.addrs.clone());
                }
            }
        }

        match tokio::net::lookup_host((host, 443u16)).await {
            Ok(addrs) => {
                let addrs: Vec<IpAddr> = addrs.map(|sa: SocketAddr| sa.ip()).collect();
                if addrs.is_empty() {
                    return self.stale_or(host, "resolver returned no addresses".into());
                }
                self.entries.lock().unwrap().insert(
                    host.to_string(),
                    DnsEntry {
                        addrs: addrs.clone(),
                        refreshed: Instant::now(),
                    },
                );
                Ok(addrs)
            }
            Err(e) => self.stale_or(host, format!("dns error: {}", e)),
        }
    }

    fn stale_or(&self, host: &str, err: String) -> Result<Vec<IpAddr>, String> {
        let entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(host) {
            if entry.refreshed.elapsed() < DNS_STALE_LIMIT {
                tracing::warn!(host, "serving stale DNS entry after resolver failure");
                return Ok(entry.addrs.clone());
            }
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls_are_region_templated() {
        let cw = &ENDPOINTS[0];
        assert_eq!(
            cw.url("eu-west-1"),
            "https://codewhisperer.eu-west-1.amazonaws.com/generateAssistantResponse"
        );
    }

    #[test]
    fn preference_wins_ordering() {
        let health = EndpointHealth::new();
        let ordered = health.ordered(Some("q"));
        assert_eq!(ordered[0].id, "q");
    }

    #[test]
    fn recently_failing_endpoint_goes_last() {
        let health = EndpointHealth::new();
        for _ in 0..3 {
            health.record_failure("codewhisperer");
        }
        let ordered = health.ordered(None);
        assert_eq!(ordered.last().unwrap().id, "codewhisperer");
    }

    #[test]
    fn success_rate_outranks_latency() {
        let health = EndpointHealth::new();
        // codewhisperer: fast but failing half the time.
        for _ in 0..5 {
            health.record_success("codewhisperer", Duration::from_millis(10));
            health.record_failure("codewhisperer");
        }
        // q: slower but reliable.
        for _ in 0..6 {
            health.record_success("q", Duration::from_millis(900));
        }
        let ordered = health.ordered(None);
        assert_eq!(ordered[0].id, "q");
    }

    #[test]
    fn similar_success_rates_fall_back_to_latency() {
        let health = EndpointHealth::new();
        for _ in 0..6 {
            health.record_success("codewhisperer", Duration::from_millis(50));
            health.record_success("q", Duration::from_millis(400));
        }
        let ordered = health.ordered(None);
        assert_eq!(ordered[0].id, "codewhisperer");
    }

    #[tokio::test]
    async fn dns_cache_serves_fresh_entries() {
        let cache = DnsCache::new();
        cache.entries.lock().unwrap().insert(
            "cached.example".into(),
            DnsEntry {
                addrs: vec!["10.0.0.1".parse().unwrap()],
                refreshed: Instant::now(),
            },
        );
        let addrs = cache.resolve("cached.example").await.unwrap();
        assert_eq!(addrs, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
