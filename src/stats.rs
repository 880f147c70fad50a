// src/stats.rs
use chrono::Local;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

/// RFC-1918 ranges, loopback, and IPv6 link-local collapse to `local` so
/// LAN traffic does not inflate visitor counts.
pub fn normalize_ip(ip: &str) -> String {
    if ip.is_empty() {
        return String::new();
    }
    if ip == "::1" || ip.starts_with("fe80:") {
        return "local".to_string();
    }
    if is_private_ipv4(ip) {
        return "local".to_string();
    }
    ip.to_string()
}

fn is_private_ipv4(ip: &str) -> bool {
    if ip.starts_with("10.") || ip.starts_with("127.") || ip.starts_with("192.168.") {
        return true;
    }
    if let Some(rest) = ip.strip_prefix("172.") {
        if let Some(second) = rest.split('.').next() {
            if let Ok(n) = second.parse::<u8>() {
                return (16..=31).contains(&n);
            }
        }
    }
    false
}

/// First comma-separated entry of a forwarded-IP header value.
pub fn extract_forwarded_ip(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.split(',').next() {
        Some(first) => first.trim().to_string(),
        None => String::new(),
    }
}

struct IpTable {
    counts: HashMap<String, u32>,
    seen: HashSet<String>,
    live_conns: usize,
}

impl IpTable {
    fn add(&mut self, ip: &str) {
        *self.counts.entry(ip.to_string()).or_insert(0) += 1;
        self.seen.insert(ip.to_string());
    }

    fn remove_ip(&mut self, ip: &str) {
        if let Some(count) = self.counts.get_mut(ip) {
            if *count <= 1 {
                self.counts.remove(ip);
            } else {
                *count -= 1;
            }
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub uptime_seconds: i64,
    pub online_users: usize,
    pub online_connections: usize,
    pub total_unique_visitors: usize,
    pub total_requests: u64,
    pub avg_qps: f64,
    pub server_time: String,
}

/// Process-wide counters: per-IP connection counts, the set of every IP
/// ever seen, the live connection count, and the request total.
pub struct Stats {
    ip: Mutex<IpTable>,
    total_requests: AtomicU64,
    started: SystemTime,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            ip: Mutex::new(IpTable {
                counts: HashMap::new(),
                seen: HashSet::new(),
                live_conns: 0,
            }),
            total_requests: AtomicU64::new(0),
            started: SystemTime::now(),
        }
    }

    /// Record a newly accepted connection from a normalized IP.
    pub fn on_connect(&self, ip: &str) {
        let mut table = self.ip.lock().unwrap();
        table.live_conns += 1;
        if !ip.is_empty() {
            table.add(ip);
        }
    }

    /// A forwarded-IP header revealed the real peer: move the count.
    pub fn reassign(&self, old_ip: &str, new_ip: &str) {
        if new_ip.is_empty() || new_ip == old_ip {
            return;
        }
        let mut table = self.ip.lock().unwrap();
        if !old_ip.is_empty() {
            table.remove_ip(old_ip);
        }
        table.add(new_ip);
    }

    pub fn on_close(&self, ip: &str) {
        let mut table = self.ip.lock().unwrap();
        table.live_conns = table.live_conns.saturating_sub(1);
        if !ip.is_empty() {
            table.remove_ip(ip);
        }
    }

    pub fn live_connections(&self) -> usize {
        self.ip.lock().unwrap().live_conns
    }

    pub fn distinct_live_ips(&self) -> usize {
        self.ip.lock().unwrap().counts.len()
    }

    pub fn inc_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let total = self.total_requests();
        let uptime = self
            .started
            .elapsed()
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let qps = if uptime > 0 {
            total as f64 / uptime as f64
        } else {
            total as f64
        };
        let table = self.ip.lock().unwrap();
        StatusSnapshot {
            uptime_seconds: uptime,
            online_users: table.counts.len(),
            online_connections: table.live_conns,
            total_unique_visitors: table.seen.len(),
            total_requests: total,
            avg_qps: (qps * 100.0).round() / 100.0,
            server_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_collapse_to_local() {
        for ip in [
            "10.1.2.3",
            "127.0.0.1",
            "192.168.0.5",
            "172.16.0.1",
            "172.31.255.255",
            "::1",
            "fe80::1",
        ] {
            assert_eq!(normalize_ip(ip), "local", "{}", ip);
        }
        assert_eq!(normalize_ip("172.32.0.1"), "172.32.0.1");
        assert_eq!(normalize_ip("8.8.8.8"), "8.8.8.8");
        assert_eq!(normalize_ip(""), "");
    }

    #[test]
    fn forwarded_header_first_entry_wins() {
        assert_eq!(extract_forwarded_ip(" 1.2.3.4, 5.6.7.8 "), "1.2.3.4");
        assert_eq!(extract_forwarded_ip("9.9.9.9"), "9.9.9.9");
        assert_eq!(extract_forwarded_ip(""), "");
    }

    #[test]
    fn ip_counts_track_connections() {
        let stats = Stats::new();
        stats.on_connect("8.8.8.8");
        stats.on_connect("8.8.8.8");
        assert_eq!(stats.live_connections(), 2);
        assert_eq!(stats.distinct_live_ips(), 1);

        stats.on_close("8.8.8.8");
        assert_eq!(stats.live_connections(), 1);
        assert_eq!(stats.distinct_live_ips(), 1);

        stats.on_close("8.8.8.8");
        assert_eq!(stats.live_connections(), 0);
        assert_eq!(stats.distinct_live_ips(), 0);

        // Seen set is historical: both connections were one distinct IP.
        assert_eq!(stats.snapshot().total_unique_visitors, 1);
    }

    #[test]
    fn reassign_moves_count() {
        let stats = Stats::new();
        stats.on_connect("local");
        stats.reassign("local", "8.8.4.4");
        assert_eq!(stats.distinct_live_ips(), 1);
        stats.on_close("8.8.4.4");
        assert_eq!(stats.distinct_live_ips(), 0);
        assert_eq!(stats.live_connections(), 0);
    }

    #[test]
    fn snapshot_counts_requests() {
        let stats = Stats::new();
        stats.inc_requests();
        stats.inc_requests();
        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 2);
        assert!(!snap.server_time.is_empty());
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"total_requests\":2"));
    }
}
