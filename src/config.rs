// src/config.rs
use clap::Parser;
use std::path::PathBuf;

/// Timer granularity in seconds; idle connections expire after three slots.
pub const TIMESLOT: u32 = 5;

/// Command-line surface of the server.
#[derive(Parser, Debug, Clone)]
#[command(name = "weir")]
#[command(about = "Epoll-backed HTTP/1.1 serving engine")]
#[command(version)]
pub struct Config {
    /// Listen port
    #[arg(short = 'p', default_value_t = 9006)]
    pub port: u16,

    /// Log write mode: 0 = sync, 1 = async queue
    #[arg(short = 'l', default_value_t = 0)]
    pub log_write: u8,

    /// Trigger mode pair: 0 = LT+LT, 1 = LT+ET, 2 = ET+LT, 3 = ET+ET
    #[arg(short = 'm', default_value_t = 0)]
    pub trig_mode: u8,

    /// Lingering close on the listener: 0 = off, 1 = on
    #[arg(short = 'o', default_value_t = 0)]
    pub opt_linger: u8,

    /// Credential-store handle pool size
    #[arg(short = 's', default_value_t = 8)]
    pub store_conns: usize,

    /// Worker thread count (0 = one per core)
    #[arg(short = 't', default_value_t = 8)]
    pub workers: usize,

    /// Disable the log sink: 0 = log, 1 = silent
    #[arg(short = 'c', default_value_t = 0)]
    pub close_log: u8,

    /// Concurrency model: 0 = main thread reads, 1 = workers read
    #[arg(short = 'a', default_value_t = 0)]
    pub actor_model: u8,

    /// Document root override; defaults to <cwd>/resources/webroot
    #[arg(skip)]
    pub docroot: Option<PathBuf>,
}

impl Config {
    /// Listener trigger mode: edge-triggered for modes 2 and 3.
    pub fn listen_et(&self) -> bool {
        matches!(self.trig_mode, 2 | 3)
    }

    /// Connection trigger mode: edge-triggered for modes 1 and 3.
    pub fn conn_et(&self) -> bool {
        matches!(self.trig_mode, 1 | 3)
    }

    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn reactor(&self) -> bool {
        self.actor_model == 1
    }

    pub fn docroot(&self) -> PathBuf {
        match &self.docroot {
            Some(p) => p.clone(),
            None => std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("resources")
                .join("webroot"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9006,
            log_write: 0,
            trig_mode: 0,
            opt_linger: 0,
            store_conns: 8,
            workers: 8,
            close_log: 0,
            actor_model: 0,
            docroot: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference() {
        let cfg = Config::parse_from(["weir"]);
        assert_eq!(cfg.port, 9006);
        assert_eq!(cfg.trig_mode, 0);
        assert_eq!(cfg.store_conns, 8);
        assert_eq!(cfg.workers, 8);
        assert!(!cfg.reactor());
    }

    #[test]
    fn trigger_mode_pairs() {
        for (mode, listen, conn) in [
            (0u8, false, false),
            (1, false, true),
            (2, true, false),
            (3, true, true),
        ] {
            let cfg = Config {
                trig_mode: mode,
                ..Config::default()
            };
            assert_eq!(cfg.listen_et(), listen, "mode {}", mode);
            assert_eq!(cfg.conn_et(), conn, "mode {}", mode);
        }
    }

    #[test]
    fn short_flags_parse() {
        let cfg = Config::parse_from(["weir", "-p", "8080", "-m", "3", "-t", "4", "-a", "1"]);
        assert_eq!(cfg.port, 8080);
        assert!(cfg.listen_et() && cfg.conn_et());
        assert_eq!(cfg.worker_count(), 4);
        assert!(cfg.reactor());
    }

    #[test]
    fn zero_workers_means_per_core() {
        let cfg = Config {
            workers: 0,
            ..Config::default()
        };
        assert!(cfg.worker_count() >= 1);
    }
}
