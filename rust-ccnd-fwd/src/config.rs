//! Daemon configuration from the environment.
//!
//! The recognized variables, their defaults, and their clamps follow the
//! reference daemon; anything unparsable falls back to the default.

use log::info;
use rust_ccnd_common::FlatName;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;

/// Largest message the daemon will frame.
pub const MAX_MESSAGE_BYTES: usize = 8800;

/// Default unicast port.
pub const DEFAULT_PORT: u16 = 9695;

/// Default local-domain socket path.
pub const DEFAULT_SOCKNAME: &str = "/tmp/.ccnd.sock";

#[derive(Debug, Clone)]
pub struct Config {
    /// Log-category bitmask.
    pub debug: u32,
    /// Soft content-store capacity.
    pub capacity: usize,
    /// MTU used to decide whether to coalesce stuffed Interests; 0 off.
    pub mtu: usize,
    /// Base multicast send delay.
    pub data_pause_microsec: u32,
    /// Content freshness when the object names none, seconds.
    pub tts_default: u32,
    /// Upper bound on content freshness, seconds.
    pub tts_limit: u32,
    /// Clamp on predicted response time, microseconds.
    pub predicted_response_limit: u32,
    /// Prefixes auto-registered on every new non-local face.
    pub autoreg: Vec<FlatName>,
    /// Addresses to bind beyond the wildcards.
    pub listen_on: Vec<IpAddr>,
    pub port: u16,
    pub sockname: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: 1,
            capacity: (!0u32 / 2) as usize,
            mtu: 0,
            data_pause_microsec: 10_000,
            tts_default: 126_230_400,
            tts_limit: 126_230_400, // 4 years, assuming 1 leap year
            predicted_response_limit: 160_000,
            autoreg: Vec::new(),
            listen_on: Vec::new(),
            port: DEFAULT_PORT,
            sockname: PathBuf::from(DEFAULT_SOCKNAME),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Some(s) = nonempty("CCND_DEBUG") {
            cfg.debug = s.parse().unwrap_or(1);
        }
        if let Some(s) = nonempty("CCND_CAP") {
            if let Ok(v) = s.parse() {
                cfg.capacity = v;
            }
        }
        info!("CCND_DEBUG={} CCND_CAP={}", cfg.debug, cfg.capacity);

        if let Some(s) = nonempty("CCND_MTU") {
            cfg.mtu = s.parse::<usize>().unwrap_or(0).min(MAX_MESSAGE_BYTES);
        }
        if let Some(s) = nonempty("CCND_DATA_PAUSE_MICROSEC") {
            if let Ok(v) = s.parse::<u32>() {
                cfg.data_pause_microsec = v.clamp(1, 1_000_000);
            }
        }
        if let Some(s) = nonempty("CCND_MAX_TIME_TO_STALE") {
            if let Ok(v) = s.parse::<i64>() {
                let v = v.max(1) as u32;
                if v < cfg.tts_limit {
                    cfg.tts_limit = v;
                }
                info!("CCND_MAX_TIME_TO_STALE={}", cfg.tts_limit);
            }
        }
        if let Some(s) = nonempty("CCND_MAX_RTE_MICROSEC") {
            if let Ok(v) = s.parse::<u32>() {
                cfg.predicted_response_limit = v.clamp(2_000, 60_000_000);
                info!("CCND_MAX_RTE_MICROSEC={}", cfg.predicted_response_limit);
            }
        }
        cfg.tts_default = cfg.tts_limit;
        if let Some(s) = nonempty("CCND_DEFAULT_TIME_TO_STALE") {
            if let Ok(v) = s.parse::<i64>() {
                if v > 0 && (v as u32) <= cfg.tts_limit {
                    cfg.tts_default = v as u32;
                }
                info!("CCND_DEFAULT_TIME_TO_STALE={}", cfg.tts_default);
            }
        }
        if let Some(s) = nonempty("CCND_AUTOREG") {
            cfg.autoreg = parse_uri_list(&s);
            info!("CCND_AUTOREG={}", s);
        }
        if let Some(s) = nonempty("CCND_LISTEN_ON") {
            cfg.listen_on = parse_addr_list(&s);
            info!("CCND_LISTEN_ON={}", s);
        }
        if let Some(s) = nonempty("CCN_LOCAL_PORT") {
            if let Ok(p) = s.parse() {
                cfg.port = p;
            }
        }
        if let Some(s) = nonempty("CCN_LOCAL_SOCKNAME") {
            cfg.sockname = PathBuf::from(s);
        }
        cfg
    }
}

fn nonempty(var: &str) -> Option<String> {
    match env::var(var) {
        Ok(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

/// URIs separated by whitespace, commas, or semicolons.
fn parse_uri_list(s: &str) -> Vec<FlatName> {
    s.split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|p| !p.is_empty())
        .filter_map(|p| FlatName::from_uri(p).ok())
        .collect()
}

/// Addresses separated like the URI list; IPv6 literals in brackets.
fn parse_addr_list(s: &str) -> Vec<IpAddr> {
    s.split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|p| !p.is_empty())
        .filter_map(|p| {
            let trimmed = p.trim_start_matches('[').trim_end_matches(']');
            trimmed.parse().ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_list_separators() {
        let l = parse_uri_list("ccnx:/a, /b;/c  /d");
        assert_eq!(l.len(), 4);
        assert_eq!(l[0].to_uri(), "/a");
        assert_eq!(l[3].to_uri(), "/d");
    }

    #[test]
    fn addr_list_brackets() {
        let l = parse_addr_list("192.0.2.1 [2001:db8::1]");
        assert_eq!(l.len(), 2);
        assert!(l[1].is_ipv6());
    }
}
