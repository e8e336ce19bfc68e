use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Orchestrator startup configuration (spec.md §4.7 step 1, §6
/// "Environment inputs"). Every field has a CLI flag and an environment
/// variable; CLI supersedes env, which supersedes the default.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub kubeconfig_path: PathBuf,
    pub data_dir: PathBuf,
    pub probe_interval: Duration,
    pub log_format: LogFormat,
    pub config_path: PathBuf,
    pub journal_path: PathBuf,
    pub sse_keepalive_interval: Duration,
}

impl AppConfig {
    pub fn load() -> Result<Self, Error> {
        Self::from_args(std::env::args().skip(1))
    }

    pub fn from_args(args: impl Iterator<Item = String>) -> Result<Self, Error> {
        let flags = parse_cli_flags(args);

        let listen_addr_raw = pick(&flags, "listen-addr", "LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let listen_addr: SocketAddr = listen_addr_raw
            .parse()
            .map_err(|_| Error::InvalidListenAddr(listen_addr_raw.clone()))?;

        let kubeconfig_path = PathBuf::from(
            pick(&flags, "kubeconfig", "KUBECONFIG")
                .unwrap_or_else(default_kubeconfig_path),
        );

        let data_dir = PathBuf::from(
            pick(&flags, "data-dir", "DATA_DIR").unwrap_or_else(|| "./data".to_string()),
        );

        let probe_interval_raw =
            pick(&flags, "probe-interval", "PROBE_INTERVAL").unwrap_or_else(|| "30s".to_string());
        let probe_interval = parse_duration(&probe_interval_raw)?;
        if probe_interval < Duration::from_secs(1) {
            return Err(Error::ProbeIntervalTooShort(probe_interval_raw));
        }

        let log_format = match pick(&flags, "log-format", "LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let config_path = PathBuf::from(
            pick(&flags, "config-path", "CONFIG_PATH").unwrap_or_else(|| "./config.yaml".to_string()),
        );

        let journal_path = match pick(&flags, "journal-path", "JOURNAL_PATH") {
            Some(p) => PathBuf::from(p),
            None => data_dir.join("history.jsonl"),
        };

        let sse_keepalive_raw = pick(&flags, "sse-keepalive-interval", "SSE_KEEPALIVE_INTERVAL")
            .unwrap_or_else(|| "15s".to_string());
        let sse_keepalive_interval = parse_duration(&sse_keepalive_raw)?;

        Ok(AppConfig {
            listen_addr,
            kubeconfig_path,
            data_dir,
            probe_interval,
            log_format,
            config_path,
            journal_path,
            sse_keepalive_interval,
        })
    }
}

fn default_kubeconfig_path() -> String {
    if let Ok(explicit) = std::env::var("KUBECONFIG") {
        return explicit;
    }
    match std::env::var("HOME") {
        Ok(home) => format!("{home}/.kube/config"),
        Err(_) => "/root/.kube/config".to_string(),
    }
}

fn pick(flags: &HashMap<String, String>, flag: &str, env: &str) -> Option<String> {
    flags.get(flag).cloned().or_else(|| std::env::var(env).ok())
}

/// Parses `--flag value` and `--flag=value` pairs, ignoring anything
/// else (positional args, unknown flags are simply not consulted by
/// `pick`).
fn parse_cli_flags(args: impl Iterator<Item = String>) -> HashMap<String, String> {
    let args: Vec<String> = args.collect();
    let mut flags = HashMap::new();
    let mut i = 0;
    while i < args.len() {
        let Some(flag) = args[i].strip_prefix("--") else {
            i += 1;
            continue;
        };
        if let Some((k, v)) = flag.split_once('=') {
            flags.insert(k.to_string(), v.to_string());
            i += 1;
        } else if i + 1 < args.len() {
            flags.insert(flag.to_string(), args[i + 1].clone());
            i += 2;
        } else {
            i += 1;
        }
    }
    flags
}

/// Parses durations of the form `"30s"`, `"500ms"`, `"5m"`, `"1h"`.
pub fn parse_duration(raw: &str) -> Result<Duration, Error> {
    let trimmed = raw.trim();
    let unit_start = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| Error::InvalidDuration {
            raw: raw.to_string(),
            reason: "missing unit (expected one of ms, s, m, h)".to_string(),
        })?;
    let (number, unit) = trimmed.split_at(unit_start);
    let value: f64 = number.parse().map_err(|_| Error::InvalidDuration {
        raw: raw.to_string(),
        reason: format!("'{number}' is not a number"),
    })?;
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        other => {
            return Err(Error::InvalidDuration {
                raw: raw.to_string(),
                reason: format!("unknown unit '{other}'"),
            })
        }
    };
    if millis < 0.0 {
        return Err(Error::InvalidDuration {
            raw: raw.to_string(),
            reason: "duration must not be negative".to_string(),
        });
    }
    Ok(Duration::from_millis(millis.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_and_milliseconds_and_minutes() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_missing_or_unknown_unit() {
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("30x").is_err());
    }

    #[test]
    fn one_second_probe_interval_is_accepted_999ms_is_rejected() {
        let args = |flag_value: &str| {
            vec![
                "--probe-interval".to_string(),
                flag_value.to_string(),
            ]
            .into_iter()
        };
        assert!(AppConfig::from_args(args("1s")).is_ok());
        assert!(matches!(
            AppConfig::from_args(args("999ms")),
            Err(Error::ProbeIntervalTooShort(_))
        ));
    }

    #[test]
    fn cli_flag_overrides_default() {
        let cfg = AppConfig::from_args(
            vec!["--listen-addr".to_string(), "127.0.0.1:9090".to_string()].into_iter(),
        )
        .unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9090".parse().unwrap());
    }

    #[test]
    fn equals_form_cli_flag_is_parsed() {
        let cfg =
            AppConfig::from_args(vec!["--config-path=/etc/healthdash.yaml".to_string()].into_iter())
                .unwrap();
        assert_eq!(cfg.config_path, PathBuf::from("/etc/healthdash.yaml"));
    }
}
