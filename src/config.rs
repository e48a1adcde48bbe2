//! Server configuration, read once from `VISITD_*` environment variables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::calendar::{CalendarError, SlotCalendar};
use crate::model::{ParseSlotError, Slot};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Password for staff accounts (every user except the public one).
    pub password: String,
    /// Connecting as this user means "no actor": public booking only.
    pub public_user: String,
    pub public_password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub complete_confirmed: bool,
    pub slots: Vec<Slot>,
    pub utc_offset_minutes: i32,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    Slot(ParseSlotError),
    Calendar(CalendarError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: '{value}'"),
            ConfigError::Slot(e) => write!(f, "VISITD_SLOTS: {e}"),
            ConfigError::Calendar(e) => write!(f, "calendar: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<CalendarError> for ConfigError {
    fn from(e: CalendarError) -> Self {
        ConfigError::Calendar(e)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "visitd".into(),
            public_user: "public".into(),
            public_password: "public".into(),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(3600),
            complete_confirmed: true,
            slots: SlotCalendar::default().grid().to_vec(),
            utc_offset_minutes: 0,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        if let Some(v) = lookup("VISITD_BIND") {
            cfg.bind = v;
        }
        if let Some(v) = lookup("VISITD_PORT") {
            cfg.port = parse("VISITD_PORT", &v)?;
        }
        if let Some(v) = lookup("VISITD_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("VISITD_PASSWORD") {
            cfg.password = v;
        }
        if let Some(v) = lookup("VISITD_PUBLIC_USER") {
            cfg.public_user = v;
        }
        if let Some(v) = lookup("VISITD_PUBLIC_PASSWORD") {
            cfg.public_password = v;
        }
        if let Some(v) = lookup("VISITD_MAX_CONNECTIONS") {
            cfg.max_connections = parse("VISITD_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("VISITD_COMPACT_THRESHOLD") {
            cfg.compact_threshold = parse("VISITD_COMPACT_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("VISITD_SWEEP_INTERVAL_SECS") {
            let secs: u64 = parse("VISITD_SWEEP_INTERVAL_SECS", &v)?;
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var: "VISITD_SWEEP_INTERVAL_SECS",
                    value: v,
                });
            }
            cfg.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(v) = lookup("VISITD_COMPLETE_CONFIRMED") {
            cfg.complete_confirmed = parse_bool("VISITD_COMPLETE_CONFIRMED", &v)?;
        }
        if let Some(v) = lookup("VISITD_SLOTS") {
            cfg.slots = parse_slots(&v)?;
        }
        if let Some(v) = lookup("VISITD_UTC_OFFSET_MINUTES") {
            cfg.utc_offset_minutes = parse("VISITD_UTC_OFFSET_MINUTES", &v)?;
        }
        if let Some(v) = lookup("VISITD_METRICS_PORT") {
            cfg.metrics_port = Some(parse("VISITD_METRICS_PORT", &v)?);
        }
        cfg.tls_cert = lookup("VISITD_TLS_CERT");
        cfg.tls_key = lookup("VISITD_TLS_KEY");

        // Surface grid/offset mistakes at startup rather than on first use.
        cfg.calendar()?;
        Ok(cfg)
    }

    pub fn calendar(&self) -> Result<SlotCalendar, CalendarError> {
        SlotCalendar::new(self.slots.clone(), self.utc_offset_minutes)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("visitd.wal")
    }
}

fn parse<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}

/// Comma-separated `HH:MM` list, e.g. `09:00,10:30,14:00`.
fn parse_slots(value: &str) -> Result<Vec<Slot>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Slot>().map_err(ConfigError::Slot))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.public_user, "public");
        assert_eq!(cfg.sweep_interval, Duration::from_secs(3600));
        assert!(cfg.complete_confirmed);
        assert_eq!(cfg.slots.len(), 8);
        assert_eq!(cfg.addr(), "0.0.0.0:5433");
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/visitd.wal"));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = Config::from_lookup(lookup(&[
            ("VISITD_PORT", "6000"),
            ("VISITD_SWEEP_INTERVAL_SECS", "60"),
            ("VISITD_COMPLETE_CONFIRMED", "off"),
            ("VISITD_SLOTS", "08:30, 13:00"),
            ("VISITD_UTC_OFFSET_MINUTES", "-300"),
            ("VISITD_METRICS_PORT", "9090"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert!(!cfg.complete_confirmed);
        assert_eq!(cfg.slots, vec![Slot::new(8, 30).unwrap(), Slot::new(13, 0).unwrap()]);
        assert_eq!(cfg.utc_offset_minutes, -300);
        assert_eq!(cfg.metrics_port, Some(9090));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("VISITD_PORT", "http")])),
            Err(ConfigError::Invalid { var: "VISITD_PORT", .. })
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("VISITD_SLOTS", "9am")])),
            Err(ConfigError::Slot(_))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("VISITD_SLOTS", "09:00,09:00")])),
            Err(ConfigError::Calendar(CalendarError::DuplicateSlot(_)))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("VISITD_SWEEP_INTERVAL_SECS", "0")])),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn default_grid_spelled_out_matches_default() {
        let spelled = "09:00,10:00,11:00,12:00,14:00,15:00,16:00,17:00";
        assert_eq!(parse_slots(spelled).unwrap(), Config::default().slots);
    }
}
