//! Per-modem configuration, generalized from the teacher crate's
//! consuming-builder `Config<RST, DTR>` (`with_rst`, `with_dtr`,
//! `baud_rate`, `with_flow_control`, `low_power_mode`) into a host-side
//! equivalent: device paths instead of embedded-hal pins, an AT init
//! sequence instead of a fixed reset/power GPIO dance, and the backend
//! selector spec.md §4.4 treats as "a single switch at modem-construction
//! time".

use std::time::Duration;

use crate::at::InitStep;

/// Which control-plane backend drives this modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    At,
    Qmi,
}

/// Per-vendor quirks recorded by the plugin layer (out of scope here) and
/// carried into the modem's config, per spec.md §4.6 "Reset".
#[derive(Debug, Clone)]
pub struct Quirks {
    /// `false` for modems where `ATZ` triggers a full reboot instead of a
    /// soft reset.
    pub reset_via_atz: bool,
}

impl Default for Quirks {
    fn default() -> Self {
        Self { reset_via_atz: true }
    }
}

/// Configuration for one physical modem, built with the teacher's
/// consuming-builder pattern (`with_*` methods returning `Self`).
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    pub primary_port: String,
    pub secondary_port: Option<String>,
    pub data_port: Option<String>,
    pub append_lf: bool,
    pub init_sequence: Vec<InitStep>,
    pub default_apn: Option<String>,
    pub signal_refresh_rate: Duration,
    pub quirks: Quirks,
}

impl Config {
    pub fn new(backend: BackendKind, primary_port: impl Into<String>) -> Self {
        Self {
            backend,
            primary_port: primary_port.into(),
            secondary_port: None,
            data_port: None,
            append_lf: true,
            init_sequence: Vec::new(),
            default_apn: None,
            signal_refresh_rate: Duration::from_secs(0),
            quirks: Quirks::default(),
        }
    }

    pub fn with_secondary_port(mut self, path: impl Into<String>) -> Self {
        self.secondary_port = Some(path.into());
        self
    }

    pub fn with_data_port(mut self, path: impl Into<String>) -> Self {
        self.data_port = Some(path.into());
        self
    }

    pub fn with_append_lf(mut self, append_lf: bool) -> Self {
        self.append_lf = append_lf;
        self
    }

    pub fn with_init_sequence(mut self, steps: Vec<InitStep>) -> Self {
        self.init_sequence = steps;
        self
    }

    pub fn with_default_apn(mut self, apn: impl Into<String>) -> Self {
        self.default_apn = Some(apn.into());
        self
    }

    pub fn with_signal_refresh_rate(mut self, rate: Duration) -> Self {
        self.signal_refresh_rate = rate;
        self
    }

    pub fn with_quirks(mut self, quirks: Quirks) -> Self {
        self.quirks = quirks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chains() {
        let cfg = Config::new(BackendKind::At, "/dev/ttyUSB2")
            .with_secondary_port("/dev/ttyUSB3")
            .with_default_apn("internet")
            .with_signal_refresh_rate(Duration::from_secs(10));
        assert_eq!(cfg.primary_port, "/dev/ttyUSB2");
        assert_eq!(cfg.default_apn.as_deref(), Some("internet"));
        assert_eq!(cfg.signal_refresh_rate, Duration::from_secs(10));
    }
}
