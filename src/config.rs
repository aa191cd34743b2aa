use std::path::PathBuf;
use std::time::Duration;
use clap::Parser;

use crate::chart::ChartSettings;
use crate::constants::SERIES_CAPACITY;
use crate::net::json_client::ClientSettings;

/// Ground station telemetry client configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Telemetry source to connect to (host:port)
    #[arg(long, value_name = "HOST:PORT", default_value = "127.0.0.1:1887")]
    pub connect: String,

    /// Render ticks per second (chart pruning, clock advance, attitude smoothing)
    #[arg(long, default_value_t = 20.0, value_parser = render_rate)]
    pub render_rate: f64,

    /// Width of the visible chart window in seconds
    #[arg(long, default_value_t = 30.0, value_parser = positive_f64)]
    pub window_seconds: f64,

    /// Largest gap between samples still drawn as a connected line (seconds)
    #[arg(long, default_value_t = 2.0, value_parser = positive_f64)]
    pub max_gap_seconds: f64,

    /// Extra history kept behind the window so late packets can still merge in (seconds)
    #[arg(long, default_value_t = 2.0, value_parser = positive_f64)]
    pub gap_grace_seconds: f64,

    /// Attitude smoothing time constant in seconds
    #[arg(long, default_value_t = 0.13, value_parser = positive_f64)]
    pub smoothing_tau: f64,

    /// First reconnect delay in milliseconds
    #[arg(long, default_value_t = 200, value_parser = clap::value_parser!(u64).range(1..=MAX_RECONNECT_MS))]
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[arg(long, default_value_t = 5000, value_parser = clap::value_parser!(u64).range(1..=MAX_RECONNECT_MS))]
    pub reconnect_max_ms: u64,

    /// JSON range-rule table replacing the built-in one
    #[arg(long, value_name = "FILE")]
    pub rules: Option<PathBuf>,

    /// Append every plotted sample to a CSV file (time,channel,value)
    #[arg(long, value_name = "FILE")]
    pub write_csv: Option<String>,

    /// Do not print each normalized record to stdout
    #[arg(long, default_value_t = false)]
    pub quiet_records: bool,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

/// Render rate bounds (Hz). The tick interval must stay a nonzero,
/// representable duration.
const MIN_RENDER_RATE: f64 = 0.1;
const MAX_RENDER_RATE: f64 = 1000.0;

/// One hour.
const MAX_RECONNECT_MS: u64 = 3_600_000;

fn positive_f64(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|e| format!("{}", e))?;
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(format!("{} must be a positive number", s))
    }
}

fn render_rate(s: &str) -> Result<f64, String> {
    let rate = positive_f64(s)?;
    if (MIN_RENDER_RATE..=MAX_RENDER_RATE).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("render rate must be between {} and {} Hz", MIN_RENDER_RATE, MAX_RENDER_RATE))
    }
}

impl Config {
    pub fn chart_settings(&self) -> ChartSettings {
        ChartSettings {
            window_seconds: self.window_seconds,
            max_gap_seconds: self.max_gap_seconds,
            gap_grace_seconds: self.gap_grace_seconds,
            capacity: SERIES_CAPACITY,
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        let mut settings = ClientSettings::new(&self.connect);
        settings.render_interval = Duration::from_secs_f64(1.0 / self.render_rate);
        settings.reconnect_initial = Duration::from_millis(self.reconnect_initial_ms);
        settings.reconnect_max = Duration::from_millis(self.reconnect_max_ms);
        settings
    }

    /// Render ticks per console status line (about once a second).
    pub fn status_every(&self) -> u32 {
        self.render_rate.round().max(1.0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["gcs-telemetry"]);
        assert_eq!(config.connect, "127.0.0.1:1887");
        assert_eq!(config.render_rate, 20.0);
        assert_eq!(config.client_settings().render_interval, Duration::from_millis(50));
        assert_eq!(config.client_settings().reconnect_max, Duration::from_millis(5000));
        assert_eq!(config.chart_settings(), ChartSettings::default());
        assert_eq!(config.status_every(), 20);
        assert!(config.rules.is_none());
    }

    #[test]
    fn test_rejects_non_positive_rates() {
        assert!(Config::try_parse_from(["gcs-telemetry", "--render-rate", "0"]).is_err());
        assert!(Config::try_parse_from(["gcs-telemetry", "--smoothing-tau", "-1"]).is_err());
    }

    #[test]
    fn test_rejects_values_that_break_the_loop() {
        for args in [
            ["--reconnect-initial-ms", "0"],
            ["--reconnect-max-ms", "0"],
            ["--render-rate", "1e12"],
            ["--render-rate", "1e-300"],
        ] {
            let parsed = Config::try_parse_from(["gcs-telemetry", args[0], args[1]]);
            assert!(parsed.is_err(), "{:?} accepted", args);
        }

        let config = Config::try_parse_from(["gcs-telemetry", "--render-rate", "1000"]).unwrap();
        assert_eq!(config.client_settings().render_interval, Duration::from_millis(1));
        let config = Config::try_parse_from(["gcs-telemetry", "--render-rate", "0.1"]).unwrap();
        assert_eq!(config.client_settings().render_interval, Duration::from_secs(10));
        assert_eq!(config.status_every(), 1);
    }

    #[test]
    fn test_overrides() {
        let config = Config::try_parse_from([
            "gcs-telemetry", "--connect", "10.0.0.2:9000", "--window-seconds", "60", "-v", "--quiet-records",
        ])
        .unwrap();
        assert_eq!(config.connect, "10.0.0.2:9000");
        assert_eq!(config.chart_settings().window_seconds, 60.0);
        assert!(config.verbose);
        assert!(config.quiet_records);
    }
}
