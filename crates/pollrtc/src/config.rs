use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::SignalingError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_CHANNEL_LABEL: &str = "chat";
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";

/// How a participant learns whether it is the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoleStrategy {
    /// Ask the store; the first asker becomes caller.
    #[default]
    Arbitrated,
    /// Look for an existing offer; none means "become caller". Two peers
    /// probing at the same moment can both end up as caller.
    OfferProbe,
}

impl FromStr for RoleStrategy {
    type Err = SignalingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "arbitrated" | "check" => Ok(RoleStrategy::Arbitrated),
            "probe" | "offer-probe" | "offer_probe" => Ok(RoleStrategy::OfferProbe),
            other => Err(SignalingError::Config(format!(
                "unknown role strategy {other:?}"
            ))),
        }
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Rendezvous store base address.
    pub base_url: String,
    /// Interval shared by the offer, answer and candidate polls.
    pub poll_interval: Duration,
    pub role_strategy: RoleStrategy,
    /// Label of the data channel the caller opens.
    pub data_channel_label: String,
    /// Drop remote candidates whose candidate line was already accepted.
    pub dedupe_candidates: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            role_strategy: RoleStrategy::default(),
            data_channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            dedupe_candidates: false,
        }
    }
}

impl SignalingConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `POLLRTC_*` environment variables. Values that
    /// fail to parse keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(base_url) = non_empty_var("POLLRTC_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(raw) = non_empty_var("POLLRTC_POLL_INTERVAL_MS") {
            match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => config.poll_interval = Duration::from_millis(ms),
                _ => tracing::warn!(
                    target = "pollrtc::config",
                    value = %raw,
                    "ignoring invalid POLLRTC_POLL_INTERVAL_MS"
                ),
            }
        }
        if let Some(raw) = non_empty_var("POLLRTC_ROLE_STRATEGY") {
            match raw.parse() {
                Ok(strategy) => config.role_strategy = strategy,
                Err(err) => tracing::warn!(target = "pollrtc::config", error = %err, "ignoring role strategy"),
            }
        }
        if let Some(label) = non_empty_var("POLLRTC_CHANNEL_LABEL") {
            config.data_channel_label = label;
        }
        if let Some(raw) = non_empty_var("POLLRTC_DEDUPE_CANDIDATES") {
            config.dedupe_candidates = raw != "0" && !raw.eq_ignore_ascii_case("false");
        }
        config
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_role_strategy(mut self, strategy: RoleStrategy) -> Self {
        self.role_strategy = strategy;
        self
    }

    pub fn with_data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.data_channel_label = label.into();
        self
    }

    pub fn with_dedupe_candidates(mut self, dedupe: bool) -> Self {
        self.dedupe_candidates = dedupe;
        self
    }

    pub fn validate(&self) -> Result<(), SignalingError> {
        if self.poll_interval.is_zero() {
            return Err(SignalingError::Config("poll interval must be non-zero".into()));
        }
        if self.data_channel_label.is_empty() {
            return Err(SignalingError::Config("data channel label is empty".into()));
        }
        Ok(())
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 5] = [
        "POLLRTC_BASE_URL",
        "POLLRTC_POLL_INTERVAL_MS",
        "POLLRTC_ROLE_STRATEGY",
        "POLLRTC_CHANNEL_LABEL",
        "POLLRTC_DEDUPE_CANDIDATES",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = SignalingConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.role_strategy, RoleStrategy::Arbitrated);
        assert_eq!(config.data_channel_label, "chat");
        assert!(!config.dedupe_candidates);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("POLLRTC_BASE_URL", "http://rendezvous.example:9000");
        env::set_var("POLLRTC_POLL_INTERVAL_MS", "250");
        env::set_var("POLLRTC_ROLE_STRATEGY", "probe");
        env::set_var("POLLRTC_DEDUPE_CANDIDATES", "1");

        let config = SignalingConfig::from_env();
        clear_env();

        assert_eq!(config.base_url, "http://rendezvous.example:9000");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.role_strategy, RoleStrategy::OfferProbe);
        assert!(config.dedupe_candidates);
    }

    #[test]
    fn test_config_from_env_invalid_values_fall_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("POLLRTC_POLL_INTERVAL_MS", "soon");
        env::set_var("POLLRTC_ROLE_STRATEGY", "coin-flip");

        let config = SignalingConfig::from_env();
        clear_env();

        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.role_strategy, RoleStrategy::Arbitrated);
    }

    #[test]
    fn zero_interval_is_invalid() {
        let config = SignalingConfig::default().with_poll_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(SignalingError::Config(_))));
    }
}
