use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use pollrtc::{RoleStrategy, SignalingConfig, DEFAULT_CHANNEL_LABEL};

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "pollrtc-peer")]
#[command(about = "Poll-based WebRTC signaling peer and rendezvous store")]
pub struct Cli {
    /// Log verbosity (POLLRTC_LOG_FILTER overrides)
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, env = "POLLRTC_LOG_LEVEL", global = true)]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "POLLRTC_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a session and chat over the negotiated data channel
    Connect(ConnectArgs),
    /// Serve an in-memory rendezvous store over HTTP
    Rendezvous(RendezvousArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Rendezvous store base URL
    #[arg(long, env = "POLLRTC_BASE_URL", default_value = "http://127.0.0.1:8080")]
    pub base_url: String,

    /// Poll period in milliseconds
    #[arg(long, env = "POLLRTC_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Role resolution: "arbitrated" asks the store, "probe" looks for an offer
    #[arg(long, env = "POLLRTC_ROLE_STRATEGY", default_value = "arbitrated")]
    pub strategy: RoleStrategy,

    /// Label of the data channel the caller opens
    #[arg(long, env = "POLLRTC_CHANNEL_LABEL", default_value = DEFAULT_CHANNEL_LABEL)]
    pub label: String,

    /// Drop candidates the store delivers more than once
    #[arg(long, env = "POLLRTC_DEDUPE_CANDIDATES")]
    pub dedupe: bool,

    /// Treat unexpected HTTP statuses as "nothing yet"
    #[arg(long, env = "POLLRTC_LENIENT_STATUS")]
    pub lenient: bool,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "POLLRTC_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Host candidates only, no STUN servers
    #[arg(long)]
    pub no_stun: bool,
}

impl ConnectArgs {
    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig::new(self.base_url.clone())
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_role_strategy(self.strategy)
            .with_data_channel_label(self.label.clone())
            .with_dedupe_candidates(self.dedupe)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Args, Debug, Clone)]
pub struct RendezvousArgs {
    /// Address to listen on
    #[arg(long, env = "POLLRTC_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_defaults_match_library_defaults() {
        let cli = Cli::try_parse_from(["pollrtc-peer", "connect"]).expect("parse");
        let Commands::Connect(args) = cli.command else {
            panic!("expected connect");
        };
        let config = args.signaling_config();
        let defaults = SignalingConfig::default();
        assert_eq!(config.base_url, defaults.base_url);
        assert_eq!(config.poll_interval, defaults.poll_interval);
        assert_eq!(config.role_strategy, RoleStrategy::Arbitrated);
        assert_eq!(config.data_channel_label, DEFAULT_CHANNEL_LABEL);
        assert!(!config.dedupe_candidates);
        assert_eq!(args.request_timeout(), None);
    }

    #[test]
    fn connect_flags_flow_into_config() {
        let cli = Cli::try_parse_from([
            "pollrtc-peer",
            "--log-level",
            "debug",
            "connect",
            "--base-url",
            "http://store:9000/room",
            "--poll-interval-ms",
            "250",
            "--strategy",
            "probe",
            "--label",
            "ops",
            "--dedupe",
            "--request-timeout-ms",
            "1500",
        ])
        .expect("parse");
        assert_eq!(cli.log_level, LogLevel::Debug);
        let Commands::Connect(args) = cli.command else {
            panic!("expected connect");
        };
        let config = args.signaling_config();
        assert_eq!(config.base_url, "http://store:9000/room");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.role_strategy, RoleStrategy::OfferProbe);
        assert_eq!(config.data_channel_label, "ops");
        assert!(config.dedupe_candidates);
        assert_eq!(args.request_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let err = Cli::try_parse_from(["pollrtc-peer", "connect", "--strategy", "coinflip"]);
        assert!(err.is_err());
    }

    #[test]
    fn rendezvous_listen_address() {
        let cli = Cli::try_parse_from(["pollrtc-peer", "rendezvous", "--listen", "0.0.0.0:9100"])
            .expect("parse");
        let Commands::Rendezvous(args) = cli.command else {
            panic!("expected rendezvous");
        };
        assert_eq!(args.listen, "0.0.0.0:9100".parse().expect("addr"));
    }
}
