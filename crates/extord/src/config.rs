use clap::{ArgAction, Parser};
use extor_common::command::{DEFAULT_MAX_BODY, MAX_WIRE_BODY};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments for the Extended ORPort daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "extord")]
#[command(about = "Extended ORPort gatekeeper for pluggable transports")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on. Should be a loopback address.
    #[arg(long, default_value = "127.0.0.1:6669", env = "EXTORD_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "EXTORD_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Path of the authentication cookie file.
    #[arg(
        long,
        default_value = "extended_orport_auth_cookie",
        env = "EXTORD_COOKIE_FILE"
    )]
    pub cookie_file: PathBuf,
    /// Create the cookie file group-readable (0640) instead of 0600.
    #[arg(long, env = "EXTORD_COOKIE_GROUP_READABLE")]
    pub cookie_group_readable: bool,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "4096", env = "EXTORD_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum command body length in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_BODY, env = "EXTORD_MAX_BODY")]
    pub max_body: usize,
    /// Seconds a connection may take to authenticate and send DONE.
    #[arg(long, default_value = "30", env = "EXTORD_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: u64,
    /// Minimum seconds between authentication-failure log lines.
    #[arg(long, default_value = "300", env = "EXTORD_LOG_RATE_INTERVAL")]
    pub log_rate_interval: u64,
    /// Increase log verbosity (-v debug, -vv trace). Ignored if RUST_LOG is set.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Path of the authentication cookie file.
    pub cookie_file: PathBuf,
    /// Create the cookie file group-readable.
    pub cookie_group_readable: bool,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum command body length in bytes.
    pub max_body: usize,
    /// Seconds a connection may take to authenticate and send DONE.
    pub handshake_timeout: u64,
    /// Minimum seconds between authentication-failure log lines.
    pub log_rate_interval: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        // Handshake commands need 32-byte bodies; the wire field caps at 65535.
        if self.max_body < 64 {
            return Err("max_body must be at least 64".to_string());
        }
        if self.max_body > MAX_WIRE_BODY {
            return Err(format!(
                "max_body exceeds maximum allowed ({MAX_WIRE_BODY} bytes)"
            ));
        }

        if self.handshake_timeout == 0 {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout > 3600 {
            return Err("handshake_timeout exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.log_rate_interval == 0 {
            return Err("log_rate_interval must be greater than 0".to_string());
        }
        if self.log_rate_interval > 86_400 {
            return Err(
                "log_rate_interval exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }

        if self.cookie_file.as_os_str().is_empty() {
            return Err("cookie_file must not be empty".to_string());
        }
        Ok(())
    }

    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Log rate interval as a [`Duration`].
    #[must_use]
    pub const fn log_rate_interval(&self) -> Duration {
        Duration::from_secs(self.log_rate_interval)
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            cookie_file: args.cookie_file,
            cookie_group_readable: args.cookie_group_readable,
            max_conns: args.max_conns,
            max_body: args.max_body,
            handshake_timeout: args.handshake_timeout,
            log_rate_interval: args.log_rate_interval,
        }
    }
}
