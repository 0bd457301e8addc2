// ABOUTME: CLI argument parsing and command routing for midclt
//
// Provides command-line interface for:
// - Invoking a method, optionally tracked as a job (call)
// - Streaming collection updates (subscribe)
// - Checking connectivity and round-trip time (ping)

pub mod call;
pub mod ping;
pub mod subscribe;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use middleware_client::{ClientConfig, Credentials};

/// Command line client for the appliance middleware
#[derive(Parser)]
#[command(name = "midclt")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// WebSocket endpoint, e.g. wss://nas.local/websocket
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Config file (default: <config_dir>/midclt/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log in with this user name
    #[arg(long, short, global = true)]
    pub username: Option<String>,

    /// Password for --username
    #[arg(long, short, global = true)]
    pub password: Option<String>,

    /// Log in with an API key instead of a password
    #[arg(long, global = true, conflicts_with = "username")]
    pub api_key: Option<String>,

    /// Per-call timeout in seconds
    #[arg(long, short, global = true)]
    pub timeout: Option<u64>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Write JSON logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Call a method and print its result
    Call(CallArgs),

    /// Print updates pushed for a collection
    Subscribe(SubscribeArgs),

    /// Check the connection with core.ping
    Ping,
}

/// Arguments for the call command
#[derive(clap::Args)]
pub struct CallArgs {
    /// Method name, e.g. system.info
    pub method: String,

    /// Parameters, each parsed as JSON (bare words become strings)
    pub params: Vec<String>,

    /// The method starts a job; wait for it and print its result
    #[arg(long, short)]
    pub job: bool,
}

/// Arguments for the subscribe command
#[derive(clap::Args)]
pub struct SubscribeArgs {
    /// Collection name, e.g. alert.list
    pub collection: String,

    /// Stop after this many updates
    #[arg(long, short = 'n')]
    pub count: Option<usize>,
}

impl Cli {
    /// Config file values overridden by command line flags.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::load_or_default(self.config.as_deref())?;

        if let Some(url) = &self.url {
            config.url.clone_from(url);
        }

        if let Some(key) = &self.api_key {
            config.credentials = Some(Credentials::ApiKey { key: key.clone() });
        } else if let Some(username) = &self.username {
            let Some(password) = &self.password else {
                bail!("--username requires --password");
            };
            config.credentials = Some(Credentials::Password {
                username: username.clone(),
                password: password.clone(),
            });
        }

        if let Some(secs) = self.timeout {
            config.call_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }
}
