use crate::logging::LogLevel;
use crate::shell::InterpreterCommand;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const AGENT_LOG_FILE: &str = "agent.log";
const COMMAND_OUTPUT_LOG_FILE: &str = "command_output.log";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(
    name = "warden-agent",
    author,
    version,
    about = "Remote administration agent (control listener + schedule engine)"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to bind the control listener to.
    #[arg(long, env = "WARDEN_LISTEN_ADDR", default_value = "127.0.0.1:65444")]
    pub listen_addr: String,

    /// Shared secret used to sign and verify access tokens. The default
    /// matches the deployed controller build; override it in any real
    /// installation.
    #[arg(long, env = "WARDEN_SHARED_SECRET", default_value = "r00tmeKey")]
    pub shared_secret: String,

    /// Access-token validity window in seconds.
    #[arg(long, env = "WARDEN_TOKEN_TTL_SECS", default_value_t = 300)]
    pub token_ttl_secs: u64,

    /// Schedule evaluation interval in seconds.
    #[arg(long, env = "WARDEN_TICK_SECS", default_value_t = 5)]
    pub tick_secs: u64,

    /// Idle read timeout applied once a request has started arriving.
    #[arg(long, env = "WARDEN_READ_TIMEOUT_SECS", default_value_t = 2)]
    pub read_timeout_secs: u64,

    /// Directory for the agent log and the command-output log.
    #[arg(long, env = "WARDEN_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "WARDEN_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Interpreter program for the interactive shell session. Defaults to
    /// the platform shell.
    #[arg(long, env = "WARDEN_SHELL")]
    pub shell: Option<String>,

    /// Endpoint used by the connectivity probe.
    #[arg(long, env = "WARDEN_PROBE_ADDR", default_value = "google.com:80")]
    pub probe_addr: String,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Mint a controller access token and print it to stdout.
    Token {
        /// Label recorded in the token's subject claim.
        #[arg(long, default_value = "controller")]
        label: String,
    },
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    pub shared_secret: String,
    pub token_ttl: chrono::Duration,
    pub tick: Duration,
    pub read_timeout: Duration,
    pub log_level: LogLevel,
    pub agent_log: PathBuf,
    pub command_log: PathBuf,
    pub shell: InterpreterCommand,
    pub probe_addr: String,
    pub probe_timeout: Duration,
}

impl TryFrom<Cli> for AgentConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let log_dir = cli.log_dir.unwrap_or_else(default_log_dir);
        let shell = match cli.shell {
            Some(program) => InterpreterCommand {
                program,
                args: Vec::new(),
            },
            None => InterpreterCommand::default(),
        };
        Ok(AgentConfig {
            listen_addr,
            shared_secret: cli.shared_secret,
            token_ttl: chrono::Duration::seconds(cli.token_ttl_secs as i64),
            tick: Duration::from_secs(cli.tick_secs),
            read_timeout: Duration::from_secs(cli.read_timeout_secs),
            log_level: cli.log_level,
            agent_log: log_dir.join(AGENT_LOG_FILE),
            command_log: log_dir.join(COMMAND_OUTPUT_LOG_FILE),
            shell,
            probe_addr: cli.probe_addr,
            probe_timeout: PROBE_TIMEOUT,
        })
    }
}

fn default_log_dir() -> PathBuf {
    ProjectDirs::from("", "", "warden")
        .map(|dirs| dirs.data_local_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_parses_listen_addr() {
        let cli = Cli::parse_from(["warden-agent", "--listen-addr", "127.0.0.1:0"]);
        let config = AgentConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr.port(), 0);
        assert_eq!(config.token_ttl, chrono::Duration::seconds(300));
    }

    #[test]
    fn bad_listen_addr_is_rejected() {
        let cli = Cli::parse_from(["warden-agent", "--listen-addr", "nowhere"]);
        assert!(AgentConfig::try_from(cli).is_err());
    }
}
