use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use warden_agent::auth::Authenticator;
use warden_agent::capability::Capabilities;
use warden_agent::config::{AgentConfig, Cli, Commands};
use warden_agent::logging::{self, LogConfig};
use warden_agent::logstore::LogStore;
use warden_agent::policy::SystemProxyPolicy;
use warden_agent::registry::{build_registry, Services};
use warden_agent::schedule::Scheduler;
use warden_agent::server::Dispatcher;
use warden_agent::shell::{CommandLog, ShellService};
use warden_agent::system::SystemProbe;
use warden_proto::token::TokenKeys;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Token { label }) = &cli.command {
        let keys = TokenKeys::new(
            &cli.shared_secret,
            chrono::Duration::seconds(cli.token_ttl_secs as i64),
        );
        let (token, expires_at) = keys.issue(label);
        println!("{token}");
        eprintln!("expires at unix {expires_at}");
        return Ok(());
    }

    let config = AgentConfig::try_from(cli)?;
    logging::init(&LogConfig {
        level: config.log_level,
        file: Some(config.agent_log.clone()),
    })?;
    info!(
        listen_addr = %config.listen_addr,
        tick_secs = config.tick.as_secs(),
        token_ttl_secs = config.token_ttl.num_seconds(),
        "starting warden agent"
    );

    let auth = Arc::new(Authenticator::new(TokenKeys::new(
        &config.shared_secret,
        config.token_ttl,
    )));
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(SystemProxyPolicy::default()),
        config.tick,
    ));
    let shell = Arc::new(ShellService::new(
        config.shell.clone(),
        CommandLog::new(config.command_log.clone()),
    ));
    let registry = Arc::new(build_registry(Services {
        shell,
        scheduler: Arc::clone(&scheduler),
        capabilities: Capabilities::unsupported(),
        system: Arc::new(SystemProbe::new()),
        log_store: Arc::new(LogStore::new(config.agent_log.clone())),
        probe_target: config.probe_addr.clone(),
        probe_timeout: config.probe_timeout,
    }));

    let ticker = scheduler.spawn_ticker();
    let dispatcher =
        Dispatcher::bind(config.listen_addr, auth, registry, config.read_timeout).await?;

    tokio::select! {
        result = dispatcher.serve() => result,
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            ticker.abort();
            Ok(())
        }
    }
}
