//! ShellRelay
//!
//! Session-multiplexed execution and PTY relay.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay::auth::{AuthGuard, Identity};
use relay::config::{default_config_path, Config, ServerConfig};
use relay::orchestrator::{OrchestratorEvent, RelayOrchestrator};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// ShellRelay - authenticated execution and shell relay.
#[derive(Parser, Debug)]
#[command(name = "shellrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the relay
    Serve {
        /// Address to listen on (overrides the configuration)
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Issue an identity token signed with the configured secret
    Token {
        /// User identifier
        user: String,

        /// Email address to embed
        #[arg(long)]
        email: Option<String>,

        /// Lifetime in seconds (defaults to auth.token_ttl_secs)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Configuration subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // Load configuration
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    match cli.command {
        Commands::Serve { listen } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            config.validate()?;

            let _log_guard = init_logging(cli.verbose, &config.server)?;
            tracing::info!(config = %config_path.display(), "ShellRelay starting...");

            let mut orchestrator = RelayOrchestrator::new(config)?;
            run(&mut orchestrator).await?;
        }
        Commands::Token { user, email, ttl } => {
            if config.auth.secret.is_empty() {
                anyhow::bail!(
                    "auth.secret is not set; tokens signed with a random key would be useless"
                );
            }
            config.validate()?;

            let guard = AuthGuard::new(&config.auth);
            let identity = Identity {
                email,
                ..Identity::new(user)
            };
            let ttl = Duration::from_secs(ttl.unwrap_or(config.auth.token_ttl_secs));
            let token = guard
                .issue(&identity, ttl)
                .context("Failed to issue token")?;
            println!("{}", token);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Sets up the tracing subscriber.
///
/// `RUST_LOG` wins over `--verbose`, which wins over the configured level.
/// The returned guard flushes the log file on drop.
fn init_logging(verbose: bool, server: &ServerConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { server.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &server.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .context("log_file must name a file")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

/// Runs the relay until SIGINT or SIGTERM.
async fn run(orchestrator: &mut RelayOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ConnectionOpened { peer } => {
                    tracing::debug!(%peer, "Connection opened");
                }
                OrchestratorEvent::ConnectionClosed { peer } => {
                    tracing::debug!(%peer, "Connection closed");
                }
                OrchestratorEvent::SessionsReaped { count } => {
                    tracing::debug!(count, "Idle sessions reaped");
                }
            }
        }
    });

    wait_for_shutdown_signal().await?;
    orchestrator.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["shellrelay", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { listen } => assert!(listen.is_none()),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_with_listen() {
        let cli =
            Cli::try_parse_from(["shellrelay", "serve", "--listen", "0.0.0.0:8080"]).unwrap();
        match cli.command {
            Commands::Serve { listen } => assert_eq!(listen.as_deref(), Some("0.0.0.0:8080")),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_token_command() {
        let cli = Cli::try_parse_from([
            "shellrelay",
            "token",
            "alice",
            "--email",
            "alice@example.com",
            "--ttl",
            "600",
        ])
        .unwrap();
        match cli.command {
            Commands::Token { user, email, ttl } => {
                assert_eq!(user, "alice");
                assert_eq!(email.as_deref(), Some("alice@example.com"));
                assert_eq!(ttl, Some(600));
            }
            _ => panic!("Expected Token command"),
        }
    }

    #[test]
    fn test_token_requires_user() {
        assert!(Cli::try_parse_from(["shellrelay", "token"]).is_err());
    }

    #[test]
    fn test_config_commands() {
        let cli = Cli::try_parse_from(["shellrelay", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));

        let cli = Cli::try_parse_from(["shellrelay", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "shellrelay",
            "-v",
            "--config",
            "/tmp/relay.toml",
            "serve",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/relay.toml")));
    }
}
