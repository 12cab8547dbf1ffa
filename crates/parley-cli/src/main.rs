use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use parley_core::config::{Config, LoggingConfig};
use parley_core::profile::SessionProfile;
use parley_gateway::hot_reload::{ConfigWatcher, spawn_knowledge_refresh};
use parley_gateway::{GatewayState, LiveConnector};

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Real-time voice conversation gateway: speech in, LLM reply, speech out",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: ~/.parley/config.json)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the voice gateway
    Serve {
        /// Port to listen on (default: gateway.port or 8080)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: gateway.bind or 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration summary
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration and report problems
    Validate,
    /// Get a specific config value by dotted path (e.g. "stt.sample_rate")
    Get { key: String },
}

/// Build the log filter: `RUST_LOG` wins, then the configured level (or
/// `debug` with `--verbose`), plus any per-crate directives.
fn build_filter(logging: &LoggingConfig, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(filter_directives(logging, verbose))
}

fn filter_directives(logging: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    std::iter::once(level)
        .chain(logging.filters.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(",")
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let writer = match logging.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(build_filter(logging, verbose))
        .with_writer(writer);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(
    config: Config,
    config_path: PathBuf,
    port: Option<u16>,
    bind: Option<String>,
) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!(%warning, "Config warning");
    }
    if !errors.is_empty() {
        for error in &errors {
            tracing::error!(%error, "Config error");
        }
        anyhow::bail!("invalid config ({} errors)", errors.len());
    }

    let port = port.unwrap_or_else(|| config.gateway_port());
    let bind = bind.unwrap_or_else(|| config.gateway_bind());

    let http = reqwest::Client::new();
    let profile = SessionProfile::load(config, &http).await?;
    tracing::info!(
        prompt_chars = profile.system_prompt.len(),
        "Assistant profile loaded"
    );

    let state = GatewayState::new(
        profile,
        Some(config_path.clone()),
        Arc::new(LiveConnector),
        http,
    );

    #[cfg(feature = "metrics")]
    let state = match parley_gateway::metrics::install_prometheus_recorder() {
        Ok(handle) => state.with_prometheus(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install metrics recorder");
            state
        }
    };

    let state = Arc::new(state);

    let _watcher = match ConfigWatcher::start(state.clone(), config_path) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Config hot-reload disabled");
            None
        }
    };
    let refresh = spawn_knowledge_refresh(state.clone());

    tracing::info!("Starting Parley gateway on {bind}:{port}");
    let result = parley_gateway::start_gateway(state, &bind, port).await;

    if let Some(task) = refresh {
        task.abort();
    }
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);

    let config = Config::load(&config_path)?;
    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Serve { port, bind } => serve(config, config_path, port, bind).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config errors in {}", errors.len(), config_path.display());
                }
                println!("Config OK ({} warnings)", warnings.len());
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at '{key}'"),
            },
        },
        Commands::Status => {
            let stt = config.stt();
            let llm = config.llm();
            let tts = config.tts();
            println!("Parley v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Config: {}{}",
                config_path.display(),
                if config_path.exists() { "" } else { " (not found, using defaults)" }
            );
            println!("Gateway: {}:{}", config.gateway_bind(), config.gateway_port());
            println!("STT: {:?} @ {} Hz", stt.vendor, stt.sample_rate);
            println!("LLM: {:?} / {}", llm.provider, llm.model);
            println!("TTS: {:?} / {} ({})", tts.mode, tts.model, tts.voice);
            match config.knowledge_refresh() {
                Some(every) => println!("Knowledge refresh: every {}s", every.as_secs()),
                None => println!("Knowledge refresh: off"),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives_default() {
        assert_eq!(filter_directives(&LoggingConfig::default(), false), "info");
    }

    #[test]
    fn test_filter_directives_level_and_filters() {
        let logging = LoggingConfig {
            level: Some("warn".into()),
            filters: vec!["parley_gateway=debug".into(), "hyper=off".into()],
            ..Default::default()
        };
        assert_eq!(
            filter_directives(&logging, false),
            "warn,parley_gateway=debug,hyper=off"
        );
        assert!(filter_directives(&logging, true).starts_with("debug,"));
    }

    #[test]
    fn test_cli_parses_serve_flags() {
        let cli = Cli::try_parse_from(["parley", "serve", "--port", "9000", "--bind", "0.0.0.0"])
            .unwrap();
        match cli.command {
            Commands::Serve { port, bind } => {
                assert_eq!(port, Some(9000));
                assert_eq!(bind.as_deref(), Some("0.0.0.0"));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_cli_global_config_flag() {
        let cli = Cli::try_parse_from(["parley", "config", "get", "stt.vendor", "-c", "/tmp/p.json"])
            .unwrap();
        assert_eq!(cli.config.as_deref(), Some("/tmp/p.json"));
        assert!(matches!(
            cli.command,
            Commands::Config { action: ConfigAction::Get { .. } }
        ));
    }
}
