use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lanscout_core::{AppConfig, LogFormat};
use lanscout_discovery::{DeviceCallback, MdnsProvider, SessionRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// lanscout - browse and advertise services on the local network
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config/lanscout.yaml")]
    config: PathBuf,

    /// Override the configured log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print one JSON line per device update until Ctrl-C
    Browse {
        /// Service types, e.g. `_googlecast._tcp`
        #[arg(required = true)]
        service_types: Vec<String>,
    },
    /// Advertise this device until Ctrl-C
    Register {
        name: String,
        service_type: String,
        port: u16,
        /// TXT metadata as a flat JSON object of strings
        #[arg(long, default_value = "{}")]
        txt: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

fn init_tracing(config: &AppConfig, format: LogFormat) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.level)
            .with_context(|| format!("Invalid log filter: {}", config.logging.level))?,
    };

    // Device JSON goes to stdout, logs to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::from_config_builder(&cli.config)
        .with_context(|| format!("Failed to load config: {:?}", cli.config))?;
    config.validate().context("Invalid configuration")?;

    let format = cli.log_format.map(LogFormat::from).unwrap_or(config.logging.format);
    init_tracing(&config, format)?;

    let provider = Arc::new(MdnsProvider::new().context("Failed to start mDNS provider")?);
    let registry = SessionRegistry::new(provider, config.discovery.clone())
        .context("Failed to create session registry")?;

    match cli.command {
        Command::Browse { service_types } => {
            let print: DeviceCallback = Arc::new(|json: &str| println!("{json}"));
            for service_type in &service_types {
                registry
                    .start_browse(service_type, print.clone())
                    .await
                    .with_context(|| format!("Failed to browse {service_type}"))?;
                info!(service_type = %service_type, "Browsing");
            }
        }
        Command::Register {
            name,
            service_type,
            port,
            txt,
        } => {
            registry
                .register_service(&name, &service_type, port, &txt)
                .with_context(|| format!("Failed to register {name} as {service_type}"))?;
            info!(name = %name, service_type = %service_type, port, "Advertising");
        }
    }

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, stopping...");

    registry.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browse_requires_a_type() {
        assert!(Cli::try_parse_from(["lanscout", "browse"]).is_err());

        let cli = Cli::try_parse_from(["lanscout", "browse", "_a._tcp", "_b._udp"]).unwrap();
        match cli.command {
            Command::Browse { service_types } => assert_eq!(service_types.len(), 2),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_register_arguments() {
        let cli = Cli::try_parse_from([
            "lanscout",
            "--log-format",
            "json",
            "register",
            "Living Room",
            "_airplay._tcp",
            "7000",
            "--txt",
            r#"{"model":"TV"}"#,
        ])
        .unwrap();

        assert!(matches!(cli.log_format, Some(LogFormatArg::Json)));
        match cli.command {
            Command::Register {
                name, port, txt, ..
            } => {
                assert_eq!(name, "Living Room");
                assert_eq!(port, 7000);
                assert_eq!(txt, r#"{"model":"TV"}"#);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_register_rejects_bad_port() {
        assert!(Cli::try_parse_from(["lanscout", "register", "Dev", "_a._tcp", "99999"]).is_err());
    }
}
