use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use testresd::cli::{Cli, Command, SettingsArgs};
use testresd::client::{self, BootstrapOptions, settings};
use testresd::server::{self, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Server {
            port,
            port_file,
            access_token,
            idle_timeout_minutes,
        } => {
            let config = ServerConfig {
                port,
                port_file,
                access_token: access_token.filter(|t| !t.is_empty()),
                idle_timeout: (idle_timeout_minutes > 0)
                    .then(|| Duration::from_secs(idle_timeout_minutes.saturating_mul(60))),
            };
            if let Err(e) = server::run(config).await {
                tracing::error!(error = %e, "server failed");
                eprintln!("testresd server: {e}");
                std::process::exit(1);
            }
        }
        Command::Start {
            settings,
            port,
            access_token,
            no_token,
            read_timeout_seconds,
            idle_timeout_minutes,
            log_file,
        } => {
            let program = std::env::current_exe().unwrap_or_else(|e| {
                eprintln!("testresd start: cannot locate own executable: {e}");
                std::process::exit(1);
            });
            let access_token = if no_token {
                None
            } else {
                Some(access_token.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
            };
            let options = BootstrapOptions {
                settings_dir: settings_dir("start", settings),
                explicit_port: port,
                access_token,
                client_read_timeout: read_timeout_seconds.map(Duration::from_secs),
                idle_timeout_minutes,
                program,
                log_file,
            };
            if let Err(e) = client::start(&options).await {
                tracing::error!(error = %e, "start failed");
                eprintln!("testresd start: {e}");
                std::process::exit(1);
            }
        }
        Command::Stop { settings } => {
            if let Err(e) = client::stop(&settings_dir("stop", settings)).await {
                tracing::error!(error = %e, "stop failed");
                eprintln!("testresd stop: {e}");
                std::process::exit(1);
            }
        }
        Command::Client { settings, action } => {
            if let Err(e) = client::run(action, &settings_dir("client", settings)).await {
                tracing::error!(error = %e, "client failed");
                eprintln!("testresd client: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn settings_dir(command: &str, args: SettingsArgs) -> PathBuf {
    args.settings_dir
        .or_else(settings::default_settings_dir)
        .unwrap_or_else(|| {
            eprintln!("testresd {command}: no settings directory (set --settings-dir or HOME)");
            std::process::exit(1);
        })
}
