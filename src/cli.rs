use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "testresd", about = "Shared test resources server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the server in the foreground
    Server {
        /// Loopback port to bind; 0 picks a free one
        #[arg(long, env = "TESTRESD_PORT", default_value_t = 0)]
        port: u16,

        /// File to write the bound port to
        #[arg(long)]
        port_file: Option<PathBuf>,

        /// Token every request must present
        #[arg(long, env = "TESTRESD_ACCESS_TOKEN", hide_env_values = true)]
        access_token: Option<String>,

        /// Shut down after this many idle minutes; 0 disables
        #[arg(long, env = "TESTRESD_IDLE_TIMEOUT_MINUTES", default_value_t = 60)]
        idle_timeout_minutes: u64,
    },

    /// Start a background server, or reuse the one already running
    Start {
        #[command(flatten)]
        settings: SettingsArgs,

        /// Require the server on this port
        #[arg(long)]
        port: Option<u16>,

        /// Access token for a newly launched server (generated if absent)
        #[arg(long, conflicts_with = "no_token")]
        access_token: Option<String>,

        /// Launch without an access token
        #[arg(long)]
        no_token: bool,

        /// Client read timeout in seconds
        #[arg(long)]
        read_timeout_seconds: Option<u64>,

        /// Idle timeout passed to a newly launched server
        #[arg(long)]
        idle_timeout_minutes: Option<u32>,

        /// Server log file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Stop the background server
    Stop {
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// One-shot requests against the running server
    Client {
        #[command(flatten)]
        settings: SettingsArgs,

        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Args, Clone, Debug)]
pub struct SettingsArgs {
    /// Directory holding the shared server settings
    #[arg(long, env = "TESTRESD_SETTINGS_DIR")]
    pub settings_dir: Option<PathBuf>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum ClientAction {
    /// List every resolvable property
    List,

    /// List entry groups providers need enumerated
    Entries,

    /// List properties required to resolve an expression
    Requirements { expression: String },

    /// Resolve a property, provisioning its resource if needed
    Resolve {
        name: String,

        /// Already known property (key=value), repeatable
        #[arg(long = "property", value_name = "KEY=VALUE")]
        properties: Vec<String>,

        /// Test-resources configuration entry (key=value), repeatable
        #[arg(long = "config", value_name = "KEY=VALUE")]
        config: Vec<String>,
    },

    /// Close resources in a scope and its descendants
    Close { scope: String },

    /// Close every resource
    CloseAll,

    /// List live resources
    Resources {
        /// Only resources in this scope and its descendants
        scope: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_resolve_with_repeated_pairs() {
        let cli = Cli::try_parse_from([
            "testresd",
            "client",
            "resolve",
            "redis.port",
            "--property",
            "a=1",
            "--property",
            "b=2",
            "--config",
            "redis.enabled=true",
        ])
        .unwrap();
        let Command::Client { action, .. } = cli.command else {
            panic!("expected client command");
        };
        let ClientAction::Resolve {
            name,
            properties,
            config,
        } = action
        else {
            panic!("expected resolve");
        };
        assert_eq!(name, "redis.port");
        assert_eq!(properties, vec!["a=1", "b=2"]);
        assert_eq!(config, vec!["redis.enabled=true"]);
    }

    #[test]
    fn token_flags_conflict() {
        let result =
            Cli::try_parse_from(["testresd", "start", "--access-token", "x", "--no-token"]);
        assert!(result.is_err());
    }
}
