//! switchyardd: the Switchyard daemon.
//!
//! Single binary that assembles all Switchyard subsystems:
//! - State store (redb)
//! - Edge router (in-process or upstream file + reload command)
//! - Health prober and deployment controller
//! - Continuous monitor and rollback advice loop
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! switchyardd init --primary 10.0.0.1:8080 --secondary 10.0.0.2:8080 --out switchyard.toml
//! switchyardd check-config --config switchyard.toml
//! switchyardd serve --config switchyard.toml --data-dir /var/lib/switchyard --port 8480
//! ```

mod commands;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "switchyardd", about = "Switchyard blue-green deployment daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller, monitor and API.
    Serve {
        /// Path to the TOML config file.
        #[arg(long)]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/switchyard")]
        data_dir: PathBuf,

        /// Port for the REST API.
        #[arg(long, default_value = "8480")]
        port: u16,
    },

    /// Validate a config file and print a summary.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },

    /// Write a two-environment starter config.
    Init {
        /// Endpoint of the primary environment.
        #[arg(long)]
        primary: String,

        /// Endpoint of the secondary environment.
        #[arg(long)]
        secondary: String,

        #[arg(long, default_value = "switchyard.toml")]
        out: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,switchyard=debug,switchyardd=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            data_dir,
            port,
        } => serve::run_serve(&config, data_dir, port).await,
        Command::CheckConfig { config } => {
            let summary = commands::check_config(&config)?;
            println!("{summary}");
            Ok(())
        }
        Command::Init {
            primary,
            secondary,
            out,
            force,
        } => {
            commands::init_config(&primary, &secondary, &out, force)?;
            println!("wrote {}", out.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_port_and_data_dir() {
        let cli = Cli::try_parse_from(["switchyardd", "serve", "--config", "sy.toml"]).unwrap();
        match cli.command {
            Command::Serve {
                config,
                data_dir,
                port,
            } => {
                assert_eq!(config, PathBuf::from("sy.toml"));
                assert_eq!(data_dir, PathBuf::from("/var/lib/switchyard"));
                assert_eq!(port, 8480);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn serve_requires_config() {
        assert!(Cli::try_parse_from(["switchyardd", "serve"]).is_err());
    }
}
