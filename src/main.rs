//! kbserve binary.
//!
//! ```bash
//! kbserve serve      # load env config, open storage, serve HTTP
//! kbserve init-db    # create the metadata store and exit
//! ```
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 storage
//! unreachable at startup.

use clap::{Parser, Subcommand};
use tracing::error;

use kbserve::{config, db, migrate, server, services::Services};

#[derive(Parser)]
#[command(
    name = "kbserve",
    about = "Multi-tenant knowledge-base query service",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service (default).
    Serve,
    /// Create the metadata store schema and exit.
    InitDb,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match config::load_from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::InitDb => {
            let result = async {
                let pool = db::connect(&config.metadata_db_path).await?;
                migrate::run_migrations(&pool).await?;
                pool.close().await;
                anyhow::Ok(())
            }
            .await;
            if let Err(e) = result {
                error!(error = %e, "metadata store unreachable");
                std::process::exit(2);
            }
            println!("metadata store initialized");
        }
        Commands::Serve => {
            let services = match Services::init(config).await {
                Ok(services) => services,
                Err(e) => {
                    error!(error = %e, "storage unreachable at startup");
                    std::process::exit(2);
                }
            };
            if let Err(e) = server::run_server(services).await {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
    }
}
