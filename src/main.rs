use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use session_guard::agent::daemon::{self, DiagnosticAction};
use session_guard::utils;

#[derive(Parser)]
#[command(name = "session-guard", version, about = "Session Consistency Guard")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "guard.json", global = true)]
    config: String,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the guard and expose the diagnostic API on loopback
    Serve {
        #[arg(long, default_value_t = 8099)]
        port: u16,
    },
    /// Validate the session once and print the tick result
    Check,
    /// Force the cleanup cascade now
    Signout,
    /// Compare the believed subject with the provider's
    Report,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AppCli::parse();
    utils::logging::init(&args.log_level);

    match args.command {
        Some(Commands::Serve { port }) => {
            info!("Starting session guard with diagnostic API on port {port}");
            daemon::run(args.config, Some(port)).await?;
        }
        Some(Commands::Check) => {
            println!("{}", daemon::run_diagnostic(args.config, DiagnosticAction::Check).await?);
        }
        Some(Commands::Signout) => {
            println!("{}", daemon::run_diagnostic(args.config, DiagnosticAction::SignOut).await?);
        }
        Some(Commands::Report) => {
            println!("{}", daemon::run_diagnostic(args.config, DiagnosticAction::Report).await?);
        }
        None => {
            // Default: run the guard daemon
            daemon::run(args.config, None).await?;
        }
    }

    Ok(())
}
