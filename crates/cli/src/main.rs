use std::process;

use clap::{Parser, Subcommand};

mod serve;

#[derive(Parser, Debug)]
#[clap(author, version, about = "QueuePay - payment-gated queue tickets for POS controllers", long_about = None)]
struct Opts {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Start the QueuePay API server
    Serve(serve::ServeCommand),
}

#[tokio::main]
async fn main() {
    // Environment must be loaded before clap resolves `env` defaults
    load_env_file();

    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            let _ = e.print();
            process::exit(e.exit_code());
        }
    };

    if let Err(e) = handle_command(opts).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Load environment variables from a .env file in the working directory
fn load_env_file() {
    match dotenvy::dotenv() {
        Ok(path) => {
            eprintln!("✓ Loaded environment from {}", path.display());
        }
        Err(e) if e.not_found() => {}
        Err(e) => {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }
}

async fn handle_command(opts: Opts) -> Result<(), String> {
    match opts.command {
        Command::Serve(cmd) => cmd.execute().await,
    }
}
