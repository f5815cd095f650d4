use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Feedback prompt scheduler for the ASKIA chat.
#[derive(Parser, Debug)]
#[command(name = "askia", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP service.
    Serve {
        #[arg(long, default_value = "./config/example-config.yaml")]
        config: String,
    },
    /// Check the hash chain of a decision journal.
    VerifyJournal { path: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let cfg = match askia_config::load_and_validate(&config) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("failed to load config: {e}");
                    std::process::exit(1);
                }
            };
            init_tracing(&cfg.logging.level);
            tracing::info!(config = %config, profile = %cfg.triggers.profile, "config loaded");

            if let Err(e) = askia_server::serve(cfg).await {
                tracing::error!(error = %e, "server exited with error");
                std::process::exit(1);
            }
        }
        Commands::VerifyJournal { path } => match askia_server::verify_journal_chain(&path) {
            Ok(count) => println!("journal chain verified: {count} records"),
            Err(e) => {
                eprintln!("journal verification failed: {e}");
                std::process::exit(1);
            }
        },
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "askia={level},askia_server={level},askia_kernel={level},warn"
        ))
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
