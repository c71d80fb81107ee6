use clap::{Parser, Subcommand};

mod app;
mod auth;
mod config;
mod state;

use crate::{config::AppConfig, state::AppState};

/// Blog account service: signup, sessions, confirmation tokens, staff admin.
#[derive(Parser)]
#[command(name = "blog-auth")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve {
        /// Keep all state in process memory instead of Postgres
        #[arg(long)]
        in_memory: bool,
    },

    /// Create an active staff account
    CreateAdmin {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "blog_auth=debug,audit=info,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve { in_memory: false }) {
        Commands::Serve { in_memory } => {
            let state = if in_memory {
                tracing::warn!("running with the in-memory store; nothing will persist");
                AppState::in_memory(config)
            } else {
                AppState::init(config).await?
            };
            app::serve(state).await?;
        }
        Commands::CreateAdmin { email, password } => {
            let state = AppState::init(config).await?;
            let user = state.accounts.create_admin(&email, &password).await?;
            tracing::info!(user_id = user.id, email = %user.email, "staff account created");
        }
    }

    Ok(())
}
