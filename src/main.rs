//! lessd -- S3-compatible storage core.
//!
//! Crash-only design: every startup is a recovery.  `serve` reopens the
//! metadata store, sweeps stale temp files out of every bucket directory,
//! and runs the upload cleanup loop until SIGTERM/SIGINT.  The remaining
//! subcommands are one-shot administrative operations that print JSON.

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use lessd::bucket::manager::BucketRemoval;
use lessd::config::LoggingConfig;
use lessd::errors::S3Error;
use lessd::AppState;

/// Command-line arguments for lessd.
#[derive(Parser, Debug)]
#[command(name = "lessd", version, about = "S3-compatible storage core")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true, default_value = "lessd.example.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load every bucket and run background cleanup until signalled.
    Serve,
    /// Create a user.
    UserAdd {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
    /// Create an access key for an existing user.
    CredentialAdd {
        /// Email of the owning user.
        #[arg(long)]
        email: String,
        #[arg(long)]
        access_key: String,
        #[arg(long)]
        secret_key: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Create a bucket.
    BucketAdd {
        #[arg(long)]
        name: String,
        /// Email of the owning user.
        #[arg(long)]
        owner: String,
        #[arg(long)]
        versioning: bool,
        #[arg(long)]
        public_read: bool,
        #[arg(long)]
        public_write: bool,
    },
    /// Remove an empty bucket. With --destroy, remove it regardless and
    /// delete its data on disk.
    BucketRemove {
        #[arg(long)]
        name: String,
        #[arg(long)]
        destroy: bool,
    },
    /// List buckets.
    BucketList,
    /// Object count and total size of a bucket.
    BucketStats {
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = lessd::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let state = AppState::open(config).await?;

    match cli.command {
        Command::Serve => serve(state).await,
        Command::UserAdd { name, email } => {
            let user = state.config_manager.add_user(&name, &email).await?;
            print_json(&user)
        }
        Command::CredentialAdd {
            email,
            access_key,
            secret_key,
            description,
        } => {
            let user = state
                .config_manager
                .get_user_by_email(&email)
                .await?
                .ok_or(S3Error::NoSuchUser { user: email })?;
            let credential = state
                .config_manager
                .add_credential(&user.guid, &access_key, &secret_key, &description)
                .await?;
            print_json(&credential)
        }
        Command::BucketAdd {
            name,
            owner,
            versioning,
            public_read,
            public_write,
        } => {
            let user = state
                .config_manager
                .get_user_by_email(&owner)
                .await?
                .ok_or(S3Error::NoSuchUser { user: owner })?;
            let mut record = state.bucket_manager.new_record(&name, &user.guid);
            record.enable_versioning = versioning;
            record.enable_public_read = public_read;
            record.enable_public_write = public_write;
            let client = state.bucket_manager.add(record).await?;
            print_json(&client.config())
        }
        Command::BucketRemove { name, destroy } => {
            let outcome = state.bucket_manager.remove(&name, destroy).await?;
            match outcome {
                BucketRemoval::NotFound => {
                    return Err(S3Error::NoSuchBucket { bucket: name }.into());
                }
                BucketRemoval::NotEmpty => {
                    return Err(S3Error::BucketNotEmpty { bucket: name }.into());
                }
                _ => {}
            }
            print_json(&serde_json::json!({
                "bucket": name,
                "result": format!("{outcome:?}"),
            }))
        }
        Command::BucketList => print_json(&state.bucket_manager.list()),
        Command::BucketStats { name } => {
            let client = state
                .bucket_manager
                .get_client(&name)
                .ok_or(S3Error::NoSuchBucket { bucket: name })?;
            print_json(&client.get_full_statistics().await?)
        }
    }
}

async fn serve(state: AppState) -> anyhow::Result<()> {
    info!(
        "lessd ready: {} bucket(s), region {}",
        state.bucket_manager.list().len(),
        state.config.server.region
    );
    state.cleanup.start();

    shutdown_signal().await;

    // No cleanup beyond stopping the sweep: next startup handles recovery.
    state.close();
    info!("lessd shut down");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
