use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "mien", about = "Mien face enrollment and recognition CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the first face found in an image
    Enroll {
        /// Identity to enroll under (e.g., a username)
        #[arg(short, long)]
        identity: String,
        /// Image file containing the face
        #[arg(long)]
        image: PathBuf,
    },
    /// Identify the first face found in an image
    Recognize {
        /// Image file containing the face
        #[arg(long)]
        image: PathBuf,
        /// Maximum match distance (defaults to the daemon's configured value)
        #[arg(short, long)]
        threshold: Option<f64>,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity to remove
        identity: String,
    },
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.mien.Registry1",
    default_service = "org.mien.Registry1",
    default_path = "/org/mien/Registry1"
)]
trait Registry {
    async fn enroll_image(&self, identity: &str, image: Vec<u8>) -> zbus::Result<()>;
    async fn identify_image(&self, image: Vec<u8>, threshold: f64) -> zbus::Result<String>;
    async fn remove(&self, identity: &str) -> zbus::Result<()>;
    async fn list_all(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RegistryProxy::new(&conn)
        .await
        .context("miend is not reachable")?;

    match cli.command {
        Commands::Enroll { identity, image } => {
            let bytes = read_image(&image)?;
            proxy
                .enroll_image(&identity, bytes)
                .await
                .map_err(describe)?;
            println!("Registered successfully: {identity}");
        }
        Commands::Recognize { image, threshold } => {
            let bytes = read_image(&image)?;
            // Negative asks the daemon for its configured threshold.
            let json = proxy
                .identify_image(bytes, threshold.unwrap_or(-1.0))
                .await
                .map_err(describe)?;
            print_outcome(&json)?;
        }
        Commands::List => {
            let json = proxy.list_all().await.map_err(describe)?;
            print_enrollments(&json)?;
        }
        Commands::Remove { identity } => {
            proxy.remove(&identity).await.map_err(describe)?;
            println!("Removed: {identity}");
        }
        Commands::Status => {
            let json = proxy.status().await.map_err(describe)?;
            let value: serde_json::Value = serde_json::from_str(&json)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
    if bytes.is_empty() {
        anyhow::bail!("image {} is empty", path.display());
    }
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "read image");
    Ok(bytes)
}

/// Strip the D-Bus error name so daemon messages read naturally.
fn describe(err: zbus::Error) -> anyhow::Error {
    match err {
        zbus::Error::MethodError(_, Some(message), _) => anyhow::anyhow!(message),
        zbus::Error::FDO(fdo) => match *fdo {
            zbus::fdo::Error::InvalidArgs(message) | zbus::fdo::Error::Failed(message) => {
                anyhow::anyhow!(message)
            }
            other => anyhow::anyhow!(other),
        },
        other => anyhow::anyhow!(other),
    }
}

fn print_outcome(json: &str) -> Result<()> {
    let outcome: serde_json::Value = serde_json::from_str(json)?;
    let candidates = outcome["candidates"].as_array().cloned().unwrap_or_default();

    if candidates.is_empty() {
        println!("No match");
    } else {
        println!("Recognized:");
        for c in &candidates {
            println!(
                "  {:<24} similarity {:>6.2}%  distance {:.4}",
                c["identity"].as_str().unwrap_or("?"),
                c["similarity"].as_f64().unwrap_or(0.0),
                c["distance"].as_f64().unwrap_or(0.0),
            );
        }
    }

    if let Some(skipped) = outcome["skipped"].as_array().filter(|s| !s.is_empty()) {
        eprintln!("warning: {} enrollment(s) could not be compared", skipped.len());
    }
    Ok(())
}

fn print_enrollments(json: &str) -> Result<()> {
    let records: Vec<serde_json::Value> = serde_json::from_str(json)?;
    if records.is_empty() {
        println!("No identities enrolled");
        return Ok(());
    }
    for r in &records {
        println!(
            "{:<24} dim={:<4} enrolled {}",
            r["identity"].as_str().unwrap_or("?"),
            r["dimension"].as_u64().unwrap_or(0),
            r["enrolled_at"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}
