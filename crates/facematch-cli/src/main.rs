use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `RegistryProxy` (async) and `RegistryProxyBlocking`.
#[zbus::proxy(
    interface = "org.facematch.Registry1",
    default_service = "org.facematch.Registry1",
    default_path = "/org/facematch/Registry1"
)]
trait Registry {
    async fn register(&self, identity_id: i64, image: &[u8], metadata: &str) -> zbus::Result<String>;
    async fn register_remote(&self, identity_id: i64, uri: &str, metadata: &str) -> zbus::Result<String>;
    async fn search(&self, image: &[u8], top_k: u32) -> zbus::Result<String>;
    async fn search_remote(&self, uri: &str, top_k: u32) -> zbus::Result<String>;
    async fn compare(&self, image_a: &[u8], image_b: &[u8], threshold: f64) -> zbus::Result<String>;
    async fn extract(&self, image: &[u8]) -> zbus::Result<String>;
    async fn get_job(&self, job_id: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn list_records(&self, identity_id: i64) -> zbus::Result<String>;
    async fn list_all(&self, limit: u32) -> zbus::Result<String>;
    async fn delete_record(&self, record_id: u64) -> zbus::Result<String>;
    async fn delete_identity(&self, identity_id: i64) -> zbus::Result<String>;
    async fn update_record(&self, record_id: u64, patch: &str) -> zbus::Result<String>;
    async fn clear(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facematch", about = "Face registry CLI")]
struct Cli {
    /// Bus the daemon is registered on
    #[arg(long, value_enum, default_value_t = Bus::Session)]
    bus: Bus,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Bus {
    Session,
    System,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face closest to the registry (the sole face if only one) under an identity
    Register {
        identity_id: i64,
        image: PathBuf,
        /// Metadata as a JSON object
        #[arg(short, long, default_value = "")]
        metadata: String,
    },
    /// Queue enrollment of a remote image (scheme://bucket/key)
    RegisterRemote {
        identity_id: i64,
        uri: String,
        #[arg(short, long, default_value = "")]
        metadata: String,
    },
    /// Find the closest enrolled identities
    Search {
        image: PathBuf,
        /// Number of candidates; 0 uses the daemon default
        #[arg(short = 'k', long, default_value_t = 0)]
        top_k: u32,
    },
    /// Queue a search over a remote image
    SearchRemote {
        uri: String,
        #[arg(short = 'k', long, default_value_t = 0)]
        top_k: u32,
    },
    /// Compare the closest faces of two images
    Compare {
        image_a: PathBuf,
        image_b: PathBuf,
        /// Same-person distance threshold; 0 uses the daemon default
        #[arg(short, long, default_value_t = 0.0)]
        threshold: f64,
    },
    /// Detect every face and print its embedding
    Extract { image: PathBuf },
    /// Show an asynchronous job
    Job { id: String },
    /// List enrolled identities
    Identities,
    /// List the records of one identity
    Records { identity_id: i64 },
    /// List enrolled and query records
    All {
        #[arg(short, long, default_value_t = 0)]
        limit: u32,
    },
    /// Delete one record
    Delete { record_id: u64 },
    /// Delete every record of an identity
    DeleteIdentity { identity_id: i64 },
    /// Patch a record's identity id and/or metadata
    Update {
        record_id: u64,
        /// JSON patch, e.g. '{"identity_id": 3}'
        patch: String,
    },
    /// Remove every record
    Clear,
    /// Show daemon status
    Status,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Pretty-print a JSON reply; anything else is printed as is.
fn print_reply(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| reply.to_string())),
        Err(_) => println!("{reply}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let conn = match cli.bus {
        Bus::Session => zbus::Connection::session().await,
        Bus::System => zbus::Connection::system().await,
    }
    .context("connecting to D-Bus")?;
    let proxy = RegistryProxy::new(&conn)
        .await
        .context("facematchd is not reachable")?;
    tracing::debug!("connected to facematchd");

    let reply = match cli.command {
        Commands::Register {
            identity_id,
            image,
            metadata,
        } => proxy.register(identity_id, &read_image(&image)?, &metadata).await?,
        Commands::RegisterRemote {
            identity_id,
            uri,
            metadata,
        } => proxy.register_remote(identity_id, &uri, &metadata).await?,
        Commands::Search { image, top_k } => proxy.search(&read_image(&image)?, top_k).await?,
        Commands::SearchRemote { uri, top_k } => proxy.search_remote(&uri, top_k).await?,
        Commands::Compare {
            image_a,
            image_b,
            threshold,
        } => {
            proxy
                .compare(&read_image(&image_a)?, &read_image(&image_b)?, threshold)
                .await?
        }
        Commands::Extract { image } => proxy.extract(&read_image(&image)?).await?,
        Commands::Job { id } => proxy.get_job(&id).await?,
        Commands::Identities => proxy.list_identities().await?,
        Commands::Records { identity_id } => proxy.list_records(identity_id).await?,
        Commands::All { limit } => proxy.list_all(limit).await?,
        Commands::Delete { record_id } => proxy.delete_record(record_id).await?,
        Commands::DeleteIdentity { identity_id } => proxy.delete_identity(identity_id).await?,
        Commands::Update { record_id, patch } => proxy.update_record(record_id, &patch).await?,
        Commands::Clear => proxy.clear().await?,
        Commands::Status => proxy.status().await?,
    };
    print_reply(&reply);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_search() {
        let cli = Cli::try_parse_from(["facematch", "search", "query.jpg", "-k", "3"]).unwrap();
        match cli.command {
            Commands::Search { image, top_k } => {
                assert_eq!(image, PathBuf::from("query.jpg"));
                assert_eq!(top_k, 3);
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["facematch", "register", "7", "a.png"]).unwrap();
        assert!(matches!(cli.bus, Bus::Session));
        match cli.command {
            Commands::Register { identity_id, metadata, .. } => {
                assert_eq!(identity_id, 7);
                assert!(metadata.is_empty());
            }
            _ => panic!("expected register"),
        }
    }

    #[test]
    fn test_register_help_describes_winner_selection() {
        use clap::CommandFactory;
        let cmd = Cli::command();
        let about = cmd
            .find_subcommand("register")
            .and_then(|c| c.get_about())
            .map(|a| a.to_string())
            .unwrap();
        assert!(about.contains("closest to the registry"));
        assert!(!about.contains("confident"));
    }

    #[test]
    fn test_cli_system_bus_flag() {
        let cli = Cli::try_parse_from(["facematch", "--bus", "system", "status"]).unwrap();
        assert!(matches!(cli.bus, Bus::System));
        assert!(matches!(cli.command, Commands::Status));
    }
}
