use anyhow::{Context, Result};
use clap::Parser;
use iroh::SecretKey;
use modelmesh::node::{NodeConfig, OverlayNode};
use modelmesh::registry::{ModelKind, ModelRecord};
use modelmesh::store::RegistryStore;
use modelmesh::api;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "modelmesh", about = "P2P overlay for routing AI inference between peers")]
struct Cli {
    /// Local HTTP port for the API (default: 8545).
    #[arg(long, default_value = "8545")]
    port: u16,

    /// Listen for API requests on all interfaces, not just localhost.
    #[arg(long)]
    listen_all: bool,

    /// Join the overlay via a peer's invite token.
    /// Can be specified multiple times — only one needs to be reachable.
    #[arg(long, short)]
    join: Vec<String>,

    /// Serve a local model: project:model:kind:endpoint
    /// (e.g. "cortex:llama3:chat:http://127.0.0.1:8080/v1/chat/completions").
    /// Can be specified multiple times.
    #[arg(long)]
    serve: Vec<String>,

    /// Collect peer metadata from heartbeats and keep the remote registry.
    /// Without this, heartbeats are relayed but not recorded.
    #[arg(long)]
    collect_metadata: bool,

    /// Advertise this node as publicly dialable.
    #[arg(long)]
    public: bool,

    /// Project this node calls as a client. Peers that collect metadata
    /// only accept tunnel connections from nodes in projects they host.
    #[arg(long, default_value = "")]
    client_project: String,

    /// Heartbeat interval in seconds.
    #[arg(long, default_value = "30")]
    heartbeat_secs: u64,

    /// Override iroh relay URLs. Can be specified multiple times.
    /// Without this, iroh uses its built-in defaults.
    #[arg(long)]
    relay: Vec<String>,

    /// Bind QUIC to a fixed UDP port (for NAT port forwarding).
    #[arg(long)]
    bind_port: Option<u16>,

    /// Data directory for the key and peer registry (default: ~/.modelmesh).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modelmesh=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut served: HashMap<String, HashMap<String, ModelRecord>> = HashMap::new();
    for spec in &cli.serve {
        let (project, model, record) = parse_serve_spec(spec)?;
        served.entry(project).or_default().insert(model, record);
    }

    let secret = load_or_create_key(cli.data_dir.clone()).await?;
    let config = NodeConfig {
        secret,
        bind_port: cli.bind_port,
        relay_urls: cli.relay.clone(),
        join_tokens: cli.join.clone(),
        collect_metadata: cli.collect_metadata,
        public_node: cli.public,
        client_project: cli.client_project.clone(),
        heartbeat: Duration::from_secs(cli.heartbeat_secs.max(1)),
        db_path: RegistryStore::default_path(cli.data_dir.clone()),
    };

    let node = OverlayNode::start(config).await?;
    for (project, models) in served {
        for (model, record) in &models {
            eprintln!(
                "Serving {project}/{model} ({:?}) -> {}",
                record.kind, record.api_endpoint
            );
        }
        node.registry().register(&project, models);
    }

    eprintln!("Node id: {}", node.id());
    eprintln!("Invite token: {}", node.invite_token());
    if cli.join.is_empty() {
        eprintln!("Waiting for peers to join...");
    }

    let api_node = node.clone();
    let api_port = cli.port;
    let listen_all = cli.listen_all;
    tokio::spawn(async move {
        api::start(api_port, api_node, listen_all).await;
    });
    eprintln!("API: http://localhost:{api_port}/api/v0");

    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down...");
    node.shutdown().await;
    Ok(())
}

/// Parse "project:model:kind:endpoint". The endpoint itself contains ':',
/// so only the first three separators split.
fn parse_serve_spec(spec: &str) -> Result<(String, String, ModelRecord)> {
    let mut parts = spec.splitn(4, ':');
    let project = parts.next().unwrap_or("").to_string();
    let model = parts.next().unwrap_or("").to_string();
    let kind = parts.next().unwrap_or("");
    let endpoint = parts.next().unwrap_or("").to_string();
    if project.is_empty() || model.is_empty() || endpoint.is_empty() {
        anyhow::bail!("bad --serve spec '{spec}': want project:model:kind:endpoint");
    }
    let kind = match kind {
        "chat" => ModelKind::Chat,
        "image" => ModelKind::Image,
        other => anyhow::bail!("bad --serve kind '{other}': want chat or image"),
    };
    Ok((
        project,
        model,
        ModelRecord { api_endpoint: endpoint, kind, idle_count: 0 },
    ))
}

/// Load secret key from <data-dir>/key, or create a new one and save it.
async fn load_or_create_key(data_dir: Option<PathBuf>) -> Result<SecretKey> {
    let dir = match data_dir {
        Some(d) => d,
        None => dirs::home_dir()
            .context("Cannot determine home directory")?
            .join(".modelmesh"),
    };
    let key_path = dir.join("key");

    if key_path.exists() {
        let hex = tokio::fs::read_to_string(&key_path).await?;
        let bytes = hex::decode(hex.trim())?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid key length in {}", key_path.display()))?;
        let key = SecretKey::from_bytes(&bytes);
        tracing::info!("Loaded key from {}", key_path.display());
        return Ok(key);
    }

    let key = SecretKey::generate(&mut rand::rng());
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(&key_path, hex::encode(key.to_bytes())).await?;
    tracing::info!("Generated new key, saved to {}", key_path.display());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_spec_keeps_endpoint_colons() {
        let (project, model, record) =
            parse_serve_spec("cortex:llama3:chat:http://127.0.0.1:8080/v1/chat").unwrap();
        assert_eq!(project, "cortex");
        assert_eq!(model, "llama3");
        assert_eq!(record.kind, ModelKind::Chat);
        assert_eq!(record.api_endpoint, "http://127.0.0.1:8080/v1/chat");
    }

    #[test]
    fn serve_spec_rejects_bad_kind() {
        assert!(parse_serve_spec("p:m:audio:http://x").is_err());
        assert!(parse_serve_spec("p:m:chat").is_err());
    }
}
