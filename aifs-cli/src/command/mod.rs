use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use log::info;

use aifs::asset::AssetManager;
use aifs::auth::{Permission, TokenAuthority};
use aifs::codec::AssetKind;
use aifs::meta::ParentRef;
use aifs::uri;

use crate::config::ConfigLoad;
use crate::embedder::TextEmbedder;

#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum Command {
    /// Initialize storage under the configured root directory.
    Init,

    /// Print engine-wide status counters.
    Status,

    /// Store a file as an asset.
    Put {
        /// File to store.
        file: PathBuf,

        /// Asset kind: blob, tensor, embedding or artifact.
        #[clap(short, long, default_value = "blob")]
        kind: String,

        /// User metadata entries, repeatable, as key=value.
        #[clap(short, long = "meta")]
        meta: Vec<String>,

        /// Parent asset IDs, repeatable.
        #[clap(short, long = "parent")]
        parents: Vec<String>,

        /// Transform name recorded on the lineage edges.
        #[clap(long)]
        transform: Option<String>,

        /// Attach a hash-based embedding of the file contents.
        #[clap(long)]
        embed: bool,
    },

    /// Fetch an asset's bytes.
    Get {
        /// Asset ID or aifs:// URI.
        asset: String,

        /// Write to a file instead of stdout.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Check whether an asset exists and is visible.
    Exists { asset: String },

    /// Delete an asset.
    Delete {
        asset: String,

        /// Bypass the visible-children check (snapshot references always
        /// block deletion).
        #[clap(long)]
        force: bool,
    },

    /// Semantic search with the built-in text embedder.
    Search {
        text: String,

        #[clap(short, default_value = "10")]
        k: usize,
    },

    /// Snapshot operations.
    #[clap(subcommand)]
    Snapshot(SnapshotCommand),

    /// Branch operations.
    #[clap(subcommand)]
    Branch(BranchCommand),

    /// Tag operations.
    #[clap(subcommand)]
    Tag(TagCommand),

    /// Namespace operations.
    #[clap(subcommand)]
    Namespace(NamespaceCommand),

    /// Capability-token operations.
    #[clap(subcommand)]
    Token(TokenCommand),
}

#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum SnapshotCommand {
    /// Create a signed snapshot over asset IDs.
    Create { namespace: String, assets: Vec<String> },
    /// Show a snapshot (verified read path).
    Get { snapshot: String },
    /// Check a snapshot's signature.
    Verify { snapshot: String },
    /// List verified snapshots in a namespace.
    List { namespace: String },
}

#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum BranchCommand {
    /// Create a branch or move its head.
    Set { namespace: String, name: String, snapshot: String },
    Get { namespace: String, name: String },
    List { namespace: String },
    /// Show the audit history, newest first.
    History { namespace: String, name: String },
    Delete { namespace: String, name: String },
}

#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum TagCommand {
    Create { namespace: String, name: String, snapshot: String },
    Get { namespace: String, name: String },
    List { namespace: String },
    /// Refused unless tag deletion is enabled in the engine config.
    Delete { namespace: String, name: String },
}

#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum NamespaceCommand {
    Create {
        name: String,
        #[clap(short, long, default_value = "")]
        description: String,
    },
    List,
}

#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum TokenCommand {
    /// Issue a capability token under the local server secret.
    Create {
        /// Comma-separated permissions, e.g. put,get,search.
        #[clap(short, long)]
        permissions: String,

        #[clap(short, long)]
        namespace: Option<String>,

        /// Lifetime in seconds.
        #[clap(long, default_value = "86400")]
        ttl: i64,
    },
    /// Verify a token against required permissions.
    Verify {
        token: String,

        #[clap(short, long)]
        permissions: String,

        #[clap(short, long)]
        namespace: Option<String>,
    },
}

/// Executes one command against a freshly opened engine.
pub fn run(command: Command, cfg: &ConfigLoad) -> Result<()> {
    match command {
        Command::Token(token) => return run_token(token, cfg),
        command => {
            let engine = AssetManager::open(cfg.engine.clone())?;
            run_engine(command, &engine)
        }
    }
}

fn run_engine(command: Command, engine: &AssetManager) -> Result<()> {
    match command {
        Command::Init => {
            // Opening the engine created the layout; report where.
            println!("initialized storage at {:?}", engine.config().root_dir);
        }
        Command::Status => {
            let status = engine.status()?;
            println!("assets:               {}", status.assets);
            println!("namespaces:           {}", status.namespaces);
            println!("snapshots:            {}", status.snapshots);
            println!("vectors:              {}", status.vectors);
            println!("pending transactions: {}", status.pending_transactions);
            println!("chunks on disk:       {}", status.chunk_store.chunks);
            println!("logical bytes:        {}", status.chunk_store.logical_size);
            println!("disk bytes:           {}", status.chunk_store.total_disk_size);
            println!("strong causality:     {}", status.strong_causality);
        }
        Command::Put { file, kind, meta, parents, transform, embed } => {
            let data = std::fs::read(&file).with_context(|| format!("reading {:?}", file))?;
            let kind: AssetKind = kind.parse()?;
            let metadata = parse_metadata(&meta)?;
            let parents: Vec<ParentRef> = parents
                .into_iter()
                .map(|asset_id| ParentRef {
                    asset_id: strip_uri(&asset_id),
                    transform_name: transform.clone(),
                    transform_digest: None,
                })
                .collect();

            let embedding = embed.then(|| {
                TextEmbedder::new(engine.config().embedding_dim)
                    .embed(&String::from_utf8_lossy(&data))
            });

            let asset_id = engine.put_asset(
                &data,
                kind,
                embedding.as_deref(),
                Some(metadata),
                &parents,
                None,
            )?;
            info!("stored {:?} as {}", file, asset_id);
            println!("{}", uri::asset_uri(&asset_id)?);
        }
        Command::Get { asset, output } => {
            let asset_id = strip_uri(&asset);
            let Some(asset) = engine.get_asset(&asset_id)? else {
                bail!("asset {} not found", asset_id);
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, &asset.data)?;
                    println!("wrote {} bytes to {:?}", asset.data.len(), path);
                }
                None => std::io::stdout().write_all(&asset.data)?,
            }
        }
        Command::Exists { asset } => {
            let asset_id = strip_uri(&asset);
            println!("{}", engine.get_asset(&asset_id)?.is_some());
        }
        Command::Delete { asset, force } => {
            let asset_id = strip_uri(&asset);
            if engine.delete_asset(&asset_id, force)? {
                println!("deleted {}", asset_id);
            } else {
                println!("not found: {}", asset_id);
            }
        }
        Command::Search { text, k } => {
            let query = TextEmbedder::new(engine.config().embedding_dim).embed(&text);
            for hit in engine.vector_search(&query, k)? {
                println!("{}\t{:.6}\t{}", hit.asset.asset_id, hit.distance, hit.asset.kind);
            }
        }
        Command::Snapshot(snapshot) => run_snapshot(snapshot, engine)?,
        Command::Branch(branch) => run_branch(branch, engine)?,
        Command::Tag(tag) => run_tag(tag, engine)?,
        Command::Namespace(namespace) => run_namespace(namespace, engine)?,
        Command::Token(_) => unreachable!("token commands do not open the engine"),
    }
    Ok(())
}

fn run_snapshot(command: SnapshotCommand, engine: &AssetManager) -> Result<()> {
    match command {
        SnapshotCommand::Create { namespace, assets } => {
            let assets: Vec<String> = assets.iter().map(|a| strip_uri(a)).collect();
            let snapshot = engine.create_snapshot(&namespace, &assets, None, None)?;
            info!("created snapshot {} over {} assets", snapshot.snapshot_id, assets.len());
            println!("{}", uri::snapshot_uri(&snapshot.snapshot_id)?);
        }
        SnapshotCommand::Get { snapshot } => {
            let snapshot_id = strip_snapshot_uri(&snapshot);
            let record = engine.get_verified_snapshot(&snapshot_id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        SnapshotCommand::Verify { snapshot } => {
            let snapshot_id = strip_snapshot_uri(&snapshot);
            println!("{}", engine.verify_snapshot(&snapshot_id)?);
        }
        SnapshotCommand::List { namespace } => {
            for record in engine.list_verified_snapshots(Some(&namespace), 100, 0)? {
                println!("{}\t{}\t{}", record.snapshot_id, record.created_at, record.asset_ids.len());
            }
        }
    }
    Ok(())
}

fn run_branch(command: BranchCommand, engine: &AssetManager) -> Result<()> {
    match command {
        BranchCommand::Set { namespace, name, snapshot } => {
            let branch =
                engine.update_branch(&namespace, &name, &strip_snapshot_uri(&snapshot), None)?;
            println!("{} -> {}", branch.branch_name, branch.snapshot_id);
        }
        BranchCommand::Get { namespace, name } => match engine.get_branch(&namespace, &name)? {
            Some(branch) => println!("{}", serde_json::to_string_pretty(&branch)?),
            None => bail!("branch {:?} not found in {:?}", name, namespace),
        },
        BranchCommand::List { namespace } => {
            for branch in engine.list_branches(&namespace)? {
                println!("{}\t{}", branch.branch_name, branch.snapshot_id);
            }
        }
        BranchCommand::History { namespace, name } => {
            for entry in engine.branch_history(&namespace, &name, 100, 0)? {
                println!(
                    "{}\t{} -> {}",
                    entry.updated_at,
                    entry.old_snapshot_id.as_deref().unwrap_or("(created)"),
                    entry.new_snapshot_id
                );
            }
        }
        BranchCommand::Delete { namespace, name } => {
            if engine.delete_branch(&namespace, &name)? {
                println!("deleted branch {}", name);
            } else {
                println!("not found: {}", name);
            }
        }
    }
    Ok(())
}

fn run_tag(command: TagCommand, engine: &AssetManager) -> Result<()> {
    match command {
        TagCommand::Create { namespace, name, snapshot } => {
            let tag = engine.create_tag(&namespace, &name, &strip_snapshot_uri(&snapshot), None)?;
            println!("{} -> {}", tag.tag_name, tag.snapshot_id);
        }
        TagCommand::Get { namespace, name } => match engine.get_tag(&namespace, &name)? {
            Some(tag) => println!("{}", serde_json::to_string_pretty(&tag)?),
            None => bail!("tag {:?} not found in {:?}", name, namespace),
        },
        TagCommand::List { namespace } => {
            for tag in engine.list_tags(&namespace)? {
                println!("{}\t{}", tag.tag_name, tag.snapshot_id);
            }
        }
        TagCommand::Delete { namespace, name } => {
            if engine.delete_tag(&namespace, &name)? {
                println!("deleted tag {}", name);
            } else {
                println!("not found: {}", name);
            }
        }
    }
    Ok(())
}

fn run_namespace(command: NamespaceCommand, engine: &AssetManager) -> Result<()> {
    match command {
        NamespaceCommand::Create { name, description } => {
            let namespace = engine.create_namespace(&name, &description, None)?;
            let public_key = engine.register_namespace_key(&name)?;
            println!("{}\tsigning key {}", namespace.name, public_key);
        }
        NamespaceCommand::List => {
            for namespace in engine.list_namespaces()? {
                println!("{}\t{}", namespace.name, namespace.created_at);
            }
        }
    }
    Ok(())
}

fn run_token(command: TokenCommand, cfg: &ConfigLoad) -> Result<()> {
    let authority = TokenAuthority::new(load_or_create_secret(&cfg.engine.root_dir)?);
    match command {
        TokenCommand::Create { permissions, namespace, ttl } => {
            let permissions = parse_permissions(&permissions)?;
            let token = authority.issue(&permissions, namespace.as_deref(), Some(ttl))?;
            println!("{}", token);
        }
        TokenCommand::Verify { token, permissions, namespace } => {
            let permissions = parse_permissions(&permissions)?;
            match authority.verify(&token, &permissions, namespace.as_deref()) {
                Ok(claims) => println!("ok: token {}", claims.token_id),
                Err(err) => bail!("verification failed: {}", err),
            }
        }
    }
    Ok(())
}

/// The server-held token secret, generated on first use.
fn load_or_create_secret(root_dir: &std::path::Path) -> Result<[u8; 32]> {
    let path = root_dir.join("auth.secret");
    if path.exists() {
        let bytes = std::fs::read(&path)?;
        return bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("auth secret at {:?} is not 32 bytes", path));
    }
    std::fs::create_dir_all(root_dir)?;
    let mut secret = [0u8; 32];
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(&mut secret);
    std::fs::write(&path, secret)?;
    Ok(secret)
}

fn parse_permissions(input: &str) -> Result<Vec<Permission>> {
    input
        .split(',')
        .filter(|part| !part.is_empty())
        .map(|part| part.trim().parse::<Permission>().map_err(Into::into))
        .collect()
}

fn parse_metadata(entries: &[String]) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("metadata entry {:?} is not key=value", entry);
        };
        metadata.insert(key.to_string(), value.to_string());
    }
    Ok(metadata)
}

/// Accepts bare IDs or aifs:// URIs.
fn strip_uri(input: &str) -> String {
    uri::parse_asset_uri(input).unwrap_or_else(|_| input.to_string())
}

fn strip_snapshot_uri(input: &str) -> String {
    uri::parse_snapshot_uri(input).unwrap_or_else(|_| input.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_metadata_entries() -> Result<()> {
        let metadata = parse_metadata(&["a=1".to_string(), "b=x=y".to_string()])?;
        assert_eq!(metadata["a"], "1");
        assert_eq!(metadata["b"], "x=y");
        assert!(parse_metadata(&["broken".to_string()]).is_err());
        Ok(())
    }

    #[test]
    fn parse_permission_lists() -> Result<()> {
        let permissions = parse_permissions("put, get,search")?;
        assert_eq!(permissions, vec![Permission::Put, Permission::Get, Permission::Search]);
        assert!(parse_permissions("fly").is_err());
        Ok(())
    }

    #[test]
    fn uris_and_bare_ids_are_accepted() {
        let id = blake3::hash(b"x").to_hex().to_string();
        assert_eq!(strip_uri(&format!("aifs://{}", id)), id);
        assert_eq!(strip_uri(&id), id);
    }
}
