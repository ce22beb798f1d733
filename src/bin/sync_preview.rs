use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crawler_sync::{
    ConfigOverrides, Crawler, Entity, EntityGraph, EntityHandle, MemoryRemote, RemoteStore,
    SyncConfig,
};

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"sync_preview - dry-run synchronization of a crawl

USAGE:
    sync_preview --remote <FILE> --crawled <FILE> [OPTIONS]

OPTIONS:
    -r, --remote <FILE>         Remote snapshot (JSON list of entities)
    -d, --crawled <FILE>        Crawled entities (JSON list; entity references are list positions)
    -i, --identifiables <FILE>  Registered identifiable definitions (JSON)
    -c, --config <FILE>         Path to config file (TOML)
    -h, --help                  Print help

ENVIRONMENT:
    RUST_LOG                    Log filter [default: info]
    CRAWLER_SYNC_CONFIG         Path to config file
"#
    );
}

#[derive(Debug, Serialize)]
struct PreviewEntry<'a> {
    handle: EntityHandle,
    entity: &'a Entity,
}

#[derive(Debug, Serialize)]
struct Preview<'a> {
    run_id: String,
    to_insert: Vec<PreviewEntry<'a>>,
    to_update: Vec<PreviewEntry<'a>>,
}

fn read_entities(path: &Path) -> Result<Vec<Entity>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read entities from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid entity list in {}", path.display()))
}

fn main() -> Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let remote_path = parse_arg("--remote")
        .or_else(|| parse_arg("-r"))
        .context("--remote is required")?;
    let crawled_path = parse_arg("--crawled")
        .or_else(|| parse_arg("-d"))
        .context("--crawled is required")?;

    let overrides = ConfigOverrides {
        commit_changes: Some(false),
        identifiables: parse_arg("--identifiables")
            .or_else(|| parse_arg("-i"))
            .map(Into::into),
        ..ConfigOverrides::default()
    };
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("CRAWLER_SYNC_CONFIG").ok());
    let config = SyncConfig::load(config_path.as_deref(), overrides)?;

    let remote: Arc<dyn RemoteStore> = Arc::new(MemoryRemote::from_entities(read_entities(
        Path::new(&remote_path),
    )?));
    let crawler = Crawler::from_config(&config, remote)?;

    let mut graph = EntityGraph::from_entities(read_entities(Path::new(&crawled_path))?)?;
    let roots: Vec<EntityHandle> = graph.handles().collect();
    let report = crawler.synchronize(&mut graph, &roots)?;

    let entries = |handles: &[EntityHandle]| {
        handles
            .iter()
            .map(|handle| PreviewEntry {
                handle: *handle,
                entity: graph.get(*handle),
            })
            .collect::<Vec<_>>()
    };
    let preview = Preview {
        run_id: crawler.run_id().to_string(),
        to_insert: entries(&report.to_insert),
        to_update: entries(&report.to_update),
    };
    println!("{}", serde_json::to_string_pretty(&preview)?);
    Ok(())
}
