//! CLI surface (spec.md §6, §4.10): the default proxy-run action plus
//! the `sign`/`s` subcommand.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use crate::ca::CertMinter;
use crate::context::ProxyContext;
use crate::error::ProxyError;
use crate::queue::QueueClient;
use crate::rules::RuleStore;

#[derive(Parser)]
#[command(name = "freeproxy")]
#[command(about = "MITM HTTP/HTTPS/WebSocket proxy with rule-based capture and export")]
pub struct Cli {
    /// Upstream HTTP proxy URL.
    #[arg(short = 'p', long)]
    pub proxy: Option<String>,

    /// Bind address.
    #[arg(short = 'b', long, default_value = ":8080")]
    pub bind: String,

    /// Queue endpoint (host:port); omit to disable export.
    #[arg(short = 'r', long)]
    pub redis: Option<String>,

    /// Path to YAML rule file.
    #[arg(short = 'R', long)]
    pub rule: Option<PathBuf>,

    /// Verbosity: 0..3.
    #[arg(short = 'l', long, default_value_t = 1)]
    pub log: u8,

    /// Filter-mode global URI regex; overrides rule-file loading.
    #[arg(short = 'f', long)]
    pub filter: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Mint (or return, if already minted) a leaf certificate for a domain.
    #[command(alias = "s")]
    Sign { domain: String },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Some(Command::Sign { domain }) => rt.block_on(cmd_sign(&domain)),
        None => rt.block_on(cmd_serve(cli)),
    }
}

async fn cmd_sign(domain: &str) -> Result<()> {
    let minter = CertMinter::new();
    let (cert_path, key_path) = minter.ensure_pair(domain).await?;
    println!(
        "Signed {domain}: {} {}",
        cert_path.display(),
        key_path.display()
    );
    Ok(())
}

async fn cmd_serve(cli: Cli) -> Result<()> {
    // A malformed upstream proxy URL is a configuration error, fatal at
    // startup (spec.md §7 kind 1): surfaced through the typed hierarchy so
    // library callers can match on `ProxyError::Config` rather than a
    // string, then folded into `anyhow` at this top-level boundary.
    let upstream_proxy = cli
        .proxy
        .as_deref()
        .map(|raw| {
            Url::parse(raw).map_err(|e| ProxyError::Config(format!("invalid upstream proxy URL {raw:?}: {e}")))
        })
        .transpose()
        .context("startup configuration error")?;

    let rule_store = RuleStore::new(cli.rule.as_deref(), cli.filter.as_deref());

    let queue_client = match cli.redis.as_deref() {
        Some(addr) => Some(QueueClient::connect(addr).await.context("connect to redis")?),
        None => None,
    };

    let ctx = Arc::new(ProxyContext::new(
        cli.bind,
        upstream_proxy,
        rule_store,
        cli.log,
        queue_client,
    ));

    crate::listener::run(ctx).await
}
