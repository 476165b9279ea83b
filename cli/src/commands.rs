use anyhow::{Context, bail};
use chrono::{TimeZone, Utc};
use reqwest::blocking::Client;
use serde_json::{Value, json};
use syncpoint_core::block::BlockHash;
use syncpoint_core::checkpoint::CheckpointStatus;

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Show the node's active sync checkpoint
    #[command(name = "getcheckpoint")]
    GetCheckpoint,

    /// Sign and broadcast a checkpoint for a block (master node only)
    #[command(name = "sendcheckpoint")]
    SendCheckpoint { hash: String },

    /// Install the checkpoint master private key on the node
    #[command(name = "setcheckpointkey")]
    SetCheckpointKey { key: String },

    /// Manage CLI configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
pub enum ConfigCommands {
    View,
    Set { key: String, value: String },
    Init,
}

pub fn get_checkpoint(node_url: &str) -> anyhow::Result<()> {
    let url = format!("{}/checkpoint", node_url);
    let status: CheckpointStatus = Client::new()
        .get(&url)
        .send()
        .with_context(|| format!("query {} failed", url))?
        .error_for_status()?
        .json()
        .context("failed to parse checkpoint status")?;
    print!("{}", render_status(&status));
    Ok(())
}

pub fn send_checkpoint(node_url: &str, hash: &str) -> anyhow::Result<()> {
    // reject typos locally before bothering the node
    let hash: BlockHash = hash
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid block hash {}: {}", hash, e))?;
    let body = post(
        &format!("{}/checkpoint/send", node_url),
        &json!({ "hash": hash.to_string() }),
    )?;
    match body["status"].as_str() {
        Some("sent") => println!("✅ Checkpoint {} sent", hash),
        Some("no_peers") => println!("⚠️  No peers connected, checkpoint not sent"),
        Some("null_checkpoint") => println!("⚠️  Zero hash, nothing to send"),
        Some(other) => println!("Checkpoint {}: {}", hash, other),
        None => bail!("unexpected response: {}", body),
    }
    Ok(())
}

pub fn set_checkpoint_key(node_url: &str, key: &str) -> anyhow::Result<()> {
    let body = post(
        &format!("{}/checkpoint/key", node_url),
        &json!({ "key": key }),
    )?;
    if body["master"].as_bool() != Some(true) {
        bail!("node did not accept the checkpoint key: {}", body);
    }
    println!("✅ Checkpoint master key installed");
    Ok(())
}

fn post(url: &str, payload: &Value) -> anyhow::Result<Value> {
    let res = Client::new()
        .post(url)
        .json(payload)
        .send()
        .with_context(|| format!("request to {} failed", url))?;
    let ok = res.status().is_success();
    let body: Value = res.json().context("failed to parse node response")?;
    if !ok || body["status"] == "error" {
        bail!(
            "node rejected request: {}",
            body["message"].as_str().unwrap_or("unknown error")
        );
    }
    Ok(body)
}

pub fn render_status(status: &CheckpointStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!("synccheckpoint: {}\n", status.active));
    if let Some(height) = status.height {
        out.push_str(&format!("height:         {}\n", height));
    }
    if let Some(ts) = status.timestamp.and_then(|t| Utc.timestamp_opt(t, 0).single()) {
        out.push_str(&format!("timestamp:      {}\n", ts.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    out.push_str(&format!("policy:         {}\n", status.policy));
    if let Some(pending) = &status.pending {
        out.push_str(&format!("pending:        {}\n", pending));
    }
    if status.master {
        out.push_str("checkpointmaster: true\n");
    }
    if let Some(warning) = &status.warning {
        out.push_str(&format!("warning:        {}\n", warning));
    }
    out
}
