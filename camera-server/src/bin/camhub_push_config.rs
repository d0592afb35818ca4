//! Push a camera configuration file to a running camhub server.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, Level};
use ureq::Agent;

#[derive(Parser, Debug)]
#[command(author, version, about = "POST a camera.json to a camhub server")]
struct Args {
    /// Server address as host:port
    #[arg(long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Route prefix the server was started with
    #[arg(long, default_value = "/")]
    path_prefix: String,

    /// API key sent as X-Api-Key
    #[arg(long, env = "CAMHUB_API_KEY")]
    api_key: String,

    /// Configuration file to send (full or partial)
    #[arg(long, default_value = "camera.json")]
    config: PathBuf,

    /// Request timeout in seconds; reloads wait for the camera to reopen
    #[arg(long, default_value = "30")]
    timeout_secs: u64,
}

fn config_url(server: &str, prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("http://{server}/v1/config")
    } else {
        format!("http://{server}/{prefix}/v1/config")
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
    let args = Args::parse();

    let body = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read {}", args.config.display()))?;
    serde_json::from_str::<serde_json::Value>(&body)
        .with_context(|| format!("{} is not valid JSON", args.config.display()))?;

    let agent: Agent = Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(args.timeout_secs)))
        .build()
        .into();

    let url = config_url(&args.server, &args.path_prefix);
    info!("pushing {} to {url}", args.config.display());
    let mut response = agent
        .post(&url)
        .header("X-Api-Key", &args.api_key)
        .header("Content-Type", "application/json")
        .send(body.as_str())
        .with_context(|| format!("request to {url} failed"))?;

    let status = response.status();
    let text = response
        .body_mut()
        .read_to_string()
        .context("failed to read response body")?;
    println!("{text}");

    if !status.is_success() {
        bail!("server answered {status}");
    }
    Ok(())
}
