//! Environment-driven configuration via `dotenvy` + `anyhow::Context`.

use std::env;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub hostname: String,
    pub peer_port: u16,
    pub worker_port: u16,
    pub queue_process_timeout_secs: i64,
    /// Comma-separated `host:port` pairs used only for first contact;
    /// steady-state peer discovery is via `NODE_INFO` polling (§4.6).
    pub peer_seeds: Vec<(String, u16)>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let peer_seeds = env::var("MESHQUEUE_PEER_SEEDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_seed)
            .collect::<Result<Vec<_>>>()
            .context("MESHQUEUE_PEER_SEEDS must be a comma-separated list of host:port")?;

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            hostname: env::var("MESHQUEUE_HOSTNAME")
                .unwrap_or_else(|_| hostname_fallback()),
            peer_port: env::var("MESHQUEUE_PEER_PORT")
                .unwrap_or_else(|_| "7100".to_string())
                .parse()
                .context("MESHQUEUE_PEER_PORT must be a valid port")?,
            worker_port: env::var("MESHQUEUE_WORKER_PORT")
                .unwrap_or_else(|_| "7200".to_string())
                .parse()
                .context("MESHQUEUE_WORKER_PORT must be a valid port")?,
            queue_process_timeout_secs: env::var("MESHQUEUE_QUEUE_PROCESS_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("MESHQUEUE_QUEUE_PROCESS_TIMEOUT_SECS must be a valid integer")?,
            peer_seeds,
        })
    }
}

fn parse_seed(raw: &str) -> Result<(String, u16)> {
    let (host, port) = raw
        .rsplit_once(':')
        .with_context(|| format!("peer seed `{raw}` must be host:port"))?;
    Ok((host.to_string(), port.parse().context("peer seed port must be numeric")?))
}

fn hostname_fallback() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
