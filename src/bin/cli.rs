//! CLI for quorumkv nodes

use clap::{Parser, Subcommand};
use quorumkv::common::encode_key;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "quorumkv")]
#[command(about = "quorumkv replicated key-value store CLI")]
#[command(version)]
struct Cli {
    /// Node URL (writes go to the leader, reads to a follower)
    #[arg(long, default_value = "http://localhost:8081")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a value (leader only)
    Put {
        /// Key
        key: String,

        /// Value
        value: String,
    },

    /// Read a value (followers only)
    Get {
        /// Key
        key: String,
    },

    /// Delete a key (leader only)
    Delete {
        /// Key
        key: String,
    },

    /// Show node role, membership and WAL state
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let base = cli.node.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Put { key, value } => {
            let url = format!("{}/kv/{}", base, encode_key(&key));
            let body = check(client.post(url).body(value).send().await?).await?;
            println!("PUT {} committed at version {}", key, body["version"]);
        }

        Commands::Get { key } => {
            let url = format!("{}/kv/{}", base, encode_key(&key));
            let body = check(client.get(url).send().await?).await?;
            match body["value"].as_str() {
                Some(value) => println!("{}", value),
                None => println!("{}", body),
            }
        }

        Commands::Delete { key } => {
            let url = format!("{}/kv/{}", base, encode_key(&key));
            let body = check(client.delete(url).send().await?).await?;
            println!("DELETE {} committed at version {}", key, body["version"]);
        }

        Commands::Status => {
            let body = check(client.get(format!("{}/admin/status", base)).send().await?).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}

/// Turn an error response into a readable failure, with a hint per kind.
async fn check(response: reqwest::Response) -> anyhow::Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(body);
    }

    let message = body["error"].as_str().unwrap_or("request failed");
    let hint = match body["kind"].as_str() {
        Some("role_violation") => " (try another node)",
        Some("version_conflict") => " (leadership may be stale, do not retry blindly)",
        _ if body["retryable"].as_bool() == Some(true) => " (transient, retry)",
        _ => "",
    };
    anyhow::bail!("{}: {}{}", status, message, hint)
}
