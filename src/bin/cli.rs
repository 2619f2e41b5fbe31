//! Admin CLI talking to a coordinator over HTTP

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "rangeshift")]
#[command(about = "rangeshift migration admin CLI")]
#[command(version)]
struct Cli {
    /// Coordinator URL
    #[arg(long, default_value = "http://127.0.0.1:7070")]
    coordinator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Shard a collection on a key
    ShardCollection {
        namespace: String,
        /// Shard key fields (comma-separated)
        #[arg(long)]
        key: String,
    },

    /// Move one key range to another shard
    MoveRange {
        namespace: String,
        /// Lower bound (JSON value, `$min` or omitted)
        #[arg(long)]
        min: Option<String>,
        /// Upper bound (JSON value, `$max` or omitted)
        #[arg(long)]
        max: Option<String>,
        /// Destination shard
        #[arg(long)]
        to: String,
        /// Block until the operation finishes
        #[arg(long)]
        wait: bool,
    },

    /// Reshard a collection onto a new key
    Reshard {
        namespace: String,
        /// New shard key fields (comma-separated)
        #[arg(long)]
        key: String,
        /// Redistribute even if the key is unchanged
        #[arg(long)]
        force: bool,
        #[arg(long)]
        wait: bool,
    },

    /// Abort an operation by id or by namespace
    Abort {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },

    /// Show one operation
    Status { id: String },

    /// Block until an operation commits or aborts
    Wait {
        id: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// List operations
    List,

    /// Show routing tables
    Routing { namespace: Option<String> },

    /// Check document ownership of a collection
    Verify { namespace: String },

    /// Coordinator health
    Health,
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .with_context(|| format!("GET {}", path))?;
        Self::decode(response).await
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", path))?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> anyhow::Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let error = body["error"].as_str().unwrap_or("request failed");
            let kind = body["kind"].as_str().unwrap_or("unknown");
            bail!("{} ({}): {}", status, kind, error);
        }
        Ok(body)
    }
}

/// JSON if it parses, a plain string otherwise
fn bound(arg: Option<String>) -> Value {
    match arg {
        None => Value::Null,
        Some(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
    }
}

fn format_millis(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn print_status(status: &Value) {
    println!("Operation {}", status["operation_id"].as_str().unwrap_or("?"));
    println!("  Namespace: {}", status["namespace"].as_str().unwrap_or("?"));
    println!("  Type:      {}", status["operation_type"].as_str().unwrap_or("?"));
    println!("  State:     {}", status["state"].as_str().unwrap_or("?"));
    println!("  Elapsed:   {} ms", status["elapsed_ms"]);
    if let Some(eta) = status["estimated_time_remaining_ms"].as_u64() {
        println!("  ETA:       {} ms", eta);
    }
    if let Some(started) = status["critical_section_started_at"].as_u64() {
        println!("  Critical section since {}", format_millis(started));
    }
    if let Some(reason) = status.get("abort_reason").filter(|r| !r.is_null()) {
        println!("  Abort reason: {} ({})", reason["message"], reason["kind"]);
    }
    if let Some(phases) = status["phase_started_at"].as_object() {
        println!("  Phases:");
        for (phase, at) in phases {
            println!("    {:<18} {}", phase, format_millis(at.as_u64().unwrap_or(0)));
        }
    }
    if let Some(participants) = status["participants"].as_array() {
        println!("  Participants:");
        for p in participants {
            let mut line = format!(
                "    {:<10} {:<9} {}",
                p["shard_id"].as_str().unwrap_or("?"),
                p["role"].as_str().unwrap_or("?"),
                p["state"].as_str().unwrap_or("?"),
            );
            if let Some(remaining) = p["documents_remaining"].as_u64() {
                line.push_str(&format!("  remaining={}", remaining));
            }
            if let Some(lag) = p["lag_ms"].as_u64() {
                line.push_str(&format!("  lag={}ms", lag));
            }
            println!("{}", line);
        }
    }
}

async fn start(client: &Client, path: &str, body: Value, wait: bool) -> anyhow::Result<()> {
    let started = client.post(path, body).await?;
    if started["noop"].as_bool().unwrap_or(false) {
        println!("Nothing to do");
        return Ok(());
    }
    let id = started["operation_id"]
        .as_str()
        .context("coordinator returned no operation id")?
        .to_string();
    println!("Started operation {}", id);
    if wait {
        let done = client.get(&format!("/operations/{}/wait", id)).await?;
        println!("Outcome: {}", done["outcome"]);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = Client::new(&cli.coordinator);

    match cli.command {
        Commands::ShardCollection { namespace, key } => {
            let routing = client
                .post("/collections", json!({ "namespace": namespace, "key": key }))
                .await?;
            println!(
                "Sharded {} on {} (epoch {})",
                namespace, routing["key"], routing["epoch"]
            );
        }

        Commands::MoveRange {
            namespace,
            min,
            max,
            to,
            wait,
        } => {
            let body = json!({
                "namespace": namespace,
                "min": bound(min),
                "max": bound(max),
                "to_shard": to,
            });
            start(&client, "/operations/move-range", body, wait).await?;
        }

        Commands::Reshard {
            namespace,
            key,
            force,
            wait,
        } => {
            let body = json!({
                "namespace": namespace,
                "key": key,
                "force_redistribution": force,
            });
            start(&client, "/operations/reshard", body, wait).await?;
        }

        Commands::Abort {
            id,
            namespace,
            reason,
        } => {
            if id.is_none() && namespace.is_none() {
                bail!("pass --id or --namespace");
            }
            let aborted = client
                .post(
                    "/operations/abort",
                    json!({ "operation_id": id, "namespace": namespace, "reason": reason }),
                )
                .await?;
            println!("Abort requested for {}", aborted["operation_id"]);
        }

        Commands::Status { id } => {
            let status = client.get(&format!("/operations/{}", id)).await?;
            print_status(&status);
        }

        Commands::Wait { id, timeout_ms } => {
            let path = match timeout_ms {
                Some(ms) => format!("/operations/{}/wait?timeout_ms={}", id, ms),
                None => format!("/operations/{}/wait", id),
            };
            let done = client.get(&path).await?;
            println!("Outcome: {}", done["outcome"]);
        }

        Commands::List => {
            let listed = client.get("/operations").await?;
            for op in listed["operations"].as_array().into_iter().flatten() {
                println!(
                    "{}  {:<22} {:<10} {:<18} {} ms",
                    op["operation_id"].as_str().unwrap_or("?"),
                    op["namespace"].as_str().unwrap_or("?"),
                    op["operation_type"].as_str().unwrap_or("?"),
                    op["state"].as_str().unwrap_or("?"),
                    op["elapsed_ms"],
                );
            }
        }

        Commands::Routing { namespace } => {
            let tables = match namespace {
                Some(ns) => vec![client.get(&format!("/routing/{}", ns)).await?],
                None => client.get("/routing").await?["collections"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default(),
            };
            for table in tables {
                println!(
                    "{} key={} epoch={} physical={}",
                    table["namespace"].as_str().unwrap_or("?"),
                    table["key"],
                    table["epoch"],
                    table["physical"].as_str().unwrap_or("?"),
                );
                for chunk in table["chunks"].as_array().into_iter().flatten() {
                    println!(
                        "  [{}, {}) -> {}",
                        chunk["min"],
                        chunk["max"],
                        chunk["shard"].as_str().unwrap_or("?")
                    );
                }
            }
        }

        Commands::Verify { namespace } => {
            let report = client.get(&format!("/verify/{}", namespace)).await?;
            println!("Verification of {} at epoch {}:", namespace, report["epoch"]);
            println!("  Documents: {}", report["documents"]);
            println!("  Per shard: {}", report["per_shard"]);
            println!("  Duplicates: {}", report["duplicates"]);
            println!("  Misplaced: {}", report["misplaced"]);
            println!("  Missing shards: {}", report["missing_shards"]);
        }

        Commands::Health => {
            let health = client.get("/health").await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }

    Ok(())
}
