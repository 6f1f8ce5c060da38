//! relay-cli: operator CLI for the alert relay HTTP API
//!
//! # Subcommands
//! - `status`: show server health
//! - `sessions [--json]`: list registered sessions
//! - `poll`: run one polling cycle now and print its report

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8780";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "relay-cli", version, about = "Alert relay operator CLI")]
struct Cli {
    /// Relay HTTP server URL (overrides RELAY_HTTP_URL env var)
    #[arg(long, env = "RELAY_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show relay server status
    Status,

    /// List registered sessions
    Sessions {
        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Run one polling cycle immediately
    Poll,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub client_id: i64,
    pub registered_at: String,
    pub last_delivered_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SessionsResponse {
    pub count: usize,
    pub sessions: Vec<SessionRow>,
}

#[derive(Debug, Deserialize)]
pub struct CycleReport {
    pub sessions: usize,
    pub sessions_idle: usize,
    pub sessions_advanced: usize,
    pub sessions_failed: usize,
    pub alerts_fetched: usize,
    pub alerts_sent: usize,
    pub alerts_failed: usize,
    pub alerts_below_floor: usize,
    #[serde(default)]
    pub alerts_deferred: usize,
    pub elapsed_ms: u64,
}

/// One aligned line per session.
pub fn format_session_row(row: &SessionRow) -> String {
    format!(
        "{:<14} client={:<8} cursor={:<10} registered={}",
        row.session_id, row.client_id, row.last_delivered_id, row.registered_at
    )
}

pub fn format_report(report: &CycleReport) -> String {
    [
        format!(
            "Sessions: {} ({} advanced, {} idle, {} failed)",
            report.sessions, report.sessions_advanced, report.sessions_idle, report.sessions_failed
        ),
        format!(
            "Alerts:   {} fetched, {} sent, {} failed, {} below floor, {} deferred",
            report.alerts_fetched,
            report.alerts_sent,
            report.alerts_failed,
            report.alerts_below_floor,
            report.alerts_deferred
        ),
        format!("Took:     {} ms", report.elapsed_ms),
    ]
    .join("\n")
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(10)?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Relay server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:      {}", body["version"].as_str().unwrap_or("?"));
            println!("Store:        {}", body["store"].as_str().unwrap_or("?"));
            println!("Sessions:     {}", body["sessions"].as_u64().unwrap_or(0));
        }
        Ok(r) => {
            let status = r.status();
            let body: serde_json::Value = r.json().unwrap_or_default();
            eprintln!(
                "relay-cli: server unhealthy (HTTP {}): {}",
                status,
                body["error"].as_str().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("relay-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn do_sessions(server: &str, json_output: bool) -> anyhow::Result<()> {
    let url = format!("{}/sessions", server);
    let resp = match client(10)?.get(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("relay-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("relay-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }

    if json_output {
        let body: serde_json::Value = resp.json()?;
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let listing: SessionsResponse = resp.json()?;
    if listing.sessions.is_empty() {
        eprintln!("No sessions registered");
        return Ok(());
    }
    for row in &listing.sessions {
        println!("{}", format_session_row(row));
    }
    println!("\n{} session(s)", listing.count);

    Ok(())
}

fn do_poll(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/poll", server);
    // A full cycle can take a while with many sessions.
    let resp = match client(300)?.post(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("relay-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("relay-cli: poll failed ({}): {}", status, body);
        std::process::exit(1);
    }

    let report: CycleReport = resp.json()?;
    println!("{}", format_report(&report));
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Status => do_status(&server),
        Commands::Sessions { json } => do_sessions(&server, json),
        Commands::Poll => do_poll(&server),
    };

    if let Err(e) = result {
        eprintln!("relay-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
