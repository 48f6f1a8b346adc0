use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gate-cli")]
#[command(about = "Management CLI for tool-gate", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081", env = "TOOL_GATE_ADMIN_URL")]
    url: String,

    #[arg(short, long, env = "TOOL_GATE_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Health, degradation level and queue length
    Status,
    /// Security event aggregates for the last 24 hours
    SecurityMetrics,
    /// Security report with trends and recommendations
    SecurityReport,
    /// Rate limiter windows and busiest operations
    RateLimits,
    /// Per-cache statistics
    Cache,
    /// Latency, in-flight operations and resource usage
    Performance,
}

impl Commands {
    fn path(&self) -> &'static str {
        match self {
            Commands::Status => "/admin/status",
            Commands::SecurityMetrics => "/admin/security/metrics",
            Commands::SecurityReport => "/admin/security/report",
            Commands::RateLimits => "/admin/rate-limits",
            Commands::Cache => "/admin/cache",
            Commands::Performance => "/admin/performance",
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let res = client
        .get(format!("{}{}", cli.url.trim_end_matches('/'), cli.command.path()))
        .headers(headers)
        .send()
        .await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
