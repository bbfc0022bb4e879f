use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewarden::config::WardenConfig;
use ratewarden::identity::{ClientIdentityResolver, FORWARDED_FOR_HEADER, REAL_IP_HEADER};
use ratewarden::ratelimit::{Category, Decision, MemoryStore, RateLimiter, RateLimiterBuilder};

/// Inspect and exercise rate limiting decisions.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the identifier a request would be counted under
    Resolve(HeaderArgs),

    /// Run a burst of requests and print each decision
    Simulate {
        /// Endpoint category
        #[arg(long, default_value = "default")]
        category: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        requests: u32,

        /// Count in process memory instead of the configured store
        #[arg(long)]
        memory_store: bool,

        #[command(flatten)]
        headers: HeaderArgs,
    },
}

#[derive(Debug, clap::Args)]
struct HeaderArgs {
    /// Value of the X-Real-IP header
    #[arg(long)]
    real_ip: Option<String>,

    /// Value of the X-Forwarded-For header
    #[arg(long)]
    forwarded_for: Option<String>,
}

impl HeaderArgs {
    fn to_headers(&self) -> Vec<(&str, &str)> {
        let mut headers = Vec::new();
        if let Some(ip) = &self.real_ip {
            headers.push((REAL_IP_HEADER, ip.as_str()));
        }
        if let Some(chain) = &self.forwarded_for {
            headers.push((FORWARDED_FOR_HEADER, chain.as_str()));
        }
        headers
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = WardenConfig::load(cli.config.as_deref())?;
    info!(
        environment = ?config.environment,
        store_configured = config.store.url.is_some(),
        "Configuration loaded"
    );

    match cli.command {
        Command::Resolve(args) => {
            let resolver = ClientIdentityResolver::new(&config.identity);
            println!("{}", resolver.resolve(args.to_headers().as_slice()));
        }
        Command::Simulate {
            category,
            requests,
            memory_store,
            headers,
        } => {
            let category: Category = category.parse()?;
            let limiter = if memory_store {
                RateLimiterBuilder::from_config(&config)?
                    .store(Arc::new(MemoryStore::new()))
                    .build()
            } else {
                RateLimiter::from_config(&config)?
            };
            info!(category = %category, requests, "Rate limiter initialized");

            let headers = headers.to_headers();
            for n in 1..=requests {
                let decision = limiter.rate_limit(headers.as_slice(), category).await;
                let line = match &decision {
                    Decision::Admitted { headers } => serde_json::json!({
                        "request": n,
                        "status": 200,
                        "headers": headers,
                    }),
                    Decision::Denied(denial) => serde_json::json!({
                        "request": n,
                        "status": denial.status,
                        "headers": denial.headers,
                        "body": denial.body,
                    }),
                };
                println!("{}", line);
            }
        }
    }

    Ok(())
}
