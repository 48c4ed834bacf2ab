use std::time::Duration;

use clap::Parser;
use redis_conduit::{PoolRegistry, RedisOptions, Reply};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "conduit-cli",
    version,
    about = "Issue a single Redis command over a pooled RESP2/RESP3 connection"
)]
struct Args {
    /// Connection string, e.g. localhost:6379 or host:6379,MaxPoolSize=4
    connection_string: String,

    /// The command and its arguments, e.g. GET mykey
    #[arg(required = true)]
    command: Vec<String>,

    /// How long to wait for a pooled connection.
    #[arg(long, default_value_t = 5000)]
    rent_timeout_ms: u64,

    /// Username for AUTH (requires --password).
    #[arg(long)]
    username: Option<String>,

    /// Password for AUTH.
    #[arg(long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();

    let mut options = RedisOptions::from_connection_string(&args.connection_string)?;
    if let Some(password) = args.password {
        options.set_credentials(args.username, password)?;
    }

    let registry = PoolRegistry::new();
    registry.add("cli", options);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        }
    });

    let mut conn = registry
        .rent("cli", Duration::from_millis(args.rent_timeout_ms), &cancel)
        .await?;
    let reply = conn.issue(&args.command, &cancel).await?;

    println!("{}", render(&reply));
    Ok(())
}

/// redis-cli style rendering.
fn render(reply: &Reply) -> String {
    match reply {
        Reply::Simple(s) => String::from_utf8_lossy(s).into_owned(),
        Reply::Error(e) => format!("(error) {}", String::from_utf8_lossy(e)),
        Reply::Integer(i) => format!("(integer) {i}"),
        Reply::Bulk(b) => format!("{:?}", String::from_utf8_lossy(b)),
        Reply::Null => "(nil)".to_string(),
        Reply::Boolean(true) => "(true)".to_string(),
        Reply::Boolean(false) => "(false)".to_string(),
        Reply::Double(d) => format!("(double) {d}"),
        Reply::BigNumber(n) => format!("(big number) {}", String::from_utf8_lossy(n)),
        Reply::Verbatim { format, text } => format!(
            "({}) {}",
            String::from_utf8_lossy(format),
            String::from_utf8_lossy(text)
        ),
        Reply::Array(items) | Reply::Set(items) | Reply::Push(items) => {
            if items.is_empty() {
                return "(empty)".to_string();
            }
            items
                .iter()
                .enumerate()
                .map(|(i, item)| format!("{}) {}", i + 1, render(item)))
                .collect::<Vec<_>>()
                .join("\n")
        }
        Reply::Map(pairs) => pairs
            .iter()
            .map(|(k, v)| format!("{} => {}", render(k), render(v)))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
