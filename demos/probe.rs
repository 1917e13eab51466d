//! Probe - send one message to a line-oriented TCP service.
//!
//! This demo shows:
//! - Building a session configuration from the command line
//! - Sending a message and printing the response
//! - Cancelling the request on Ctrl-C
//!
//! # Running
//!
//! ```text
//! RUST_LOG=linewire_client=debug cargo run --example probe -- 127.0.0.1 7000 status -p OK -p ERROR
//! ```

use std::time::Duration;

use clap::Parser;
use linewire_client::{Session, SessionConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Send one line and print the response")]
struct Args {
    /// Host name or address.
    host: String,
    /// TCP port.
    port: u16,
    /// Message to send (a newline is appended).
    message: String,
    /// Termination pattern (repeatable). Defaults to "end" and "err".
    #[arg(short = 'p', long = "pattern")]
    patterns: Vec<String>,
    /// Timeout in milliseconds.
    #[arg(short, long, default_value_t = 5000)]
    timeout_ms: u64,
    /// Only stop on "<pattern> <message>", never on the bare pattern.
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut builder = SessionConfig::builder()
        .connection_timeout(Duration::from_millis(args.timeout_ms))
        .match_bare_pattern(!args.strict);
    if !args.patterns.is_empty() {
        builder = builder.termination_patterns(args.patterns);
    }
    let session = Session::with_config(args.host, args.port, builder.build()?);

    let canceller = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let response = session.send(args.message).await?;
    print!("{}", String::from_utf8_lossy(&response));

    Ok(())
}
