use clap::Parser;
use tracing_subscriber::EnvFilter;

use parley::cli::{run_chat, Args};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run_chat(args).await
}
