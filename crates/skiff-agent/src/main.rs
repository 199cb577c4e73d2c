mod agent;
mod anomaly;
mod cli;
mod supervise;

use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    let code = agent::run(cli).await;
    std::process::exit(code);
}
