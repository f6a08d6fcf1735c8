mod cli;

use clap::Parser;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    if let Err(err) = cli::run(cli).await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}
