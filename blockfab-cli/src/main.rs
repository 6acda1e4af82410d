mod cli;
mod cow;
mod serve;
mod tools;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(cmd) => serve::run(cmd).await,
        Commands::Cow(cmd) => cow::run(cmd).await,
        Commands::Crc(cmd) => tools::generate_crc(cmd),
        Commands::Create(cmd) => tools::create_image(cmd),
    }
}
