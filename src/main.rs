use clap::Parser;
use log::error;

use chess_lobby_lib::config::Cli;

#[tokio::main]
async fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let cli = Cli::parse();
    if let Err(e) = chess_lobby_lib::run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
