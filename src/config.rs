//! Command line and environment configuration.
//!
//! Every flag can also be set through a `CHESS_LOBBY_*` variable.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use derivative::Derivative;

use crate::engine::{
    types::{DEFAULT_SEARCH_TIMEOUT, MAX_SKILL_LEVEL},
    EngineSettings,
};

#[derive(Parser, Debug)]
#[command(name = "chess-lobby", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the websocket gateway
    Serve {
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Run one engine search and print the result as JSON
    Search {
        #[command(flatten)]
        engine: EngineArgs,
        /// Position to search; the start position when omitted
        #[arg(long)]
        fen: Option<String>,
        /// Moves to replay first, coordinate notation
        #[arg(long, value_delimiter = ',')]
        moves: Vec<String>,
        #[arg(long)]
        depth: Option<u32>,
        #[arg(long)]
        movetime_ms: Option<u64>,
        #[arg(long)]
        multipv: Option<u16>,
    },
    /// Review the mainline of a PGN file and print the report as JSON
    Analyze {
        #[command(flatten)]
        engine: EngineArgs,
        pgn: PathBuf,
        #[arg(long, default_value_t = 12)]
        depth: u32,
        #[arg(long)]
        multipv: Option<u16>,
        #[arg(long)]
        max_plies: Option<usize>,
    },
    /// Download an engine binary and mark it executable
    InstallEngine {
        url: String,
        dest: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    #[arg(long, env = "CHESS_LOBBY_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,
    /// Seconds a disconnected player keeps their seat
    #[arg(long, env = "CHESS_LOBBY_DISCONNECT_GRACE", default_value_t = 60)]
    pub disconnect_grace: u64,
    #[arg(long, env = "CHESS_LOBBY_PING_INTERVAL", default_value_t = 30)]
    pub ping_interval: u64,
    #[arg(long, env = "CHESS_LOBBY_PONG_GRACE", default_value_t = 10)]
    pub pong_grace: u64,
    #[arg(long, env = "CHESS_LOBBY_IDLE_RETENTION", default_value_t = 3600)]
    pub idle_retention: u64,
    #[arg(long, env = "CHESS_LOBBY_IDLE_SWEEP", default_value_t = 300)]
    pub idle_sweep_interval: u64,
    /// Inbound frames allowed per second on one connection
    #[arg(long, env = "CHESS_LOBBY_RATE_LIMIT", default_value_t = 20)]
    pub messages_per_second: u32,
    /// Accepted bearer tokens as `TOKEN=ACCOUNT`, comma separated
    #[arg(
        long,
        env = "CHESS_LOBBY_AUTH_TOKENS",
        value_delimiter = ',',
        value_parser = parse_token_pair
    )]
    pub auth_tokens: Vec<(String, String)>,
}

#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    #[arg(long, env = "CHESS_LOBBY_ENGINE")]
    pub engine: Option<PathBuf>,
    /// Seconds before a search is abandoned
    #[arg(long, env = "CHESS_LOBBY_ENGINE_TIMEOUT", default_value_t = DEFAULT_SEARCH_TIMEOUT.as_secs())]
    pub engine_timeout: u64,
    #[arg(long, env = "CHESS_LOBBY_ENGINE_SKILL", default_value_t = MAX_SKILL_LEVEL)]
    pub skill: u8,
}

fn parse_token_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((token, account)) if !token.is_empty() && !account.is_empty() => {
            Ok((token.trim().to_string(), account.trim().to_string()))
        }
        _ => Err(format!("expected TOKEN=ACCOUNT, got {raw:?}")),
    }
}

#[derive(Debug, Clone, Derivative)]
#[derivative(Default)]
pub struct ServerConfig {
    #[derivative(Default(value = "SocketAddr::from(([127, 0, 0, 1], 8080))"))]
    pub bind: SocketAddr,
    #[derivative(Default(value = "Duration::from_secs(60)"))]
    pub disconnect_grace: Duration,
    #[derivative(Default(value = "Duration::from_secs(30)"))]
    pub ping_interval: Duration,
    #[derivative(Default(value = "Duration::from_secs(10)"))]
    pub pong_grace: Duration,
    #[derivative(Default(value = "Duration::from_secs(3600)"))]
    pub idle_retention: Duration,
    #[derivative(Default(value = "Duration::from_secs(300)"))]
    pub idle_sweep_interval: Duration,
    #[derivative(Default(value = "20"))]
    pub messages_per_second: u32,
    pub auth_tokens: Vec<(String, String)>,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            bind: args.bind,
            disconnect_grace: Duration::from_secs(args.disconnect_grace),
            ping_interval: Duration::from_secs(args.ping_interval.max(1)),
            pong_grace: Duration::from_secs(args.pong_grace),
            idle_retention: Duration::from_secs(args.idle_retention),
            idle_sweep_interval: Duration::from_secs(args.idle_sweep_interval.max(1)),
            messages_per_second: args.messages_per_second,
            auth_tokens: args.auth_tokens,
        }
    }
}

impl From<EngineArgs> for EngineSettings {
    fn from(args: EngineArgs) -> Self {
        Self {
            path: args.engine,
            default_timeout: Duration::from_secs(args.engine_timeout),
            default_skill: args.skill.min(MAX_SKILL_LEVEL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_match_config_defaults() {
        let cli = Cli::try_parse_from(["chess-lobby", "serve"]).unwrap();
        let Command::Serve { server } = cli.command else {
            panic!("expected serve");
        };
        let config = ServerConfig::from(server);
        let defaults = ServerConfig::default();
        assert_eq!(config.bind, defaults.bind);
        assert_eq!(config.disconnect_grace, defaults.disconnect_grace);
        assert_eq!(config.ping_interval, defaults.ping_interval);
        assert_eq!(config.pong_grace, defaults.pong_grace);
        assert_eq!(config.idle_retention, defaults.idle_retention);
        assert_eq!(config.idle_sweep_interval, defaults.idle_sweep_interval);
        assert_eq!(config.messages_per_second, 20);
        assert!(config.auth_tokens.is_empty());
    }

    #[test]
    fn auth_tokens() {
        let cli = Cli::try_parse_from([
            "chess-lobby",
            "serve",
            "--auth-tokens",
            "abc=acct-1,def=acct-2",
        ])
        .unwrap();
        let Command::Serve { server } = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(
            server.auth_tokens,
            vec![
                ("abc".to_string(), "acct-1".to_string()),
                ("def".to_string(), "acct-2".to_string())
            ]
        );

        assert!(Cli::try_parse_from(["chess-lobby", "serve", "--auth-tokens", "nope"]).is_err());
    }

    #[test]
    fn engine_settings_clamp_skill() {
        let cli = Cli::try_parse_from([
            "chess-lobby",
            "search",
            "--engine",
            "/usr/bin/stockfish",
            "--skill",
            "40",
            "--moves",
            "e2e4,e7e5",
        ])
        .unwrap();
        let Command::Search { engine, moves, .. } = cli.command else {
            panic!("expected search");
        };
        assert_eq!(moves, vec!["e2e4", "e7e5"]);
        let settings = EngineSettings::from(engine);
        assert_eq!(settings.default_skill, MAX_SKILL_LEVEL);
        assert_eq!(settings.default_timeout, DEFAULT_SEARCH_TIMEOUT);
        assert_eq!(settings.path, Some(PathBuf::from("/usr/bin/stockfish")));
    }
}
