pub mod chess;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod lobby;
pub mod storage;

use std::sync::Arc;

use log::info;

use crate::{
    config::{Cli, Command, ServerConfig},
    engine::{
        install::install_engine, AnalysisRequest, EngineError, EngineSettings, GameAnalyzer, SearchEngine,
        SearchRequest, UciEngine,
    },
    error::Result,
    identity::{AnonymousOnly, IdentityVerifier, StaticTokens},
    storage::MemoryGameStore,
};

// ============================================================================
// ENTRY POINT
// ============================================================================

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve { server } => {
            let config = ServerConfig::from(server);
            let identity: Arc<dyn IdentityVerifier> = if config.auth_tokens.is_empty() {
                Arc::new(AnonymousOnly)
            } else {
                Arc::new(StaticTokens::new(config.auth_tokens.clone()))
            };
            gateway::serve(config, Arc::new(MemoryGameStore::new()), identity).await?;
        }
        Command::Search {
            engine,
            fen,
            moves,
            depth,
            movetime_ms,
            multipv,
        } => {
            let engine = UciEngine::new(EngineSettings::from(engine));
            let request = SearchRequest {
                fen,
                moves,
                depth,
                movetime_ms,
                multipv,
                ..SearchRequest::default()
            };
            let result = engine.search(&request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Analyze {
            engine,
            pgn,
            depth,
            multipv,
            max_plies,
        } => {
            let text = tokio::fs::read_to_string(&pgn).await?;
            let request = AnalysisRequest {
                depth: Some(depth),
                multipv,
                max_plies,
                ..AnalysisRequest::from_pgn(&text)?
            };
            let settings = EngineSettings::from(engine);
            if settings.path.is_none() {
                return Err(EngineError::NotConfigured.into());
            }
            info!("Analyzing {} plies from {}", request.moves.len(), pgn.display());
            let analyzer = GameAnalyzer::new(UciEngine::new(settings));
            let report = analyzer.analyze(&request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::InstallEngine { url, dest } => {
            let path = install_engine(&url, &dest).await?;
            info!("Engine installed at {}", path.display());
        }
    }
    Ok(())
}
