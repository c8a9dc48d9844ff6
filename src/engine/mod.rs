//! External search engine adapter and game analysis.
//!
//! # Architecture
//!
//! - `types`: request/result/evaluation types, errors and constants
//! - `communication`: the UCI exchange as a line-driven state machine
//! - `process`: subprocess ownership and the single-search driver
//! - `analysis`: ply-by-ply game review on top of any [`SearchEngine`]
//! - `install`: engine binary download for provisioning
//!
//! Every search owns exactly one engine subprocess from spawn to exit, so
//! searches share no state and may run concurrently.

pub mod analysis;
pub mod communication;
pub mod install;
pub mod process;
pub mod types;

use async_trait::async_trait;
use log::debug;

pub use analysis::{
    AnalysisReport, AnalysisRequest, Annotation, GameAnalyzer, PlyAnalysis, Severity, Thresholds,
};
pub use types::{
    EngineError, EngineResult, EngineSettings, Evaluation, LineResult, SearchRequest,
    SearchResult,
};

/// Anything that can answer a search request. The UCI subprocess is the
/// production implementation; tests substitute scripted engines.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> EngineResult<SearchResult>;
}

/// Search engine backed by a UCI binary on disk
#[derive(Debug, Clone, Default)]
pub struct UciEngine {
    settings: EngineSettings,
}

impl UciEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SearchEngine for UciEngine {
    async fn search(&self, request: &SearchRequest) -> EngineResult<SearchResult> {
        let path = self
            .settings
            .path
            .as_deref()
            .ok_or(EngineError::NotConfigured)?;
        let limit = request.timeout(self.settings.default_timeout);
        debug!("Searching with {:?} (timeout {:?})", path, limit);

        process::run_search(path, request, self.settings.default_skill, limit).await
    }
}
