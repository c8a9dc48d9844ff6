use crate::{
    chess::RulesError,
    engine::{install::InstallError, EngineError},
    gateway::server::GatewayError,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Rules(#[from] RulesError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub type Result<T> = std::result::Result<T, Error>;
