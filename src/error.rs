//! Error types

use crate::types::{RoundId, RoundState};
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by the round engine, the store and bet placement
#[derive(Error, Debug)]
pub enum GameError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Round {0} is not open for betting")]
    RoundClosed(RoundId),

    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: Decimal, required: Decimal },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No cards available to pick a winner")]
    NoCards,

    #[error("Round {round_id} is {state}, expected {expected}")]
    InvalidState {
        round_id: RoundId,
        state: RoundState,
        expected: RoundState,
    },

    #[error("Corrupt record in store: {0}")]
    Corrupt(String),

    #[error("Could not allocate a round id after {0} attempts")]
    RoundIdContention(u32),

    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GameError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        GameError::NotFound { entity, id }
    }

    /// Errors the caller caused and should fix before resubmitting
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GameError::NotFound { .. }
                | GameError::RoundClosed(_)
                | GameError::InsufficientBalance { .. }
                | GameError::InvalidAmount(_)
                | GameError::InvalidRequest(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GameError>;
