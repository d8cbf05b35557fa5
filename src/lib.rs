//! Hourly Card Rounds
//!
//! Backend for a card betting game: every hour a round opens, players stake
//! balance on one card, betting closes shortly before the hour ends and the
//! card with the least money on it wins, paying its backers a fixed multiple.
//!
//! ## Architecture
//!
//! ```text
//! Clock → RoundScheduler ──create/close──→ RoundRepository
//!               │
//!               └──settle──→ SettlementEngine → BetRepository + Ledger
//!
//! HTTP (api) → BetService → Ledger (debit + bet, one transaction)
//!            → RoundQuery → read views
//! ```

pub mod api;
pub mod betting;
pub mod clock;
pub mod config;
pub mod error;
pub mod query;
pub mod scheduler;
pub mod settlement;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;
