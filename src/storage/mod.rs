//! Persistence seams
//!
//! The scheduler, settlement engine and bet placement only talk to these
//! traits. [`Database`] implements all of them on SQLite; the `testing`
//! module has an in-memory implementation.
//!
//! Every state-changing method is guarded by a precondition on the stored
//! row (existence, current state, `PENDING` status, uncredited marker) and
//! reports whether it applied, so callers can retry blindly.

mod schema;
mod sqlite;

pub use schema::create_tables;
pub use sqlite::Database;

use crate::error::Result;
use crate::types::{
    Bet, BetOutcome, BetRequest, Card, CardId, CardTotal, LedgerEntry, NewRound, Payout, Round,
    RoundId, Statistics, User, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Handles to every repository, shared by the scheduler, settlement and
/// bet placement
#[derive(Clone)]
pub struct Repositories {
    pub rounds: Arc<dyn RoundRepository>,
    pub bets: Arc<dyn BetRepository>,
    pub cards: Arc<dyn CardRepository>,
    pub ledger: Arc<dyn Ledger>,
}

impl Repositories {
    /// Use one store for every role
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: RoundRepository + BetRepository + CardRepository + Ledger + 'static,
    {
        Self {
            rounds: store.clone(),
            bets: store.clone(),
            cards: store.clone(),
            ledger: store,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoundRepository: Send + Sync {
    async fn find_by_combo(&self, combo: DateTime<Utc>) -> Result<Option<Round>>;

    async fn find_round(&self, round_id: RoundId) -> Result<Option<Round>>;

    /// Highest round id handed out so far
    async fn last_round_id(&self) -> Result<Option<RoundId>>;

    /// Insert a round. Returns `None` when the unique constraint on either
    /// `combo` or `round_id` rejected it.
    async fn insert(&self, round: NewRound) -> Result<Option<Round>>;

    /// OPEN -> CLOSED. `false` if the round was not OPEN.
    async fn close(&self, round_id: RoundId, at: DateTime<Utc>) -> Result<bool>;

    /// Close every OPEN round whose combo is before `before`
    async fn close_stale(&self, before: DateTime<Utc>, at: DateTime<Utc>) -> Result<u64>;

    /// Set the winner if none is set yet. `false` if one already was.
    async fn declare_winner(
        &self,
        round_id: RoundId,
        card_id: CardId,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// CLOSED -> PROCESSED. `false` if the round was not CLOSED.
    async fn mark_processed(&self, round_id: RoundId, at: DateTime<Utc>) -> Result<bool>;

    /// CLOSED rounds with combo at or before `up_to`, oldest first
    async fn find_closed_up_to(&self, up_to: DateTime<Utc>) -> Result<Vec<Round>>;

    /// Rounds before `before` that never reached PROCESSED
    async fn find_unsettled_before(&self, before: DateTime<Utc>) -> Result<Vec<Round>>;

    /// Newest OPEN round by combo
    async fn find_latest_open(&self) -> Result<Option<Round>>;

    /// Rounds of one date bucket, newest first
    async fn list_by_date(&self, date: NaiveDate) -> Result<Vec<Round>>;
}

#[async_trait]
pub trait BetRepository: Send + Sync {
    async fn find_by_round(&self, round_id: RoundId) -> Result<Vec<Bet>>;

    async fn find_pending_by_round(&self, round_id: RoundId) -> Result<Vec<Bet>>;

    /// Bets of one user, newest first
    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<Bet>>;

    /// Count and stake sum per card, cards without bets omitted
    async fn totals_by_card(&self, round_id: RoundId) -> Result<Vec<CardTotal>>;

    /// Apply outcomes in one bulk write. Only bets still `PENDING` change;
    /// returns how many did.
    async fn settle_bulk(&self, outcomes: &[BetOutcome], at: DateTime<Utc>) -> Result<u64>;

    /// WIN bets of the round whose payout has not reached the ledger
    async fn unpaid_wins(&self, round_id: RoundId) -> Result<Vec<Payout>>;
}

#[async_trait]
pub trait CardRepository: Send + Sync {
    /// All cards ordered by id
    async fn find_all(&self) -> Result<Vec<Card>>;

    async fn find_card(&self, card_id: CardId) -> Result<Option<Card>>;

    /// One card chosen uniformly at random
    async fn pick_random(&self) -> Result<Option<Card>>;

    /// Insert unless a card with this name exists; returns the stored card
    async fn upsert(&self, name: &str, image: &str) -> Result<Card>;
}

/// User balances. Every movement is atomic and leaves a ledger entry.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_user(&self, name: &str, at: DateTime<Utc>) -> Result<User>;

    async fn find_user(&self, user_id: UserId) -> Result<Option<User>>;

    /// Add `delta` (may be negative) to a balance. Fails with
    /// `InsufficientBalance` instead of going below zero.
    async fn adjust(
        &self,
        user_id: UserId,
        delta: Decimal,
        reference: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<User>;

    /// Debit the stake and record a PENDING bet in one transaction. The
    /// round must still be OPEN inside that transaction.
    async fn place_bet(&self, request: &BetRequest, at: DateTime<Utc>) -> Result<Bet>;

    /// Credit winning bets not yet credited and mark them credited, in one
    /// bulk write. Returns how many bets were credited.
    async fn credit_payouts(&self, payouts: &[Payout], at: DateTime<Utc>) -> Result<u64>;

    /// Debit `amount` and record it as a PENDING withdrawal to
    /// `destination`, in one transaction
    async fn request_withdraw(
        &self,
        user_id: UserId,
        amount: Decimal,
        destination: &str,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry>;

    /// PENDING withdrawal requests of every user, oldest first
    async fn pending_withdrawals(&self) -> Result<Vec<LedgerEntry>>;

    /// Balance movements of one user, newest first
    async fn entries_for_user(&self, user_id: UserId) -> Result<Vec<LedgerEntry>>;

    async fn statistics(&self) -> Result<Statistics>;
}
