//! Core domain types

use crate::error::{GameError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type RoundId = i64;
pub type CardId = i64;
pub type UserId = i64;
pub type BetId = i64;

/// Decimal places kept for every stored amount
pub const AMOUNT_SCALE: u32 = 2;

/// Round lifecycle state. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoundState {
    Open,
    Closed,
    Processed,
}

impl RoundState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundState::Open => "OPEN",
            RoundState::Closed => "CLOSED",
            RoundState::Processed => "PROCESSED",
        }
    }

    /// Whether `next` is a legal forward transition from `self`
    pub fn can_advance_to(&self, next: RoundState) -> bool {
        matches!(
            (self, next),
            (RoundState::Open, RoundState::Closed) | (RoundState::Closed, RoundState::Processed)
        )
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoundState {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OPEN" => Ok(RoundState::Open),
            "CLOSED" => Ok(RoundState::Closed),
            "PROCESSED" => Ok(RoundState::Processed),
            other => Err(GameError::Corrupt(format!("round state {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BetStatus {
    Pending,
    Win,
    Loss,
}

impl BetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetStatus::Pending => "PENDING",
            BetStatus::Win => "WIN",
            BetStatus::Loss => "LOSS",
        }
    }
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BetStatus {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(BetStatus::Pending),
            "WIN" => Ok(BetStatus::Win),
            "LOSS" => Ok(BetStatus::Loss),
            other => Err(GameError::Corrupt(format!("bet status {:?}", other))),
        }
    }
}

/// One betting window, identified by the instant its boundary starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub round_id: RoundId,
    /// Start of the round boundary in the configured timezone, as UTC
    pub combo: DateTime<Utc>,
    /// Calendar date of `combo` in the configured timezone
    pub date_bucket: NaiveDate,
    pub state: RoundState,
    pub winning_card_id: Option<CardId>,
    pub result_declared_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Round {
    pub fn is_open(&self) -> bool {
        self.state == RoundState::Open
    }
}

/// Insert request for a round; the store assigns nothing, the scheduler
/// picks `round_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRound {
    pub round_id: RoundId,
    pub combo: DateTime<Utc>,
    pub date_bucket: NaiveDate,
    pub state: RoundState,
    pub created_at: DateTime<Utc>,
}

impl NewRound {
    pub fn into_round(self) -> Round {
        Round {
            round_id: self.round_id,
            combo: self.combo,
            date_bucket: self.date_bucket,
            state: self.state,
            winning_card_id: None,
            result_declared_at: None,
            closed_at: (self.state != RoundState::Open).then_some(self.created_at),
            processed_at: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    pub id: BetId,
    pub round_id: RoundId,
    pub user_id: UserId,
    pub card_id: CardId,
    pub amount: Decimal,
    pub status: BetStatus,
    pub result_amount: Option<Decimal>,
    pub placed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub credited_at: Option<DateTime<Utc>>,
}

/// Validated wager, ready for the ledger transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetRequest {
    pub user_id: UserId,
    pub card_id: CardId,
    pub round_id: RoundId,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub name: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Sum of stakes placed on one card in one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardTotal {
    pub card_id: CardId,
    pub bet_count: u64,
    pub total_amount: Decimal,
}

/// Settlement result for a single bet
#[derive(Debug, Clone, PartialEq)]
pub struct BetOutcome {
    pub bet_id: BetId,
    pub user_id: UserId,
    pub status: BetStatus,
    pub result_amount: Decimal,
}

/// Winning bet whose result still has to reach the bettor's balance
#[derive(Debug, Clone, PartialEq)]
pub struct Payout {
    pub bet_id: BetId,
    pub user_id: UserId,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LedgerEntryKind {
    Bet,
    Win,
    Deposit,
    Withdraw,
}

impl LedgerEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Bet => "BET",
            LedgerEntryKind::Win => "WIN",
            LedgerEntryKind::Deposit => "DEPOSIT",
            LedgerEntryKind::Withdraw => "WITHDRAW",
        }
    }
}

impl FromStr for LedgerEntryKind {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BET" => Ok(LedgerEntryKind::Bet),
            "WIN" => Ok(LedgerEntryKind::Win),
            "DEPOSIT" => Ok(LedgerEntryKind::Deposit),
            "WITHDRAW" => Ok(LedgerEntryKind::Withdraw),
            other => Err(GameError::Corrupt(format!("ledger kind {:?}", other))),
        }
    }
}

impl fmt::Display for LedgerEntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a balance movement is final. Only withdrawal requests start out
/// `PENDING`; their debit is already applied, the payout happens offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryStatus {
    Completed,
    Pending,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Completed => "COMPLETED",
            EntryStatus::Pending => "PENDING",
        }
    }
}

impl FromStr for EntryStatus {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "COMPLETED" => Ok(EntryStatus::Completed),
            "PENDING" => Ok(EntryStatus::Pending),
            other => Err(GameError::Corrupt(format!("entry status {:?}", other))),
        }
    }
}

/// Audit row for one balance movement. `amount` is signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: UserId,
    pub kind: LedgerEntryKind,
    pub amount: Decimal,
    pub status: EntryStatus,
    /// Bet id for BET/WIN rows, payout destination for withdrawal requests
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counts for the admin dashboard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub users: u64,
    pub bets: u64,
    pub rounds: u64,
    pub cards: u64,
}

/// Check a wager or adjustment amount: positive, at most two decimals
pub fn validate_amount(amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(GameError::InvalidAmount(format!(
            "{} must be greater than zero",
            amount
        )));
    }
    let normalized = amount.normalize();
    if normalized.scale() > AMOUNT_SCALE {
        return Err(GameError::InvalidAmount(format!(
            "{} has more than {} decimal places",
            amount, AMOUNT_SCALE
        )));
    }
    Ok(normalized)
}

/// Decimal amount to integer hundredths
pub fn to_minor(amount: Decimal) -> Result<i64> {
    amount
        .round_dp(AMOUNT_SCALE)
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|minor| minor.to_i64())
        .ok_or_else(|| GameError::InvalidAmount(format!("{} is out of range", amount)))
}

/// Integer hundredths to decimal amount
pub fn from_minor(minor: i64) -> Decimal {
    Decimal::new(minor, AMOUNT_SCALE)
}
