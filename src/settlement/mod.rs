//! Settlement engine
//!
//! Picks the winning card of a closed round and pays it out:
//!
//! ```text
//! winner set? ──no──> totals per card ──> select_winner ──> declare (guarded)
//!     │                                                        │
//!     └──────────────yes───────────────────────────────────────┘
//!                              │
//!        PENDING bets ──> outcomes ──> settle_bulk (bets)
//!                              │
//!        unpaid WIN bets ──> credit_payouts (ledger) ──> mark_processed
//! ```
//!
//! The two bulk writes are separate transactions. Both are guarded
//! (`status = PENDING`, `credited_at IS NULL`), so re-running settlement
//! after a crash between them finishes the job without paying twice.


use crate::error::{GameError, Result};
use crate::storage::Repositories;
use crate::types::{Bet, BetOutcome, BetStatus, Card, CardId, CardTotal, RoundId, RoundState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// What one settlement run did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementReport {
    pub round_id: RoundId,
    pub winning_card_id: CardId,
    /// Winner was chosen by this run rather than read back
    pub winner_selected: bool,
    pub bets_settled: u64,
    pub winners_credited: u64,
    pub amount_staked: Decimal,
    /// Round was already PROCESSED; nothing was touched
    pub already_processed: bool,
}

/// Choose the winning card.
///
/// Cards nobody bet on win first, uniformly at random among them. Otherwise
/// the card with the smallest stake total wins; equal totals go to the
/// lowest card id. Totals for cards outside `cards` are ignored.
pub fn select_winner<R: Rng + ?Sized>(
    cards: &[Card],
    totals: &[CardTotal],
    rng: &mut R,
) -> Result<CardId> {
    if cards.is_empty() {
        return Err(GameError::NoCards);
    }

    let staked: HashMap<CardId, Decimal> = totals
        .iter()
        .map(|t| (t.card_id, t.total_amount))
        .collect();
    let stake_of = |card: &Card| staked.get(&card.id).copied().unwrap_or(Decimal::ZERO);

    let unbacked: Vec<CardId> = cards
        .iter()
        .filter(|c| stake_of(c).is_zero())
        .map(|c| c.id)
        .collect();
    if let Some(card_id) = unbacked.choose(rng) {
        return Ok(*card_id);
    }

    cards
        .iter()
        .map(|c| (stake_of(c), c.id))
        .min()
        .map(|(_, card_id)| card_id)
        .ok_or(GameError::NoCards)
}

/// Stake returned to a winner
pub fn winning_amount(stake: Decimal, multiplier: Decimal) -> Decimal {
    (stake * multiplier).round_dp(crate::types::AMOUNT_SCALE)
}

/// Outcome of every bet against the declared winner. Losing bets keep
/// their stake as `result_amount`; it is a record, not a credit.
pub fn compute_outcomes(bets: &[Bet], winning_card_id: CardId, multiplier: Decimal) -> Vec<BetOutcome> {
    bets.iter()
        .map(|bet| {
            let is_win = bet.card_id == winning_card_id;
            BetOutcome {
                bet_id: bet.id,
                user_id: bet.user_id,
                status: if is_win { BetStatus::Win } else { BetStatus::Loss },
                result_amount: if is_win {
                    winning_amount(bet.amount, multiplier)
                } else {
                    bet.amount
                },
            }
        })
        .collect()
}

pub struct SettlementEngine {
    repos: Repositories,
    payout_multiplier: Decimal,
    rng: Mutex<StdRng>,
}

impl SettlementEngine {
    pub fn new(repos: Repositories, payout_multiplier: Decimal) -> Self {
        Self {
            repos,
            payout_multiplier,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic winner draws, for tests and replays
    pub fn with_seed(repos: Repositories, payout_multiplier: Decimal, seed: u64) -> Self {
        Self {
            repos,
            payout_multiplier,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn payout_multiplier(&self) -> Decimal {
        self.payout_multiplier
    }

    /// Settle one CLOSED round. Safe to call again on the same round.
    pub async fn settle(&self, round_id: RoundId, now: DateTime<Utc>) -> Result<SettlementReport> {
        let round = self
            .repos
            .rounds
            .find_round(round_id)
            .await?
            .ok_or_else(|| GameError::not_found("Round", round_id))?;

        match round.state {
            RoundState::Closed => {}
            RoundState::Processed => {
                debug!("Round {} already processed", round_id);
                return Ok(SettlementReport {
                    round_id,
                    winning_card_id: round.winning_card_id.unwrap_or_default(),
                    winner_selected: false,
                    bets_settled: 0,
                    winners_credited: 0,
                    amount_staked: Decimal::ZERO,
                    already_processed: true,
                });
            }
            RoundState::Open => {
                return Err(GameError::InvalidState {
                    round_id,
                    state: round.state,
                    expected: RoundState::Closed,
                })
            }
        }

        // Winner must be durable before any payout is computed
        let (winning_card_id, winner_selected) = match round.winning_card_id {
            Some(card_id) => (card_id, false),
            None => self.declare_winner(round_id, now).await?,
        };

        let pending = self.repos.bets.find_pending_by_round(round_id).await?;
        let amount_staked: Decimal = pending.iter().map(|b| b.amount).sum();
        let outcomes = compute_outcomes(&pending, winning_card_id, self.payout_multiplier);
        let bets_settled = self.repos.bets.settle_bulk(&outcomes, now).await?;

        let payouts = self.repos.bets.unpaid_wins(round_id).await?;
        let winners_credited = self.repos.ledger.credit_payouts(&payouts, now).await?;

        if !self.repos.rounds.mark_processed(round_id, now).await? {
            debug!("Round {} was marked processed elsewhere", round_id);
        }

        info!(
            "Round {} settled: winner card {}, {} bets settled, {} winners credited, {} staked",
            round_id, winning_card_id, bets_settled, winners_credited, amount_staked
        );

        Ok(SettlementReport {
            round_id,
            winning_card_id,
            winner_selected,
            bets_settled,
            winners_credited,
            amount_staked,
            already_processed: false,
        })
    }

    async fn declare_winner(&self, round_id: RoundId, now: DateTime<Utc>) -> Result<(CardId, bool)> {
        let totals = self.repos.bets.totals_by_card(round_id).await?;

        let picked = if totals.is_empty() {
            self.repos
                .cards
                .pick_random()
                .await?
                .ok_or(GameError::NoCards)?
                .id
        } else {
            let cards = self.repos.cards.find_all().await?;
            let mut rng = self.rng.lock();
            select_winner(&cards, &totals, &mut *rng)?
        };

        if self.repos.rounds.declare_winner(round_id, picked, now).await? {
            info!("Round {}: winning card {}", round_id, picked);
            return Ok((picked, true));
        }

        // Lost a race with another settler; use what it stored
        let stored = self
            .repos
            .rounds
            .find_round(round_id)
            .await?
            .and_then(|r| r.winning_card_id)
            .ok_or_else(|| GameError::Internal(format!("round {} has no winner after declare", round_id)))?;
        debug!("Round {}: winner {} was declared elsewhere", round_id, stored);
        Ok((stored, false))
    }
}
