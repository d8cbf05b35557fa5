//! Test doubles: a manual clock and an in-memory store
//!
//! `MemoryStore` follows the same guarded-write rules as the SQLite store so
//! scheduler and settlement logic can be exercised without a database.

use crate::clock::Clock;
use crate::error::{GameError, Result};
use crate::storage::{BetRepository, CardRepository, Ledger, RoundRepository};
use crate::types::{
    validate_amount, Bet, BetOutcome, BetRequest, BetStatus, Card, CardId, CardTotal, EntryStatus,
    LedgerEntry,
    LedgerEntryKind, NewRound, Payout, Round, RoundId, RoundState, Statistics, User, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Default)]
struct MemoryState {
    rounds: BTreeMap<RoundId, Round>,
    bets: BTreeMap<i64, Bet>,
    cards: BTreeMap<CardId, Card>,
    users: BTreeMap<UserId, User>,
    entries: Vec<LedgerEntry>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn push_entry(
        &mut self,
        user_id: UserId,
        kind: LedgerEntryKind,
        amount: Decimal,
        status: EntryStatus,
        reference: Option<String>,
        at: DateTime<Utc>,
    ) -> LedgerEntry {
        let id = self.next_id();
        let entry = LedgerEntry {
            id,
            user_id,
            kind,
            amount,
            status,
            reference,
            created_at: at,
        };
        self.entries.push(entry.clone());
        entry
    }
}

/// In-memory implementation of every repository trait
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with cards named after `names`, ids 1..=n
    pub fn with_cards(names: &[&str]) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock();
            for name in names {
                let id = state.next_id();
                state.cards.insert(
                    id,
                    Card {
                        id,
                        name: name.to_string(),
                        image: format!("{}.png", name.to_lowercase()),
                    },
                );
            }
        }
        store
    }

    /// Create a user holding `balance`
    pub fn add_user(&self, name: &str, balance: Decimal) -> User {
        let mut state = self.state.lock();
        let id = state.next_id();
        let user = User {
            id,
            name: name.to_string(),
            balance,
            created_at: Utc::now(),
        };
        state.users.insert(id, user.clone());
        user
    }

    pub fn balance_of(&self, user_id: UserId) -> Decimal {
        self.state
            .lock()
            .users
            .get(&user_id)
            .map(|u| u.balance)
            .unwrap_or_default()
    }

    pub fn rounds(&self) -> Vec<Round> {
        self.state.lock().rounds.values().cloned().collect()
    }

    pub fn cards(&self) -> Vec<Card> {
        self.state.lock().cards.values().cloned().collect()
    }

    /// Overwrite a stored bet, for simulating partially applied settlements
    pub fn put_bet(&self, bet: Bet) {
        self.state.lock().bets.insert(bet.id, bet);
    }
}

#[async_trait]
impl RoundRepository for MemoryStore {
    async fn find_by_combo(&self, combo: DateTime<Utc>) -> Result<Option<Round>> {
        let state = self.state.lock();
        Ok(state.rounds.values().find(|r| r.combo == combo).cloned())
    }

    async fn find_round(&self, round_id: RoundId) -> Result<Option<Round>> {
        Ok(self.state.lock().rounds.get(&round_id).cloned())
    }

    async fn last_round_id(&self) -> Result<Option<RoundId>> {
        Ok(self.state.lock().rounds.keys().next_back().copied())
    }

    async fn insert(&self, round: NewRound) -> Result<Option<Round>> {
        let mut state = self.state.lock();
        if state.rounds.contains_key(&round.round_id)
            || state.rounds.values().any(|r| r.combo == round.combo)
        {
            return Ok(None);
        }
        let round = round.into_round();
        state.rounds.insert(round.round_id, round.clone());
        Ok(Some(round))
    }

    async fn close(&self, round_id: RoundId, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock();
        match state.rounds.get_mut(&round_id) {
            Some(round) if round.state.can_advance_to(RoundState::Closed) => {
                round.state = RoundState::Closed;
                round.closed_at = Some(at);
                round.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close_stale(&self, before: DateTime<Utc>, at: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let mut closed = 0;
        for round in state.rounds.values_mut() {
            if round.state.can_advance_to(RoundState::Closed) && round.combo < before {
                round.state = RoundState::Closed;
                round.closed_at = Some(at);
                round.updated_at = at;
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn declare_winner(
        &self,
        round_id: RoundId,
        card_id: CardId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        match state.rounds.get_mut(&round_id) {
            Some(round) if round.state == RoundState::Closed && round.winning_card_id.is_none() => {
                round.winning_card_id = Some(card_id);
                round.result_declared_at = Some(at);
                round.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_processed(&self, round_id: RoundId, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock();
        match state.rounds.get_mut(&round_id) {
            Some(round)
                if round.state.can_advance_to(RoundState::Processed)
                    && round.winning_card_id.is_some() =>
            {
                round.state = RoundState::Processed;
                round.processed_at = Some(at);
                round.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_closed_up_to(&self, up_to: DateTime<Utc>) -> Result<Vec<Round>> {
        let state = self.state.lock();
        let mut rounds: Vec<Round> = state
            .rounds
            .values()
            .filter(|r| r.state == RoundState::Closed && r.combo <= up_to)
            .cloned()
            .collect();
        rounds.sort_by_key(|r| r.combo);
        Ok(rounds)
    }

    async fn find_unsettled_before(&self, before: DateTime<Utc>) -> Result<Vec<Round>> {
        let state = self.state.lock();
        let mut rounds: Vec<Round> = state
            .rounds
            .values()
            .filter(|r| r.state != RoundState::Processed && r.combo < before)
            .cloned()
            .collect();
        rounds.sort_by_key(|r| r.combo);
        Ok(rounds)
    }

    async fn find_latest_open(&self) -> Result<Option<Round>> {
        let state = self.state.lock();
        Ok(state
            .rounds
            .values()
            .filter(|r| r.state == RoundState::Open)
            .max_by_key(|r| r.combo)
            .cloned())
    }

    async fn list_by_date(&self, date: NaiveDate) -> Result<Vec<Round>> {
        let state = self.state.lock();
        let mut rounds: Vec<Round> = state
            .rounds
            .values()
            .filter(|r| r.date_bucket == date)
            .cloned()
            .collect();
        rounds.sort_by(|a, b| b.combo.cmp(&a.combo));
        Ok(rounds)
    }
}

#[async_trait]
impl BetRepository for MemoryStore {
    async fn find_by_round(&self, round_id: RoundId) -> Result<Vec<Bet>> {
        let state = self.state.lock();
        Ok(state
            .bets
            .values()
            .filter(|b| b.round_id == round_id)
            .cloned()
            .collect())
    }

    async fn find_pending_by_round(&self, round_id: RoundId) -> Result<Vec<Bet>> {
        let state = self.state.lock();
        Ok(state
            .bets
            .values()
            .filter(|b| b.round_id == round_id && b.status == BetStatus::Pending)
            .cloned()
            .collect())
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<Bet>> {
        let state = self.state.lock();
        let mut bets: Vec<Bet> = state
            .bets
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        bets.sort_by(|a, b| b.placed_at.cmp(&a.placed_at).then(b.id.cmp(&a.id)));
        Ok(bets)
    }

    async fn totals_by_card(&self, round_id: RoundId) -> Result<Vec<CardTotal>> {
        let state = self.state.lock();
        let mut totals: BTreeMap<CardId, CardTotal> = BTreeMap::new();
        for bet in state.bets.values().filter(|b| b.round_id == round_id) {
            let entry = totals.entry(bet.card_id).or_insert_with(|| CardTotal {
                card_id: bet.card_id,
                bet_count: 0,
                total_amount: Decimal::ZERO,
            });
            entry.bet_count += 1;
            entry.total_amount += bet.amount;
        }
        Ok(totals.into_values().collect())
    }

    async fn settle_bulk(&self, outcomes: &[BetOutcome], at: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let mut updated = 0;
        for outcome in outcomes {
            if let Some(bet) = state.bets.get_mut(&outcome.bet_id) {
                if bet.status == BetStatus::Pending {
                    bet.status = outcome.status;
                    bet.result_amount = Some(outcome.result_amount);
                    bet.settled_at = Some(at);
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn unpaid_wins(&self, round_id: RoundId) -> Result<Vec<Payout>> {
        let state = self.state.lock();
        state
            .bets
            .values()
            .filter(|b| {
                b.round_id == round_id && b.status == BetStatus::Win && b.credited_at.is_none()
            })
            .map(|b| {
                let amount = b.result_amount.ok_or_else(|| {
                    GameError::Corrupt(format!("winning bet {} has no result", b.id))
                })?;
                Ok(Payout {
                    bet_id: b.id,
                    user_id: b.user_id,
                    amount,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CardRepository for MemoryStore {
    async fn find_all(&self) -> Result<Vec<Card>> {
        Ok(self.cards())
    }

    async fn find_card(&self, card_id: CardId) -> Result<Option<Card>> {
        Ok(self.state.lock().cards.get(&card_id).cloned())
    }

    async fn pick_random(&self) -> Result<Option<Card>> {
        let cards = self.cards();
        let picked = {
            let mut rng = rand::rng();
            cards.choose(&mut rng).cloned()
        };
        Ok(picked)
    }

    async fn upsert(&self, name: &str, image: &str) -> Result<Card> {
        let mut state = self.state.lock();
        if let Some(card) = state.cards.values().find(|c| c.name == name) {
            return Ok(card.clone());
        }
        let id = state.next_id();
        let card = Card {
            id,
            name: name.to_string(),
            image: image.to_string(),
        };
        state.cards.insert(id, card.clone());
        Ok(card)
    }
}

#[async_trait]
impl Ledger for MemoryStore {
    async fn create_user(&self, name: &str, at: DateTime<Utc>) -> Result<User> {
        let mut state = self.state.lock();
        let id = state.next_id();
        let user = User {
            id,
            name: name.to_string(),
            balance: Decimal::ZERO,
            created_at: at,
        };
        state.users.insert(id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, user_id: UserId) -> Result<Option<User>> {
        Ok(self.state.lock().users.get(&user_id).cloned())
    }

    async fn adjust(
        &self,
        user_id: UserId,
        delta: Decimal,
        reference: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<User> {
        if delta.is_zero() {
            return Err(GameError::InvalidAmount("adjustment must not be zero".into()));
        }
        let mut state = self.state.lock();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| GameError::not_found("User", user_id))?;
        if user.balance + delta < Decimal::ZERO {
            return Err(GameError::InsufficientBalance {
                available: user.balance,
                required: -delta,
            });
        }
        user.balance += delta;
        let user = user.clone();
        let kind = if delta > Decimal::ZERO {
            LedgerEntryKind::Deposit
        } else {
            LedgerEntryKind::Withdraw
        };
        state.push_entry(user_id, kind, delta, EntryStatus::Completed, reference, at);
        Ok(user)
    }

    async fn place_bet(&self, request: &BetRequest, at: DateTime<Utc>) -> Result<Bet> {
        let amount = validate_amount(request.amount)?;
        let mut state = self.state.lock();

        let available = state
            .users
            .get(&request.user_id)
            .map(|u| u.balance)
            .ok_or_else(|| GameError::not_found("User", request.user_id))?;
        if available < amount {
            return Err(GameError::InsufficientBalance {
                available,
                required: amount,
            });
        }
        match state.rounds.get(&request.round_id) {
            None => return Err(GameError::not_found("Round", request.round_id)),
            Some(round) if round.state != RoundState::Open => {
                return Err(GameError::RoundClosed(request.round_id))
            }
            Some(_) => {}
        }
        if !state.cards.contains_key(&request.card_id) {
            return Err(GameError::not_found("Card", request.card_id));
        }

        if let Some(user) = state.users.get_mut(&request.user_id) {
            user.balance -= amount;
        }
        let id = state.next_id();
        let bet = Bet {
            id,
            round_id: request.round_id,
            user_id: request.user_id,
            card_id: request.card_id,
            amount,
            status: BetStatus::Pending,
            result_amount: None,
            placed_at: at,
            settled_at: None,
            credited_at: None,
        };
        state.bets.insert(id, bet.clone());
        state.push_entry(
            request.user_id,
            LedgerEntryKind::Bet,
            -amount,
            EntryStatus::Completed,
            Some(format!("bet:{}", id)),
            at,
        );
        Ok(bet)
    }

    async fn credit_payouts(&self, payouts: &[Payout], at: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        // validate before touching anything so the batch stays all-or-nothing
        for payout in payouts {
            if !state.users.contains_key(&payout.user_id) {
                return Err(GameError::not_found("User", payout.user_id));
            }
        }
        let mut credited = 0;
        for payout in payouts {
            let eligible = match state.bets.get_mut(&payout.bet_id) {
                Some(bet) if bet.status == BetStatus::Win && bet.credited_at.is_none() => {
                    bet.credited_at = Some(at);
                    true
                }
                _ => false,
            };
            if !eligible {
                continue;
            }
            if let Some(user) = state.users.get_mut(&payout.user_id) {
                user.balance += payout.amount;
            }
            state.push_entry(
                payout.user_id,
                LedgerEntryKind::Win,
                payout.amount,
                EntryStatus::Completed,
                Some(format!("bet:{}", payout.bet_id)),
                at,
            );
            credited += 1;
        }
        Ok(credited)
    }

    async fn request_withdraw(
        &self,
        user_id: UserId,
        amount: Decimal,
        destination: &str,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let amount = validate_amount(amount)?;
        let mut state = self.state.lock();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| GameError::not_found("User", user_id))?;
        if user.balance < amount {
            return Err(GameError::InsufficientBalance {
                available: user.balance,
                required: amount,
            });
        }
        user.balance -= amount;
        Ok(state.push_entry(
            user_id,
            LedgerEntryKind::Withdraw,
            -amount,
            EntryStatus::Pending,
            Some(destination.to_string()),
            at,
        ))
    }

    async fn pending_withdrawals(&self) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock();
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|e| e.kind == LedgerEntryKind::Withdraw && e.status == EntryStatus::Pending)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn entries_for_user(&self, user_id: UserId) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock();
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(entries)
    }

    async fn statistics(&self) -> Result<Statistics> {
        let state = self.state.lock();
        Ok(Statistics {
            users: state.users.len() as u64,
            bets: state.bets.len() as u64,
            rounds: state.rounds.len() as u64,
            cards: state.cards.len() as u64,
        })
    }
}
