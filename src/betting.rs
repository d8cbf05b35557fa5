//! Bet placement and user balance operations
//!
//! Cheap checks (amount, card, round state) run up front so most rejections
//! never open a transaction. The ledger re-checks the round inside the
//! debit transaction, which is what actually closes the race with the close
//! tick.

use crate::clock::Clock;
use crate::error::{GameError, Result};
use crate::storage::Repositories;
use crate::types::{
    validate_amount, Bet, BetRequest, CardId, LedgerEntry, LedgerEntryKind, RoundId, User, UserId,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

pub struct BetService {
    repos: Repositories,
    clock: Arc<dyn Clock>,
}

impl BetService {
    pub fn new(repos: Repositories, clock: Arc<dyn Clock>) -> Self {
        Self { repos, clock }
    }

    /// Place a PENDING bet, debiting the stake. Nothing is written when any
    /// check fails.
    pub async fn place_bet(
        &self,
        user_id: UserId,
        card_id: CardId,
        round_id: RoundId,
        amount: Decimal,
    ) -> Result<Bet> {
        let amount = validate_amount(amount)?;

        if self.repos.cards.find_card(card_id).await?.is_none() {
            return Err(GameError::not_found("Card", card_id));
        }
        let round = self
            .repos
            .rounds
            .find_round(round_id)
            .await?
            .ok_or_else(|| GameError::not_found("Round", round_id))?;
        if !round.is_open() {
            debug!("Bet on round {} refused: round is {}", round_id, round.state);
            return Err(GameError::RoundClosed(round_id));
        }

        let request = BetRequest {
            user_id,
            card_id,
            round_id,
            amount,
        };
        let bet = self.repos.ledger.place_bet(&request, self.clock.now()).await?;
        info!(
            "Bet {} placed: user {} on card {} in round {} for {}",
            bet.id, user_id, card_id, round_id, amount
        );
        Ok(bet)
    }

    pub async fn create_user(&self, name: &str) -> Result<User> {
        let user = self.repos.ledger.create_user(name, self.clock.now()).await?;
        info!("User {} created ({})", user.id, user.name);
        Ok(user)
    }

    /// Admin credit
    pub async fn deposit(&self, user_id: UserId, amount: Decimal) -> Result<User> {
        let amount = validate_amount(amount)?;
        let user = self
            .repos
            .ledger
            .adjust(user_id, amount, Some("admin deposit".to_string()), self.clock.now())
            .await?;
        info!("Deposited {} to user {}, balance {}", amount, user_id, user.balance);
        Ok(user)
    }

    /// Admin debit; refuses to take a balance below zero
    pub async fn withdraw(&self, user_id: UserId, amount: Decimal) -> Result<User> {
        let amount = validate_amount(amount)?;
        let user = self
            .repos
            .ledger
            .adjust(user_id, -amount, Some("admin withdraw".to_string()), self.clock.now())
            .await?;
        info!("Withdrew {} from user {}, balance {}", amount, user_id, user.balance);
        Ok(user)
    }

    /// Player-initiated withdrawal: the balance is debited now and the entry
    /// stays PENDING until the payout to `destination` is made
    pub async fn request_withdraw(
        &self,
        user_id: UserId,
        amount: Decimal,
        destination: &str,
    ) -> Result<LedgerEntry> {
        let amount = validate_amount(amount)?;
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(GameError::InvalidRequest(
                "withdrawal destination is required".into(),
            ));
        }
        let entry = self
            .repos
            .ledger
            .request_withdraw(user_id, amount, destination, self.clock.now())
            .await?;
        info!(
            "Withdrawal request {} from user {} for {} to {}",
            entry.id, user_id, amount, destination
        );
        Ok(entry)
    }

    /// Withdrawal requests awaiting payout, oldest first
    pub async fn pending_withdrawals(&self) -> Result<Vec<LedgerEntry>> {
        self.repos.ledger.pending_withdrawals().await
    }

    pub async fn user(&self, user_id: UserId) -> Result<User> {
        self.repos
            .ledger
            .find_user(user_id)
            .await?
            .ok_or_else(|| GameError::not_found("User", user_id))
    }

    pub async fn balance(&self, user_id: UserId) -> Result<Decimal> {
        Ok(self.user(user_id).await?.balance)
    }

    /// Bet history, newest first
    pub async fn user_bets(&self, user_id: UserId) -> Result<Vec<Bet>> {
        self.user(user_id).await?;
        self.repos.bets.find_by_user(user_id).await
    }

    /// Balance movements, newest first, optionally of one kind
    pub async fn ledger_entries(
        &self,
        user_id: UserId,
        kind: Option<LedgerEntryKind>,
    ) -> Result<Vec<LedgerEntry>> {
        self.user(user_id).await?;
        let mut entries = self.repos.ledger.entries_for_user(user_id).await?;
        if let Some(kind) = kind {
            entries.retain(|e| e.kind == kind);
        }
        Ok(entries)
    }
}
