//! Read views over rounds, bets and cards
//!
//! Nothing here writes. A round whose close offset has passed but which is
//! not PROCESSED yet shows as `Processing`, so these views keep answering
//! while settlement is running.

use crate::clock::{Clock, TimeAligner};
use crate::config::ScheduleConfig;
use crate::error::Result;
use crate::storage::Repositories;
use crate::types::{Card, CardId, CardTotal, Round, RoundId, RoundState, Statistics};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Round status as shown to players
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayStatus {
    /// Boundary not reached yet
    Upcoming,
    /// Taking bets
    Open,
    /// Betting over, result not final
    Processing,
    Settled,
}

impl DisplayStatus {
    pub fn derive(round: &Round, closes_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        match round.state {
            RoundState::Processed => DisplayStatus::Settled,
            RoundState::Closed => DisplayStatus::Processing,
            RoundState::Open if now < round.combo => DisplayStatus::Upcoming,
            RoundState::Open if now < closes_at => DisplayStatus::Open,
            RoundState::Open => DisplayStatus::Processing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardStake {
    pub card: Card,
    pub bet_count: u64,
    pub total_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundView {
    pub round_id: RoundId,
    pub combo: DateTime<Utc>,
    pub date_bucket: NaiveDate,
    pub state: RoundState,
    pub status: DisplayStatus,
    pub closes_at: DateTime<Utc>,
    /// Zero unless the round is taking bets
    pub seconds_to_close: i64,
    /// Every card, including ones without bets
    pub cards: Vec<CardStake>,
    pub bet_count: u64,
    pub total_amount: Decimal,
    pub winning_card: Option<Card>,
    pub result_declared_at: Option<DateTime<Utc>>,
}

pub struct RoundQuery {
    repos: Repositories,
    clock: Arc<dyn Clock>,
    aligner: TimeAligner,
    close_offset: Duration,
}

impl RoundQuery {
    pub fn new(repos: Repositories, clock: Arc<dyn Clock>, schedule: &ScheduleConfig) -> Result<Self> {
        Ok(Self {
            repos,
            clock,
            aligner: schedule.aligner()?,
            close_offset: schedule.close_offset(),
        })
    }

    pub async fn cards(&self) -> Result<Vec<Card>> {
        self.repos.cards.find_all().await
    }

    /// Rounds of one local calendar day, newest first
    pub async fn rounds_for_date(&self, date: NaiveDate) -> Result<Vec<RoundView>> {
        let now = self.clock.now();
        let cards = self.repos.cards.find_all().await?;
        let rounds = self.repos.rounds.list_by_date(date).await?;

        let mut views = Vec::with_capacity(rounds.len());
        for round in rounds {
            views.push(self.view(round, &cards, now).await?);
        }
        Ok(views)
    }

    /// Today's rounds in the configured timezone
    pub async fn rounds_today(&self) -> Result<Vec<RoundView>> {
        let today = self.aligner.date_bucket(self.clock.now());
        self.rounds_for_date(today).await
    }

    /// Round for the boundary containing now, if it was created
    pub async fn current_round(&self) -> Result<Option<RoundView>> {
        let now = self.clock.now();
        self.round_at(self.aligner.align(now), now).await
    }

    /// Round for the boundary before the current one
    pub async fn previous_round(&self) -> Result<Option<RoundView>> {
        let now = self.clock.now();
        self.round_at(self.aligner.previous(now), now).await
    }

    pub async fn round(&self, round_id: RoundId) -> Result<Option<RoundView>> {
        let now = self.clock.now();
        match self.repos.rounds.find_round(round_id).await? {
            Some(round) => {
                let cards = self.repos.cards.find_all().await?;
                Ok(Some(self.view(round, &cards, now).await?))
            }
            None => Ok(None),
        }
    }

    pub async fn statistics(&self) -> Result<Statistics> {
        self.repos.ledger.statistics().await
    }

    async fn round_at(&self, combo: DateTime<Utc>, now: DateTime<Utc>) -> Result<Option<RoundView>> {
        match self.repos.rounds.find_by_combo(combo).await? {
            Some(round) => {
                let cards = self.repos.cards.find_all().await?;
                Ok(Some(self.view(round, &cards, now).await?))
            }
            None => Ok(None),
        }
    }

    async fn view(&self, round: Round, cards: &[Card], now: DateTime<Utc>) -> Result<RoundView> {
        let totals = self.repos.bets.totals_by_card(round.round_id).await?;
        let closes_at = round.combo + self.close_offset;
        let status = DisplayStatus::derive(&round, closes_at, now);
        let seconds_to_close = if status == DisplayStatus::Open {
            (closes_at - now).num_seconds().max(0)
        } else {
            0
        };

        Ok(RoundView {
            round_id: round.round_id,
            combo: round.combo,
            date_bucket: round.date_bucket,
            state: round.state,
            status,
            closes_at,
            seconds_to_close,
            cards: card_stakes(cards, &totals),
            bet_count: totals.iter().map(|t| t.bet_count).sum(),
            total_amount: totals.iter().map(|t| t.total_amount).sum(),
            winning_card: round
                .winning_card_id
                .and_then(|id| cards.iter().find(|c| c.id == id).cloned()),
            result_declared_at: round.result_declared_at,
        })
    }
}

/// Join per-card totals onto the full card list
pub fn card_stakes(cards: &[Card], totals: &[CardTotal]) -> Vec<CardStake> {
    let by_card: HashMap<CardId, &CardTotal> = totals.iter().map(|t| (t.card_id, t)).collect();
    cards
        .iter()
        .map(|card| {
            let total = by_card.get(&card.id);
            CardStake {
                card: card.clone(),
                bet_count: total.map(|t| t.bet_count).unwrap_or(0),
                total_amount: total.map(|t| t.total_amount).unwrap_or(Decimal::ZERO),
            }
        })
        .collect()
}
