//! Round lifecycle scheduler
//!
//! Drives every round through `OPEN -> CLOSED -> PROCESSED` on fixed offsets
//! into each round:
//!
//! - create (`create_offset_mins`): make sure the current round exists, and
//!   the next one when `precreate_next` is set
//! - close (`close_offset_mins`): stop betting on the current round, creating
//!   it straight into CLOSED if it was never created
//! - settle (`settle_offset_mins`): settle the current round, then anything
//!   left CLOSED from earlier boundaries
//! - health check (every `health_check_interval_mins`): report rounds that
//!   fell behind
//!
//! Ticks are plain async methods taking `now`, so tests fire them directly.
//! [`RoundScheduler::run`] is the timer loop used by the binary.


use crate::clock::{Clock, TimeAligner};
use crate::config::ScheduleConfig;
use crate::error::{GameError, Result};
use crate::settlement::{SettlementEngine, SettlementReport};
use crate::storage::Repositories;
use crate::types::{NewRound, Round, RoundId, RoundState};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Attempts at allocating `last_round_id + 1` before giving up
pub const MAX_INSERT_ATTEMPTS: u32 = 5;

/// Scheduled jobs, in the order they win a tie on the same instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    Create,
    Close,
    Settle,
    HealthCheck,
}

impl TickKind {
    pub const ALL: [TickKind; 4] = [
        TickKind::Create,
        TickKind::Close,
        TickKind::Settle,
        TickKind::HealthCheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TickKind::Create => "create",
            TickKind::Close => "close",
            TickKind::Settle => "settle",
            TickKind::HealthCheck => "health",
        }
    }
}

impl fmt::Display for TickKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TickKind {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "create" => Ok(TickKind::Create),
            "close" => Ok(TickKind::Close),
            "settle" => Ok(TickKind::Settle),
            "health" | "health-check" | "health_check" => Ok(TickKind::HealthCheck),
            other => Err(GameError::InvalidConfig(format!("unknown tick {:?}", other))),
        }
    }
}

/// Result of making sure a round exists for a boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "round", rename_all = "snake_case")]
pub enum EnsureOutcome {
    Created(Round),
    Existing(Round),
}

impl EnsureOutcome {
    pub fn round(&self) -> &Round {
        match self {
            EnsureOutcome::Created(round) | EnsureOutcome::Existing(round) => round,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnsureOutcome::Created(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateReport {
    pub current: EnsureOutcome,
    pub next: Option<EnsureOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseOutcome {
    /// OPEN round moved to CLOSED
    Closed,
    /// No round existed; it was created already CLOSED
    CreatedClosed,
    /// Round was already past OPEN
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseReport {
    pub round_id: RoundId,
    pub outcome: CloseOutcome,
    /// OPEN rounds from earlier boundaries closed on the way
    pub stale_closed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub current_combo: DateTime<Utc>,
    pub latest_open: Option<Round>,
    /// Rounds before the current boundary that never reached PROCESSED
    pub overdue: Vec<Round>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.overdue.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "tick", rename_all = "snake_case")]
pub enum TickOutcome {
    Create(CreateReport),
    Close(CloseReport),
    Settle { settled: Vec<SettlementReport> },
    HealthCheck(HealthReport),
}

pub struct RoundScheduler {
    clock: Arc<dyn Clock>,
    repos: Repositories,
    aligner: TimeAligner,
    config: ScheduleConfig,
    engine: Arc<SettlementEngine>,
}

impl RoundScheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        repos: Repositories,
        config: ScheduleConfig,
        engine: Arc<SettlementEngine>,
    ) -> Result<Self> {
        config.validate()?;
        let aligner = config.aligner()?;
        Ok(Self {
            clock,
            repos,
            aligner,
            config,
            engine,
        })
    }

    pub fn aligner(&self) -> &TimeAligner {
        &self.aligner
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Create tick: the current round exists, and the next one if configured
    pub async fn create_tick(&self, now: DateTime<Utc>) -> Result<CreateReport> {
        let combo = self.aligner.align(now);
        let current = self.ensure_round(combo, RoundState::Open, now).await?;
        let next = if self.config.precreate_next {
            let next_combo = combo + self.aligner.round_length();
            Some(self.ensure_round(next_combo, RoundState::Open, now).await?)
        } else {
            None
        };
        Ok(CreateReport { current, next })
    }

    /// Close tick: OPEN -> CLOSED for the current round
    pub async fn close_tick(&self, now: DateTime<Utc>) -> Result<CloseReport> {
        let combo = self.aligner.align(now);

        let stale_closed = self.repos.rounds.close_stale(combo, now).await?;
        if stale_closed > 0 {
            warn!("Closed {} OPEN rounds left over from earlier boundaries", stale_closed);
        }

        let round = match self.repos.rounds.find_by_combo(combo).await? {
            Some(round) => round,
            None => match self.ensure_round(combo, RoundState::Closed, now).await? {
                EnsureOutcome::Created(round) => {
                    warn!(
                        "Round {} for {} was missing at close time; created it CLOSED",
                        round.round_id, combo
                    );
                    return Ok(CloseReport {
                        round_id: round.round_id,
                        outcome: CloseOutcome::CreatedClosed,
                        stale_closed,
                    });
                }
                EnsureOutcome::Existing(round) => round,
            },
        };

        let outcome = if round.is_open() && self.repos.rounds.close(round.round_id, now).await? {
            info!("Round {} closed for betting", round.round_id);
            CloseOutcome::Closed
        } else {
            debug!("Round {} already {}", round.round_id, round.state);
            CloseOutcome::Unchanged
        };

        Ok(CloseReport {
            round_id: round.round_id,
            outcome,
            stale_closed,
        })
    }

    /// Settle tick: the current round, then CLOSED leftovers oldest first.
    /// Stops at the first failure; whatever is left is retried next tick.
    pub async fn settle_tick(&self, now: DateTime<Utc>) -> Result<Vec<SettlementReport>> {
        let combo = self.aligner.align(now);
        let mut settled = Vec::new();

        match self.repos.rounds.find_by_combo(combo).await? {
            Some(round) if round.state == RoundState::Closed => {
                settled.push(self.engine.settle(round.round_id, now).await?);
            }
            Some(round) => debug!("Round {} is {}, nothing to settle", round.round_id, round.state),
            None => debug!("No round for {}, nothing to settle", combo),
        }

        let backlog: Vec<Round> = self
            .repos
            .rounds
            .find_closed_up_to(combo)
            .await?
            .into_iter()
            .filter(|r| r.combo < combo)
            .collect();
        for round in backlog {
            warn!("Settling round {} from {} late", round.round_id, round.combo);
            settled.push(self.engine.settle(round.round_id, now).await?);
        }

        Ok(settled)
    }

    /// Health tick: report only, never repairs
    pub async fn health_tick(&self, now: DateTime<Utc>) -> Result<HealthReport> {
        let combo = self.aligner.align(now);
        let latest_open = self.repos.rounds.find_latest_open().await?;
        let overdue = self.repos.rounds.find_unsettled_before(combo).await?;

        for round in &overdue {
            warn!(
                "Round {} ({}) is still {} after its boundary passed",
                round.round_id, round.combo, round.state
            );
        }
        match &latest_open {
            Some(round) => info!(
                "Health check: latest open round {} ({}), {} overdue",
                round.round_id,
                round.combo,
                overdue.len()
            ),
            None => warn!("Health check: no open round, {} overdue", overdue.len()),
        }

        Ok(HealthReport {
            checked_at: now,
            current_combo: combo,
            latest_open,
            overdue,
        })
    }

    /// Find or create the round for `combo`. New ids are `last + 1`; a
    /// unique-constraint rejection means another writer got there first,
    /// either with this combo (done) or with this id (try again).
    pub async fn ensure_round(
        &self,
        combo: DateTime<Utc>,
        state: RoundState,
        now: DateTime<Utc>,
    ) -> Result<EnsureOutcome> {
        for attempt in 1..=MAX_INSERT_ATTEMPTS {
            if let Some(round) = self.repos.rounds.find_by_combo(combo).await? {
                debug!("Round {} for {} already exists", round.round_id, combo);
                return Ok(EnsureOutcome::Existing(round));
            }

            let round_id = self.repos.rounds.last_round_id().await?.unwrap_or(0) + 1;
            let new_round = NewRound {
                round_id,
                combo,
                date_bucket: self.aligner.date_bucket(combo),
                state,
                created_at: now,
            };
            match self.repos.rounds.insert(new_round).await? {
                Some(round) => {
                    info!("Round {} created for {} ({})", round.round_id, combo, round.state);
                    return Ok(EnsureOutcome::Created(round));
                }
                None => debug!(
                    "Insert of round {} for {} lost a race (attempt {})",
                    round_id, combo, attempt
                ),
            }
        }

        match self.repos.rounds.find_by_combo(combo).await? {
            Some(round) => Ok(EnsureOutcome::Existing(round)),
            None => Err(GameError::RoundIdContention(MAX_INSERT_ATTEMPTS)),
        }
    }

    /// When each kind fires next after `now`
    pub fn next_fire(&self, kind: TickKind, now: DateTime<Utc>) -> DateTime<Utc> {
        match kind {
            TickKind::Create => self.aligner.next_occurrence(now, self.config.create_offset()),
            TickKind::Close => self.aligner.next_occurrence(now, self.config.close_offset()),
            TickKind::Settle => self.aligner.next_occurrence(now, self.config.settle_offset()),
            TickKind::HealthCheck => {
                TimeAligner::new(self.aligner.offset(), self.config.health_check_interval())
                    .next_occurrence(now, Duration::zero())
            }
        }
    }

    /// Earliest tick after `now`; ties go to the kind listed first
    pub fn next_tick(&self, now: DateTime<Utc>) -> (TickKind, DateTime<Utc>) {
        TickKind::ALL
            .iter()
            .map(|kind| (*kind, self.next_fire(*kind, now)))
            .min_by_key(|(kind, at)| (*at, *kind))
            .unwrap_or((TickKind::HealthCheck, now))
    }

    /// Run one tick at the clock's current time, bounded by the tick timeout.
    /// Failures are logged and returned; nothing is retried here.
    pub async fn fire(&self, kind: TickKind) -> Result<TickOutcome> {
        let now = self.clock.now();
        let limit = self.config.tick_timeout();

        match tokio::time::timeout(limit, self.run_tick(kind, now)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => {
                error!("{} tick at {} failed: {}", kind, now, e);
                Err(e)
            }
            Err(_) => {
                warn!("{} tick at {} timed out after {}s", kind, now, limit.as_secs());
                Err(GameError::Timeout(limit.as_secs()))
            }
        }
    }

    async fn run_tick(&self, kind: TickKind, now: DateTime<Utc>) -> Result<TickOutcome> {
        Ok(match kind {
            TickKind::Create => TickOutcome::Create(self.create_tick(now).await?),
            TickKind::Close => TickOutcome::Close(self.close_tick(now).await?),
            TickKind::Settle => TickOutcome::Settle {
                settled: self.settle_tick(now).await?,
            },
            TickKind::HealthCheck => TickOutcome::HealthCheck(self.health_tick(now).await?),
        })
    }

    /// Timer loop. Fires a create tick on startup, then sleeps until each
    /// next tick until `shutdown` flips to `true` or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Scheduler started: {}-minute rounds in {} ({})",
            self.config.round_length_mins, self.config.timezone_name, self.config.utc_offset
        );

        let _ = self.fire(TickKind::Create).await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = self.clock.now();
            let (kind, at) = self.next_tick(now);
            let wait = (at - now).to_std().unwrap_or_default();
            debug!("Next tick: {} at {}", kind, at);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    // Woke early against the wall clock; sleep the rest
                    if self.clock.now() < at {
                        continue;
                    }
                    let _ = self.fire(kind).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }
}
