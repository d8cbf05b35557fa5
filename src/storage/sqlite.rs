//! SQLite-backed store

use super::schema::create_tables;
use super::{BetRepository, CardRepository, Ledger, RoundRepository};
use crate::config::{CardSeed, DatabaseConfig};
use crate::error::{GameError, Result};
use crate::types::{
    from_minor, to_minor, Bet, BetOutcome, BetRequest, BetStatus, Card, CardId, CardTotal,
    EntryStatus, LedgerEntry, LedgerEntryKind, NewRound, Payout, Round, RoundId, RoundState, Statistics, User,
    UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const ROUND_COLUMNS: &str = "round_id, combo_ts, date_bucket, state, winning_card_id, \
     result_declared_at, closed_at, processed_at, created_at, updated_at";

const LEDGER_COLUMNS: &str = "id, user_id, kind, amount_minor, status, reference, created_at";

const BET_COLUMNS: &str = "id, round_id, user_id, card_id, amount_minor, status, result_minor, \
     placed_at, settled_at, credited_at";

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| GameError::Corrupt(format!("timestamp {}", ms)))
}

fn from_ms_opt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_ms).transpose()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(sqlx::FromRow)]
struct RoundRow {
    round_id: i64,
    combo_ts: i64,
    date_bucket: String,
    state: String,
    winning_card_id: Option<i64>,
    result_declared_at: Option<i64>,
    closed_at: Option<i64>,
    processed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<RoundRow> for Round {
    type Error = GameError;

    fn try_from(row: RoundRow) -> Result<Self> {
        let date_bucket = NaiveDate::from_str(&row.date_bucket)
            .map_err(|e| GameError::Corrupt(format!("date bucket {:?}: {}", row.date_bucket, e)))?;
        Ok(Round {
            round_id: row.round_id,
            combo: from_ms(row.combo_ts)?,
            date_bucket,
            state: RoundState::from_str(&row.state)?,
            winning_card_id: row.winning_card_id,
            result_declared_at: from_ms_opt(row.result_declared_at)?,
            closed_at: from_ms_opt(row.closed_at)?,
            processed_at: from_ms_opt(row.processed_at)?,
            created_at: from_ms(row.created_at)?,
            updated_at: from_ms(row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BetRow {
    id: i64,
    round_id: i64,
    user_id: i64,
    card_id: i64,
    amount_minor: i64,
    status: String,
    result_minor: Option<i64>,
    placed_at: i64,
    settled_at: Option<i64>,
    credited_at: Option<i64>,
}

impl TryFrom<BetRow> for Bet {
    type Error = GameError;

    fn try_from(row: BetRow) -> Result<Self> {
        Ok(Bet {
            id: row.id,
            round_id: row.round_id,
            user_id: row.user_id,
            card_id: row.card_id,
            amount: from_minor(row.amount_minor),
            status: BetStatus::from_str(&row.status)?,
            result_amount: row.result_minor.map(from_minor),
            placed_at: from_ms(row.placed_at)?,
            settled_at: from_ms_opt(row.settled_at)?,
            credited_at: from_ms_opt(row.credited_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CardRow {
    id: i64,
    name: String,
    image: String,
}

impl From<CardRow> for Card {
    fn from(row: CardRow) -> Self {
        Card {
            id: row.id,
            name: row.name,
            image: row.image,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    name: String,
    balance_minor: i64,
    created_at: i64,
}

impl TryFrom<UserRow> for User {
    type Error = GameError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: row.id,
            name: row.name,
            balance: from_minor(row.balance_minor),
            created_at: from_ms(row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: i64,
    user_id: i64,
    kind: String,
    amount_minor: i64,
    status: String,
    reference: Option<String>,
    created_at: i64,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = GameError;

    fn try_from(row: LedgerRow) -> Result<Self> {
        Ok(LedgerEntry {
            id: row.id,
            user_id: row.user_id,
            kind: LedgerEntryKind::from_str(&row.kind)?,
            amount: from_minor(row.amount_minor),
            status: EntryStatus::from_str(&row.status)?,
            reference: row.reference,
            created_at: from_ms(row.created_at)?,
        })
    }
}

/// SQLite store implementing every repository trait
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file at `path`
    pub async fn connect(path: &str) -> Result<Self> {
        Self::connect_with(&DatabaseConfig {
            path: path.to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub async fn connect_with(config: &DatabaseConfig) -> Result<Self> {
        let path = shellexpand::tilde(&config.path).into_owned();
        if let Some(parent) = std::path::Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| GameError::Internal(format!("create {:?}: {}", parent, e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        create_tables(&pool).await?;
        info!("Database ready at {}", path);
        Ok(Self { pool })
    }

    /// Private in-memory database on a single pinned connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        create_tables(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Make sure every configured card exists
    pub async fn seed_cards(&self, cards: &[CardSeed]) -> Result<Vec<Card>> {
        for card in cards {
            self.upsert(&card.name, &card.image).await?;
        }
        let stored = self.find_all().await?;
        debug!("Card set has {} cards", stored.len());
        Ok(stored)
    }

    async fn fetch_user_in(tx: &mut Transaction<'_, Sqlite>, user_id: UserId) -> Result<Option<User>> {
        sqlx::query_as::<_, UserRow>(
            "SELECT id, name, balance_minor, created_at FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?
        .map(User::try_from)
        .transpose()
    }

    /// Explain why a guarded debit matched no row
    async fn debit_failure(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
        required: Decimal,
    ) -> Result<GameError> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance_minor FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(match balance {
            None => GameError::not_found("User", user_id),
            Some(minor) => GameError::InsufficientBalance {
                available: from_minor(minor),
                required,
            },
        })
    }

    async fn insert_entry(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
        kind: LedgerEntryKind,
        amount_minor: i64,
        status: EntryStatus,
        reference: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO ledger_entries (user_id, kind, amount_minor, status, reference, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(amount_minor)
        .bind(status.as_str())
        .bind(reference)
        .bind(to_ms(at))
        .execute(&mut **tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn fetch_rounds(&self, sql: &str, bind: i64) -> Result<Vec<Round>> {
        sqlx::query_as::<_, RoundRow>(sql)
            .bind(bind)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Round::try_from)
            .collect()
    }

    async fn fetch_bets(&self, sql: &str, bind: i64) -> Result<Vec<Bet>> {
        sqlx::query_as::<_, BetRow>(sql)
            .bind(bind)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Bet::try_from)
            .collect()
    }
}

#[async_trait]
impl RoundRepository for Database {
    async fn find_by_combo(&self, combo: DateTime<Utc>) -> Result<Option<Round>> {
        let sql = format!("SELECT {} FROM rounds WHERE combo_ts = ?", ROUND_COLUMNS);
        Ok(self.fetch_rounds(&sql, to_ms(combo)).await?.pop())
    }

    async fn find_round(&self, round_id: RoundId) -> Result<Option<Round>> {
        let sql = format!("SELECT {} FROM rounds WHERE round_id = ?", ROUND_COLUMNS);
        Ok(self.fetch_rounds(&sql, round_id).await?.pop())
    }

    async fn last_round_id(&self) -> Result<Option<RoundId>> {
        let last: Option<i64> = sqlx::query_scalar("SELECT MAX(round_id) FROM rounds")
            .fetch_one(&self.pool)
            .await?;
        Ok(last)
    }

    async fn insert(&self, round: NewRound) -> Result<Option<Round>> {
        let created = round.into_round();
        let result = sqlx::query(
            "INSERT INTO rounds (round_id, combo_ts, date_bucket, state, closed_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(created.round_id)
        .bind(to_ms(created.combo))
        .bind(created.date_bucket.to_string())
        .bind(created.state.as_str())
        .bind(created.closed_at.map(to_ms))
        .bind(to_ms(created.created_at))
        .bind(to_ms(created.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(Some(created)),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self, round_id: RoundId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE rounds SET state = 'CLOSED', closed_at = ?, updated_at = ?
             WHERE round_id = ? AND state = 'OPEN'",
        )
        .bind(to_ms(at))
        .bind(to_ms(at))
        .bind(round_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn close_stale(&self, before: DateTime<Utc>, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE rounds SET state = 'CLOSED', closed_at = ?, updated_at = ?
             WHERE state = 'OPEN' AND combo_ts < ?",
        )
        .bind(to_ms(at))
        .bind(to_ms(at))
        .bind(to_ms(before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn declare_winner(
        &self,
        round_id: RoundId,
        card_id: CardId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE rounds SET winning_card_id = ?, result_declared_at = ?, updated_at = ?
             WHERE round_id = ? AND state = 'CLOSED' AND winning_card_id IS NULL",
        )
        .bind(card_id)
        .bind(to_ms(at))
        .bind(to_ms(at))
        .bind(round_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(&self, round_id: RoundId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE rounds SET state = 'PROCESSED', processed_at = ?, updated_at = ?
             WHERE round_id = ? AND state = 'CLOSED' AND winning_card_id IS NOT NULL",
        )
        .bind(to_ms(at))
        .bind(to_ms(at))
        .bind(round_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_closed_up_to(&self, up_to: DateTime<Utc>) -> Result<Vec<Round>> {
        let sql = format!(
            "SELECT {} FROM rounds WHERE state = 'CLOSED' AND combo_ts <= ? ORDER BY combo_ts ASC",
            ROUND_COLUMNS
        );
        self.fetch_rounds(&sql, to_ms(up_to)).await
    }

    async fn find_unsettled_before(&self, before: DateTime<Utc>) -> Result<Vec<Round>> {
        let sql = format!(
            "SELECT {} FROM rounds WHERE state != 'PROCESSED' AND combo_ts < ? ORDER BY combo_ts ASC",
            ROUND_COLUMNS
        );
        self.fetch_rounds(&sql, to_ms(before)).await
    }

    async fn find_latest_open(&self) -> Result<Option<Round>> {
        let sql = format!(
            "SELECT {} FROM rounds WHERE state = 'OPEN' ORDER BY combo_ts DESC LIMIT 1",
            ROUND_COLUMNS
        );
        sqlx::query_as::<_, RoundRow>(&sql)
            .fetch_optional(&self.pool)
            .await?
            .map(Round::try_from)
            .transpose()
    }

    async fn list_by_date(&self, date: NaiveDate) -> Result<Vec<Round>> {
        let sql = format!(
            "SELECT {} FROM rounds WHERE date_bucket = ? ORDER BY combo_ts DESC",
            ROUND_COLUMNS
        );
        sqlx::query_as::<_, RoundRow>(&sql)
            .bind(date.to_string())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Round::try_from)
            .collect()
    }
}

#[async_trait]
impl BetRepository for Database {
    async fn find_by_round(&self, round_id: RoundId) -> Result<Vec<Bet>> {
        let sql = format!("SELECT {} FROM bets WHERE round_id = ? ORDER BY id", BET_COLUMNS);
        self.fetch_bets(&sql, round_id).await
    }

    async fn find_pending_by_round(&self, round_id: RoundId) -> Result<Vec<Bet>> {
        let sql = format!(
            "SELECT {} FROM bets WHERE round_id = ? AND status = 'PENDING' ORDER BY id",
            BET_COLUMNS
        );
        self.fetch_bets(&sql, round_id).await
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<Bet>> {
        let sql = format!(
            "SELECT {} FROM bets WHERE user_id = ? ORDER BY placed_at DESC, id DESC",
            BET_COLUMNS
        );
        self.fetch_bets(&sql, user_id).await
    }

    async fn totals_by_card(&self, round_id: RoundId) -> Result<Vec<CardTotal>> {
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT card_id, COUNT(*), SUM(amount_minor) FROM bets
             WHERE round_id = ? GROUP BY card_id ORDER BY card_id",
        )
        .bind(round_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(card_id, count, total)| CardTotal {
                card_id,
                bet_count: count.max(0) as u64,
                total_amount: from_minor(total),
            })
            .collect())
    }

    async fn settle_bulk(&self, outcomes: &[BetOutcome], at: DateTime<Utc>) -> Result<u64> {
        if outcomes.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for outcome in outcomes {
            let result = sqlx::query(
                "UPDATE bets SET status = ?, result_minor = ?, settled_at = ?
                 WHERE id = ? AND status = 'PENDING'",
            )
            .bind(outcome.status.as_str())
            .bind(to_minor(outcome.result_amount)?)
            .bind(to_ms(at))
            .bind(outcome.bet_id)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn unpaid_wins(&self, round_id: RoundId) -> Result<Vec<Payout>> {
        let rows: Vec<(i64, i64, Option<i64>)> = sqlx::query_as(
            "SELECT id, user_id, result_minor FROM bets
             WHERE round_id = ? AND status = 'WIN' AND credited_at IS NULL ORDER BY id",
        )
        .bind(round_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(bet_id, user_id, result)| {
                let minor = result
                    .ok_or_else(|| GameError::Corrupt(format!("winning bet {} has no result", bet_id)))?;
                Ok(Payout {
                    bet_id,
                    user_id,
                    amount: from_minor(minor),
                })
            })
            .collect()
    }
}

#[async_trait]
impl CardRepository for Database {
    async fn find_all(&self) -> Result<Vec<Card>> {
        let rows = sqlx::query_as::<_, CardRow>("SELECT id, name, image FROM cards ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Card::from).collect())
    }

    async fn find_card(&self, card_id: CardId) -> Result<Option<Card>> {
        let row = sqlx::query_as::<_, CardRow>("SELECT id, name, image FROM cards WHERE id = ?")
            .bind(card_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Card::from))
    }

    async fn pick_random(&self) -> Result<Option<Card>> {
        let row = sqlx::query_as::<_, CardRow>(
            "SELECT id, name, image FROM cards ORDER BY RANDOM() LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Card::from))
    }

    async fn upsert(&self, name: &str, image: &str) -> Result<Card> {
        sqlx::query(
            "INSERT INTO cards (name, image, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(image)
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, CardRow>("SELECT id, name, image FROM cards WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }
}

#[async_trait]
impl Ledger for Database {
    async fn create_user(&self, name: &str, at: DateTime<Utc>) -> Result<User> {
        let result = sqlx::query(
            "INSERT INTO users (name, balance_minor, created_at, updated_at) VALUES (?, 0, ?, ?)",
        )
        .bind(name)
        .bind(to_ms(at))
        .bind(to_ms(at))
        .execute(&self.pool)
        .await?;

        Ok(User {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            balance: Decimal::ZERO,
            created_at: from_ms(to_ms(at))?,
        })
    }

    async fn find_user(&self, user_id: UserId) -> Result<Option<User>> {
        sqlx::query_as::<_, UserRow>(
            "SELECT id, name, balance_minor, created_at FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .map(User::try_from)
        .transpose()
    }

    async fn adjust(
        &self,
        user_id: UserId,
        delta: Decimal,
        reference: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<User> {
        let delta_minor = to_minor(delta)?;
        if delta_minor == 0 {
            return Err(GameError::InvalidAmount("adjustment must not be zero".into()));
        }

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE users SET balance_minor = balance_minor + ?, updated_at = ?
             WHERE id = ? AND balance_minor + ? >= 0",
        )
        .bind(delta_minor)
        .bind(to_ms(at))
        .bind(user_id)
        .bind(delta_minor)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let err = Self::debit_failure(&mut tx, user_id, -delta).await?;
            tx.rollback().await?;
            return Err(err);
        }

        let kind = if delta_minor > 0 {
            LedgerEntryKind::Deposit
        } else {
            LedgerEntryKind::Withdraw
        };
        Self::insert_entry(
            &mut tx,
            user_id,
            kind,
            delta_minor,
            EntryStatus::Completed,
            reference.as_deref(),
            at,
        )
        .await?;

        let user = Self::fetch_user_in(&mut tx, user_id)
            .await?
            .ok_or_else(|| GameError::not_found("User", user_id))?;
        tx.commit().await?;
        Ok(user)
    }

    async fn place_bet(&self, request: &BetRequest, at: DateTime<Utc>) -> Result<Bet> {
        let amount_minor = to_minor(request.amount)?;
        let mut tx = self.pool.begin().await?;

        // Debit first: the write lock it takes serializes the round check
        // below against a concurrent close.
        let debit = sqlx::query(
            "UPDATE users SET balance_minor = balance_minor - ?, updated_at = ?
             WHERE id = ? AND balance_minor >= ?",
        )
        .bind(amount_minor)
        .bind(to_ms(at))
        .bind(request.user_id)
        .bind(amount_minor)
        .execute(&mut *tx)
        .await?;

        if debit.rows_affected() == 0 {
            let err = Self::debit_failure(&mut tx, request.user_id, request.amount).await?;
            tx.rollback().await?;
            return Err(err);
        }

        let state: Option<String> = sqlx::query_scalar("SELECT state FROM rounds WHERE round_id = ?")
            .bind(request.round_id)
            .fetch_optional(&mut *tx)
            .await?;
        let rejection = match state.as_deref() {
            None => Some(GameError::not_found("Round", request.round_id)),
            Some("OPEN") => None,
            Some(_) => Some(GameError::RoundClosed(request.round_id)),
        };
        if let Some(err) = rejection {
            tx.rollback().await?;
            return Err(err);
        }

        let card: Option<i64> = sqlx::query_scalar("SELECT id FROM cards WHERE id = ?")
            .bind(request.card_id)
            .fetch_optional(&mut *tx)
            .await?;
        if card.is_none() {
            tx.rollback().await?;
            return Err(GameError::not_found("Card", request.card_id));
        }

        let inserted = sqlx::query(
            "INSERT INTO bets (round_id, user_id, card_id, amount_minor, status, placed_at)
             VALUES (?, ?, ?, ?, 'PENDING', ?)",
        )
        .bind(request.round_id)
        .bind(request.user_id)
        .bind(request.card_id)
        .bind(amount_minor)
        .bind(to_ms(at))
        .execute(&mut *tx)
        .await?;
        let bet_id = inserted.last_insert_rowid();

        let reference = format!("bet:{}", bet_id);
        Self::insert_entry(
            &mut tx,
            request.user_id,
            LedgerEntryKind::Bet,
            -amount_minor,
            EntryStatus::Completed,
            Some(&reference),
            at,
        )
        .await?;
        tx.commit().await?;

        Ok(Bet {
            id: bet_id,
            round_id: request.round_id,
            user_id: request.user_id,
            card_id: request.card_id,
            amount: from_minor(amount_minor),
            status: BetStatus::Pending,
            result_amount: None,
            placed_at: from_ms(to_ms(at))?,
            settled_at: None,
            credited_at: None,
        })
    }

    async fn credit_payouts(&self, payouts: &[Payout], at: DateTime<Utc>) -> Result<u64> {
        if payouts.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut credited = 0;
        for payout in payouts {
            let marked = sqlx::query(
                "UPDATE bets SET credited_at = ?
                 WHERE id = ? AND status = 'WIN' AND credited_at IS NULL",
            )
            .bind(to_ms(at))
            .bind(payout.bet_id)
            .execute(&mut *tx)
            .await?;
            if marked.rows_affected() == 0 {
                continue;
            }

            let amount_minor = to_minor(payout.amount)?;
            let updated = sqlx::query(
                "UPDATE users SET balance_minor = balance_minor + ?, updated_at = ? WHERE id = ?",
            )
            .bind(amount_minor)
            .bind(to_ms(at))
            .bind(payout.user_id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(GameError::not_found("User", payout.user_id));
            }

            let reference = format!("bet:{}", payout.bet_id);
            Self::insert_entry(
                &mut tx,
                payout.user_id,
                LedgerEntryKind::Win,
                amount_minor,
                EntryStatus::Completed,
                Some(&reference),
                at,
            )
            .await?;
            credited += 1;
        }
        tx.commit().await?;
        Ok(credited)
    }

    async fn request_withdraw(
        &self,
        user_id: UserId,
        amount: Decimal,
        destination: &str,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let amount_minor = to_minor(amount)?;
        if amount_minor <= 0 {
            return Err(GameError::InvalidAmount(format!(
                "{} must be greater than zero",
                amount
            )));
        }

        let mut tx = self.pool.begin().await?;
        let debit = sqlx::query(
            "UPDATE users SET balance_minor = balance_minor - ?, updated_at = ?
             WHERE id = ? AND balance_minor >= ?",
        )
        .bind(amount_minor)
        .bind(to_ms(at))
        .bind(user_id)
        .bind(amount_minor)
        .execute(&mut *tx)
        .await?;

        if debit.rows_affected() == 0 {
            let err = Self::debit_failure(&mut tx, user_id, amount).await?;
            tx.rollback().await?;
            return Err(err);
        }

        let id = Self::insert_entry(
            &mut tx,
            user_id,
            LedgerEntryKind::Withdraw,
            -amount_minor,
            EntryStatus::Pending,
            Some(destination),
            at,
        )
        .await?;
        tx.commit().await?;

        Ok(LedgerEntry {
            id,
            user_id,
            kind: LedgerEntryKind::Withdraw,
            amount: from_minor(-amount_minor),
            status: EntryStatus::Pending,
            reference: Some(destination.to_string()),
            created_at: from_ms(to_ms(at))?,
        })
    }

    async fn pending_withdrawals(&self) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE kind = 'WITHDRAW' AND status = 'PENDING'
             ORDER BY created_at, id",
            LEDGER_COLUMNS
        );
        sqlx::query_as::<_, LedgerRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(LedgerEntry::try_from)
            .collect()
    }

    async fn entries_for_user(&self, user_id: UserId) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE user_id = ? ORDER BY created_at DESC, id DESC",
            LEDGER_COLUMNS
        );
        sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(LedgerEntry::try_from)
            .collect()
    }

    async fn statistics(&self) -> Result<Statistics> {
        let (users, bets, rounds, cards): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM users), (SELECT COUNT(*) FROM bets),
                    (SELECT COUNT(*) FROM rounds), (SELECT COUNT(*) FROM cards)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(Statistics {
            users: users.max(0) as u64,
            bets: bets.max(0) as u64,
            rounds: rounds.max(0) as u64,
            cards: cards.max(0) as u64,
        })
    }
}
