//! Database schema creation.
//!
//! Amounts are integer hundredths; instants are unix milliseconds.

use sqlx::SqlitePool;

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cards (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        image TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        balance_minor INTEGER NOT NULL DEFAULT 0 CHECK (balance_minor >= 0),
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    // round_id is the rowid, so it is also the ascending index
    "CREATE TABLE IF NOT EXISTS rounds (
        round_id INTEGER PRIMARY KEY,
        combo_ts INTEGER NOT NULL UNIQUE,
        date_bucket TEXT NOT NULL,
        state TEXT NOT NULL CHECK (state IN ('OPEN', 'CLOSED', 'PROCESSED')),
        winning_card_id INTEGER REFERENCES cards(id),
        result_declared_at INTEGER,
        closed_at INTEGER,
        processed_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_rounds_date ON rounds(date_bucket)",
    "CREATE INDEX IF NOT EXISTS idx_rounds_state ON rounds(state, combo_ts)",
    "CREATE TABLE IF NOT EXISTS bets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        round_id INTEGER NOT NULL REFERENCES rounds(round_id),
        user_id INTEGER NOT NULL REFERENCES users(id),
        card_id INTEGER NOT NULL REFERENCES cards(id),
        amount_minor INTEGER NOT NULL CHECK (amount_minor > 0),
        status TEXT NOT NULL DEFAULT 'PENDING' CHECK (status IN ('PENDING', 'WIN', 'LOSS')),
        result_minor INTEGER,
        placed_at INTEGER NOT NULL,
        settled_at INTEGER,
        credited_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_bets_round ON bets(round_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_bets_user ON bets(user_id, placed_at DESC)",
    "CREATE TABLE IF NOT EXISTS ledger_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        kind TEXT NOT NULL,
        amount_minor INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'COMPLETED' CHECK (status IN ('COMPLETED', 'PENDING')),
        reference TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_ledger_user ON ledger_entries(user_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_kind ON ledger_entries(kind, status)",
];

/// Create all tables and indexes
pub async fn create_tables(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
