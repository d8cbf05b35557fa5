//! Configuration management

use crate::clock::{parse_offset, TimeAligner};
use crate::error::{GameError, Result};
use chrono::{Duration, FixedOffset};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Top-level configuration, read from TOML and `GAME__*` environment variables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_db_path() -> String {
    "data/card_rounds.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

/// Round boundaries and tick offsets. Offsets count minutes from the start
/// of a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Display name of the civil timezone, e.g. "Asia/Kolkata"
    #[serde(default = "default_timezone_name")]
    pub timezone_name: String,
    /// Fixed UTC offset of that timezone, e.g. "+05:30"
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default = "default_round_length_mins")]
    pub round_length_mins: u32,
    #[serde(default)]
    pub create_offset_mins: u32,
    #[serde(default = "default_close_offset_mins")]
    pub close_offset_mins: u32,
    #[serde(default = "default_settle_offset_mins")]
    pub settle_offset_mins: u32,
    #[serde(default = "default_health_check_interval_mins")]
    pub health_check_interval_mins: u32,
    #[serde(default = "default_tick_timeout_secs")]
    pub tick_timeout_secs: u64,
    /// Also create the next boundary's round on the create tick
    #[serde(default = "default_true")]
    pub precreate_next: bool,
}

fn default_timezone_name() -> String {
    "Asia/Kolkata".to_string()
}

fn default_utc_offset() -> String {
    "+05:30".to_string()
}

fn default_round_length_mins() -> u32 {
    60
}

fn default_close_offset_mins() -> u32 {
    55
}

fn default_settle_offset_mins() -> u32 {
    59
}

fn default_health_check_interval_mins() -> u32 {
    15
}

fn default_tick_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone_name: default_timezone_name(),
            utc_offset: default_utc_offset(),
            round_length_mins: default_round_length_mins(),
            create_offset_mins: 0,
            close_offset_mins: default_close_offset_mins(),
            settle_offset_mins: default_settle_offset_mins(),
            health_check_interval_mins: default_health_check_interval_mins(),
            tick_timeout_secs: default_tick_timeout_secs(),
            precreate_next: true,
        }
    }
}

impl ScheduleConfig {
    pub fn offset(&self) -> Result<FixedOffset> {
        parse_offset(&self.utc_offset).ok_or_else(|| {
            GameError::InvalidConfig(format!("bad utc_offset {:?}", self.utc_offset))
        })
    }

    pub fn aligner(&self) -> Result<TimeAligner> {
        Ok(TimeAligner::new(self.offset()?, self.round_length()))
    }

    pub fn round_length(&self) -> Duration {
        Duration::minutes(i64::from(self.round_length_mins))
    }

    pub fn create_offset(&self) -> Duration {
        Duration::minutes(i64::from(self.create_offset_mins))
    }

    pub fn close_offset(&self) -> Duration {
        Duration::minutes(i64::from(self.close_offset_mins))
    }

    pub fn settle_offset(&self) -> Duration {
        Duration::minutes(i64::from(self.settle_offset_mins))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::minutes(i64::from(self.health_check_interval_mins))
    }

    pub fn tick_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        self.offset()?;
        let len = self.round_length_mins;
        if len == 0 || (24 * 60) % len != 0 {
            return Err(GameError::InvalidConfig(format!(
                "round_length_mins {} must divide a day",
                len
            )));
        }
        if !(self.create_offset_mins < self.close_offset_mins
            && self.close_offset_mins < self.settle_offset_mins
            && self.settle_offset_mins < len)
        {
            return Err(GameError::InvalidConfig(format!(
                "offsets must satisfy create ({}) < close ({}) < settle ({}) < round length ({})",
                self.create_offset_mins, self.close_offset_mins, self.settle_offset_mins, len
            )));
        }
        if self.health_check_interval_mins == 0 {
            return Err(GameError::InvalidConfig(
                "health_check_interval_mins must be positive".into(),
            ));
        }
        if self.tick_timeout_secs == 0 {
            return Err(GameError::InvalidConfig(
                "tick_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSeed {
    pub name: String,
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    /// Winning bets return stake x multiplier
    #[serde(default = "default_payout_multiplier")]
    pub payout_multiplier: Decimal,
    /// Card set inserted on startup if missing
    #[serde(default = "default_cards")]
    pub cards: Vec<CardSeed>,
}

fn default_payout_multiplier() -> Decimal {
    Decimal::from(11)
}

fn default_cards() -> Vec<CardSeed> {
    [
        "Ace", "King", "Queen", "Jack", "Ten", "Nine", "Eight", "Seven", "Six", "Five", "Four",
        "Three",
    ]
    .iter()
    .map(|name| CardSeed {
        name: name.to_string(),
        image: format!("cards/{}.png", name.to_lowercase()),
    })
    .collect()
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            payout_multiplier: default_payout_multiplier(),
            cards: default_cards(),
        }
    }
}

impl GameConfig {
    pub fn validate(&self) -> Result<()> {
        if self.payout_multiplier <= Decimal::ONE {
            return Err(GameError::InvalidConfig(format!(
                "payout_multiplier {} must be greater than 1",
                self.payout_multiplier
            )));
        }
        if self.cards.is_empty() {
            return Err(GameError::InvalidConfig("card set is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:5001".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

impl Config {
    /// Load `.env`, then the TOML file (optional), then `GAME__SECTION__KEY`
    /// environment overrides
    pub fn load(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("GAME")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;
        self.game.validate()?;
        Ok(())
    }
}
