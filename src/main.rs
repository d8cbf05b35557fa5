//! Hourly Card Rounds
//!
//! Runs the round scheduler and HTTP API, plus a few admin commands.

use card_rounds::{
    api::{self, ApiState},
    betting::BetService,
    clock::{Clock, SystemClock},
    config::Config,
    query::RoundQuery,
    scheduler::{RoundScheduler, TickKind},
    settlement::SettlementEngine,
    storage::{Database, Repositories},
    types::{LedgerEntry, LedgerEntryKind, UserId},
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "card-rounds")]
#[command(about = "Hourly card betting rounds: scheduler, settlement and API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and the HTTP API
    Run {
        /// Scheduler only
        #[arg(long)]
        no_api: bool,
    },
    /// List rounds of a day with their bet totals
    Rounds {
        /// Local date (YYYY-MM-DD), today when omitted
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },
    /// Fire one scheduler tick now (create, close, settle, health)
    Tick {
        kind: TickKind,
    },
    /// Create a user with a zero balance
    AddUser {
        name: String,
    },
    /// Credit a user's balance
    Deposit {
        user_id: UserId,
        amount: Decimal,
    },
    /// Debit a user's balance
    Withdraw {
        user_id: UserId,
        amount: Decimal,
    },
    /// Show a user's balance and recent bets
    Balance {
        user_id: UserId,
    },
    /// Show a user's balance movements, newest first
    Transactions {
        user_id: UserId,
        /// Only one kind: BET, WIN, DEPOSIT or WITHDRAW
        #[arg(short, long)]
        kind: Option<LedgerEntryKind>,
    },
    /// List withdrawal requests awaiting payout
    WithdrawRequests,
    /// Show counts of users, bets, rounds and cards
    Stats,
}

/// Store and repositories shared by every command
struct Services {
    repos: Repositories,
    clock: Arc<dyn Clock>,
}

impl Services {
    async fn open(config: &Config) -> anyhow::Result<Self> {
        let db = Database::connect_with(&config.database).await?;
        let cards = db.seed_cards(&config.game.cards).await?;
        tracing::debug!("{} cards available", cards.len());
        Ok(Self {
            repos: Repositories::from_store(Arc::new(db)),
            clock: Arc::new(SystemClock),
        })
    }

    fn scheduler(&self, config: &Config) -> anyhow::Result<RoundScheduler> {
        let engine = Arc::new(SettlementEngine::new(
            self.repos.clone(),
            config.game.payout_multiplier,
        ));
        Ok(RoundScheduler::new(
            self.clock.clone(),
            self.repos.clone(),
            config.schedule.clone(),
            engine,
        )?)
    }

    fn bets(&self) -> BetService {
        BetService::new(self.repos.clone(), self.clock.clone())
    }

    fn query(&self, config: &Config) -> anyhow::Result<RoundQuery> {
        Ok(RoundQuery::new(
            self.repos.clone(),
            self.clock.clone(),
            &config.schedule,
        )?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Run { no_api } => run_service(config, no_api).await,
        Commands::Rounds { date } => show_rounds(config, date).await,
        Commands::Tick { kind } => fire_tick(config, kind).await,
        Commands::AddUser { name } => add_user(config, &name).await,
        Commands::Deposit { user_id, amount } => adjust_balance(config, user_id, amount, false).await,
        Commands::Withdraw { user_id, amount } => adjust_balance(config, user_id, amount, true).await,
        Commands::Balance { user_id } => show_balance(config, user_id).await,
        Commands::Transactions { user_id, kind } => show_transactions(config, user_id, kind).await,
        Commands::WithdrawRequests => show_withdraw_requests(config).await,
        Commands::Stats => show_stats(config).await,
    }
}

async fn run_service(config: Config, no_api: bool) -> anyhow::Result<()> {
    tracing::info!(
        "Starting card rounds ({} {}, payout x{})",
        config.schedule.timezone_name,
        config.schedule.utc_offset,
        config.game.payout_multiplier
    );

    let services = Services::open(&config).await?;
    let scheduler = Arc::new(services.scheduler(&config)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown_rx.clone();
        async move { scheduler.run(shutdown).await }
    });

    let api_task = if config.api.enabled && !no_api {
        let state = Arc::new(ApiState {
            bets: services.bets(),
            rounds: services.query(&config)?,
        });
        let bind = config.api.bind.clone();
        let mut shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let stopped = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            if let Err(e) = api::serve(state, &bind, stopped).await {
                tracing::error!("API server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("HTTP API disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    scheduler_task.await?;
    if let Some(task) = api_task {
        task.await?;
    }
    Ok(())
}

async fn show_rounds(config: Config, date: Option<NaiveDate>) -> anyhow::Result<()> {
    let services = Services::open(&config).await?;
    let query = services.query(&config)?;
    let rounds = match date {
        Some(date) => query.rounds_for_date(date).await?,
        None => query.rounds_today().await?,
    };

    println!(
        "{:>6} {:<26} {:<10} {:<11} {:>5} {:>12} {:<10}",
        "Round", "Starts", "State", "Status", "Bets", "Staked", "Winner"
    );
    println!("{}", "-".repeat(86));
    let offset = config.schedule.offset()?;
    for round in rounds {
        let starts = round.combo.with_timezone(&offset);
        println!(
            "{:>6} {:<26} {:<10} {:<11} {:>5} {:>12} {:<10}",
            round.round_id,
            starts.format("%Y-%m-%d %H:%M %:z").to_string(),
            round.state.to_string(),
            format!("{:?}", round.status).to_lowercase(),
            round.bet_count,
            round.total_amount,
            round.winning_card.map(|c| c.name).unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

async fn fire_tick(config: Config, kind: TickKind) -> anyhow::Result<()> {
    let services = Services::open(&config).await?;
    let scheduler = services.scheduler(&config)?;
    let outcome = scheduler.fire(kind).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn add_user(config: Config, name: &str) -> anyhow::Result<()> {
    let services = Services::open(&config).await?;
    let user = services.bets().create_user(name).await?;
    println!("Created user {} ({})", user.id, user.name);
    Ok(())
}

async fn adjust_balance(
    config: Config,
    user_id: UserId,
    amount: Decimal,
    withdraw: bool,
) -> anyhow::Result<()> {
    let services = Services::open(&config).await?;
    let bets = services.bets();
    let user = if withdraw {
        bets.withdraw(user_id, amount).await?
    } else {
        bets.deposit(user_id, amount).await?
    };
    println!("User {} balance: {}", user.id, user.balance);
    Ok(())
}

async fn show_balance(config: Config, user_id: UserId) -> anyhow::Result<()> {
    let services = Services::open(&config).await?;
    let bets = services.bets();
    let user = bets.user(user_id).await?;

    println!("\nUser {} ({})", user.id, user.name);
    println!("Balance: {}", user.balance);

    let history = bets.user_bets(user_id).await?;
    if !history.is_empty() {
        println!("\nRecent bets:");
        for bet in history.iter().take(10) {
            println!(
                "  #{} round {} card {} stake {} {} {}",
                bet.id,
                bet.round_id,
                bet.card_id,
                bet.amount,
                bet.status,
                bet.result_amount.map(|r| r.to_string()).unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn print_entries(entries: &[LedgerEntry]) {
    println!(
        "{:>6} {:>6} {:<9} {:>12} {:<10} {:<20} {:<20}",
        "Id", "User", "Kind", "Amount", "Status", "Reference", "At"
    );
    println!("{}", "-".repeat(89));
    for entry in entries {
        println!(
            "{:>6} {:>6} {:<9} {:>12} {:<10} {:<20} {:<20}",
            entry.id,
            entry.user_id,
            entry.kind.to_string(),
            entry.amount,
            entry.status.as_str(),
            entry.reference.as_deref().unwrap_or("-"),
            entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string()
        );
    }
}

async fn show_transactions(
    config: Config,
    user_id: UserId,
    kind: Option<LedgerEntryKind>,
) -> anyhow::Result<()> {
    let services = Services::open(&config).await?;
    let entries = services.bets().ledger_entries(user_id, kind).await?;
    print_entries(&entries);
    Ok(())
}

async fn show_withdraw_requests(config: Config) -> anyhow::Result<()> {
    let services = Services::open(&config).await?;
    let pending = services.bets().pending_withdrawals().await?;
    if pending.is_empty() {
        println!("No pending withdrawal requests");
        return Ok(());
    }
    print_entries(&pending);
    Ok(())
}

async fn show_stats(config: Config) -> anyhow::Result<()> {
    let services = Services::open(&config).await?;
    let stats = services.query(&config)?.statistics().await?;
    println!("Users:  {}", stats.users);
    println!("Bets:   {}", stats.bets);
    println!("Rounds: {}", stats.rounds);
    println!("Cards:  {}", stats.cards);
    Ok(())
}
