//! Spot Trading Bot CLI
//!
//! `run` starts the unattended scheduler loop; the remaining commands are
//! operator utilities over the shared state store. They never run a trading
//! step themselves; all transitions belong to the scheduler process.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use rust_decimal::Decimal;
use spot_bot::{BinanceConnector, Config, Database, Scheduler, Side};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "spot-bot")]
#[command(about = "Unattended multi-user spot trading bot")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop until the process exits
    Run,

    /// Show a user's current trading state
    Status {
        /// User id
        user: i64,
    },

    /// Show a user's trade history
    Trades {
        /// User id
        user: i64,

        /// Maximum number of trades to show
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },

    /// Show a user's trading performance
    Stats {
        /// User id
        user: i64,
    },

    /// Enable trading for a user
    Enable {
        /// User id
        user: i64,
    },

    /// Disable trading for a user (state is kept)
    Disable {
        /// User id
        user: i64,
    },

    /// Store venue API credentials for a user
    SetKeys {
        /// User id
        user: i64,

        /// Venue API key
        #[arg(long)]
        api_key: String,

        /// Venue API secret
        #[arg(long)]
        api_secret: String,

        /// Use the venue testnet
        #[arg(long)]
        sandbox: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    // Load configuration
    let config = Config::from_env()?;

    match cli.command {
        Commands::Run => run_loop(&config).await?,
        Commands::Status { user } => show_status(&config, user).await?,
        Commands::Trades { user, limit } => show_trades(&config, user, limit).await?,
        Commands::Stats { user } => show_stats(&config, user).await?,
        Commands::Enable { user } => set_enabled(&config, user, true).await?,
        Commands::Disable { user } => set_enabled(&config, user, false).await?,
        Commands::SetKeys {
            user,
            api_key,
            api_secret,
            sandbox,
        } => set_keys(&config, user, &api_key, &api_secret, sandbox).await?,
    }

    Ok(())
}

async fn run_loop(config: &Config) -> Result<()> {
    println!("\n{}", "=".repeat(70));
    println!("  SPOT BOT SCHEDULER");
    println!(
        "  {} | TP {}% | SL {}% | every {}s",
        config.symbol,
        config.take_profit_rate * Decimal::from(100),
        config.stop_loss_rate * Decimal::from(100),
        config.loop_interval_seconds
    );
    println!("{}\n", "=".repeat(70));

    let db = Arc::new(Database::new(&config.database_path).await?);
    let connector = Arc::new(BinanceConnector::new(config.clone()));
    let scheduler = Scheduler::new(db, config.clone(), connector, None);

    scheduler.run().await;
    Ok(())
}

async fn show_status(config: &Config, user: i64) -> Result<()> {
    let db = Database::new(&config.database_path).await?;

    let Some(state) = db.get_state(user).await? else {
        println!("No state for user {user} yet; it is created on the first scheduler step.");
        return Ok(());
    };

    let has_keys = db.get_credentials(user).await?.is_some();

    println!("\n{}", "=".repeat(70));
    println!("  USER {user} | {}", config.symbol);
    println!("{}\n", "=".repeat(70));

    let enabled = if state.enabled {
        "ENABLED".green()
    } else {
        "DISABLED".red()
    };
    println!("Bot:        {enabled}");
    println!(
        "API keys:   {}",
        if has_keys { "on file" } else { "missing" }
    );
    println!("Cash:       {} {}", state.cash, config.quote_asset);
    println!("Asset:      {} {}", state.asset, config.base_asset);

    match state.position.entry() {
        None => println!("Position:   FLAT"),
        Some(entry) => {
            let target = entry.price * (Decimal::ONE + config.take_profit_rate);
            let stop = entry.price * (Decimal::ONE - config.stop_loss_rate);
            println!("Position:   {}", "LONG".yellow());
            println!(
                "  Entry:        {} {} at {}",
                entry.qty, config.base_asset, entry.price
            );
            println!("  Take profit:  {target}");
            println!("  Stop loss:    {stop}");
            println!(
                "  Entered at:   {}",
                entry.time.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }

    if let Some(at) = state.last_step_at {
        println!("Last step:  {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    } else {
        println!("Last step:  never");
    }

    if let Some(err) = &state.last_error {
        println!("Last error: {}", err.red());
    }

    println!();
    Ok(())
}

async fn show_trades(config: &Config, user: i64, limit: i64) -> Result<()> {
    let db = Database::new(&config.database_path).await?;
    let trades = db.list_trades(user, limit).await?;

    if trades.is_empty() {
        println!("No trades for user {user} yet.");
        return Ok(());
    }

    println!("\n{}", "=".repeat(70));
    println!("  TRADES | USER {user} (most recent first)");
    println!("{}\n", "=".repeat(70));

    for trade in &trades {
        let side = match trade.side {
            Side::Buy => "BUY ".green(),
            Side::Sell => "SELL".red(),
        };
        let pnl = trade.pnl.map(|p| format!(" pnl={p}")).unwrap_or_default();
        println!(
            "{} {} {} @ {} qty={} fee={} [{}]{}",
            trade.time.format("%Y-%m-%d %H:%M:%S"),
            side,
            trade.symbol,
            trade.price,
            trade.qty,
            trade.fee,
            trade.reason,
            pnl
        );
    }

    println!("\n{} trade(s)\n", trades.len());
    Ok(())
}

async fn show_stats(config: &Config, user: i64) -> Result<()> {
    let db = Database::new(&config.database_path).await?;
    let stats = db.trade_stats(user).await?;

    println!("\n{}", "=".repeat(70));
    println!("  PERFORMANCE | USER {user}");
    println!("{}\n", "=".repeat(70));

    println!("Closed trades: {}", stats.sells);
    println!("Wins/Losses:   {}W / {}L", stats.wins, stats.losses);
    println!("Win rate:      {:.1}%", stats.win_rate());
    println!(
        "Realized PnL:  {} {}",
        stats.realized_pnl, config.quote_asset
    );
    println!();
    Ok(())
}

async fn set_enabled(config: &Config, user: i64, enabled: bool) -> Result<()> {
    let db = Database::new(&config.database_path).await?;

    if enabled && db.get_credentials(user).await?.is_none() {
        println!(
            "{}",
            "Warning: no API keys on file; the scheduler will skip this user until keys are set."
                .yellow()
        );
    }

    db.set_enabled(user, enabled).await?;
    println!(
        "User {user} {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

async fn set_keys(
    config: &Config,
    user: i64,
    api_key: &str,
    api_secret: &str,
    sandbox: bool,
) -> Result<()> {
    let db = Database::new(&config.database_path).await?;
    db.upsert_credentials(user, api_key, api_secret, sandbox)
        .await?;
    println!(
        "Stored API keys for user {user} ({})",
        if sandbox { "testnet" } else { "live" }
    );
    Ok(())
}
