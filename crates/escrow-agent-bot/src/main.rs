//! Escrow deal agent — console bot
//!
//! Drives the full negotiation-to-escrow pipeline against an in-process
//! simulated ledger: chat interactions arrive as console commands, replies
//! and status messages render to stdout, and the watcher reacts to the
//! simulator's escrow events exactly as it would to a live chain's.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use escrow_agent_logic::background::BackgroundTasks;
use escrow_agent_logic::config::AgentConfig;
use escrow_agent_logic::dispatch::{validate_affordances, Interaction};
use escrow_agent_logic::fees;
use escrow_agent_logic::logging::init_logging;
use escrow_agent_logic::orchestrator::Orchestrator;
use escrow_agent_logic::quotes::QuoteService;
use escrow_agent_logic::store::{MemoryStore, NegotiationStore, SqliteStore, TradeStore};
use escrow_agent_logic::types::Role;

mod console;
mod providers;
mod sim_ledger;

use console::ConsoleChat;
use providers::JitterProvider;
use sim_ledger::SimLedger;

/// The UI affordance ids this binary registers, checked against the closed
/// action set at startup.
const REGISTERED_AFFORDANCES: [&str; 9] = [
    "select_role",
    "select_counterparty",
    "submit_terms",
    "set_address",
    "agree",
    "mark_delivered",
    "approve",
    "cancel",
    "quote",
];

const CONSOLE_CHANNEL: &str = "console";
const TRANSCRIPT_FILE: &str = "escrow-agent-transcript.log";

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser)]
#[command(name = "escrow-agent")]
#[command(about = "Chat-driven two-party trade negotiation with on-chain escrow settlement")]
struct Cli {
    /// Path to agent configuration file
    #[arg(short, long, default_value = "agent.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the interactive console bot against the simulated ledger
    Run {
        /// Use the in-memory store instead of SQLite
        #[arg(long)]
        memory: bool,
    },
    /// Print the settlement breakdown for an amount
    Breakdown {
        /// Base amount, e.g. 10.00
        amount: String,
        #[arg(long, default_value_t = 250)]
        fee_bps: u32,
        #[arg(long, default_value_t = 5_000)]
        operator_share_bps: u32,
    },
    /// Query the demo quote providers
    Quote {
        /// Pair symbol, e.g. TOKEN/USD
        pair: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(
        cli.verbose,
        &["escrow_agent_logic", "escrow_agent"],
        "escrow-agent",
    );

    match cli.command {
        Commands::Run { memory } => run(&cli.config, memory).await,
        Commands::Breakdown {
            amount,
            fee_bps,
            operator_share_bps,
        } => breakdown(&amount, fee_bps, operator_share_bps),
        Commands::Quote { pair } => {
            let quotes = demo_quote_service();
            match quotes.quote(&pair).await {
                Ok(price) => println!("{} ~ {}", pair, price),
                Err(e) => println!("{}", e),
            }
            Ok(())
        }
    }
}

fn breakdown(amount: &str, fee_bps: u32, operator_share_bps: u32) -> Result<()> {
    let amount: Decimal = amount
        .parse()
        .with_context(|| format!("'{}' is not a valid amount", amount))?;
    let base = fees::to_base_units(amount)?;
    println!(
        "{}",
        fees::settlement_breakdown(base, fee_bps, operator_share_bps).render()
    );
    Ok(())
}

fn demo_quote_service() -> Arc<QuoteService> {
    let reference = Decimal::new(1_050, 2);
    Arc::new(QuoteService::new(vec![
        Arc::new(JitterProvider::new("alpha", reference, 30, false)),
        Arc::new(JitterProvider::new("beta", reference, 50, false)),
        Arc::new(JitterProvider::new("gamma", reference, 40, true)),
    ]))
}

// ============================================================================
// Interactive run loop
// ============================================================================

async fn run(config_path: &PathBuf, memory: bool) -> Result<()> {
    let config = AgentConfig::load(config_path)?;
    validate_affordances(&REGISTERED_AFFORDANCES)?;

    let (negotiations, trades): (Arc<dyn NegotiationStore>, Arc<dyn TradeStore>) = if memory {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), store)
    } else {
        let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
        (store.clone(), store)
    };

    let ledger = Arc::new(SimLedger::new(&config.manager_address));
    let chat = Arc::new(ConsoleChat::new(&["escrow-agent"]));
    let orchestrator = Orchestrator::new(
        negotiations,
        trades,
        chat,
        ledger.clone(),
        demo_quote_service(),
        (&config).into(),
    );

    let (background, mut failures) = BackgroundTasks::new(config.background_queue_capacity);
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            warn!("Background task '{}' failed: {:#}", failure.label, failure.error);
        }
    });

    let run_id = Uuid::new_v4();
    info!("Escrow agent ready (run {})", run_id);
    print_help();

    let mut current_user = String::from("alice");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(2, ' ');
        let verb = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default().trim();

        match verb {
            "quit" | "exit" => break,
            "help" => {
                print_help();
                continue;
            }
            "user" if !rest.is_empty() => {
                current_user = rest.to_string();
                println!("(speaking as {})", current_user);
                continue;
            }
            "fund" if !rest.is_empty() => {
                // Buyer-side on-chain action, outside the bot's surface
                match ledger.fund(rest) {
                    Ok(()) => println!("(sim) escrow {} funded", rest),
                    Err(e) => println!("(sim) {}", e),
                }
                continue;
            }
            _ => {}
        }

        let Some(interaction) = parse_interaction(&current_user, verb, rest, &config.quote_pair)
        else {
            println!("Unrecognized command '{}'. Type 'help'.", verb);
            continue;
        };
        let reply = orchestrator.handle(interaction).await;
        println!("(to {}) {}", current_user, reply);

        let transcript_line = format!(
            "{} {} {} {}\n",
            chrono::Utc::now().to_rfc3339(),
            run_id,
            current_user,
            reply
        );
        if let Err(e) = background.submit("transcript-append", async move {
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(TRANSCRIPT_FILE)
                .await?;
            file.write_all(transcript_line.as_bytes()).await?;
            Ok(())
        }) {
            warn!("Transcript write skipped: {:#}", e);
        }
    }

    orchestrator.stop_watches().await;
    info!("Escrow agent stopped");
    Ok(())
}

fn parse_interaction(
    user: &str,
    verb: &str,
    rest: &str,
    default_pair: &str,
) -> Option<Interaction> {
    let user_id = user.to_string();
    let channel_id = CONSOLE_CHANNEL.to_string();
    match verb {
        "role" => Role::parse(rest).map(|role| Interaction::SelectRole {
            user_id,
            channel_id,
            role,
        }),
        "counterparty" if !rest.is_empty() => Some(Interaction::SelectCounterparty {
            user_id,
            channel_id,
            counterparty_id: rest.to_string(),
        }),
        "terms" => {
            let (price, description) = rest.split_once(' ')?;
            Some(Interaction::SubmitTerms {
                user_id,
                channel_id,
                description: description.to_string(),
                price: price.to_string(),
            })
        }
        "address" if !rest.is_empty() => Some(Interaction::SetAddress {
            user_id,
            channel_id,
            address: rest.to_string(),
        }),
        "agree" => Some(Interaction::Agree {
            user_id,
            channel_id,
        }),
        "deliver" => Some(Interaction::MarkDelivered {
            user_id,
            channel_id,
        }),
        "approve" => Some(Interaction::Approve {
            user_id,
            channel_id,
        }),
        "cancel" => Some(Interaction::Cancel {
            user_id,
            channel_id,
        }),
        "quote" => Some(Interaction::Quote {
            user_id,
            channel_id,
            pair: if rest.is_empty() {
                default_pair.to_string()
            } else {
                rest.to_string()
            },
        }),
        _ => None,
    }
}

fn print_help() {
    println!(
        "commands:\n  \
         user <id>              speak as another participant\n  \
         role buyer|seller      pick your side\n  \
         counterparty <id>      pick who you trade with\n  \
         terms <price> <desc>   propose the item and price\n  \
         address <0x...>        set your settlement address\n  \
         agree                  agree to the terms\n  \
         fund <escrow_id>       (sim) fund the escrow as the buyer\n  \
         deliver                mark delivered (seller)\n  \
         approve                release funds (buyer)\n  \
         cancel                 cancel the negotiation or escrow\n  \
         quote [pair]           show an indicative price (default from agent.toml)\n  \
         quit"
    );
}
