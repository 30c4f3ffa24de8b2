//! Command-line surface (§6). The teacher's `main` reads a couple of env
//! vars directly and has no subcommands; this crate's operator surface is
//! closer to the original's `cli/` scripts, so it gets a small `clap`
//! derive CLI instead: `run` (the steady-state process), `fetch` (one-shot
//! balance/position snapshot), `order` (place a single manual order), and
//! `check-config` (load + validate without connecting anywhere).

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "xvenue-arb", about = "Cross-venue latency arbitrage engine")]
pub struct Cli {
    /// Deployment environment, selects `configs/{env}.json` layered over
    /// `configs/common.json`.
    #[arg(short = 'e', long = "env", global = true, default_value = "dev")]
    pub env: String,

    /// Directory holding `common.json` and `{env}.json`.
    #[arg(long = "config-dir", global = true, default_value = "configs")]
    pub config_dir: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the full steady-state process: fanout, aggregator, position and
    /// funding trackers, threshold engine, health monitor, balance
    /// refresher, signal generator/dispatcher/dealer, aligner, order-status
    /// streams, and the HTTP balance API.
    Run,
    /// Print a one-shot balance and position snapshot for both venues, then
    /// exit.
    Fetch,
    /// Place a single manual order against one venue, bypassing the signal
    /// pipeline. Intended for operator intervention, not steady-state use.
    Order {
        #[arg(long)]
        venue: String,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        side: String,
        #[arg(long)]
        qty: String,
        #[arg(long)]
        price: Option<String>,
    },
    /// Load and validate the merged config, reporting any errors, without
    /// connecting to Redis or either venue.
    CheckConfig,
}
