//! Command line of the `search-sync` binary.

use bidstream_core::envelope::EnvelopeId;
use clap::{Parser, Subcommand};

/// Keeps the auction search read model in sync and manages its faults.
#[derive(Parser, Debug)]
#[command(name = "search-sync")]
#[command(about = "Auction search projection consumer and fault operator tool")]
pub struct SearchSyncCli {
    /// What to do; defaults to `run`.
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl SearchSyncCli {
    /// The requested command, `run` when none was given.
    #[must_use]
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

/// `search-sync` subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Consume auction events into the search read model until stopped.
    Run,

    /// List pending fault entries, oldest first.
    Faults {
        /// Maximum entries to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Re-publish one fault entry to its original topic.
    Replay {
        /// Envelope id of the entry
        envelope_id: EnvelopeId,
    },

    /// Re-publish the oldest pending fault entries.
    ReplayPending {
        /// Maximum entries to replay
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// Drop one fault entry on purpose.
    Discard {
        /// Envelope id of the entry
        envelope_id: EnvelopeId,

        /// Why it is safe to drop; stored with the entry
        #[arg(short, long)]
        reason: String,
    },

    /// Dead-letter stashed updates whose predecessor never arrived within retention.
    ExpireStash,
}
