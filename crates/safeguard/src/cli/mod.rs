//! Command-line interface for safeguard.
//!
//! This module provides the CLI structure for the `safeguard` binary, the
//! reference presentation layer over the emergency core.

mod commands;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::logging::Verbosity;

pub use commands::{
    AddContactArgs, ConfigCommand, ContactsCommand, HistoryCommand, SosCommand, UpdateContactArgs,
};

/// safeguard - Raise an SOS and alert your trusted contacts
///
/// Manages emergency contacts and runs emergency sessions: location
/// tracking, trusted-contact alerts and the auto-cancel countdown.
#[derive(Debug, Parser)]
#[command(name = "safeguard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage emergency contacts
    #[command(subcommand)]
    Contacts(ContactsCommand),

    /// Start an emergency session
    Sos(SosCommand),

    /// Show past emergency sessions
    History(HistoryCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.verbose, self.quiet)
    }
}

/// Wait until an `sos` session should be resolved.
///
/// With a duration, resolves once it has elapsed. Otherwise resolves when
/// `interrupt` fires; if the interrupt cannot be listened for, the failure is
/// logged and this waits forever rather than ending the session.
pub async fn wait_for_resolution<F>(after: Option<Duration>, interrupt: F)
where
    F: Future<Output = io::Result<()>>,
{
    if let Some(after) = after {
        tokio::time::sleep(after).await;
        return;
    }
    if let Err(e) = interrupt.await {
        warn!(error = %e, "Cannot listen for Ctrl-C, session stays active; use --for to bound it");
        std::future::pending::<()>().await;
    }
}
