//! Command-line interface built on clap.
//!
//! [`Cli`] carries the subcommands ([`Command`]) and the global flags
//! (`--config`, `--verbose`, `--json`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Contract intake: idempotent, bounded-concurrency vendor contract review.
#[derive(Debug, Parser)]
#[command(name = "contract-intake", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file (defaults to ./intake.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print debug logs.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Print raw JSON instead of formatted output.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a contract PDF through the pipeline.
    Process {
        /// Path to the contract PDF.
        file: PathBuf,

        /// Sender address recorded with the submission.
        #[arg(long, default_value = "cli@localhost")]
        sender: String,

        /// Subject line recorded with the submission.
        #[arg(long, default_value = "")]
        subject: String,

        /// Idempotency key; repeated submissions with the same key run once.
        #[arg(long)]
        key: Option<String>,

        /// Seconds to wait before returning the deferred response.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List contracts waiting for a human decision.
    ReviewQueue {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// List approved contracts.
    Approved {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Approve a contract that is pending review.
    Approve {
        /// Contract id as shown in the review queue.
        contract_id: String,
    },

    /// Reject a contract that is pending review.
    Reject {
        /// Contract id as shown in the review queue.
        contract_id: String,
    },

    /// Show a single contract record.
    Show {
        contract_id: String,
    },

    /// Show the processing log.
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Run the built-in end-to-end scenarios offline.
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_process_subcommand() {
        let cli = Cli::parse_from([
            "contract-intake",
            "process",
            "msa.pdf",
            "--key",
            "delivery-7",
            "--timeout",
            "5",
        ]);
        match cli.command {
            Command::Process {
                file,
                sender,
                key,
                timeout,
                ..
            } => {
                assert_eq!(file, PathBuf::from("msa.pdf"));
                assert_eq!(sender, "cli@localhost");
                assert_eq!(key.as_deref(), Some("delivery-7"));
                assert_eq!(timeout, Some(5));
            }
            _ => panic!("expected Process command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "contract-intake",
            "--config",
            "custom.toml",
            "--verbose",
            "--json",
            "demo",
        ]);
        assert!(cli.verbose);
        assert!(cli.json);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn cli_parses_review_commands() {
        let cli = Cli::parse_from(["contract-intake", "review-queue", "--limit", "5"]);
        assert!(matches!(cli.command, Command::ReviewQueue { limit: 5, offset: 0 }));

        let cli = Cli::parse_from(["contract-intake", "approve", "ctr-123"]);
        match cli.command {
            Command::Approve { contract_id } => assert_eq!(contract_id, "ctr-123"),
            _ => panic!("expected Approve command"),
        }
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
