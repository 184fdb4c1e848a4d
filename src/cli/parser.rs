//! CLI argument parsing with clap
//!
//! This module defines the command-line interface structure using clap,
//! including all commands, arguments, and their documentation.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::jobs::JobState;

/// Database-coordinated job executor
#[derive(Parser, Debug)]
#[command(name = "lockstep")]
#[command(about = "Database-coordinated asynchronous job executor")]
#[command(long_about = "
Lockstep runs asynchronous, timer and history jobs stored in PostgreSQL.
Any number of nodes can share one database: jobs are claimed with row-level
locks, expired claims are swept back into circulation, and failures are
retried until they land in the dead-letter state.

EXAMPLES:
    # Run the executor until Ctrl-C
    lockstep serve

    # Run with a fixed lock owner and debug logging
    lockstep --verbose serve --lock-owner node-1

    # Check configuration without starting the executor
    lockstep serve --dry-run

    # Apply, preview or roll back schema migrations
    lockstep migrate
    lockstep migrate --dry-run
    lockstep migrate --rollback 1

    # Inspect and repair jobs
    lockstep jobs list --state dead_letter --limit 20
    lockstep jobs retry 5b0f... --retries 3
    lockstep jobs release-worker worker-7
")]
#[command(version = crate::clap_long_version())]
pub struct Cli {
    /// Subcommand to execute; `serve` when omitted
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path
    ///
    /// Load a single TOML file instead of the layered `config/` directory.
    /// `LOCKSTEP_*` environment variables still override its values.
    ///
    /// Example: --config /etc/lockstep/production.toml
    #[arg(short, long, value_name = "FILE", value_parser = super::validation::validate_config_file_path)]
    pub config: Option<PathBuf>,

    /// Override environment detection
    ///
    /// Selects which `{environment}.toml` is layered over `default.toml`.
    ///
    /// Available values: development (dev), staging, production (prod), test
    #[arg(short, long, value_enum)]
    pub env: Option<Environment>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the async executor (default)
    ///
    /// Starts the timer, async and expired-lock loops with the built-in
    /// handlers and runs until Ctrl-C, then shuts down gracefully.
    ///
    /// Examples:
    ///   lockstep serve
    ///   lockstep serve --lock-owner node-1
    ///   lockstep serve --dry-run
    Serve {
        /// Lock owner identity written into claimed rows
        ///
        /// Must be unique per running node. A random one is generated when
        /// neither this flag nor `executor.lock_owner` is set.
        #[arg(long, value_name = "ID", value_parser = super::validation::validate_lock_owner)]
        lock_owner: Option<String>,

        /// Log level override
        ///
        /// Takes precedence over the configuration file and --verbose/--quiet.
        #[arg(long, value_enum)]
        log_level: Option<LogLevel>,

        /// Validate configuration and exit
        #[arg(long)]
        dry_run: bool,
    },
    /// Database migration operations
    ///
    /// Examples:
    ///   lockstep migrate                    # Apply all pending migrations
    ///   lockstep migrate --dry-run          # Show pending migrations
    ///   lockstep migrate --rollback 1       # Revert the newest migration
    Migrate {
        /// Show pending migrations without applying
        #[arg(long, conflicts_with = "rollback")]
        dry_run: bool,

        /// Number of migrations to roll back (1-100)
        #[arg(long, value_name = "STEPS", conflicts_with = "dry_run", value_parser = super::validation::validate_rollback_steps)]
        rollback: Option<u32>,
    },
    /// Inspect and manage stored jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
}

/// Operator commands against the job tables
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum JobsCommand {
    /// Print jobs matching the filter
    List(JobFilterArgs),
    /// Print the number of jobs matching the filter
    Count(JobFilterArgs),
    /// Move a dead-letter job back into circulation
    Retry {
        /// Job id
        id: String,

        /// Retries to grant; the configured default when omitted
        #[arg(long, value_parser = super::validation::validate_retries)]
        retries: Option<i32>,
    },
    /// Delete a job from whichever state it is in
    Delete {
        /// Job id
        id: String,
    },
    /// Exclude a ready or timer job from acquisition
    Suspend {
        /// Job id
        id: String,
    },
    /// Return a suspended job to timer or ready
    Activate {
        /// Job id
        id: String,
    },
    /// Release every external worker job held by a worker
    ReleaseWorker {
        /// Worker id the jobs are locked by
        worker_id: String,

        /// Only release jobs of this tenant
        #[arg(long)]
        tenant: Option<String>,
    },
}

/// Filter shared by `jobs list` and `jobs count`
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct JobFilterArgs {
    /// ready, timer, suspended, dead_letter, history or external_worker
    #[arg(long, value_parser = super::validation::validate_job_state)]
    pub state: Option<JobState>,

    #[arg(long)]
    pub tenant: Option<String>,

    #[arg(long)]
    pub handler_type: Option<String>,

    #[arg(long, value_name = "ID")]
    pub scope_id: Option<String>,

    /// Maximum rows to print (list only)
    #[arg(long, value_parser = super::validation::validate_limit)]
    pub limit: Option<i64>,
}

/// Environment options
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    #[value(name = "development", alias = "dev")]
    Development,
    #[value(name = "staging")]
    Staging,
    #[value(name = "production", alias = "prod")]
    Production,
    #[value(name = "test")]
    Test,
}

/// Log level options
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    #[value(name = "error")]
    Error,
    #[value(name = "warn", alias = "warning")]
    Warn,
    #[value(name = "info")]
    Info,
    #[value(name = "debug")]
    Debug,
    #[value(name = "trace")]
    Trace,
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => "error".to_string(),
            LogLevel::Warn => "warn".to_string(),
            LogLevel::Info => "info".to_string(),
            LogLevel::Debug => "debug".to_string(),
            LogLevel::Trace => "trace".to_string(),
        }
    }
}

impl From<Environment> for crate::config::Environment {
    fn from(env: Environment) -> Self {
        match env {
            Environment::Development => crate::config::Environment::Development,
            Environment::Staging => crate::config::Environment::Staging,
            Environment::Production => crate::config::Environment::Production,
            Environment::Test => crate::config::Environment::Test,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_help_flag() {
        let err = Cli::try_parse_from(["lockstep", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_version_flag() {
        let err = Cli::try_parse_from(["lockstep", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_default_behavior() {
        let cli = Cli::try_parse_from(["lockstep"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
        assert!(!cli.quiet);
        assert!(cli.config.is_none());
        assert!(cli.env.is_none());
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from([
            "lockstep",
            "--env",
            "prod",
            "serve",
            "--lock-owner",
            "node-1",
            "--log-level",
            "warning",
        ])
        .unwrap();
        assert_eq!(cli.env, Some(Environment::Production));
        match cli.command {
            Some(Commands::Serve {
                lock_owner,
                log_level,
                dry_run,
            }) => {
                assert_eq!(lock_owner.as_deref(), Some("node-1"));
                assert_eq!(log_level, Some(LogLevel::Warn));
                assert!(!dry_run);
            }
            other => panic!("Expected Serve command, got {:?}", other),
        }
    }

    #[test]
    fn test_migrate_command() {
        let cli = Cli::try_parse_from(["lockstep", "migrate", "--dry-run"]).unwrap();
        match cli.command {
            Some(Commands::Migrate { dry_run, rollback }) => {
                assert!(dry_run);
                assert!(rollback.is_none());
            }
            other => panic!("Expected Migrate command, got {:?}", other),
        }
    }

    #[test]
    fn test_migrate_dry_run_conflicts_with_rollback() {
        let err = Cli::try_parse_from(["lockstep", "migrate", "--dry-run", "--rollback", "2"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_jobs_list_filters() {
        let cli = Cli::try_parse_from([
            "lockstep",
            "jobs",
            "list",
            "--state",
            "dead-letter",
            "--tenant",
            "acme",
            "--handler-type",
            "send-mail",
            "--limit",
            "20",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Jobs {
                command: JobsCommand::List(filter),
            }) => {
                assert_eq!(filter.state, Some(JobState::DeadLetter));
                assert_eq!(filter.tenant.as_deref(), Some("acme"));
                assert_eq!(filter.handler_type.as_deref(), Some("send-mail"));
                assert_eq!(filter.scope_id, None);
                assert_eq!(filter.limit, Some(20));
            }
            other => panic!("Expected jobs list, got {:?}", other),
        }
    }

    #[test]
    fn test_jobs_list_rejects_unknown_state() {
        let err = Cli::try_parse_from(["lockstep", "jobs", "count", "--state", "running"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_jobs_retry_and_release_worker() {
        let cli = Cli::try_parse_from(["lockstep", "jobs", "retry", "job-1", "--retries", "5"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Jobs {
                command: JobsCommand::Retry { ref id, retries: Some(5) }
            }) if id == "job-1"
        ));

        let cli = Cli::try_parse_from([
            "lockstep",
            "jobs",
            "release-worker",
            "worker-7",
            "--tenant",
            "acme",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Jobs {
                command: JobsCommand::ReleaseWorker { worker_id, tenant },
            }) => {
                assert_eq!(worker_id, "worker-7");
                assert_eq!(tenant.as_deref(), Some("acme"));
            }
            other => panic!("Expected release-worker, got {:?}", other),
        }
    }

    #[test]
    fn test_jobs_requires_subcommand() {
        assert!(Cli::try_parse_from(["lockstep", "jobs"]).is_err());
    }

    #[test]
    fn test_conflicting_verbose_quiet() {
        let err = Cli::try_parse_from(["lockstep", "--verbose", "--quiet"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }
}
