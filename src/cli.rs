use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "media-migrate",
    version,
    about = "Migrate photo and video albums between media servers, resumably"
)]
pub struct Cli {
    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a migration, or resume one by run id
    Migrate(MigrateArgs),
    /// Show progress and failures of a run
    Status(StatusArgs),
    /// Re-queue permanently failed assets
    Reset(ResetArgs),
    /// List albums on the source server
    ListAlbums(ListAlbumsArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Base URL of the source server
    #[arg(long, env = "SOURCE_URL")]
    pub source_url: String,

    /// API key for the source server
    #[arg(long, env = "SOURCE_API_KEY", hide_env_values = true)]
    pub source_api_key: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct DestinationArgs {
    /// Base URL of the destination server
    #[arg(long, env = "DEST_URL")]
    pub dest_url: String,

    /// API key for the destination server
    #[arg(long, env = "DEST_API_KEY", hide_env_values = true)]
    pub dest_api_key: String,
}

#[derive(Args, Debug, Clone)]
pub struct StateArgs {
    /// Directory holding one state database per run
    #[arg(long, default_value = "~/.media-migrate")]
    pub state_dir: String,
}

#[derive(Args, Debug, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub destination: DestinationArgs,

    #[command(flatten)]
    pub state: StateArgs,

    /// Run to resume; created under this id if it does not exist yet
    #[arg(long)]
    pub run_id: Option<String>,

    /// Source album to migrate, by name or id (repeatable)
    #[arg(short = 'a', long = "album")]
    pub albums: Vec<String>,

    /// Migrate every source album
    #[arg(long, conflicts_with = "albums")]
    pub all_albums: bool,

    /// Where downloads are staged (default: system temp dir)
    #[arg(long)]
    pub scratch_dir: Option<String>,

    /// Assets per batch
    #[arg(long, default_value_t = 50)]
    pub batch_size: usize,

    /// Concurrent transfers within a batch
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Attempts per asset before it is marked permanently failed
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// In-step retries for transient network errors
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Base delay between retries in milliseconds
    #[arg(long, default_value_t = 2_000)]
    pub retry_delay_ms: u64,

    /// Upper bound on a single retry delay in milliseconds
    #[arg(long, default_value_t = 60_000)]
    pub max_retry_delay_ms: u64,

    /// Fail an asset when its capture metadata cannot be fully re-injected
    #[arg(long)]
    pub strict_metadata: bool,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub state: StateArgs,

    #[arg(long)]
    pub run_id: String,

    /// Print every record
    #[arg(long)]
    pub records: bool,

    /// Print permanently failed records with their errors
    #[arg(long)]
    pub failed: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResetArgs {
    #[command(flatten)]
    pub state: StateArgs,

    #[arg(long)]
    pub run_id: String,

    /// Reset one asset (and its live-photo partner)
    #[arg(long, conflicts_with = "all_failed", required_unless_present = "all_failed")]
    pub source_id: Option<String>,

    /// Reset every permanently failed asset
    #[arg(long)]
    pub all_failed: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ListAlbumsArgs {
    #[command(flatten)]
    pub source: SourceArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("media-migrate").chain(args.iter().copied()))
    }

    const SERVERS: [&str; 8] = [
        "--source-url",
        "http://src",
        "--source-api-key",
        "s",
        "--dest-url",
        "http://dst",
        "--dest-api-key",
        "d",
    ];

    #[test]
    fn test_migrate_defaults() {
        let mut args = vec!["migrate"];
        args.extend(SERVERS);
        args.extend(["--album", "Holiday", "-a", "Trip"]);
        let cli = parse(&args).unwrap();
        let Command::Migrate(m) = cli.command else {
            panic!("expected migrate");
        };
        assert_eq!(m.albums, vec!["Holiday", "Trip"]);
        assert_eq!(m.batch_size, 50);
        assert_eq!(m.concurrency, 4);
        assert_eq!(m.max_attempts, 3);
        assert_eq!(m.state.state_dir, "~/.media-migrate");
        assert!(!m.strict_metadata);
    }

    #[test]
    fn test_album_and_all_albums_conflict() {
        let mut args = vec!["migrate"];
        args.extend(SERVERS);
        args.extend(["--album", "Holiday", "--all-albums"]);
        assert!(parse(&args).is_err());
    }

    #[test]
    fn test_reset_requires_a_scope() {
        assert!(parse(&["reset", "--run-id", "r1"]).is_err());
        assert!(parse(&["reset", "--run-id", "r1", "--all-failed"]).is_ok());
        assert!(parse(&["reset", "--run-id", "r1", "--source-id", "a", "--all-failed"]).is_err());
    }

    #[test]
    fn test_status_flags() {
        let cli = parse(&["status", "--run-id", "r1", "--failed", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level, LogLevel::Debug);
        let Command::Status(s) = cli.command else {
            panic!("expected status");
        };
        assert!(s.failed);
        assert!(!s.records);
    }
}
