use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{DestinationArgs, MigrateArgs, SourceArgs, StateArgs};
use crate::orchestrator::AlbumSelection;
use crate::retry::RetryPolicy;
use crate::state::MigrationSettings;

/// Connection details for one media server.
#[derive(Clone)]
pub struct ServerConfig {
    pub url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ServerConfig {
    pub fn source(args: &SourceArgs) -> Self {
        Self {
            url: args.source_url.clone(),
            api_key: args.source_api_key.clone(),
            timeout: Duration::from_secs(args.request_timeout_secs),
        }
    }

    pub fn destination(args: &DestinationArgs, timeout: Duration) -> Self {
        Self {
            url: args.dest_url.clone(),
            api_key: args.dest_api_key.clone(),
            timeout,
        }
    }
}

/// Everything `migrate` needs, resolved from the command line.
#[derive(Debug)]
pub struct Config {
    pub source: ServerConfig,
    pub destination: ServerConfig,
    pub state_dir: PathBuf,
    pub run_id: Option<String>,
    pub albums: AlbumSelection,
    /// Applied only when a new run is created.
    pub settings: MigrationSettings,
    pub no_progress_bar: bool,
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn state_dir(args: &StateArgs) -> PathBuf {
    expand_tilde(&args.state_dir)
}

impl Config {
    pub fn from_cli(cli: MigrateArgs) -> anyhow::Result<Self> {
        if cli.batch_size == 0 {
            anyhow::bail!("--batch-size must be at least 1");
        }
        if cli.concurrency == 0 {
            anyhow::bail!("--concurrency must be at least 1");
        }
        if cli.max_attempts == 0 {
            anyhow::bail!("--max-attempts must be at least 1");
        }

        let albums = if cli.all_albums {
            AlbumSelection::All
        } else if !cli.albums.is_empty() {
            AlbumSelection::Named(cli.albums)
        } else if cli.run_id.is_some() {
            // Resuming: the stored run lists its albums.
            AlbumSelection::Named(Vec::new())
        } else {
            anyhow::bail!("Choose albums with --album or --all-albums, or resume with --run-id");
        };

        let defaults = MigrationSettings::default();
        let settings = MigrationSettings {
            batch_size: cli.batch_size,
            concurrency: cli.concurrency,
            scratch_dir: cli
                .scratch_dir
                .as_deref()
                .map(expand_tilde)
                .unwrap_or(defaults.scratch_dir),
            max_attempts: cli.max_attempts,
            retry: RetryPolicy {
                max_retries: cli.max_retries,
                base_delay_ms: cli.retry_delay_ms,
                max_delay_ms: cli.max_retry_delay_ms.max(cli.retry_delay_ms),
                ..defaults.retry
            },
            strict_metadata: cli.strict_metadata,
        };

        let source = ServerConfig::source(&cli.source);
        let destination = ServerConfig::destination(&cli.destination, source.timeout);
        Ok(Self {
            source,
            destination,
            state_dir: state_dir(&cli.state),
            run_id: cli.run_id,
            albums,
            settings,
            no_progress_bar: cli.no_progress_bar,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrate_args(extra: &[&str]) -> MigrateArgs {
        use clap::Parser;
        let mut args = vec![
            "media-migrate",
            "migrate",
            "--source-url",
            "http://src",
            "--source-api-key",
            "secret-src",
            "--dest-url",
            "http://dst",
            "--dest-api-key",
            "secret-dst",
        ];
        args.extend(extra);
        match crate::cli::Cli::try_parse_from(args).unwrap().command {
            crate::cli::Command::Migrate(m) => m,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let result = expand_tilde("~/runs");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("runs"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_tilde("rel/path"), PathBuf::from("rel/path"));
    }

    #[test]
    fn test_from_cli_builds_settings() {
        let cfg = Config::from_cli(migrate_args(&[
            "--album",
            "Holiday",
            "--batch-size",
            "10",
            "--max-retries",
            "5",
            "--retry-delay-ms",
            "100",
            "--scratch-dir",
            "/tmp/scratch",
            "--strict-metadata",
        ]))
        .unwrap();
        assert_eq!(cfg.albums, AlbumSelection::Named(vec!["Holiday".into()]));
        assert_eq!(cfg.settings.batch_size, 10);
        assert_eq!(cfg.settings.retry.max_retries, 5);
        assert_eq!(cfg.settings.retry.base_delay_ms, 100);
        assert_eq!(cfg.settings.scratch_dir, PathBuf::from("/tmp/scratch"));
        assert!(cfg.settings.strict_metadata);
        assert_eq!(cfg.destination.timeout, cfg.source.timeout);
    }

    #[test]
    fn test_from_cli_requires_album_choice_for_new_runs() {
        assert!(Config::from_cli(migrate_args(&[])).is_err());
        let resumed = Config::from_cli(migrate_args(&["--run-id", "r1"])).unwrap();
        assert_eq!(resumed.run_id.as_deref(), Some("r1"));
        let all = Config::from_cli(migrate_args(&["--all-albums"])).unwrap();
        assert_eq!(all.albums, AlbumSelection::All);
    }

    #[test]
    fn test_from_cli_rejects_zero_batch() {
        assert!(Config::from_cli(migrate_args(&["--all-albums", "--batch-size", "0"])).is_err());
    }

    #[test]
    fn test_debug_redacts_api_keys() {
        let cfg = Config::from_cli(migrate_args(&["--all-albums"])).unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("secret-src"));
        assert!(!rendered.contains("secret-dst"));
    }
}
