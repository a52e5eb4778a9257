use clap::{Parser, ValueEnum};
use pryv_sync::streams::StreamSpec;
use std::path::PathBuf;

/// Where sync anchors are persisted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum StateBackend {
    /// One JSON file per sync pair (default)
    #[default]
    File,

    /// A single SQLite database for all pairs
    Sqlite,
}

#[derive(Parser, Debug)]
#[command(name = "pryv-sync")]
#[command(about = "Incremental sync of a local change journal into a Pryv account", long_about = None)]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # One sync cycle
    pryv-sync health.ndjson https://TOKEN@alice.pryv.me/

    # Endpoint from the environment
    PRYV_API_ENDPOINT=https://TOKEN@alice.pryv.me/ pryv-sync health.ndjson

    # Make sure the target streams exist first
    pryv-sync health.ndjson https://TOKEN@alice.pryv.me/ --stream health --stream health/bodyMass

    # Also push static values such as the date of birth
    pryv-sync health.ndjson https://TOKEN@alice.pryv.me/ --snapshot profile.ndjson

    # Keep syncing as the journal grows
    pryv-sync health.ndjson https://TOKEN@alice.pryv.me/ --watch

    # Start over (records already on the server are skipped)
    pryv-sync health.ndjson https://TOKEN@alice.pryv.me/ --reset-anchor

    # Machine-readable output
    pryv-sync health.ndjson https://TOKEN@alice.pryv.me/ --json")]
pub struct Cli {
    /// Change journal to read (NDJSON, one change per line)
    /// Optional when using --profile
    pub journal: Option<PathBuf>,

    /// Pryv API endpoint including the access token: https://TOKEN@HOST/
    /// Optional when using --profile
    #[arg(env = "PRYV_API_ENDPOINT", hide_env_values = true)]
    pub endpoint: Option<String>,

    /// Identity of the source used to key its anchor (default: journal path)
    #[arg(long)]
    pub source_id: Option<String>,

    /// Stream to create before syncing, as ID or PARENT/ID (can be repeated)
    #[arg(long = "stream")]
    pub streams: Vec<String>,

    /// Static values (NDJSON records) to push once per run, only when they
    /// differ from the latest event in their stream
    #[arg(long)]
    pub snapshot: Option<PathBuf>,

    /// Keep running and sync every change appended to the journal
    #[arg(short, long)]
    pub watch: bool,

    /// Maximum seconds between two journal reads in watch mode
    #[arg(long)]
    pub interval: Option<u64>,

    /// Anchor storage backend (default: file)
    #[arg(long, value_enum)]
    pub state: Option<StateBackend>,

    /// Directory for anchor state (default: $XDG_CACHE_HOME/pryv-sync/anchors)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Forget the stored anchor and re-read the whole journal
    #[arg(long)]
    pub reset_anchor: bool,

    /// Output newline-delimited JSON events
    #[arg(long)]
    pub json: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (only show errors)
    #[arg(short, long)]
    pub quiet: bool,

    /// Use named profile from config file
    #[arg(long)]
    pub profile: Option<String>,

    /// List all available profiles
    #[arg(long)]
    pub list_profiles: bool,

    /// Show details of a specific profile
    #[arg(long)]
    pub show_profile: Option<String>,
}

impl Cli {
    pub fn validate(&self) -> anyhow::Result<()> {
        // --list-profiles and --show-profile don't need journal/endpoint
        if self.list_profiles || self.show_profile.is_some() {
            return Ok(());
        }

        if self.journal.is_none() || self.endpoint.is_none() {
            anyhow::bail!("Journal and endpoint are required (or use --profile)");
        }

        if self.interval == Some(0) {
            anyhow::bail!("--interval must be at least 1 second");
        }

        if self.interval.is_some() && !self.watch {
            anyhow::bail!("--interval only applies with --watch");
        }

        if let Some(journal) = &self.journal {
            if journal.is_dir() {
                anyhow::bail!("Journal path is a directory: {}", journal.display());
            }
        }

        if let Some(snapshot) = &self.snapshot {
            if !snapshot.is_file() {
                anyhow::bail!("Snapshot file not found: {}", snapshot.display());
            }
        }

        self.stream_specs()?;
        Ok(())
    }

    pub fn state_backend(&self) -> StateBackend {
        self.state.unwrap_or_default()
    }

    /// Parsed --stream values, in the order given
    pub fn stream_specs(&self) -> anyhow::Result<Vec<StreamSpec>> {
        self.streams
            .iter()
            .map(|s| s.parse::<StreamSpec>().map_err(anyhow::Error::from))
            .collect()
    }

    pub fn log_level(&self) -> tracing::Level {
        if self.quiet || self.json {
            return tracing::Level::ERROR;
        }

        match self.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENDPOINT: &str = "https://token@alice.pryv.me/";

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["pryv-sync"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_validate_requires_journal_and_endpoint() {
        let cli = parse(&["journal.ndjson", ENDPOINT]);
        assert!(cli.validate().is_ok());

        let cli = Cli {
            endpoint: None,
            ..parse(&["journal.ndjson", ENDPOINT])
        };
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_validate_profile_listing_needs_nothing() {
        let cli = Cli {
            endpoint: None,
            ..parse(&["--list-profiles"])
        };
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_validate_journal_is_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cli = parse(&[dir.path().to_str().unwrap(), ENDPOINT]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_validate_interval() {
        let cli = parse(&["j.ndjson", ENDPOINT, "--watch", "--interval", "0"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["j.ndjson", ENDPOINT, "--interval", "5"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["j.ndjson", ENDPOINT, "--watch", "--interval", "5"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_validate_snapshot_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("static.ndjson");
        let cli = parse(&["j.ndjson", ENDPOINT, "--snapshot", missing.to_str().unwrap()]);
        assert!(cli.validate().is_err());

        std::fs::write(&missing, "").unwrap();
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_stream_specs() {
        let cli = parse(&["j.ndjson", ENDPOINT, "--stream", "health", "--stream", "health/bodyMass"]);
        let specs = cli.stream_specs().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].parent.as_deref(), Some("health"));

        let cli = parse(&["j.ndjson", ENDPOINT, "--stream", "a/b/c"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_state_backend() {
        assert_eq!(parse(&["j", ENDPOINT]).state_backend(), StateBackend::File);
        assert_eq!(
            parse(&["j", ENDPOINT, "--state", "sqlite"]).state_backend(),
            StateBackend::Sqlite
        );
    }

    #[test]
    fn test_log_level_quiet() {
        assert_eq!(parse(&["j", ENDPOINT, "-q"]).log_level(), tracing::Level::ERROR);
        assert_eq!(parse(&["j", ENDPOINT, "--json"]).log_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_log_level_verbose() {
        assert_eq!(parse(&["j", ENDPOINT]).log_level(), tracing::Level::INFO);
        assert_eq!(parse(&["j", ENDPOINT, "-v"]).log_level(), tracing::Level::DEBUG);
        assert_eq!(parse(&["j", ENDPOINT, "-vv"]).log_level(), tracing::Level::TRACE);
    }
}
