mod cli;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use cli::{Cli, StateBackend};
use colored::Colorize;
use config::Config;
use pryv_sync::anchor::{default_state_dir, AnchorStore, FileAnchorStore, SqliteAnchorStore};
use pryv_sync::output::SyncEvent;
use pryv_sync::snapshot::{read_snapshot_file, sync_snapshots, SnapshotOutcome};
use pryv_sync::streams::ensure_streams;
use pryv_sync::{ChangeSource, CycleReport, HttpRemoteStore, JournalSource, RemoteStore, SyncEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let mut cli = Cli::parse();

    // Load config file
    let config = Config::load()?;

    // Handle profile-only flags (print and exit)
    if cli.list_profiles {
        let profiles = config.list_profiles();
        if profiles.is_empty() {
            println!("No profiles configured");
            println!("\nCreate profiles in: {}", Config::config_path()?.display());
        } else {
            println!("Available profiles:");
            for name in profiles {
                println!("  {}", name);
            }
        }
        return Ok(());
    }

    if let Some(ref profile_name) = cli.show_profile {
        match config.show_profile(profile_name) {
            Some(output) => {
                println!("{}", output);
                return Ok(());
            }
            None => {
                anyhow::bail!("Profile '{}' not found", profile_name);
            }
        }
    }

    // Merge profile with CLI args if --profile is set (CLI args take precedence)
    if let Some(ref profile_name) = cli.profile {
        let profile = config
            .get_profile(profile_name)
            .ok_or_else(|| anyhow::anyhow!("Profile '{}' not found", profile_name))?;

        if cli.journal.is_none() {
            cli.journal = profile.journal.as_ref().map(PathBuf::from);
        }
        if cli.endpoint.is_none() {
            cli.endpoint = profile.endpoint.clone();
        }
        if cli.source_id.is_none() {
            cli.source_id = profile.source_id.clone();
        }
        if !cli.watch {
            cli.watch = profile.watch.unwrap_or(false);
        }
        if cli.interval.is_none() {
            cli.interval = profile.interval_secs;
        }
        if cli.state.is_none() {
            if let Some(ref state) = profile.state {
                cli.state = Some(
                    StateBackend::from_str(state, true)
                        .map_err(|e| anyhow::anyhow!("Profile '{}': {}", profile_name, e))?,
                );
            }
        }
        if cli.state_dir.is_none() {
            cli.state_dir = profile.state_dir.as_ref().map(PathBuf::from);
        }
        if cli.streams.is_empty() {
            if let Some(ref streams) = profile.streams {
                cli.streams = streams.clone();
            }
        }
        if cli.snapshot.is_none() {
            cli.snapshot = profile.snapshot.as_ref().map(PathBuf::from);
        }
    }

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level().as_str()));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    // Validate arguments
    cli.validate()?;

    let journal = cli.journal.clone().context("journal required after validation")?;
    let endpoint = cli.endpoint.clone().context("endpoint required after validation")?;

    let remote = Arc::new(HttpRemoteStore::from_api_endpoint(&endpoint)?);

    let state_dir = match cli.state_dir.clone() {
        Some(dir) => dir,
        None => default_state_dir()?,
    };
    let anchors: Arc<dyn AnchorStore> = match cli.state_backend() {
        StateBackend::File => Arc::new(FileAnchorStore::open(state_dir)?),
        StateBackend::Sqlite => Arc::new(SqliteAnchorStore::open(&state_dir)?),
    };

    let mut source = JournalSource::new(journal);
    if let Some(ref id) = cli.source_id {
        source = source.with_id(id.clone());
    }
    if let Some(secs) = cli.interval {
        source = source.with_poll_interval(Duration::from_secs(secs));
    }
    let source = Arc::new(source);

    let engine = SyncEngine::new(remote.clone(), anchors);

    if cli.reset_anchor {
        engine.reset(source.as_ref()).await?;
        if !cli.quiet && !cli.json {
            println!("Anchor cleared; the whole journal will be offered again");
        }
    }

    // Print header (skip if JSON mode)
    let anchor = engine.anchor(source.as_ref())?;
    if cli.json {
        SyncEvent::Start {
            source: source.id().to_string(),
            remote: remote.identity(),
            anchor: anchor.to_string(),
        }
        .emit();
    } else if !cli.quiet {
        println!("pryv-sync v{}", env!("CARGO_PKG_VERSION"));
        println!("Syncing {} → {}", source.id(), remote.identity());
        if !anchor.is_bootstrap() {
            println!("Resuming from anchor {}", anchor);
        }
        println!();
    }

    let streams = cli.stream_specs()?;
    if !streams.is_empty() {
        let mut failed = 0;
        for (id, result) in ensure_streams(remote.as_ref(), &streams).await {
            if result.is_err() {
                failed += 1;
            }
            if cli.json {
                SyncEvent::Stream {
                    id,
                    ok: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                }
                .emit();
            }
        }
        if failed > 0 {
            anyhow::bail!("{} of {} streams could not be created", failed, streams.len());
        }
    }

    // Static values go once per run, before the journal
    if let Some(ref path) = cli.snapshot {
        let records = read_snapshot_file(path)
            .with_context(|| format!("Failed to read snapshot file {}", path.display()))?;
        let mut failed = 0;
        for (record_id, result) in sync_snapshots(remote.as_ref(), &records).await {
            if cli.json {
                let (remote_id, error) = match &result {
                    Ok(SnapshotOutcome::Created(id)) => (Some(id.clone()), None),
                    Ok(SnapshotOutcome::Unchanged) => (None, None),
                    Err(e) => (None, Some(e.to_string())),
                };
                SyncEvent::Snapshot {
                    record_id,
                    remote_id,
                    error,
                }
                .emit();
            } else if !cli.quiet {
                match &result {
                    Ok(SnapshotOutcome::Created(id)) => {
                        println!("  Snapshot {}: updated ({})", record_id, id.green())
                    }
                    Ok(SnapshotOutcome::Unchanged) => {
                        println!("  Snapshot {}: {}", record_id, "unchanged".bright_black())
                    }
                    Err(e) => eprintln!("  Snapshot {}: {}", record_id, e.to_string().red()),
                }
            }
            if result.is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            anyhow::bail!("{} of {} snapshot values could not be synced", failed, records.len());
        }
    }

    // Watch mode or a single cycle
    if cli.watch {
        let json = cli.json;
        let quiet = cli.quiet;
        if !quiet && !json {
            println!("Watching {} (Ctrl-C to stop)\n", source.path().display());
        }

        tokio::select! {
            result = engine.follow(source.clone(), move |result| match result {
                Ok(report) => print_report(&report, json, quiet),
                Err(e) => {
                    if !json {
                        eprintln!("{} {}", "✗".red().bold(), e);
                    }
                }
            }) => result?,
            _ = tokio::signal::ctrl_c() => {
                if !quiet && !json {
                    println!("\nStopped");
                }
            }
        }
        return Ok(());
    }

    let report = engine.sync_once(source.clone()).await?;
    print_report(&report, cli.json, cli.quiet);

    if !report.failures.is_empty() {
        anyhow::bail!("{} operations failed; see the log above", report.failures.len());
    }

    Ok(())
}

fn print_report(report: &CycleReport, json: bool, quiet: bool) {
    if json {
        for event in SyncEvent::from_report(report) {
            event.emit();
        }
        return;
    }
    if quiet {
        return;
    }

    if report.is_clean() {
        println!("{}\n", "✓ Sync complete".green().bold());
    } else if report.anchor_advanced {
        println!("{}\n", "⚠ Sync complete with failures".yellow().bold());
    } else {
        println!("{}\n", "✗ Sync incomplete (anchor held)".red().bold());
    }

    println!("  Changes received:  {}", report.additions_received.to_string().blue());
    if !report.created.is_empty() {
        println!("  Records created:   {}", report.created.len().to_string().green());
    } else {
        println!("  Records created:   {}", "0".bright_black());
    }
    println!("  Already synced:    {}", report.duplicates_skipped.to_string().bright_black());
    if !report.deleted.is_empty() {
        println!("  Records deleted:   {}", report.deleted.len().to_string().red());
    }
    if report.deletions_absent > 0 {
        println!("  Already deleted:   {}", report.deletions_absent.to_string().bright_black());
    }
    if !report.failures.is_empty() {
        println!("  Failures:          {}", report.failures.len().to_string().red());
        for failure in &report.failures {
            println!(
                "    {} [{}] {}",
                failure.record_ids.join(", ").red(),
                failure.state,
                failure.error
            );
        }
    }

    println!();
    println!("  Anchor:            {}", report.next_anchor.to_string().cyan());
    println!("  Duration:          {}", format_duration(report.duration).cyan());
    println!();
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}.{:03}s", secs, millis)
    } else {
        format!("{}ms", millis)
    }
}
