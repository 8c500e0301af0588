//! Main entry point for the blitzbackup CLI app

use std::process::ExitCode;

use blitzbackup::backup::Backup;
use blitzbackup::cli::{self, Commands};
use blitzbackup::fetch::{BackupFetcher, LATEST};
use blitzbackup::{BackupError, BackupPusher};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_app() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run_app() -> Result<(), BackupError> {
    let args = cli::run();
    let folder = args.folder()?;
    let mut config = args.base_config()?;

    match &args.command {
        Commands::BackupPush { data_dir, .. } => {
            cli::apply_push_flags(&args.command, &mut config);
            let report = BackupPusher::new(folder, config)
                .with_progress(|s| {
                    info!(
                        files = s.processed_files,
                        mib = format_args!("{:.1}", s.processed_bytes as f64 / (1024.0 * 1024.0)),
                        streams_done = s.completed_streams,
                        streams = s.total_streams,
                        "push progress"
                    )
                })
                .push(data_dir)?;
            println!(
                "{} | composer: {} | files: {} (markers {}, increments {}) | streams: {} | {:.2} → {:.2} MiB",
                report.backup_name,
                report.composer,
                report.files,
                report.markers,
                report.increments,
                report.streams,
                report.uncompressed_size as f64 / (1024.0 * 1024.0),
                report.compressed_size as f64 / (1024.0 * 1024.0),
            );
        }
        Commands::BackupFetch { backup_name, target, paths } => {
            let fetcher = BackupFetcher::new(folder, config.max_chain_depth);
            let report = if paths.is_empty() {
                fetcher.fetch(backup_name, target)?
            } else {
                fetcher.fetch_paths(backup_name, paths, target)?
            };
            println!(
                "{} restored from {} layer(s): {} full, {} increments, {} unchanged",
                report.backup_name,
                report.chain.len(),
                report.full,
                report.increments,
                report.markers,
            );
        }
        Commands::BackupList { json } => {
            let backups = BackupFetcher::new(folder, config.max_chain_depth).list()?;
            if *json {
                let rows: Vec<serde_json::Value> = backups
                    .iter()
                    .map(|b| {
                        serde_json::json!({
                            "name": b.name,
                            "composer": b.composer,
                            "increment_from": b.increment_from,
                            "increment_count": b.increment_count,
                            "start_time": b.start_time,
                            "finish_time": b.finish_time,
                            "files": b.files,
                            "uncompressed_size": b.uncompressed_size,
                            "compressed_size": b.compressed_size,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("{:<24} {:<16} {:<24} {:>8} {:>14}", "name", "composer", "finish_time", "files", "compressed");
                for b in backups {
                    println!(
                        "{:<24} {:<16} {:<24} {:>8} {:>14}",
                        b.name,
                        b.composer,
                        b.finish_time.format("%Y-%m-%dT%H:%M:%SZ"),
                        b.files,
                        b.compressed_size
                    );
                }
            }
        }
        Commands::TarFileSets { backup_name } => {
            let name = if backup_name == LATEST {
                blitzbackup::backup::latest_backup_name(folder.as_ref())?
                    .ok_or_else(|| BackupError::BackupNotFound(LATEST.to_string()))?
            } else {
                backup_name.clone()
            };
            let backup = Backup::new(folder, name);
            backup.fetch_sentinel()?;
            let sets = backup.fetch_tar_file_sets()?;
            println!("{}", serde_json::to_string_pretty(&sets)?);
        }
    }

    Ok(())
}
