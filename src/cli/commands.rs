//! Command handler implementations
//!
//! This module contains the implementation of all CLI commands.

use crate::cli::progress::{
    format_bytes, print_error, print_header, print_info, print_success, print_warning, ExportProgress,
};
use crate::cli::{Args, Commands};
use crate::core::config::{get_config_path, Config};
use crate::core::exporter::{ExportOrchestrator, ExporterConfig};
use crate::core::sink::LocalSink;
use crate::core::tracking::ExportLedger;
use crate::device::DeviceFacade;
use crate::testdb::{MockCamera, MockCameraBehavior, MockFile};
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Run the appropriate command based on CLI arguments
///
/// `cancel` is the root token; the Ctrl+C handler cancels it.
pub async fn run_command(args: &Args, config: &Config, cancel: CancellationToken) -> Result<()> {
    match &args.command {
        None | Some(Commands::Run) => run_export(config, cancel).await,
        Some(Commands::Once) => run_once(config, cancel).await,
        Some(Commands::List) => list_files(config, cancel).await,
        Some(Commands::History { cycles }) => show_history(config, *cycles),
        Some(Commands::ShowConfig) => {
            show_config(config);
            Ok(())
        }
        Some(Commands::GenerateConfig { output }) => generate_config_file(output.clone()),
        Some(Commands::Simulate {
            output,
            files,
            stale,
            size,
        }) => simulate(config, output.clone(), *files, *stale, *size, cancel).await,
    }
}

/// Wire the exporter to the camera and local storage
fn build_exporter(
    config: &Config,
    progress: Option<Arc<ExportProgress>>,
) -> ExportOrchestrator<DeviceFacade, LocalSink> {
    let mut exporter_config = ExporterConfig::from_config(config);
    if let Some(progress) = progress {
        exporter_config = exporter_config.with_progress(move |event| progress.handle(event));
    }

    let exporter = ExportOrchestrator::new(
        DeviceFacade::new(config.clone()),
        LocalSink::new(config.storage.clone()),
        exporter_config,
    );

    if config.tracking.enabled {
        exporter.with_ledger(ExportLedger::new(&config.tracking, &config.storage.directory))
    } else {
        exporter
    }
}

/// Poll loop until the root token is cancelled
///
/// After cancellation the loop gets `shutdown_grace` to finish the file in
/// flight and tear its channels down; after that the command returns anyway.
pub async fn run_export(config: &Config, cancel: CancellationToken) -> Result<()> {
    config.validate()?;

    print_header("CAMERA EXPORT");
    print_info(&format!(
        "Camera: {} (control {}, shell {}, ftp {})",
        config.control.host, config.control.port, config.shell.port, config.ftp.port
    ));
    print_info(&format!("Storage: {}", config.storage.directory.display()));
    print_info("Press Ctrl+C to stop");
    println!();

    let progress = Arc::new(ExportProgress::new(false));
    let mut exporter = build_exporter(config, Some(Arc::clone(&progress)));
    let grace = config.export.shutdown_grace();

    let export = exporter.run(cancel.clone());
    tokio::pin!(export);

    let shutdown = async {
        cancel.cancelled().await;
        sleep(grace).await;
    };

    tokio::select! {
        _ = &mut export => {}
        _ = shutdown => {
            warn!("Export loop did not stop within {:?}; exiting", grace);
        }
    }

    progress.finish();
    Ok(())
}

/// Single poll cycle; the error becomes the process exit status
pub async fn run_once(config: &Config, cancel: CancellationToken) -> Result<()> {
    config.validate()?;

    let progress = Arc::new(ExportProgress::new(true));
    let mut exporter = build_exporter(config, Some(Arc::clone(&progress)));

    let result = exporter.run_cycle(&cancel).await;
    progress.finish();

    match result {
        Ok(report) => {
            print_success(&report.to_string());
            Ok(())
        }
        Err(e) => {
            print_error(&e.chain());
            Err(anyhow!(e)).context("export cycle failed")
        }
    }
}

/// Enumerate the camera without copying or deleting
pub async fn list_files(config: &Config, cancel: CancellationToken) -> Result<()> {
    config.validate()?;

    let mut exporter = build_exporter(config, None);
    let files = exporter
        .survey(&cancel)
        .await
        .map_err(|e| anyhow!(e.chain()))
        .context("listing camera files")?;

    print_header("FILES ON CAMERA");
    if files.is_empty() {
        print_info("No files found.");
        return Ok(());
    }

    let mut total: u64 = 0;
    for file in &files {
        total += file.declared_size;
        println!(
            "  {:<40} {:>12}  {}",
            file.remote_path(),
            format_bytes(file.declared_size),
            file.modified_time.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    print_info(&format!("{} file(s), {}", files.len(), format_bytes(total)));
    Ok(())
}

/// Print the export ledger
pub fn show_history(config: &Config, cycles: usize) -> Result<()> {
    let path = config
        .storage
        .directory
        .join(&config.tracking.tracking_filename);

    if !path.exists() {
        print_info(&format!("No export ledger at {}", path.display()));
        return Ok(());
    }

    let state = ExportLedger::load(&path)?;
    let totals = &state.totals;

    print_header("EXPORT HISTORY");
    print_info(&format!("Ledger: {}", path.display()));
    print_info(&format!(
        "Cycles: {} ({} failed)",
        totals.cycles, totals.failed_cycles
    ));
    print_info(&format!(
        "Files exported: {} ({})",
        totals.files_committed,
        format_bytes(totals.bytes_committed)
    ));
    print_info(&format!("Files rolled back: {}", totals.files_rolled_back));
    println!();

    let skip = state.cycles.len().saturating_sub(cycles);
    for record in state.cycles.iter().skip(skip) {
        let when = record.started_at.format("%Y-%m-%d %H:%M:%S");
        match &record.error {
            None => print_success(&format!(
                "{}  {} exported, {} rolled back, {}",
                when,
                record.committed,
                record.rolled_back,
                format_bytes(record.bytes)
            )),
            Some(error) => print_error(&format!("{}  {}", when, error)),
        }
    }

    if let Some(last) = state.committed.last() {
        println!();
        print_info(&format!(
            "Last export: {} -> {} at {}",
            last.remote_path,
            last.local_path.display(),
            last.committed_at.format("%Y-%m-%d %H:%M:%S")
        ));
    }

    Ok(())
}

/// Generate a configuration file at the specified or default location
pub fn generate_config_file(output: Option<PathBuf>) -> Result<()> {
    let output_path = match output {
        Some(path) => path,
        None => get_config_path().ok_or_else(|| anyhow!("cannot determine config directory"))?,
    };

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    fs::write(&output_path, Config::generate_default_config())
        .with_context(|| format!("writing {}", output_path.display()))?;

    info!("Configuration file: {}", output_path.display());
    info!("Edit this file to point the exporter at your camera and storage.");
    Ok(())
}

/// Show the current configuration settings
pub fn show_config(config: &Config) {
    let config_path = Config::get_active_config_path();
    info!("Configuration file: {}", config_path.display());
    if !config_path.exists() {
        info!("(Using default settings - no config file found)");
    }
    info!("");
    info!("Current Configuration:");
    info!("----------------------");
    info!("[control]");
    info!("  host = \"{}\"", config.control.host);
    info!("  port = {}", config.control.port);
    info!("  connect_timeout_secs = {}", config.control.connect_timeout_secs);
    info!("  io_timeout_secs = {}", config.control.io_timeout_secs);
    info!("");
    info!("[shell]");
    info!("  host = \"{}\"", config.shell.host);
    info!("  port = {}", config.shell.port);
    info!("  user = \"{}\"", config.shell.user);
    info!("  banner_timeout_ms = {}", config.shell.banner_timeout_ms);
    info!("  login_delay_ms = {}", config.shell.login_delay_ms);
    info!("  readiness_timeout_secs = {}", config.shell.readiness_timeout_secs);
    info!("");
    info!("[ftp]");
    info!("  host = \"{}\"", config.ftp.host);
    info!("  port = {}", config.ftp.port);
    info!("  user = \"{}\"", config.ftp.user);
    info!(
        "  password = {}",
        if config.ftp.password.is_empty() { "(empty)" } else { "(set)" }
    );
    info!("  root_dir = \"{}\"", config.ftp.root_dir);
    info!("  io_timeout_secs = {}", config.ftp.io_timeout_secs);
    info!("");
    info!("[storage]");
    info!("  directory = \"{}\"", config.storage.directory.display());
    info!("  preserve_structure = {}", config.storage.preserve_structure);
    info!("  min_free_bytes = {}", config.storage.min_free_bytes);
    info!("");
    info!("[export]");
    info!("  survey_interval_secs = {}", config.export.survey_interval_secs);
    info!("  idle_interval_secs = {}", config.export.idle_interval_secs);
    info!("  teardown_timeout_secs = {}", config.export.teardown_timeout_secs);
    info!("  shutdown_grace_secs = {}", config.export.shutdown_grace_secs);
    info!("");
    info!("[logging]");
    info!("  level = \"{}\"", config.logging.level);
    info!("  log_to_file = {}", config.logging.log_to_file);
    info!("");
    info!("[tracking]");
    info!("  enabled = {}", config.tracking.enabled);
    info!("  tracking_filename = \"{}\"", config.tracking.tracking_filename);

    if let Err(e) = config.validate() {
        warn!("{}", e);
    }
}

/// Clips for the simulated card: `files` healthy, `stale` with a wrong listed size
fn simulated_card(files: usize, stale: usize, size: usize) -> Vec<MockFile> {
    let mut card = Vec::with_capacity(files + stale);
    for i in 0..(files + stale) {
        let directory = format!("{}MEDIA", 100 + i / 999);
        let name = format!("YDXJ{:04}.MP4", i + 1);
        let content = vec![(i % 251) as u8; size];
        let file = MockFile::new(&directory, &name, content);
        card.push(if i < files {
            file
        } else {
            file.stale(size as u64 + 4096)
        });
    }
    card
}

/// One cycle against a loopback camera
pub async fn simulate(
    base: &Config,
    output: PathBuf,
    files: usize,
    stale: usize,
    size: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let camera = MockCamera::try_start(simulated_card(files, stale, size), MockCameraBehavior::default())
        .await
        .context("starting simulated camera")?;

    let mut config = camera.config(&output);
    config.tracking = base.tracking.clone();
    config.storage.preserve_structure = base.storage.preserve_structure;

    print_header("SIMULATED EXPORT");
    print_info(&format!(
        "Simulated camera on 127.0.0.1 (control {}, shell {}, ftp {})",
        config.control.port, config.shell.port, config.ftp.port
    ));
    print_info(&format!("{} clip(s), {} with a stale size", files + stale, stale));
    print_info(&format!("Output: {}", output.display()));
    println!();

    run_once(&config, cancel).await?;

    let remaining = camera.remaining_files();
    if remaining.is_empty() {
        print_success("Camera card is empty");
    } else {
        print_warning(&format!("{} file(s) left on the camera:", remaining.len()));
        for path in remaining {
            println!("      {}", path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_simulated_card_layout() {
        let card = simulated_card(2, 1, 16);
        assert_eq!(card.len(), 3);
        assert_eq!(card[0].remote_path(), "100MEDIA/YDXJ0001.MP4");
        assert_eq!(card[1].declared_size, 16);
        assert_eq!(card[2].declared_size, 16 + 4096);
    }

    #[tokio::test]
    async fn test_simulate_exports_healthy_and_keeps_stale() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("out");

        simulate(&Config::default(), output.clone(), 2, 1, 512, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fs::read(output.join("YDXJ0001.MP4")).unwrap().len(), 512);
        assert!(output.join("YDXJ0002.MP4").exists());
        assert!(!output.join("YDXJ0003.MP4").exists());
        assert!(!output.join(".YDXJ0003.MP4.part").exists());

        let ledger = output.join(&Config::default().tracking.tracking_filename);
        let state = ExportLedger::load(&ledger).unwrap();
        assert_eq!(state.totals.files_committed, 2);
        assert_eq!(state.totals.files_rolled_back, 1);
    }

    #[test]
    fn test_generate_config_file_writes_example() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("cam_export.toml");
        generate_config_file(Some(path.clone())).unwrap();
        assert!(Config::load(&path).is_ok());
    }

    #[test]
    fn test_history_without_ledger_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.directory = temp_dir.path().to_path_buf();
        assert!(show_history(&config, 5).is_ok());
    }
}
