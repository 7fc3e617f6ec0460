//! MozMover - Command-line interface for the profile backup engine.
//!
//! Lists Firefox and Thunderbird profiles, backs them up and restores them,
//! with progress reporting to stderr.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mozmover_engine::{
    platform::{StdFilesystem, SystemProcessTable},
    ApplicationKind, BackupCoordinator, ChecksumAlgorithm, EngineConfig, Platform, ProcessGuard,
    ProfileDescriptor, ProfileLocator, ProfileRoots, TransferEvent, TransferPhase, TransferProgress,
    TransferRequest, TransferResult, spawn_transfer,
};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Exit code for a transfer that ran but did not succeed.
const EXIT_TRANSFER_FAILED: i32 = 1;
/// Exit code for bad arguments or a setup problem before any transfer ran.
const EXIT_USAGE: i32 = 2;

/// MozMover - Back up and restore Firefox and Thunderbird profiles
#[derive(Parser, Debug)]
#[command(name = "mozmover")]
#[command(version)]
#[command(about = "Back up and restore Firefox and Thunderbird profiles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Firefox profile root (defaults to the per-OS location)
    #[arg(long, global = true, value_name = "PATH")]
    firefox_root: Option<PathBuf>,

    /// Thunderbird profile root (defaults to the per-OS location)
    #[arg(long, global = true, value_name = "PATH")]
    thunderbird_root: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List detected profiles, default profile first
    List {
        /// Only list profiles of this application: firefox or thunderbird
        #[arg(long, value_name = "APP", value_parser = parse_app)]
        app: Option<ApplicationKind>,

        /// Print machine-readable JSON to stdout
        #[arg(long)]
        json: bool,
    },

    /// Show whether Firefox and Thunderbird are running
    Status,

    /// Copy profiles to a backup directory or zip file
    Backup {
        /// Application owning the profiles: firefox or thunderbird
        #[arg(long, value_name = "APP", value_parser = parse_app)]
        app: ApplicationKind,

        /// Profile name or directory name; repeat to pack several into one zip
        /// (defaults to the default profile)
        #[arg(long, value_name = "NAME")]
        profile: Vec<String>,

        /// Write a zip file instead of a directory (implied by several
        /// profiles or a destination ending in .zip)
        #[arg(long)]
        zip: bool,

        /// Backup directory (absent or empty) or zip file (absent)
        #[arg(long, value_name = "PATH")]
        dest: Option<PathBuf>,

        #[command(flatten)]
        options: TransferOptions,
    },

    /// Replace a profile with a backup copy
    Restore {
        /// Application owning the profile: firefox or thunderbird
        #[arg(long, value_name = "APP", value_parser = parse_app)]
        app: ApplicationKind,

        /// Backup directory or zip file to restore from
        #[arg(long, value_name = "PATH")]
        from: PathBuf,

        /// Existing profile to replace, by name or directory name
        #[arg(long, value_name = "NAME", conflicts_with = "to")]
        profile: Option<String>,

        /// Profile directory to create or replace (defaults to a new profile
        /// named after the backup, next to the existing profiles)
        #[arg(long, value_name = "PATH")]
        to: Option<PathBuf>,

        #[command(flatten)]
        options: TransferOptions,
    },
}

#[derive(Args, Debug, Clone)]
struct TransferOptions {
    /// Close the application without asking if it is running
    #[arg(short, long)]
    yes: bool,

    /// Also compare file digests after copying: sha256 or blake3
    #[arg(long, value_name = "ALGORITHM", env = "MOZMOVER_VERIFY", value_parser = parse_algorithm)]
    verify: Option<ChecksumAlgorithm>,

    /// Seconds to wait for the application to exit
    #[arg(long, value_name = "SECS", env = "MOZMOVER_TIMEOUT", default_value_t = 10)]
    timeout: u64,

    /// Kill the application if it ignores the close request
    #[arg(long, env = "MOZMOVER_FORCE_KILL")]
    force_kill: bool,
}

impl TransferOptions {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_termination_timeout(Duration::from_secs(self.timeout))
            .with_verify(self.verify)
            .with_force_kill(self.force_kill)
    }
}

fn parse_app(s: &str) -> Result<ApplicationKind, String> {
    ApplicationKind::parse(s)
        .ok_or_else(|| format!("unknown application '{}', expected 'firefox' or 'thunderbird'", s))
}

fn parse_algorithm(s: &str) -> Result<ChecksumAlgorithm, String> {
    s.parse()
}

/// Renders transfer events as a throttled progress line on stderr
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Option<Instant>,
    last_phase: Option<TransferPhase>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
            last_progress_update: None,
            last_phase: None,
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    fn handle(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::StateChanged(state) => {
                if self.verbose {
                    eprintln!("State: {}", state);
                }
            }
            TransferEvent::Progress(progress) => self.on_progress(progress),
            TransferEvent::Completed(result) => self.on_completed(result),
        }
    }

    fn on_progress(&mut self, progress: &TransferProgress) {
        // Throttle to once per 200ms, but always show phase changes
        let phase_changed = self.last_phase != Some(progress.phase);
        if !phase_changed {
            if let Some(last) = self.last_progress_update {
                if last.elapsed().as_millis() < 200 {
                    return;
                }
            }
        }
        self.last_progress_update = Some(Instant::now());
        self.last_phase = Some(progress.phase);

        eprint!(
            "\r{:<10} {} | {}/{} | {}/{} files",
            progress.phase.to_string(),
            Self::progress_bar(progress.percent()),
            Self::format_bytes(progress.bytes_copied),
            Self::format_bytes(progress.total_bytes),
            progress.files_copied,
            progress.total_files
        );
        let _ = io::stderr().flush();
    }

    fn on_completed(&self, result: &TransferResult) {
        eprintln!();
        eprintln!("Transfer finished: {}", result.outcome);
        eprintln!(
            "Copied {} in {} files",
            Self::format_bytes(result.bytes_copied),
            result.files_copied
        );
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
        if let Some(detail) = &result.error_detail {
            eprintln!("Error: {}", detail);
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let platform = Arc::new(build_platform(&cli));
    let stdin = io::stdin();
    let exit_code = match run_cli(&cli, platform, &mut stdin.lock(), &mut io::stdout()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_USAGE
        }
    };

    std::process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();
}

fn profile_roots(cli: &Cli) -> ProfileRoots {
    let mut roots = ProfileRoots::detect();
    if let Some(root) = &cli.firefox_root {
        roots = roots.with_root(ApplicationKind::Firefox, root);
    }
    if let Some(root) = &cli.thunderbird_root {
        roots = roots.with_root(ApplicationKind::Thunderbird, root);
    }
    roots
}

fn build_platform(cli: &Cli) -> Platform {
    Platform::new(
        Box::new(SystemProcessTable::new()),
        Box::new(StdFilesystem),
        profile_roots(cli),
    )
}

/// Main CLI logic - separated for testability. Returns the process exit code.
fn run_cli(
    cli: &Cli,
    platform: Arc<Platform>,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> Result<i32> {
    let locator = ProfileLocator::new(platform.roots.clone());

    match &cli.command {
        Commands::List { app, json } => {
            let kinds = match app {
                Some(kind) => vec![*kind],
                None => ApplicationKind::ALL.to_vec(),
            };
            let profiles: Vec<ProfileDescriptor> = kinds
                .into_iter()
                .flat_map(|kind| locator.list_profiles(kind))
                .collect();
            print_profiles(&profiles, *json, out)?;
            Ok(0)
        }

        Commands::Status => {
            let config = EngineConfig::default();
            let guard = ProcessGuard::new(platform.processes.as_ref(), config.poll_interval);
            for kind in ApplicationKind::ALL {
                let state = if guard.is_running(kind) { "running" } else { "not running" };
                writeln!(out, "{}: {}", kind, state)?;
            }
            Ok(0)
        }

        Commands::Backup {
            app,
            profile,
            zip,
            dest,
            options,
        } => {
            let mut descriptors = Vec::new();
            if profile.is_empty() {
                descriptors.push(find_profile(&locator, *app, None)?);
            }
            for name in profile {
                descriptors.push(find_profile(&locator, *app, Some(name.as_str()))?);
            }

            let as_zip = *zip || descriptors.len() > 1 || dest.as_deref().is_some_and(is_zip_path);
            let destination = match dest {
                Some(path) => path.clone(),
                None => PathBuf::from(default_backup_name(
                    &descriptors,
                    chrono::Local::now().date_naive(),
                    as_zip,
                )),
            };

            let mut descriptors = descriptors.into_iter();
            let first = descriptors.next().context("No profile selected")?;
            let request = if as_zip {
                descriptors.fold(TransferRequest::backup_archive(first, &destination), |request, p| {
                    request.with_profile(p)
                })
            } else {
                TransferRequest::backup(first, &destination)
            };
            run_transfer(cli, platform, request, options, input)
        }

        Commands::Restore {
            app,
            from,
            profile,
            to,
            options,
        } => {
            let descriptor = match (to, profile) {
                (Some(path), _) => ProfileDescriptor::new(*app, path),
                (None, Some(name)) => find_profile(&locator, *app, Some(name.as_str()))?,
                (None, None) => {
                    ProfileDescriptor::new(*app, default_restore_target(&locator, *app, from)?)
                }
            };
            let request = if from.is_file() {
                TransferRequest::restore_archive(from, descriptor)
            } else {
                TransferRequest::restore(from, descriptor)
            };
            run_transfer(cli, platform, request, options, input)
        }
    }
}

fn print_profiles(profiles: &[ProfileDescriptor], json: bool, out: &mut dyn Write) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(profiles).context("Failed to encode profiles")?;
        writeln!(out, "{}", text)?;
        return Ok(());
    }

    if profiles.is_empty() {
        writeln!(out, "No profiles found")?;
        return Ok(());
    }
    for profile in profiles {
        writeln!(
            out,
            "{:<12} {}{}  {}",
            profile.application_kind,
            profile.display_name,
            if profile.is_default { " (default)" } else { "" },
            profile.root_path.display()
        )?;
    }
    Ok(())
}

/// Profile of `kind` named `name` (display or directory name), or the default one.
fn find_profile(
    locator: &ProfileLocator,
    kind: ApplicationKind,
    name: Option<&str>,
) -> Result<ProfileDescriptor> {
    let profiles = locator.list_profiles(kind);
    if profiles.is_empty() {
        match locator.roots().root(kind) {
            Some(root) => bail!("No {} profiles found under {}", kind, root.display()),
            None => bail!("No {} profile directory on this system", kind),
        }
    }

    let Some(name) = name else {
        // Listing puts the default profile first
        return profiles
            .into_iter()
            .next()
            .context("No profiles found");
    };

    let matches_name = |p: &ProfileDescriptor| {
        p.display_name.eq_ignore_ascii_case(name)
            || p
                .root_path
                .file_name()
                .map(|n| n.to_string_lossy().eq_ignore_ascii_case(name))
                .unwrap_or(false)
    };
    match profiles.iter().find(|p| matches_name(p)) {
        Some(profile) => Ok(profile.clone()),
        None => {
            let known: Vec<&str> = profiles.iter().map(|p| p.display_name.as_str()).collect();
            bail!("No {} profile named '{}' (found: {})", kind, name, known.join(", "))
        }
    }
}

fn is_zip_path(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

/// `MozMover_<app>_<profile>_<YYYY-MM-DD>` for one profile, `MozMover_<app>_<YYYY-MM-DD>`
/// for several, with `.zip` appended for archives and unsafe characters replaced.
fn default_backup_name(profiles: &[ProfileDescriptor], date: chrono::NaiveDate, zip: bool) -> String {
    let app = match profiles.first().map(|p| p.application_kind) {
        Some(ApplicationKind::Thunderbird) => "Thunderbird",
        _ => "Firefox",
    };
    let mut name = format!("MozMover_{}", app);
    if let [profile] = profiles {
        let safe: String = profile
            .display_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        name.push('_');
        name.push_str(&safe);
    }
    name.push_str(&format!("_{}", date.format("%Y-%m-%d")));
    if zip {
        name.push_str(".zip");
    }
    name
}

/// New profile directory named after the backup, beside the existing profiles
/// (or in the profile root when there are none).
fn default_restore_target(
    locator: &ProfileLocator,
    kind: ApplicationKind,
    from: &Path,
) -> Result<PathBuf> {
    let parent = match locator.list_profiles(kind).first().and_then(|p| p.root_path.parent()) {
        Some(parent) => parent.to_path_buf(),
        None => match locator.roots().root(kind) {
            Some(root) => root.to_path_buf(),
            None => bail!("No {} profile directory on this system; pass --to", kind),
        },
    };
    let stem = if from.is_file() { from.file_stem() } else { from.file_name() };
    let Some(stem) = stem else {
        bail!("Cannot name a profile after {}; pass --to", from.display());
    };
    Ok(parent.join(stem))
}

/// Ask on stderr whether `kind` may be closed; anything but y/yes declines.
fn confirm_close(kind: ApplicationKind, input: &mut dyn BufRead) -> Result<bool> {
    eprint!(
        "{} is running and will be closed. Unsaved work in it may be lost. Continue? [y/N] ",
        kind
    );
    io::stderr().flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer).context("Failed to read answer")?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn run_transfer(
    cli: &Cli,
    platform: Arc<Platform>,
    request: TransferRequest,
    options: &TransferOptions,
    input: &mut dyn BufRead,
) -> Result<i32> {
    let config = options.engine_config();
    let kind = request.profile.application_kind;

    // The worker cannot prompt, so consent is settled before it starts
    let running = ProcessGuard::new(platform.processes.as_ref(), config.poll_interval).is_running(kind);
    let allow_terminate = if running && !options.yes {
        confirm_close(kind, input)?
    } else {
        options.yes
    };

    eprintln!("{} {}", request.mode, request.profile.display_name);
    for source in request.sources() {
        eprintln!("  Source: {}", source.display());
    }
    eprintln!("  Destination: {}", request.destination_path.display());
    info!(mode = %request.mode, format = %request.format, %kind, "starting transfer");

    let coordinator = BackupCoordinator::new(platform, config);
    let handle = spawn_transfer(coordinator, request, allow_terminate);

    let mut progress = CliProgress::new(cli.verbose);
    for event in handle.events().iter() {
        progress.handle(&event);
    }
    let result = handle.wait();

    Ok(if result.is_success() { 0 } else { EXIT_TRANSFER_FAILED })
}
