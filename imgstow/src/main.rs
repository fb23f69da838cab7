use anyhow::{Result, anyhow};
use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use imgstow_core::archive::ArchiveOptions;
use imgstow_core::compress::ArchiveKind;
use imgstow_core::context::{OperationContext, ProgressEvent};
use imgstow_core::resize::ResizeOutcome;
use imgstow_core::restore::RestoreOptions;
use imgstow_core::session::{Session, SessionOptions};
use imgstow_core::tools::SystemRunner;
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{Level, LevelFilter, error, warn};
use std::cell::RefCell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Exit status for an unknown command-line option.
const EXIT_UNKNOWN_OPTION: u8 = 3;

#[derive(Parser)]
#[command(name = "imgstow")]
#[command(
    about = "Shrink disk images and devices into compact archives, and restore them onto devices of any size",
    version
)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Arguments of the default `archive` command
    #[command(flatten)]
    archive: ArchiveArgs,
}

#[derive(Args)]
struct GlobalArgs {
    /// Log every external command before running it
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print nothing
    #[arg(short, long, global = true, conflicts_with_all = ["verbose", "debug"])]
    quiet: bool,

    /// Answer yes to every confirmation
    #[arg(short = 'y', long = "yes", global = true)]
    yes: bool,

    /// Trace-level logging, including parsed partition layouts
    #[arg(long, global = true)]
    debug: bool,

    /// Working directory for the image copy (a temporary one by default)
    #[arg(long, global = true, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Directory partitions are mounted on (a temporary one by default)
    #[arg(long, global = true, value_name = "DIR")]
    mount_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive a device or image file (the default command)
    Archive(ArchiveArgs),
    /// Restore an archive or image onto a block device
    Restore(RestoreArgs),
}

#[derive(Args)]
struct ArchiveArgs {
    /// Device or image file to archive
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output file, or an existing directory to place it in
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Extra dd arguments; block copies then go through dd (e.g. "conv=fsync")
    #[arg(long, allow_hyphen_values = true, value_name = "ARGS")]
    dd_args: Option<String>,

    /// Archive type: 7z, zip, tgz (or tar) or none
    #[arg(short = 'a', long = "arch-type", default_value = "7z", value_parser = parse_archive_kind)]
    arch_type: ArchiveKind,

    /// Base name of the output file
    #[arg(short, long)]
    name: Option<String>,

    /// Free space kept after the shrunk filesystem (K, M, G suffixes)
    #[arg(long, default_value = "1M", value_parser = parse_size, value_name = "SIZE")]
    shrink_tail: u64,

    /// Space kept after the last partition when truncating (K, M, G suffixes)
    #[arg(long, default_value = "1M", value_parser = parse_size, value_name = "SIZE")]
    trunc_tail: u64,

    /// Leave out the space after the last partition
    #[arg(long)]
    skip_unpartitioned: bool,

    /// Do not shrink the last partition
    #[arg(long)]
    no_resize: bool,

    /// Do not truncate the image after the last partition
    #[arg(long)]
    no_trunc: bool,

    /// Do not zero-fill free space
    #[arg(long)]
    no_zero: bool,

    /// Skip the free-space check
    #[arg(long)]
    no_space_check: bool,

    /// Work on the input itself instead of a copy
    #[arg(long)]
    in_place: bool,

    /// Write a .sha256 file next to the archive
    #[arg(long)]
    checksum: bool,
}

#[derive(Args)]
struct RestoreArgs {
    /// Archive or image to restore
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Block device to restore onto
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Extra dd arguments; the device is then written through dd
    #[arg(long, allow_hyphen_values = true, value_name = "ARGS")]
    dd_args: Option<String>,

    /// Do not grow the last partition to the end of the device
    #[arg(long)]
    no_extend: bool,

    /// Check the restored Linux and FAT32 partitions
    #[arg(long)]
    verify: bool,
}

impl ArchiveArgs {
    fn into_options(self) -> Result<ArchiveOptions> {
        let input = self
            .input
            .ok_or_else(|| anyhow!("No input given; use -i/--input"))?;
        Ok(ArchiveOptions {
            output: self.output,
            name: self.name,
            kind: self.arch_type,
            copy_args: split_dd_args(self.dd_args.as_deref()),
            shrink_tail: self.shrink_tail,
            trunc_tail: self.trunc_tail,
            skip_unpartitioned: self.skip_unpartitioned,
            resize: !self.no_resize,
            truncate: !self.no_trunc,
            zero_fill: !self.no_zero,
            space_check: !self.no_space_check,
            in_place: self.in_place,
            checksum: self.checksum,
            ..ArchiveOptions::new(input)
        })
    }
}

impl RestoreArgs {
    fn into_options(self) -> Result<RestoreOptions> {
        let input = self
            .input
            .ok_or_else(|| anyhow!("No input given; use -i/--input"))?;
        let output = self
            .output
            .ok_or_else(|| anyhow!("No output device given; use -o/--output"))?;
        Ok(RestoreOptions {
            copy_args: split_dd_args(self.dd_args.as_deref()),
            extend: !self.no_extend,
            verify: self.verify,
            ..RestoreOptions::new(input, output)
        })
    }
}

fn split_dd_args(args: Option<&str>) -> Vec<String> {
    args.map(|a| a.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn parse_archive_kind(s: &str) -> std::result::Result<ArchiveKind, String> {
    s.parse().map_err(|e: imgstow_core::error::Error| e.to_string())
}

/// Parses a byte count with an optional binary `K`, `M` or `G` suffix.
fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 1u64 << 10),
        Some('M') => (&s[..s.len() - 1], 1u64 << 20),
        Some('G') => (&s[..s.len() - 1], 1u64 << 30),
        _ => (s, 1),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| format!("invalid size '{s}'"))
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARNING",
        Level::Info => "INFO",
        Level::Debug => "VERBOSE",
        Level::Trace => "TRACE",
    }
}

fn init_logger(global: &GlobalArgs) {
    if global.quiet {
        return;
    }
    let level = if global.debug {
        LevelFilter::Trace
    } else if global.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let default_filter = level.to_string().to_lowercase();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format(|buf, record| {
            use std::io::Write;
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                level_name(record.level()),
                record.args()
            )
        })
        .init();
}

/// Presents a "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> bool {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false)
}

/// Connects the core library's progress events to indicatif bars.
fn progress_reporter(hidden: bool) -> impl Fn(ProgressEvent<'_>) + 'static {
    let current: Rc<RefCell<Option<ProgressBar>>> = Rc::new(RefCell::new(None));
    move |event| match event {
        ProgressEvent::Start { label, total } => {
            let pb = if total > 0 {
                let pb = ProgressBar::new(total);
                pb.set_style(
                    ProgressStyle::with_template(
                        "{prefix:20} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("■ "),
                );
                pb
            } else {
                let pb = ProgressBar::new_spinner();
                pb.set_style(
                    ProgressStyle::with_template(
                        "{prefix:20} [{elapsed_precise}] [{spinner:.blue}] {bytes} ({bytes_per_sec})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                pb.enable_steady_tick(Duration::from_millis(100));
                pb
            };
            if hidden {
                pb.set_draw_target(ProgressDrawTarget::hidden());
            }
            pb.set_prefix(label.to_string());
            if let Some(previous) = current.borrow_mut().replace(pb) {
                previous.finish_and_clear();
            }
        }
        ProgressEvent::Advance(bytes) => {
            if let Some(pb) = current.borrow().as_ref() {
                pb.set_position(bytes);
            }
        }
        ProgressEvent::Finish => {
            if let Some(pb) = current.borrow_mut().take() {
                pb.finish();
            }
        }
    }
}

fn run(cli: Cli, running: Arc<AtomicBool>) -> Result<()> {
    let global = cli.global;
    let ctx = OperationContext::new(SystemRunner)
        .with_auto_yes(global.yes)
        .with_prompt(confirm_operation)
        .with_progress(progress_reporter(global.quiet))
        .with_cancel_flag(running);
    let session_options = SessionOptions {
        work_dir: global.work_dir,
        mount_dir: global.mount_dir,
    };

    match cli.command.unwrap_or(Commands::Archive(cli.archive)) {
        Commands::Archive(args) => {
            let options = args.into_options()?;
            let mut session = Session::start(ctx, &session_options)?;
            let report = session.archive(&options)?;
            session.finish();

            if !global.quiet {
                println!(
                    "\n✨ Archived {} to {} ({}).",
                    style(options.input.display()).cyan(),
                    style(report.output.display()).cyan(),
                    HumanBytes(report.size)
                );
                if let Some(checksum) = report.checksum {
                    println!("   Checksum: {}", style(checksum.display()).cyan());
                }
            }
        }
        Commands::Restore(args) => {
            let options = args.into_options()?;
            let mut session = Session::start(ctx, &session_options)?;
            let report = session.restore(&options)?;
            session.finish();

            if !global.quiet {
                println!(
                    "\n✨ Restored {} onto {} ({} written).",
                    style(options.input.display()).cyan(),
                    style(options.output.display()).cyan(),
                    HumanBytes(report.written)
                );
                if let Some(ResizeOutcome::Extended { filesystem_grown }) = report.extend {
                    let fs_note = if filesystem_grown {
                        "filesystem grown"
                    } else {
                        "filesystem left as is"
                    };
                    println!("   Last partition extended to the end of the device ({fs_note}).");
                }
                for check in &report.checks {
                    let verdict = if check.passed {
                        style("clean").green()
                    } else {
                        style("FAILED").red().bold()
                    };
                    println!("   Partition {} ({}): {verdict}", check.index, check.type_label);
                }
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp
                | ErrorKind::DisplayVersion
                | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => ExitCode::SUCCESS,
                ErrorKind::UnknownArgument => ExitCode::from(EXIT_UNKNOWN_OPTION),
                _ => ExitCode::FAILURE,
            };
        }
    };
    init_logger(&cli.global);

    // This flag allows for graceful cancellation of operations.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Set up the Ctrl+C handler to toggle the `running` flag.
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Could not install the Ctrl+C handler: {e}");
    }

    match run(cli, running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            warn!("The run failed; re-run with --verbose or --debug for details");
            ExitCode::FAILURE
        }
    }
}
