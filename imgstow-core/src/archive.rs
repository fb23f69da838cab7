//! The archive pipeline: clone, shrink, zero-fill, truncate and compress.
//!
//! Three entry paths, chosen by input kind and `in_place`:
//!
//! - **Device, in place**: after a double confirmation the device itself is
//!   shrunk and zero-filled, its used prefix is streamed into the archive and
//!   the last partition is grown back. No image file is ever written.
//! - **Device or file, copied**: the input is block-copied into the working
//!   directory and the copy goes through the file path below. The copy is
//!   removed afterwards, or becomes the output for archive type `none`.
//! - **File, in place**: the image is shrunk, zero-filled and truncated where
//!   it lies. A compressed archive replaces it; with `none` it is the output.
use crate::compress::{self, ArchiveKind};
use crate::context::OperationContext;
use crate::copy;
use crate::device::ImageTarget;
use crate::error::{Error, Result};
use crate::geometry::{self, Geometry};
use crate::platform;
use crate::resize::{self, DEFAULT_TAIL, ResizeOutcome, ShrinkOptions};
use crate::space::{self, SpacePlan};
use crate::zerofill;
use chrono::NaiveDate;
use log::{info, warn};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveOptions {
    pub input: PathBuf,
    /// An existing directory to place the archive in, or the literal output
    /// path. Defaults to the current directory.
    pub output: Option<PathBuf>,
    /// Base name of the generated file name (`image` when unset).
    pub name: Option<String>,
    pub kind: ArchiveKind,
    /// Extra `dd` arguments; when set, block copies go through `dd`.
    pub copy_args: Vec<String>,
    pub shrink_tail: u64,
    pub trunc_tail: u64,
    /// Only copy up to the end of the last partition.
    pub skip_unpartitioned: bool,
    pub resize: bool,
    pub truncate: bool,
    pub zero_fill: bool,
    pub space_check: bool,
    pub in_place: bool,
    /// Write a `.sha256` sidecar next to the output.
    pub checksum: bool,
}

impl ArchiveOptions {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: None,
            name: None,
            kind: ArchiveKind::default(),
            copy_args: Vec::new(),
            shrink_tail: DEFAULT_TAIL,
            trunc_tail: DEFAULT_TAIL,
            skip_unpartitioned: false,
            resize: true,
            truncate: true,
            zero_fill: true,
            space_check: true,
            in_place: false,
            checksum: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveReport {
    pub output: PathBuf,
    pub size: u64,
    pub checksum: Option<PathBuf>,
}

/// Runs the archive pipeline for `options.input`.
pub fn run(ctx: &mut OperationContext, options: &ArchiveOptions) -> Result<ArchiveReport> {
    let target = ImageTarget::resolve(&options.input)?;
    info!("Archiving {target}");

    check_input(&target, options, platform::mount_points_of)?;

    let geometry = geometry::inspect(ctx, &target)?;
    let target = target.with_sector_size(geometry.sector_size);

    let output = if options.in_place && !options.kind.is_compressed() {
        target.path.clone()
    } else {
        let date = chrono::Local::now().date_naive();
        let output = resolve_output(options.output.as_deref(), options.name.as_deref(), options.kind, date);
        prepare_output(ctx, &output)?;
        output
    };

    if options.space_check {
        let work_dir = ctx.workspace()?.work_dir().to_path_buf();
        let plan = SpacePlan {
            in_place: options.in_place,
            skip_unpartitioned: options.skip_unpartitioned,
            resize: options.resize,
            compress: options.kind.is_compressed(),
            shrink_tail: options.shrink_tail,
        };
        space::validate(ctx, &target, &geometry, &plan, &work_dir, &parent_dir(&output))?;
    }

    match (target.is_device(), options.in_place) {
        (true, true) => archive_device_in_place(ctx, &target, options, &output)?,
        (_, false) => archive_copy(ctx, &target, &geometry, options, &output)?,
        (false, true) => archive_file_in_place(ctx, &target, options, &output)?,
    }

    let size = fs::metadata(&output)?.len();
    info!("Archive written to {} ({size} bytes)", output.display());
    let checksum = if options.checksum {
        Some(compress::write_checksum(ctx, &output)?)
    } else {
        None
    };
    Ok(ArchiveReport {
        output,
        size,
        checksum,
    })
}

/// Rejects device inputs that are mounted, or that would be archived in place
/// without compression.
fn check_input(
    target: &ImageTarget,
    options: &ArchiveOptions,
    mount_points_of: impl Fn(&Path) -> Vec<PathBuf>,
) -> Result<()> {
    if !target.is_device() {
        return Ok(());
    }
    if options.in_place && !options.kind.is_compressed() {
        return Err(Error::Usage(
            "a device archived in place needs a compressed archive type".into(),
        ));
    }
    platform::refuse_mounted(&target.path, &mount_points_of(&target.path))
}

/// Where the archive goes: inside `output` when it is a directory, at
/// `output` otherwise, or in the current directory by default.
pub fn resolve_output(
    output: Option<&Path>,
    name: Option<&str>,
    kind: ArchiveKind,
    date: NaiveDate,
) -> PathBuf {
    let file_name = compress::archive_file_name(date, name, kind);
    match output {
        Some(path) if path.is_dir() => path.join(file_name),
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(file_name),
    }
}

/// The image's name inside the archive: the output file name without the
/// archive suffix.
pub fn entry_name(output: &Path, kind: ArchiveKind) -> String {
    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match file_name.strip_suffix(kind.extension()) {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ if file_name.is_empty() => "image.img".to_string(),
        _ => file_name,
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn prepare_output(ctx: &OperationContext, output: &Path) -> Result<()> {
    if !output.exists() {
        return Ok(());
    }
    if !ctx.confirm(&format!("{} already exists. Remove it?", output.display())) {
        return Err(Error::precondition(format!(
            "{} already exists",
            output.display()
        )));
    }
    fs::remove_file(output)?;
    Ok(())
}

/// Bytes an image needs after truncation: the used sectors, the tail and room
/// for a relocated GPT backup table.
pub fn truncation_length(geometry: &Geometry, tail: u64) -> u64 {
    geometry.end_of_data_bytes() + tail + geometry.gpt_reserve_bytes()
}

/// Shortens the file at `path` to `length`, only if that makes it smaller.
pub fn truncate_file(path: &Path, length: u64) -> Result<bool> {
    let size = fs::metadata(path)?.len();
    if length >= size {
        return Ok(false);
    }
    OpenOptions::new().write(true).open(path)?.set_len(length)?;
    Ok(true)
}

/// Truncates an image file after its last partition, then repairs the GPT
/// backup header. Returns the new length when the file shrank.
pub fn truncate(ctx: &OperationContext, target: &ImageTarget, tail: u64) -> Result<Option<u64>> {
    let geometry = geometry::inspect(ctx, target)?;
    let length = truncation_length(&geometry, tail);
    if !truncate_file(&target.path, length)? {
        info!(
            "{} is already no longer than {length} bytes; not truncating",
            target.path.display()
        );
        return Ok(None);
    }
    info!("Truncated {} to {length} bytes", target.path.display());
    if geometry.is_gpt() {
        resize::relocate_gpt_backup(ctx, &target.path)?;
    }
    Ok(Some(length))
}

/// Shrinks and zero-fills `target` as the options ask.
fn shrink_and_zero(
    ctx: &mut OperationContext,
    target: &ImageTarget,
    options: &ArchiveOptions,
) -> Result<Option<ResizeOutcome>> {
    let outcome = if options.resize {
        let shrink_options = ShrinkOptions {
            tail: options.shrink_tail,
            dry_run: false,
        };
        Some(resize::shrink(ctx, target, &shrink_options)?)
    } else {
        None
    };

    if options.zero_fill {
        let geometry = geometry::inspect(ctx, target)?;
        zerofill::zero_fill(ctx, target, &geometry)?;
    }
    Ok(outcome)
}

/// Shrinks, zero-fills and truncates the image file at `path`.
fn prepare_file(ctx: &mut OperationContext, path: &Path, options: &ArchiveOptions) -> Result<()> {
    let target = ImageTarget::resolve(path)?;
    shrink_and_zero(ctx, &target, options)?;
    if options.truncate {
        truncate(ctx, &target, options.trunc_tail)?;
    }
    Ok(())
}

fn archive_device_in_place(
    ctx: &mut OperationContext,
    target: &ImageTarget,
    options: &ArchiveOptions,
    output: &Path,
) -> Result<()> {
    warn!(
        "In-place mode shrinks and zero-fills {} directly",
        target.path.display()
    );
    let confirmed = ctx.confirm(&format!(
        "Partitions on {} will be modified in place. Continue?",
        target.path.display()
    )) && ctx.confirm("Are you sure? Interrupting this leaves the device shrunk.");
    if !confirmed {
        return Err(Error::precondition(
            "in-place archiving of a device was not confirmed",
        ));
    }

    let outcome = shrink_and_zero(ctx, target, options)?;
    let geometry = geometry::inspect(ctx, target)?;
    let length = if options.truncate {
        truncation_length(&geometry, options.trunc_tail).min(target.size_bytes)
    } else {
        target.size_bytes
    };

    let compressed = compress::compress(
        ctx,
        &target.path,
        length,
        options.kind,
        output,
        &entry_name(output, options.kind),
    );

    if matches!(outcome, Some(ResizeOutcome::Shrunk { .. })) {
        info!("Growing {} back to its full size", target.path.display());
        match resize::extend(ctx, target) {
            Err(e) if compressed.is_ok() => return Err(e),
            Err(e) => warn!("Could not grow {} back: {e}", target.path.display()),
            Ok(_) => {}
        }
    }
    compressed
}

fn archive_copy(
    ctx: &mut OperationContext,
    target: &ImageTarget,
    geometry: &Geometry,
    options: &ArchiveOptions,
    output: &Path,
) -> Result<()> {
    let entry = entry_name(output, options.kind);
    let cache = ctx.workspace()?.work_dir().join(&entry);
    let limit = options
        .skip_unpartitioned
        .then(|| geometry.end_of_data_bytes());

    info!("Copying {} to {}", target.path.display(), cache.display());
    let result = copy_and_prepare(ctx, target, geometry, options, &cache, limit)
        .and_then(|()| finish_copy(ctx, &cache, options, output, &entry));

    if cache.exists() {
        if let Err(e) = fs::remove_file(&cache) {
            warn!("Could not remove {}: {e}", cache.display());
        }
    }
    result
}

fn copy_and_prepare(
    ctx: &mut OperationContext,
    target: &ImageTarget,
    geometry: &Geometry,
    options: &ArchiveOptions,
    cache: &Path,
    limit: Option<u64>,
) -> Result<()> {
    copy::copy_image(ctx, target, cache, limit, &options.copy_args)?;
    if options.skip_unpartitioned && geometry.is_gpt() {
        resize::relocate_gpt_backup(ctx, cache)?;
    }
    prepare_file(ctx, cache, options)
}

fn finish_copy(
    ctx: &OperationContext,
    cache: &Path,
    options: &ArchiveOptions,
    output: &Path,
    entry: &str,
) -> Result<()> {
    if options.kind.is_compressed() {
        let length = fs::metadata(cache)?.len();
        return compress::compress(ctx, cache, length, options.kind, output, entry);
    }
    if fs::rename(cache, output).is_err() {
        // Across filesystems.
        fs::copy(cache, output)?;
    }
    Ok(())
}

fn archive_file_in_place(
    ctx: &mut OperationContext,
    target: &ImageTarget,
    options: &ArchiveOptions,
    output: &Path,
) -> Result<()> {
    prepare_file(ctx, &target.path, options)?;
    if !options.kind.is_compressed() {
        return Ok(());
    }

    let length = fs::metadata(&target.path)?.len();
    compress::compress(
        ctx,
        &target.path,
        length,
        options.kind,
        output,
        &entry_name(output, options.kind),
    )?;
    info!("Removing {}", target.path.display());
    fs::remove_file(&target.path)?;
    Ok(())
}
