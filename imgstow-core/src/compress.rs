//! Archive formats: producing archives from an image and reading an image
//! back out of one.
//!
//! `zip` and gzip-compressed tar are handled in-process. `7z` is streamed
//! through the external `7z` tool in both directions. Bare `.gz`, `.xz` and
//! `.zst` streams are accepted on input as well.
use crate::context::OperationContext;
use crate::copy::{self, TrackedReader};
use crate::error::{Error, Result};
use crate::tools::ToolCommand;
use chrono::NaiveDate;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArchiveKind {
    #[default]
    SevenZip,
    Zip,
    /// gzip-compressed tar.
    TarGz,
    /// No compression; the prepared image is the output.
    None,
}

impl ArchiveKind {
    /// Suffix appended after `.img`.
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveKind::SevenZip => ".7z",
            ArchiveKind::Zip => ".zip",
            ArchiveKind::TarGz => ".tar.gz",
            ArchiveKind::None => "",
        }
    }

    pub fn is_compressed(&self) -> bool {
        *self != ArchiveKind::None
    }
}

impl FromStr for ArchiveKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "7z" => Ok(ArchiveKind::SevenZip),
            "zip" => Ok(ArchiveKind::Zip),
            "tgz" | "tar" => Ok(ArchiveKind::TarGz),
            "none" => Ok(ArchiveKind::None),
            other => Err(Error::Usage(format!(
                "unknown archive type '{other}' (expected 7z, zip, tgz, tar or none)"
            ))),
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveKind::SevenZip => "7z",
            ArchiveKind::Zip => "zip",
            ArchiveKind::TarGz => "tgz",
            ArchiveKind::None => "none",
        })
    }
}

/// `<yyyy-mm-dd>-<name>.img[.7z|.zip|.tar.gz]`, with `image` as the default
/// name.
pub fn archive_file_name(date: NaiveDate, name: Option<&str>, kind: ArchiveKind) -> String {
    format!(
        "{}-{}.img{}",
        date.format("%Y-%m-%d"),
        name.unwrap_or("image"),
        kind.extension()
    )
}

/// Compresses the first `length` bytes of `source` into `output`, stored
/// under `entry_name`.
///
/// `source` may be an image file or a block device.
pub fn compress(
    ctx: &OperationContext,
    source: &Path,
    length: u64,
    kind: ArchiveKind,
    output: &Path,
    entry_name: &str,
) -> Result<()> {
    let mut reader = File::open(source)?.take(length);
    let label = format!("Compressing to {kind}");
    info!("Compressing {} into {}", source.display(), output.display());

    match kind {
        ArchiveKind::SevenZip => {
            let command = ToolCommand::new("7z")
                .arg("a")
                .arg(format!("-si{entry_name}"))
                .arg(output.display());
            copy::pipe_into(ctx, &mut reader, &command, &label, length)?;
        }
        ArchiveKind::Zip => {
            let mut writer = zip::ZipWriter::new(File::create(output)?);
            let options = zip::write::FileOptions::<()>::default()
                .compression_method(zip::CompressionMethod::Deflated)
                .large_file(length >= u32::MAX as u64)
                .unix_permissions(0o644);
            writer.start_file(entry_name, options)?;
            copy::pump(ctx, &mut reader, &mut writer, &label, length)?;
            writer.finish()?;
        }
        ArchiveKind::TarGz => {
            let encoder = GzEncoder::new(File::create(output)?, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let mut header = tar::Header::new_gnu();
            header.set_size(length);
            header.set_mode(0o644);
            header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
            header.set_entry_type(tar::EntryType::Regular);

            let mut tracked = TrackedReader::new(ctx, reader, &label, length);
            let appended = builder.append_data(&mut header, entry_name, &mut tracked);
            if appended.is_err() {
                ctx.check_running()?;
            }
            appended?;
            tracked.finish();
            builder.into_inner()?.finish()?.flush()?;
        }
        ArchiveKind::None => {
            return Err(Error::Usage("archive type 'none' does not compress".into()));
        }
    }
    Ok(())
}

/// Container or stream format of a restore input, from its file name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputFormat {
    SevenZip,
    Zip,
    TarGz,
    Gzip,
    Xz,
    Zstd,
    Raw,
}

impl InputFormat {
    pub fn sniff(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".7z") {
            InputFormat::SevenZip
        } else if name.ends_with(".zip") {
            InputFormat::Zip
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            InputFormat::TarGz
        } else if name.ends_with(".gz") || name.ends_with(".gzip") {
            InputFormat::Gzip
        } else if name.ends_with(".xz") {
            InputFormat::Xz
        } else if name.ends_with(".zst") || name.ends_with(".zstd") {
            InputFormat::Zstd
        } else {
            InputFormat::Raw
        }
    }
}

/// Opens the image stored in `input` and hands its decoded byte stream to
/// `f`, together with its length when known (0 otherwise).
///
/// For multi-entry archives the first regular entry is the image.
pub fn with_decoded<T>(
    input: &Path,
    f: impl FnOnce(&mut dyn Read, u64) -> Result<T>,
) -> Result<T> {
    let format = InputFormat::sniff(input);
    debug!("Reading {} as {format:?}", input.display());

    match format {
        InputFormat::SevenZip => {
            let command = ToolCommand::new("7z").args(["e", "-so"]).arg(input.display());
            debug!("Running: {command}");
            let mut reader = duct::cmd(command.program.as_str(), &command.args)
                .stderr_capture()
                .reader()?;
            f(&mut reader, 0)
        }
        InputFormat::Zip => {
            let mut archive = zip::ZipArchive::new(File::open(input)?)?;
            let mut entry = archive.by_index(0)?;
            let size = entry.size();
            f(&mut entry, size)
        }
        InputFormat::TarGz => {
            let decoder = GzDecoder::new(BufReader::new(File::open(input)?));
            let mut archive = tar::Archive::new(decoder);
            for entry in archive.entries()? {
                let mut entry = entry?;
                if entry.header().entry_type().is_file() {
                    let size = entry.size();
                    return f(&mut entry, size);
                }
            }
            Err(Error::precondition(format!(
                "{} contains no image file",
                input.display()
            )))
        }
        InputFormat::Gzip => {
            let mut reader = GzDecoder::new(BufReader::new(File::open(input)?));
            f(&mut reader, 0)
        }
        InputFormat::Xz => {
            let mut reader = XzDecoder::new(BufReader::new(File::open(input)?));
            f(&mut reader, 0)
        }
        InputFormat::Zstd => {
            let mut reader = ZstdDecoder::new(BufReader::new(File::open(input)?))?;
            f(&mut reader, 0)
        }
        InputFormat::Raw => {
            let mut file = File::open(input)?;
            let size = file.metadata()?.len();
            f(&mut file, size)
        }
    }
}

/// Writes `<path>.sha256` in `sha256sum` format and returns its path.
pub fn write_checksum(ctx: &OperationContext, path: &Path) -> Result<PathBuf> {
    let mut file = File::open(path)?;
    let total = file.metadata()?.len();
    let mut hasher = Sha256::new();
    copy::pump(ctx, &mut file, &mut hasher, "Checksumming", total)?;
    let digest = hasher.finalize();

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".sha256");
    let sidecar = PathBuf::from(sidecar);
    std::fs::write(&sidecar, format!("{digest:x}  {file_name}\n"))?;
    info!("Checksum written to {}", sidecar.display());
    Ok(sidecar)
}
