//! Block copies between images, devices, archive streams and external tools.
//!
//! Every in-process loop reports progress through the context and stops with
//! [`Error::Cancelled`] once the cancellation flag is cleared.
use crate::context::{OperationContext, ProgressEvent};
use crate::device::ImageTarget;
use crate::error::{Error, Result};
use crate::tools::ToolCommand;
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

// Use a 1 MiB buffer for I/O operations.
const BUFFER_SIZE: usize = 1024 * 1024;

/// O_DIRECT requires buffers, offsets and lengths aligned to the logical
/// block size.
const DIRECT_ALIGN: usize = 512;

/// A heap buffer whose usable slice starts on a [`DIRECT_ALIGN`] boundary.
struct AlignedBuffer {
    buf: Vec<u8>,
    offset: usize,
}

impl AlignedBuffer {
    fn new() -> Self {
        let buf = vec![0u8; BUFFER_SIZE + DIRECT_ALIGN];
        let offset = buf.as_ptr().align_offset(DIRECT_ALIGN);
        Self { buf, offset }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..self.offset + BUFFER_SIZE]
    }
}

/// Copies `source` into the regular file `dest`, stopping after `limit`
/// bytes when given.
///
/// With `copy_args`, the copy is delegated to `dd` and those arguments are
/// appended to its command line. A cancelled in-process copy removes the
/// partial `dest`.
pub fn copy_image(
    ctx: &OperationContext,
    source: &ImageTarget,
    dest: &Path,
    limit: Option<u64>,
    copy_args: &[String],
) -> Result<u64> {
    let length = limit.map_or(source.size_bytes, |l| l.min(source.size_bytes));
    if !copy_args.is_empty() {
        ctx.run(&dd_copy_command(&source.path, dest, limit, copy_args))?;
        return Ok(length);
    }

    let mut options = OpenOptions::new();
    options.read(true);
    if source.is_device() && length % DIRECT_ALIGN as u64 == 0 {
        options.custom_flags(libc::O_DIRECT);
    }
    let mut input = options.open(&source.path)?;
    let mut output = File::create(dest)?;

    let label = format!("Copying {}", source.display_name());
    ctx.progress(ProgressEvent::Start {
        label: &label,
        total: length,
    });

    let mut buffer = AlignedBuffer::new();
    let buffer = buffer.as_mut_slice();
    let mut copied: u64 = 0;
    while copied < length {
        if let Err(e) = ctx.check_running() {
            drop(output);
            std::fs::remove_file(dest)?;
            return Err(e);
        }

        let chunk = std::cmp::min(BUFFER_SIZE as u64, length - copied) as usize;
        input.read_exact(&mut buffer[..chunk])?;
        output.write_all(&buffer[..chunk])?;

        copied += chunk as u64;
        ctx.progress(ProgressEvent::Advance(copied));
    }
    output.flush()?;
    ctx.progress(ProgressEvent::Finish);
    Ok(copied)
}

fn dd_copy_command(source: &Path, dest: &Path, limit: Option<u64>, copy_args: &[String]) -> ToolCommand {
    let mut command = ToolCommand::new("dd")
        .arg(format!("if={}", source.display()))
        .arg(format!("of={}", dest.display()))
        .arg("bs=1M");
    if let Some(limit) = limit {
        command = command.arg("iflag=count_bytes").arg(format!("count={limit}"));
    }
    command.args(copy_args)
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Streams `reader` onto the block device at `device` with unbuffered,
/// aligned writes.
///
/// `total` is only used for progress and may be 0 when unknown. The final
/// chunk is padded with zeros up to the next block boundary.
pub fn write_to_device(
    ctx: &OperationContext,
    reader: &mut dyn Read,
    device: &Path,
    total: u64,
) -> Result<u64> {
    let mut device_file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_DIRECT)
        .open(device)?;

    let label = format!("Writing {}", device.display());
    ctx.progress(ProgressEvent::Start {
        label: &label,
        total,
    });

    let mut buffer = AlignedBuffer::new();
    let buffer = buffer.as_mut_slice();
    let mut written: u64 = 0;
    loop {
        ctx.check_running()?;

        let n = read_full(reader, buffer)?;
        if n == 0 {
            break;
        }

        // The last chunk may not be a multiple of the block size.
        let padded = n.div_ceil(DIRECT_ALIGN) * DIRECT_ALIGN;
        buffer[n..padded].fill(0);
        device_file.write_all(&buffer[..padded])?;

        written += n as u64;
        ctx.progress(ProgressEvent::Advance(written));
        if n < buffer.len() {
            break;
        }
    }
    device_file.sync_all()?;
    ctx.progress(ProgressEvent::Finish);
    debug!("Wrote {written} bytes to {}", device.display());
    Ok(written)
}

/// Feeds `reader` to the stdin of `command` and waits for it to finish.
///
/// Used for the streaming modes of `7z` and `dd`. A cancelled run kills the
/// child.
pub fn pipe_into(
    ctx: &OperationContext,
    reader: &mut dyn Read,
    command: &ToolCommand,
    label: &str,
    total: u64,
) -> Result<u64> {
    debug!("Running: {command}");
    let (stdin, mut feed) = os_pipe::pipe()?;
    let handle = duct::cmd(command.program.as_str(), &command.args)
        .stdin_file(stdin)
        .stdout_null()
        .stderr_capture()
        .unchecked()
        .start()
        .map_err(|e| Error::ExternalTool {
            command: command.to_string(),
            status: "could not be started".to_string(),
            stderr: e.to_string(),
        })?;

    let pumped = pump(ctx, reader, &mut feed, label, total);
    // The child only sees end of input once our end of the pipe is closed.
    drop(feed);
    if let Err(Error::Cancelled) = pumped {
        let _ = handle.kill();
        return Err(Error::Cancelled);
    }

    let output = handle.wait()?;
    if !output.status.success() {
        return Err(Error::ExternalTool {
            command: command.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    pumped
}

/// Copies everything from `reader` into `writer`, reporting progress.
pub fn pump(
    ctx: &OperationContext,
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    label: &str,
    total: u64,
) -> Result<u64> {
    ctx.progress(ProgressEvent::Start { label, total });
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut copied: u64 = 0;
    loop {
        ctx.check_running()?;
        let n = read_full(reader, &mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        copied += n as u64;
        ctx.progress(ProgressEvent::Advance(copied));
    }
    writer.flush()?;
    ctx.progress(ProgressEvent::Finish);
    Ok(copied)
}

/// A reader that reports progress and fails once the run is cancelled.
///
/// For consumers that pull from a `Read` themselves, such as the tar builder.
pub(crate) struct TrackedReader<'a, R> {
    inner: R,
    ctx: &'a OperationContext,
    read: u64,
}

impl<'a, R: Read> TrackedReader<'a, R> {
    pub(crate) fn new(ctx: &'a OperationContext, inner: R, label: &str, total: u64) -> Self {
        ctx.progress(ProgressEvent::Start { label, total });
        Self {
            inner,
            ctx,
            read: 0,
        }
    }

    pub(crate) fn finish(self) -> u64 {
        self.ctx.progress(ProgressEvent::Finish);
        self.read
    }
}

impl<R: Read> Read for TrackedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.ctx.check_running().is_err() {
            return Err(io::Error::other("Operation cancelled by user"));
        }
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        self.ctx.progress(ProgressEvent::Advance(self.read));
        Ok(n)
    }
}
