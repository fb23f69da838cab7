//! The core, UI-agnostic library of the `imgstow` disk image archiver.
//!
//! `imgstow-core` turns block devices and disk images into small, restorable
//! archives and writes them back, adapting the last partition to the size of
//! the target device. The filesystems and partition tables themselves are
//! handled by the usual Linux tools (`fdisk`, `parted`, `losetup`, `resize2fs`
//! and friends); this crate decides what to run, in which order, and how to
//! read their output.
//!
//! The library is structured into several key modules:
//! - [`geometry`]: reads the partition layout of a device or image.
//! - [`resize`]: shrinks and extends the last partition and its ext2/3/4
//!   filesystem.
//! - [`space`]: estimates and checks the free space an archive run needs.
//! - [`mod@archive`] and [`mod@restore`]: the two pipelines.
//! - [`session`]: privilege check, working directories and cleanup around a
//!   pipeline run.
//!
//! Every external command goes through the [`tools::ToolRunner`] held by an
//! [`context::OperationContext`], which also carries the confirmation prompt,
//! the progress callback and the cancellation flag supplied by the front-end.
//!
//! ## Example: Archiving an Image
//!
//! ```rust,no_run
//! use imgstow_core::archive::ArchiveOptions;
//! use imgstow_core::compress::ArchiveKind;
//! use imgstow_core::context::OperationContext;
//! use imgstow_core::session::{Session, SessionOptions};
//! use imgstow_core::tools::SystemRunner;
//!
//! fn main() -> imgstow_core::error::Result<()> {
//!     let ctx = OperationContext::new(SystemRunner)
//!         .with_auto_yes(true)
//!         .with_progress(|event| println!("{event:?}"));
//!     let mut session = Session::start(ctx, &SessionOptions::default())?;
//!
//!     let options = ArchiveOptions {
//!         kind: ArchiveKind::Zip,
//!         ..ArchiveOptions::new("raspios.img")
//!     };
//!     let report = session.archive(&options)?;
//!     println!("Wrote {}", report.output.display());
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod compress;
pub mod context;
pub mod copy;
pub mod device;
pub mod error;
pub mod geometry;
pub mod loopdev;
pub mod mount;
pub mod platform;
pub mod resize;
pub mod restore;
pub mod session;
pub mod space;
pub mod tools;
pub mod workspace;
pub mod zerofill;
