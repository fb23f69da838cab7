use imgstow_core::archive::{self, ArchiveOptions};
use imgstow_core::compress::{self, ArchiveKind};
use imgstow_core::context::OperationContext;
use imgstow_core::tools::SystemRunner;
use imgstow_core::workspace::{self, WorkspaceLease};
use std::fs;
use std::io::Read;
use std::path::Path;
use tempfile::TempDir;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn decoded(path: &Path) -> (Vec<u8>, u64) {
    compress::with_decoded(path, |reader, size| {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok((data, size))
    })
    .unwrap()
}

#[test]
fn zip_and_tgz_archives_decode_to_the_image_prefix() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("disk.img");
    let data = pattern(3 * 1024 * 1024 + 17);
    fs::write(&image, &data).unwrap();
    let ctx = OperationContext::new(SystemRunner);
    let length = 2 * 1024 * 1024;

    for kind in [ArchiveKind::Zip, ArchiveKind::TarGz] {
        let output = dir.path().join(format!("disk.img{}", kind.extension()));
        compress::compress(&ctx, &image, length, kind, &output, "disk.img").unwrap();

        let (restored, size) = decoded(&output);
        assert_eq!(size, length, "{kind}");
        assert_eq!(restored.as_slice(), &data[..length as usize], "{kind}");
    }
}

#[test]
fn raw_images_are_read_as_is() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("disk.img");
    fs::write(&image, pattern(4096)).unwrap();

    let (restored, size) = decoded(&image);
    assert_eq!(size, 4096);
    assert_eq!(restored, pattern(4096));
}

#[test]
fn checksum_sidecar_names_the_archive() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("backup.img.zip");
    fs::write(&archive, b"abc").unwrap();
    let ctx = OperationContext::new(SystemRunner);

    let sidecar = compress::write_checksum(&ctx, &archive).unwrap();
    assert_eq!(sidecar, dir.path().join("backup.img.zip.sha256"));
    assert_eq!(
        fs::read_to_string(sidecar).unwrap(),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  backup.img.zip\n"
    );
}

#[test]
fn truncation_only_ever_shortens() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("disk.img");
    fs::write(&image, pattern(8192)).unwrap();

    assert!(!archive::truncate_file(&image, 10_000).unwrap());
    assert!(archive::truncate_file(&image, 4096).unwrap());
    assert_eq!(fs::metadata(&image).unwrap().len(), 4096);
    assert_eq!(fs::read(&image).unwrap(), pattern(4096));
}

#[test]
fn lease_keeps_foreign_files_and_reports_them() {
    let base = TempDir::new().unwrap();
    let work = base.path().join("work");
    let mount = base.path().join("mnt");

    let lease = WorkspaceLease::acquire(Some(&work), Some(&mount)).unwrap();
    assert!(work.is_dir() && mount.is_dir());
    fs::write(work.join("left.img"), b"x").unwrap();

    let lingering = lease.release();
    assert_eq!(lingering, vec![work.clone()]);
    assert!(work.join("left.img").exists());
    assert!(!mount.exists());
}

#[test]
fn lingering_scan_skips_unrelated_directories() {
    let base = TempDir::new().unwrap();
    let stale = base.path().join(format!("{}1234", workspace::WORK_DIR_PREFIX));
    fs::create_dir(&stale).unwrap();
    fs::create_dir(base.path().join("photos")).unwrap();

    assert_eq!(workspace::find_lingering(base.path(), &[]), vec![stale.clone()]);
    assert!(workspace::find_lingering(base.path(), &[stale.as_path()]).is_empty());
}

#[test]
fn archive_options_default_to_a_full_run() {
    let options = ArchiveOptions::new("disk.img");
    assert_eq!(options.kind, ArchiveKind::SevenZip);
    assert!(options.resize && options.truncate && options.zero_fill && options.space_check);
    assert!(!options.in_place && !options.skip_unpartitioned && !options.checksum);
    assert_eq!(options.shrink_tail, 1024 * 1024);
    assert_eq!(options.trunc_tail, 1024 * 1024);
}
