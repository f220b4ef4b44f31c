use std::fs::{self, File};
use std::io;
use std::path::Path;

use agh_core::fs::{ensure_dir, remove_file_if_exists};
use agh_core::Result;
use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, warn};
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveKind {
    pub fn detect(file_name: &str) -> Option<Self> {
        let lower = file_name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if lower.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else if lower.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else {
            None
        }
    }
}

/// Extracts `archive` into `dest`, replacing files left by an earlier
/// extraction. Returns `None` when the file is not a recognised archive.
pub fn unpack(archive: &Path, dest: &Path) -> Result<Option<ArchiveKind>> {
    let name = archive
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let kind = match ArchiveKind::detect(&name) {
        Some(kind) => kind,
        None => return Ok(None),
    };
    ensure_dir(dest)?;
    debug!(archive = %archive.display(), dest = %dest.display(), ?kind, "unpacking");
    match kind {
        ArchiveKind::Tar => unpack_tar(Archive::new(File::open(archive)?), dest)?,
        ArchiveKind::TarGz => {
            unpack_tar(Archive::new(GzDecoder::new(File::open(archive)?)), dest)?
        }
        ArchiveKind::Zip => unpack_zip(archive, dest)?,
    }
    Ok(Some(kind))
}

fn unpack_tar<R: io::Read>(mut archive: Archive<R>, dest: &Path) -> Result<()> {
    archive.set_overwrite(true);
    // `unpack` skips entries that would land outside `dest`.
    archive.unpack(dest)?;
    Ok(())
}

fn unpack_zip(path: &Path, dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let rel = match entry.enclosed_name().map(|p| p.to_path_buf()) {
            Some(rel) => rel,
            None => {
                warn!(entry = entry.name(), "skipping zip entry outside the destination");
                continue;
            }
        };
        let out = dest.join(rel);
        if entry.is_dir() {
            ensure_dir(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            ensure_dir(parent)?;
        }
        remove_file_if_exists(&out)?;
        let mut file = File::create(&out)?;
        io::copy(&mut entry, &mut file)?;
    }
    Ok(())
}

/// Restores owner read/write on every regular file under `dir` so a new
/// extraction can replace them.
pub fn unlock_files(dir: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(dir).min_depth(1) {
        let entry = entry?;
        if entry.file_type().is_file() {
            agh_core::fs::set_mode(entry.path(), 0o600)?;
        }
    }
    Ok(())
}

/// Makes every regular file under `dir` owner-read-only.
pub fn lock_files(dir: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(dir).min_depth(1) {
        let entry = entry?;
        if entry.file_type().is_file() {
            agh_core::fs::set_mode(entry.path(), 0o400)?;
        }
    }
    Ok(())
}

pub(crate) fn file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_tar_gz(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).expect("create");
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, body.as_bytes())
                .expect("append");
        }
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gz");
    }

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).expect("create");
        let mut zip = zip::ZipWriter::new(file);
        for (name, body) in files {
            zip.start_file(*name, zip::write::FileOptions::default())
                .expect("start");
            zip.write_all(body.as_bytes()).expect("write");
        }
        zip.finish().expect("finish");
    }

    #[test]
    fn detects_by_full_suffix() {
        assert_eq!(ArchiveKind::detect("p2sol.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect("p2sol.TGZ"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect("p2sol.tar"), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::detect("p2sol.zip"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::detect("main.c"), None);
        assert_eq!(ArchiveKind::detect("tarball-notes.txt"), None);
    }

    #[test]
    fn unpacks_tar_gz_and_reruns_over_locked_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("p2.tar.gz");
        let dest = dir.path().join("out");
        write_tar_gz(&archive, &[("main.c", "int main;"), ("lib/util.h", "#pragma once")]);

        assert_eq!(unpack(&archive, &dest).expect("unpack"), Some(ArchiveKind::TarGz));
        assert_eq!(fs::read_to_string(dest.join("main.c")).expect("read"), "int main;");
        assert!(dest.join("lib").join("util.h").is_file());

        lock_files(&dest).expect("lock");
        unlock_files(&dest).expect("unlock");
        unpack(&archive, &dest).expect("second unpack");
        assert_eq!(fs::read_to_string(dest.join("main.c")).expect("read"), "int main;");
    }

    #[test]
    fn unpacks_zip_and_skips_escaping_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("sub.zip");
        let dest = dir.path().join("nested").join("out");
        write_zip(&archive, &[("a.c", "a"), ("../escape.txt", "x"), ("d/b.h", "b")]);

        assert_eq!(unpack(&archive, &dest).expect("unpack"), Some(ArchiveKind::Zip));
        assert_eq!(fs::read_to_string(dest.join("a.c")).expect("read"), "a");
        assert!(dest.join("d").join("b.h").is_file());
        assert!(!dir.path().join("nested").join("escape.txt").exists());
        assert_eq!(file_names(&dest).expect("names"), vec!["a.c", "d"]);
    }

    #[test]
    fn plain_file_is_not_unpacked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plain = dir.path().join("main.c");
        fs::write(&plain, "x").expect("write");
        assert_eq!(unpack(&plain, &dir.path().join("out")).expect("unpack"), None);
        assert!(!dir.path().join("out").exists());
    }
}
