use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

pub fn read_json(path: &Path) -> Result<Value> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Walks from `start` up through its ancestors and returns the first
/// `start/.../filename` that exists.
pub fn find_file_in_parents(start: &Path, filename: &str) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(dir) = cur {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        cur = dir.parent();
    }
    None
}

pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Absolute, lexically normalized form of `path` (symlinks are not resolved).
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(normalize_path(path));
    }
    let cwd = std::env::current_dir()?;
    Ok(normalize_path(&cwd.join(path)))
}

/// Path to `target` expressed relative to the directory `base`, walking up
/// with `..` where the two diverge.
pub fn relative_path(target: &Path, base: &Path) -> Result<PathBuf> {
    let target = absolute_path(target)?;
    let base = absolute_path(base)?;
    let target_parts: Vec<Component> = target.components().collect();
    let base_parts: Vec<Component> = base.components().collect();
    let common = target_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..base_parts.len() {
        out.push("..");
    }
    for part in &target_parts[common..] {
        out.push(part.as_os_str());
    }
    Ok(out)
}

/// Removes a file or symlink; a missing path is not an error.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
pub fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(windows)]
pub fn symlink(target: &Path, link: &Path) -> Result<()> {
    let resolved = link.parent().map(|p| p.join(target)).unwrap_or_default();
    if resolved.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)?;
    } else {
        std::os::windows::fs::symlink_file(target, link)?;
    }
    Ok(())
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Only the owner-write bit is meaningful off unix.
#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    Ok(sha256_bytes(&fs::read(path)?))
}

/// Name of the file with every extension kept, e.g. `.tar.gz` for
/// `p2sol.tar.gz`. Leading dots do not start a suffix.
pub fn full_suffix(name: &str) -> &str {
    let trimmed = name.trim_start_matches('.');
    let offset = name.len() - trimmed.len();
    match trimmed.find('.') {
        Some(idx) if !trimmed.ends_with('.') => &name[offset + idx..],
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_walks_up_between_siblings() {
        let rel = relative_path(
            Path::new("/a/submissions/evaluations/x/index.pdf"),
            Path::new("/a/output/as_rendered"),
        )
        .expect("relative");
        assert_eq!(
            rel,
            PathBuf::from("../../submissions/evaluations/x/index.pdf")
        );
    }

    #[test]
    fn relative_path_inside_base() {
        let rel = relative_path(Path::new("/a/b/c.txt"), Path::new("/a")).expect("relative");
        assert_eq!(rel, PathBuf::from("b/c.txt"));
    }

    #[test]
    fn full_suffix_keeps_compound_extensions() {
        assert_eq!(full_suffix("p2sol.tar.gz"), ".tar.gz");
        assert_eq!(full_suffix("alice-420.c"), ".c");
        assert_eq!(full_suffix("Makefile"), "");
        assert_eq!(full_suffix(".hidden"), "");
        assert_eq!(full_suffix(".hidden.txt"), ".txt");
    }

    #[test]
    fn find_file_in_parents_stops_at_nearest() {
        let root = tempfile::tempdir().expect("tempdir");
        let deep = root.path().join("one").join("two");
        ensure_dir(&deep).expect("mkdir");
        fs::write(root.path().join("marker.json"), "{}").expect("write");
        let found = find_file_in_parents(&deep, "marker.json").expect("found");
        assert_eq!(found, root.path().join("marker.json"));
        assert!(find_file_in_parents(&deep, "absent-marker.json").is_none());
    }

    #[test]
    fn file_digest_matches_byte_digest() {
        let root = tempfile::tempdir().expect("tempdir");
        let path = root.path().join("graded.pdf");
        fs::write(&path, b"abc").expect("write");
        assert_eq!(
            sha256_file(&path).expect("digest"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_file(&path).expect("digest"), sha256_bytes(b"abc"));
    }

    #[test]
    fn atomic_write_replaces_content() {
        let root = tempfile::tempdir().expect("tempdir");
        let path = root.path().join("nested").join("out.json");
        atomic_write_json_pretty(&path, &serde_json::json!({"a": 1})).expect("write");
        atomic_write_json_pretty(&path, &serde_json::json!({"a": 2})).expect("rewrite");
        assert_eq!(read_json(&path).expect("read")["a"], 2);
        let leftovers = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(leftovers, 1);
    }
}
