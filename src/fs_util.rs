use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use md5::Md5;
use regex::Regex;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use zip::ZipArchive;

use crate::domain::{Checksum, ChecksumKind};
use crate::error::TerraError;

fn fs_err(context: &str, path: &Path, err: impl std::fmt::Display) -> TerraError {
    TerraError::Filesystem(format!("{context} {}: {err}", path.display()))
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, TerraError> {
    let file = fs::File::open(zip_path).map_err(|err| fs_err("open zip", zip_path, err))?;
    let mut archive = ZipArchive::new(file).map_err(|err| fs_err("read zip", zip_path, err))?;

    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| fs_err("read zip entry", zip_path, err))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(TerraError::Filesystem(format!(
                    "zip entry path traversal detected in {}",
                    zip_path.display()
                )));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path).map_err(|err| fs_err("create", &entry_path, err))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| fs_err("create", parent, err))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| fs_err("create", &entry_path, err))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| fs_err("write", &entry_path, err))?;
        extracted.push(entry_path);
    }
    Ok(extracted)
}

pub fn file_digest(path: &Path, kind: ChecksumKind) -> Result<Checksum, TerraError> {
    let mut file = fs::File::open(path).map_err(|err| fs_err("open", path, err))?;
    let hex = match kind {
        ChecksumKind::Md5 => hex::encode(stream_digest::<Md5>(&mut file, path)?),
        ChecksumKind::Sha256 => hex::encode(stream_digest::<Sha256>(&mut file, path)?),
    };
    Checksum::new(kind, &hex)
}

fn stream_digest<D: Digest>(reader: &mut impl Read, path: &Path) -> Result<Vec<u8>, TerraError> {
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf).map_err(|err| fs_err("read", path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().to_vec())
}

/// Copies `src` next to `dest` under a temp name and renames it into place,
/// so `dest` is either absent or complete.
pub fn copy_file_atomic(src: &Path, dest: &Path) -> Result<(), TerraError> {
    let parent = dest
        .parent()
        .ok_or_else(|| TerraError::Filesystem(format!("no parent for {}", dest.display())))?;
    fs::create_dir_all(parent).map_err(|err| fs_err("create", parent, err))?;

    let mut temp = NamedTempFile::new_in(parent).map_err(|err| fs_err("tempfile in", parent, err))?;
    let mut input = fs::File::open(src).map_err(|err| fs_err("open", src, err))?;
    io::copy(&mut input, temp.as_file_mut()).map_err(|err| fs_err("copy", src, err))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| fs_err("sync", dest, err))?;
    temp.persist(dest)
        .map_err(|err| fs_err("persist", dest, err.error))?;
    Ok(())
}

#[cfg(unix)]
pub fn symlink_file(src: &Path, dest: &Path) -> Result<(), TerraError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| fs_err("create", parent, err))?;
    }
    if dest.exists() {
        fs::remove_file(dest).map_err(|err| fs_err("remove", dest, err))?;
    }
    std::os::unix::fs::symlink(src, dest).map_err(|err| fs_err("symlink", dest, err))
}

#[cfg(not(unix))]
pub fn symlink_file(src: &Path, dest: &Path) -> Result<(), TerraError> {
    copy_file_atomic(src, dest)
}

/// Recursively lists regular files below `root`, sorted. Symlinks to files
/// are included.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>, TerraError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir).map_err(|err| fs_err("read dir", &dir, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| fs_err("read dir", &dir, err))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|err| fs_err("stat", &path, err))?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() || (file_type.is_symlink() && path.is_file()) {
                // Linked directories are not followed.
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Shell-style wildcard (`*`, `?`) to an anchored regex.
pub fn wildcard_regex(pattern: &str) -> Result<Regex, TerraError> {
    let mut expr = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|err| TerraError::ConfigInvalid(format!("pattern {pattern}: {err}")))
}

/// Files below `root` whose file name matches the wildcard `pattern`.
pub fn find_by_pattern(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, TerraError> {
    let matcher = wildcard_regex(pattern)?;
    Ok(walk_files(root)?
        .into_iter()
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| matcher.is_match(name))
                .unwrap_or(false)
        })
        .collect())
}

pub fn remove_dir_if_exists(path: &Path) -> Result<(), TerraError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(fs_err("remove", path, err)),
    }
}
