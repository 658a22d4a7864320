//! Durable writes for compressed artifacts.
//!
//! Bytes go to a `.part` sibling first and are renamed into place only after
//! they are flushed, so a reader never sees a half-written artifact and an
//! original is never removed before its replacement exists.

use crate::error::{PipelineError, Result};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Removes the temporary file unless the write completed.
struct PartGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for PartGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Write `bytes` to `dir/file_name` atomically. Fails if the target exists.
pub fn write_new(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let target = dir.join(file_name);
    if target.exists() {
        return Err(PipelineError::io(
            format!("refusing to overwrite {}", target.display()),
            io::Error::from(io::ErrorKind::AlreadyExists),
        ));
    }
    write_atomic(&target, bytes)?;
    Ok(target)
}

fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| PipelineError::io(format!("create {}", parent.display()), e))?;
    }

    let mut part_name = target.as_os_str().to_owned();
    part_name.push(".part");
    let mut guard = PartGuard {
        path: PathBuf::from(part_name),
        armed: true,
    };

    let context = || format!("write {}", guard.path.display());
    let mut file = File::create(&guard.path).map_err(|e| PipelineError::io(context(), e))?;
    file.write_all(bytes).map_err(|e| PipelineError::io(context(), e))?;
    file.sync_all().map_err(|e| PipelineError::io(context(), e))?;
    drop(file);

    fs::rename(&guard.path, target)
        .map_err(|e| PipelineError::io(format!("rename into {}", target.display()), e))?;
    guard.armed = false;
    Ok(())
}

/// Replace `original` with `bytes` stored as `original`'s sibling `file_name`.
///
/// The original is deleted only after the replacement is on disk. When the
/// replacement has the same path as the original it is swapped in by rename.
/// Any other existing file at the target is left alone and reported.
pub fn replace_original(original: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let dir = original.parent().unwrap_or_else(|| Path::new("."));
    let target = dir.join(file_name);

    if target == original {
        write_atomic(&target, bytes)?;
        return Ok(target);
    }

    let target = write_new(dir, file_name, bytes)?;
    fs::remove_file(original)
        .map_err(|e| PipelineError::io(format!("remove original {}", original.display()), e))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_new_leaves_no_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_new(dir.path(), "a.webp", b"RIFF").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"RIFF");
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("a.webp")]);
    }

    #[test]
    fn test_write_new_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1.webp"), b"keep me").unwrap();

        let err = write_new(dir.path(), "1.webp", b"new").unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
        assert_eq!(fs::read(dir.path().join("1.webp")).unwrap(), b"keep me");
    }

    #[test]
    fn test_replace_original_deletes_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("photo.jpg");
        fs::write(&original, b"jpeg bytes").unwrap();

        let out = replace_original(&original, "1.webp", b"webp bytes").unwrap();
        assert_eq!(out, dir.path().join("1.webp"));
        assert!(!original.exists());
        assert_eq!(fs::read(out).unwrap(), b"webp bytes");
    }

    #[test]
    fn test_replace_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("3.webp");
        fs::write(&original, b"old").unwrap();

        let out = replace_original(&original, "3.webp", b"new").unwrap();
        assert_eq!(out, original);
        assert_eq!(fs::read(&original).unwrap(), b"new");
    }

    #[test]
    fn test_collision_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("photo.png");
        fs::write(&original, b"png").unwrap();
        fs::write(dir.path().join("1.webp"), b"someone else").unwrap();

        assert!(replace_original(&original, "1.webp", b"new").is_err());
        assert_eq!(fs::read(&original).unwrap(), b"png");
        assert_eq!(fs::read(dir.path().join("1.webp")).unwrap(), b"someone else");
    }
}
