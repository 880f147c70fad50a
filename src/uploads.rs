// src/uploads.rs
//! Upload storage and per-user metadata.
//!
//! Stored files live under `<docroot>/uploads/`; each user has an
//! append-only metadata file at `<docroot>/uploads/.meta/<user>.list`
//! with one `stored|original|size|unix_ts` record per line.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub stored_name: String,
    pub original_name: String,
    pub size: u64,
    pub timestamp: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed,
    NotFound,
    Failed,
}

pub fn upload_dir(docroot: &Path) -> PathBuf {
    docroot.join("uploads")
}

fn meta_path(docroot: &Path, user: &str) -> PathBuf {
    upload_dir(docroot).join(".meta").join(format!("{}.list", user))
}

/// Reject stored-name parameters that could escape the upload tree.
pub fn is_valid_stored_param(stored: &str) -> bool {
    !stored.is_empty()
        && !stored.contains("..")
        && !stored.contains('/')
        && !stored.contains('\\')
}

/// `<user>_<yyyymmddHHMMSS>_<sanitized original>`.
pub fn stored_name_for(user: &str, sanitized_original: &str) -> String {
    let stamp = Local::now().format("%Y%m%d%H%M%S");
    format!("{}_{}_{}", user, stamp, sanitized_original)
}

/// Parse the user's metadata file. A missing file is an empty list.
pub fn load_user_uploads(docroot: &Path, user: &str) -> Vec<UploadItem> {
    let file = match File::open(meta_path(docroot, user)) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    let mut items = Vec::new();
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('|');
        let (Some(stored), Some(original), Some(size), Some(ts)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            continue;
        };
        let (Ok(size), Ok(timestamp)) = (size.parse(), ts.parse()) else {
            continue;
        };
        items.push(UploadItem {
            stored_name: stored.to_string(),
            original_name: original.to_string(),
            size,
            timestamp,
        });
    }
    items
}

pub fn user_owns(docroot: &Path, user: &str, stored: &str) -> bool {
    load_user_uploads(docroot, user)
        .iter()
        .any(|item| item.stored_name == stored)
}

/// Persist the file data, creating `uploads/` and `.meta/` on demand.
/// Short writes are retried; a failed write unlinks the partial file.
pub fn save_upload(docroot: &Path, stored: &str, data: &[u8]) -> io::Result<()> {
    let dir = upload_dir(docroot);
    fs::create_dir_all(dir.join(".meta"))?;

    let path = dir.join(stored);
    let mut file = File::create(&path)?;
    let mut written = 0;
    while written < data.len() {
        match file.write(&data[written..]) {
            Ok(0) => {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        }
    }
    Ok(())
}

pub fn append_metadata(docroot: &Path, user: &str, item: &UploadItem) -> io::Result<()> {
    let path = meta_path(docroot, user);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut meta = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        meta,
        "{}|{}|{}|{}",
        item.stored_name, item.original_name, item.size, item.timestamp
    )
}

/// Remove the stored file and rewrite the metadata file without its
/// record (write to a temp path, then rename over the original).
pub fn remove_upload(docroot: &Path, user: &str, stored: &str) -> DeleteOutcome {
    let file_path = upload_dir(docroot).join(stored);
    if let Err(e) = fs::remove_file(&file_path) {
        if e.kind() != io::ErrorKind::NotFound {
            return DeleteOutcome::Failed;
        }
    }

    let meta = meta_path(docroot, user);
    let Ok(input) = File::open(&meta) else {
        return DeleteOutcome::NotFound;
    };
    let tmp = meta.with_extension("list.tmp");
    let Ok(mut output) = File::create(&tmp) else {
        return DeleteOutcome::Failed;
    };

    let mut removed = false;
    for line in BufReader::new(input).lines() {
        let Ok(line) = line else {
            let _ = fs::remove_file(&tmp);
            return DeleteOutcome::Failed;
        };
        if line.is_empty() {
            continue;
        }
        if line.split('|').next() == Some(stored) {
            removed = true;
            continue;
        }
        if writeln!(output, "{}", line).is_err() {
            let _ = fs::remove_file(&tmp);
            return DeleteOutcome::Failed;
        }
    }
    drop(output);

    if !removed {
        let _ = fs::remove_file(&tmp);
        return DeleteOutcome::NotFound;
    }
    if fs::rename(&tmp, &meta).is_err() {
        return DeleteOutcome::Failed;
    }
    DeleteOutcome::Removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(stored: &str, original: &str, size: u64) -> UploadItem {
        UploadItem {
            stored_name: stored.to_string(),
            original_name: original.to_string(),
            size,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let a = item("alice_1_cat.png", "cat.png", 10);
        let b = item("alice_2_dog.png", "dog.png", 20);
        append_metadata(dir.path(), "alice", &a).unwrap();
        append_metadata(dir.path(), "alice", &b).unwrap();

        let items = load_user_uploads(dir.path(), "alice");
        assert_eq!(items, vec![a, b]);
        assert!(load_user_uploads(dir.path(), "bob").is_empty());
    }

    #[test]
    fn ownership_check() {
        let dir = tempfile::tempdir().unwrap();
        append_metadata(dir.path(), "alice", &item("s1", "o1", 1)).unwrap();
        assert!(user_owns(dir.path(), "alice", "s1"));
        assert!(!user_owns(dir.path(), "alice", "s2"));
        assert!(!user_owns(dir.path(), "bob", "s1"));
    }

    #[test]
    fn save_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        save_upload(dir.path(), "stored.bin", b"payload bytes").unwrap();
        let data = fs::read(upload_dir(dir.path()).join("stored.bin")).unwrap();
        assert_eq!(data, b"payload bytes");
    }

    #[test]
    fn delete_rewrites_metadata() {
        let dir = tempfile::tempdir().unwrap();
        save_upload(dir.path(), "s1", b"one").unwrap();
        append_metadata(dir.path(), "alice", &item("s1", "o1", 3)).unwrap();
        append_metadata(dir.path(), "alice", &item("s2", "o2", 3)).unwrap();

        assert_eq!(remove_upload(dir.path(), "alice", "s1"), DeleteOutcome::Removed);
        assert!(!upload_dir(dir.path()).join("s1").exists());
        let items = load_user_uploads(dir.path(), "alice");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].stored_name, "s2");

        assert_eq!(remove_upload(dir.path(), "alice", "s1"), DeleteOutcome::NotFound);
    }

    #[test]
    fn stored_param_validation() {
        assert!(is_valid_stored_param("alice_20260101_cat.png"));
        assert!(!is_valid_stored_param(""));
        assert!(!is_valid_stored_param("../etc/passwd"));
        assert!(!is_valid_stored_param("a/b"));
        assert!(!is_valid_stored_param("a\\b"));
    }

    #[test]
    fn stored_name_shape() {
        let name = stored_name_for("alice", "cat.png");
        assert!(name.starts_with("alice_"));
        assert!(name.ends_with("_cat.png"));
        // user + 14-digit timestamp + original
        let middle = &name["alice_".len()..name.len() - "_cat.png".len()];
        assert_eq!(middle.len(), 14);
        assert!(middle.chars().all(|c| c.is_ascii_digit()));
    }
}
