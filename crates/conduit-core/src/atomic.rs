//! Atomic JSON persistence: every persisted entity in the workspace (sessions,
//! scheduled tasks, executions, the agent registry) goes through this helper
//! so that a crash mid-write never corrupts the primary file.
//!
//! Sequence: serialize to `<path>.tmp`, re-parse it to verify the bytes are
//! valid JSON, back up the existing primary to `<path>.bak`, then rename
//! tmp -> primary. Any failure along the way removes the tmp file and leaves
//! the previous primary content untouched.

use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

use crate::error::{CoreError, Result};

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = tmp_path_for(path);

    let write_result = (|| -> Result<()> {
        std::fs::write(&tmp_path, &bytes)?;
        // Verify round-trip before committing: a half-written or malformed
        // tmp file must never get promoted to primary.
        let reparsed = std::fs::read(&tmp_path)?;
        serde_json::from_slice::<serde_json::Value>(&reparsed)
            .map_err(|e| CoreError::Internal(format!("atomic write verification failed: {e}")))?;

        if path.exists() {
            let bak_path = bak_path_for(path);
            std::fs::rename(path, &bak_path)?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if write_result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    write_result
}

pub fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Ok(T::default());
    }
    let value = serde_json::from_slice(&bytes)?;
    Ok(value)
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    std::path::PathBuf::from(os)
}

fn bak_path_for(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".bak");
    std::path::PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
    struct Doc {
        n: u32,
        s: String,
    }

    #[test]
    fn round_trips_and_backs_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sub/doc.json");

        let v1 = Doc {
            n: 1,
            s: "one".into(),
        };
        write_json(&path, &v1).expect("write 1");
        let read_back: Doc = read_json(&path).expect("read 1");
        assert_eq!(read_back, v1);
        assert!(!bak_path_for(&path).exists());

        let v2 = Doc {
            n: 2,
            s: "two".into(),
        };
        write_json(&path, &v2).expect("write 2");
        let read_back: Doc = read_json(&path).expect("read 2");
        assert_eq!(read_back, v2);
        assert!(bak_path_for(&path).exists());
        let backed_up: Doc = read_json(&bak_path_for(&path)).expect("read bak");
        assert_eq!(backed_up, v1);

        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.json");
        let v: Doc = read_json(&path).expect("read missing");
        assert_eq!(v, Doc::default());
    }
}
