// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

//! File helpers shared by the JSON-backed stores.

use crate::error::StoreError;
use std::io::Write;
use std::path::{Path, PathBuf};

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Contents of `path`, or `None` when it does not exist yet.
pub(crate) async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(io_error(path)(source)),
    }
}

/// Writes through a synced temporary file in the same directory, then
/// renames it over `path`, so readers never see a partial file.
pub(crate) fn replace_file(path: &Path, body: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(io_error(path))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_error(path))?;
    tmp.write_all(body).map_err(io_error(path))?;
    tmp.as_file().sync_all().map_err(io_error(path))?;
    tmp.persist(path).map_err(|e| StoreError::Persist {
        path: path.display().to_string(),
        reason: e.error.to_string(),
    })?;
    Ok(())
}

/// [`replace_file`] on the blocking pool.
pub(crate) async fn replace_file_async(path: PathBuf, body: Vec<u8>) -> Result<(), StoreError> {
    let shown = path.display().to_string();
    tokio::task::spawn_blocking(move || replace_file(&path, &body))
        .await
        .map_err(|e| StoreError::Persist {
            path: shown,
            reason: e.to_string(),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replace_leaves_no_temporaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        assert_eq!(read_optional(&path).await.unwrap(), None);

        replace_file_async(path.clone(), b"one".to_vec()).await.unwrap();
        replace_file_async(path.clone(), b"two".to_vec()).await.unwrap();
        assert_eq!(read_optional(&path).await.unwrap().as_deref(), Some("two"));
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }
}
