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

//! Audit trail of process calls: an in-memory journal, optionally mirrored
//! to a JSON-lines file so it survives restarts.

use crate::error::AuditError;
use crate::storage;
use crate::model::{LogEntry, LogStatus, NewLogEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: NewLogEntry) -> Result<Uuid, AuditError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPage<T> {
    pub logs: Vec<T>,
    pub total: usize,
    pub pages: usize,
    pub grouped: bool,
}

/// One row of the grouped view: everything a task produced, summarised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub count: usize,
    pub latest_timestamp: DateTime<Utc>,
    pub function_names: String,
    pub function_labels: String,
    pub function_types: String,
    pub success: bool,
}

#[derive(Debug)]
pub struct AuditJournal {
    entries: RwLock<VecDeque<LogEntry>>,
    mirror: Option<PathBuf>,
    retention: Option<usize>,
    /// Serialises mirror writes and counts the lines the mirror holds.
    writer: Mutex<usize>,
}

impl AuditJournal {
    pub fn in_memory(retention: Option<usize>) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            mirror: None,
            retention,
            writer: Mutex::new(0),
        }
    }

    /// Loads an existing mirror. Lines that do not parse are skipped.
    pub async fn open(path: impl Into<PathBuf>, retention: Option<usize>) -> Result<Self, AuditError> {
        let path = path.into();
        let mut entries = VecDeque::new();
        let mut lines = 0;
        if let Some(content) = storage::read_optional(&path).await? {
            for (number, line) in content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                lines += 1;
                match serde_json::from_str::<LogEntry>(line) {
                    Ok(entry) => entries.push_back(entry),
                    Err(e) => warn!(path = %path.display(), line = number + 1, error = %e, "Skipping unreadable audit line"),
                }
            }
        }
        info!(path = %path.display(), entries = entries.len(), "Audit journal opened");

        let journal = Self {
            entries: RwLock::new(entries),
            mirror: Some(path),
            retention,
            writer: Mutex::new(lines),
        };
        journal.enforce_retention();
        if journal.len() < lines {
            let mut writer = journal.writer.lock().await;
            *writer = journal.compact().await?;
        }
        Ok(journal)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries_for_task(&self, task_id: &str) -> Vec<LogEntry> {
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|e| e.entry.task_id == task_id)
            .cloned()
            .collect()
    }

    /// 1-based page of entries, newest first.
    pub fn page(&self, page: usize, per_page: usize) -> LogPage<LogEntry> {
        let per_page = per_page.max(1);
        let entries = self.entries.read();
        let logs = entries
            .iter()
            .rev()
            .skip(page.saturating_sub(1).saturating_mul(per_page))
            .take(per_page)
            .cloned()
            .collect();
        LogPage {
            logs,
            total: entries.len(),
            pages: entries.len().div_ceil(per_page),
            grouped: false,
        }
    }

    /// 1-based page of per-task summaries, most recently active task first.
    pub fn grouped_page(&self, page: usize, per_page: usize) -> LogPage<TaskSummary> {
        let per_page = per_page.max(1);
        let entries = self.entries.read();
        let mut groups: IndexMap<&str, Vec<&LogEntry>> = IndexMap::new();
        for entry in entries.iter().rev() {
            groups.entry(entry.entry.task_id.as_str()).or_default().push(entry);
        }

        let mut summaries: Vec<TaskSummary> = groups.into_iter().map(|(task_id, group)| summarise(task_id, &group)).collect();
        summaries.sort_by(|a, b| b.latest_timestamp.cmp(&a.latest_timestamp));
        let total = summaries.len();
        let logs = summaries
            .into_iter()
            .skip(page.saturating_sub(1).saturating_mul(per_page))
            .take(per_page)
            .collect();
        LogPage {
            logs,
            total,
            pages: total.div_ceil(per_page),
            grouped: true,
        }
    }

    pub async fn clear(&self) -> Result<(), AuditError> {
        let mut writer = self.writer.lock().await;
        if let Some(path) = &self.mirror {
            tokio::fs::write(path, b"").await.map_err(|source| io_error(path, source))?;
        }
        *writer = 0;
        self.entries.write().clear();
        info!("Audit journal cleared");
        Ok(())
    }

    /// Rewrites the mirror to hold exactly the retained entries. Callers
    /// hold the writer lock; returns the new line count.
    async fn compact(&self) -> Result<usize, AuditError> {
        let Some(path) = &self.mirror else {
            return Ok(0);
        };
        let (body, count) = {
            let entries = self.entries.read();
            let mut body = Vec::new();
            for entry in entries.iter() {
                body.extend(serde_json::to_vec(entry)?);
                body.push(b'\n');
            }
            (body, entries.len())
        };
        storage::replace_file_async(path.clone(), body).await?;
        debug!(path = %path.display(), entries = count, "Audit mirror compacted");
        Ok(count)
    }

    fn enforce_retention(&self) {
        if let Some(cap) = self.retention {
            let mut entries = self.entries.write();
            while entries.len() > cap {
                entries.pop_front();
            }
        }
    }
}

#[async_trait]
impl AuditLog for AuditJournal {
    async fn append(&self, entry: NewLogEntry) -> Result<Uuid, AuditError> {
        let entry = LogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            entry,
        };

        let mut writer = self.writer.lock().await;
        if let Some(path) = &self.mirror {
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|source| io_error(path, source))?;
            file.write_all(&line).await.map_err(|source| io_error(path, source))?;
            file.flush().await.map_err(|source| io_error(path, source))?;
            *writer += 1;
        }

        let id = entry.id;
        self.entries.write().push_back(entry);
        self.enforce_retention();
        // Let the mirror run to twice the retained size before rewriting it.
        if let Some(cap) = self.retention {
            if *writer > cap.saturating_mul(2) {
                *writer = self.compact().await?;
            }
        }
        Ok(id)
    }
}

fn summarise(task_id: &str, group: &[&LogEntry]) -> TaskSummary {
    let joined = |field: fn(&NewLogEntry) -> &str| {
        group
            .iter()
            .map(|e| field(&e.entry))
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
            .join(", ")
    };
    TaskSummary {
        task_id: task_id.to_string(),
        count: group.len(),
        latest_timestamp: group.iter().map(|e| e.timestamp).max().unwrap_or_else(Utc::now),
        function_names: joined(|e| e.function_name.as_str()),
        function_labels: joined(|e| e.function_label.as_str()),
        function_types: joined(|e| e.function_kind.as_str()),
        success: group.iter().all(|e| e.entry.status != LogStatus::Error),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> AuditError {
    AuditError::Io {
        path: path.display().to_string(),
        source,
    }
}
