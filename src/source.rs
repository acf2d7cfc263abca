//! Task sources
//!
//! The engine asks a [`TaskSource`] for candidates on startup and on every
//! rescan; identifiers it already knows are ignored by the queue.
//!
//! [`DirectoryTaskSource`] reads one markdown file per task from a directory.
//! Each file may start with YAML front matter:
//!
//! ```text
//! ---
//! id: fix-login
//! priority: 1
//! type: bug
//! depends_on: [setup-db]
//! files: [src/auth.rs]
//! ---
//! The login form rejects valid passwords, see `src/auth/password.rs`.
//! ```
//!
//! The id defaults to the file stem. File hints are the union of `files` and
//! path-like tokens in backticks found in the body.

use crate::models::{Task, DEFAULT_PRIORITY};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid task file {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
}

/// Supplies the backlog
pub trait TaskSource: Send + Sync {
    fn list_ready_candidates(&self) -> Result<Vec<Task>, SourceError>;
}

/// Priority as written in front matter: a tier number, `P1`, or a word
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PriorityValue {
    Number(u32),
    Text(String),
}

impl PriorityValue {
    fn tier(&self) -> Option<u32> {
        match self {
            PriorityValue::Number(n) => Some(*n),
            PriorityValue::Text(s) => {
                let s = s.trim().to_lowercase();
                if let Some(n) = s.strip_prefix('p').and_then(|n| n.parse().ok()) {
                    return Some(n);
                }
                match s.as_str() {
                    "critical" | "urgent" => Some(0),
                    "high" => Some(1),
                    "medium" | "normal" => Some(2),
                    "low" => Some(3),
                    other => other.parse().ok(),
                }
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FrontMatter {
    id: Option<String>,
    title: Option<String>,
    priority: Option<PriorityValue>,
    #[serde(rename = "type", alias = "task_type")]
    task_type: Option<String>,
    #[serde(alias = "dependencies")]
    depends_on: Vec<String>,
    files: Vec<String>,
    status: Option<String>,
}

/// Split `---` delimited front matter from the body
pub fn split_front_matter(content: &str) -> (Option<&str>, &str) {
    let trimmed = content.trim_start_matches('\u{feff}');
    let Some(rest) = trimmed
        .strip_prefix("---\n")
        .or_else(|| trimmed.strip_prefix("---\r\n"))
    else {
        return (None, trimmed);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(front), body);
        }
        offset += line.len();
    }
    (None, trimmed)
}

fn path_token_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"`([A-Za-z0-9_./-]*[A-Za-z0-9_-]/[A-Za-z0-9_./-]+|[A-Za-z0-9_/-][A-Za-z0-9_./-]*\.[A-Za-z0-9]+)`")
            .map_err(|e| log::error!("[TaskSource] Invalid path pattern: {}", e))
            .ok()
    })
    .as_ref()
}

/// Backticked tokens in free text that look like file paths
pub fn extract_file_hints(text: &str) -> BTreeSet<String> {
    let Some(re) = path_token_regex() else {
        return BTreeSet::new();
    };
    re.captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|token| token.chars().any(|c| c.is_ascii_alphabetic()))
        .map(|token| token.to_string())
        .collect()
}

/// Build a task from a markdown file's content. `None` when the file marks
/// itself as already done.
pub fn parse_task_file(path: &Path, content: &str) -> Result<Option<Task>, SourceError> {
    let (front, body) = split_front_matter(content);
    let meta: FrontMatter = match front {
        Some(yaml) if !yaml.trim().is_empty() => {
            serde_yaml::from_str(yaml).map_err(|e| SourceError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        }
        _ => FrontMatter::default(),
    };

    if meta
        .status
        .as_deref()
        .is_some_and(|s| matches!(s.trim().to_lowercase().as_str(), "done" | "closed"))
    {
        return Ok(None);
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let id = meta
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or(stem);
    if id.is_empty() {
        return Err(SourceError::Parse {
            path: path.to_path_buf(),
            message: "task has no id".to_string(),
        });
    }

    let title = meta.title.unwrap_or_else(|| {
        body.lines()
            .map(|l| l.trim().trim_start_matches('#').trim())
            .find(|l| !l.is_empty())
            .unwrap_or(id.as_str())
            .to_string()
    });

    let mut files: BTreeSet<String> = meta.files.into_iter().collect();
    files.extend(extract_file_hints(body));

    Ok(Some(Task {
        title,
        priority: meta
            .priority
            .and_then(|p| p.tier())
            .unwrap_or(DEFAULT_PRIORITY),
        task_type: meta.task_type.unwrap_or_else(|| "task".to_string()),
        dependencies: meta.depends_on.into_iter().collect(),
        files,
        description: body.trim().to_string(),
        id,
    }))
}

/// One `*.md` file per task in a directory
pub struct DirectoryTaskSource {
    dir: PathBuf,
}

impl DirectoryTaskSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn task_files(&self) -> Result<Vec<PathBuf>, SourceError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SourceError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        files.sort();
        Ok(files)
    }
}

impl TaskSource for DirectoryTaskSource {
    fn list_ready_candidates(&self) -> Result<Vec<Task>, SourceError> {
        let mut tasks = Vec::new();
        for path in self.task_files()? {
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    log::warn!("[TaskSource] Skipping unreadable {:?}: {}", path, e);
                    continue;
                }
            };
            // A malformed file shouldn't keep the rest of the backlog from running
            match parse_task_file(&path, &content) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => log::warn!("[TaskSource] {}", e),
            }
        }
        Ok(tasks)
    }
}

/// Fixed list of tasks, for embedding and tests
pub struct StaticTaskSource {
    tasks: Vec<Task>,
}

impl StaticTaskSource {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }
}

impl TaskSource for StaticTaskSource {
    fn list_ready_candidates(&self) -> Result<Vec<Task>, SourceError> {
        Ok(self.tasks.clone())
    }
}
