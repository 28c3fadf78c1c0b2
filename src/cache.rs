//! In-memory mirror of remote task state.
//!
//! The cache owns every cached [`Task`]. Readers get copies; writers go
//! through [`TaskCache::update`] or the bulk operations, each of which runs
//! under the cache lock.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use regex::Regex;

use crate::error::{Error, Result};
use crate::task::{DownloadStatus, Flag, Task, TaskKind};

/// A parsed filter over cached tasks.
///
/// Written as `key=value` pairs joined by `&`:
/// `name=<regex>&group=<download status>&status=<flag>&type=<bt|nbt>`.
/// Repeated values of one key are unioned; different keys are intersected.
/// `name` is matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct Query {
    name: Option<Regex>,
    groups: Vec<DownloadStatus>,
    statuses: Vec<Flag>,
    kinds: Vec<TaskKind>,
}

impl Query {
    /// A query matching every task.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&task.kind()))
            && (self.statuses.is_empty() || self.statuses.contains(&task.flag()))
            && (self.groups.is_empty()
                || task
                    .download_status()
                    .is_some_and(|s| self.groups.contains(&s)))
            && self.name.as_ref().is_none_or(|re| re.is_match(&task.name))
    }
}

impl FromStr for Query {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut query = Self::default();
        let mut name = None;
        for (key, value) in url::form_urlencoded::parse(s.as_bytes()) {
            let invalid = || Error::InvalidQuery(format!("{key}={value}"));
            match key.as_ref() {
                "name" => {
                    if name.is_none() {
                        name = Some(value.to_string());
                    }
                }
                "group" => query
                    .groups
                    .push(DownloadStatus::from_name(&value).ok_or_else(invalid)?),
                "status" => query
                    .statuses
                    .push(Flag::from_name(&value).ok_or_else(invalid)?),
                "type" => query
                    .kinds
                    .push(TaskKind::from_name(&value).ok_or_else(invalid)?),
                _ => {}
            }
        }
        if let Some(pattern) = name.filter(|n| !n.is_empty()) {
            query.name = Some(
                Regex::new(&format!("(?i){pattern}"))
                    .map_err(|_| Error::InvalidQuery(format!("name={pattern}")))?,
            );
        }
        Ok(query)
    }
}

/// Concurrency-safe task map keyed by task id.
#[derive(Debug, Default)]
pub struct TaskCache {
    tasks: Mutex<HashMap<String, Task>>,
}

impl TaskCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Task>> {
        self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Inserts or replaces one task.
    pub fn push_task(&self, task: Task) {
        self.lock().insert(task.id.clone(), task);
    }

    /// Inserts or replaces many tasks.
    pub fn push_tasks(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut map = self.lock();
        for task in tasks {
            map.insert(task.id.clone(), task);
        }
    }

    /// Drops every task whose derived flag is `flag`.
    pub fn invalidate_group(&self, flag: Flag) {
        self.lock().retain(|_, t| t.flag() != flag);
    }

    pub fn invalidate_all(&self) {
        self.lock().clear();
    }

    /// Swaps the whole map for `tasks`.
    pub fn replace_all(&self, tasks: impl IntoIterator<Item = Task>) {
        let map = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        *self.lock() = map;
    }

    pub(crate) fn retain(&self, keep: impl FnMut(&String, &mut Task) -> bool) {
        self.lock().retain(keep);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().get(id).cloned()
    }

    /// Copies of the cached tasks among `ids`; unknown ids are skipped.
    #[must_use]
    pub fn get_many<S: AsRef<str>>(&self, ids: &[S]) -> HashMap<String, Task> {
        let map = self.lock();
        ids.iter()
            .filter_map(|id| map.get(id.as_ref()).map(|t| (t.id.clone(), t.clone())))
            .collect()
    }

    /// Copies of the tasks matching `query`.
    #[must_use]
    pub fn find(&self, query: &Query) -> HashMap<String, Task> {
        self.lock()
            .iter()
            .filter(|(_, t)| query.matches(t))
            .map(|(id, t)| (id.clone(), t.clone()))
            .collect()
    }

    /// Parses `expr` and returns the matching tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidQuery`] for an unknown filter value or a bad
    /// name pattern.
    pub fn find_str(&self, expr: &str) -> Result<HashMap<String, Task>> {
        Ok(self.find(&expr.parse()?))
    }

    /// Mutates the cached task `id` in place under the lock and returns the
    /// updated copy.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut Task)) -> Option<Task> {
        let mut map = self.lock();
        let task = map.get_mut(id)?;
        f(task);
        Some(task.clone())
    }

    /// Copies of every cached task.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Task> {
        self.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
