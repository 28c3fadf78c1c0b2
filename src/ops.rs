//! Operations on single cached tasks.
//!
//! Every operation looks its task up in the cache, checks local
//! preconditions before touching the network, and writes the outcome back
//! through [`TaskCache::update`](crate::cache::TaskCache::update). Callers
//! get the updated copy.

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use tokio::io::AsyncWriteExt;

use crate::decode;
use crate::error::{Error, Result};
use crate::hash;
use crate::session::Session;
use crate::task::{DownloadStatus, Flag, Task};
use crate::transport::{Request, timestamp_ms};
use crate::url::ed2k_hash_from_link;

const PAUSE_OK: &str = "pause_task_resp()";

impl Session {
    /// Applies `f` to the cached task, or to `task` itself when a concurrent
    /// listing has dropped it from the cache.
    fn write_back(&self, mut task: Task, f: impl Fn(&mut Task)) -> Task {
        self.cache().update(&task.id, &f).unwrap_or_else(|| {
            f(&mut task);
            task
        })
    }

    /// One delete request. `permanent` deletes from the recycle bin.
    async fn remove(&self, task: Task, permanent: bool) -> Result<Task> {
        let flag = task.flag();
        match flag {
            Flag::Invalid => return Err(Error::InvalidFlag),
            Flag::Purged => return Err(Error::AlreadyPurged),
            Flag::Deleted if !permanent => return Err(Error::AlreadyDeleted),
            _ => {}
        }
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("taskids", &format!("{},", task.id))
            .append_pair("databases", "0,")
            .append_pair("interfrom", "task")
            .finish();
        let uri = self.config.endpoints.task_delete(flag.code(), timestamp_ms());
        let body = self.post_text(&uri, form).await?;
        if !decode::is_delete_ok(&body) {
            debug!("delete {} answered: {body}", task.id);
            return Err(Error::Unexpected(format!("delete of task {} rejected", task.id)));
        }
        let next = if flag == Flag::Deleted { "2" } else { "1" };
        Ok(self.write_back(task, |t| {
            t.flag = next.to_string();
            t.progress = 0.0;
        }))
    }

    /// Moves a normal or expired task to the recycle bin.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`], [`Error::AlreadyDeleted`],
    /// [`Error::AlreadyPurged`], [`Error::InvalidFlag`], or a remote failure.
    pub async fn delete_task(&self, id: &str) -> Result<Task> {
        let task = self.require(id)?;
        self.remove(task, false).await
    }

    /// Deletes a task for good. A task already in the recycle bin takes one
    /// request; any other takes two, and stays deleted if the second fails.
    ///
    /// # Errors
    ///
    /// See [`Session::delete_task`].
    pub async fn purge_task(&self, id: &str) -> Result<Task> {
        let task = self.require(id)?;
        if task.flag() == Flag::Deleted {
            return self.remove(task, true).await;
        }
        let deleted = self.remove(task, false).await?;
        self.remove(deleted, true).await
    }

    /// Pauses one cached task.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] or see [`Session::pause_tasks`].
    pub async fn pause_task(&self, id: &str) -> Result<Task> {
        let task = self.require(id)?;
        self.pause_tasks(&[id]).await?;
        Ok(task)
    }

    /// Pauses several tasks in one request; the ids need not be cached.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidResponse`] unless the remote acknowledges.
    pub async fn pause_tasks<S: AsRef<str>>(&self, ids: &[S]) -> Result<()> {
        let mut tids = ids.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",");
        tids.push(',');
        let uri = self
            .config
            .endpoints
            .task_pause(&tids, &self.uid(), timestamp_ms());
        let body = self.get_text(&uri).await?;
        if body.trim() != PAUSE_OK {
            return Err(Error::InvalidResponse("task_pause"));
        }
        Ok(())
    }

    /// Restarts a failed or pending task.
    ///
    /// # Errors
    ///
    /// [`Error::NotRestartable`] for expired tasks and any other download
    /// status, checked before any request.
    pub async fn resume_task(&self, id: &str) -> Result<Task> {
        let task = self.require(id)?;
        let restartable = matches!(
            task.download_status(),
            Some(DownloadStatus::Failed | DownloadStatus::Pending)
        );
        if task.flag() == Flag::Expired || !restartable {
            return Err(Error::NotRestartable);
        }
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("id[]", &task.id)
            .append_pair("url[]", &task.url)
            .append_pair("cid[]", &task.cid)
            .append_pair("download_status[]", &task.download_status)
            .append_pair("taskname[]", &task.name)
            .append_pair("type", "1")
            .append_pair("interfrom", "task")
            .finish();
        let body = self
            .post_text(&self.config.endpoints.redownload(timestamp_ms()), form)
            .await?;
        debug!("resume task: {body}");
        if !decode::is_jsonp(&body) {
            return Err(Error::InvalidResponse("redownload"));
        }
        Ok(task)
    }

    /// Extends the retention of a task and records the new live time.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] or [`Error::InvalidResponse`].
    pub async fn delay_task(&self, id: &str) -> Result<Task> {
        let task = self.require(id)?;
        let uri = self.config.endpoints.task_delay(&task.id, timestamp_ms());
        let left = decode::delay_left_live_time(&self.get_text(&uri).await?)?;
        info!("{}: {left}", task.id);
        Ok(self.write_back(task, |t| t.left_live_time.clone_from(&left)))
    }

    /// Extends every task at once and returns the raw answer.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub async fn delay_all(&self) -> Result<String> {
        let body = self.get_text(&self.config.endpoints.delay_once()).await?;
        info!("{body}");
        Ok(body)
    }

    /// Renames a task remotely and in the cache.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] or [`Error::RenameFailed`].
    pub async fn rename_task(&self, id: &str, name: &str) -> Result<Task> {
        let task = self.require(id)?;
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("taskid", &task.id)
            .append_pair("bt", if task.is_bt() { "1" } else { "0" })
            .append_pair("filename", name)
            .finish();
        let reply = decode::rename(&self.get_text(&self.config.endpoints.rename(&query)).await?)?;
        info!("{} => {}", reply.task_id, reply.file_name);
        Ok(self.write_back(task, |t| t.name = name.to_string()))
    }

    async fn re_add(&self, task: &Task) -> Result<()> {
        let origin = match task.flag() {
            Flag::Normal => return Err(Error::AlreadyQueued),
            Flag::Purged => None,
            _ => Some(task.id.as_str()),
        };
        if task.is_bt() {
            let link = self.config.endpoints.get_torrent(&self.uid(), &task.cid);
            self.add_magnet(&link, origin).await.map(drop)
        } else {
            self.add_simple(&task.url, origin).await
        }
    }

    /// Submits a finished-with task again. Purged tasks come back as new
    /// tasks; others replace their history entry.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`], [`Error::AlreadyQueued`] for normal tasks,
    /// or any submission error.
    pub async fn re_add_task(&self, id: &str) -> Result<()> {
        let task = self.require(id)?;
        self.re_add(&task).await
    }

    /// Re-adds the expired and deleted tasks among `ids`: a single non-BT
    /// task alone, several non-BT tasks as one batch, each BT task through
    /// the magnet flow. Returns the failures keyed by task id; a failed
    /// batch is keyed by its comma-joined ids.
    pub async fn re_add_tasks<S: AsRef<str>>(&self, ids: &[S]) -> Vec<(String, Error)> {
        let mut candidates: Vec<Task> = self
            .tasks_by_ids(ids)
            .into_values()
            .filter(|t| matches!(t.flag(), Flag::Expired | Flag::Deleted))
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let (bt, plain): (Vec<Task>, Vec<Task>) = candidates.into_iter().partition(Task::is_bt);

        let mut failures = Vec::new();
        match plain.as_slice() {
            [] => {}
            [task] => {
                if let Err(e) = self.re_add(task).await {
                    failures.push((task.id.clone(), e));
                }
            }
            many => {
                let urls: Vec<&str> = many.iter().map(|t| t.url.as_str()).collect();
                let origins: Vec<&str> = many.iter().map(|t| t.id.as_str()).collect();
                if let Err(e) = self.add_batch_tasks(&urls, &origins).await {
                    failures.push((origins.join(","), e));
                }
            }
        }
        for task in &bt {
            let link = self.config.endpoints.get_torrent(&self.uid(), &task.cid);
            if let Err(e) = self.add_magnet(&link, Some(&task.id)).await {
                failures.push((task.id.clone(), e));
            }
        }
        for (id, e) in &failures {
            error!("re-add {id}: {e}");
        }
        failures
    }

    /// Downloads the metainfo of a BT task by info hash.
    ///
    /// # Errors
    ///
    /// [`Error::RemoteAlert`] when the remote answers with an alert page.
    pub async fn torrent_by_hash(&self, info_hash: &str) -> Result<Vec<u8>> {
        let uri = self
            .config
            .endpoints
            .get_torrent(&self.uid(), &info_hash.to_uppercase());
        let body = self.transport.execute(&Request::get(uri)).await?;
        if let Some(message) = decode::alert_message(&String::from_utf8_lossy(&body)) {
            info!("{message}");
            return Err(Error::RemoteAlert(message));
        }
        Ok(body.to_vec())
    }

    /// Writes the metainfo of `info_hash` to a new file at `path`.
    ///
    /// # Errors
    ///
    /// An [`io::ErrorKind::AlreadyExists`] error if `path` exists, checked
    /// before the download.
    pub async fn save_torrent(&self, info_hash: &str, path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            return Err(already_exists(path).into());
        }
        let bytes = self.torrent_by_hash(info_hash).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// Checks downloaded content against the task: piece hashes for BT
    /// tasks, the link's content hash for ed2k tasks. Other tasks always
    /// verify.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`], torrent fetch errors, or I/O errors reading
    /// the content.
    pub async fn verify_task(&self, id: &str, path: &Path) -> Result<bool> {
        let task = self.require(id)?;
        let path: PathBuf = path.to_path_buf();
        if task.is_bt() {
            info!("verifying [BT] {}", path.display());
            let metainfo = self.torrent_by_hash(&task.cid).await?;
            return tokio::task::spawn_blocking(move || hash::verify_bt_content(&metainfo, &path))
                .await
                .map_err(|e| Error::Unexpected(format!("verification task failed: {e}")))?;
        }
        if task.url.starts_with("ed2k://") {
            info!("verifying [ED2K] {}", path.display());
            let computed = tokio::task::spawn_blocking(move || hash::ed2k_file_hash(&path))
                .await
                .map_err(|e| Error::Unexpected(format!("verification task failed: {e}")))??;
            return Ok(ed2k_hash_from_link(&task.url).is_some_and(|h| h.eq_ignore_ascii_case(&computed)));
        }
        Ok(true)
    }
}

fn already_exists(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{} already exists", path.display()),
    )
}
