//! Paginated listings: tasks, expired and deleted history, BT sub-files.

use log::{debug, warn};

use crate::config::endpoints::escape;
use crate::decode::{self, BtList, TaskListPage};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::task::{DownloadStatus, Flag, Task};
use crate::transport::{Request, timestamp_ms};

const DELETED_MARKER: &str = "page_check_all=history&fltask_all_guoqi=1&class_check=0&page_check=task&fl_page_id=0&class_check_new=0&set_tab_status=11";
const EXPIRED_MARKER: &str = "page_check_all=history&class_check=0&page_check=task&fl_page_id=0&class_check_new=0&set_tab_status=13";

/// Which slice of the task list a listing call asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Everything not yet completed.
    Downloading,
    Completed,
    /// Downloading and completed together.
    Mixed,
}

impl Category {
    #[must_use]
    pub const fn type_id(self) -> u8 {
        match self {
            Self::Downloading => 1,
            Self::Completed => 2,
            Self::Mixed => 4,
        }
    }

    /// Whether a cached normal task belongs to this category.
    fn covers(self, task: &Task) -> bool {
        let completed = task.download_status() == Some(DownloadStatus::Completed);
        match self {
            Self::Downloading => !completed,
            Self::Completed => completed,
            Self::Mixed => true,
        }
    }
}

impl Session {
    async fn task_list_body(&self, category: Category, page: u32) -> Result<String> {
        let size = self.config.page_size;
        let url = self
            .config
            .endpoints
            .showtask_unfresh(category.type_id(), page, size);
        self.fetch(&Request::get(url).with_cookie("pagenum", size.to_string()))
            .await
    }

    /// One decoded listing page; also refreshes the cached account summary.
    ///
    /// # Errors
    ///
    /// Transport errors, or [`Error::InvalidResponse`] when the page is not
    /// a `rebuild(...)` payload.
    pub async fn task_list_page(&self, category: Category, page: u32) -> Result<TaskListPage> {
        let page = decode::task_list(&self.task_list_body(category, page).await?)?;
        self.remember_account(&page);
        Ok(page)
    }

    /// The undecoded JSON payload of one listing page.
    ///
    /// # Errors
    ///
    /// See [`Session::task_list_page`].
    pub async fn raw_task_list(&self, category: Category, page: u32) -> Result<String> {
        let body = self.task_list_body(category, page).await?;
        Ok(decode::task_list_payload(&body)?.to_string())
    }

    /// Reads pages until the remote-declared total is reached, then folds
    /// the result into the cache.
    async fn list_category(&self, category: Category) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = Vec::new();
        let mut page = 1;
        loop {
            let listing = self.task_list_page(category, page).await?;
            let total = listing.declared_total();
            let received = listing.info.tasks.len();
            if page == 1 {
                tasks.reserve(if total > 0 { total } else { received });
            }
            tasks.extend(listing.info.tasks);
            if tasks.len() >= total {
                break;
            }
            if received == 0 {
                warn!(
                    "{category:?} listing stopped at page {page}: {} of {total} tasks",
                    tasks.len()
                );
                break;
            }
            page += 1;
        }
        debug!("{category:?} listing: {} tasks in {page} pages", tasks.len());

        match category {
            Category::Mixed => self.cache().invalidate_group(Flag::Normal),
            _ => self
                .cache()
                .retain(|_, t| !(t.flag() == Flag::Normal && category.covers(t))),
        }
        self.cache().push_tasks(tasks.iter().cloned());
        Ok(tasks)
    }

    /// All normal tasks; replaces the cached normal group.
    ///
    /// # Errors
    ///
    /// See [`Session::task_list_page`].
    pub async fn get_tasks(&self) -> Result<Vec<Task>> {
        self.list_category(Category::Mixed).await
    }

    /// Completed tasks, merged into the cache.
    ///
    /// # Errors
    ///
    /// See [`Session::task_list_page`].
    pub async fn get_completed_tasks(&self) -> Result<Vec<Task>> {
        self.list_category(Category::Completed).await
    }

    /// Tasks not yet completed, merged into the cache.
    ///
    /// # Errors
    ///
    /// See [`Session::task_list_page`].
    pub async fn get_incompleted_tasks(&self) -> Result<Vec<Task>> {
        self.list_category(Category::Downloading).await
    }

    /// The expired-tasks history page as HTML.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub async fn raw_expired(&self) -> Result<String> {
        let url = self.config.endpoints.expire_home(&self.uid());
        self.fetch(
            &Request::get(url)
                .with_cookie("lx_nf_all", escape(EXPIRED_MARKER))
                .with_cookie("pagenum", self.config.page_size.to_string()),
        )
        .await
    }

    /// One page of the deleted-tasks history as HTML.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub async fn raw_deleted(&self, page: u32) -> Result<String> {
        let url = self.config.endpoints.history_page(&self.uid(), page);
        self.fetch(
            &Request::get(url)
                .with_cookie("lx_nf_all", escape(DELETED_MARKER))
                .with_cookie("pagenum", self.config.page_size.to_string()),
        )
        .await
    }

    /// Expired tasks; replaces the cached expired group.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub async fn get_expired_tasks(&self) -> Result<Vec<Task>> {
        let body = self.raw_expired().await?;
        let (tasks, _) = decode::history(&body, "4");
        self.cache().invalidate_group(Flag::Expired);
        self.cache().push_tasks(tasks.iter().cloned());
        Ok(tasks)
    }

    /// Deleted tasks across every history page; replaces the cached
    /// deleted and purged groups.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub async fn get_deleted_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        let mut page = 1;
        loop {
            let body = self.raw_deleted(page).await?;
            let (found, next) = decode::history(&body, "1");
            let empty = found.is_empty();
            tasks.extend(found);
            if !next || empty {
                break;
            }
            page += 1;
        }
        self.cache().invalidate_group(Flag::Deleted);
        self.cache().invalidate_group(Flag::Purged);
        self.cache().push_tasks(tasks.iter().cloned());
        Ok(tasks)
    }

    async fn bt_list_body(&self, task_id: &str, info_hash: &str, page: u32, page_size: u32) -> Result<String> {
        let url = self
            .config
            .endpoints
            .fill_bt_list(task_id, info_hash, page, &self.uid(), timestamp_ms());
        self.fetch(&Request::get(url).with_cookie("pagenum", page_size.to_string()))
            .await
    }

    /// Fetches page 1, falling back to the small page size once when the
    /// large page comes back truncated. Returns the body and the page size
    /// that worked.
    async fn first_bt_page(&self, task_id: &str, info_hash: &str, page: u32) -> Result<(String, u32)> {
        let large = self.config.bt_page_size;
        let small = self.config.bt_fallback_page_size;
        match self.bt_list_body(task_id, info_hash, page, large).await {
            Err(Error::TruncatedBody) if large != small => {
                debug!("bt list {task_id} truncated at page size {large}, retrying with {small}");
                let body = self.bt_list_body(task_id, info_hash, page, small).await?;
                Ok((body, small))
            }
            other => Ok((other?, large)),
        }
    }

    /// Sub-files of the cached BT task `task_id`.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`], [`Error::NotBtTask`], or any error of
    /// [`Session::fill_bt_list_by_hash`].
    pub async fn fill_bt_list(&self, task_id: &str) -> Result<BtList> {
        let task = self.require(task_id)?;
        if !task.is_bt() {
            return Err(Error::NotBtTask);
        }
        self.fill_bt_list_by_hash(&task.id, &task.cid).await
    }

    /// Sub-files of a BT task given its id and info hash, bypassing the
    /// cache. Pages after the first that fail are logged and skipped.
    ///
    /// # Errors
    ///
    /// Errors fetching or decoding the first page.
    pub async fn fill_bt_list_by_hash(&self, task_id: &str, info_hash: &str) -> Result<BtList> {
        let (body, page_size) = self.first_bt_page(task_id, info_hash, 1).await?;
        let mut list = decode::bt_list(&body)?;
        let total = u32::try_from(list.declared_total()).unwrap_or(u32::MAX);
        let pages = total / page_size.max(1) + 1;
        for page in 2..=pages {
            let result = self
                .bt_list_body(task_id, info_hash, page, page_size)
                .await
                .and_then(|body| decode::bt_list(&body));
            match result {
                Ok(more) => list.records.extend(more.records),
                Err(e) => warn!("skipping page {page} of bt list {task_id}: {e}"),
            }
        }
        Ok(list)
    }

    /// One undecoded `fill_bt_list` page of the cached task `task_id`.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] or transport errors.
    pub async fn raw_bt_list(&self, task_id: &str, page: u32) -> Result<String> {
        let task = self.require(task_id)?;
        let (body, _) = self.first_bt_page(&task.id, &task.cid, page).await?;
        Ok(body)
    }
}
