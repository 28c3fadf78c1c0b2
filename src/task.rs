//! The `Task` record and its two status axes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::decode::lenient;
use crate::format::trim_font_tag;

/// Lifecycle classification of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Normal,
    Deleted,
    Purged,
    Invalid,
    Expired,
}

impl Flag {
    /// Parses the flag field: empty means normal, one digit below 5 maps
    /// to its class, anything else is invalid.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.as_bytes() {
            [] => Self::Normal,
            [b'0'] => Self::Normal,
            [b'1'] => Self::Deleted,
            [b'2'] => Self::Purged,
            [b'4'] => Self::Expired,
            _ => Self::Invalid,
        }
    }

    /// Wire code, also used as the `type` of a delete request.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Deleted => 1,
            Self::Purged => 2,
            Self::Invalid => 3,
            Self::Expired => 4,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Deleted => "deleted",
            Self::Purged => "purged",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
        }
    }

    /// Looks up a queryable flag class by name; `invalid` is not queryable.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "normal" => Some(Self::Normal),
            "deleted" => Some(Self::Deleted),
            "purged" => Some(Self::Purged),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Download progress classification of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    Waiting,
    Downloading,
    Completed,
    Failed,
    Pending,
}

impl DownloadStatus {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "0" => Some(Self::Waiting),
            "1" => Some(Self::Downloading),
            "2" => Some(Self::Completed),
            "3" => Some(Self::Failed),
            "5" => Some(Self::Pending),
            _ => None,
        }
    }

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Waiting => "0",
            Self::Downloading => "1",
            Self::Completed => "2",
            Self::Failed => "3",
            Self::Pending => "5",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Pending => "pending",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "waiting" => Some(Self::Waiting),
            "downloading" => Some(Self::Downloading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// BT versus everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Bt,
    NonBt,
}

impl TaskKind {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bt" => Some(Self::Bt),
            "nbt" => Some(Self::NonBt),
            _ => None,
        }
    }
}

/// One remote download job as mirrored in the cache.
///
/// Status fields keep their wire encoding; use [`Task::flag`] and
/// [`Task::download_status`] for the typed view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub flag: String,
    #[serde(rename = "taskname", default, deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub cid: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub gcid: String,
    /// Human-readable size as sent by the remote.
    #[serde(rename = "filesize", default, deserialize_with = "lenient::string")]
    pub file_size: String,
    /// Size in bytes.
    #[serde(rename = "ysfilesize", default, deserialize_with = "lenient::string")]
    pub size_bytes: String,
    #[serde(rename = "filetype", default, deserialize_with = "lenient::string")]
    pub file_type: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub download_status: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub speed: String,
    #[serde(default, deserialize_with = "lenient::float")]
    pub progress: f64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub left_live_time: String,
    /// Direct download URL once the remote has the content.
    #[serde(rename = "lixian_url", default, deserialize_with = "lenient::string")]
    pub download_url: String,
    /// Source URI the task was created from.
    #[serde(default, deserialize_with = "lenient::string")]
    pub url: String,
    /// Zero marks a BT task.
    #[serde(rename = "tasktype", default = "non_bt", deserialize_with = "lenient::small")]
    pub task_type: u8,
}

const fn non_bt() -> u8 {
    1
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: String::new(),
            flag: String::new(),
            name: String::new(),
            cid: String::new(),
            gcid: String::new(),
            file_size: String::new(),
            size_bytes: String::new(),
            file_type: String::new(),
            download_status: String::new(),
            speed: String::new(),
            progress: 0.0,
            left_live_time: String::new(),
            download_url: String::new(),
            url: String::new(),
            task_type: non_bt(),
        }
    }
}

const STATUS_LABELS: [&str; 6] = ["waiting", "downloading", "completed", "failed", "pending", "expired"];

impl Task {
    /// Derived lifecycle flag.
    #[must_use]
    pub fn flag(&self) -> Flag {
        Flag::parse(&self.flag)
    }

    /// Parsed download status, `None` for unknown codes.
    #[must_use]
    pub fn download_status(&self) -> Option<DownloadStatus> {
        DownloadStatus::parse(&self.download_status)
    }

    #[must_use]
    pub const fn is_bt(&self) -> bool {
        self.task_type == 0
    }

    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        if self.is_bt() { TaskKind::Bt } else { TaskKind::NonBt }
    }

    /// Whether the poller should refresh this task.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.flag() == Flag::Normal && self.download_status() == Some(DownloadStatus::Downloading)
    }

    /// Index into the combined status labels; expired tasks fold to the
    /// last slot regardless of download status.
    #[must_use]
    pub fn display_index(&self) -> usize {
        if self.flag() == Flag::Expired {
            return 5;
        }
        match self.download_status() {
            Some(DownloadStatus::Waiting) | None => 0,
            Some(DownloadStatus::Downloading) => 1,
            Some(DownloadStatus::Completed) => 2,
            Some(DownloadStatus::Failed) => 3,
            Some(DownloadStatus::Pending) => 4,
        }
    }

    #[must_use]
    pub fn display_status(&self) -> &'static str {
        STATUS_LABELS[self.display_index()]
    }

    /// Applies one record from a progress snapshot. Records for other ids
    /// are ignored.
    pub fn apply_progress(&mut self, record: &ProgressRecord) {
        if self.id != record.id {
            return;
        }
        self.speed.clone_from(&record.speed);
        self.progress = record.progress;
        self.download_status.clone_from(&record.download_status);
        self.download_url.clone_from(&record.download_url);
    }

    /// Multi-line description with ids and URLs.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = format!(
            "{} {} {} {} {}\n",
            self.id,
            self.name,
            self.display_status(),
            self.file_size,
            trim_font_tag(&self.left_live_time)
        );
        if !self.cid.is_empty() {
            out.push_str(&self.cid);
            out.push(' ');
        }
        if !self.gcid.is_empty() {
            out.push_str(&self.gcid);
            out.push('\n');
        }
        out.push_str(&self.url);
        if !self.download_url.is_empty() {
            out.push('\n');
            out.push_str(&self.download_url);
        }
        out
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] {} {:.1}% {}",
            self.id,
            self.name,
            self.display_status(),
            self.file_size,
            self.progress,
            trim_font_tag(&self.left_live_time)
        )
    }
}

/// Per-task entry of a progress snapshot.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProgressRecord {
    #[serde(rename = "tid", deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub speed: String,
    #[serde(rename = "fpercent", default, deserialize_with = "lenient::float")]
    pub progress: f64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub download_status: String,
    #[serde(rename = "lixian_url", default, deserialize_with = "lenient::string")]
    pub download_url: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub left_live_time: String,
}

/// Queue counters returned alongside a progress snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueSummary {
    #[serde(default, deserialize_with = "lenient::string")]
    pub downloading_num: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub waiting_num: String,
}

/// Decoded `task_process` answer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProgressSnapshot {
    #[serde(rename = "Record", default)]
    pub records: Vec<ProgressRecord>,
    #[serde(rename = "Task", default)]
    pub queue: QueueSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(flag: &str, status: &str) -> Task {
        Task {
            id: "1".to_string(),
            flag: flag.to_string(),
            download_status: status.to_string(),
            ..Task::default()
        }
    }

    #[test]
    fn empty_flag_is_normal() {
        assert_eq!(task("", "0").flag(), Flag::Normal);
    }

    #[test]
    fn flag_digits_map_to_classes() {
        assert_eq!(task("0", "").flag(), Flag::Normal);
        assert_eq!(task("1", "").flag(), Flag::Deleted);
        assert_eq!(task("2", "").flag(), Flag::Purged);
        assert_eq!(task("3", "").flag(), Flag::Invalid);
        assert_eq!(task("4", "").flag(), Flag::Expired);
    }

    #[test]
    fn unparseable_flags_are_invalid() {
        for raw in ["5", "9", "x", "10", " "] {
            assert_eq!(task(raw, "").flag(), Flag::Invalid, "{raw:?}");
        }
    }

    #[test]
    fn bt_is_task_type_zero() {
        let mut t = task("", "1");
        t.task_type = 0;
        assert!(t.is_bt());
        assert_eq!(t.kind(), TaskKind::Bt);
        t.task_type = 1;
        assert!(!t.is_bt());
    }

    #[test]
    fn expired_folds_into_display_index() {
        assert_eq!(task("4", "2").display_status(), "expired");
        assert_eq!(task("", "5").display_status(), "pending");
        assert_eq!(task("", "3").display_status(), "failed");
    }

    #[test]
    fn only_normal_downloading_is_in_flight() {
        assert!(task("", "1").in_flight());
        assert!(!task("1", "1").in_flight());
        assert!(!task("", "2").in_flight());
    }

    #[test]
    fn progress_record_updates_matching_task() {
        let mut t = task("", "1");
        let record = ProgressRecord {
            id: "1".to_string(),
            speed: "1024".to_string(),
            progress: 55.5,
            download_status: "2".to_string(),
            download_url: "http://gdl/x".to_string(),
            left_live_time: String::new(),
        };
        t.apply_progress(&record);
        assert_eq!(t.speed, "1024");
        assert!((t.progress - 55.5).abs() < f64::EPSILON);
        assert_eq!(t.download_status(), Some(DownloadStatus::Completed));
        assert_eq!(t.download_url, "http://gdl/x");

        let other = ProgressRecord {
            id: "2".to_string(),
            ..record
        };
        t.speed = "0".to_string();
        t.apply_progress(&other);
        assert_eq!(t.speed, "0");
    }

    #[test]
    fn task_decodes_mixed_field_types() {
        let json = r#"{"id":123,"flag":"","taskname":"a.mkv","download_status":"1",
            "progress":"12.5","tasktype":"0","lixian_url":"","left_live_time":"<font color='red'>3d</font>"}"#;
        let t: Task = serde_json::from_str(json).unwrap();
        assert_eq!(t.id, "123");
        assert!(t.is_bt());
        assert!((t.progress - 12.5).abs() < f64::EPSILON);
        assert!(t.to_string().ends_with("12.5% 3d"));
    }

    #[test]
    fn missing_task_type_is_not_bt() {
        let t: Task = serde_json::from_str(r#"{"id":"9"}"#).unwrap();
        assert!(!t.is_bt());
        assert!(!Task::default().is_bt());
    }
}
