//! Error types for the lixian library.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the lixian service.
#[derive(Error, Debug)]
#[deny(missing_docs)]
pub enum Error {
    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON payload could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Torrent metainfo could not be decoded.
    #[error("bencode error: {0}")]
    Bencode(String),

    /// The per-request deadline elapsed before the response was read.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The session was shut down while a request was in flight.
    #[error("request cancelled")]
    Cancelled,

    /// The remote closed the connection before answering, on every attempt.
    #[error("connection closed by remote after {attempts} attempts")]
    ConnectionClosed {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Non-success HTTP status.
    #[error("HTTP status: {0}")]
    Status(String),

    /// The response body ended before its declared length.
    #[error("response body truncated")]
    TruncatedBody,

    /// The response body exceeded the configured limit.
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The response did not have the expected wrapper shape.
    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),

    /// The remote answered with an `alert('...')` page.
    #[error("remote error: {0}")]
    RemoteAlert(String),

    /// The account id is empty.
    #[error("invalid login account")]
    InvalidAccount,

    /// The login challenge never settled or no user id came back.
    #[error("login failed")]
    LoginFailed,

    /// The saved cookies no longer authenticate.
    #[error("previous session expired")]
    SessionExpired,

    /// The cookie file does not describe a session.
    #[error("invalid session")]
    InvalidSession,

    /// The server answered in a way no other variant covers.
    #[error("unexpected error: {0}")]
    Unexpected(String),

    /// A task for the same torrent is already in the list.
    #[error("bt task already exists")]
    TaskAlreadyExists,

    /// The remote wants payment before accepting the task.
    #[error("task needs beans: gold {gold}, silver {silver}")]
    InsufficientBalance {
        /// Gold bean cost.
        gold: String,
        /// Silver bean cost.
        silver: String,
    },

    /// The remote asks for a captcha before accepting the task.
    #[error("task submission need verification")]
    NeedsVerification,

    /// The remote refused the task with the given reason.
    #[error("task submission failed: {0}")]
    SubmissionFailed(String),

    /// The task has expired and cannot be restarted.
    #[error("task not capable for restart")]
    NotRestartable,

    /// No task with this id in the current listing.
    #[error("no such taskid in list: {0}")]
    TaskNotFound(String),

    /// The task was already removed for good.
    #[error("task already purged")]
    AlreadyPurged,

    /// The task is already in the trash.
    #[error("task already deleted")]
    AlreadyDeleted,

    /// The task is still active, so there is nothing to re-add.
    #[error("task already in queue")]
    AlreadyQueued,

    /// The task status flag is not one of the known values.
    #[error("invalid flag in task")]
    InvalidFlag,

    /// No cached task is downloading, so there is nothing to refresh.
    #[error("no tasks in progress")]
    NoTasksInProgress,

    /// The operation needs a BitTorrent task.
    #[error("not a bt task")]
    NotBtTask,

    /// Rename rejected with the given result code.
    #[error("error in rename task: {0}")]
    RenameFailed(i64),

    /// Malformed task query expression.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Source string that cannot be submitted.
    #[error("invalid source: {0:?}")]
    InvalidSource(String),

    /// Configuration file could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the transport should resend the request.
    ///
    /// Only connection-level EOFs seen before a response head qualify.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }
}

/// A specialized `Result` type for lixian operations.
pub type Result<T> = std::result::Result<T, Error>;
