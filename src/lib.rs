//! lixian - A client for the Xunlei offline-download service.
//!
//! The library drives the service's web endpoints: login and session
//! persistence, task listings, submission of URLs, magnets and torrents,
//! per-task operations and progress polling. A local [`TaskCache`] mirrors
//! the remote task list and is queried with a small filter language.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lixian::{ClientConfig, NoObserver, Session};
//!
//! # async fn example() -> lixian::Result<()> {
//! let session = Arc::new(Session::new(ClientConfig::default())?);
//! session.login("account", "password").await?;
//!
//! // Fill the cache and pick the finished BT tasks
//! session.get_tasks().await?;
//! for task in session.find_tasks("group=completed&status=normal&type=bt")?.values() {
//!     println!("{task}");
//! }
//!
//! // Submit a magnet and keep progress fresh in the background
//! session.add_task("magnet:?xt=urn:btih:...").await?;
//! let poller = session.spawn_poller(NoObserver);
//! poller.trigger();
//! poller.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod format;
pub mod hash;
pub mod jar;
pub mod listing;
mod ops;
pub mod poller;
pub mod session;
mod submit;
pub mod task;
pub mod transport;
pub mod url;

// Re-export main types for convenience
pub use cache::{Query, TaskCache};
pub use config::{AppConfig, ClientConfig, Endpoints, PathConfig, RetryPolicy};
pub use decode::{BtList, BtRecord, TaskListPage, UserAccount, UserInfo};
pub use error::{Error, Result};
pub use listing::Category;
pub use poller::{NoObserver, PollerHandle, TaskObserver};
pub use session::Session;
pub use task::{DownloadStatus, Flag, ProgressRecord, ProgressSnapshot, Task, TaskKind};
pub use url::Source;
