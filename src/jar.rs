//! Cookie store shared by the HTTP client and the saved-session file.

use std::path::Path;
use std::sync::{PoisonError, RwLockReadGuard};

use chrono::{DateTime, Utc};
use cookie::Cookie as RawCookie;
use cookie::time;
use log::debug;
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use reqwest_cookie_store::CookieStoreRwLock;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// One cookie as written to the session file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "Path", default)]
    pub path: String,
    /// Empty for host-only cookies.
    #[serde(rename = "Domain", default)]
    pub domain: String,
    #[serde(rename = "Expires", default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(rename = "MaxAge", default)]
    pub max_age: i64,
    #[serde(rename = "Secure", default)]
    pub secure: bool,
    #[serde(rename = "HttpOnly", default)]
    pub http_only: bool,
}

impl StoredCookie {
    /// A session cookie with only a name and a value.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }
}

fn to_stored(raw: &RawCookie<'_>) -> StoredCookie {
    let expires = raw
        .expires_datetime()
        .and_then(|t| DateTime::from_timestamp(t.unix_timestamp(), 0))
        .or_else(|| {
            raw.max_age()
                .map(|age| Utc::now() + chrono::Duration::seconds(age.whole_seconds()))
        });
    StoredCookie {
        name: raw.name().to_string(),
        value: raw.value().to_string(),
        path: raw.path().unwrap_or_default().to_string(),
        domain: raw.domain().unwrap_or_default().to_string(),
        expires,
        max_age: 0,
        secure: raw.secure().unwrap_or(false),
        http_only: raw.http_only().unwrap_or(false),
    }
}

fn to_raw(cookie: &StoredCookie) -> RawCookie<'static> {
    let path = if cookie.path.is_empty() { "/" } else { cookie.path.as_str() };
    let mut builder = RawCookie::build((cookie.name.clone(), cookie.value.clone()))
        .path(path.to_string())
        .secure(cookie.secure)
        .http_only(cookie.http_only);
    let domain = cookie.domain.trim_start_matches('.');
    if !domain.is_empty() {
        builder = builder.domain(domain.to_string());
    }
    match cookie.max_age {
        age if age < 0 => builder = builder.max_age(time::Duration::ZERO),
        0 => {
            if let Some(at) = cookie
                .expires
                .filter(|t| t.timestamp() > 0)
                .and_then(|t| time::OffsetDateTime::from_unix_timestamp(t.timestamp()).ok())
            {
                builder = builder.expires(at);
            }
        }
        age => builder = builder.max_age(time::Duration::seconds(age)),
    }
    builder.build()
}

/// Cookie jar backed by an RFC 6265 store, shared with the HTTP client.
#[derive(Debug, Default)]
pub struct SessionJar {
    store: CookieStoreRwLock,
}

impl SessionJar {
    /// Creates an empty jar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, cookie_store::CookieStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a saved cookie as if `url` had set it. Cookies without a
    /// domain become host-only cookies of `url`.
    pub fn set(&self, url: &Url, cookie: &StoredCookie) {
        let raw = to_raw(cookie);
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = store.insert_raw(&raw, url) {
            debug!("cookie {} not installed for {url}: {e}", cookie.name);
        }
    }

    /// Cookies that would be sent to `url`.
    #[must_use]
    pub fn cookies_for(&self, url: &Url) -> Vec<StoredCookie> {
        self.read().matches(url).into_iter().map(|c| to_stored(c)).collect()
    }

    /// Value of the named cookie visible to `url`.
    #[must_use]
    pub fn get(&self, url: &Url, name: &str) -> Option<String> {
        self.read()
            .matches(url)
            .into_iter()
            .find(|c| c.name() == name)
            .map(|c| c.value().to_string())
    }

    /// Builds a `Cookie` header from the jar plus per-request extras.
    #[must_use]
    pub fn header_for(&self, url: &Url, extra: &[(String, String)]) -> Option<HeaderValue> {
        let mut pairs: Vec<String> = self
            .read()
            .matches(url)
            .into_iter()
            .filter(|c| !extra.iter().any(|(name, _)| name == c.name()))
            .map(|c| format!("{}={}", c.name(), c.value()))
            .collect();
        pairs.extend(extra.iter().map(|(name, value)| format!("{name}={value}")));
        if pairs.is_empty() {
            return None;
        }
        HeaderValue::from_str(&pairs.join("; ")).ok()
    }

    /// Number of live cookies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().iter_unexpired().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CookieStore for SessionJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        self.store.set_cookies(cookie_headers, url);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.header_for(url, &[])
    }
}

/// Writes one cookie list per domain as indented JSON, atomically.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the file
/// cannot be written.
pub fn save_cookie_file(path: &Path, domains: &[Vec<StoredCookie>]) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(domains)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Reads a cookie file written by [`save_cookie_file`].
///
/// # Errors
///
/// Returns [`Error::InvalidSession`] if the file holds fewer than two
/// domain lists, or an I/O/JSON error if it cannot be read.
pub fn load_cookie_file(path: &Path) -> Result<Vec<Vec<StoredCookie>>> {
    let contents = std::fs::read_to_string(path)?;
    let domains: Vec<Vec<StoredCookie>> = serde_json::from_str(&contents)?;
    if domains.len() < 2 {
        return Err(Error::InvalidSession);
    }
    Ok(domains)
}
