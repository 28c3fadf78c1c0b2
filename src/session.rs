//! The [`Session`] facade: authentication, saved sessions and the state
//! every other operation is keyed on.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use log::{debug, info};
use reqwest::Url;

use crate::cache::TaskCache;
use crate::config::ClientConfig;
use crate::decode::{self, TaskListPage, UserAccount, UserInfo};
use crate::error::{Error, Result};
use crate::hash;
use crate::jar::{load_cookie_file, save_cookie_file};
use crate::task::{Flag, Task};
use crate::transport::{Request, Transport, timestamp_ms};

/// Smallest confirmation page accepted after posting credentials.
const MIN_LOGIN_PAGE: usize = 512;

#[derive(Debug, Default)]
struct Identity {
    uid: String,
    gid: String,
    account: Option<UserAccount>,
    account_info: Option<UserInfo>,
}

/// One authenticated identity: its transport, cookies and task cache.
///
/// Share it behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct Session {
    pub(crate) transport: Transport,
    pub(crate) config: ClientConfig,
    cache: TaskCache,
    identity: RwLock<Identity>,
}

impl Session {
    /// Creates a logged-out session.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            transport: Transport::new(&config)?,
            config,
            cache: TaskCache::new(),
            identity: RwLock::new(Identity::default()),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub const fn cache(&self) -> &TaskCache {
        &self.cache
    }

    /// Authenticated user id, empty before login.
    #[must_use]
    pub fn uid(&self) -> String {
        self.identity.read().unwrap_or_else(PoisonError::into_inner).uid.clone()
    }

    fn set_uid(&self, uid: String) {
        self.identity.write().unwrap_or_else(PoisonError::into_inner).uid = uid;
    }

    /// Aborts in-flight and future requests.
    pub fn shutdown(&self) {
        self.transport.shutdown_token().cancel();
    }

    pub(crate) async fn fetch(&self, request: &Request) -> Result<String> {
        let body = self.transport.execute(request).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    pub(crate) async fn get_text(&self, url: &str) -> Result<String> {
        self.fetch(&Request::get(url)).await
    }

    pub(crate) async fn post_text(&self, url: &str, form: String) -> Result<String> {
        self.fetch(&Request::post_form(url, form)).await
    }

    fn url(raw: &str) -> Result<Url> {
        Url::parse(raw).map_err(|e| Error::Config(format!("bad url {raw}: {e}")))
    }

    fn cookie(&self, name: &str) -> Option<String> {
        let url = Self::url(self.config.endpoints.cookie_url()).ok()?;
        self.transport.jar().get(&url, name)
    }

    /// Logs in with an account id and a password or its MD5 hex digest.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAccount`] for an empty id, [`Error::LoginFailed`] when
    /// the challenge never settles or no user id comes back, and
    /// [`Error::Unexpected`] when the confirmation page is missing.
    pub async fn login(&self, account: &str, password: &str) -> Result<()> {
        if account.is_empty() {
            return Err(Error::InvalidAccount);
        }
        let endpoints = &self.config.endpoints;
        let mut verify_code = None;
        for _ in 0..self.config.login_check_attempts.max(1) {
            self.get_text(&endpoints.login_check(account, timestamp_ms())).await?;
            match self.cookie("check_result") {
                Some(v) if v.len() < 3 => continue,
                Some(v) => verify_code = Some(v.get(2..).unwrap_or_default().to_uppercase()),
                None => verify_code = Some(String::new()),
            }
            break;
        }
        let verify_code = verify_code.ok_or(Error::LoginFailed)?;
        info!("verify code: {verify_code}");

        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("u", account)
            .append_pair("p", &hash::hash_pass(password, &verify_code))
            .append_pair("verifycode", &verify_code)
            .finish();
        self.post_text(&endpoints.sec2login(), form).await?;

        let uid = self.cookie("userid").unwrap_or_default();
        info!("uid: {uid}");
        if uid.is_empty() {
            return Err(Error::LoginFailed);
        }
        self.set_uid(uid);

        match self.get_text(&endpoints.lixian_login(timestamp_ms())).await {
            Ok(page) if page.len() >= MIN_LOGIN_PAGE => Ok(()),
            Ok(page) => Err(Error::Unexpected(format!(
                "login confirmation page has {} bytes",
                page.len()
            ))),
            Err(e) => Err(Error::Unexpected(format!("login confirmation failed: {e}"))),
        }
    }

    /// Writes the cookies of every tracked domain to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if a domain is not a URL or the file cannot be
    /// written.
    pub fn save_session(&self, path: &Path) -> Result<()> {
        let domains = self
            .config
            .endpoints
            .cookie_domains
            .iter()
            .map(|d| Ok(self.transport.jar().cookies_for(&Self::url(d)?)))
            .collect::<Result<Vec<_>>>()?;
        save_cookie_file(path, &domains)?;
        debug!("session saved to {}", path.display());
        Ok(())
    }

    /// Installs cookies saved by [`Session::save_session`] and probes them.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSession`] for a malformed file and
    /// [`Error::SessionExpired`] when the probe finds the session logged out.
    pub async fn resume_session(&self, path: &Path) -> Result<()> {
        let saved = load_cookie_file(path)?;
        for (domain, cookies) in self.config.endpoints.cookie_domains.iter().zip(&saved) {
            let url = Self::url(domain)?;
            for cookie in cookies {
                self.transport.jar().set(&url, cookie);
            }
        }
        if !self.is_on().await {
            return Err(Error::SessionExpired);
        }
        Ok(())
    }

    /// Probes whether the cookies still authenticate.
    pub async fn is_on(&self) -> bool {
        let Some(uid) = self.cookie("userid").filter(|u| !u.is_empty()) else {
            return false;
        };
        let page = match self.get_text(&self.config.endpoints.task_home(&uid)).await {
            Ok(page) => page,
            Err(e) => {
                debug!("liveness probe failed: {e}");
                return false;
            }
        };
        if decode::is_logged_out(&page) {
            return false;
        }
        let mut identity = self.identity.write().unwrap_or_else(PoisonError::into_inner);
        if identity.uid.is_empty() {
            identity.uid = uid;
        }
        true
    }

    pub(crate) fn remember_account(&self, page: &TaskListPage) {
        let mut identity = self.identity.write().unwrap_or_else(PoisonError::into_inner);
        if !page.info.user.cookie.is_empty() {
            identity.gid.clone_from(&page.info.user.cookie);
        }
        identity.account = Some(page.info.user.clone());
        identity.account_info = Some(page.user_info.clone());
    }

    /// The per-user routing id, read from the first listing page once.
    ///
    /// # Errors
    ///
    /// Propagates listing errors.
    pub async fn gdrive_id(&self) -> Result<String> {
        let cached = self.identity.read().unwrap_or_else(PoisonError::into_inner).gid.clone();
        if !cached.is_empty() {
            return Ok(cached);
        }
        self.task_list_page(crate::listing::Category::Mixed, 1).await?;
        let gid = self.identity.read().unwrap_or_else(PoisonError::into_inner).gid.clone();
        debug!("gdriveid: {gid}");
        Ok(gid)
    }

    /// Account summary from the last listing page.
    #[must_use]
    pub fn account(&self) -> Option<UserAccount> {
        self.identity.read().unwrap_or_else(PoisonError::into_inner).account.clone()
    }

    #[must_use]
    pub fn account_info(&self) -> Option<UserInfo> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .account_info
            .clone()
    }

    /// Cached tasks matching a query expression.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidQuery`] for a malformed expression.
    pub fn find_tasks(&self, expr: &str) -> Result<HashMap<String, Task>> {
        self.cache.find_str(expr)
    }

    #[must_use]
    pub fn task(&self, id: &str) -> Option<Task> {
        self.cache.get(id)
    }

    #[must_use]
    pub fn tasks_by_ids<S: AsRef<str>>(&self, ids: &[S]) -> HashMap<String, Task> {
        self.cache.get_many(ids)
    }

    pub(crate) fn require(&self, id: &str) -> Result<Task> {
        self.cache.get(id).ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn invalidate_cache(&self, flag: Flag) {
        self.cache.invalidate_group(flag);
    }

    pub fn invalidate_cache_all(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Endpoints;
    use crate::jar::StoredCookie;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Session pointed at `server` with short timeouts.
    pub(crate) fn session_for(server: &MockServer) -> Session {
        let config = ClientConfig::default()
            .with_timeout(Duration::from_secs(2))
            .with_endpoints(Endpoints::single_host(&server.uri()));
        Session::new(config).unwrap()
    }

    /// Session that believes it is logged in as uid `42`.
    pub(crate) fn logged_in(server: &MockServer) -> Session {
        let session = session_for(server);
        session.set_uid("42".to_string());
        session
    }

    fn cookie(name: &str, value: &str) -> String {
        format!("{name}={value}; Path=/")
    }

    async fn mount_login(server: &MockServer, confirm_len: usize) {
        Mock::given(method("GET"))
            .and(path("/check"))
            .and(query_param("u", "alice"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("set-cookie", cookie("check_result", "0:abcd")),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sec2login/"))
            .and(body_string_contains("verifycode=ABCD"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", cookie("userid", "42")))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(confirm_len)))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn login_sets_uid() {
        let server = MockServer::start().await;
        mount_login(&server, 600).await;
        let session = session_for(&server);
        session.login("alice", "secret").await.unwrap();
        assert_eq!(session.uid(), "42");
    }

    #[tokio::test]
    async fn login_polls_until_check_cookie_settles() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/check"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", cookie("check_result", "0")))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        mount_login(&server, 600).await;
        let session = session_for(&server);
        session.login("alice", "secret").await.unwrap();
    }

    #[tokio::test]
    async fn short_confirmation_page_is_unexpected() {
        let server = MockServer::start().await;
        mount_login(&server, 10).await;
        let session = session_for(&server);
        assert!(matches!(
            session.login("alice", "secret").await,
            Err(Error::Unexpected(_))
        ));
    }

    #[tokio::test]
    async fn empty_account_is_rejected_locally() {
        let server = MockServer::start().await;
        let session = session_for(&server);
        assert!(matches!(session.login("", "x").await, Err(Error::InvalidAccount)));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    fn write_session(dir: &TempDir, lists: usize) -> std::path::PathBuf {
        let file = dir.path().join("cookie.json");
        let mut domains = vec![vec![StoredCookie::new("userid", "42")]];
        domains.resize(lists, Vec::new());
        save_cookie_file(&file, &domains).unwrap();
        file
    }

    #[tokio::test]
    async fn resume_with_live_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user_task"))
            .and(query_param("userid", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>tasks</html>"))
            .expect(1)
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let file = write_session(&dir, 2);
        let session = session_for(&server);
        session.resume_session(&file).await.unwrap();
        assert_eq!(session.uid(), "42");
    }

    #[tokio::test]
    async fn resume_with_dead_cookies_is_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user_task"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<script>top.location='http://cloud.vip.xunlei.com/task.html?error=1'</script>",
            ))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let file = write_session(&dir, 2);
        let session = session_for(&server);
        assert!(matches!(
            session.resume_session(&file).await,
            Err(Error::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn resume_needs_two_domains() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let file = write_session(&dir, 1);
        let session = session_for(&server);
        assert!(matches!(
            session.resume_session(&file).await,
            Err(Error::InvalidSession)
        ));
    }

    #[tokio::test]
    async fn save_then_resume_round_trip() {
        let server = MockServer::start().await;
        mount_login(&server, 600).await;
        Mock::given(method("GET"))
            .and(path("/user_task"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("cookie.json");

        let first = session_for(&server);
        first.login("alice", "secret").await.unwrap();
        first.save_session(&file).unwrap();

        let second = session_for(&server);
        second.resume_session(&file).await.unwrap();
        assert_eq!(second.uid(), "42");
    }

    #[tokio::test]
    async fn no_userid_cookie_is_off_without_request() {
        let server = MockServer::start().await;
        let session = session_for(&server);
        assert!(!session.is_on().await);
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }
}
