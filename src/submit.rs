//! Task submission: plain links, magnets and info hashes, torrent files,
//! and batches.

use std::path::Path;

use log::{debug, info};
use url::form_urlencoded::Serializer;

use crate::config::endpoints::escape;
use crate::decode;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::transport::{Request, Upload, nonce, timestamp_ms};
use crate::url::{Source, normalize_link};

impl Session {
    /// Classifies `raw` and submits it through the matching flow.
    ///
    /// Returns the new task id when the remote reports one (BT flows).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSource`] for blank input, or any error of the flow
    /// the source is routed to.
    pub async fn add_task(&self, raw: &str) -> Result<Option<String>> {
        let source = Source::classify(raw)?;
        debug!("submitting {source:?}");
        match source {
            Source::Ordinary(link) | Source::Ed2k(link) => {
                self.add_simple(&link, None).await.map(|()| None)
            }
            Source::BtHash(hash) => {
                let link = self.config.endpoints.get_torrent(&self.uid(), &hash);
                self.add_magnet(&link, None).await.map(Some)
            }
            Source::Magnet(link) => self.add_magnet(&link, None).await.map(Some),
            Source::TorrentFile(path) => self.add_torrent_file(&path).await.map(Some),
        }
    }

    /// Submits an ordinary or ed2k link. With `origin`, the new task
    /// replaces that history entry.
    ///
    /// # Errors
    ///
    /// [`Error::InsufficientBalance`] when the remote wants payment, and
    /// [`Error::InvalidResponse`] when either answer has the wrong shape.
    pub async fn add_simple(&self, link: &str, origin: Option<&str>) -> Result<()> {
        let endpoints = &self.config.endpoints;
        let from = if origin.is_some() { "history" } else { "task" };
        let link = normalize_link(link);
        let check_uri = endpoints.task_check(&link, from, &nonce(), timestamp_ms());
        let check = decode::task_check(&self.get_text(&check_uri).await?)?;

        let mut query = Serializer::new(String::new());
        query
            .append_pair("callback", "ret_task")
            .append_pair("uid", &self.uid())
            .append_pair("cid", &check.cid)
            .append_pair("gcid", &check.gcid)
            .append_pair("size", &check.size)
            .append_pair("goldbean", &check.gold_bean)
            .append_pair("silverbean", &check.silver_bean)
            .append_pair("t", &check.name)
            .append_pair("url", &link)
            .append_pair("type", if link.starts_with("ed2k://") { "2" } else { "0" });
        match origin {
            Some(id) => query.append_pair("o_taskid", id).append_pair("o_page", "history"),
            None => query.append_pair("o_page", "task").append_pair("o_taskid", "0"),
        };
        let body = self.get_text(&endpoints.task_commit(&query.finish())).await?;
        if !decode::is_commit_ok(&body) {
            debug!("task commit answered: {body}");
            return Err(Error::InvalidResponse("task_commit"));
        }
        info!("added {}", check.name);
        Ok(())
    }

    /// Resolves a magnet or `get_torrent` link and submits every file in it.
    ///
    /// # Errors
    ///
    /// [`Error::TaskAlreadyExists`] when the content is already queued, and
    /// the errors of [`decode::bt_submission`].
    pub async fn add_magnet(&self, link: &str, origin: Option<&str>) -> Result<String> {
        let body = self
            .get_text(&self.config.endpoints.url_query(link, &nonce()))
            .await?;
        let query = decode::url_query(&body)?;
        debug!(
            "bt query: {} {} ({} files)",
            query.info_hash,
            query.name,
            query.files.len()
        );

        let mut form = Serializer::new(String::new());
        form.append_pair("uid", &self.uid())
            .append_pair("btname", &query.name)
            .append_pair("cid", &query.info_hash)
            .append_pair("tsize", &query.size)
            .append_pair("findex", &query.indices.join("_"))
            .append_pair("size", &query.sizes.join("_"));
        match origin {
            Some(id) => form
                .append_pair("from", "history")
                .append_pair("o_taskid", id)
                .append_pair("o_page", "history"),
            None => form.append_pair("from", "task"),
        };
        self.commit_bt(form.finish()).await
    }

    /// Uploads a local torrent file and submits every file in it.
    ///
    /// # Errors
    ///
    /// I/O errors reading the file, [`Error::TaskAlreadyExists`] when the
    /// torrent is already queued, and the errors of
    /// [`decode::bt_submission`].
    pub async fn add_torrent_file(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map_or_else(|| "upload.torrent".to_string(), |n| n.to_string_lossy().into_owned());
        let upload = Upload {
            field: "filepath".to_string(),
            file_name,
            bytes,
            fields: vec![
                ("random".to_string(), nonce()),
                ("interfrom".to_string(), "task".to_string()),
            ],
        };
        let body = self
            .fetch(&Request::multipart(self.config.endpoints.torrent_upload(), upload))
            .await?;
        let uploaded = decode::torrent_upload(&body)?;
        debug!("uploaded torrent {} ({} files)", uploaded.info_id, uploaded.files.len());

        let indices: Vec<&str> = uploaded.files.iter().map(|f| f.id.as_str()).collect();
        let sizes: Vec<&str> = uploaded.files.iter().map(|f| f.size.as_str()).collect();
        let form = Serializer::new(String::new())
            .append_pair("uid", &self.uid())
            .append_pair("btname", &uploaded.name)
            .append_pair("cid", &uploaded.info_id)
            .append_pair("tsize", &uploaded.size)
            .append_pair("findex", &indices.join("_"))
            .append_pair("size", &sizes.join("_"))
            .append_pair("from", "0")
            .finish();
        self.commit_bt(form).await
    }

    async fn commit_bt(&self, form: String) -> Result<String> {
        let uri = self.config.endpoints.bt_task_commit(timestamp_ms());
        let body = self.post_text(&uri, form).await?;
        debug!("bt submission response: {body}");
        let id = decode::bt_submission(&body)?;
        info!("added bt task {id}");
        Ok(id)
    }

    /// Submits several links in one request. Non-empty `origins` replace
    /// those history entries.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSource`] for an empty batch, or transport errors.
    pub async fn add_batch_tasks<S: AsRef<str>>(&self, urls: &[S], origins: &[S]) -> Result<()> {
        if urls.is_empty() {
            return Err(Error::InvalidSource(String::new()));
        }
        let mut form = Serializer::new(String::new());
        for link in urls {
            form.append_pair("cid[]", "")
                .append_pair("url[]", &escape(link.as_ref()));
        }
        form.append_pair("class_id", "0");
        if origins.is_empty() {
            form.append_pair("batch_old_taskid", "0,")
                .append_pair("batch_old_database", "0,")
                .append_pair("interfrom", "task");
        } else {
            let ids: Vec<&str> = origins.iter().map(AsRef::as_ref).collect();
            form.append_pair("batch_old_taskid", &ids.join(","))
                .append_pair("batch_old_database", &"0,".repeat(ids.len()))
                .append_pair("interfrom", "history");
        }
        let ts = timestamp_ms();
        let body = self
            .post_text(&self.config.endpoints.batch_task_commit(ts), form.finish())
            .await?;
        info!("batch of {} submitted: {body}", urls.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::logged_in;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HASH: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    fn query_reply() -> String {
        format!(
            "queryUrl(1,'{HASH}','2048','My Show','1',new Array('a.mkv','b.srt'),new Array('1K','1K'),new Array('1024','1024'),new Array('1','1'),new Array('mkv','srt'),new Array('0','1'),'12.34','0')"
        )
    }

    async fn mount_commit(server: &MockServer, reply: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path("/interface/bt_task_commit"))
            .respond_with(ResponseTemplate::new(200).set_body_string(reply.to_string()))
            .expect(times)
            .mount(server)
            .await;
    }

    async fn mount_check(server: &MockServer, reply: &str, times: u64) {
        Mock::given(method("GET"))
            .and(path("/interface/task_check"))
            .respond_with(ResponseTemplate::new(200).set_body_string(reply.to_string()))
            .expect(times)
            .mount(server)
            .await;
    }

    const COMMIT_OK: &str = r#"jsonp1({"id":"99","avail_space":"1","progress":1})"#;

    #[tokio::test]
    async fn bare_hash_takes_the_bt_hash_flow() {
        let server = MockServer::start().await;
        let link = format!("{}/interface/get_torrent?userid=42&infoid={HASH}", server.uri());
        Mock::given(method("GET"))
            .and(path("/interface/url_query"))
            .and(query_param("u", link.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string(query_reply()))
            .expect(1)
            .mount(&server)
            .await;
        mount_commit(&server, COMMIT_OK, 1).await;
        mount_check(&server, "", 0).await;

        let session = logged_in(&server);
        assert_eq!(session.add_task(HASH).await.unwrap().as_deref(), Some("99"));
    }

    #[tokio::test]
    async fn magnet_commit_joins_indices_and_sizes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/interface/url_query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(query_reply()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/interface/bt_task_commit"))
            .and(body_string_contains("findex=0_1"))
            .and(body_string_contains("size=1024_1024"))
            .and(body_string_contains(&format!("cid={HASH}")))
            .and(body_string_contains("from=history&o_taskid=5&o_page=history"))
            .respond_with(ResponseTemplate::new(200).set_body_string(COMMIT_OK))
            .expect(1)
            .mount(&server)
            .await;

        let session = logged_in(&server);
        session.add_magnet("magnet:?xt=urn:btih:abc", Some("5")).await.unwrap();
    }

    #[tokio::test]
    async fn magnet_needing_verification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/interface/url_query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(query_reply()))
            .mount(&server)
            .await;
        mount_commit(&server, r#"jsonp1({"id":"","progress":-12})"#, 1).await;

        let session = logged_in(&server);
        assert!(matches!(
            session.add_task("magnet:?xt=urn:btih:abc").await,
            Err(Error::NeedsVerification)
        ));
    }

    #[tokio::test]
    async fn existing_magnet_is_not_committed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/interface/url_query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("queryUrl(-1,'{HASH}','',0)")))
            .mount(&server)
            .await;
        mount_commit(&server, COMMIT_OK, 0).await;

        let session = logged_in(&server);
        assert!(matches!(
            session.add_task("magnet:?xt=urn:btih:abc").await,
            Err(Error::TaskAlreadyExists)
        ));
    }

    #[tokio::test]
    async fn ed2k_commits_with_type_two() {
        let server = MockServer::start().await;
        mount_check(&server, "queryCid('C','G','100','a.iso','0','0')", 1).await;
        Mock::given(method("GET"))
            .and(path("/interface/task_commit"))
            .and(query_param("type", "2"))
            .and(query_param("cid", "C"))
            .and(query_param("t", "a.iso"))
            .and(query_param("url", "ed2k://|file|a.b.iso|100|ABC|/"))
            .and(query_param("o_page", "task"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ret_task(1,'1')"))
            .expect(1)
            .mount(&server)
            .await;

        let session = logged_in(&server);
        let added = session.add_task("ed2k://|file|a,b.iso|100|ABC|/").await.unwrap();
        assert!(added.is_none());
    }

    #[tokio::test]
    async fn paid_content_is_not_committed() {
        let server = MockServer::start().await;
        mount_check(&server, "queryCid('C','G','100','a.iso','3','0')", 1).await;
        Mock::given(method("GET"))
            .and(path("/interface/task_commit"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let session = logged_in(&server);
        assert!(matches!(
            session.add_task("http://example.com/a.iso").await,
            Err(Error::InsufficientBalance { .. })
        ));
    }

    #[tokio::test]
    async fn unexpected_commit_reply_is_invalid() {
        let server = MockServer::start().await;
        mount_check(&server, "queryCid('C','G','100','a.iso','0','0')", 1).await;
        Mock::given(method("GET"))
            .and(path("/interface/task_commit"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>busy</html>"))
            .mount(&server)
            .await;

        let session = logged_in(&server);
        assert!(matches!(
            session.add_simple("http://example.com/a.iso", None).await,
            Err(Error::InvalidResponse("task_commit"))
        ));
    }

    const UPLOAD_OK: &str = r#"<script>document.domain="xunlei.com";var btResult ={"ret_value":1,"infoid":"H","ftitle":"show","btsize":30,"filelist":[{"id":"0","subsize":"10"},{"id":"2","subsize":"20"}]};var btRtcode = 0</script>"#;

    #[tokio::test]
    async fn torrent_file_is_uploaded_then_committed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/interface/torrent_upload"))
            .and(body_string_contains("name=\"filepath\"; filename=\"show.torrent\""))
            .and(body_string_contains("d4:infodee"))
            .respond_with(ResponseTemplate::new(200).set_body_string(UPLOAD_OK))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/interface/bt_task_commit"))
            .and(body_string_contains("cid=H"))
            .and(body_string_contains("findex=0_2"))
            .and(body_string_contains("size=10_20"))
            .and(body_string_contains("from=0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(COMMIT_OK))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("show.torrent");
        std::fs::write(&file, b"d4:infodee").unwrap();
        let session = logged_in(&server);
        let id = session.add_task(file.to_str().unwrap()).await.unwrap();
        assert_eq!(id.as_deref(), Some("99"));
    }

    #[tokio::test]
    async fn uploaded_torrent_already_queued() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/interface/torrent_upload"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"<script>parent.edit_bt_list({"infoid":"H"},'')</script>"#),
            )
            .mount(&server)
            .await;
        mount_commit(&server, COMMIT_OK, 0).await;

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("show.torrent");
        std::fs::write(&file, b"d4:infodee").unwrap();
        let session = logged_in(&server);
        assert!(matches!(
            session.add_torrent_file(&file).await,
            Err(Error::TaskAlreadyExists)
        ));
    }

    #[tokio::test]
    async fn missing_torrent_file_is_io_error() {
        let server = MockServer::start().await;
        let session = logged_in(&server);
        assert!(matches!(
            session.add_task("/no/such/file.torrent").await,
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn blank_source_is_rejected() {
        let server = MockServer::start().await;
        let session = logged_in(&server);
        assert!(matches!(session.add_task(" ").await, Err(Error::InvalidSource(_))));
    }

    #[tokio::test]
    async fn batch_without_origins() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/interface/batch_task_commit"))
            .and(body_string_contains("url%5B%5D=http%253A%252F%252Fa%252F1"))
            .and(body_string_contains("class_id=0"))
            .and(body_string_contains("batch_old_taskid=0%2C&batch_old_database=0%2C&interfrom=task"))
            .respond_with(ResponseTemplate::new(200).set_body_string("jsonp1({})"))
            .expect(1)
            .mount(&server)
            .await;

        let session = logged_in(&server);
        session
            .add_batch_tasks(&["http://a/1", "http://a/2"], &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn batch_with_origins() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/interface/batch_task_commit"))
            .and(body_string_contains("batch_old_taskid=3%2C4&batch_old_database=0%2C0%2C&interfrom=history"))
            .respond_with(ResponseTemplate::new(200).set_body_string("jsonp1({})"))
            .expect(1)
            .mount(&server)
            .await;

        let session = logged_in(&server);
        session
            .add_batch_tasks(&["http://a/1", "http://a/2"], &["3", "4"])
            .await
            .unwrap();
        assert!(matches!(
            session.add_batch_tasks::<&str>(&[], &[]).await,
            Err(Error::InvalidSource(_))
        ));
    }
}
