//! Remote URL templates.

use serde::{Deserialize, Serialize};

/// Base URLs of the remote service.
///
/// Every request URL is derived from these, so tests can point a whole
/// session at a mock server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// Host serving the login challenge and credential post.
    pub login_base: String,
    /// Host serving the task interface.
    pub lixian_base: String,
    /// Domains whose cookies make up a saved session, in file order.
    pub cookie_domains: Vec<String>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login_base: "http://login.xunlei.com".to_string(),
            lixian_base: "http://dynamic.cloud.vip.xunlei.com".to_string(),
            cookie_domains: vec![
                "http://xunlei.com".to_string(),
                "http://dynamic.cloud.vip.xunlei.com".to_string(),
            ],
        }
    }
}

pub(crate) fn escape(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

impl Endpoints {
    /// Endpoints where every host is `base`.
    #[must_use]
    pub fn single_host(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            login_base: base.clone(),
            lixian_base: base.clone(),
            cookie_domains: vec![base.clone(), base],
        }
    }

    /// URL used to look up session cookies such as `userid`.
    #[must_use]
    pub fn cookie_url(&self) -> &str {
        self.cookie_domains
            .first()
            .map_or(self.lixian_base.as_str(), String::as_str)
    }

    fn interface(&self, tail: &str) -> String {
        format!("{}/interface/{tail}", self.lixian_base)
    }

    pub(crate) fn login_check(&self, account: &str, ts: i64) -> String {
        format!("{}/check?u={}&cachetime={ts}", self.login_base, escape(account))
    }

    pub(crate) fn sec2login(&self) -> String {
        format!("{}/sec2login/", self.login_base)
    }

    pub(crate) fn lixian_login(&self, ts: i64) -> String {
        format!("{}/login?cachetime={ts}&from=0", self.lixian_base)
    }

    pub(crate) fn task_home(&self, uid: &str) -> String {
        format!("{}/user_task?userid={uid}&st=4", self.lixian_base)
    }

    pub(crate) fn history_page(&self, uid: &str, page: u32) -> String {
        format!("{}/user_history?userid={uid}&p={page}", self.lixian_base)
    }

    pub(crate) fn expire_home(&self, uid: &str) -> String {
        format!("{}/user_history?type=1&userid={uid}", self.lixian_base)
    }

    pub(crate) fn showtask_unfresh(&self, type_id: u8, page: u32, page_size: u32) -> String {
        self.interface(&format!(
            "showtask_unfresh?type_id={type_id}&page={page}&tasknum={page_size}&p={page}&interfrom=task"
        ))
    }

    pub(crate) fn task_delay(&self, task_id: &str, ts: i64) -> String {
        self.interface(&format!("task_delay?taskids={task_id}_1&interfrom=task&noCacheIE={ts}"))
    }

    pub(crate) fn delay_once(&self) -> String {
        self.interface("delay_once?callback=anything")
    }

    /// Torrent download URL; also accepted by the magnet flow as a link.
    #[must_use]
    pub fn get_torrent(&self, uid: &str, info_hash: &str) -> String {
        self.interface(&format!("get_torrent?userid={uid}&infoid={info_hash}"))
    }

    pub(crate) fn task_pause(&self, tids: &str, uid: &str, ts: i64) -> String {
        self.interface(&format!("task_pause?tid={tids}&uid={uid}&noCacheIE={ts}"))
    }

    pub(crate) fn redownload(&self, ts: i64) -> String {
        self.interface(&format!("redownload?callback=jsonp{ts}"))
    }

    pub(crate) fn fill_bt_list(&self, task_id: &str, info_hash: &str, page: u32, uid: &str, ts: i64) -> String {
        self.interface(&format!(
            "fill_bt_list?callback=fill_bt_list&tid={task_id}&infoid={info_hash}&g_net=1&p={page}&uid={uid}&interfrom=task&noCacheIE={ts}"
        ))
    }

    pub(crate) fn task_check(&self, url: &str, from: &str, random: &str, ts: i64) -> String {
        self.interface(&format!(
            "task_check?callback=queryCid&url={}&interfrom={from}&random={random}&tcache={ts}",
            escape(url)
        ))
    }

    pub(crate) fn task_commit(&self, query: &str) -> String {
        self.interface(&format!("task_commit?{query}"))
    }

    pub(crate) fn batch_task_commit(&self, ts: i64) -> String {
        self.interface(&format!("batch_task_commit?callback=jsonp{ts}&t={ts}"))
    }

    pub(crate) fn torrent_upload(&self) -> String {
        self.interface("torrent_upload")
    }

    pub(crate) fn bt_task_commit(&self, ts: i64) -> String {
        self.interface(&format!("bt_task_commit?callback=jsonp{ts}"))
    }

    pub(crate) fn url_query(&self, link: &str, random: &str) -> String {
        self.interface(&format!("url_query?callback=queryUrl&u={}&random={random}", escape(link)))
    }

    pub(crate) fn rename(&self, query: &str) -> String {
        self.interface(&format!("rename?{query}"))
    }

    pub(crate) fn task_process(&self, ts: i64) -> String {
        self.interface(&format!("task_process?callback=jsonp{ts}&t={ts}"))
    }

    pub(crate) fn task_delete(&self, del_type: u8, ts: i64) -> String {
        self.interface(&format!("task_delete?callback=jsonp{ts}&type={del_type}&noCacheIE={ts}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_hosts() {
        let e = Endpoints::default();
        assert_eq!(e.cookie_url(), "http://xunlei.com");
        assert_eq!(
            e.task_home("42"),
            "http://dynamic.cloud.vip.xunlei.com/user_task?userid=42&st=4"
        );
        assert_eq!(e.sec2login(), "http://login.xunlei.com/sec2login/");
    }

    #[test]
    fn single_host_strips_trailing_slash() {
        let e = Endpoints::single_host("http://127.0.0.1:9000/");
        assert_eq!(e.lixian_base, "http://127.0.0.1:9000");
        assert_eq!(e.cookie_domains.len(), 2);
        assert_eq!(e.delay_once(), "http://127.0.0.1:9000/interface/delay_once?callback=anything");
    }

    #[test]
    fn query_parameters_are_escaped() {
        let e = Endpoints::default();
        let url = e.url_query("magnet:?xt=urn:btih:abc&dn=a b", "r1");
        assert!(url.contains("u=magnet%3A%3Fxt%3Durn%3Abtih%3Aabc%26dn%3Da+b"));
        assert!(url.ends_with("&random=r1"));
    }

    #[test]
    fn showtask_carries_page_twice() {
        let e = Endpoints::default();
        let url = e.showtask_unfresh(4, 3, 100);
        assert!(url.contains("type_id=4&page=3&tasknum=100&p=3&interfrom=task"));
    }
}
