//! Decoders for the service's JSONP, inline-script and HTML answers.
//!
//! Every decoder matches a fixed wrapper first and fails with
//! [`Error::InvalidResponse`] when the wrapper is absent.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::task::Task;

macro_rules! regex {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($re).expect("valid regex"));
    };
}

regex!(TASK_LIST_RE, r"rebuild\((\{.*\})\)");
regex!(
    HISTORY_RE,
    r#"<input id="d_status(\d+)"[^<>]+value="(.*)" />\s+<input id="dflag\d+"[^<>]+value="(.*)" />\s+<input id="dcid\d+"[^<>]+value="(.*)" />\s+<input id="f_url\d+"[^<>]+value="(.*)" />\s+<input id="taskname\d+"[^<>]+value="(.*)" />\s+<input id="d_tasktype\d+"[^<>]+value="(.*)" />"#
);
regex!(NEXT_PAGE_RE, r#"<li class="next"><a href="([^"]+)">[^<>]*</a></li>"#);
regex!(BT_LIST_RE, r#"fill_bt_list\(\{"Result":(.*)\}\)"#);
regex!(ALERT_RE, r"alert\('(.*)'\)");
regex!(DELAY_RE, r"^task_delay_resp\((.*\}),\[.*\]\)");
regex!(PROCESS_RE, r#"jsonp\d+\(\{"Process":(.*)\}\)"#);
regex!(TASK_CHECK_RE, r"queryCid\((.*)\)");
regex!(URL_QUERY_RE, r"queryUrl\((1,.*)\)");
regex!(URL_QUERY_EXISTS_RE, r"queryUrl\(-1,'[0-9A-Za-z]{40}'");
regex!(
    BT_QUERY_RE,
    r"'([0-9A-Za-z]{40})','(\d*)','(.*)','(\d)',new Array\((.*)\),new Array\((.*)\),new Array\((.*)\),new Array\((.*)\),new Array\((.*)\),new Array\((.*)\),'([\d\.]+)','(\d)'"
);
regex!(BT_COMMIT_RE, r"jsonp\d*\((\{.*\})\)");
regex!(
    UPLOAD_RE,
    r#"<script>document\.domain="xunlei\.com";var btResult =(\{.+\});(var btRtcode = 0)*</script>"#
);
regex!(UPLOAD_EXISTS_RE, r"parent\.edit_bt_list\((\{.*\}),'");
regex!(COMMIT_RE, r"ret_task\(.*\)");
regex!(DELETE_OK_RE, r#"\{"result":1,"type":"#);
regex!(JSONP_RE, r"jsonp\d*\(");
regex!(LOGGED_OUT_RE, r"top.location='http://cloud.vip.xunlei.com/task.html\?error=");

/// Deserializers that accept numbers where strings are expected and the
/// other way round; the remote is not consistent about either.
pub(crate) mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    pub fn float<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64().unwrap_or_default(),
            Value::String(s) => s.trim().parse().unwrap_or_default(),
            _ => 0.0,
        })
    }

    pub fn int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or_default(),
            Value::String(s) => s.trim().parse().unwrap_or_default(),
            _ => 0,
        })
    }

    pub fn small<'de, D: Deserializer<'de>>(d: D) -> Result<u8, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_u64().and_then(|v| u8::try_from(v).ok()).unwrap_or(1),
            Value::String(s) => s.trim().parse().unwrap_or(1),
            _ => 1,
        })
    }
}

/// Unescapes a task or file name until it stops changing; the remote
/// encodes names several times over.
#[must_use]
pub fn unescape_name(name: &str) -> String {
    let mut current = name.to_string();
    loop {
        let next = html_escape::decode_html_entities(&current);
        if next == current {
            return current;
        }
        current = next.into_owned();
    }
}

/// Returns the message of an `alert('...')` page.
#[must_use]
pub fn alert_message(body: &str) -> Option<String> {
    ALERT_RE.captures(body).map(|c| c[1].to_string())
}

/// Whether the task home page redirects to the login error page.
#[must_use]
pub fn is_logged_out(body: &str) -> bool {
    LOGGED_OUT_RE.is_match(body)
}

#[must_use]
pub fn is_jsonp(body: &str) -> bool {
    JSONP_RE.is_match(body)
}

#[must_use]
pub fn is_commit_ok(body: &str) -> bool {
    COMMIT_RE.is_match(body)
}

#[must_use]
pub fn is_delete_ok(body: &str) -> bool {
    DELETE_OK_RE.is_match(body)
}

/// Account summary embedded in every listing page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UserAccount {
    #[serde(deserialize_with = "lenient::string")]
    pub expire_date: String,
    #[serde(deserialize_with = "lenient::string")]
    pub max_task_num: String,
    #[serde(deserialize_with = "lenient::string")]
    pub max_store: String,
    #[serde(deserialize_with = "lenient::string")]
    pub available_space: String,
    /// Number of tasks in the listed category.
    #[serde(deserialize_with = "lenient::string")]
    pub total_num: String,
    #[serde(deserialize_with = "lenient::string")]
    pub history_task_total_num: String,
    #[serde(deserialize_with = "lenient::string")]
    pub downloading_num: String,
    #[serde(deserialize_with = "lenient::string")]
    pub waiting_num: String,
    #[serde(deserialize_with = "lenient::string")]
    pub complete_num: String,
    /// The per-user routing id ("gid").
    #[serde(deserialize_with = "lenient::string")]
    pub cookie: String,
    #[serde(deserialize_with = "lenient::string")]
    pub vip_level: String,
    #[serde(deserialize_with = "lenient::string")]
    pub user_type: String,
    #[serde(deserialize_with = "lenient::string")]
    pub goldbean_num: String,
    #[serde(deserialize_with = "lenient::string")]
    pub silverbean_num: String,
}

/// Storage usage embedded in every listing page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UserInfo {
    #[serde(deserialize_with = "lenient::string")]
    pub all_space: String,
    #[serde(deserialize_with = "lenient::string")]
    pub all_used_store: String,
    #[serde(deserialize_with = "lenient::string")]
    pub all_space_format: String,
    #[serde(deserialize_with = "lenient::string")]
    pub all_used_format: String,
    #[serde(deserialize_with = "lenient::string")]
    pub percent: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskListInfo {
    pub tasks: Vec<Task>,
    pub user: UserAccount,
}

/// One decoded listing page.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskListPage {
    #[serde(deserialize_with = "lenient::string")]
    pub rtcode: String,
    pub info: TaskListInfo,
    #[serde(rename = "userinfo")]
    pub user_info: UserInfo,
}

impl TaskListPage {
    /// Remote-declared total, or zero when absent or unparseable.
    #[must_use]
    pub fn declared_total(&self) -> usize {
        self.info.user.total_num.trim().parse().unwrap_or(0)
    }
}

/// Extracts the raw `rebuild({...})` payload.
///
/// # Errors
///
/// Returns [`Error::InvalidResponse`] if the wrapper is missing.
pub fn task_list_payload(body: &str) -> Result<&str> {
    TASK_LIST_RE
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or(Error::InvalidResponse("task list"))
}

/// Decodes a listing page, unescaping task names.
///
/// # Errors
///
/// Returns [`Error::InvalidResponse`] or a JSON error.
pub fn task_list(body: &str) -> Result<TaskListPage> {
    let mut page: TaskListPage = serde_json::from_str(task_list_payload(body)?)?;
    for task in &mut page.info.tasks {
        task.name = unescape_name(&task.name);
    }
    Ok(page)
}

/// Scrapes a history page into tasks carrying `flag`, and reports whether
/// a next-page link is present.
#[must_use]
pub fn history(body: &str, flag: &str) -> (Vec<Task>, bool) {
    let tasks = HISTORY_RE
        .captures_iter(body)
        .map(|c| Task {
            id: c[1].to_string(),
            download_status: c[2].to_string(),
            cid: c[4].to_string(),
            url: c[5].to_string(),
            name: unescape_name(&c[6]),
            task_type: c[7].trim().parse().unwrap_or(0),
            flag: flag.to_string(),
            ..Task::default()
        })
        .collect();
    (tasks, NEXT_PAGE_RE.is_match(body))
}

/// One sub-file of a BT task.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BtRecord {
    #[serde(deserialize_with = "lenient::int")]
    pub id: i64,
    #[serde(rename = "title", deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(deserialize_with = "lenient::string")]
    pub download_status: String,
    #[serde(deserialize_with = "lenient::string")]
    pub cid: String,
    /// Human-readable size.
    #[serde(rename = "size", deserialize_with = "lenient::string")]
    pub size_readable: String,
    #[serde(deserialize_with = "lenient::float")]
    pub percent: f64,
    #[serde(rename = "taskid", deserialize_with = "lenient::string")]
    pub task_id: String,
    #[serde(rename = "livetime", deserialize_with = "lenient::string")]
    pub live_time: String,
    #[serde(rename = "downurl", deserialize_with = "lenient::string")]
    pub download_url: String,
    #[serde(rename = "filesize", deserialize_with = "lenient::string")]
    pub file_size: String,
    #[serde(deserialize_with = "lenient::string")]
    pub url: String,
    #[serde(rename = "dirtitle", deserialize_with = "lenient::string")]
    pub dir_name: String,
}

/// Sub-files of a BT task, possibly accumulated over several pages.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BtList {
    #[serde(rename = "Tid", deserialize_with = "lenient::string")]
    pub task_id: String,
    #[serde(rename = "Infoid", deserialize_with = "lenient::string")]
    pub info_id: String,
    /// Declared number of sub-files.
    #[serde(rename = "btnum", deserialize_with = "lenient::string")]
    pub total: String,
    #[serde(rename = "btpernum", deserialize_with = "lenient::int")]
    pub per_page: i64,
    #[serde(rename = "now_page", deserialize_with = "lenient::int")]
    pub page: i64,
    #[serde(rename = "Record")]
    pub records: Vec<BtRecord>,
}

impl BtList {
    #[must_use]
    pub fn declared_total(&self) -> usize {
        self.total.trim().parse().unwrap_or(0)
    }
}

/// Decodes one `fill_bt_list` page.
///
/// # Errors
///
/// Returns [`Error::RemoteAlert`] for alert pages and
/// [`Error::InvalidResponse`] for anything else unexpected.
pub fn bt_list(body: &str) -> Result<BtList> {
    let Some(caps) = BT_LIST_RE.captures(body) else {
        if let Some(msg) = alert_message(body) {
            return Err(Error::RemoteAlert(msg));
        }
        return Err(Error::InvalidResponse("fill_bt_list"));
    };
    let mut list: BtList = serde_json::from_str(&caps[1])?;
    for record in &mut list.records {
        record.name = unescape_name(&record.name.replace('\\', "/"));
    }
    Ok(list)
}

/// Decodes a `task_delay_resp(...)` answer into the new live time.
///
/// # Errors
///
/// Returns [`Error::InvalidResponse`] if the wrapper is missing.
pub fn delay_left_live_time(body: &str) -> Result<String> {
    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct Entry {
        #[serde(deserialize_with = "lenient::string")]
        left_live_time: String,
    }
    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct Reply {
        #[serde(rename = "0")]
        first: Entry,
    }
    let caps = DELAY_RE
        .captures(body)
        .ok_or(Error::InvalidResponse("task_delay"))?;
    let reply: Reply = serde_json::from_str(&caps[1])?;
    Ok(reply.first.left_live_time)
}

/// Decodes a `task_process` answer.
///
/// # Errors
///
/// Returns [`Error::InvalidResponse`] or a JSON error.
pub fn progress_snapshot(body: &str) -> Result<crate::task::ProgressSnapshot> {
    let caps = PROCESS_RE
        .captures(body)
        .ok_or(Error::InvalidResponse("task_process"))?;
    Ok(serde_json::from_str(&caps[1])?)
}

/// Metadata returned by the check endpoint for a plain URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskCheck {
    pub cid: String,
    pub gcid: String,
    pub size: String,
    pub name: String,
    pub gold_bean: String,
    pub silver_bean: String,
}

/// Decodes `queryCid(...)`.
///
/// The payload is a flat comma list: `cid, gcid, size, [extra,] name, gold,
/// silver, ...`; the extra field is present when there are ten or more.
///
/// # Errors
///
/// Returns [`Error::InvalidResponse`] for a missing wrapper or short list,
/// and [`Error::InsufficientBalance`] when either cost is non-zero.
pub fn task_check(body: &str) -> Result<TaskCheck> {
    let caps = TASK_CHECK_RE
        .captures(body)
        .ok_or(Error::InvalidResponse("task_check"))?;
    let fields: Vec<&str> = caps[1]
        .split(',')
        .map(|f| f.trim_matches(|c| c == '\'' || c == ' '))
        .collect();
    let j = usize::from(fields.len() >= 10);
    if fields.len() < j + 6 {
        return Err(Error::InvalidResponse("task_check fields"));
    }
    let check = TaskCheck {
        cid: fields[0].to_string(),
        gcid: fields[1].to_string(),
        size: fields[2].to_string(),
        name: fields[j + 3].to_string(),
        gold_bean: fields[j + 4].to_string(),
        silver_bean: fields[j + 5].to_string(),
    };
    if check.gold_bean != "0" || check.silver_bean != "0" {
        return Err(Error::InsufficientBalance {
            gold: check.gold_bean,
            silver: check.silver_bean,
        });
    }
    Ok(check)
}

/// Content description returned by the URL-resolution endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BtQuery {
    pub info_hash: String,
    pub size: String,
    pub name: String,
    pub is_full: String,
    pub files: Vec<String>,
    pub formatted_sizes: Vec<String>,
    pub sizes: Vec<String>,
    pub picked: Vec<String>,
    pub extensions: Vec<String>,
    pub indices: Vec<String>,
    pub random: String,
    pub ret: String,
}

fn split_array(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    raw.split(',')
        .map(|f| f.trim_matches(|c| c == '\'' || c == ' ').to_string())
        .collect()
}

/// Parses the argument list of a successful `queryUrl(1,...)` answer.
///
/// The grammar has exactly twelve slots:
///
/// ```text
/// '<info hash: 40 alnum>','<size>','<name>','<is_full: digit>',
/// new Array(<files>),new Array(<formatted sizes>),new Array(<sizes>),
/// new Array(<picked>),new Array(<extensions>),new Array(<indices>),
/// '<random>','<ret: digit>'
/// ```
///
/// Array elements are split on `,` and stripped of quotes and spaces.
/// `sizes` and `indices` must have the same length since they are
/// submitted pairwise.
///
/// # Errors
///
/// Returns [`Error::InvalidResponse`] if the text does not fit the grammar.
pub fn parse_bt_query(payload: &str) -> Result<BtQuery> {
    let caps = BT_QUERY_RE
        .captures(payload)
        .ok_or(Error::InvalidResponse("url_query arity"))?;
    let query = BtQuery {
        info_hash: caps[1].to_string(),
        size: caps[2].to_string(),
        name: caps[3].to_string(),
        is_full: caps[4].to_string(),
        files: split_array(&caps[5]),
        formatted_sizes: split_array(&caps[6]),
        sizes: split_array(&caps[7]),
        picked: split_array(&caps[8]),
        extensions: split_array(&caps[9]),
        indices: split_array(&caps[10]),
        random: caps[11].to_string(),
        ret: caps[12].to_string(),
    };
    if query.sizes.len() != query.indices.len() {
        return Err(Error::InvalidResponse("url_query sizes and indices differ"));
    }
    Ok(query)
}

/// Decodes a `queryUrl(...)` answer.
///
/// # Errors
///
/// Returns [`Error::TaskAlreadyExists`] for `queryUrl(-1,'<hash>'...`, and
/// [`Error::InvalidResponse`] for anything else that is not a success.
pub fn url_query(body: &str) -> Result<BtQuery> {
    if let Some(caps) = URL_QUERY_RE.captures(body) {
        return parse_bt_query(&caps[1]);
    }
    if URL_QUERY_EXISTS_RE.is_match(body) {
        return Err(Error::TaskAlreadyExists);
    }
    Err(Error::InvalidResponse("url_query"))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct BtSubmission {
    #[serde(deserialize_with = "lenient::string")]
    id: String,
    #[serde(deserialize_with = "lenient::int")]
    progress: i64,
    #[serde(deserialize_with = "lenient::string")]
    msg: String,
    #[serde(deserialize_with = "lenient::string")]
    rtcode: String,
}

/// Interprets a `bt_task_commit` answer and returns the new task id.
///
/// # Errors
///
/// `progress` 2 is [`Error::SubmissionFailed`], -11 and -12 are
/// [`Error::NeedsVerification`], any other non-1 value is
/// [`Error::Unexpected`].
pub fn bt_submission(body: &str) -> Result<String> {
    let caps = BT_COMMIT_RE
        .captures(body)
        .ok_or(Error::InvalidResponse("bt_task_commit"))?;
    let reply: BtSubmission = serde_json::from_str(&caps[1])?;
    match reply.progress {
        1 => Ok(reply.id),
        2 if reply.msg.is_empty() => Err(Error::SubmissionFailed(format!("rtcode {}", reply.rtcode))),
        2 => Err(Error::SubmissionFailed(reply.msg)),
        -11 | -12 => Err(Error::NeedsVerification),
        other => Err(Error::Unexpected(format!("bt submission progress {other}"))),
    }
}

/// One file listed by the torrent upload answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UploadedFile {
    #[serde(deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(rename = "subsize", deserialize_with = "lenient::string")]
    pub size: String,
    #[serde(rename = "subformatsize", deserialize_with = "lenient::string")]
    pub formatted_size: String,
    #[serde(deserialize_with = "lenient::string")]
    pub valid: String,
    #[serde(rename = "findex", deserialize_with = "lenient::string")]
    pub index: String,
    #[serde(rename = "subtitle", deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(deserialize_with = "lenient::string")]
    pub ext: String,
}

/// Decoded `btResult` of a torrent upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UploadedTorrent {
    #[serde(rename = "ret_value", deserialize_with = "lenient::int")]
    pub ret: i64,
    #[serde(rename = "infoid", deserialize_with = "lenient::string")]
    pub info_id: String,
    #[serde(rename = "ftitle", deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(rename = "btsize", deserialize_with = "lenient::string")]
    pub size: String,
    #[serde(deserialize_with = "lenient::string")]
    pub is_full: String,
    #[serde(rename = "filelist")]
    pub files: Vec<UploadedFile>,
    #[serde(deserialize_with = "lenient::string")]
    pub random: String,
}

/// Decodes the inline script returned by a torrent upload.
///
/// # Errors
///
/// Returns [`Error::TaskAlreadyExists`] for the `edit_bt_list` shape and
/// [`Error::InvalidResponse`] otherwise.
pub fn torrent_upload(body: &str) -> Result<UploadedTorrent> {
    if let Some(caps) = UPLOAD_RE.captures(body) {
        return Ok(serde_json::from_str(&caps[1])?);
    }
    if UPLOAD_EXISTS_RE.is_match(body) {
        return Err(Error::TaskAlreadyExists);
    }
    Err(Error::InvalidResponse("torrent_upload"))
}

/// Result of a rename request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RenameReply {
    #[serde(deserialize_with = "lenient::int")]
    pub result: i64,
    #[serde(rename = "taskid", deserialize_with = "lenient::string")]
    pub task_id: String,
    #[serde(rename = "filename", deserialize_with = "lenient::string")]
    pub file_name: String,
}

/// Decodes the one-character-wrapped JSON of a rename answer.
///
/// # Errors
///
/// Returns [`Error::RenameFailed`] for a non-zero result and
/// [`Error::InvalidResponse`] for a body too short to unwrap.
pub fn rename(body: &str) -> Result<RenameReply> {
    let body = body.trim();
    let mut chars = body.chars();
    let (Some(_), Some(_)) = (chars.next(), chars.next_back()) else {
        return Err(Error::InvalidResponse("rename"));
    };
    let reply: RenameReply = serde_json::from_str(chars.as_str())?;
    if reply.result != 0 {
        return Err(Error::RenameFailed(reply.result));
    }
    Ok(reply)
}
