//! 远端书库 API 客户端。
//!
//! 元数据 `/api/v1/book/{id}/`、搜索 `/api/v2/search/`、章节列表
//! `/api/v1/book/{id}/chapter/`（带分页）、目录 `/api/v1/book/{id}/toc/`，
//! 以及按 URL 直接抓取章节正文。字段提取对键名做候选匹配，容忍接口
//! 各版本之间的差异。

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, CONNECTION, COOKIE, HeaderMap, HeaderValue, USER_AGENT,
};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::base_system::context::Config;
use crate::download::models::{BookMetadata, ChapterNode, TocEntry, TocStructure};
use crate::download::sources::{ChapterSource, MetadataSource};

#[derive(Debug, Clone)]
pub struct ShelfApiConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub max_retries: usize,
    pub user_agent: String,
    pub session_cookie: Option<String>,
}

impl Default for ShelfApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://learning.oreilly.com".to_string(),
            request_timeout: Duration::from_secs(15),
            max_retries: 3,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120 Safari/537.36".to_string(),
            session_cookie: None,
        }
    }
}

impl ShelfApiConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.source_host.clone(),
            request_timeout: Duration::from_secs(config.request_timeout.max(1)),
            max_retries: config.max_retries.max(1) as usize,
            user_agent: config.user_agent.clone(),
            session_cookie: if config.session_cookie.trim().is_empty() {
                None
            } else {
                Some(config.session_cookie.clone())
            },
        }
    }
}

#[derive(Clone)]
pub struct ShelfApiClient {
    client: Client,
    config: ShelfApiConfig,
}

impl ShelfApiClient {
    pub fn new(config: ShelfApiConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        default_headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .unwrap_or(HeaderValue::from_static("Mozilla/5.0")),
        );
        if let Some(cookie) = config.session_cookie.as_deref()
            && let Ok(value) = HeaderValue::from_str(cookie)
        {
            default_headers.insert(COOKIE, value);
        }

        let client = Client::builder()
            .default_headers(default_headers)
            .timeout(config.request_timeout)
            .build()
            .context("build http client")?;

        Ok(Self { client, config })
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// 根相对链接补全为绝对链接。
    fn absolutize(&self, url: &str) -> String {
        if url.starts_with('/') {
            format!("{}{}", self.base(), url)
        } else {
            url.to_string()
        }
    }

    fn get_with_retry(&self, url: &str, accept: &'static str) -> Result<String> {
        let attempts = self.config.max_retries.max(1);
        let mut delay = Duration::from_millis(500);
        let mut last_err = None;

        for attempt in 0..attempts {
            let sent = self
                .client
                .get(url)
                .header(ACCEPT, HeaderValue::from_static(accept))
                .send()
                .and_then(|resp| resp.error_for_status())
                .map_err(anyhow::Error::from)
                .and_then(|resp| resp.text().map_err(anyhow::Error::from));

            match sent {
                Ok(text) => return Ok(text),
                Err(err) => {
                    warn!(target: "network", url, attempt, error = %err, "请求失败");
                    last_err = Some(err);
                    if attempt + 1 < attempts {
                        thread::sleep(delay);
                        delay = (delay * 2).min(Duration::from_secs(8));
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("request failed: {url}")))
    }

    fn get_json(&self, url: &str) -> Result<Value> {
        let text = self.get_with_retry(url, "application/json, text/plain, */*")?;
        serde_json::from_str(&text).with_context(|| format!("invalid json from {url}"))
    }
}

impl MetadataSource for ShelfApiClient {
    fn fetch(&self, book_id: &str) -> Result<BookMetadata> {
        let url = format!("{}/api/v1/book/{}/", self.base(), book_id);
        debug!(target: "network", %url, "拉取书籍元数据");
        let value = self.get_json(&url)?;
        let meta = parse_book_metadata(&value, book_id);
        if meta.title.is_empty() {
            return Err(anyhow!("metadata for `{book_id}` has no title"));
        }
        Ok(meta)
    }

    fn search(&self, query: &str) -> Result<Vec<BookMetadata>> {
        let mut url =
            Url::parse(&format!("{}/api/v2/search/", self.base())).context("build search url")?;
        url.query_pairs_mut()
            .append_pair("query", query)
            .append_pair("limit", "10");
        debug!(target: "network", %url, "搜索书籍");

        let value = self.get_json(url.as_str())?;
        let results = value
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(results
            .iter()
            .map(|item| {
                let fallback = pick_string(item, &["archive_id", "id", "identifier"])
                    .unwrap_or_default();
                parse_book_metadata(item, &fallback)
            })
            .filter(|m| !m.id.is_empty())
            .collect())
    }
}

impl ChapterSource for ShelfApiClient {
    fn fetch_list(&self, book_id: &str) -> Result<Vec<ChapterNode>> {
        let mut url = format!("{}/api/v1/book/{}/chapter/", self.base(), book_id);
        let mut chapters = Vec::new();

        // 章节接口分页返回，顺着 next 链接翻到底。
        loop {
            let value = self.get_json(&url)?;
            let page = value
                .get("results")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            chapters.extend(page.iter().filter_map(parse_chapter_node));

            match value.get("next").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => url = self.absolutize(next),
                _ => break,
            }
        }

        if chapters.is_empty() {
            return Err(anyhow!("chapter list for `{book_id}` is empty"));
        }
        debug!(target: "network", book_id, count = chapters.len(), "章节列表拉取完成");
        Ok(chapters)
    }

    fn fetch_toc(&self, book_id: &str) -> Result<TocStructure> {
        let url = format!("{}/api/v1/book/{}/toc/", self.base(), book_id);
        let value = self.get_json(&url)?;
        let entries = match &value {
            Value::Array(items) => items.iter().filter_map(parse_toc_entry).collect(),
            other => other
                .get("toc")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(parse_toc_entry).collect())
                .unwrap_or_default(),
        };
        Ok(entries)
    }

    fn fetch_content(&self, content_url: &str) -> Result<String> {
        let url = self.absolutize(content_url);
        self.get_with_retry(
            &url,
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        )
    }
}

// ── JSON 字段提取 ──────────────────────────────────────────────

fn pick_string(value: &Value, keys: &[&str]) -> Option<String> {
    let map = value.as_object()?;
    for key in keys {
        if let Some(val) = map.get(*key) {
            if let Some(s) = val.as_str() {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            } else if let Some(n) = val.as_i64() {
                return Some(n.to_string());
            }
        }
    }
    None
}

/// 名字列表：元素可以是字符串，也可以是带 `name` 字段的对象。
fn pick_names(value: &Value, keys: &[&str]) -> Vec<String> {
    let Some(map) = value.as_object() else {
        return Vec::new();
    };
    for key in keys {
        let Some(arr) = map.get(*key).and_then(Value::as_array) else {
            continue;
        };
        let names: Vec<String> = arr
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .or_else(|| pick_string(item, &["name"]))
            })
            .filter(|s| !s.trim().is_empty())
            .collect();
        if !names.is_empty() {
            return names;
        }
    }
    Vec::new()
}

/// URL 列表：元素可以是字符串，也可以是带 `url`/`full_path` 的对象。
fn pick_urls(value: &Value, keys: &[&str]) -> Vec<String> {
    let Some(map) = value.as_object() else {
        return Vec::new();
    };
    for key in keys {
        let Some(arr) = map.get(*key).and_then(Value::as_array) else {
            continue;
        };
        let urls: Vec<String> = arr
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .or_else(|| pick_string(item, &["url", "full_path"]))
            })
            .filter(|s| !s.trim().is_empty())
            .collect();
        if !urls.is_empty() {
            return urls;
        }
    }
    Vec::new()
}

pub(crate) fn parse_book_metadata(value: &Value, fallback_id: &str) -> BookMetadata {
    BookMetadata {
        id: pick_string(value, &["identifier", "archive_id", "id", "isbn"])
            .unwrap_or_else(|| fallback_id.to_string()),
        title: pick_string(value, &["title", "book_title", "name"]).unwrap_or_default(),
        authors: pick_names(value, &["authors", "author"]),
        cover_url: pick_string(value, &["cover", "cover_url", "cover_image"]),
        description: pick_string(value, &["description", "desc", "abstract", "summary"]),
        publisher: pick_names(value, &["publishers", "publisher"]).into_iter().next(),
        isbn: pick_string(value, &["isbn", "isbn13"]),
    }
}

pub(crate) fn parse_chapter_node(value: &Value) -> Option<ChapterNode> {
    let title = pick_string(value, &["title", "label", "name"])?;
    let filename = pick_string(value, &["filename", "full_path", "path"]).unwrap_or_default();
    let id = pick_string(value, &["id", "identifier"]).unwrap_or_else(|| filename.clone());
    if id.trim().is_empty() {
        return None;
    }

    let children = value
        .get("children")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_chapter_node).collect())
        .unwrap_or_default();

    Some(ChapterNode {
        id,
        title,
        content_url: pick_string(value, &["content", "content_url", "web_url"])
            .unwrap_or_default(),
        filename,
        stylesheets: pick_urls(value, &["stylesheets"]),
        images: pick_urls(value, &["images"]),
        children,
    })
}

fn parse_toc_entry(value: &Value) -> Option<TocEntry> {
    let title = pick_string(value, &["label", "title", "name"])?;
    let children = value
        .get("children")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_toc_entry).collect())
        .unwrap_or_default();
    Some(TocEntry {
        title,
        href: pick_string(value, &["href", "url", "id"]).unwrap_or_default(),
        children,
    })
}
