//! 书籍 ID/链接解析与规范化。
//!
//! 接受纯数字 ID（通常是 ISBN-13）、书库页面链接或带 ISBN 参数的链接。

use regex::Regex;
use std::sync::OnceLock;

static RE_URL: OnceLock<Regex> = OnceLock::new();
static RE_VIEW: OnceLock<Regex> = OnceLock::new();
static RE_QS: OnceLock<Regex> = OnceLock::new();

fn re_url() -> &'static Regex {
    RE_URL.get_or_init(|| Regex::new(r"https?://\S+").expect("compile RE_URL"))
}

fn re_view() -> &'static Regex {
    // /library/view/<slug>/<id>/ 或 /videos/<slug>/<id>
    RE_VIEW.get_or_init(|| {
        Regex::new(r"/(?:library/view|videos|course)/[^/]+/([0-9Xx][0-9Xx-]{8,16})")
            .expect("compile RE_VIEW")
    })
}

fn re_qs() -> &'static Regex {
    RE_QS.get_or_init(|| Regex::new(r"(?i)(isbn|book_id)=([0-9Xx-]{9,17})").expect("compile RE_QS"))
}

pub fn parse_book_id(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Some(trimmed.to_string());
    }

    // If user pasted extra text around the URL, try to extract URL first.
    let target = re_url()
        .find(trimmed)
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    if let Some(caps) = re_view().captures(target) {
        return caps.get(1).map(|m| m.as_str().replace('-', ""));
    }

    if let Some(caps) = re_qs().captures(target) {
        return caps.get(2).map(|m| m.as_str().replace('-', ""));
    }

    None
}
