//! HTML/XHTML 文本处理工具。
//!
//! 转义、实体解码、标签剥离等纯文本操作，供改写器与各生成器共用。

use regex::Regex;
use std::sync::OnceLock;

use url::Url;

use crate::base_system::context::safe_fs_name;

// 编译一次复用的正则缓存
pub(crate) fn re_img_tag() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?is)<img\b[^>]*?>").unwrap())
}

pub(crate) fn re_src_attr() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r#"(?is)\bsrc\s*=\s*['"]([^'"]+)['"]"#).unwrap())
}

pub(crate) fn re_all_tags() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?is)<[^>]+>").unwrap())
}

fn re_html_comment() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").unwrap())
}

// ── 转义与实体 ──────────────────────────────────────────────────

pub(crate) fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

pub(crate) fn decode_attr_url(src: &str) -> std::borrow::Cow<'_, str> {
    if src.contains("&amp;") {
        return std::borrow::Cow::Owned(src.replace("&amp;", "&"));
    }
    std::borrow::Cow::Borrowed(src)
}

pub(crate) fn unescape_basic_entities(s: &str) -> std::borrow::Cow<'_, str> {
    if !(s.contains("&amp;")
        || s.contains("&lt;")
        || s.contains("&gt;")
        || s.contains("&quot;")
        || s.contains("&#34;")
        || s.contains("&#39;")
        || s.contains("&#x27;")
        || s.contains("&nbsp;"))
    {
        return std::borrow::Cow::Borrowed(s);
    }

    std::borrow::Cow::Owned(
        s.replace("&nbsp;", " ")
            .replace("&quot;", "\"")
            .replace("&#34;", "\"")
            .replace("&#39;", "'")
            .replace("&#x27;", "'")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&amp;", "&"),
    )
}

// ── 块级清理 ────────────────────────────────────────────────────

/// 整块移除 `<script>` 与 `<style>`（含其内容）。
pub(crate) fn strip_script_and_style_blocks(html: &str) -> String {
    fn remove_tag_block(input: &str, tag: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let lower = input.to_ascii_lowercase();
        let open_pat = format!("<{}", tag);
        let close_pat = format!("</{}>", tag);

        let mut i = 0;
        while i < input.len() {
            if lower[i..].starts_with(&open_pat) {
                if let Some(close_pos) = lower[i..].find(&close_pat) {
                    i += close_pos + close_pat.len();
                    continue;
                } else {
                    break;
                }
            }

            let ch = input[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }

        out
    }

    let without_script = remove_tag_block(html, "script");
    remove_tag_block(&without_script, "style")
}

pub(crate) fn strip_html_comments(html: &str) -> String {
    re_html_comment().replace_all(html, "").to_string()
}

/// 取 `<body>` 内部片段；没有 body 时原样返回。
pub(crate) fn extract_body_fragment(input: &str) -> String {
    let lower = input.to_lowercase();
    if let Some(body_idx) = lower.find("<body")
        && let Some(open_end) = lower[body_idx..].find('>')
    {
        let start = body_idx + open_end + 1;
        if let Some(close_idx) = lower[start..].find("</body>") {
            return input[start..start + close_idx].to_string();
        }
    }
    input.to_string()
}

// ── 纯文本化 ────────────────────────────────────────────────────

/// 粗暴去标签转纯文本：块级标签换行、实体解码、压缩空行。
pub(crate) fn html_to_text(html: &str) -> String {
    let cleaned = strip_script_and_style_blocks(html);
    let cleaned = strip_html_comments(&cleaned);

    // 换行语义：<br> 单断行，块级结束标签是段落边界
    static R_BR: OnceLock<Regex> = OnceLock::new();
    static R_BLOCK: OnceLock<Regex> = OnceLock::new();
    let re_br = R_BR.get_or_init(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
    let re_block = R_BLOCK
        .get_or_init(|| Regex::new(r"(?i)</(p|div|h[1-6]|li|tr|blockquote|pre)>").unwrap());
    let with_breaks = re_br.replace_all(&cleaned, "\n");
    let with_breaks = re_block.replace_all(&with_breaks, "\n\n");

    let no_tags = re_all_tags().replace_all(&with_breaks, "");
    let unescaped = unescape_basic_entities(no_tags.as_ref());

    let mut out = Vec::new();
    let mut blank_run = 0usize;
    for line in unescaped.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push(String::new());
            }
        } else {
            blank_run = 0;
            out.push(trimmed.to_string());
        }
    }
    while out.last().is_some_and(String::is_empty) {
        out.pop();
    }
    out.join("\n")
}

// ── 图片本地名 ──────────────────────────────────────────────────

/// 从图片 URL 推导本地文件名：取路径最后一段，去掉查询串并做
/// 文件系统净化。
pub(crate) fn image_local_name(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or("").to_string(),
    };
    let name = path.rsplit('/').next().unwrap_or("").trim();
    if name.is_empty() {
        "image".to_string()
    } else {
        safe_fs_name(name, "_", 120)
    }
}
