//! Markdown 生成器：正文 HTML 降级转换为 Markdown。
//!
//! 覆盖标题、段落、强调、行内代码/代码块、列表、链接与图片；
//! 其余标签剥离。输出放在书籍目录的 `Markdown/` 下。

use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use tracing::debug;

use crate::base_system::context::safe_fs_name;
use crate::download::dispatch::{MarkdownGenerator, RenderContext};

use super::html_utils::{
    re_all_tags, re_src_attr, strip_html_comments, strip_script_and_style_blocks,
    unescape_basic_entities,
};

#[derive(Debug, Default)]
pub struct MarkdownRenderer;

impl MarkdownRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl MarkdownGenerator for MarkdownRenderer {
    fn generate_book(&self, ctx: &RenderContext<'_>, per_chapter: bool) -> Result<PathBuf> {
        let md_dir = ctx.book_dir.join("Markdown");
        fs::create_dir_all(&md_dir)
            .with_context(|| format!("create markdown dir {}", md_dir.display()))?;

        let mut combined = format!("# {}\n", ctx.meta.title);
        if !ctx.meta.authors.is_empty() {
            combined.push_str(&format!("\n*{}*\n", ctx.meta.authors.join(", ")));
        }

        for (i, content) in ctx.contents.iter().enumerate() {
            let markdown = html_to_markdown(&content.body);
            combined.push_str(&format!("\n\n## {}\n\n{}\n", content.title, markdown));

            if per_chapter {
                let name = format!("{:03}_{}.md", i + 1, safe_fs_name(&content.title, "_", 60));
                fs::write(
                    md_dir.join(&name),
                    format!("# {}\n\n{}\n", content.title, markdown),
                )
                .with_context(|| format!("write chapter markdown {name}"))?;
            }
        }

        let book_file = md_dir.join(format!("{}.md", safe_fs_name(&ctx.meta.title, "_", 120)));
        fs::write(&book_file, combined)
            .with_context(|| format!("write book markdown {}", book_file.display()))?;

        debug!(target: "generate", chapters = ctx.contents.len(), per_chapter, "Markdown 生成完成");
        Ok(md_dir)
    }
}

// ── HTML → Markdown ────────────────────────────────────────────

fn inner_text(html: &str) -> String {
    let stripped = re_all_tags().replace_all(html, "");
    unescape_basic_entities(stripped.as_ref()).trim().to_string()
}

pub(crate) fn html_to_markdown(html: &str) -> String {
    let s = strip_script_and_style_blocks(html);
    let mut s = strip_html_comments(&s);

    static R_PRE: OnceLock<Regex> = OnceLock::new();
    static R_HEAD: OnceLock<Regex> = OnceLock::new();
    static R_LI: OnceLock<Regex> = OnceLock::new();
    static R_STRONG: OnceLock<Regex> = OnceLock::new();
    static R_EM: OnceLock<Regex> = OnceLock::new();
    static R_CODE: OnceLock<Regex> = OnceLock::new();
    static R_A: OnceLock<Regex> = OnceLock::new();
    static R_IMG: OnceLock<Regex> = OnceLock::new();
    static R_BR: OnceLock<Regex> = OnceLock::new();
    static R_PARA: OnceLock<Regex> = OnceLock::new();

    let re_pre = R_PRE.get_or_init(|| Regex::new(r"(?is)<pre\b[^>]*>(.*?)</pre>").unwrap());
    s = re_pre
        .replace_all(&s, |caps: &Captures| {
            format!("\n```\n{}\n```\n", inner_text(&caps[1]))
        })
        .to_string();

    let re_head =
        R_HEAD.get_or_init(|| Regex::new(r"(?is)<h([1-6])\b[^>]*>(.*?)</h[1-6]>").unwrap());
    s = re_head
        .replace_all(&s, |caps: &Captures| {
            let level: usize = caps[1].parse().unwrap_or(2);
            format!("\n\n{} {}\n\n", "#".repeat(level), inner_text(&caps[2]))
        })
        .to_string();

    let re_li = R_LI.get_or_init(|| Regex::new(r"(?is)<li\b[^>]*>(.*?)</li>").unwrap());
    s = re_li
        .replace_all(&s, |caps: &Captures| {
            format!("\n- {}", inner_text(&caps[1]))
        })
        .to_string();

    let re_img = R_IMG.get_or_init(|| Regex::new(r"(?is)<img\b[^>]*?>").unwrap());
    s = re_img
        .replace_all(&s, |caps: &Captures| {
            match re_src_attr().captures(&caps[0]).and_then(|c| c.get(1)) {
                Some(src) => format!("![]({})", src.as_str()),
                None => String::new(),
            }
        })
        .to_string();

    let re_a = R_A.get_or_init(|| {
        Regex::new(r#"(?is)<a\b[^>]*?href\s*=\s*['"]([^'"]+)['"][^>]*>(.*?)</a>"#).unwrap()
    });
    s = re_a
        .replace_all(&s, |caps: &Captures| {
            let text = inner_text(&caps[2]);
            if text.is_empty() {
                String::new()
            } else {
                format!("[{}]({})", text, &caps[1])
            }
        })
        .to_string();

    let re_strong =
        R_STRONG.get_or_init(|| Regex::new(r"(?is)<(?:strong|b)\b[^>]*>(.*?)</(?:strong|b)>").unwrap());
    s = re_strong
        .replace_all(&s, |caps: &Captures| format!("**{}**", inner_text(&caps[1])))
        .to_string();

    let re_em = R_EM.get_or_init(|| Regex::new(r"(?is)<(?:em|i)\b[^>]*>(.*?)</(?:em|i)>").unwrap());
    s = re_em
        .replace_all(&s, |caps: &Captures| format!("*{}*", inner_text(&caps[1])))
        .to_string();

    let re_code = R_CODE.get_or_init(|| Regex::new(r"(?is)<code\b[^>]*>(.*?)</code>").unwrap());
    s = re_code
        .replace_all(&s, |caps: &Captures| format!("`{}`", inner_text(&caps[1])))
        .to_string();

    let re_br = R_BR.get_or_init(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
    s = re_br.replace_all(&s, "\n").to_string();

    let re_para =
        R_PARA.get_or_init(|| Regex::new(r"(?i)</(?:p|div|blockquote|ul|ol|table|tr)>").unwrap());
    s = re_para.replace_all(&s, "\n\n").to_string();

    let s = re_all_tags().replace_all(&s, "");
    let s = unescape_basic_entities(s.as_ref());

    collapse_blank_lines(&s)
}

fn collapse_blank_lines(s: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut blank_run = 0usize;
    for line in s.lines() {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() {
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push("");
            }
        } else {
            blank_run = 0;
            out.push(trimmed);
        }
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n").trim_start().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_paragraphs_and_emphasis_convert() {
        let html = "<h2>Intro</h2><p>Some <strong>bold</strong> and <em>italic</em> text.</p>";
        let md = html_to_markdown(html);
        assert!(md.contains("## Intro"));
        assert!(md.contains("**bold**"));
        assert!(md.contains("*italic*"));
    }

    #[test]
    fn links_images_and_code_convert() {
        let html = r#"<p>See <a href="https://example.com/x">the docs</a>: <code>let x = 1;</code></p><img src="Images/f1.png"/>"#;
        let md = html_to_markdown(html);
        assert!(md.contains("[the docs](https://example.com/x)"));
        assert!(md.contains("`let x = 1;`"));
        assert!(md.contains("![](Images/f1.png)"));
    }

    #[test]
    fn pre_blocks_become_fenced_code() {
        let md = html_to_markdown("<pre><code>fn main() {}\n</code></pre>");
        assert!(md.contains("```\nfn main() {}\n```"));
    }

    #[test]
    fn list_items_get_dashes() {
        let md = html_to_markdown("<ul><li>one</li><li>two</li></ul>");
        assert!(md.contains("- one"));
        assert!(md.contains("- two"));
    }
}
