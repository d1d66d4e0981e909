//! 正文改写器：清理原始章节标记并收集图片引用。
//!
//! 基于正则/字符串操作，不引入完整 HTML 解析器。改写产物中的图片一律
//! 指向 `Images/<本地名>`，与资源下载阶段写盘的命名一致。

use anyhow::Result;
use regex::Captures;
use tracing::debug;

use crate::download::sources::ContentTransformer;

use super::html_utils::{
    decode_attr_url, escape_html, extract_body_fragment, image_local_name, re_img_tag,
    re_src_attr, strip_html_comments, strip_script_and_style_blocks,
};

#[derive(Debug, Default)]
pub struct HtmlProcessor;

impl HtmlProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl ContentTransformer for HtmlProcessor {
    fn process(
        &self,
        raw_markup: &str,
        book_id: &str,
        skip_images: bool,
    ) -> Result<(String, Vec<String>)> {
        let body = extract_body_fragment(raw_markup);
        let body = strip_script_and_style_blocks(&body);
        let mut body = strip_html_comments(&body);

        // <br> 统一自闭合，保证 XHTML 合法
        body = body
            .replace("<br>", "<br/>")
            .replace("<br />", "<br/>")
            .replace("<BR>", "<br/>")
            .replace("<BR />", "<br/>");

        let mut discovered: Vec<String> = Vec::new();

        if skip_images {
            body = re_img_tag().replace_all(&body, "").to_string();
        } else {
            body = re_img_tag()
                .replace_all(&body, |caps: &Captures| {
                    let tag = caps.get(0).map(|m| m.as_str()).unwrap_or("");
                    let Some(src) = re_src_attr()
                        .captures(tag)
                        .and_then(|c| c.get(1))
                        .map(|m| decode_attr_url(m.as_str()).into_owned())
                    else {
                        return String::new();
                    };
                    if src.trim().is_empty() {
                        return String::new();
                    }
                    discovered.push(src.clone());
                    let local = format!("Images/{}", image_local_name(&src));
                    format!("<img alt=\"\" src=\"{}\"/>", escape_html(&local))
                })
                .to_string();
        }

        debug!(target: "transform", book_id, images = discovered.len(), "正文改写完成");
        Ok((body.trim().to_string(), discovered))
    }

    fn wrap_document(&self, processed: &str, css_refs: &[String], title: &str) -> String {
        let escaped_title = escape_html(title);
        let links: String = css_refs
            .iter()
            .map(|r| {
                format!(
                    "    <link href=\"{}\" rel=\"stylesheet\" type=\"text/css\"/>\n",
                    escape_html(r)
                )
            })
            .collect();
        format!(
            "<?xml version='1.0' encoding='utf-8'?>\n<!DOCTYPE html>\n<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"en\" xml:lang=\"en\">\n  <head>\n    <title>{}</title>\n{}  </head>\n  <body>\n{}\n  </body>\n</html>",
            escaped_title, links, processed
        )
    }
}
