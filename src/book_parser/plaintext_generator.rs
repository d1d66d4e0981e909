//! 纯文本生成器。
//!
//! 单文件模式输出 `<书名>.txt`；分章模式输出 `Text/` 目录下的逐章文件。

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use crate::base_system::context::safe_fs_name;
use crate::download::dispatch::{PlaintextGenerator, RenderContext};

use super::html_utils::html_to_text;

#[derive(Debug, Default)]
pub struct PlaintextRenderer;

impl PlaintextRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl PlaintextGenerator for PlaintextRenderer {
    fn generate(&self, ctx: &RenderContext<'_>, single_file: bool) -> Result<PathBuf> {
        if single_file {
            let path = ctx
                .book_dir
                .join(format!("{}.txt", safe_fs_name(&ctx.meta.title, "_", 120)));

            let mut out = String::new();
            out.push_str(&ctx.meta.title);
            out.push('\n');
            if !ctx.meta.authors.is_empty() {
                out.push_str(&ctx.meta.authors.join(", "));
                out.push('\n');
            }
            out.push_str("\n\n");

            for content in ctx.contents {
                out.push_str(&content.title);
                out.push('\n');
                out.push_str(&"=".repeat(content.title.chars().count().clamp(4, 72)));
                out.push_str("\n\n");
                out.push_str(&html_to_text(&content.body));
                out.push_str("\n\n\n");
            }

            fs::write(&path, out.trim_end().to_string() + "\n")
                .with_context(|| format!("write plaintext {}", path.display()))?;
            debug!(target: "generate", path = %path.display(), "纯文本生成完成");
            return Ok(path);
        }

        let text_dir = ctx.book_dir.join("Text");
        fs::create_dir_all(&text_dir)
            .with_context(|| format!("create text dir {}", text_dir.display()))?;
        for (i, content) in ctx.contents.iter().enumerate() {
            let name = format!("{:03}_{}.txt", i + 1, safe_fs_name(&content.title, "_", 60));
            let body = format!("{}\n\n{}\n", content.title, html_to_text(&content.body));
            fs::write(text_dir.join(&name), body)
                .with_context(|| format!("write chapter text {name}"))?;
        }
        debug!(target: "generate", chapters = ctx.contents.len(), "分章纯文本生成完成");
        Ok(text_dir)
    }
}
