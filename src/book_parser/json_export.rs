//! 结构化导出：`book.json`（整书文档）与可选的 `book.jsonl`（逐章记录）。

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::debug;

use crate::download::dispatch::{JsonExporter, RenderContext};

use super::html_utils::html_to_text;

#[derive(Debug, Default)]
pub struct JsonExportGenerator;

impl JsonExportGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl JsonExporter for JsonExportGenerator {
    fn generate(&self, ctx: &RenderContext<'_>, include_jsonl: bool) -> Result<PathBuf> {
        let chapters: Vec<serde_json::Value> = ctx
            .contents
            .iter()
            .enumerate()
            .map(|(i, content)| {
                json!({
                    "index": i,
                    "filename": content.filename,
                    "title": content.title,
                    "text": html_to_text(&content.body),
                    "html": content.body,
                })
            })
            .collect();

        let book = json!({
            "id": ctx.meta.id,
            "title": ctx.meta.title,
            "authors": ctx.meta.authors,
            "publisher": ctx.meta.publisher,
            "isbn": ctx.meta.isbn,
            "description": ctx.meta.description,
        });

        let path = ctx.book_dir.join("book.json");
        let file =
            File::create(&path).with_context(|| format!("create {}", path.display()))?;
        serde_json::to_writer_pretty(
            BufWriter::new(file),
            &json!({
                "book": book,
                "chapter_count": chapters.len(),
                "chapters": chapters,
            }),
        )
        .context("serialize book.json")?;

        if include_jsonl {
            let jsonl_path = ctx.book_dir.join("book.jsonl");
            let file = File::create(&jsonl_path)
                .with_context(|| format!("create {}", jsonl_path.display()))?;
            let mut writer = BufWriter::new(file);

            // 首行书籍记录，其后每章一行
            serde_json::to_writer(&mut writer, &json!({"type": "book", "book": book}))?;
            writer.write_all(b"\n")?;
            for chapter in &chapters {
                serde_json::to_writer(
                    &mut writer,
                    &json!({"type": "chapter", "chapter": chapter}),
                )?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }

        debug!(target: "generate", chapters = ctx.contents.len(), include_jsonl, "JSON 导出完成");
        Ok(path)
    }
}
