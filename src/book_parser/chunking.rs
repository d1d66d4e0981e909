//! 分块导出：把章节文本切成固定大小、带重叠的块，便于下游 LLM 处理。

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::base_system::context::Config;
use crate::download::dispatch::{ChunkSplitter, RenderContext};

use super::html_utils::html_to_text;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// 单块字符数上限（按词累积，单个超长词不截断）。
    pub max_chars: usize,
    /// 相邻块之间保留的尾部重叠字符数。
    pub overlap_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chars: 4000,
            overlap_chars: 200,
        }
    }
}

impl ChunkConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_chars: config.chunk_max_chars.max(1),
            overlap_chars: config.chunk_overlap_chars,
        }
    }
}

/// 词边界切块：累积词直到超过上限，下一块以上一块的尾部词作为重叠开头。
pub(crate) fn split_text(text: &str, config: &ChunkConfig) -> Vec<String> {
    let max = config.max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > max {
            let tail = overlap_tail(&current, config.overlap_chars);
            chunks.push(std::mem::take(&mut current));
            current = tail;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

fn overlap_tail(chunk: &str, overlap_chars: usize) -> String {
    if overlap_chars == 0 {
        return String::new();
    }
    let mut tail: Vec<&str> = Vec::new();
    let mut len = 0usize;
    for word in chunk.split_whitespace().rev() {
        let added = word.len() + usize::from(!tail.is_empty());
        if len + added > overlap_chars {
            break;
        }
        len += added;
        tail.push(word);
    }
    tail.reverse();
    tail.join(" ")
}

// ── 生成器 ────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ChunkGenerator;

impl ChunkGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl ChunkSplitter for ChunkGenerator {
    fn generate(&self, ctx: &RenderContext<'_>, config: Option<&ChunkConfig>) -> Result<PathBuf> {
        let cfg = config.cloned().unwrap_or_default();
        let path = ctx.book_dir.join("chunks.jsonl");
        let file = File::create(&path)
            .with_context(|| format!("create chunk file {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        let mut chunk_index = 0usize;
        for (chapter_index, content) in ctx.contents.iter().enumerate() {
            let text = html_to_text(&content.body);
            for chunk in split_text(&text, &cfg) {
                let record = json!({
                    "book_id": ctx.meta.id,
                    "chunk_index": chunk_index,
                    "chapter_index": chapter_index,
                    "chapter_title": content.title,
                    "text": chunk,
                });
                serde_json::to_writer(&mut writer, &record)?;
                writer.write_all(b"\n")?;
                chunk_index += 1;
            }
        }
        writer.flush()?;

        debug!(target: "generate", chunks = chunk_index, "分块导出完成");
        Ok(path)
    }
}
