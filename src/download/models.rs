//! 下载相关的数据模型定义。
//!
//! 包含书籍元数据、章节树节点、资源清单、进度快照、下载结果等核心数据结构。

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::book_parser::chunking::ChunkConfig;

use super::formats::OutputFormat;

/// 书籍元数据（由远端元数据接口返回）。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookMetadata {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub isbn: Option<String>,
}

/// 章节树节点。由远端章节接口返回，核心侧只读。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChapterNode {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content_url: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub stylesheets: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub children: Vec<ChapterNode>,
}

/// 目录树条目（仅透传给整书级生成器使用）。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub children: Vec<TocEntry>,
}

pub type TocStructure = Vec<TocEntry>;

/// 处理完成的单章内容。
#[derive(Debug, Clone, Serialize)]
pub struct ChapterContent {
    pub filename: String,
    pub title: String,
    pub body: String,
}

// ── 资源清单 ──────────────────────────────────────────────────

/// 样式表与图片 URL 的去重清单。
///
/// 单次下载内只增不减。本地样式表文件名由**最终**插入顺序一次性确定，
/// 章节文档在清单冻结之后才统一写出引用，保证同一样式表在所有章节里
/// 拿到同一个编号。
#[derive(Debug, Default)]
pub struct AssetManifest {
    css_urls: Vec<String>,
    css_seen: HashSet<String>,
    image_urls: Vec<String>,
    image_seen: HashSet<String>,
}

impl AssetManifest {
    /// 记录一章的资源引用：样式表来自章节自身声明；图片来自章节声明与
    /// 正文改写阶段发现的 URL 的并集（发现项仅收绝对或根相对地址，
    /// 其余视为已本地化的引用直接丢弃）。
    pub fn record_chapter_assets(&mut self, chapter: &ChapterNode, discovered_images: &[String]) {
        for url in &chapter.stylesheets {
            self.add_css(url);
        }
        for url in &chapter.images {
            self.add_image(url);
        }
        for url in discovered_images {
            if url.starts_with("http") || url.starts_with('/') {
                self.add_image(url);
            }
        }
    }

    fn add_css(&mut self, url: &str) {
        let trimmed = url.trim();
        if !trimmed.is_empty() && self.css_seen.insert(trimmed.to_string()) {
            self.css_urls.push(trimmed.to_string());
        }
    }

    fn add_image(&mut self, url: &str) {
        let trimmed = url.trim();
        if !trimmed.is_empty() && self.image_seen.insert(trimmed.to_string()) {
            self.image_urls.push(trimmed.to_string());
        }
    }

    pub fn css_urls(&self) -> &[String] {
        &self.css_urls
    }

    pub fn image_urls(&self) -> &[String] {
        &self.image_urls
    }

    /// 全部样式表的本地引用名，按插入顺序编号。
    pub fn css_refs(&self) -> Vec<String> {
        (0..self.css_urls.len()).map(css_local_ref).collect()
    }

    /// 根相对（`/` 开头）的图片地址补全为绝对地址，其余原样返回。
    pub fn absolute_image_urls(&self, source_host: &str) -> Vec<String> {
        let host = source_host.trim_end_matches('/');
        self.image_urls
            .iter()
            .map(|url| {
                if url.starts_with('/') {
                    format!("{host}{url}")
                } else {
                    url.clone()
                }
            })
            .collect()
    }

    pub fn asset_total(&self) -> usize {
        self.css_urls.len() + self.image_urls.len()
    }
}

/// 样式表在清单中的位置对应的本地引用名。
pub fn css_local_ref(index: usize) -> String {
    format!("Styles/Style{index:02}.css")
}

// ── 进度事件 ──────────────────────────────────────────────────

/// 流水线阶段状态机。严格顺序推进，不回退。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Starting,
    FetchingMetadata,
    FetchingChapters,
    DownloadingCover,
    ProcessingChapters,
    DownloadingAssets,
    GeneratingEpub,
    GeneratingMarkdown,
    GeneratingPdf,
    GeneratingPdfChapters,
    GeneratingPlaintext,
    GeneratingJson,
    GeneratingChunks,
    Completed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Starting => "starting",
            DownloadStatus::FetchingMetadata => "fetching_metadata",
            DownloadStatus::FetchingChapters => "fetching_chapters",
            DownloadStatus::DownloadingCover => "downloading_cover",
            DownloadStatus::ProcessingChapters => "processing_chapters",
            DownloadStatus::DownloadingAssets => "downloading_assets",
            DownloadStatus::GeneratingEpub => "generating_epub",
            DownloadStatus::GeneratingMarkdown => "generating_markdown",
            DownloadStatus::GeneratingPdf => "generating_pdf",
            DownloadStatus::GeneratingPdfChapters => "generating_pdf_chapters",
            DownloadStatus::GeneratingPlaintext => "generating_plaintext",
            DownloadStatus::GeneratingJson => "generating_json",
            DownloadStatus::GeneratingChunks => "generating_chunks",
            DownloadStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条进度事件。不可变快照，推送给调用方注册的回调后即丢弃。
#[derive(Debug, Clone, Serialize)]
pub struct DownloadProgress {
    pub status: DownloadStatus,
    pub percentage: u8,
    pub message: String,
    pub eta_seconds: Option<u64>,
    pub current_chapter: usize,
    pub total_chapters: usize,
    pub chapter_title: String,
    pub book_id: String,
}

// ── 下载结果 ──────────────────────────────────────────────────

/// 单个格式的输出路径（单文件或多文件）。
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutputPaths {
    Single(PathBuf),
    Many(Vec<PathBuf>),
}

/// 一次完整下载的结果。仅在流水线成功走完全部阶段时返回。
#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub book_id: String,
    pub title: String,
    pub output_dir: PathBuf,
    pub files: BTreeMap<String, OutputPaths>,
    pub chapters_count: usize,
}

// ── 错误 ──────────────────────────────────────────────────────

/// 下载失败的可区分出口：取消 / 结构错误 / 其他错误。
/// 只有取消会触发输出目录清理。
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled by user")]
    Cancelled,
    #[error("chapter tree contains a cycle at node `{0}`")]
    CyclicTree(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ── 下载选项 ──────────────────────────────────────────────────

/// `DownloadPipeline::download` 的调用选项。
pub struct DownloadOptions {
    pub formats: Vec<OutputFormat>,
    /// 扁平化序列中的下标子集（应用于扁平化之后、目录创建之前）。
    pub selected_chapters: Option<Vec<usize>>,
    pub skip_images: bool,
    pub chunk_config: Option<ChunkConfig>,
    /// 进度回调（同步推送；未注册时为空操作）。
    pub progress: Option<Box<dyn FnMut(DownloadProgress) + Send>>,
    /// 协作式取消判定，仅在章节边界轮询。
    pub cancel_check: Option<Box<dyn Fn() -> bool + Send>>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            formats: vec![OutputFormat::Epub],
            selected_chapters: None,
            skip_images: false,
            chunk_config: None,
            progress: None,
            cancel_check: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter_with_assets(css: &[&str], images: &[&str]) -> ChapterNode {
        ChapterNode {
            id: "ch".to_string(),
            title: "Chapter".to_string(),
            stylesheets: css.iter().map(|s| s.to_string()).collect(),
            images: images.iter().map(|s| s.to_string()).collect(),
            ..ChapterNode::default()
        }
    }

    #[test]
    fn manifest_dedupes_and_keeps_insertion_order() {
        let mut manifest = AssetManifest::default();
        manifest.record_chapter_assets(
            &chapter_with_assets(&["https://h/a.css", "https://h/b.css"], &[]),
            &[],
        );
        manifest.record_chapter_assets(
            &chapter_with_assets(&["https://h/b.css", "https://h/c.css"], &[]),
            &[],
        );

        assert_eq!(
            manifest.css_urls(),
            &["https://h/a.css", "https://h/b.css", "https://h/c.css"]
        );
        assert_eq!(
            manifest.css_refs(),
            vec![
                "Styles/Style00.css",
                "Styles/Style01.css",
                "Styles/Style02.css"
            ]
        );
    }

    #[test]
    fn manifest_filters_discovered_image_urls() {
        let mut manifest = AssetManifest::default();
        manifest.record_chapter_assets(
            &chapter_with_assets(&[], &["https://h/declared.png"]),
            &[
                "https://h/abs.png".to_string(),
                "/library/rel.png".to_string(),
                "Images/already-local.png".to_string(),
            ],
        );

        assert_eq!(
            manifest.image_urls(),
            &[
                "https://h/declared.png",
                "https://h/abs.png",
                "/library/rel.png"
            ]
        );
    }

    #[test]
    fn root_relative_images_get_absolute_host() {
        let mut manifest = AssetManifest::default();
        manifest.record_chapter_assets(
            &chapter_with_assets(&[], &["/covers/1.jpg", "https://cdn/x.jpg"]),
            &[],
        );

        assert_eq!(
            manifest.absolute_image_urls("https://learning.oreilly.com/"),
            vec![
                "https://learning.oreilly.com/covers/1.jpg",
                "https://cdn/x.jpg"
            ]
        );
    }
}
