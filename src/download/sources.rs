//! 流水线调用的外部协作者接口。
//!
//! 核心只定义契约：远端元数据/章节来源、正文改写器、资源下载器。
//! 真实实现位于 `network_parser` 与 `book_parser`，测试用桩实现替换。

use std::path::Path;

use anyhow::Result;

use super::models::{BookMetadata, ChapterNode, TocStructure};

/// 书籍元数据来源。
pub trait MetadataSource {
    fn fetch(&self, book_id: &str) -> Result<BookMetadata>;
    fn search(&self, query: &str) -> Result<Vec<BookMetadata>>;
}

/// 章节树与正文来源。
pub trait ChapterSource {
    fn fetch_list(&self, book_id: &str) -> Result<Vec<ChapterNode>>;
    fn fetch_toc(&self, book_id: &str) -> Result<TocStructure>;
    fn fetch_content(&self, content_url: &str) -> Result<String>;
}

/// 正文改写器：清理原始标记并收集图片引用。
pub trait ContentTransformer {
    /// 返回（处理后的正文片段, 改写过程中发现的图片 URL 列表）。
    fn process(
        &self,
        raw_markup: &str,
        book_id: &str,
        skip_images: bool,
    ) -> Result<(String, Vec<String>)>;

    /// 把正文片段包装为带样式引用的完整文档。
    fn wrap_document(&self, processed: &str, css_refs: &[String], title: &str) -> String;
}

/// 批量下载的进度回调：`(已完成数, 总数)`。
/// 下载器内部可以使用工作线程池，回调可能从任意线程到来。
pub type AssetProgress<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

/// 资源下载器。单个资源失败的处置策略由实现方自行决定，核心不重试。
pub trait AssetFetcher {
    fn download_image(&self, url: &str, dest: &Path) -> Result<()>;

    /// 按清单顺序下载样式表到 `dest_dir`，文件名为位置编号。
    fn download_all_css(
        &self,
        urls: &[String],
        dest_dir: &Path,
        on_progress: AssetProgress<'_>,
    ) -> Result<()>;

    fn download_all_images(
        &self,
        urls: &[String],
        dest_dir: &Path,
        on_progress: AssetProgress<'_>,
    ) -> Result<()>;
}
