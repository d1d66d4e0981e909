//! 格式生成分发。
//!
//! 按固定优先级（epub → markdown → pdf → plaintext → json → chunks）扇出到
//! 各格式生成器，与请求顺序无关。快速失败：任一生成器报错立即向上传播，
//! 其后的格式不再执行；已完成格式的产物留在磁盘上，不做回滚。

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::info;

use crate::book_parser::chunking::ChunkConfig;

use super::formats::OutputFormat;
use super::models::{
    AssetManifest, BookMetadata, ChapterContent, ChapterNode, DownloadResult, DownloadStatus,
    OutputPaths, TocStructure,
};
use super::progress::ProgressReporter;

/// 传给各格式生成器的只读上下文。
pub struct RenderContext<'a> {
    pub meta: &'a BookMetadata,
    pub chapters: &'a [ChapterNode],
    pub contents: &'a [ChapterContent],
    pub toc: &'a TocStructure,
    pub manifest: &'a AssetManifest,
    pub book_dir: &'a Path,
}

// ── 每格式一个生成器契约 ──────────────────────────────────────

pub trait EpubGenerator {
    fn generate(&self, ctx: &RenderContext<'_>) -> Result<PathBuf>;
}

pub trait MarkdownGenerator {
    fn generate_book(&self, ctx: &RenderContext<'_>, per_chapter: bool) -> Result<PathBuf>;
}

pub trait PdfGenerator {
    fn generate(&self, ctx: &RenderContext<'_>) -> Result<PathBuf>;
    fn generate_chapters(&self, ctx: &RenderContext<'_>) -> Result<Vec<PathBuf>>;
}

pub trait PlaintextGenerator {
    fn generate(&self, ctx: &RenderContext<'_>, single_file: bool) -> Result<PathBuf>;
}

pub trait JsonExporter {
    fn generate(&self, ctx: &RenderContext<'_>, include_jsonl: bool) -> Result<PathBuf>;
}

pub trait ChunkSplitter {
    fn generate(&self, ctx: &RenderContext<'_>, config: Option<&ChunkConfig>) -> Result<PathBuf>;
}

// ── 分发器 ────────────────────────────────────────────────────

pub(crate) struct FormatDispatcher<'a> {
    pub epub: &'a dyn EpubGenerator,
    pub markdown: &'a dyn MarkdownGenerator,
    pub pdf: &'a dyn PdfGenerator,
    pub plaintext: &'a dyn PlaintextGenerator,
    pub json: &'a dyn JsonExporter,
    pub chunks: &'a dyn ChunkSplitter,
}

impl FormatDispatcher<'_> {
    pub(crate) fn run(
        &self,
        requested: &[OutputFormat],
        ctx: &RenderContext<'_>,
        chunk_config: Option<&ChunkConfig>,
        reporter: &mut ProgressReporter,
        result: &mut DownloadResult,
    ) -> Result<()> {
        use OutputFormat::*;

        if requested.contains(&Epub) {
            reporter.report(DownloadStatus::GeneratingEpub, 90, "");
            info!(target: "generate", "生成 EPUB");
            let path = self.epub.generate(ctx)?;
            result
                .files
                .insert("epub".to_string(), OutputPaths::Single(path));
        }

        if requested.iter().any(|f| matches!(f, Markdown | MarkdownChapters)) {
            reporter.report(DownloadStatus::GeneratingMarkdown, 92, "");
            info!(target: "generate", "生成 Markdown");
            let per_chapter = requested.contains(&MarkdownChapters);
            let path = self.markdown.generate_book(ctx, per_chapter)?;
            result
                .files
                .insert("markdown".to_string(), OutputPaths::Single(path));
        }

        if requested.iter().any(|f| matches!(f, Pdf | PdfChapters)) {
            if requested.contains(&PdfChapters) {
                reporter.report(DownloadStatus::GeneratingPdfChapters, 95, "");
                info!(target: "generate", "生成分章 PDF");
                let paths = self.pdf.generate_chapters(ctx)?;
                result
                    .files
                    .insert("pdf".to_string(), OutputPaths::Many(paths));
            } else {
                reporter.report(DownloadStatus::GeneratingPdf, 95, "");
                info!(target: "generate", "生成 PDF");
                let path = self.pdf.generate(ctx)?;
                result
                    .files
                    .insert("pdf".to_string(), OutputPaths::Single(path));
            }
        }

        if requested.iter().any(|f| matches!(f, Plaintext | PlaintextChapters)) {
            reporter.report(DownloadStatus::GeneratingPlaintext, 96, "");
            info!(target: "generate", "生成纯文本");
            let single_file = !requested.contains(&PlaintextChapters);
            let path = self.plaintext.generate(ctx, single_file)?;
            result
                .files
                .insert("plaintext".to_string(), OutputPaths::Single(path));
        }

        if requested.contains(&Json) || requested.contains(&Jsonl) {
            reporter.report(DownloadStatus::GeneratingJson, 97, "");
            info!(target: "generate", "生成 JSON 导出");
            let path = self.json.generate(ctx, requested.contains(&Jsonl))?;
            result
                .files
                .insert("json".to_string(), OutputPaths::Single(path));
        }

        if requested.contains(&Chunks) {
            reporter.report(DownloadStatus::GeneratingChunks, 98, "");
            info!(target: "generate", "生成分块导出");
            let path = self.chunks.generate(ctx, chunk_config)?;
            result
                .files
                .insert("chunks".to_string(), OutputPaths::Single(path));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use anyhow::anyhow;

    use super::*;

    struct OkEpub;
    impl EpubGenerator for OkEpub {
        fn generate(&self, ctx: &RenderContext<'_>) -> Result<PathBuf> {
            let path = ctx.book_dir.join("book.epub");
            fs::write(&path, b"epub")?;
            Ok(path)
        }
    }

    struct FailingMarkdown;
    impl MarkdownGenerator for FailingMarkdown {
        fn generate_book(&self, _ctx: &RenderContext<'_>, _per_chapter: bool) -> Result<PathBuf> {
            Err(anyhow!("markdown renderer exploded"))
        }
    }

    struct CountingPdf(AtomicUsize);
    impl PdfGenerator for CountingPdf {
        fn generate(&self, ctx: &RenderContext<'_>) -> Result<PathBuf> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ctx.book_dir.join("book.pdf"))
        }
        fn generate_chapters(&self, _ctx: &RenderContext<'_>) -> Result<Vec<PathBuf>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    struct NoopPlaintext;
    impl PlaintextGenerator for NoopPlaintext {
        fn generate(&self, ctx: &RenderContext<'_>, _single_file: bool) -> Result<PathBuf> {
            Ok(ctx.book_dir.join("book.txt"))
        }
    }

    struct NoopJson(AtomicBool);
    impl JsonExporter for NoopJson {
        fn generate(&self, ctx: &RenderContext<'_>, include_jsonl: bool) -> Result<PathBuf> {
            self.0.store(include_jsonl, Ordering::SeqCst);
            Ok(ctx.book_dir.join("book.json"))
        }
    }

    struct NoopChunks;
    impl ChunkSplitter for NoopChunks {
        fn generate(
            &self,
            ctx: &RenderContext<'_>,
            _config: Option<&ChunkConfig>,
        ) -> Result<PathBuf> {
            Ok(ctx.book_dir.join("chunks.jsonl"))
        }
    }

    fn empty_result(dir: &Path) -> DownloadResult {
        DownloadResult {
            book_id: "1234".to_string(),
            title: "Book".to_string(),
            output_dir: dir.to_path_buf(),
            files: BTreeMap::new(),
            chapters_count: 0,
        }
    }

    #[test]
    fn second_format_failure_aborts_the_rest_keeping_earlier_output() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = BookMetadata::default();
        let toc = TocStructure::default();
        let manifest = AssetManifest::default();
        let ctx = RenderContext {
            meta: &meta,
            chapters: &[],
            contents: &[],
            toc: &toc,
            manifest: &manifest,
            book_dir: tmp.path(),
        };

        let pdf = CountingPdf(AtomicUsize::new(0));
        let json = NoopJson(AtomicBool::new(false));
        let dispatcher = FormatDispatcher {
            epub: &OkEpub,
            markdown: &FailingMarkdown,
            pdf: &pdf,
            plaintext: &NoopPlaintext,
            json: &json,
            chunks: &NoopChunks,
        };

        let mut reporter = ProgressReporter::new("1234", None);
        let mut result = empty_result(tmp.path());
        let outcome = dispatcher.run(
            &[OutputFormat::Epub, OutputFormat::Markdown, OutputFormat::Pdf],
            &ctx,
            None,
            &mut reporter,
            &mut result,
        );

        assert!(outcome.is_err());
        // epub 已经落盘，pdf 从未被调用
        assert!(tmp.path().join("book.epub").exists());
        assert_eq!(pdf.0.load(Ordering::SeqCst), 0);
        assert!(result.files.contains_key("epub"));
        assert!(!result.files.contains_key("pdf"));
    }

    #[test]
    fn jsonl_request_enables_jsonl_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = BookMetadata::default();
        let toc = TocStructure::default();
        let manifest = AssetManifest::default();
        let ctx = RenderContext {
            meta: &meta,
            chapters: &[],
            contents: &[],
            toc: &toc,
            manifest: &manifest,
            book_dir: tmp.path(),
        };

        let pdf = CountingPdf(AtomicUsize::new(0));
        let json = NoopJson(AtomicBool::new(false));
        let dispatcher = FormatDispatcher {
            epub: &OkEpub,
            markdown: &FailingMarkdown,
            pdf: &pdf,
            plaintext: &NoopPlaintext,
            json: &json,
            chunks: &NoopChunks,
        };

        let mut reporter = ProgressReporter::new("1234", None);
        let mut result = empty_result(tmp.path());
        dispatcher
            .run(
                &[OutputFormat::Json, OutputFormat::Jsonl],
                &ctx,
                None,
                &mut reporter,
                &mut result,
            )
            .unwrap();

        assert!(json.0.load(Ordering::SeqCst));
        assert!(result.files.contains_key("json"));
    }
}
