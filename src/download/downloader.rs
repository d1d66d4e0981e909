//! 下载主流程编排。
//!
//! 六阶段状态机，严格顺序推进：starting → fetching_metadata →
//! fetching_chapters → [downloading_cover] → processing_chapters（逐章循环，
//! 可取消）→ downloading_assets → generating_<format>（固定优先级）→
//! completed。所有实体按次调用创建，结束即丢弃，跨调用不保留状态。

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::base_system::book_paths;
use crate::base_system::context::Config;

use super::dispatch::{
    ChunkSplitter, EpubGenerator, FormatDispatcher, JsonExporter, MarkdownGenerator, PdfGenerator,
    PlaintextGenerator, RenderContext,
};
use super::flatten::flatten_chapters;
use super::models::{
    AssetManifest, ChapterContent, ChapterNode, DownloadError, DownloadOptions, DownloadResult,
    DownloadStatus,
};
use super::progress::{self, ProgressReporter};
use super::sources::{AssetFetcher, ChapterSource, ContentTransformer, MetadataSource};

/// 流水线的协作者集合（真实实现或测试桩）。
pub struct PipelineParts {
    pub metadata: Box<dyn MetadataSource>,
    pub chapters: Box<dyn ChapterSource>,
    pub transformer: Box<dyn ContentTransformer>,
    pub assets: Box<dyn AssetFetcher>,
    pub epub: Box<dyn EpubGenerator>,
    pub markdown: Box<dyn MarkdownGenerator>,
    pub pdf: Box<dyn PdfGenerator>,
    pub plaintext: Box<dyn PlaintextGenerator>,
    pub json: Box<dyn JsonExporter>,
    pub chunks: Box<dyn ChunkSplitter>,
}

/// 顶层下载驱动。单线程同步执行，章节一章一章处理，互不重叠。
pub struct DownloadPipeline {
    config: Config,
    parts: PipelineParts,
}

impl DownloadPipeline {
    pub fn new(config: Config, parts: PipelineParts) -> Self {
        Self { config, parts }
    }

    /// 执行一次完整下载。
    ///
    /// 失败出口可区分：`Cancelled`（删除整个输出目录后返回）、
    /// `CyclicTree`（章节树结构损坏）、其余错误（输出目录保持部分状态，
    /// 不做回滚）。成功时返回 [`DownloadResult`]。
    pub fn download(
        &self,
        book_id: &str,
        output_root: &Path,
        mut opts: DownloadOptions,
    ) -> Result<DownloadResult, DownloadError> {
        let mut reporter = ProgressReporter::new(book_id, opts.progress.take());
        let cancel = opts.cancel_check.take();

        info!(target: "download", book_id, "启动下载流水线");
        reporter.report(DownloadStatus::Starting, progress::PCT_STARTING, "");

        // 阶段一：元数据
        reporter.report(DownloadStatus::FetchingMetadata, progress::PCT_METADATA, "");
        let meta = self
            .parts
            .metadata
            .fetch(book_id)
            .with_context(|| format!("fetch metadata for book `{book_id}`"))?;

        // 阶段二：章节树 → 扁平化 → 选章
        reporter.report(
            DownloadStatus::FetchingChapters,
            progress::PCT_CHAPTER_LIST,
            "",
        );
        let tree = self
            .parts
            .chapters
            .fetch_list(book_id)
            .context("fetch chapter list")?;
        let flattened = flatten_chapters(&tree)?;
        let toc = self.parts.chapters.fetch_toc(book_id).context("fetch toc")?;

        let chapters = match opts.selected_chapters.as_deref() {
            Some(indices) => select_chapters(&flattened, indices),
            None => flattened,
        };
        if chapters.is_empty() {
            warn!(target: "download", book_id, "选章结果为空，仅生成书籍骨架");
        }

        // 选章之后、任何写盘之前创建输出目录
        let book_dir =
            book_paths::create_book_dir(output_root, book_id, &meta.title, &meta.authors)
                .context("create book directory")?;
        let content_dir = book_paths::content_dir(&book_dir);
        fs::create_dir_all(&content_dir).context("create content directory")?;

        // 阶段三：封面（可选）。封面失败不致命，策略与其他资源一致。
        if !opts.skip_images
            && let Some(cover_url) = meta.cover_url.as_deref().filter(|u| !u.trim().is_empty())
        {
            reporter.report(DownloadStatus::DownloadingCover, progress::PCT_COVER, "");
            let images_dir = book_paths::images_dir(&book_dir);
            fs::create_dir_all(&images_dir).context("create images directory")?;
            if let Err(err) = self
                .parts
                .assets
                .download_image(cover_url, &images_dir.join("cover.jpg"))
            {
                warn!(target: "download", error = %err, "封面下载失败，跳过");
            }
        }

        // 阶段四：逐章抓取与改写。取消只在章节边界轮询，章内一旦开始
        // 就跑到结束。
        let total_chapters = chapters.len();
        let mut manifest = AssetManifest::default();
        let mut contents: Vec<ChapterContent> = Vec::with_capacity(total_chapters);

        for (i, chapter) in chapters.iter().enumerate() {
            if cancel.as_ref().is_some_and(|check| check()) {
                info!(target: "download", book_id, "收到取消请求，清理部分输出");
                cleanup_on_cancel(&book_dir);
                return Err(DownloadError::Cancelled);
            }

            let pct = progress::chapter_percentage(i, total_chapters);
            reporter.report_chapter(pct, i + 1, total_chapters, &chapter.title, None);

            let started = Instant::now();
            let raw = self
                .parts
                .chapters
                .fetch_content(&chapter.content_url)
                .with_context(|| format!("fetch content for chapter `{}`", chapter.id))?;
            let (processed, discovered) = self
                .parts
                .transformer
                .process(&raw, book_id, opts.skip_images)
                .with_context(|| format!("transform chapter `{}`", chapter.id))?;

            manifest.record_chapter_assets(chapter, &discovered);
            contents.push(ChapterContent {
                filename: chapter.filename.clone(),
                title: chapter.title.clone(),
                body: processed,
            });

            reporter.record_chapter_time(started.elapsed());
            let remaining = total_chapters - (i + 1);
            if let Some(eta) = reporter.eta_seconds(remaining) {
                reporter.report_chapter(pct, i + 1, total_chapters, &chapter.title, Some(eta));
            }
            debug!(target: "download", chapter = %chapter.id, done = i + 1, total = total_chapters, "章节处理完成");
        }

        // 清单冻结后统一写出章节文档，样式引用编号全书一致。
        let css_refs = manifest.css_refs();
        for (chapter, content) in chapters.iter().zip(&contents) {
            let document = self
                .parts
                .transformer
                .wrap_document(&content.body, &css_refs, &content.title);
            let path = content_dir.join(document_filename(&chapter.filename, &chapter.id));
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory for {}", path.display()))?;
            }
            fs::write(&path, document)
                .with_context(|| format!("write chapter document {}", path.display()))?;
        }

        // 阶段五：批量资源下载。清单此时已完整，不做任何提前抓取。
        reporter.report(DownloadStatus::DownloadingAssets, 80, "");
        let css_urls = manifest.css_urls().to_vec();
        let image_urls = if opts.skip_images {
            Vec::new()
        } else {
            manifest.absolute_image_urls(&self.config.source_host)
        };
        let total_assets = css_urls.len() + image_urls.len();
        debug!(target: "download", css = css_urls.len(), images = image_urls.len(), "资源清单冻结");

        let styles_dir = book_paths::styles_dir(&book_dir);
        let images_dir = book_paths::images_dir(&book_dir);
        {
            // 下载器可能从工作线程回调进度，这里用互斥锁串行化上报。
            let reporter_cell = Mutex::new(&mut reporter);
            let css_total = css_urls.len();

            let css_progress = |completed: usize, _total: usize| {
                if total_assets == 0 {
                    return;
                }
                let pct = progress::asset_percentage(completed, total_assets);
                if let Ok(mut rep) = reporter_cell.lock() {
                    rep.report(
                        DownloadStatus::DownloadingAssets,
                        pct,
                        &format!("{pct:2}% - Downloading CSS ({completed}/{css_total})"),
                    );
                }
            };
            self.parts
                .assets
                .download_all_css(&css_urls, &styles_dir, &css_progress)
                .context("download stylesheets")?;

            if !image_urls.is_empty() {
                let image_total = image_urls.len();
                let image_progress = |completed: usize, _total: usize| {
                    let pct = progress::asset_percentage(css_total + completed, total_assets);
                    if let Ok(mut rep) = reporter_cell.lock() {
                        rep.report(
                            DownloadStatus::DownloadingAssets,
                            pct,
                            &format!("{pct:2}% - Downloading images ({completed}/{image_total})"),
                        );
                    }
                };
                self.parts
                    .assets
                    .download_all_images(&image_urls, &images_dir, &image_progress)
                    .context("download images")?;
            }
        }

        // 阶段六：格式扇出
        let mut result = DownloadResult {
            book_id: book_id.to_string(),
            title: meta.title.clone(),
            output_dir: book_dir.clone(),
            files: BTreeMap::new(),
            chapters_count: contents.len(),
        };

        let ctx = RenderContext {
            meta: &meta,
            chapters: &chapters,
            contents: &contents,
            toc: &toc,
            manifest: &manifest,
            book_dir: &book_dir,
        };
        let dispatcher = FormatDispatcher {
            epub: self.parts.epub.as_ref(),
            markdown: self.parts.markdown.as_ref(),
            pdf: self.parts.pdf.as_ref(),
            plaintext: self.parts.plaintext.as_ref(),
            json: self.parts.json.as_ref(),
            chunks: self.parts.chunks.as_ref(),
        };
        dispatcher.run(
            &opts.formats,
            &ctx,
            opts.chunk_config.as_ref(),
            &mut reporter,
            &mut result,
        )?;

        reporter.finish();
        info!(target: "download", book_id, chapters = result.chapters_count, "下载完成");
        Ok(result)
    }
}

/// 按扁平化序列的下标取子集：排序去重后依次取出，结果顺序跟随扁平化
/// 顺序而不是选择集合的迭代顺序。
fn select_chapters(flattened: &[ChapterNode], indices: &[usize]) -> Vec<ChapterNode> {
    let mut wanted: Vec<usize> = indices.to_vec();
    wanted.sort_unstable();
    wanted.dedup();
    wanted
        .into_iter()
        .filter_map(|i| flattened.get(i).cloned())
        .collect()
}

fn document_filename(filename: &str, id: &str) -> String {
    if filename.trim().is_empty() {
        return format!("{id}.xhtml");
    }
    match filename.strip_suffix(".html") {
        Some(stem) => format!("{stem}.xhtml"),
        None => filename.to_string(),
    }
}

fn cleanup_on_cancel(book_dir: &Path) {
    if book_dir.exists()
        && let Err(err) = fs::remove_dir_all(book_dir)
    {
        warn!(target: "download", error = %err, path = %book_dir.display(), "清理部分输出失败");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::{Result, anyhow};

    use crate::book_parser::chunking::ChunkConfig;
    use crate::download::formats::OutputFormat;
    use crate::download::models::{BookMetadata, DownloadProgress, TocStructure};
    use crate::download::sources::AssetProgress;

    use super::*;

    // ── 协作者桩实现 ─────────────────────────────────────────

    struct StubMetadata;
    impl MetadataSource for StubMetadata {
        fn fetch(&self, book_id: &str) -> Result<BookMetadata> {
            Ok(BookMetadata {
                id: book_id.to_string(),
                title: "Test Book".to_string(),
                authors: vec!["Test Author".to_string()],
                ..BookMetadata::default()
            })
        }
        fn search(&self, _query: &str) -> Result<Vec<BookMetadata>> {
            Ok(Vec::new())
        }
    }

    struct StubChapters {
        count: usize,
    }
    impl ChapterSource for StubChapters {
        fn fetch_list(&self, _book_id: &str) -> Result<Vec<ChapterNode>> {
            Ok((0..self.count)
                .map(|i| ChapterNode {
                    id: format!("c{i}"),
                    title: format!("Chapter {i}"),
                    content_url: format!("https://host/chapter/{i}"),
                    filename: format!("ch{i:02}.html"),
                    stylesheets: vec![format!("https://host/css/{i}.css")],
                    ..ChapterNode::default()
                })
                .collect())
        }
        fn fetch_toc(&self, _book_id: &str) -> Result<TocStructure> {
            Ok(TocStructure::default())
        }
        fn fetch_content(&self, content_url: &str) -> Result<String> {
            Ok(format!("<p>body of {content_url}</p>"))
        }
    }

    #[derive(Default)]
    struct RecordingTransformer {
        css_refs_seen: Arc<Mutex<Vec<Vec<String>>>>,
    }
    impl ContentTransformer for RecordingTransformer {
        fn process(
            &self,
            raw_markup: &str,
            _book_id: &str,
            _skip_images: bool,
        ) -> Result<(String, Vec<String>)> {
            Ok((raw_markup.to_string(), Vec::new()))
        }
        fn wrap_document(&self, processed: &str, css_refs: &[String], _title: &str) -> String {
            self.css_refs_seen.lock().unwrap().push(css_refs.to_vec());
            format!("<html><body>{processed}</body></html>")
        }
    }

    struct StubAssets;
    impl AssetFetcher for StubAssets {
        fn download_image(&self, _url: &str, _dest: &Path) -> Result<()> {
            Ok(())
        }
        fn download_all_css(
            &self,
            urls: &[String],
            _dest_dir: &Path,
            on_progress: AssetProgress<'_>,
        ) -> Result<()> {
            for i in 0..urls.len() {
                on_progress(i + 1, urls.len());
            }
            Ok(())
        }
        fn download_all_images(
            &self,
            urls: &[String],
            _dest_dir: &Path,
            on_progress: AssetProgress<'_>,
        ) -> Result<()> {
            for i in 0..urls.len() {
                on_progress(i + 1, urls.len());
            }
            Ok(())
        }
    }

    struct FileEpub;
    impl crate::download::dispatch::EpubGenerator for FileEpub {
        fn generate(&self, ctx: &RenderContext<'_>) -> Result<PathBuf> {
            let path = ctx.book_dir.join("book.epub");
            fs::write(&path, b"epub")?;
            Ok(path)
        }
    }

    struct StubMarkdown {
        fail: bool,
    }
    impl MarkdownGenerator for StubMarkdown {
        fn generate_book(&self, ctx: &RenderContext<'_>, _per_chapter: bool) -> Result<PathBuf> {
            if self.fail {
                return Err(anyhow!("markdown generation failed"));
            }
            Ok(ctx.book_dir.join("Markdown"))
        }
    }

    struct CountingPdf(Arc<AtomicUsize>);
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

    struct StubPlaintext;
    impl PlaintextGenerator for StubPlaintext {
        fn generate(&self, ctx: &RenderContext<'_>, _single_file: bool) -> Result<PathBuf> {
            Ok(ctx.book_dir.join("book.txt"))
        }
    }

    struct StubJson;
    impl JsonExporter for StubJson {
        fn generate(&self, ctx: &RenderContext<'_>, _include_jsonl: bool) -> Result<PathBuf> {
            Ok(ctx.book_dir.join("book.json"))
        }
    }

    struct StubChunks;
    impl ChunkSplitter for StubChunks {
        fn generate(
            &self,
            ctx: &RenderContext<'_>,
            _config: Option<&ChunkConfig>,
        ) -> Result<PathBuf> {
            Ok(ctx.book_dir.join("chunks.jsonl"))
        }
    }

    struct PipelineFixture {
        pipeline: DownloadPipeline,
        pdf_calls: Arc<AtomicUsize>,
        css_refs_seen: Arc<Mutex<Vec<Vec<String>>>>,
    }

    fn fixture(chapter_count: usize, markdown_fails: bool) -> PipelineFixture {
        let pdf_calls = Arc::new(AtomicUsize::new(0));
        let css_refs_seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let transformer = RecordingTransformer {
            css_refs_seen: css_refs_seen.clone(),
        };
        let pipeline = DownloadPipeline::new(
            Config::default(),
            PipelineParts {
                metadata: Box::new(StubMetadata),
                chapters: Box::new(StubChapters {
                    count: chapter_count,
                }),
                transformer: Box::new(transformer),
                assets: Box::new(StubAssets),
                epub: Box::new(FileEpub),
                markdown: Box::new(StubMarkdown {
                    fail: markdown_fails,
                }),
                pdf: Box::new(CountingPdf(pdf_calls.clone())),
                plaintext: Box::new(StubPlaintext),
                json: Box::new(StubJson),
                chunks: Box::new(StubChunks),
            },
        );
        PipelineFixture {
            pipeline,
            pdf_calls,
            css_refs_seen,
        }
    }

    fn event_sink() -> (ProgressSinkBox, Arc<Mutex<Vec<DownloadProgress>>>) {
        let events: Arc<Mutex<Vec<DownloadProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (
            Box::new(move |p: DownloadProgress| sink.lock().unwrap().push(p)),
            events,
        )
    }

    type ProgressSinkBox = Box<dyn FnMut(DownloadProgress) + Send>;

    #[test]
    fn ten_chapter_run_reports_monotonic_band_and_completes_at_100() {
        let fx = fixture(10, false);
        let tmp = tempfile::tempdir().unwrap();
        let (sink, events) = event_sink();

        let result = fx
            .pipeline
            .download(
                "1234",
                tmp.path(),
                DownloadOptions {
                    formats: vec![OutputFormat::Epub],
                    progress: Some(sink),
                    ..DownloadOptions::default()
                },
            )
            .unwrap();

        assert_eq!(result.chapters_count, 10);

        let events = events.lock().unwrap();
        let chapter_pcts: Vec<u8> = events
            .iter()
            .filter(|e| e.status == DownloadStatus::ProcessingChapters)
            .map(|e| e.percentage)
            .collect();
        assert!(!chapter_pcts.is_empty());
        assert!(chapter_pcts.iter().all(|p| (15..=80).contains(p)));
        assert!(chapter_pcts.windows(2).all(|w| w[0] <= w[1]));

        let last = events.last().unwrap();
        assert_eq!(last.status, DownloadStatus::Completed);
        assert_eq!(last.percentage, 100);
    }

    #[test]
    fn eta_absent_before_first_chapter_then_present() {
        let fx = fixture(4, false);
        let tmp = tempfile::tempdir().unwrap();
        let (sink, events) = event_sink();

        fx.pipeline
            .download(
                "1234",
                tmp.path(),
                DownloadOptions {
                    progress: Some(sink),
                    ..DownloadOptions::default()
                },
            )
            .unwrap();

        let events = events.lock().unwrap();
        let chapter_events: Vec<&DownloadProgress> = events
            .iter()
            .filter(|e| e.status == DownloadStatus::ProcessingChapters)
            .collect();
        // 每章的首条事件不带 ETA，首章完成后出现带 ETA 的补充事件
        assert_eq!(chapter_events[0].eta_seconds, None);
        assert!(chapter_events.iter().any(|e| e.eta_seconds.is_some()));
        // 首个带 ETA 的事件出现在第 1 章而不是之前
        let first_with_eta = chapter_events
            .iter()
            .find(|e| e.eta_seconds.is_some())
            .unwrap();
        assert_eq!(first_with_eta.current_chapter, 1);
    }

    #[test]
    fn chapter_selection_takes_flattened_indices_in_order() {
        let fx = fixture(3, false);
        let tmp = tempfile::tempdir().unwrap();
        let (sink, events) = event_sink();

        let result = fx
            .pipeline
            .download(
                "1234",
                tmp.path(),
                DownloadOptions {
                    // 乱序给出的选择集合
                    selected_chapters: Some(vec![2, 0]),
                    progress: Some(sink),
                    ..DownloadOptions::default()
                },
            )
            .unwrap();

        assert_eq!(result.chapters_count, 2);

        let events = events.lock().unwrap();
        let mut titles: Vec<String> = events
            .iter()
            .filter(|e| e.status == DownloadStatus::ProcessingChapters)
            .map(|e| e.chapter_title.clone())
            .collect();
        titles.dedup();
        assert_eq!(titles, vec!["Chapter 0", "Chapter 2"]);
    }

    #[test]
    fn cancellation_before_chapter_three_removes_book_dir() {
        let fx = fixture(10, false);
        let tmp = tempfile::tempdir().unwrap();
        let (sink, events) = event_sink();

        let polls = Arc::new(AtomicUsize::new(0));
        let polls_in_cb = polls.clone();
        let cancel: Box<dyn Fn() -> bool + Send> =
            Box::new(move || polls_in_cb.fetch_add(1, Ordering::SeqCst) >= 2);

        let outcome = fx.pipeline.download(
            "1234",
            tmp.path(),
            DownloadOptions {
                progress: Some(sink),
                cancel_check: Some(cancel),
                ..DownloadOptions::default()
            },
        );

        assert!(matches!(outcome, Err(DownloadError::Cancelled)));
        // 整个书籍目录被删除
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
        // 未进入任何格式生成阶段
        let events = events.lock().unwrap();
        assert!(events.iter().all(|e| !matches!(
            e.status,
            DownloadStatus::GeneratingEpub
                | DownloadStatus::GeneratingMarkdown
                | DownloadStatus::GeneratingPdf
                | DownloadStatus::GeneratingPdfChapters
                | DownloadStatus::GeneratingPlaintext
                | DownloadStatus::GeneratingJson
                | DownloadStatus::GeneratingChunks
                | DownloadStatus::Completed
        )));
    }

    #[test]
    fn format_failure_is_fail_fast_without_rollback() {
        let fx = fixture(2, true);
        let tmp = tempfile::tempdir().unwrap();

        let outcome = fx.pipeline.download(
            "1234",
            tmp.path(),
            DownloadOptions {
                formats: vec![
                    OutputFormat::Epub,
                    OutputFormat::Markdown,
                    OutputFormat::Pdf,
                ],
                ..DownloadOptions::default()
            },
        );

        assert!(matches!(outcome, Err(DownloadError::Other(_))));
        // 第一个格式的产物仍在磁盘上，第三个格式从未执行，目录未回滚
        let book_dir = fs::read_dir(tmp.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        assert!(book_dir.join("book.epub").exists());
        assert_eq!(fx.pdf_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn every_chapter_gets_identical_frozen_css_refs() {
        let fx = fixture(3, false);
        let tmp = tempfile::tempdir().unwrap();

        fx.pipeline
            .download("1234", tmp.path(), DownloadOptions::default())
            .unwrap();

        let seen = fx.css_refs_seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        let expected = vec![
            "Styles/Style00.css".to_string(),
            "Styles/Style01.css".to_string(),
            "Styles/Style02.css".to_string(),
        ];
        assert!(seen.iter().all(|refs| *refs == expected));
    }

    #[test]
    fn chapter_documents_land_in_content_dir_as_xhtml() {
        let fx = fixture(2, false);
        let tmp = tempfile::tempdir().unwrap();

        let result = fx
            .pipeline
            .download("1234", tmp.path(), DownloadOptions::default())
            .unwrap();

        let content_dir = book_paths::content_dir(&result.output_dir);
        assert!(content_dir.join("ch00.xhtml").exists());
        assert!(content_dir.join("ch01.xhtml").exists());
    }
}
