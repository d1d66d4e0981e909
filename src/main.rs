//! O'Reilly Learning 书籍下载器。
//!
//! 本 crate 负责：配置加载、下载流水线编排、正文改写与多格式导出
//! （epub/markdown/pdf/纯文本/JSON/分块）。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/路径/书籍 ID 解析等基础设施
//! - `network_parser`：远端书库 API 客户端（元数据/章节/正文/搜索）
//! - `download`：下载流水线（扁平化、进度与 ETA、取消、格式分发）
//! - `book_parser`：改写与导出（html 清理、资源下载、各格式生成器）

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info};

mod base_system;
mod book_parser;
mod download;
mod network_parser;

use base_system::config::load_or_create;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};
use book_parser::asset_fetcher::MediaFetcher;
use book_parser::chunking::{ChunkConfig, ChunkGenerator};
use book_parser::epub_generator::EpubPackager;
use book_parser::html_processor::HtmlProcessor;
use book_parser::json_export::JsonExportGenerator;
use book_parser::markdown_generator::MarkdownRenderer;
use book_parser::pdf_generator::PdfRenderer;
use book_parser::plaintext_generator::PlaintextRenderer;
use download::models::OutputPaths;
use download::sources::MetadataSource;
use download::{
    DownloadError, DownloadOptions, DownloadPipeline, DownloadProgress, PipelineParts,
    format_help, parse_formats, supports_chapter_selection,
};
use network_parser::network::{ShelfApiClient, ShelfApiConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "oreilly-book-downloader")]
#[command(about = "O'Reilly Learning book downloader")]
struct Cli {
    /// 书籍 ID / ISBN 或书库链接
    book: Option<String>,

    /// 输出格式（逗号分隔，支持 all；缺省用配置文件里的默认格式）
    #[arg(long, short = 'f')]
    formats: Option<String>,

    /// 输出目录（缺省用配置文件里的 save_path）
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// 章节选择：扁平化序列的下标，支持区间（如 0,2,5-9）
    #[arg(long)]
    chapters: Option<String>,

    /// 跳过图片下载
    #[arg(long, default_value_t = false)]
    skip_images: bool,

    /// 按关键字搜索书籍后退出
    #[arg(long)]
    search: Option<String>,

    /// 列出支持的输出格式后退出
    #[arg(long, default_value_t = false)]
    list_formats: bool,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("oreilly-book-downloader v{}", VERSION);
        return Ok(());
    }

    if cli.list_formats {
        for (name, description) in format_help() {
            println!("{name:<20} {description}");
        }
        return Ok(());
    }

    let _log = init_logging(cli.debug)?;
    let config: Config = load_or_create(None).map_err(|e| anyhow!(e.to_string()))?;

    if let Some(query) = cli.search.as_deref() {
        return run_search(&config, query);
    }

    let Some(book_input) = cli.book.as_deref() else {
        return Err(anyhow!("缺少书籍 ID/链接（另见 --search / --list-formats）"));
    };
    let book_id = base_system::book_id::parse_book_id(book_input)
        .ok_or_else(|| anyhow!("无法从输入解析书籍 ID: {book_input}"))?;

    let formats = parse_formats(cli.formats.as_deref().unwrap_or(&config.book_formats));

    let selected = match cli.chapters.as_deref() {
        Some(spec) => Some(parse_chapter_selection(spec)?),
        None => None,
    };
    // 选章请求先对整书格式做校验，避免跑到一半才失败
    if selected.is_some() {
        let book_only: Vec<&str> = formats
            .iter()
            .filter(|f| !supports_chapter_selection(f.as_str()))
            .map(|f| f.as_str())
            .collect();
        if !book_only.is_empty() {
            return Err(anyhow!(
                "以下格式只作用于整本书，不能与 --chapters 同用: {}",
                book_only.join(", ")
            ));
        }
    }

    let output_root = cli.output.unwrap_or_else(|| config.default_save_dir());
    let skip_images = cli.skip_images || config.skip_images;

    // Ctrl-C 触发协作式取消，在下一章边界生效
    let cancel_flag = Arc::new(AtomicBool::new(false));
    {
        let flag = cancel_flag.clone();
        let _ = ctrlc::set_handler(move || {
            eprintln!("收到 Ctrl-C，将在当前章节完成后取消");
            flag.store(true, Ordering::SeqCst);
        });
    }

    let pipeline = build_pipeline(config.clone())?;

    let bar = make_progress_bar();
    let bar_for_cb = bar.clone();
    let progress_cb: Box<dyn FnMut(DownloadProgress) + Send> =
        Box::new(move |p: DownloadProgress| {
            bar_for_cb.set_position(p.percentage as u64);
            let eta = p
                .eta_seconds
                .map(|s| format!(" ETA {s}s"))
                .unwrap_or_default();
            if p.total_chapters > 0 {
                bar_for_cb.set_message(format!(
                    "{} {}/{} {}{}",
                    p.status, p.current_chapter, p.total_chapters, p.chapter_title, eta
                ));
            } else if !p.message.is_empty() {
                bar_for_cb.set_message(p.message);
            } else {
                bar_for_cb.set_message(p.status.to_string());
            }
        });

    let cancel_for_check = cancel_flag.clone();
    let opts = DownloadOptions {
        formats,
        selected_chapters: selected,
        skip_images,
        chunk_config: Some(ChunkConfig::from_config(&config)),
        progress: Some(progress_cb),
        cancel_check: Some(Box::new(move || cancel_for_check.load(Ordering::SeqCst))),
    };

    info!(target: "startup", "当前版本: v{}", VERSION);
    match pipeline.download(&book_id, &output_root, opts) {
        Ok(result) => {
            bar.finish_and_clear();
            info!(
                "下载完成: {} -> {}",
                result.title,
                result.output_dir.display()
            );
            for (format, paths) in &result.files {
                match paths {
                    OutputPaths::Single(path) => println!("  {format}: {}", path.display()),
                    OutputPaths::Many(list) => println!("  {format}: {} 个文件", list.len()),
                }
            }
            Ok(())
        }
        Err(DownloadError::Cancelled) => {
            bar.finish_and_clear();
            info!("下载已取消，部分输出已清理");
            Ok(())
        }
        Err(err) => {
            bar.finish_and_clear();
            error!("下载失败: {err}");
            Err(err.into())
        }
    }
}

fn build_pipeline(config: Config) -> Result<DownloadPipeline> {
    let api = ShelfApiClient::new(ShelfApiConfig::from_config(&config))?;
    let parts = PipelineParts {
        metadata: Box::new(api.clone()),
        chapters: Box::new(api),
        transformer: Box::new(HtmlProcessor::new()),
        assets: Box::new(MediaFetcher::new(&config)),
        epub: Box::new(EpubPackager::new()),
        markdown: Box::new(MarkdownRenderer::new()),
        pdf: Box::new(PdfRenderer::new()),
        plaintext: Box::new(PlaintextRenderer::new()),
        json: Box::new(JsonExportGenerator::new()),
        chunks: Box::new(ChunkGenerator::new()),
    };
    Ok(DownloadPipeline::new(config, parts))
}

fn run_search(config: &Config, query: &str) -> Result<()> {
    let api = ShelfApiClient::new(ShelfApiConfig::from_config(config))?;
    let results = api.search(query).context("search books")?;
    if results.is_empty() {
        println!("未找到匹配书籍");
        return Ok(());
    }
    for meta in results {
        println!("{:<16} {}  [{}]", meta.id, meta.title, meta.authors.join(", "));
    }
    Ok(())
}

/// 解析 `--chapters` 的下标列表：逗号分隔，支持 `a-b` 闭区间。
fn parse_chapter_selection(spec: &str) -> Result<Vec<usize>> {
    let mut out = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Some((a, b)) = part.split_once('-') {
            let start: usize = a
                .trim()
                .parse()
                .with_context(|| format!("无效章节区间: {part}"))?;
            let end: usize = b
                .trim()
                .parse()
                .with_context(|| format!("无效章节区间: {part}"))?;
            if end < start {
                return Err(anyhow!("无效章节区间: {part}"));
            }
            out.extend(start..=end);
        } else {
            out.push(
                part.parse()
                    .with_context(|| format!("无效章节下标: {part}"))?,
            );
        }
    }
    if out.is_empty() {
        return Err(anyhow!("章节选择为空"));
    }
    Ok(out)
}

fn make_progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{prefix} [{elapsed_precise}] {wide_bar} {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );
    bar.set_prefix("下载进度");
    bar
}

fn init_logging(debug: bool) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: false,
    };
    LogSystem::init(opts).map_err(|e| anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_selection_accepts_lists_and_ranges() {
        assert_eq!(parse_chapter_selection("0,2").unwrap(), vec![0, 2]);
        assert_eq!(
            parse_chapter_selection("0, 2, 5-7").unwrap(),
            vec![0, 2, 5, 6, 7]
        );
    }

    #[test]
    fn chapter_selection_rejects_bad_input() {
        assert!(parse_chapter_selection("").is_err());
        assert!(parse_chapter_selection("9-3").is_err());
        assert!(parse_chapter_selection("x").is_err());
    }
}
