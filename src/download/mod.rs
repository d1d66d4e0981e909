//! 下载流水线模块入口。
//!
//! 子模块：
//! - `models`     — 数据模型（BookMetadata / ChapterNode / AssetManifest / 进度与结果）
//! - `flatten`    — 章节树前序扁平化
//! - `formats`    — 输出格式注册表与解析
//! - `progress`   — 进度上报与 ETA 估算
//! - `sources`    — 外部协作者接口（元数据/章节/改写/资源）
//! - `dispatch`   — 格式生成分发
//! - `downloader` — 下载主流程编排

pub mod dispatch;
pub mod downloader;
pub mod flatten;
pub mod formats;
pub mod models;
pub(crate) mod progress;
pub mod sources;

pub use downloader::{DownloadPipeline, PipelineParts};
pub use formats::{
    OutputFormat, format_help, formats_info, parse_format_list, parse_formats,
    supports_chapter_selection,
};
pub use models::{
    DownloadError, DownloadOptions, DownloadProgress, DownloadResult, DownloadStatus,
};
