//! 资源批量下载器。
//!
//! 样式表与图片走同一个工作线程池；单个资源失败记日志后跳过，不向上
//! 传播（重试与否由本层决定，核心不关心）。进度回调从工作线程发出。

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel as channel;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, CONNECTION, HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::base_system::context::Config;
use crate::download::sources::{AssetFetcher, AssetProgress};

use super::html_utils::image_local_name;

/// 样式表在目标目录中的文件名（与清单引用编号一致）。
pub(crate) fn css_file_name(index: usize) -> String {
    format!("Style{index:02}.css")
}

#[derive(Debug, Clone)]
pub struct MediaFetcher {
    timeout: Duration,
    workers: usize,
    user_agent: String,
}

impl MediaFetcher {
    pub fn new(config: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(config.request_timeout.max(1)),
            workers: config.asset_workers.clamp(1, 16),
            user_agent: config.user_agent.clone(),
        }
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        if !url.starts_with("http") {
            return Err(anyhow!("not an absolute url: {url}"));
        }

        // reqwest 构建时未启用压缩解码，显式要求 identity 编码。
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .unwrap_or(HeaderValue::from_static("Mozilla/5.0")),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(self.timeout)
            .build()?;

        let resp = client.get(url).send()?.error_for_status()?;
        Ok(resp.bytes()?.to_vec())
    }

    fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<()> {
        let bytes = self.fetch_bytes(url)?;
        write_atomic(dest, &bytes)
    }

    fn download_batch(
        &self,
        jobs: Vec<(String, PathBuf)>,
        on_progress: AssetProgress<'_>,
    ) -> Result<()> {
        let total = jobs.len();
        if total == 0 {
            return Ok(());
        }

        let workers = self.workers.min(total);
        let (tx, rx) = channel::unbounded::<(String, PathBuf)>();
        for job in jobs {
            let _ = tx.send(job);
        }
        drop(tx);

        let completed = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                let completed = &completed;
                scope.spawn(move || {
                    while let Ok((url, dest)) = rx.recv() {
                        if let Err(err) = self.fetch_to_file(&url, &dest) {
                            warn!(target: "assets", %url, error = %err, "资源下载失败，跳过");
                        }
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        on_progress(done, total);
                    }
                });
            }
        });

        debug!(target: "assets", total, "资源批量下载结束");
        Ok(())
    }
}

impl AssetFetcher for MediaFetcher {
    /// 单图下载（封面）。目标为 .jpg 且源不是 JPEG 时转码保存。
    fn download_image(&self, url: &str, dest: &Path) -> Result<()> {
        let mut bytes = self.fetch_bytes(url)?;

        let wants_jpeg = dest
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"));
        if wants_jpeg && image::guess_format(&bytes).is_ok_and(|f| f != image::ImageFormat::Jpeg) {
            match image::load_from_memory(&bytes) {
                Ok(decoded) => {
                    let mut out = Vec::new();
                    decoded
                        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Jpeg)
                        .context("re-encode cover to jpeg")?;
                    bytes = out;
                }
                Err(err) => {
                    warn!(target: "assets", url, error = %err, "封面解码失败，按原始字节保存");
                }
            }
        }

        write_atomic(dest, &bytes)
    }

    fn download_all_css(
        &self,
        urls: &[String],
        dest_dir: &Path,
        on_progress: AssetProgress<'_>,
    ) -> Result<()> {
        if urls.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("create styles dir {}", dest_dir.display()))?;
        let jobs = urls
            .iter()
            .enumerate()
            .map(|(i, url)| (url.clone(), dest_dir.join(css_file_name(i))))
            .collect();
        self.download_batch(jobs, on_progress)
    }

    fn download_all_images(
        &self,
        urls: &[String],
        dest_dir: &Path,
        on_progress: AssetProgress<'_>,
    ) -> Result<()> {
        if urls.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("create images dir {}", dest_dir.display()))?;
        let jobs = urls
            .iter()
            .map(|url| (url.clone(), dest_dir.join(image_local_name(url))))
            .collect();
        self.download_batch(jobs, on_progress)
    }
}

/// 先写临时文件再原子落位，避免半截文件被后续阶段读到。
fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.persist(dest)
        .map_err(|e| anyhow!("persist {}: {}", dest.display(), e.error))?;
    Ok(())
}
