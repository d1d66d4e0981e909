//! 进度上报与 ETA 估算。
//!
//! 百分比按固定阶段区间分配：元数据 0–10、封面 10–15、章节处理 15–80
//! （随完成章节数线性推进）、资源下载 80–90、格式生成 90–100（每个格式
//! 一个固定检查点）。ETA 取最近五章耗时均值乘以剩余章节数，首章完成前
//! 不可用。

use std::time::Duration;

use super::models::{DownloadProgress, DownloadStatus};

pub(crate) type ProgressSink = Box<dyn FnMut(DownloadProgress) + Send>;

pub(crate) const PCT_STARTING: u8 = 0;
pub(crate) const PCT_METADATA: u8 = 5;
pub(crate) const PCT_CHAPTER_LIST: u8 = 10;
pub(crate) const PCT_COVER: u8 = 12;

const CHAPTER_BAND_START: u8 = 15;
const CHAPTER_BAND_SPAN: usize = 65;
const ASSET_BAND_START: u8 = 80;
const ASSET_BAND_SPAN: usize = 10;

/// ETA 滑动窗口：只看最近几章的耗时。
const ETA_WINDOW: usize = 5;

/// 章节处理阶段的百分比（`index` 为 0 起始的当前章下标）。
pub(crate) fn chapter_percentage(index: usize, total: usize) -> u8 {
    if total == 0 {
        return CHAPTER_BAND_START;
    }
    CHAPTER_BAND_START + (index * CHAPTER_BAND_SPAN / total) as u8
}

/// 资源下载阶段的百分比。
pub(crate) fn asset_percentage(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return ASSET_BAND_START;
    }
    ASSET_BAND_START + (completed.min(total) * ASSET_BAND_SPAN / total) as u8
}

/// 单次下载的进度上报器。
///
/// 回调是每次调用注册一次的单消费者通道；同一阶段内的百分比被钳制为
/// 非递减。未注册回调时所有上报都是空操作。
pub(crate) struct ProgressReporter {
    book_id: String,
    cb: Option<ProgressSink>,
    last: Option<(DownloadStatus, u8)>,
    chapter_times: Vec<Duration>,
}

impl ProgressReporter {
    pub(crate) fn new(book_id: &str, cb: Option<ProgressSink>) -> Self {
        Self {
            book_id: book_id.to_string(),
            cb,
            last: None,
            chapter_times: Vec::new(),
        }
    }

    /// 阶段级事件（不携带章节信息）。
    pub(crate) fn report(&mut self, status: DownloadStatus, percentage: u8, message: &str) {
        self.emit(DownloadProgress {
            status,
            percentage,
            message: message.to_string(),
            eta_seconds: None,
            current_chapter: 0,
            total_chapters: 0,
            chapter_title: String::new(),
            book_id: self.book_id.clone(),
        });
    }

    /// 章节处理事件。每章至少一条；ETA 可用后再补一条带 ETA 的。
    pub(crate) fn report_chapter(
        &mut self,
        percentage: u8,
        current_chapter: usize,
        total_chapters: usize,
        chapter_title: &str,
        eta_seconds: Option<u64>,
    ) {
        self.emit(DownloadProgress {
            status: DownloadStatus::ProcessingChapters,
            percentage,
            message: String::new(),
            eta_seconds,
            current_chapter,
            total_chapters,
            chapter_title: chapter_title.to_string(),
            book_id: self.book_id.clone(),
        });
    }

    /// 终态事件：永远是 `(completed, 100)`。
    pub(crate) fn finish(&mut self) {
        self.report(DownloadStatus::Completed, 100, "");
    }

    pub(crate) fn record_chapter_time(&mut self, elapsed: Duration) {
        self.chapter_times.push(elapsed);
    }

    /// 剩余时间估算：最近 [`ETA_WINDOW`] 章的平均耗时 × 剩余章节数。
    /// 首章完成前返回 `None`。
    pub(crate) fn eta_seconds(&self, remaining: usize) -> Option<u64> {
        if self.chapter_times.is_empty() {
            return None;
        }
        let window_start = self.chapter_times.len().saturating_sub(ETA_WINDOW);
        let window = &self.chapter_times[window_start..];
        let avg = window.iter().map(Duration::as_secs_f64).sum::<f64>() / window.len() as f64;
        Some((avg * remaining as f64).round() as u64)
    }

    fn emit(&mut self, mut event: DownloadProgress) {
        if let Some((last_status, last_pct)) = self.last
            && last_status == event.status
        {
            event.percentage = event.percentage.max(last_pct);
        }
        self.last = Some((event.status, event.percentage));

        if let Some(cb) = self.cb.as_mut() {
            cb(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn collecting_reporter(book_id: &str) -> (ProgressReporter, Arc<Mutex<Vec<DownloadProgress>>>) {
        let events: Arc<Mutex<Vec<DownloadProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let reporter = ProgressReporter::new(
            book_id,
            Some(Box::new(move |p| sink.lock().unwrap().push(p))),
        );
        (reporter, events)
    }

    #[test]
    fn chapter_band_is_monotonic_within_15_80() {
        let total = 10;
        let mut last = 0;
        for i in 0..total {
            let pct = chapter_percentage(i, total);
            assert!((15..=80).contains(&pct));
            assert!(pct >= last);
            last = pct;
        }
        assert_eq!(chapter_percentage(0, total), 15);
    }

    #[test]
    fn asset_band_runs_80_to_90() {
        assert_eq!(asset_percentage(0, 4), 80);
        assert_eq!(asset_percentage(2, 4), 85);
        assert_eq!(asset_percentage(4, 4), 90);
        assert_eq!(asset_percentage(0, 0), 80);
    }

    #[test]
    fn eta_unavailable_before_first_chapter() {
        let reporter = ProgressReporter::new("1234", None);
        assert_eq!(reporter.eta_seconds(10), None);
    }

    #[test]
    fn eta_is_mean_of_last_five_times_remaining() {
        let mut reporter = ProgressReporter::new("1234", None);
        for _ in 0..5 {
            reporter.record_chapter_time(Duration::from_secs(2));
        }
        // 5 章完成、每章 2s、剩 5 章 → 约 10s
        assert_eq!(reporter.eta_seconds(5), Some(10));

        // 更早的慢章节滑出窗口后不再影响估算
        let mut reporter = ProgressReporter::new("1234", None);
        reporter.record_chapter_time(Duration::from_secs(60));
        reporter.record_chapter_time(Duration::from_secs(60));
        for _ in 0..5 {
            reporter.record_chapter_time(Duration::from_secs(2));
        }
        assert_eq!(reporter.eta_seconds(3), Some(6));
    }

    #[test]
    fn same_status_percentage_is_clamped_non_decreasing() {
        let (mut reporter, events) = collecting_reporter("1234");
        reporter.report_chapter(20, 1, 10, "one", None);
        reporter.report_chapter(18, 2, 10, "two", None);
        reporter.report_chapter(25, 3, 10, "three", None);

        let pcts: Vec<u8> = events.lock().unwrap().iter().map(|e| e.percentage).collect();
        assert_eq!(pcts, vec![20, 20, 25]);
    }

    #[test]
    fn finish_reports_completed_100() {
        let (mut reporter, events) = collecting_reporter("1234");
        reporter.report(DownloadStatus::Starting, PCT_STARTING, "");
        reporter.finish();

        let events = events.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.status, DownloadStatus::Completed);
        assert_eq!(last.percentage, 100);
        assert_eq!(last.book_id, "1234");
    }
}
