//! 输出格式注册表：别名解析、`all` 展开、整书格式判定。
//!
//! 解析规则：别名映射到规范名；`jsonl` 隐含 `json`（先插入，不重复）；
//! 未知或重复条目静默丢弃；解析结果为空时回退为单独的 `epub`。

use serde_json::{Value, json};

/// 全部受支持的输出格式（规范名）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Epub,
    Markdown,
    MarkdownChapters,
    Pdf,
    PdfChapters,
    Plaintext,
    PlaintextChapters,
    Json,
    Jsonl,
    Chunks,
}

/// 短别名 → 规范名。
const FORMAT_ALIASES: [(&str, &str); 2] = [("md", "markdown"), ("txt", "plaintext")];

/// 只作用于整本书、忽略选章请求的格式。
const BOOK_ONLY: [OutputFormat; 2] = [OutputFormat::Epub, OutputFormat::Chunks];

/// `all` 的固定展开：六个规范格式，不含分章变体与 jsonl。
pub const ALL_EXPANSION: [OutputFormat; 6] = [
    OutputFormat::Epub,
    OutputFormat::Markdown,
    OutputFormat::Pdf,
    OutputFormat::Plaintext,
    OutputFormat::Json,
    OutputFormat::Chunks,
];

impl OutputFormat {
    pub const ALL: [OutputFormat; 10] = [
        OutputFormat::Epub,
        OutputFormat::Markdown,
        OutputFormat::MarkdownChapters,
        OutputFormat::Pdf,
        OutputFormat::PdfChapters,
        OutputFormat::Plaintext,
        OutputFormat::PlaintextChapters,
        OutputFormat::Json,
        OutputFormat::Jsonl,
        OutputFormat::Chunks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Epub => "epub",
            OutputFormat::Markdown => "markdown",
            OutputFormat::MarkdownChapters => "markdown-chapters",
            OutputFormat::Pdf => "pdf",
            OutputFormat::PdfChapters => "pdf-chapters",
            OutputFormat::Plaintext => "plaintext",
            OutputFormat::PlaintextChapters => "plaintext-chapters",
            OutputFormat::Json => "json",
            OutputFormat::Jsonl => "jsonl",
            OutputFormat::Chunks => "chunks",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            OutputFormat::Epub => "Standard EPUB format (default)",
            OutputFormat::Markdown => "Markdown files (alias: md)",
            OutputFormat::MarkdownChapters => "Separate Markdown file per chapter",
            OutputFormat::Pdf => "Single PDF file",
            OutputFormat::PdfChapters => "Separate PDF per chapter",
            OutputFormat::Plaintext => "Plain text (alias: txt)",
            OutputFormat::PlaintextChapters => "Separate text file per chapter",
            OutputFormat::Json => "Structured JSON export",
            OutputFormat::Jsonl => "JSON Lines format (includes json)",
            OutputFormat::Chunks => "Chunked content for LLM processing",
        }
    }

    /// 解析一个用户输入（可为别名），大小写不敏感。
    pub fn canonical(input: &str) -> Option<OutputFormat> {
        let lower = input.trim().to_ascii_lowercase();
        let name = FORMAT_ALIASES
            .iter()
            .find(|(alias, _)| *alias == lower)
            .map(|(_, canonical)| *canonical)
            .unwrap_or(lower.as_str());
        OutputFormat::ALL.iter().copied().find(|f| f.as_str() == name)
    }

    pub fn is_book_only(&self) -> bool {
        BOOK_ONLY.contains(self)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── 解析 ──────────────────────────────────────────────────────

/// 解析逗号分隔的格式串。`all` 展开为固定的六格式集合。
pub fn parse_formats(input: &str) -> Vec<OutputFormat> {
    if input.trim().eq_ignore_ascii_case("all") {
        return ALL_EXPANSION.to_vec();
    }
    resolve_formats(input.split(',').map(str::trim).filter(|s| !s.is_empty()))
}

/// 解析已拆分的格式列表（列表形式不做 `all` 展开）。
pub fn parse_format_list<S: AsRef<str>>(raw: &[S]) -> Vec<OutputFormat> {
    resolve_formats(raw.iter().map(|s| s.as_ref()))
}

fn resolve_formats<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<OutputFormat> {
    let mut formats: Vec<OutputFormat> = Vec::new();

    for item in raw {
        let Some(canonical) = OutputFormat::canonical(item) else {
            continue;
        };
        if canonical == OutputFormat::Jsonl {
            // jsonl 隐含 json：json 先插入，两者都不重复。
            if !formats.contains(&OutputFormat::Json) {
                formats.push(OutputFormat::Json);
            }
            if !formats.contains(&OutputFormat::Jsonl) {
                formats.push(OutputFormat::Jsonl);
            }
            continue;
        }
        if !formats.contains(&canonical) {
            formats.push(canonical);
        }
    }

    if formats.is_empty() {
        vec![OutputFormat::Epub]
    } else {
        formats
    }
}

// ── 查询辅助 ──────────────────────────────────────────────────

/// 该格式是否支持章节子集下载。未知输入按支持处理（解析阶段会丢弃它）。
pub fn supports_chapter_selection(format: &str) -> bool {
    match OutputFormat::canonical(format) {
        Some(f) => !f.is_book_only(),
        None => true,
    }
}

/// 格式帮助表：`(规范名, 说明)`，按注册顺序。
pub fn format_help() -> Vec<(&'static str, &'static str)> {
    OutputFormat::ALL
        .iter()
        .map(|f| (f.as_str(), f.description()))
        .collect()
}

/// 机器可读的格式信息汇总（Web/CLI 共用）。
pub fn formats_info() -> Value {
    let mut names: Vec<&str> = OutputFormat::ALL.iter().map(|f| f.as_str()).collect();
    names.sort_unstable();

    let descriptions: serde_json::Map<String, Value> = OutputFormat::ALL
        .iter()
        .map(|f| (f.as_str().to_string(), Value::String(f.description().to_string())))
        .collect();

    let mut book_only: Vec<&str> = BOOK_ONLY.iter().map(|f| f.as_str()).collect();
    book_only.sort_unstable();

    json!({
        "formats": names,
        "aliases": { "md": "markdown", "txt": "plaintext" },
        "book_only": book_only,
        "descriptions": descriptions,
    })
}
