//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 网络配置
    #[serde(default = "default_source_host")]
    pub source_host: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_string")]
    pub session_cookie: String,

    // 保存配置
    #[serde(default)]
    pub save_path: String,
    #[serde(default = "default_book_formats")]
    pub book_formats: String,
    #[serde(default = "default_false")]
    pub skip_images: bool,

    // 资源下载配置
    #[serde(default = "default_asset_workers")]
    pub asset_workers: usize,

    // 分块导出配置
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,
    #[serde(default = "default_chunk_overlap_chars")]
    pub chunk_overlap_chars: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_host: default_source_host(),
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            user_agent: default_user_agent(),
            session_cookie: default_string(),
            save_path: String::new(),
            book_formats: default_book_formats(),
            skip_images: default_false(),
            asset_workers: default_asset_workers(),
            chunk_max_chars: default_chunk_max_chars(),
            chunk_overlap_chars: default_chunk_overlap_chars(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 11] = [
            FieldMeta {
                name: "source_host",
                description: "内容源站点地址（用于补全根相对资源链接）",
            },
            FieldMeta {
                name: "request_timeout",
                description: "请求超时时间（秒）",
            },
            FieldMeta {
                name: "max_retries",
                description: "请求最大重试次数",
            },
            FieldMeta {
                name: "user_agent",
                description: "请求使用的 User-Agent",
            },
            FieldMeta {
                name: "session_cookie",
                description: "会话 Cookie（登录态由外部提供，留空则匿名访问）",
            },
            FieldMeta {
                name: "save_path",
                description: "保存路径（留空使用当前目录）",
            },
            FieldMeta {
                name: "book_formats",
                description: "默认输出格式, 逗号分隔, 可选: [epub, markdown, pdf, plaintext, json, jsonl, chunks, all]",
            },
            FieldMeta {
                name: "skip_images",
                description: "是否跳过图片下载",
            },
            FieldMeta {
                name: "asset_workers",
                description: "样式/图片下载并发线程数",
            },
            FieldMeta {
                name: "chunk_max_chars",
                description: "分块导出的单块字符数上限",
            },
            FieldMeta {
                name: "chunk_overlap_chars",
                description: "相邻分块之间的重叠字符数",
            },
        ];
        &FIELDS
    }
}

impl Config {
    pub fn default_save_dir(&self) -> PathBuf {
        if self.save_path.trim().is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.save_path)
        }
    }
}

/// 文件系统安全名：替换非法字符、去掉结尾空白与点号、避开保留名并按
/// 字符边界截断。
pub fn safe_fs_name(name: &str, replacement: &str, max_len: usize) -> String {
    let repl = replacement.chars().next().unwrap_or('_');
    let mut cleaned: String = name
        .chars()
        .map(|ch| match ch {
            ':' | '"' | '<' | '>' | '/' | '\\' | '|' | '?' | '*' => repl,
            c if (c as u32) < 32 => repl,
            _ => ch,
        })
        .collect();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }

    if cleaned.is_empty() {
        cleaned.push_str("unnamed");
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let upper = cleaned.to_uppercase();
    if RESERVED.contains(&upper.as_str()) {
        cleaned = format!("_{}", cleaned);
    }

    if cleaned.len() > max_len {
        // 避免在多字节 UTF-8 字符中间截断导致 panic
        let mut end = max_len;
        while !cleaned.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        cleaned.truncate(end);
        while cleaned.ends_with(' ') || cleaned.ends_with('.') {
            cleaned.pop();
        }
        if cleaned.is_empty() {
            cleaned.push_str("unnamed");
        }
    }

    cleaned
}

fn default_false() -> bool {
    false
}

fn default_source_host() -> String {
    "https://learning.oreilly.com".to_string()
}

fn default_request_timeout() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120 Safari/537.36".to_string()
}

fn default_string() -> String {
    String::new()
}

fn default_book_formats() -> String {
    "epub".to_string()
}

fn default_asset_workers() -> usize {
    8
}

fn default_chunk_max_chars() -> usize {
    4000
}

fn default_chunk_overlap_chars() -> usize {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_fs_name_replaces_forbidden_characters() {
        assert_eq!(
            safe_fs_name("Designing Data-Intensive Applications: 2nd?", "_", 120),
            "Designing Data-Intensive Applications_ 2nd_"
        );
        assert_eq!(safe_fs_name("a/b\\c", "_", 120), "a_b_c");
    }

    #[test]
    fn safe_fs_name_strips_trailing_dots_and_reserved_names() {
        assert_eq!(safe_fs_name("ending. ", "_", 120), "ending");
        assert_eq!(safe_fs_name("CON", "_", 120), "_CON");
        assert_eq!(safe_fs_name("", "_", 120), "unnamed");
    }

    #[test]
    fn safe_fs_name_truncates_on_char_boundary() {
        let name = safe_fs_name("日本語タイトル", "_", 7);
        assert!(name.len() <= 7);
        assert!(!name.is_empty());
    }
}
