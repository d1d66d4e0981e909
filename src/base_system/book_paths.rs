//! 书籍输出目录布局。
//!
//! `<输出根>/<safe_id>_<safe_title>/` 为书籍目录；章节文档与资源放在
//! `OEBPS/` 下（`Images/`、`Styles/` 子目录），与 EPUB 打包布局一致。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::base_system::context::safe_fs_name;

pub fn book_folder_name(book_id: &str, title: &str) -> String {
    let safe_book_id = safe_fs_name(book_id, "_", 120);
    let safe_title = safe_fs_name(if title.trim().is_empty() { book_id } else { title }, "_", 120);
    format!("{}_{}", safe_book_id, safe_title)
}

/// 创建书籍目录（含父目录），返回其路径。
pub fn create_book_dir(
    output_root: &Path,
    book_id: &str,
    title: &str,
    authors: &[String],
) -> io::Result<PathBuf> {
    let dir = output_root.join(book_folder_name(book_id, title));
    fs::create_dir_all(&dir)?;
    debug!(target: "output", path = %dir.display(), authors = %authors.join(", "), "创建书籍目录");
    Ok(dir)
}

pub fn content_dir(book_dir: &Path) -> PathBuf {
    book_dir.join("OEBPS")
}

pub fn images_dir(book_dir: &Path) -> PathBuf {
    content_dir(book_dir).join("Images")
}

pub fn styles_dir(book_dir: &Path) -> PathBuf {
    content_dir(book_dir).join("Styles")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_dir_name_is_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = create_book_dir(
            tmp.path(),
            "9781449373320",
            "Kafka: The Definitive Guide",
            &["Neha Narkhede".to_string()],
        )
        .unwrap();

        assert!(dir.exists());
        assert_eq!(
            dir.file_name().unwrap().to_str().unwrap(),
            "9781449373320_Kafka_ The Definitive Guide"
        );
    }

    #[test]
    fn layout_dirs_hang_off_oebps() {
        let book_dir = Path::new("/tmp/book");
        assert_eq!(content_dir(book_dir), Path::new("/tmp/book/OEBPS"));
        assert_eq!(images_dir(book_dir), Path::new("/tmp/book/OEBPS/Images"));
        assert_eq!(styles_dir(book_dir), Path::new("/tmp/book/OEBPS/Styles"));
    }

    #[test]
    fn empty_title_falls_back_to_id() {
        assert_eq!(book_folder_name("123", "  "), "123_123");
    }
}
