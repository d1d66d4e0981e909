//! EPUB 生成器。

use std::fs;
use std::io::{Cursor, Read as _, Write as _};
use std::path::PathBuf;

use anyhow::Result;
use epub_builder::{EpubBuilder, EpubContent, EpubVersion, ReferenceType, ZipLibrary};
use tracing::debug;

use crate::base_system::book_paths;
use crate::base_system::context::safe_fs_name;
use crate::download::dispatch::{EpubGenerator, RenderContext};

use super::asset_fetcher::css_file_name;
use super::html_utils::escape_html;

/// 用于从 book_id 确定性生成 UUID v5 的命名空间。
/// 这保证同一本书（同 book_id）的 dc:identifier 永远不变。
const EPUB_UUID_NAMESPACE: uuid::Uuid = uuid::Uuid::from_bytes([
    0x6b, 0xa7, 0xb8, 0x10, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30, 0xc8,
]);

const FALLBACK_CSS: &str = "body { font-family: serif; color:#000; line-height:1.5; }\n\
p { margin:0 0 .8em 0; line-height:1.5; }\n\
h1, h2, h3 { font-weight:600; }\n\
img { max-width:100%; height:auto; }\n\
pre, code { font-family: monospace; }";

#[derive(Debug, Default)]
pub struct EpubPackager;

impl EpubPackager {
    pub fn new() -> Self {
        Self
    }
}

impl EpubGenerator for EpubPackager {
    fn generate(&self, ctx: &RenderContext<'_>) -> Result<PathBuf> {
        let zip = ZipLibrary::new().map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let mut book = EpubBuilder::new(zip).map_err(|e| anyhow::anyhow!(e.to_string()))?;

        book.epub_version(EpubVersion::V30);

        // UUID v5 从 book_id 确定性生成 dc:identifier，阅读器可据此恢复进度。
        let stable_uuid = uuid::Uuid::new_v5(&EPUB_UUID_NAMESPACE, ctx.meta.id.as_bytes());
        book.set_uuid(stable_uuid);
        book.metadata("title", &ctx.meta.title).ok();
        book.metadata("lang", "en").ok();
        // toc_name 用书名，避免目录页显示默认的 "Table Of Contents"。
        book.metadata("toc_name", &ctx.meta.title).ok();

        for author in &ctx.meta.authors {
            let author = author.trim();
            if !author.is_empty() {
                book.metadata("author", author).ok();
            }
        }
        if let Some(description) = ctx.meta.description.as_deref() {
            let description = description.trim();
            if !description.is_empty() {
                book.metadata("description", description).ok();
            }
        }
        book.metadata("generator", "oreilly-book-downloader").ok();

        // 封面（下载阶段已落盘为 Images/cover.jpg）
        let images_dir = book_paths::images_dir(ctx.book_dir);
        let cover_path = images_dir.join("cover.jpg");
        if let Ok(bytes) = fs::read(&cover_path) {
            book.add_cover_image("Images/cover.jpg", Cursor::new(bytes), "image/jpeg")
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }

        // 样式表：把资源阶段下载的 StyleNN.css 按清单顺序拼成一份。
        // 用 stylesheet() 而非 add_resource()，防止 epub-builder 再建一份空样式。
        let styles_dir = book_paths::styles_dir(ctx.book_dir);
        let mut css = String::new();
        for index in 0..ctx.manifest.css_urls().len() {
            if let Ok(sheet) = fs::read_to_string(styles_dir.join(css_file_name(index))) {
                css.push_str(&sheet);
                css.push('\n');
            }
        }
        if css.trim().is_empty() {
            css = FALLBACK_CSS.to_string();
        }
        book.stylesheet(Cursor::new(css))
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        // 章节里引用的本地图片
        if let Ok(entries) = fs::read_dir(&images_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().to_string();
                if name == "cover.jpg" || !entry.path().is_file() {
                    continue;
                }
                if let Ok(bytes) = fs::read(entry.path()) {
                    book.add_resource(
                        format!("Images/{name}"),
                        Cursor::new(bytes),
                        mime_for(&name),
                    )
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                }
            }
        }

        for (i, content) in ctx.contents.iter().enumerate() {
            let file_name = format!("chapter_{:05}.xhtml", i);
            let html = wrap_chapter_html(&content.title, &content.body);
            book.add_content(
                EpubContent::new(file_name, Cursor::new(html))
                    .title(content.title.clone())
                    .reftype(ReferenceType::Text),
            )
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }

        let output_path = ctx
            .book_dir
            .join(format!("{}.epub", safe_fs_name(&ctx.meta.title, "_", 120)));

        // 先生成到内存，再后处理替换 dc:identifier 为原始 book_id。
        // epub-builder 强制输出 urn:uuid:xxx，无法通过 API 设置纯文本 identifier。
        let mut buffer = Vec::new();
        book.generate(&mut buffer)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let buffer = fixup_epub_identifier(buffer, &ctx.meta.id, stable_uuid)?;
        fs::write(&output_path, buffer)?;

        debug!(target: "generate", path = %output_path.display(), "EPUB 打包完成");
        Ok(output_path)
    }
}

/// 后处理 EPUB zip：
/// 1. content.opf 与 toc.ncx 中的 `urn:uuid:xxx` 替换为原始 book_id
/// 2. toc.ncx 的 `<head>` 中补充 `<meta name="dtb:uid" .../>`
fn fixup_epub_identifier(
    epub_bytes: Vec<u8>,
    book_id: &str,
    stable_uuid: uuid::Uuid,
) -> Result<Vec<u8>> {
    let urn_str = format!("urn:uuid:{}", stable_uuid.hyphenated());

    let reader = Cursor::new(epub_bytes);
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| anyhow::anyhow!("failed to read generated epub: {e}"))?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| anyhow::anyhow!("zip entry read error: {e}"))?;
        let name = entry.name().to_string();
        let compression = entry.compression();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.push((name, compression, data));
    }
    drop(archive);

    let dtb_uid_meta = format!("<meta name=\"dtb:uid\" content=\"{}\" />", book_id);
    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut out);
        for (name, compression, data) in entries {
            let needs_fixup = name.ends_with("content.opf") || name.ends_with("toc.ncx");
            let options = zip::write::FileOptions::default().compression_method(compression);
            writer
                .start_file(&name, options)
                .map_err(|e| anyhow::anyhow!("zip write error: {e}"))?;

            if needs_fixup {
                match String::from_utf8(data) {
                    Ok(text) => {
                        let mut fixed = text.replace(&urn_str, book_id);
                        if name.ends_with("toc.ncx") && !fixed.contains("dtb:uid") {
                            fixed = fixed.replace(
                                "<meta name=\"dtb:depth\"",
                                &format!("{}\n    <meta name=\"dtb:depth\"", dtb_uid_meta),
                            );
                        }
                        writer.write_all(fixed.as_bytes())?;
                    }
                    Err(e) => {
                        writer.write_all(&e.into_bytes())?;
                    }
                }
            } else {
                writer.write_all(&data)?;
            }
        }
        writer
            .finish()
            .map_err(|e| anyhow::anyhow!("zip finish error: {e}"))?;
    }

    Ok(out.into_inner())
}

fn mime_for(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".svg") {
        "image/svg+xml"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

fn wrap_chapter_html(title: &str, body: &str) -> String {
    let escaped_title = escape_html(title);
    format!(
        "<?xml version='1.0' encoding='utf-8'?>\n<!DOCTYPE html>\n<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"en\" xml:lang=\"en\">\n  <head>\n    <title>{}</title>\n    <link href=\"stylesheet.css\" rel=\"stylesheet\" type=\"text/css\"/>\n  </head>\n  <body><h1>{}</h1>\n{}\n  </body>\n</html>",
        escaped_title, escaped_title, body
    )
}

#[cfg(test)]
mod tests {
    use crate::download::models::{
        AssetManifest, BookMetadata, ChapterContent, TocStructure,
    };

    use super::*;

    #[test]
    fn epub_file_is_a_zip_with_sanitized_name() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = BookMetadata {
            id: "9781449373320".to_string(),
            title: "Kafka: The Definitive Guide".to_string(),
            authors: vec!["Neha Narkhede".to_string()],
            ..BookMetadata::default()
        };
        let contents = vec![ChapterContent {
            filename: "ch01.html".to_string(),
            title: "Meet Kafka".to_string(),
            body: "<p>logs everywhere</p>".to_string(),
        }];
        let toc = TocStructure::default();
        let manifest = AssetManifest::default();
        let ctx = RenderContext {
            meta: &meta,
            chapters: &[],
            contents: &contents,
            toc: &toc,
            manifest: &manifest,
            book_dir: tmp.path(),
        };

        let path = EpubPackager::new().generate(&ctx).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "Kafka_ The Definitive Guide.epub"
        );
        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"PK"));
    }

    #[test]
    fn mime_detection_covers_common_types() {
        assert_eq!(mime_for("a.PNG"), "image/png");
        assert_eq!(mime_for("b.webp"), "image/webp");
        assert_eq!(mime_for("c.jpg"), "image/jpeg");
        assert_eq!(mime_for("d.unknown"), "image/jpeg");
    }
}
