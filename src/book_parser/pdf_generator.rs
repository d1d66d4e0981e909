//! PDF 生成器。
//!
//! 基于 printpdf 的内置字体排版：A4 页面、封面页 + 逐章正文，纯文本
//! 按词折行。内置字体只覆盖 WinAnsi 字符集，超出部分以 `?` 占位。

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfDocumentReference};
use tracing::debug;

use crate::base_system::context::safe_fs_name;
use crate::download::dispatch::{PdfGenerator, RenderContext};
use crate::download::models::ChapterContent;

use super::html_utils::html_to_text;

const PAGE_W: f32 = 210.0;
const PAGE_H: f32 = 297.0;
const MARGIN: f32 = 20.0;
const LINE_H: f32 = 5.5;
const BODY_SIZE: f32 = 10.0;
const HEADING_SIZE: f32 = 16.0;
const TITLE_SIZE: f32 = 22.0;
const CHARS_PER_LINE: usize = 95;

#[derive(Debug, Default)]
pub struct PdfRenderer;

impl PdfRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl PdfGenerator for PdfRenderer {
    fn generate(&self, ctx: &RenderContext<'_>) -> Result<PathBuf> {
        let path = ctx
            .book_dir
            .join(format!("{}.pdf", safe_fs_name(&ctx.meta.title, "_", 120)));
        let doc = render_document(&ctx.meta.title, &ctx.meta.authors.join(", "), ctx.contents)?;
        save_document(doc, &path)?;
        debug!(target: "generate", path = %path.display(), "PDF 生成完成");
        Ok(path)
    }

    fn generate_chapters(&self, ctx: &RenderContext<'_>) -> Result<Vec<PathBuf>> {
        let pdf_dir = ctx.book_dir.join("PDF");
        fs::create_dir_all(&pdf_dir)
            .with_context(|| format!("create pdf dir {}", pdf_dir.display()))?;

        let mut paths = Vec::with_capacity(ctx.contents.len());
        for (i, content) in ctx.contents.iter().enumerate() {
            let name = format!("{:03}_{}.pdf", i + 1, safe_fs_name(&content.title, "_", 60));
            let path = pdf_dir.join(&name);
            let doc = render_document(
                &content.title,
                &ctx.meta.title,
                std::slice::from_ref(content),
            )?;
            save_document(doc, &path)?;
            paths.push(path);
        }
        debug!(target: "generate", chapters = paths.len(), "分章 PDF 生成完成");
        Ok(paths)
    }
}

fn render_document(
    title: &str,
    subtitle: &str,
    chapters: &[ChapterContent],
) -> Result<PdfDocumentReference> {
    let (doc, cover_page, cover_layer) =
        PdfDocument::new(title, Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
    let regular = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| anyhow!(e.to_string()))?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| anyhow!(e.to_string()))?;

    // 封面页
    let cover = doc.get_page(cover_page).get_layer(cover_layer);
    cover.use_text(win_ansi(title), TITLE_SIZE, Mm(MARGIN), Mm(PAGE_H - 60.0), &bold);
    if !subtitle.trim().is_empty() {
        cover.use_text(
            win_ansi(subtitle),
            12.0,
            Mm(MARGIN),
            Mm(PAGE_H - 72.0),
            &regular,
        );
    }

    for content in chapters {
        render_chapter(&doc, content, &regular, &bold);
    }

    Ok(doc)
}

fn render_chapter(
    doc: &PdfDocumentReference,
    content: &ChapterContent,
    regular: &IndirectFontRef,
    bold: &IndirectFontRef,
) {
    let (page, layer_idx) = doc.add_page(Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
    let mut layer = doc.get_page(page).get_layer(layer_idx);
    let mut y = PAGE_H - MARGIN;

    layer.use_text(win_ansi(&content.title), HEADING_SIZE, Mm(MARGIN), Mm(y), bold);
    y -= LINE_H * 2.0;

    let text = html_to_text(&content.body);
    for para in text.split('\n') {
        if para.trim().is_empty() {
            y -= LINE_H / 2.0;
            continue;
        }
        for line in textwrap::wrap(para, CHARS_PER_LINE) {
            if y < MARGIN {
                let (page, layer_idx) = doc.add_page(Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
                layer = doc.get_page(page).get_layer(layer_idx);
                y = PAGE_H - MARGIN;
            }
            layer.use_text(win_ansi(&line), BODY_SIZE, Mm(MARGIN), Mm(y), regular);
            y -= LINE_H;
        }
    }
}

fn save_document(doc: PdfDocumentReference, path: &std::path::Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    doc.save(&mut BufWriter::new(file))
        .map_err(|e| anyhow!(e.to_string()))
}

/// 内置字体仅支持 WinAnsi 编码，超出范围的字符降级为 `?`。
fn win_ansi(text: &str) -> String {
    text.chars()
        .map(|c| if (c as u32) < 256 { c } else { '?' })
        .collect()
}
