use async_trait::async_trait;
use futures::StreamExt;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::iter;
use tokio::io::AsyncWriteExt;
use tokio::task;

use crate::domains::export::row_source::RowStream;
use crate::domains::export::schema::ColumnDef;
use crate::domains::export::types::ExportFormat;
use crate::errors::{ExportError, ExportResult};

use super::{EncodeStats, ExportSink, RowEncoder};

/// Glyph advance of the monospaced faces, as a fraction of the font size.
const CHAR_WIDTH_EM: f32 = 0.6;
const ELLIPSIS: char = '\u{2026}';

/// Page geometry for the paginated table, in PDF points.
#[derive(Debug, Clone)]
pub struct DocumentLayout {
    pub page_width: f32,
    pub page_height: f32,
    pub margin: f32,
    pub base_font_size: u32,
    /// Readability floor; columns shrink further only by truncating cells
    pub min_font_size: u32,
    pub min_column_width: f32,
    pub cell_padding: f32,
    /// Cap on the width a single long value may claim, in characters
    pub max_natural_chars: usize,
    pub page_numbers: bool,
}

impl Default for DocumentLayout {
    /// A4 landscape.
    fn default() -> Self {
        Self {
            page_width: 842.0,
            page_height: 595.0,
            margin: 36.0,
            base_font_size: 9,
            min_font_size: 6,
            min_column_width: 36.0,
            cell_padding: 3.0,
            max_natural_chars: 48,
            page_numbers: true,
        }
    }
}

impl DocumentLayout {
    fn char_width(font_size: u32) -> f32 {
        font_size as f32 * CHAR_WIDTH_EM
    }

    fn row_height(font_size: u32) -> f32 {
        font_size as f32 + 4.0
    }

    /// Fit the columns to the page: step the font down towards the floor, then
    /// shrink columns proportionally, never below `min_column_width`. If even
    /// that does not fit, the page is widened.
    fn plan(&self, labels: &[&str], rows: &[Vec<String>]) -> TablePlan {
        let natural: Vec<usize> = (0..labels.len())
            .map(|i| {
                rows.iter()
                    .map(|row| row[i].chars().count())
                    .chain(iter::once(labels[i].chars().count()))
                    .max()
                    .unwrap_or(1)
                    .clamp(1, self.max_natural_chars.max(1))
            })
            .collect();
        let padding = 2.0 * self.cell_padding;
        let natural_widths = |font_size: u32| -> Vec<f32> {
            natural
                .iter()
                .map(|&chars| chars as f32 * Self::char_width(font_size) + padding)
                .collect()
        };

        let floor = self.min_font_size.min(self.base_font_size);
        for font_size in (floor..=self.base_font_size).rev() {
            let widths = natural_widths(font_size);
            if widths.iter().sum::<f32>() <= self.page_width - 2.0 * self.margin {
                return TablePlan::new(self, font_size, self.page_width, widths);
            }
        }

        let minimum_table = labels.len() as f32 * self.min_column_width;
        let page_width = self.page_width.max(minimum_table + 2.0 * self.margin);
        let usable = page_width - 2.0 * self.margin;
        let preferred = natural_widths(floor);

        let mut pinned = vec![false; preferred.len()];
        let widths = loop {
            let pinned_count = pinned.iter().filter(|p| **p).count();
            let free_total: f32 = preferred
                .iter()
                .zip(&pinned)
                .filter(|(_, p)| !**p)
                .map(|(w, _)| *w)
                .sum();
            if free_total <= 0.0 {
                break vec![self.min_column_width; preferred.len()];
            }
            let scale = (usable - pinned_count as f32 * self.min_column_width) / free_total;

            let mut newly_pinned = false;
            for (width, pin) in preferred.iter().zip(pinned.iter_mut()) {
                if !*pin && width * scale < self.min_column_width {
                    *pin = true;
                    newly_pinned = true;
                }
            }
            if !newly_pinned {
                break preferred
                    .iter()
                    .zip(&pinned)
                    .map(|(w, p)| if *p { self.min_column_width } else { w * scale })
                    .collect();
            }
        };

        TablePlan::new(self, floor, page_width, widths)
    }
}

/// Resolved geometry for one document.
#[derive(Debug, Clone)]
struct TablePlan {
    font_size: u32,
    page_width: f32,
    widths: Vec<f32>,
    /// Characters that fit in each column before truncation
    max_chars: Vec<usize>,
    rows_per_page: usize,
}

impl TablePlan {
    fn new(layout: &DocumentLayout, font_size: u32, page_width: f32, widths: Vec<f32>) -> Self {
        let char_width = DocumentLayout::char_width(font_size);
        let max_chars = widths
            .iter()
            .map(|w| (((w - 2.0 * layout.cell_padding) / char_width).floor() as usize).max(1))
            .collect();

        let row_height = DocumentLayout::row_height(font_size);
        let footer = if layout.page_numbers { row_height } else { 0.0 };
        let body_height = layout.page_height - 2.0 * layout.margin - footer;
        // One slot goes to the header repeated on every page
        let rows_per_page = ((body_height / row_height).floor() as usize).saturating_sub(1).max(1);

        Self {
            font_size,
            page_width,
            widths,
            max_chars,
            rows_per_page,
        }
    }

    fn page_count(&self, rows: usize) -> usize {
        rows.div_ceil(self.rows_per_page).max(1)
    }
}

/// Single-line cell text, cut with an ellipsis when it overflows.
fn fit_cell(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push(ELLIPSIS);
    cut
}

/// Encode for the standard Type 1 fonts; unmappable characters become `?`.
fn to_win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c {
            ' '..='~' => c as u8,
            '\u{a0}'..='\u{ff}' => c as u32 as u8,
            '\u{20ac}' => 0x80,
            '\u{2026}' => 0x85,
            '\u{2018}' => 0x91,
            '\u{2019}' => 0x92,
            '\u{201c}' => 0x93,
            '\u{201d}' => 0x94,
            '\u{2013}' => 0x96,
            '\u{2014}' => 0x97,
            _ => b'?',
        })
        .collect()
}

fn show_text(ops: &mut Vec<Operation>, font: &str, size: u32, x: f32, y: f32, text: &str) {
    ops.push(Operation::new("BT", vec![]));
    ops.push(Operation::new(
        "Tf",
        vec![Object::Name(font.as_bytes().to_vec()), Object::Integer(size as i64)],
    ));
    ops.push(Operation::new(
        "Td",
        vec![Object::Integer(x.round() as i64), Object::Integer(y.round() as i64)],
    ));
    ops.push(Operation::new("Tj", vec![Object::string_literal(to_win_ansi(text))]));
    ops.push(Operation::new("ET", vec![]));
}

fn pdf_fault(e: impl std::fmt::Display) -> ExportError {
    ExportError::EncodingFault(format!("PDF generation failed: {}", e))
}

/// Lay out `rows` under `labels` as a paginated table and serialize the PDF.
fn render(layout: &DocumentLayout, labels: &[&str], rows: &[Vec<String>]) -> ExportResult<Vec<u8>> {
    let plan = layout.plan(labels, rows);
    let row_height = DocumentLayout::row_height(plan.font_size);
    let page_count = plan.page_count(rows.len());
    let table_right = layout.margin + plan.widths.iter().sum::<f32>();

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let regular = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
        "Encoding" => "WinAnsiEncoding",
    });
    let bold = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier-Bold",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => regular, "F2" => bold },
    });

    let mut kids = Vec::with_capacity(page_count);
    for page_index in 0..page_count {
        let start = page_index * plan.rows_per_page;
        let end = (start + plan.rows_per_page).min(rows.len());
        let page_rows = rows.get(start..end).unwrap_or(&[]);

        let mut ops = Vec::new();
        let top = layout.page_height - layout.margin;
        let baseline = |slot: usize| top - (slot as f32 + 1.0) * row_height + 3.0;

        let mut x = layout.margin;
        for (i, label) in labels.iter().enumerate() {
            let text = fit_cell(label, plan.max_chars[i]);
            show_text(&mut ops, "F2", plan.font_size, x + layout.cell_padding, baseline(0), &text);
            x += plan.widths[i];
        }
        let rule_y = (top - row_height).round() as i64;
        ops.push(Operation::new("m", vec![Object::Integer(layout.margin.round() as i64), Object::Integer(rule_y)]));
        ops.push(Operation::new("l", vec![Object::Integer(table_right.round() as i64), Object::Integer(rule_y)]));
        ops.push(Operation::new("S", vec![]));

        for (slot, row) in page_rows.iter().enumerate() {
            let mut x = layout.margin;
            for (i, cell) in row.iter().enumerate() {
                if !cell.is_empty() {
                    let text = fit_cell(cell, plan.max_chars[i]);
                    show_text(&mut ops, "F1", plan.font_size, x + layout.cell_padding, baseline(slot + 1), &text);
                }
                x += plan.widths[i];
            }
        }

        if layout.page_numbers {
            let footer = format!("Page {} of {}", page_index + 1, page_count);
            show_text(&mut ops, "F1", plan.font_size, layout.margin, layout.margin, &footer);
        }

        let content = Content { operations: ops };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().map_err(pdf_fault)?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(plan.page_width.round() as i64),
                Object::Integer(layout.page_height.round() as i64),
            ],
        });
        kids.push(Object::Reference(page_id));
    }

    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => Object::Integer(page_count as i64),
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).map_err(pdf_fault)?;
    Ok(out)
}

/// Paginated table document. Pagination needs every row up front, so rows are
/// buffered and the export is refused once they pass `row_ceiling`.
pub struct DocumentEncoder {
    layout: DocumentLayout,
    row_ceiling: u64,
}

impl DocumentEncoder {
    pub fn new(layout: DocumentLayout, row_ceiling: u64) -> Self {
        Self { layout, row_ceiling }
    }
}

#[async_trait]
impl RowEncoder for DocumentEncoder {
    fn format(&self) -> ExportFormat {
        ExportFormat::Document
    }

    async fn encode(
        &mut self,
        columns: &[&'static ColumnDef],
        mut rows: RowStream,
        sink: ExportSink<'_>,
    ) -> ExportResult<EncodeStats> {
        let mut buffered: Vec<Vec<String>> = Vec::new();
        while let Some(row) = rows.next().await {
            let row = row?;
            if buffered.len() as u64 >= self.row_ceiling {
                return Err(ExportError::ExportTooLarge {
                    rows: buffered.len() as u64 + 1,
                    limit: self.row_ceiling,
                });
            }
            buffered.push(columns.iter().map(|c| row.get(c.key).to_string()).collect());
        }

        let row_count = buffered.len() as u64;
        let labels: Vec<&'static str> = columns.iter().map(|c| c.label).collect();
        let layout = self.layout.clone();
        // Layout and serialization are CPU bound; keep them off the async workers
        let bytes = task::spawn_blocking(move || render(&layout, &labels, &buffered))
            .await
            .map_err(|e| pdf_fault(format!("render task failed: {}", e)))??;
        sink.write_all(&bytes).await?;
        sink.flush().await?;
        log::debug!("Document export rendered {} rows ({} bytes)", row_count, bytes.len());

        Ok(EncodeStats {
            rows: row_count,
            bytes: bytes.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::entities::{projection, resolve_columns};
    use crate::domains::export::schema::ExportRow;
    use crate::domains::export::types::EntityType;
    use futures::stream;

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn grid(columns: usize, rows: usize, text: &str) -> (Vec<String>, Vec<Vec<String>>) {
        let labels = (0..columns).map(|i| format!("Col {}", i)).collect();
        let body = (0..rows).map(|_| vec![text.to_string(); columns]).collect();
        (labels, body)
    }

    #[test]
    fn narrow_tables_keep_the_base_font() {
        let layout = DocumentLayout::default();
        let (labels, rows) = grid(3, 5, "short");
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        let plan = layout.plan(&labels, &rows);
        assert_eq!(plan.font_size, layout.base_font_size);
        assert_eq!(plan.page_width, layout.page_width);
    }

    #[test]
    fn wide_tables_compress_to_the_floor_but_not_below() {
        let layout = DocumentLayout::default();
        let (labels, rows) = grid(14, 3, &"x".repeat(80));
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        let plan = layout.plan(&labels, &rows);

        assert_eq!(plan.font_size, layout.min_font_size);
        assert_eq!(plan.page_width, layout.page_width);
        let total: f32 = plan.widths.iter().sum();
        assert!(total <= layout.page_width - 2.0 * layout.margin + 0.01);
        assert!(plan.widths.iter().all(|w| *w >= layout.min_column_width - 0.01));
        assert!(plan.max_chars.iter().all(|c| *c < 80));
    }

    #[test]
    fn too_many_columns_widen_the_page() {
        let layout = DocumentLayout::default();
        let (labels, rows) = grid(30, 1, "value");
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        let plan = layout.plan(&labels, &rows);
        assert!(plan.page_width > layout.page_width);
        assert!(plan.widths.iter().all(|w| (*w - layout.min_column_width).abs() < 0.01));
    }

    #[test]
    fn overflowing_cells_are_truncated_with_an_ellipsis() {
        assert_eq!(fit_cell("abcdefgh", 5), "abcd\u{2026}");
        assert_eq!(fit_cell("abc", 5), "abc");
        assert_eq!(fit_cell("two\nlines", 20), "two lines");
        assert_eq!(to_win_ansi("caf\u{e9} \u{2026}\u{4e2d}"), vec![b'c', b'a', b'f', 0xE9, b' ', 0x85, b'?']);
    }

    #[test]
    fn rows_paginate_with_a_header_on_each_page() {
        let layout = DocumentLayout::default();
        let (labels, rows) = grid(2, 100, "v");
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        let plan = layout.plan(&labels, &rows);
        let bytes = render(&layout, &labels, &rows).unwrap();

        let doc = Document::load_mem(&bytes).unwrap();
        let expected = plan.page_count(100);
        assert!(expected > 1);
        assert_eq!(doc.get_pages().len(), expected);
        assert!(contains(&bytes, format!("(Page {} of {})", expected, expected).as_bytes()));
    }

    fn invoice_columns() -> Vec<&'static ColumnDef> {
        let p = projection(EntityType::Invoice).unwrap();
        resolve_columns(p.as_ref(), &["number".to_string(), "status".to_string()])
    }

    fn invoice_rows(n: usize) -> RowStream {
        let rows: Vec<ExportResult<ExportRow>> = (0..n)
            .map(|i| {
                let mut row = ExportRow::with_capacity(2);
                row.push("number", format!("INV-{:04}", i));
                row.push("status", "paid".to_string());
                Ok(row)
            })
            .collect();
        Box::pin(stream::iter(rows))
    }

    #[tokio::test]
    async fn empty_export_is_a_valid_single_page_document() {
        let mut out: Vec<u8> = Vec::new();
        let stats = DocumentEncoder::new(DocumentLayout::default(), 10)
            .encode(&invoice_columns(), invoice_rows(0), &mut out)
            .await
            .unwrap();
        assert_eq!(stats.rows, 0);
        let doc = Document::load_mem(&out).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
        assert!(contains(&out, b"(Invoice #)"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rendering_does_not_hold_the_runtime() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let ticks = Arc::new(AtomicU64::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut out: Vec<u8> = Vec::new();
        let stats = DocumentEncoder::new(DocumentLayout::default(), 1_000)
            .encode(&invoice_columns(), invoice_rows(400), &mut out)
            .await
            .unwrap();
        ticker.abort();

        assert_eq!(stats.rows, 400);
        assert!(ticks.load(Ordering::SeqCst) > 0);
        assert!(Document::load_mem(&out).is_ok());
    }

    #[tokio::test]
    async fn rows_over_the_ceiling_are_refused_before_any_output() {
        let mut out: Vec<u8> = Vec::new();
        let err = DocumentEncoder::new(DocumentLayout::default(), 3)
            .encode(&invoice_columns(), invoice_rows(4), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::ExportTooLarge { limit: 3, .. }));
        assert!(out.is_empty());

        let stats = DocumentEncoder::new(DocumentLayout::default(), 3)
            .encode(&invoice_columns(), invoice_rows(3), &mut out)
            .await
            .unwrap();
        assert_eq!(stats.rows, 3);
        assert!(contains(&out, b"(INV-0002)"));
    }
}
