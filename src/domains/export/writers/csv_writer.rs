use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::domains::export::row_source::RowStream;
use crate::domains::export::schema::{ColumnDef, ExportRow};
use crate::domains::export::types::ExportFormat;
use crate::errors::{ExportError, ExportResult};

use super::{EncodeStats, ExportSink, RowEncoder};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone)]
pub struct CsvConfig {
    pub delimiter: u8,
    pub quote_char: u8,
    /// Prefix a UTF-8 BOM for spreadsheet tools that need one
    pub include_bom: bool,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote_char: b'"',
            include_bom: false,
        }
    }
}

impl CsvConfig {
    /// RFC 4180 quoting: a field is quoted only when it holds the delimiter,
    /// a quote or a line break; embedded quotes are doubled.
    fn writer<W: std::io::Write>(&self, target: W) -> csv::Writer<W> {
        csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .quote(self.quote_char)
            .double_quote(true)
            .quote_style(csv::QuoteStyle::Necessary)
            .terminator(csv::Terminator::CRLF)
            .from_writer(target)
    }

    /// Encode a single record, terminator included.
    fn encode_record<'a, I>(&self, fields: I) -> ExportResult<Vec<u8>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut wtr = self.writer(Vec::new());
        wtr.write_record(fields)?;
        wtr.into_inner()
            .map_err(|e| ExportError::EncodingFault(e.to_string()))
    }
}

fn header_labels(columns: &[&'static ColumnDef]) -> Vec<&'static str> {
    columns.iter().map(|c| c.label).collect()
}

fn cells<'a>(row: &'a ExportRow, columns: &[&'static ColumnDef]) -> Vec<&'a str> {
    columns.iter().map(|c| row.get(c.key)).collect()
}

/// Collects every row, then writes the whole body at once so its length is
/// known before the first byte goes out.
pub struct BufferedCsvEncoder {
    config: CsvConfig,
}

impl BufferedCsvEncoder {
    pub fn new(config: CsvConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RowEncoder for BufferedCsvEncoder {
    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    async fn encode(
        &mut self,
        columns: &[&'static ColumnDef],
        mut rows: RowStream,
        sink: ExportSink<'_>,
    ) -> ExportResult<EncodeStats> {
        let mut body = Vec::new();
        if self.config.include_bom {
            body.extend_from_slice(UTF8_BOM);
        }
        let mut wtr = self.config.writer(body);
        wtr.write_record(header_labels(columns))?;

        let mut count = 0u64;
        while let Some(row) = rows.next().await {
            let row = row?;
            wtr.write_record(cells(&row, columns))?;
            count += 1;
        }
        let body = wtr
            .into_inner()
            .map_err(|e| ExportError::EncodingFault(e.to_string()))?;

        sink.write_all(&body).await?;
        sink.flush().await?;
        log::debug!("Buffered CSV wrote {} rows ({} bytes)", count, body.len());

        Ok(EncodeStats {
            rows: count,
            bytes: body.len() as u64,
        })
    }
}

/// Writes the header straight away, then one flushed record per row.
/// Memory use does not grow with the number of rows.
pub struct StreamingCsvEncoder {
    config: CsvConfig,
}

impl StreamingCsvEncoder {
    pub fn new(config: CsvConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RowEncoder for StreamingCsvEncoder {
    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    async fn encode(
        &mut self,
        columns: &[&'static ColumnDef],
        mut rows: RowStream,
        sink: ExportSink<'_>,
    ) -> ExportResult<EncodeStats> {
        let mut stats = EncodeStats::default();

        if self.config.include_bom {
            sink.write_all(UTF8_BOM).await?;
            stats.bytes += UTF8_BOM.len() as u64;
        }
        let header = self.config.encode_record(header_labels(columns))?;
        sink.write_all(&header).await?;
        sink.flush().await?;
        stats.bytes += header.len() as u64;

        while let Some(row) = rows.next().await {
            // Past the header a fault can only truncate the body
            let row = row?;
            let line = self.config.encode_record(cells(&row, columns))?;
            sink.write_all(&line).await?;
            sink.flush().await?;
            stats.rows += 1;
            stats.bytes += line.len() as u64;
        }

        log::debug!("Streaming CSV wrote {} rows ({} bytes)", stats.rows, stats.bytes);
        Ok(stats)
    }
}
