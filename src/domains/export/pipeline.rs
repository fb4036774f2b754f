use crate::domains::export::entities::{projection, resolve_columns};
use crate::domains::export::row_source::RowSource;
use crate::domains::export::types::{DeliveryMode, ExportFormat, ExportRequest, ExportScope};
use crate::domains::export::writers::{
    BufferedCsvEncoder, CsvConfig, DocumentEncoder, DocumentLayout, EncodeStats, ExportSink, RowEncoder,
    StreamingCsvEncoder,
};
use crate::errors::ExportResult;

/// Which encoder a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderChoice {
    BufferedCsv,
    StreamingCsv,
    Document,
}

impl EncoderChoice {
    /// Delivery actually used; large synchronous CSV exports are promoted to streaming.
    pub fn delivery_for(&self, requested: DeliveryMode) -> DeliveryMode {
        match (requested, self) {
            (DeliveryMode::Sync, EncoderChoice::StreamingCsv) => DeliveryMode::Stream,
            (mode, _) => mode,
        }
    }
}

/// Row source plus encoder selection; shared by the synchronous handler and the workers.
#[derive(Clone)]
pub struct ExportPipeline {
    rows: RowSource,
    csv: CsvConfig,
    layout: DocumentLayout,
    document_row_ceiling: u64,
    buffer_threshold_rows: u64,
}

impl ExportPipeline {
    pub fn new(rows: RowSource, document_row_ceiling: u64, buffer_threshold_rows: u64) -> Self {
        Self {
            rows,
            csv: CsvConfig::default(),
            layout: DocumentLayout::default(),
            document_row_ceiling,
            buffer_threshold_rows,
        }
    }

    pub async fn estimate(&self, request: &ExportRequest, scope: &ExportScope) -> ExportResult<u64> {
        self.rows.estimate(request, scope).await
    }

    /// Pick an encoder for `request` given an estimated row count.
    ///
    /// Explicit `stream` always streams. A `sync` CSV export is buffered until
    /// the estimate passes the threshold. Background jobs write to storage, so
    /// they stream.
    pub fn choose_encoder(&self, request: &ExportRequest, estimate: u64) -> EncoderChoice {
        match (request.format, request.delivery_mode) {
            (ExportFormat::Document, _) => EncoderChoice::Document,
            (ExportFormat::Csv, DeliveryMode::Stream | DeliveryMode::Async) => EncoderChoice::StreamingCsv,
            (ExportFormat::Csv, DeliveryMode::Sync) if estimate > self.buffer_threshold_rows => {
                EncoderChoice::StreamingCsv
            }
            (ExportFormat::Csv, DeliveryMode::Sync) => EncoderChoice::BufferedCsv,
        }
    }

    fn encoder(&self, choice: EncoderChoice) -> Box<dyn RowEncoder> {
        match choice {
            EncoderChoice::BufferedCsv => Box::new(BufferedCsvEncoder::new(self.csv.clone())),
            EncoderChoice::StreamingCsv => Box::new(StreamingCsvEncoder::new(self.csv.clone())),
            EncoderChoice::Document => Box::new(DocumentEncoder::new(self.layout.clone(), self.document_row_ceiling)),
        }
    }

    /// Stream rows for `request` through the chosen encoder into `sink`.
    pub async fn run(
        &self,
        request: &ExportRequest,
        scope: &ExportScope,
        choice: EncoderChoice,
        sink: ExportSink<'_>,
    ) -> ExportResult<EncodeStats> {
        let projection = projection(request.entity_type)?;
        let columns = resolve_columns(projection.as_ref(), &request.columns);
        let mut encoder = self.encoder(choice);
        log::info!(
            "Exporting {} as {} via {:?} ({} columns)",
            request.entity_type,
            encoder.format().as_str(),
            choice,
            columns.len()
        );

        let rows = self.rows.open(request, scope)?;
        let stats = encoder.encode(&columns, rows, sink).await?;
        log::info!(
            "Exported {} {} rows ({} bytes)",
            stats.rows,
            request.entity_type,
            stats.bytes
        );
        Ok(stats)
    }
}
