pub mod csv_writer;
pub mod document_writer;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

use crate::domains::export::row_source::RowStream;
use crate::domains::export::schema::ColumnDef;
use crate::domains::export::types::ExportFormat;
use crate::errors::ExportResult;

pub use csv_writer::{BufferedCsvEncoder, CsvConfig, StreamingCsvEncoder};
pub use document_writer::{DocumentEncoder, DocumentLayout};

/// Where encoded bytes go: a response body, a file, a buffer.
pub type ExportSink<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// Counters reported once an encoder has drained its rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeStats {
    pub rows: u64,
    pub bytes: u64,
}

/// Serializes a row stream into one artifact.
///
/// An error means the sink may hold a truncated artifact; callers must not
/// present it as complete.
#[async_trait]
pub trait RowEncoder: Send {
    fn format(&self) -> ExportFormat;

    async fn encode(
        &mut self,
        columns: &[&'static ColumnDef],
        rows: RowStream,
        sink: ExportSink<'_>,
    ) -> ExportResult<EncodeStats>;
}

/// Pass-through writer that hashes (SHA-256) and counts everything written.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: AsyncWrite + Unpin> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Hex checksum and byte count; hands back the inner writer.
    pub fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.bytes)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DigestWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                this.hasher.update(&buf[..written]);
                this.bytes += written as u64;
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn digest_matches_a_one_shot_hash() {
        let mut writer = DigestWriter::new(Vec::new());
        writer.write_all(b"id,name\r\n").await.unwrap();
        writer.write_all(b"1,Ada\r\n").await.unwrap();

        let (inner, checksum, bytes) = writer.finish();
        assert_eq!(bytes, 16);
        assert_eq!(bytes, inner.len() as u64);
        assert_eq!(checksum, hex::encode(Sha256::digest(&inner)));
    }
}
