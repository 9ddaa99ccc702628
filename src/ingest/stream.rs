//! Newline-delimited record ingestion from any reader.

use std::io::BufRead;

use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::ingest::batch::{IngestSink, IngestStats};

/// Reads records line by line and commits them in fixed-size batches.
#[derive(Debug, Clone)]
pub struct StreamIngestor {
    batch_size: usize,
    metadata_delimiter: Option<String>,
}

impl StreamIngestor {
    pub fn new(batch_size: usize) -> StoreResult<Self> {
        if batch_size == 0 {
            return Err(StoreError::InvalidConfig {
                reason: "batch size must be greater than 0".to_string(),
            });
        }
        Ok(Self {
            batch_size,
            metadata_delimiter: None,
        })
    }

    /// Split each line at the first `delimiter` into `text` and `metadata`.
    #[must_use]
    pub fn with_metadata_delimiter(mut self, delimiter: Option<String>) -> Self {
        self.metadata_delimiter = delimiter.filter(|d| !d.is_empty());
        self
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Streams `reader` into `sink`.
    ///
    /// Blank and whitespace-only lines are skipped. The trailing partial
    /// batch is flushed at end of input. The first sink or read error is
    /// returned; batches committed before it stay committed. `on_batch`
    /// receives the running stats after every committed batch.
    pub fn ingest<R, K, F>(&self, reader: R, sink: &K, mut on_batch: F) -> StoreResult<IngestStats>
    where
        R: BufRead,
        K: IngestSink + ?Sized,
        F: FnMut(&IngestStats),
    {
        let mut stats = IngestStats::new();
        let mut texts: Vec<String> = Vec::with_capacity(self.batch_size);
        let mut metadata: Vec<String> = Vec::with_capacity(self.batch_size);

        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| StoreError::Io {
                path: format!("<input line {}>", line_no + 1).into(),
                source,
            })?;
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if line.trim().is_empty() {
                stats.skipped_blank += 1;
                continue;
            }

            let (text, meta) = self.split_record(line);
            texts.push(text.to_string());
            metadata.push(meta.to_string());

            if texts.len() == self.batch_size {
                self.flush(sink, &mut texts, &mut metadata, &mut stats)?;
                on_batch(&stats);
            }
        }

        if !texts.is_empty() {
            self.flush(sink, &mut texts, &mut metadata, &mut stats)?;
            on_batch(&stats);
        }
        stats.stop_timing();

        info!(
            records = stats.records_ingested,
            batches = stats.batches,
            skipped = stats.skipped_blank,
            "stream ingestion finished"
        );
        Ok(stats)
    }

    fn split_record<'a>(&self, line: &'a str) -> (&'a str, &'a str) {
        match &self.metadata_delimiter {
            Some(delimiter) => match line.split_once(delimiter.as_str()) {
                Some((text, meta)) => (text.trim_end(), meta.trim()),
                None => (line, ""),
            },
            None => (line, ""),
        }
    }

    fn flush<K: IngestSink + ?Sized>(
        &self,
        sink: &K,
        texts: &mut Vec<String>,
        metadata: &mut Vec<String>,
        stats: &mut IngestStats,
    ) -> StoreResult<()> {
        // Without a delimiter every metadata entry is empty
        let metas: &[String] = if self.metadata_delimiter.is_some() {
            metadata
        } else {
            &[]
        };

        let added = sink.ingest_batch(texts, metas)?;
        stats.record_batch(added);
        debug!(batch = stats.batches, records = added, "flushed stream batch");

        texts.clear();
        metadata.clear();
        Ok(())
    }
}
