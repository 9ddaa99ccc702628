//! Getting records into a store in batches.

pub mod batch;
pub mod stream;

pub use batch::{BatchIngestor, IngestSink, IngestStats, embed_concurrently};
pub use stream::StreamIngestor;
