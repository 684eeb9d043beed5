mod csv_ingest;

pub use csv_ingest::{IngestReport, Ingestor};
