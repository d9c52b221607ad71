pub mod checkpoint;
pub mod report;
pub mod table;

// Re-export common types
pub use checkpoint::{Checkpoint, CheckpointEmitter, CheckpointSink, FileCheckpointSink};
pub use report::{write_report, ReportContext};
pub use table::{read_aggregate_table, write_aggregate_table, write_raw_table};
