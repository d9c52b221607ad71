pub mod pagination;
pub mod strategy;

// Re-export common types
pub use pagination::PaginationReader;
pub use strategy::{RowExtractor, RowSkip};
