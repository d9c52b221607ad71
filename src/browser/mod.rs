pub mod fingerprint;
pub mod http;
pub mod session;

// Re-export common types
pub use fingerprint::{FingerprintManager, ClientIdentity};
pub use http::HttpSessionFactory;
pub use session::WebDriverSessionFactory;
