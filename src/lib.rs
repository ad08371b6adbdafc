pub mod daemon;
pub mod error;
pub mod services;
pub mod storage;

pub use error::TrackerError;
pub use storage::config::Config;
pub use storage::store::Store;
