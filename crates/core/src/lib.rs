pub mod config;
pub mod error;
pub mod types;

pub use config::{load_dotenv, SyncerConfig};
pub use error::*;
pub use types::*;
