pub mod config;
pub mod error;
pub mod hash;
pub mod redact;
pub mod telemetry;
pub mod types;
pub mod vault;

pub use config::Config;
pub use error::{Result, SitepulseError};
pub use hash::{content_hash, loc_hash};
pub use types::*;
pub use vault::{generate_indexnow_key, EncryptedSecret, Plaintext, Vault};
