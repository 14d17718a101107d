//! Persisted record store: job records and user settings on fjall.

mod error;
mod keys;
mod store;

pub use error::{Result, StoreError};
pub use store::JobStore;
