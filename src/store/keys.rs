//! Key encoding for the store partitions.
//!
//! Jobs live under `job/<id>` so a prefix scan enumerates them; settings is a
//! single well-known key in its own partition.

pub const SETTINGS_KEY: &str = "settings";

pub fn job_key(id: &str) -> String {
    format!("job/{id}")
}
