//! Download engine - resumable, verified transfer of single files
//!
//! - Resume from the `.part` file with a `Range` request
//! - Retry with backoff, re-resolving expired URLs once
//! - Digest verification before the atomic rename
//! - Cooperative pause/resume/cancel

mod download_task;
mod manager;
#[cfg(test)]
pub(crate) mod testing;
mod transfer;
mod verify;

pub use manager::*;
pub use transfer::part_path;
pub use verify::{file_digest, verify_file};
