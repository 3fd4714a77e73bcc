//! Pipeline passes for Examflow.
//!
//! Each pass is a single sequential stream over items in stable creation
//! order. Interrupting a pass mid-stream is safe: the staging ledger is the
//! only checkpoint, and re-running a pass picks up exactly where it stopped.
//!
//! - [`ingest`] — CSV batch ingestion and the OCR extraction pass
//! - [`reconcile`] — classification pass and ledger drift repair
//! - [`migrate`] — migration driver, orphan cleanup, dedup, sentinel cleanup
//! - [`taxonomy`] — topic-set diff and guarded sync

pub mod ingest;
pub mod migrate;
pub mod progress;
pub mod reconcile;
pub mod taxonomy;

pub use progress::{PassProgress, SilentProgress};
