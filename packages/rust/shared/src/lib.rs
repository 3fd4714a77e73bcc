//! Shared types, error model, and configuration for Examflow.
//!
//! This crate is the foundation depended on by all other Examflow crates.
//! It provides:
//! - [`ExamflowError`] — the unified error type
//! - Domain types ([`Item`], [`Subject`], [`Topic`], [`ClassificationProposal`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ClassifierConfig, DefaultsConfig, OcrConfig, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from, require_access_key,
};
pub use error::{ExamflowError, Result};
pub use types::{
    AnswerOption, ClassificationProposal, ContentSegment, Item, ItemId, SENTINEL_TOPIC_NAME,
    Subject, Topic, UNDECIDED_NAME, content_hash,
};
