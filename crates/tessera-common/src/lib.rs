//! Tessera common types, errors, and configuration.
//!
//! This crate provides the page identity and page header format shared by the
//! log, the buffer pool and the page store.

pub mod config;
pub mod error;
pub mod page;

pub use config::StorageConfig;
pub use error::{Result, TesseraError};
pub use page::{
    PageHeader, PageId, PageType, DEFAULT_PAGE_SIZE, INVALID_PAGE_INDEX, MAX_PAGE_SIZE,
    MIN_PAGE_SIZE, PAGE_FORMAT_VERSION,
};
