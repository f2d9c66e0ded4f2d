#![deny(missing_docs)]
//! The weft core subsystems: the per-repository file-set store, the
//! content-hashing scanner, the central reconciliation model, the
//! block-granular pull engine, the TLS connection supervisor, index
//! persistence and configuration storage.
//!
//! Everything here is wired together by the weft_node crate.

pub mod config_store;
pub mod conn;
pub mod fileset;
pub mod identity;
pub mod limit;
pub mod model;
pub mod persist;
pub mod puller;
pub mod scanner;
