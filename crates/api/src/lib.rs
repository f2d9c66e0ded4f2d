#![deny(missing_docs)]
//! Weft API contains the basic types shared by every part of the weft
//! synchronization daemon: identities, file records, the wire protocol,
//! the configuration tree, and the traits for the collaborators the node
//! runtime consumes but does not implement.
//!
//! If you want to run a node, please see the weft_node crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

mod error;
pub use error::*;

pub mod id;
pub use id::{NodeId, RepoId};

mod clock;
pub use clock::*;

pub mod record;
pub use record::*;

pub mod protocol;

pub mod config;

pub mod discovery;
pub use discovery::{DynDiscovery, DynPortMapper};
