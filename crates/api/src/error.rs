//! Weft error types.

use std::sync::Arc;

/// A clonable trait-object inner error.
#[derive(Clone, Default)]
pub struct DynInnerError(
    pub Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
);

impl std::fmt::Debug for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            None => f.write_str("None"),
            Some(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for DynInnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.as_ref().map(|s| {
            let out: &(dyn std::error::Error + 'static) = &**s;
            out
        })
    }
}

impl DynInnerError {
    /// Construct a new DynInnerError from a source error.
    pub fn new<E: std::error::Error + 'static + Send + Sync>(e: E) -> Self {
        Self(Some(Arc::new(e)))
    }
}

/// The core weft error type, used in all weft apis and internally in
/// most modules.
///
/// The variants follow the daemon's failure policy: fatal errors abort
/// startup, transient errors drop a connection and let the dialer retry,
/// protocol errors drop the offending connection and go no further, and
/// io errors stay local to the file they occurred on.
///
/// This type is required to implement `Clone` to ease the use of
/// shared futures, which require the entire `Result` to be `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WeftError {
    /// Unrecoverable startup error. The process should exit non-zero.
    #[error("fatal: {ctx} (src: {src})")]
    Fatal {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },

    /// Network-level error: read/write failure, handshake failure, peer
    /// disconnect, dial failure. The connection is dropped and the dialer
    /// retries on schedule.
    #[error("transient: {ctx} (src: {src})")]
    Transient {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },

    /// Peer misbehavior: malformed message, block hash mismatch, unknown
    /// repository reference, duplicate connection. Drops the offending
    /// connection; never escalated further.
    #[error("protocol: {ctx}")]
    Protocol {
        /// Any context associated with this error.
        ctx: Arc<str>,
    },

    /// Local disk error. Scoped to the file it occurred on.
    #[error("io: {ctx} (src: {src})")]
    Io {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },

    /// Generic weft internal error.
    #[error("{ctx} (src: {src})")]
    Other {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },
}

macro_rules! imp_ctor {
    ($plain:ident, $with_src:ident, $variant:ident) => {
        /// Construct this error variant from display context.
        pub fn $plain<C: std::fmt::Display>(ctx: C) -> Self {
            Self::$variant {
                ctx: ctx.to_string().into_boxed_str().into(),
                src: DynInnerError::default(),
            }
        }

        /// Construct this error variant with an inner source error.
        pub fn $with_src<
            C: std::fmt::Display,
            S: std::error::Error + 'static + Send + Sync,
        >(
            ctx: C,
            src: S,
        ) -> Self {
            Self::$variant {
                ctx: ctx.to_string().into_boxed_str().into(),
                src: DynInnerError::new(src),
            }
        }
    };
}

impl WeftError {
    imp_ctor!(fatal, fatal_src, Fatal);
    imp_ctor!(transient, transient_src, Transient);
    imp_ctor!(io, io_src, Io);
    imp_ctor!(other, other_src, Other);

    /// Construct a protocol error from display context.
    pub fn protocol<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Protocol {
            ctx: ctx.to_string().into_boxed_str().into(),
        }
    }

    /// `true` if this error only warrants dropping the connection it
    /// occurred on and retrying on the dialer schedule.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// `true` if a peer broke the protocol and its connection must be
    /// dropped.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

/// The core weft result type.
pub type WeftResult<T> = Result<T, WeftError>;
