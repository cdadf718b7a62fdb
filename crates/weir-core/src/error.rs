//! Error types for the buffer pool and the process engine.

#[cfg(not(feature = "std"))]
use alloc::string::String;

use crate::module::ModuleId;
use crate::pool::BlockId;
use crate::port::{InPortId, OutPortId};

/// Errors reported by [`BufferPool`](crate::pool::BufferPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Allocation would exceed the configured byte limit.
    OutOfMemory {
        /// Bytes requested by the failed allocation.
        requested: usize,
        /// Configured limit on bytes held by the pool.
        limit: usize,
    },
    /// The block was already on the free list.
    DoubleRelease(BlockId),
    /// The handle refers to a block that no longer exists.
    StaleHandle(BlockId),
    /// A pool operation was attempted on an externally owned block.
    NotPooled(BlockId),
}

impl core::fmt::Display for BlockId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "block#{}.{}", self.index, self.generation)
    }
}

impl core::fmt::Display for PoolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory { requested, limit } => {
                write!(f, "out of memory: {requested} bytes requested, limit {limit}")
            }
            Self::DoubleRelease(id) => write!(f, "{id} released while already free"),
            Self::StaleHandle(id) => write!(f, "{id} is no longer allocated"),
            Self::NotPooled(id) => write!(f, "{id} is an external buffer"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PoolError {}

/// Structural invariant violations detected under the `validation` feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invariant {
    /// A module reported more bytes than the buffer can hold.
    Overflow {
        /// Module that overflowed.
        module: ModuleId,
        /// Bytes reported.
        len: u32,
        /// Declared maximum.
        max: u32,
    },
    /// Unpacked channels of one port carry different lengths.
    UnequalChannelLengths {
        /// Module whose port is inconsistent.
        module: ModuleId,
        /// Offending channel index.
        channel: usize,
    },
    /// A module consumed more input than it was given.
    OverConsumed {
        /// Module that over-consumed.
        module: ModuleId,
        /// Port that over-consumed.
        port: InPortId,
    },
    /// Aliased ports disagree on channel count or size.
    AliasMismatch {
        /// Upstream side.
        prev: OutPortId,
        /// Downstream side.
        next: InPortId,
    },
    /// First channel has a buffer but a later one does not.
    MissingChannelBuffer {
        /// Module whose port is inconsistent.
        module: ModuleId,
        /// Channel without a buffer.
        channel: usize,
    },
}

impl core::fmt::Display for Invariant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Overflow { module, len, max } => {
                write!(f, "{module}: buffer length {len} exceeds max {max}")
            }
            Self::UnequalChannelLengths { module, channel } => {
                write!(f, "{module}: channel {channel} length differs from channel 0")
            }
            Self::OverConsumed { module, port } => {
                write!(f, "{module}: {port} consumed more than it was given")
            }
            Self::AliasMismatch { prev, next } => {
                write!(f, "aliased ports {prev} and {next} disagree on layout")
            }
            Self::MissingChannelBuffer { module, channel } => {
                write!(f, "{module}: channel {channel} has no buffer")
            }
        }
    }
}

/// Errors produced while building or running a topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Buffer pool failure.
    Pool(PoolError),
    /// A module's process call reported failure.
    ModuleFailed(ModuleId),
    /// A structural invariant was violated (fatal).
    Invariant(Invariant),
    /// The module id is not part of the topology.
    UnknownModule(ModuleId),
    /// The input port id is not part of the topology.
    UnknownInput(InPortId),
    /// The output port id is not part of the topology.
    UnknownOutput(OutPortId),
    /// The port is already connected.
    AlreadyConnected(String),
    /// The module graph contains a cycle.
    CycleDetected,
    /// The port is not an external port.
    NotExternal(String),
    /// The port holds data the operation would discard.
    PortBusy(String),
    /// The port has no client buffer attached.
    NoClientBuffer(String),
    /// Client buffers need a single-buffer layout.
    UnsupportedLayout(String),
}

impl core::fmt::Display for EngineError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Pool(e) => write!(f, "buffer pool: {e}"),
            Self::ModuleFailed(id) => write!(f, "{id} failed to process"),
            Self::Invariant(v) => write!(f, "invariant violated: {v}"),
            Self::UnknownModule(id) => write!(f, "{id} not found"),
            Self::UnknownInput(id) => write!(f, "{id} not found"),
            Self::UnknownOutput(id) => write!(f, "{id} not found"),
            Self::AlreadyConnected(msg) => write!(f, "already connected: {msg}"),
            Self::CycleDetected => write!(f, "module graph contains a cycle"),
            Self::NotExternal(msg) => write!(f, "not an external port: {msg}"),
            Self::PortBusy(msg) => write!(f, "port busy: {msg}"),
            Self::NoClientBuffer(msg) => write!(f, "no client buffer: {msg}"),
            Self::UnsupportedLayout(msg) => write!(f, "unsupported layout for client buffer: {msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pool(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PoolError> for EngineError {
    fn from(e: PoolError) -> Self {
        Self::Pool(e)
    }
}

impl From<Invariant> for EngineError {
    fn from(v: Invariant) -> Self {
        Self::Invariant(v)
    }
}

/// Result alias for engine operations.
pub type Result<T> = core::result::Result<T, EngineError>;

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn pool_error_display() {
        let err = PoolError::OutOfMemory {
            requested: 512,
            limit: 256,
        };
        assert_eq!(
            err.to_string(),
            "out of memory: 512 bytes requested, limit 256"
        );
    }

    #[test]
    fn engine_error_exposes_pool_source() {
        let err = EngineError::from(PoolError::StaleHandle(BlockId::new(3, 1)));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("block#3.1"), "got: {err}");
    }

    #[test]
    fn invariant_display_names_module() {
        let err = EngineError::from(Invariant::Overflow {
            module: ModuleId(4),
            len: 100,
            max: 64,
        });
        let msg = err.to_string();
        assert!(msg.contains("module#4"), "got: {msg}");
        assert!(msg.contains("exceeds max 64"), "got: {msg}");
        assert!(err.source().is_none());
    }
}
