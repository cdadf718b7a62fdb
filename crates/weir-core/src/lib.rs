//! Weir Core - per-cycle data-flow engine for audio module graphs
//!
//! This crate moves stream data through a graph of processing modules, one
//! cycle at a time. It owns the buffers, decides who may share them, copies
//! data across module boundaries and calls each module's process entry
//! point with timestamps, end-of-frame markers and metadata kept in step
//! with the bytes.
//!
//! # Core Abstractions
//!
//! ## Buffers
//!
//! - [`BufferPool`] - Reference-counted, size-bucketed block pool with idle reclamation
//! - [`BlockId`] - Generational handle to a pooled or client-owned block
//! - [`PoolConfig`] / [`PoolMode`] - Normal or low-latency buffer retention
//!
//! ## Ports
//!
//! - [`CommonPort`] - Buffer views, media format, stream flags and metadata
//! - [`InputPort`] / [`OutputPort`] - Direction-specific bookkeeping
//! - [`MediaFormat`] - Channel layout, sample size and rate
//!
//! ## Modules
//!
//! - [`Module`] - Object-safe trait every processing module implements
//! - [`ModuleCaps`] - Static properties read once when the module is added
//! - [`ProcessIo`] - Port access handed to [`Module::process`]
//! - [`TriggerPolicy`] - Port groups deciding when a module may run
//!
//! ## Engine
//!
//! - [`TopologyBuilder`] - Adds modules and ports, sorts the graph
//! - [`Topology`] - Runs cycles with [`Topology::process_cycle`]
//! - [`ContainerHooks`] - Discontinuity and frame-done callbacks
//!
//! # Buffer Sharing
//!
//! Runs of in-place single-input single-output modules form chains. Inside a
//! chain every port points into the same block; only the ends of a chain
//! copy. A chain end may also borrow the client's buffer at an external
//! port, so data lands there without an extra copy.
//!
//! # no_std Support
//!
//! Disable the default `std` feature to build on targets without an
//! allocator-aware standard library; `alloc` is still required:
//!
//! ```toml
//! [dependencies]
//! weir-core = { version = "0.1", default-features = false }
//! ```
//!
//! The `tracing` feature turns on log output, `validation` makes structural
//! invariant violations fatal.
//!
//! # Example
//!
//! ```rust
//! use weir_core::{MediaFormat, TopologyBuilder};
//!
//! let fmt = MediaFormat::pcm(2, 48_000, 2);
//! let mut b = TopologyBuilder::new();
//! let gain = b.add_passthrough("gain");
//! let input = b.add_input(gain, fmt, 192).unwrap();
//! let output = b.add_output(gain, fmt, 192).unwrap();
//! let mut topo = b.build().unwrap();
//!
//! topo.push_input(input, &[0u8; 192]).unwrap();
//! let report = topo.process_cycle().unwrap();
//! assert_eq!(report.process_calls, 1);
//!
//! let mut out = Vec::new();
//! assert_eq!(topo.drain_output(output, &mut out).unwrap().len, 192);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

pub mod acquire;
pub mod copy;
mod driver;
pub mod error;
pub mod format;
pub mod metadata;
pub mod module;
pub mod pool;
pub mod port;
mod process;
mod signal;
pub mod timestamp;
pub mod topology;
pub mod trigger;

// Re-export main types at crate root
pub use acquire::{NBLC_STEP_LIMIT, NblcEnd};
pub use copy::copy_port_data;
pub use error::{EngineError, Invariant, PoolError, Result};
pub use format::{DataFormat, Interleaving, MediaFormat};
pub use metadata::{Metadata, MetadataKind, MetadataList};
pub use module::{InOut, Module, ModuleCaps, ModuleId, ModuleKind, ProcessIo, ProcessStatus};
#[cfg(feature = "std")]
pub use pool::StdHost;
pub use pool::{BlockId, BufferPool, NoopHost, PoolConfig, PoolHost, PoolMode, PoolStats};
pub use port::{
    BufOrigin, BufView, CommonPort, DataFlowState, InPortId, InputPort, OutPortId, OutputPort,
    PortFlags, PortState, StreamData, StreamFlags,
};
pub use timestamp::TIMESTAMP_TOLERANCE_US;
pub use topology::{
    ContainerHooks, CycleReport, Drained, NoHooks, PendingEvents, Topology, TopologyBuilder,
};
pub use trigger::{Combine, PortRef, PortRole, TriggerGroup, TriggerMode, TriggerPolicy};
