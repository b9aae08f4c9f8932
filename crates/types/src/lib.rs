//! Core task types for the FTS pipeline.
//!
//! This crate provides the data model shared by every daemon:
//!
//! - **Transfers**: a single source→destination copy with its parameters
//!   and execution info
//! - **Batches**: the scheduler-addressable unit of work, with the
//!   normalization rules that keep routing consistent
//! - **States**: the transfer and batch state machines
//! - **Markers**: performance markers and kill orders
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer. Everything
//! here is pure and deterministic: no I/O, no clocks beyond explicit
//! timestamp constructors.

mod batch;
mod kill;
mod perf;
mod status;
mod surl;
mod time;
mod transfer;

pub use batch::{Batch, BatchError, BatchState, BatchType, DEFAULT_ACTIVITY};
pub use kill::Kill;
pub use perf::PerfMarker;
pub use status::{
    ErrorScope, TransferError, TransferInfo, TransferIntervals, TransferState, TransferStats,
};
pub use surl::Surl;
pub use time::{Interval, Timestamp};
pub use transfer::{ChecksumMode, Transfer, TransferParameters};

/// Version string reported by RPC endpoints.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
