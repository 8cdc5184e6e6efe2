//! Memory membrane for FrankenFFI.
//!
//! This crate owns everything that touches native memory on the managed
//! side of the boundary:
//! - **Arenas** (`arena`): scoped native allocations with deterministic release
//! - **Segments** (`arena`): bounds-checked, lifetime-checked views into arenas
//! - **Layouts** (`layout`): scalar, struct and sequence shapes with field paths
//! - **Owners** (`owner`): execution identity used by confined arenas
//! - **Configuration** (`config`): environment-driven runtime settings
//! - **Metrics** (`metrics`): atomic counters for observability
//! - **Errors** (`error`): the error taxonomy shared by every layer
//!
//! Only `arena` contains unsafe code; it is the single place native blocks
//! are allocated, accessed and released.

#![deny(unsafe_code)]

pub mod arena;
pub mod config;
pub mod error;
pub mod layout;
pub mod metrics;
pub mod owner;

pub use arena::{
    Arena, ArenaConfig, ArenaHandle, ArenaId, ArenaKind, ArenaLedger, Segment, SegmentId,
    SegmentLease, WriteAttempt, open_arena, with_arena,
};
pub use config::{LogFilter, RuntimeConfig, runtime_config};
pub use error::{BoxError, ErrorKind, FfiError, FfiResult};
pub use layout::{FieldInfo, MemoryLayout, Primitive, ScalarValue, StructLayout};
pub use metrics::{FfiMetrics, MetricsSnapshot, global_metrics};
pub use owner::{OwnerId, OwnerScope, current_owner};
