//! # codeshare-core — text synchronization primitives
//!
//! Pure, I/O-free building blocks shared by every replica and by the
//! session server:
//!
//! ```text
//!   previous text ──┐
//!                   ├── diff::compute_operations ──► [Operation]
//!   current text  ──┘                                     │
//!                                                         ▼
//!   snapshot ───────────────────────────────► apply::apply_batch ──► new snapshot
//!                                                         │
//!                                 position::offset_to_position (line, column)
//! ```
//!
//! ## Modules
//!
//! - [`position`]: offset ⇄ (line, column) codec, total and clamping
//! - [`operation`]: `Insert` / `Delete` operations and batches
//! - [`diff`]: character-level Myers diff producing operation batches
//! - [`apply`]: in-order batch application with clamp reporting
//! - [`transform`]: rebasing a batch past batches sequenced before it
//! - [`checksum`]: snapshot digests for divergence detection
//!
//! All offsets count Unicode scalar values (`char`s), never bytes.

pub mod apply;
pub mod checksum;
pub mod diff;
pub mod operation;
pub mod position;
pub mod transform;

pub use apply::{apply, apply_batch, Applied};
pub use checksum::checksum;
pub use diff::{compute_operations, diff_runs, DiffRun};
pub use operation::{Operation, OperationBatch};
pub use position::{offset_to_position, position_to_offset, Position};
pub use transform::{rebase, transform, transform_batch, Rebased};
