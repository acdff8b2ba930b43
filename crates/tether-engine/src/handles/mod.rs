//! Value handle tracking
//!
//! Every native value record the host has observed is represented by a
//! [`HandleSlot`] and recorded in its isolate's [`HandleTable`].
//!
//! # Lifecycle
//!
//! ```text
//!   track()          mark_releasable()          flush_releasable()
//! ──────────▶ Tracked ─────────────────▶ Releasable ─────────────────▶ Freed
//!                                                    (one native batch free)
//! ```
//!
//! Transitions only move forward. A slot observed as `Freed` is never seen
//! in either set again.
//!
//! # Locking
//!
//! The table guards its stop flag, tracked set, and releasable set with three
//! separate locks, always acquired in that order. The native batch free is
//! issued with none of them held so that the free may re-enter the table.

mod slot;
mod table;

pub use slot::{HandleSlot, HandleState};
pub use table::{HandleStats, HandleTable};
