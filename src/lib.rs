//! A concurrent, incrementally-resizable, bin-locked hash map.
//!
//! [`StripedMap`] is modeled on Java's `ConcurrentHashMap`: reads never
//! block, writes lock only the one bin they touch, and growth is driven
//! cooperatively by whichever writer threads happen to be active when a
//! load-factor threshold is crossed — there is no background resize thread
//! and no global lock. See DESIGN.md for the provenance of each module.
//!
//! This crate deliberately does not implement: key removal, snapshot
//! iteration, ordered traversal, tree-bin degeneration for pathological hash
//! collisions, or per-entry expiration. See `SPEC_FULL.md` for the full
//! rationale.

mod counter;
mod error;
mod hash;
mod map;
mod node;
mod resize;
mod table;

pub use error::{MapError, Result};
pub use map::StripedMap;
