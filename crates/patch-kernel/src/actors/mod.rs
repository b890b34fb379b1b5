//! Acton-reactive actors for the patch kernel.
//!
//! ```text
//! Patch driver (per home patch, each step)
//!   └─ SubmitFrame (seq, ids, values) → Collector
//!        ├─ FrameAssembled (broadcast) ← last contributor of seq
//!        └─ CollectionRejected (broadcast) ← late or malformed contribution
//! ```
//!
//! The box rendezvous itself is not actor-based: deposits and retrievals are
//! plain calls on shared boxes, made from whatever task runs the compute.

mod collector;

pub use collector::{Collector, CollectorState};
