//! # B+Tree Index
//!
//! The ordered key → version-chain structure at the heart of the engine,
//! built on buffer-pool pages.
//!
//! ## Shape
//!
//! - All record versions live in leaf cells (newest) and Version pages
//!   (older); interior nodes carry separator keys and child page numbers.
//! - All leaves sit at the same depth; leaves are singly linked for range
//!   scans.
//! - Keys within a node are strictly ascending.
//!
//! ## Concurrency
//!
//! Descent uses latch coupling: starting from page 0 (which roots the
//! tree), a child's latch is acquired before the parent's is released, so
//! no traversal ever observes a half-restructured path. Value operations
//! hold exactly one leaf write latch (plus a Version page latch); all
//! *structural* operations — splits, merges, page allocation — serialize
//! on one engine-wide structural mutex and retain write latches on the
//! whole descent path, splitting full interior nodes preemptively on the
//! way down.
//!
//! ## Logging
//!
//! Value operations emit logical, page-targeted records with before/after
//! images. Each structural change emits one Structural record carrying
//! full images of every touched page, so recovery replays it atomically
//! and idempotently (per-page LSN gate).
//!
//! ## Module Organization
//!
//! - `node`: slot-array cell layout shared by leaves and interior nodes
//! - `overflow`: chains for values too large to inline in a leaf
//! - `tree`: descent, value ops, splits, cursors
//! - `sweep`: version garbage collection and underflow rebalancing

pub mod node;
pub mod overflow;
pub mod sweep;
pub mod tree;

pub use tree::{BTree, Cursor, UndoEntry};
