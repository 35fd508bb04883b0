//! # Multi-Version Concurrency Control (MVCC)
//!
//! Snapshot Isolation: readers never block, writers conflict on versions
//! rather than on locks held to commit.
//!
//! ## Version Storage: Newest In Leaf + Version Pages
//!
//! The newest version of each key lives in its B+Tree leaf cell for O(1)
//! access to current data. When a key is updated, the prior cell body is
//! copied into a Version page and the new version's `prev` pointer links to
//! it. Deletes stamp `deleted_by` on the newest version *in place* — older
//! snapshots ignore the stamp because the deleter is invisible to them, so
//! no chain copy is needed.
//!
//! ```text
//!        [ B-Tree Leaf Page ]
//!        +------------------------------+
//!        | Key = "user:1"               |
//!        |  [VersionHeader]             |
//!        |    created_by: 105           |
//!        |    deleted_by: 0             |
//!        |    prev:  Page 4, Off 64  ------\
//!        |  [Body: "Alice", 30]         |    \
//!        +------------------------------+     \   [ Version Page 4 ]
//!                                              \  +-------------------+
//!                                               ->| Offset 64:        |
//!                                                 |  created_by: 100  |
//!                                                 |  prev: 0          |
//!                                                 |  [Body: "Alice"]  |
//!                                                 +-------------------+
//! ```
//!
//! ## Visibility Rules (Snapshot Isolation)
//!
//! A version V is visible to transaction T when:
//! 1. `V.created_by` is T itself, or committed before T began
//!    (id below T's and not in T's active exclusion set), and
//! 2. `V.deleted_by` is absent or *not* visible by the same rule.
//!
//! ## Write Conflicts
//!
//! A writer checks the newest version before replacing or stamping it:
//! - created/deleted by another *active* transaction → first-writer-wins,
//!   immediate `Conflict` and the writer aborts;
//! - created/deleted by a transaction invisible to the writer's snapshot
//!   (committed after it began) → `SerializationFailure` (lost-update
//!   prevention).
//!
//! Both checks together give the property that of two overlapping
//! committers to one key, exactly one commits.
//!
//! ## Transaction Lifecycle
//!
//! ```text
//! begin() ───> Active ───> commit() ───> Committed
//!                │                           │
//!                └──> abort() ──> Aborted    └──> versions visible
//! ```
//!
//! States are terminal; an aborted transaction's versions are physically
//! removed by rollback, which is why "not in any active set" can safely
//! mean "committed" during visibility checks.
//!
//! ## Garbage Collection
//!
//! A version chain needs history only as far back as the first version
//! visible to *every* active snapshot. The maintenance sweep prunes each
//! chain at that point and frees Version pages whose live-record count
//! reaches zero.
//!
//! ## Key Structures
//!
//! - [`VersionHeader`]: 25-byte header prepended to every cell body
//! - [`Snapshot`]: a transaction's fixed visibility boundary
//! - [`TransactionManager`]: ID allocation and the active table
//! - [`LockTable`]: operation-scoped exclusive key locks with timeout and
//!   deadlock detection
//! - [`VersionStore`]: Version page allocation and chain I/O

pub mod lock_table;
pub mod transaction;
pub mod version;
pub mod version_store;

pub use crate::wal::{Lsn, TxnId};
pub use lock_table::{KeyLockGuard, LockTable};
pub use transaction::{Snapshot, TransactionManager, TxnState};
pub use version::{VersionHeader, VERSION_HEADER_SIZE};
pub use version_store::VersionStore;
