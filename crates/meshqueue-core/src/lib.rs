//! # meshqueue-core
//!
//! The coordination engine for a distributed, database-backed job queue.
//! Clients enqueue durable work items inside their own application
//! transaction; the queue guarantees each item's effect is eventually
//! applied exactly once, respecting a per-item earliest-start time and
//! priority/weight.
//!
//! ## Architecture
//!
//! ```text
//! enqueue_work(txn, ...)
//!     │  (work-type factory inserts JOB + work-type rows, same txn)
//!     ▼
//! Proposal { when_proposed, when_committed, when_executed }
//!     │  (caller's txn commits)
//!     ▼
//! timer fires at max(not_before - now, 0)
//!     │
//!     ▼
//! Queuer::choose_performer()  ──┬─► WorkerConnectionPool (local workers)
//!                                ├─► PeerFabric (least-loaded peer, one hop)
//!                                └─► LocalPerformer (runs here)
//!                                        │
//!                                        ▼
//!                              new txn: SELECT job FOR UPDATE,
//!                              load work row, doWork, DELETE, COMMIT
//! ```
//!
//! A background lost-work scan re-drives jobs whose owning node died,
//! independent of the timer path above.
//!
//! ## Key invariants
//!
//! 1. Every `Job` row has exactly one corresponding work-type row sharing
//!    its id; neither outlives the other.
//! 2. A committed proposal's `when_executed` fires at most once.
//! 3. Choosing and running a performer for a job is the only way its rows
//!    are ever deleted; a row observed gone is treated as "already handled"
//!    rather than an error.
//! 4. All database access goes through [`txn::in_transaction`] so commit/
//!    abort handling never diverges between call sites.
//!
//! ## What this crate does not do
//!
//! It does not supply a relational database, a wire transport, or process
//! supervision — [`txn::TransactionFactory`], [`performer::JobRows`] and
//! [`queuer::QueuerStore`] are the seams a concrete backend (see
//! [`pg`]) fills in, and [`worker_pool::WorkerLink`]/[`peer_fabric::PeerLink`]
//! are the seams a concrete transport (see [`rpc`]) fills in.

pub mod clock;
pub mod dummy;
pub mod error;
pub mod model;
pub mod peer_fabric;
pub mod performer;
pub mod pg;
pub mod proposal;
pub mod registry;
pub mod rpc;
pub mod queuer;
pub mod txn;
pub mod variants;
pub mod worker_pool;

pub use clock::{system_clock, Clock, SharedClock, SystemClock};
pub use error::{MeshQueueError, Result};
pub use model::{Job, NodeInfo, WorkItem};
pub use peer_fabric::{PeerFabric, PeerKey, PeerLink};
pub use performer::{JobRows, LocalPerformer, Performer};
pub use proposal::{ExecutedOutcome, Proposal, ProposalCallback, StageOutcome};
pub use queuer::{Queuer, QueuerConfig, QueuerStore};
pub use registry::{WorkTypeHandlers, WorkTypeRegistry};
pub use txn::{in_transaction, SharedTransactionFactory, Transaction, TransactionFactory};
pub use variants::{LocalQueuer, NoOpPerformer, NonPerformingQueuer};
pub use worker_pool::{WorkerConnectionPool, WorkerLink, DEFAULT_MAX_LOAD_PER_WORKER};

#[cfg(any(test, feature = "testing"))]
pub use txn::testing::InMemoryTransactionFactory;
#[cfg(any(test, feature = "testing"))]
pub use clock::testing::TestClock;
