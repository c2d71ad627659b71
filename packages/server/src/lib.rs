//! Campaign concurrency and dial-dispatch core.
//!
//! Orchestrates the lifecycle of outbound calls belonging to user-created
//! campaigns. Each campaign has a bounded concurrent-call budget enforced
//! across a fleet of worker processes that coordinate exclusively through a
//! shared Redis-compatible store.
//!
//! # Architecture
//!
//! ```text
//! dispatch request (API / scheduler / retry)
//!     │
//!     ▼
//! DispatchPipeline ──► ConcurrencyTracker.reserve_slot()
//!     │                     │ granted: pre-dial lease + vendor initiate
//!     │                     │ waitlisted: WaitlistService.push()
//!     ▼                     ▼
//! vendor webhook ──► upgrade_to_active (token compare-and-swap)
//!     │
//!     ▼ terminal status
//! release_active ──► slot-available pub/sub ──► waitlist promotion
//!
//! LeaseJanitor / LedgerReconciler / QueueReconciler repair drift;
//! InvariantMonitor observes and alerts.
//! ```
//!
//! Layering is leaf-first with no back-edges: `kv` → `concurrency` →
//! {`waitlist`, `dispatch`} → {`janitor`, `reconciler`, `invariants`} →
//! `lifecycle` → `shutdown`. Components communicate only through the KV
//! store and the dispatch queue.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::Config;
