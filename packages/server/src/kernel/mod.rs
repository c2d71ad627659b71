// Kernel - core infrastructure with dependency injection
//
// Everything that coordinates through the KV store and the dispatch queue
// lives here: slot accounting, waitlists, the dispatch pipeline, repair
// services, and lifecycle control. Durable business state belongs to the
// domain layer.

pub mod circuit;
pub mod concurrency;
pub mod deps;
pub mod dispatch;
pub mod invariants;
pub mod janitor;
pub mod keys;
pub mod kv;
pub mod lifecycle;
pub mod reconciler;
pub mod retry;
pub mod services;
pub mod shutdown;
pub mod test_dependencies;
pub mod traits;
pub mod waitlist;

pub use circuit::CircuitBreaker;
pub use concurrency::{ConcurrencyTracker, ReserveOutcome, SlotSnapshot};
pub use deps::{ServerDeps, TwilioDialer};
pub use dispatch::DispatchPipeline;
pub use invariants::InvariantMonitor;
pub use janitor::LeaseJanitor;
pub use keys::CampaignKeys;
pub use kv::{Kv, KvError};
pub use lifecycle::LifecycleController;
pub use reconciler::{LedgerReconciler, QueueReconciler};
pub use retry::{FailureCategory, RetryPolicy, RetryScheduler};
pub use services::BackgroundServices;
pub use shutdown::ShutdownCoordinator;
pub use traits::{BaseVendorDialer, DialParams, VendorCall};
pub use waitlist::{WaitlistService, WaitlistSettings};
