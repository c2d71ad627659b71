// Common types shared across the kernel, domain, and server layers.

pub mod entity_ids;
pub mod error;
pub mod pagination;
pub mod phone;

pub use entity_ids::{CallLogId, CampaignId, ContactId, RetryAttemptId};
pub use error::{CoreError, CoreResult};
pub use pagination::PageParams;
