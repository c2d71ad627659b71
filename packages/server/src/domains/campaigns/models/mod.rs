pub mod call_log;
pub mod campaign;
pub mod contact;
pub mod retry_attempt;

pub use call_log::{CallLog, CallLogStatus};
pub use campaign::{Campaign, CampaignStats, CampaignStatus, PriorityMode};
pub use contact::{CampaignContact, ContactStatus, NewContact};
pub use retry_attempt::{RetryAttempt, RetryStatus};
