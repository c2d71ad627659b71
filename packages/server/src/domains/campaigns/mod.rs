//! Campaign domain: campaigns, their contacts, call logs, and retry
//! attempts.

pub mod models;
