pub mod campaigns;
pub mod health;
pub mod webhooks;

pub use health::health_handler;
