pub mod coordination;
pub mod db;
pub mod model;
pub mod queue;

pub use db::Store;
pub use model::{AccessLogEntry, AccessStats, NewSecret, SecretDefaults, SecretRecord};
pub use queue::Delivery;
