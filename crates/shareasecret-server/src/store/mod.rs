pub mod db;
pub mod model;

pub use db::{NewSecret, RedeemResult, Store};
pub use model::{now_millis, DeletionReason, SecretRecord, ViewRecord};
