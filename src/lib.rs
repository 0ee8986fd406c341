pub mod alert;
pub mod client;
pub mod config;
pub mod control;
pub mod double_check;
pub mod emergency;
pub mod engine;
pub mod health;
pub mod models;
pub mod params;
pub mod positions;
pub mod reconcile;
pub mod scheduler;
pub mod session;

#[cfg(test)]
mod testing;
