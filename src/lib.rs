pub mod agent;
pub mod aggregation;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod store;
