pub mod api;
pub mod config;
pub mod db;
pub mod lease;
pub mod models;
pub mod notify;
