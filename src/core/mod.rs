pub mod api;
pub mod error;
pub mod http;
pub mod keyring;
pub mod merge;
pub mod models;
pub mod store;
