pub mod domain;
pub mod error;
pub mod models;
pub mod protocol;
