//! # API Models
//!
//! Request and response structures of the REST API. Field names are
//! camelCase for the browser; the record store's snake_case models
//! live in `store::models`.

pub mod requests;
pub mod responses;

pub use requests::*;
pub use responses::*;
