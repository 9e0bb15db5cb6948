//! HTTP surface: the client-facing router and its middleware.

pub mod client;
pub mod client_auth;
pub mod request_id;
