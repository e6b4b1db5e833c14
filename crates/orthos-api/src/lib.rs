//! orthos-api: Shared API types and schemas
//!
//! Request/response bodies and fleet events with their OpenAPI schemas,
//! shared by the daemon and its clients.

pub mod events;
pub mod requests;
pub mod responses;
