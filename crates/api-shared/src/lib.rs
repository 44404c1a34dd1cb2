//! # API Shared
//!
//! Shared definitions for the pvfll APIs.
//!
//! Contains:
//! - Request/response bodies (`types` module) with their OpenAPI schemas
//! - Shared services like `HealthService`
//!
//! Used by `api-rest` and the root binary.

pub mod health;
pub mod types;

pub use health::HealthService;
pub use types::*;
