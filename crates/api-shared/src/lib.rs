//! # API Shared
//!
//! Shared utilities and definitions for UMS APIs.
//!
//! Contains:
//! - Request/response messages with OpenAPI schemas (`dto` module)
//! - Shared services like `HealthService`
//!
//! Used by `api-rest` and the root `ums-run` binary.

pub mod dto;
pub mod health;

pub use dto::*;
pub use health::HealthService;
