//! HTTP/WebSocket boundary for the orchestration runtime.
//!
//! The core actor tree never depends on axum; only this module does.
//! Handlers translate JSON requests into actor messages and actor replies
//! back into JSON, mapping `OrchestratorError` onto HTTP status codes via
//! [`ApiError`].

pub mod error;
pub mod response;
pub mod routes;
pub mod ws;

pub use error::{ApiError, ApiErrorResponse, ApiResult};
pub use response::{ErrorResponse, PaginatedResponse, SuccessResponse};
pub use routes::{create_router, AppState};
