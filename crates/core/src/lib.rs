//! `finadvisor-core`
//!
//! Domain value objects shared by the bridge and its callers.
//!
//! This crate contains **pure** types and rules (no IO): the caller-facing
//! analysis request/response, the user profile, health snapshots and the
//! identifiers used to correlate calls.

pub mod error;
pub mod finance;
pub mod health;
pub mod id;
pub mod value_object;

pub use error::{DomainError, DomainResult};
pub use finance::{
    AnalysisRequest, AnalysisRequestInput, AnalysisResponse, Transaction, UserProfile,
    UserProfileInput,
};
pub use health::{AI_SERVICE_CHECK, BACKEND_CHECK, HealthState, HealthStatus};
pub use id::{CallId, RequestId};
pub use value_object::ValueObject;
