//! Remote collaborators: the conversion job service and the identity
//! provider.
//!
//! The tracker only sees the two traits defined here. The HTTP
//! implementations live in the submodules; tests substitute in-process fakes.
//!
//! ```text
//! Tracker ──▶ ConversionService ──▶ POST /tasks, GET /tasks/{id}, GET …/download
//!         └─▶ IdentityProvider  ──▶ POST /api/auth/local
//! ```
//!
//! Every authorized call receives the bearer token explicitly; neither
//! implementation caches credentials. A rejected credential is reported as
//! [`ServiceError::Unauthorized`] regardless of endpoint.

pub mod conversion;
pub mod identity;

use crate::error::ServiceError;
use crate::job::JobSnapshot;
use crate::session::UserIdentity;
use crate::submit::{DownloadTarget, SubmitRequest};
use async_trait::async_trait;

pub use conversion::HttpConversionService;
pub use identity::HttpIdentityProvider;

/// The remote conversion pipeline, seen as an opaque job service.
#[async_trait]
pub trait ConversionService: Send + Sync {
    /// Upload documents. Returns one snapshot per accepted document, in
    /// submission order; multi-document submissions share a batch id.
    async fn submit(
        &self,
        token: &str,
        request: &SubmitRequest,
    ) -> Result<Vec<JobSnapshot>, ServiceError>;

    /// Current state of one job.
    async fn fetch_job(&self, token: &str, job_id: &str) -> Result<JobSnapshot, ServiceError>;

    /// Result archive of a job or a whole batch.
    async fn download(&self, token: &str, target: &DownloadTarget)
        -> Result<Vec<u8>, ServiceError>;
}

/// Exchanges credentials for a session token.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// On failure, [`ServiceError::Status`] carries the provider's
    /// human-readable message in `detail`.
    async fn authenticate(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<(String, UserIdentity), ServiceError>;
}
