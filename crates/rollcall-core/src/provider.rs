//! Descriptor provider interface.
//!
//! Turning pixels into a descriptor is delegated to an external model. This
//! module defines the contract and the bounded wait around it; the provider
//! call is the only suspension point in a verification or registration.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::types::Descriptor;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("descriptor extraction timed out after {0:?}")]
    ExtractionTimeout(Duration),
    #[error("descriptor extraction failed: {0}")]
    ExtractionFailed(String),
}

impl ProviderError {
    /// External dependency failures the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::ExtractionTimeout(_) | ProviderError::ExtractionFailed(_)
        )
    }
}

/// Produces at most one descriptor from encoded image bytes.
///
/// Must be deterministic for identical pixels and model version.
pub trait DescriptorProvider: Send + Sync {
    /// Model version stamped on every descriptor this provider produces.
    fn model_version(&self) -> &str;

    fn extract(
        &self,
        image: &[u8],
    ) -> impl Future<Output = Result<Descriptor, ProviderError>> + Send;
}

/// Run `provider.extract` bounded by `timeout`.
pub async fn extract_with_timeout<P>(
    provider: &P,
    image: &[u8],
    timeout: Duration,
) -> Result<Descriptor, ProviderError>
where
    P: DescriptorProvider,
{
    match tokio::time::timeout(timeout, provider.extract(image)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::ExtractionTimeout(timeout)),
    }
}
