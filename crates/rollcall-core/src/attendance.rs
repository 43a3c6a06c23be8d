//! Registration and verification flows.
//!
//! Verification runs a fixed sequence per request:
//! `DescriptorExtracted -> Matching -> {Matched | NoMatch}`, or terminates
//! early at `NoFaceDetected`. Only `Matched` appends an attendance event.
//! No state is carried between requests and nothing is retried here.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::enrollment::{DescriptorSpec, EnrollError, EnrollmentManager};
use crate::matcher::{EuclideanMatcher, MatchError, Matcher, DEFAULT_THRESHOLD};
use crate::provider::{extract_with_timeout, DescriptorProvider, ProviderError};
use crate::store::{AttendanceSink, IdentityStore, StoreError};
use crate::types::{AttendanceEvent, Descriptor, GeoLocation, Identity, MatchResult};

/// Default bound on a single descriptor extraction.
pub const DEFAULT_EXTRACTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("descriptor provider: {0}")]
    Provider(ProviderError),
    #[error("invalid location: lat {}, lon {}", .0.latitude, .0.longitude)]
    InvalidLocation(GeoLocation),
    #[error("matcher: {0}")]
    Match(#[from] MatchError),
    #[error("identity store: {0}")]
    Store(StoreError),
    #[error("attendance sink: {0}")]
    Sink(StoreError),
}

impl From<ProviderError> for VerifyError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NoFaceDetected => VerifyError::NoFaceDetected,
            other => VerifyError::Provider(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("descriptor provider: {0}")]
    Provider(ProviderError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
}

impl From<ProviderError> for RegisterError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NoFaceDetected => RegisterError::NoFaceDetected,
            other => RegisterError::Provider(other),
        }
    }
}

/// Stage of a single verification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStage {
    DescriptorExtracted,
    Matching,
    Matched,
    NoMatch,
    NoFaceDetected,
}

impl fmt::Display for VerifyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerifyStage::DescriptorExtracted => "descriptor_extracted",
            VerifyStage::Matching => "matching",
            VerifyStage::Matched => "matched",
            VerifyStage::NoMatch => "no_match",
            VerifyStage::NoFaceDetected => "no_face_detected",
        };
        f.write_str(s)
    }
}

/// A confirmed match and the attendance event it produced.
#[derive(Debug, Clone)]
pub struct Verified {
    pub handle: String,
    pub display_name: String,
    pub distance: f32,
    pub event: AttendanceEvent,
}

#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    Matched(Verified),
    /// A face was seen but no enrolled identity is close enough.
    NoMatch,
}

/// Deployment-wide decision parameters.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Exclusive upper bound on match distance.
    pub threshold: f32,
    pub extraction_timeout: Duration,
    pub descriptor: DescriptorSpec,
}

impl Policy {
    pub fn new(descriptor: DescriptorSpec) -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            extraction_timeout: DEFAULT_EXTRACTION_TIMEOUT,
            descriptor,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_extraction_timeout(mut self, timeout: Duration) -> Self {
        self.extraction_timeout = timeout;
        self
    }

    /// Probe descriptors must have the configured shape before matching.
    fn check_probe(&self, probe: &Descriptor) -> Result<(), MatchError> {
        if probe.model_version != self.descriptor.model_version {
            return Err(MatchError::VersionMismatch {
                expected: self.descriptor.model_version.clone(),
                actual: probe.model_version.clone(),
            });
        }
        if probe.len() != self.descriptor.dim {
            return Err(MatchError::DimensionMismatch {
                expected: self.descriptor.dim,
                actual: probe.len(),
            });
        }
        if let Some(index) = probe.values.iter().position(|v| !v.is_finite()) {
            return Err(MatchError::NonFiniteProbe { index });
        }
        Ok(())
    }
}

/// Wires a descriptor provider, identity store and attendance sink together.
pub struct AttendanceService<'a, P, S: ?Sized, A: ?Sized, M = EuclideanMatcher> {
    provider: &'a P,
    store: &'a S,
    sink: &'a A,
    matcher: M,
    policy: Policy,
}

impl<'a, P, S, A> AttendanceService<'a, P, S, A, EuclideanMatcher>
where
    P: DescriptorProvider,
    S: IdentityStore + ?Sized,
    A: AttendanceSink + ?Sized,
{
    pub fn new(provider: &'a P, store: &'a S, sink: &'a A, policy: Policy) -> Self {
        Self {
            provider,
            store,
            sink,
            matcher: EuclideanMatcher,
            policy,
        }
    }
}

impl<'a, P, S, A, M> AttendanceService<'a, P, S, A, M>
where
    P: DescriptorProvider,
    S: IdentityStore + ?Sized,
    A: AttendanceSink + ?Sized,
    M: Matcher,
{
    pub fn with_matcher<M2: Matcher>(self, matcher: M2) -> AttendanceService<'a, P, S, A, M2> {
        AttendanceService {
            provider: self.provider,
            store: self.store,
            sink: self.sink,
            matcher,
            policy: self.policy,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Extract a descriptor from `image` and enroll it for `handle`.
    ///
    /// The identity is looked up before extraction so an unknown handle
    /// never costs an inference.
    pub async fn register(&self, handle: &str, image: &[u8]) -> Result<Identity, RegisterError> {
        let manager = EnrollmentManager::new(self.store, self.policy.descriptor.clone());
        manager.identity(handle)?;

        let descriptor = match self.extract(image).await {
            Ok(d) => d,
            Err(ProviderError::NoFaceDetected) => {
                tracing::debug!(handle, "register: no face detected");
                return Err(RegisterError::NoFaceDetected);
            }
            Err(e) => return Err(e.into()),
        };

        let identity = manager.enroll(handle, descriptor)?;
        tracing::info!(handle, name = %identity.display_name, "register: descriptor enrolled");
        Ok(identity)
    }

    /// Identify the face in `image` and record attendance on a match.
    pub async fn verify(
        &self,
        image: &[u8],
        location: Option<GeoLocation>,
    ) -> Result<VerifyOutcome, VerifyError> {
        if let Some(loc) = location {
            if !loc.is_valid() {
                return Err(VerifyError::InvalidLocation(loc));
            }
        }

        let probe = match self.extract(image).await {
            Ok(d) => d,
            Err(ProviderError::NoFaceDetected) => {
                tracing::debug!(stage = %VerifyStage::NoFaceDetected, "verify: no face detected");
                return Err(VerifyError::NoFaceDetected);
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(
            stage = %VerifyStage::DescriptorExtracted,
            dim = probe.len(),
            model_version = self.provider.model_version(),
            "verify: descriptor extracted"
        );

        if let Err(e) = self.policy.check_probe(&probe) {
            tracing::error!(error = %e, "verify: probe descriptor does not match configured model");
            return Err(e.into());
        }

        let gallery = self.store.list_with_descriptor().map_err(VerifyError::Store)?;
        tracing::debug!(
            stage = %VerifyStage::Matching,
            candidates = gallery.len(),
            threshold = self.policy.threshold,
            "verify: matching"
        );

        let result = match self.matcher.compare(&probe, &gallery, self.policy.threshold) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "verify: enrolled descriptors inconsistent with probe");
                return Err(e.into());
            }
        };

        let candidate = match result {
            MatchResult::Matched(c) => c,
            MatchResult::NoMatch => {
                tracing::info!(stage = %VerifyStage::NoMatch, "verify: no identity matched");
                return Ok(VerifyOutcome::NoMatch);
            }
        };

        let display_name = gallery
            .iter()
            .find(|i| i.handle == candidate.handle)
            .map(|i| i.display_name.clone())
            .unwrap_or_default();

        let event = AttendanceEvent::present(candidate.handle.clone(), location);
        self.sink.append(&event).map_err(VerifyError::Sink)?;

        tracing::info!(
            stage = %VerifyStage::Matched,
            handle = %candidate.handle,
            distance = candidate.distance,
            event_id = %event.id,
            "verify: attendance recorded"
        );

        Ok(VerifyOutcome::Matched(Verified {
            handle: candidate.handle,
            display_name,
            distance: candidate.distance,
            event,
        }))
    }

    async fn extract(&self, image: &[u8]) -> Result<Descriptor, ProviderError> {
        let result =
            extract_with_timeout(self.provider, image, self.policy.extraction_timeout).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                tracing::warn!(error = %e, "descriptor provider failed");
            }
        }
        result
    }
}
