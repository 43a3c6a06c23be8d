//! Enrollment: attach a validated descriptor to an existing identity.

use thiserror::Error;

use crate::store::{IdentityStore, StoreError};
use crate::types::{Descriptor, Identity};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    #[error("identity not found: {0}")]
    IdentityNotFound(String),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("identity store: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EnrollError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(handle) => EnrollError::IdentityNotFound(handle),
            other => EnrollError::Store(other),
        }
    }
}

/// Shape every stored descriptor must have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSpec {
    pub dim: usize,
    pub model_version: String,
}

impl DescriptorSpec {
    pub fn new(dim: usize, model_version: impl Into<String>) -> Self {
        Self {
            dim,
            model_version: model_version.into(),
        }
    }

    pub fn validate(&self, descriptor: &Descriptor) -> Result<(), EnrollError> {
        if descriptor.is_empty() {
            return Err(EnrollError::InvalidDescriptor("descriptor is empty".into()));
        }
        if descriptor.len() != self.dim {
            return Err(EnrollError::InvalidDescriptor(format!(
                "expected {}-dim descriptor, got {}",
                self.dim,
                descriptor.len()
            )));
        }
        if descriptor.model_version != self.model_version {
            return Err(EnrollError::InvalidDescriptor(format!(
                "expected model version {}, got {}",
                self.model_version, descriptor.model_version
            )));
        }
        if let Some(i) = descriptor.values.iter().position(|v| !v.is_finite()) {
            return Err(EnrollError::InvalidDescriptor(format!(
                "non-finite value at index {i}"
            )));
        }
        Ok(())
    }
}

/// Stores one descriptor per identity, replacing any previous one.
pub struct EnrollmentManager<'a, S: ?Sized> {
    store: &'a S,
    spec: DescriptorSpec,
}

impl<'a, S: IdentityStore + ?Sized> EnrollmentManager<'a, S> {
    pub fn new(store: &'a S, spec: DescriptorSpec) -> Self {
        Self { store, spec }
    }

    pub fn spec(&self) -> &DescriptorSpec {
        &self.spec
    }

    /// Look up `handle`, failing with `IdentityNotFound` if it is unknown.
    pub fn identity(&self, handle: &str) -> Result<Identity, EnrollError> {
        Ok(self.store.find_by_handle(handle)?)
    }

    /// Validate `descriptor` and make it the sole descriptor of `handle`.
    ///
    /// Returns the identity as stored after the write.
    pub fn enroll(&self, handle: &str, descriptor: Descriptor) -> Result<Identity, EnrollError> {
        let identity = self.identity(handle)?;
        self.spec.validate(&descriptor)?;
        self.store.set_descriptor(handle, &descriptor)?;
        Ok(identity.with_descriptor(descriptor))
    }
}
