//! rollcall-core — Face descriptor matching and attendance decisions.
//!
//! Descriptors come from an external embedding model behind
//! [`DescriptorProvider`]. This crate validates and enrolls them, finds the
//! nearest enrolled identity under a distance threshold, and records an
//! attendance event for each confirmed match.

pub mod attendance;
pub mod enrollment;
pub mod external;
pub mod matcher;
pub mod memory;
pub mod provider;
pub mod store;
pub mod types;

pub use attendance::{
    AttendanceService, Policy, RegisterError, Verified, VerifyError, VerifyOutcome, VerifyStage,
};
pub use enrollment::{DescriptorSpec, EnrollError, EnrollmentManager};
pub use external::CommandProvider;
pub use matcher::{EuclideanMatcher, MatchError, Matcher, DEFAULT_THRESHOLD};
pub use memory::MemoryStore;
pub use provider::{extract_with_timeout, DescriptorProvider, ProviderError};
pub use store::{AttendanceSink, IdentityStore, StoreError};
pub use types::{
    AttendanceEvent, AttendanceStatus, Descriptor, GeoLocation, Identity, MatchCandidate,
    MatchResult,
};
