use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::matcher::MatchError;

/// Face descriptor: a fixed-length embedding produced by an external model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model version that produced this descriptor. Descriptors from
    /// different model versions are never compared.
    pub model_version: String,
}

impl Descriptor {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: model_version.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Check that `other` can be compared against `self`.
    pub fn check_compatible(&self, other: &Descriptor) -> Result<(), MatchError> {
        if self.model_version != other.model_version {
            return Err(MatchError::VersionMismatch {
                expected: self.model_version.clone(),
                actual: other.model_version.clone(),
            });
        }
        if self.values.len() != other.values.len() {
            return Err(MatchError::DimensionMismatch {
                expected: self.values.len(),
                actual: other.values.len(),
            });
        }
        Ok(())
    }

    /// Euclidean distance between two descriptors.
    ///
    /// Smaller is more similar; a descriptor is at distance exactly 0.0 from
    /// itself. Fails rather than truncating when lengths or versions differ.
    pub fn euclidean_distance(&self, other: &Descriptor) -> Result<f32, MatchError> {
        self.check_compatible(other)?;
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

/// An enrolled identity as held by the identity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub handle: String,
    pub display_name: String,
    /// At most one descriptor per identity; enrollment replaces it.
    pub descriptor: Option<Descriptor>,
}

impl Identity {
    pub fn new(handle: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            display_name: display_name.into(),
            descriptor: None,
        }
    }

    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }
}

/// A candidate identity paired with its distance to a probe descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub handle: String,
    pub distance: f32,
}

/// Result of matching a probe descriptor against the enrolled gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched(MatchCandidate),
    NoMatch,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched(_))
    }

    pub fn handle(&self) -> Option<&str> {
        match self {
            MatchResult::Matched(c) => Some(&c.handle),
            MatchResult::NoMatch => None,
        }
    }
}

/// Latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    /// Both coordinates finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "present" => Some(AttendanceStatus::Present),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record that an identity was verified present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: Uuid,
    pub handle: String,
    pub recorded_at: DateTime<Utc>,
    pub status: AttendanceStatus,
    pub location: Option<GeoLocation>,
}

impl AttendanceEvent {
    /// A fresh "present" event stamped with the current time.
    pub fn present(handle: impl Into<String>, location: Option<GeoLocation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            handle: handle.into(),
            recorded_at: Utc::now(),
            status: AttendanceStatus::Present,
            location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec(), "test-v1")
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = d(&[0.31, -0.2, 0.77, 0.05]);
        assert_eq!(a.euclidean_distance(&a).unwrap(), 0.0);
    }

    #[test]
    fn test_distance_symmetric() {
        let a = d(&[0.1, 0.2, 0.3]);
        let b = d(&[-0.4, 0.9, 0.05]);
        assert_eq!(
            a.euclidean_distance(&b).unwrap(),
            b.euclidean_distance(&a).unwrap()
        );
    }

    #[test]
    fn test_distance_known_value() {
        let a = d(&[0.0, 0.0]);
        let b = d(&[3.0, 4.0]);
        assert!((a.euclidean_distance(&b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let a = d(&[1.0, 0.0, 0.0]);
        let b = d(&[1.0, 0.0]);
        assert_eq!(
            a.euclidean_distance(&b),
            Err(MatchError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_distance_version_mismatch() {
        let a = d(&[1.0, 0.0]);
        let b = Descriptor::new(vec![1.0, 0.0], "test-v2");
        assert!(matches!(
            a.euclidean_distance(&b),
            Err(MatchError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_geolocation_bounds() {
        assert!(GeoLocation { latitude: -6.2, longitude: 106.8 }.is_valid());
        assert!(GeoLocation { latitude: 90.0, longitude: -180.0 }.is_valid());
        assert!(!GeoLocation { latitude: 91.0, longitude: 0.0 }.is_valid());
        assert!(!GeoLocation { latitude: 0.0, longitude: 180.5 }.is_valid());
        assert!(!GeoLocation { latitude: f64::NAN, longitude: 0.0 }.is_valid());
    }

    #[test]
    fn test_present_event() {
        let event = AttendanceEvent::present("alice", None);
        assert_eq!(event.handle, "alice");
        assert_eq!(event.status, AttendanceStatus::Present);
        assert_eq!(event.status.to_string(), "present");
        assert!(event.location.is_none());
    }

    #[test]
    fn test_status_label_roundtrip() {
        assert_eq!(AttendanceStatus::parse("present"), Some(AttendanceStatus::Present));
        assert_eq!(AttendanceStatus::parse("Hadir"), None);
    }
}
