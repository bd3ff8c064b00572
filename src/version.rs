//! Docker Engine API versions.
//!
//! Versions are parsed leniently: `"1.41"` becomes `[1, 41]`, and any segment
//! which is not a non-negative integer is read as `0`. Comparison and equality
//! are numeric, with missing trailing segments treated as zero, so `"1.0"`,
//! `"1.00"` and `"1"` are all the same version.
//!
//! [`ApiVersion::Default`] stands for "whatever the daemon speaks". It sorts
//! above every concrete version and has no version string.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use thiserror::Error;

/// The default version sentinel has no version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the default api version has no version string")]
pub struct DefaultVersionError;

/// A Docker Engine API version, or the default sentinel.
#[derive(Debug, Clone, Default)]
pub enum ApiVersion {
    /// No specific version requested, use the daemon's.
    #[default]
    Default,

    /// A concrete, dot separated version.
    Version(Version),
}

/// A concrete API version.
#[derive(Debug, Clone)]
pub struct Version {
    text: Box<str>,
    segments: Vec<u32>,
}

impl Version {
    fn parse(text: &str) -> Self {
        let text = text.trim();
        let segments = text
            .split('.')
            .map(|segment| segment.trim().parse::<u32>().unwrap_or(0))
            .collect();
        Self {
            text: text.into(),
            segments,
        }
    }

    /// The numeric segments of this version.
    pub fn segments(&self) -> &[u32] {
        &self.segments
    }

    /// The version as originally written.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn significant(&self) -> &[u32] {
        let end = self
            .segments
            .iter()
            .rposition(|segment| *segment != 0)
            .map_or(0, |idx| idx + 1);
        &self.segments[..end]
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        (0..len)
            .map(|idx| {
                let lhs = self.segments.get(idx).copied().unwrap_or(0);
                let rhs = other.segments.get(idx).copied().unwrap_or(0);
                lhs.cmp(&rhs)
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl ApiVersion {
    /// Parse a version string. This never fails: unparsable segments become `0`.
    pub fn parse(text: &str) -> Self {
        ApiVersion::Version(Version::parse(text))
    }

    /// Is this the default sentinel?
    pub fn is_default(&self) -> bool {
        matches!(self, ApiVersion::Default)
    }

    /// The version string, e.g. `"1.41"`.
    ///
    /// Fails for the default sentinel, which does not name a version.
    pub fn version_string(&self) -> Result<&str, DefaultVersionError> {
        match self {
            ApiVersion::Default => Err(DefaultVersionError),
            ApiVersion::Version(version) => Ok(version.as_str()),
        }
    }

    /// The request path prefix for this version (`/v1.41`), empty for the default.
    pub(crate) fn path_prefix(&self) -> String {
        match self {
            ApiVersion::Default => String::new(),
            ApiVersion::Version(version) => format!("/v{}", version.as_str()),
        }
    }
}

impl FromStr for ApiVersion {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ApiVersion::parse(s))
    }
}

impl From<&str> for ApiVersion {
    fn from(value: &str) -> Self {
        ApiVersion::parse(value)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiVersion::Default => f.write_str("default"),
            ApiVersion::Version(version) => f.write_str(version.as_str()),
        }
    }
}

impl PartialEq for ApiVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ApiVersion {}

impl PartialOrd for ApiVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ApiVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ApiVersion::Default, ApiVersion::Default) => Ordering::Equal,
            (ApiVersion::Default, ApiVersion::Version(_)) => Ordering::Greater,
            (ApiVersion::Version(_), ApiVersion::Default) => Ordering::Less,
            (ApiVersion::Version(lhs), ApiVersion::Version(rhs)) => lhs.cmp(rhs),
        }
    }
}

impl Hash for ApiVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ApiVersion::Default => state.write_u8(0),
            ApiVersion::Version(version) => {
                state.write_u8(1);
                version.hash(state);
            }
        }
    }
}
