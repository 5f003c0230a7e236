//! Artifact references — registry location plus an immutable version tag.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A container image published to a registry, e.g.
/// `registry.example.com/team/api:v2`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("malformed version tag: {0:?}")]
    MalformedTag(String),
    #[error("invalid registry location: {0:?}")]
    InvalidLocation(String),
    #[error("unexpected repository {found:?}, expected {expected:?}")]
    UnexpectedRepository { expected: String, found: String },
    #[error("tag pattern: {0}")]
    Pattern(String),
}

/// OCI distribution tag grammar.
const TAG_PATTERN: &str = r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$";

/// Check a version string against the OCI tag grammar.
pub fn validate_tag(tag: &str) -> Result<(), ArtifactError> {
    let tag_re = Regex::new(TAG_PATTERN).map_err(|e| ArtifactError::Pattern(e.to_string()))?;
    if tag_re.is_match(tag) {
        Ok(())
    } else {
        Err(ArtifactError::MalformedTag(tag.to_string()))
    }
}

/// Split `registry.example.com/team/api` (optionally `oci://`-prefixed)
/// into `(registry, repository)`.
pub fn split_location(location: &str) -> Result<(String, String), ArtifactError> {
    let rest = location.strip_prefix("oci://").unwrap_or(location);
    let rest = rest.trim_end_matches('/');
    let (registry, repository) = rest
        .split_once('/')
        .ok_or_else(|| ArtifactError::InvalidLocation(location.to_string()))?;
    if registry.is_empty() || repository.is_empty() || repository.contains(':') {
        return Err(ArtifactError::InvalidLocation(location.to_string()));
    }
    Ok((registry.to_string(), repository.to_string()))
}

impl ArtifactRef {
    /// Build a reference from a registry location and a version tag.
    pub fn parse(location: &str, tag: &str) -> Result<Self, ArtifactError> {
        validate_tag(tag)?;
        let (registry, repository) = split_location(location)?;
        Ok(Self {
            registry,
            repository,
            tag: tag.to_string(),
        })
    }

    /// Require that this reference points at the expected `registry/repository`.
    pub fn expect_repository(&self, expected: &str) -> Result<(), ArtifactError> {
        let (registry, repository) = split_location(expected)?;
        if self.registry == registry && self.repository == repository {
            Ok(())
        } else {
            Err(ArtifactError::UnexpectedRepository {
                expected: expected.to_string(),
                found: self.location(),
            })
        }
    }

    /// `registry/repository` without the tag.
    pub fn location(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Full image reference handed to the scheduler.
    pub fn image(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.image())
    }
}
