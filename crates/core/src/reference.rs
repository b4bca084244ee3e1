//! Image reference parsing and the mirror mapping.
//!
//! References are normalised the way registries resolve them: a bare
//! `nginx` becomes `index.docker.io/library/nginx:latest`. The mirror
//! destination of a reference is a flat repository under the mirror root,
//! named after the escaped source `registry/repository`.

#![forbid(unsafe_code)]

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_REGISTRY: &str = "index.docker.io";
pub const DEFAULT_TAG: &str = "latest";

const MAX_REPOSITORY_LEN: usize = 255;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag regex"));
static DIGEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-fA-F0-9]{32,}$").expect("digest regex"));
static COMPONENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("component regex"));
static HOST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*(?::[0-9]+)?$")
        .expect("host regex")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("invalid reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: &'static str },
}

impl ReferenceError {
    fn invalid(reference: &str, reason: &'static str) -> Self {
        Self::InvalidReference { reference: reference.to_string(), reason }
    }
}

/// Tag or content digest of a reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identifier {
    Tag(String),
    Digest(String),
}

impl Identifier {
    pub fn as_str(&self) -> &str {
        match self {
            Identifier::Tag(t) => t,
            Identifier::Digest(d) => d,
        }
    }

    /// Separator plus identifier, as it appears in a serialized reference.
    pub fn suffix(&self) -> String {
        match self {
            Identifier::Tag(t) => format!(":{}", t),
            Identifier::Digest(d) => format!("@{}", d),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub identifier: Identifier,
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        if input.is_empty() {
            return Err(ReferenceError::invalid(input, "empty reference"));
        }

        let (rest, digest) = match input.split_once('@') {
            Some((rest, digest)) => {
                if !DIGEST_RE.is_match(digest) {
                    return Err(ReferenceError::invalid(input, "malformed digest"));
                }
                (rest, Some(digest))
            }
            None => (input, None),
        };

        // A ':' after the last '/' starts the tag; earlier ones belong to a registry port.
        let last_slash = rest.rfind('/');
        let (name, tag) = match rest.rfind(':') {
            Some(i) if last_slash.map_or(true, |j| i > j) => (&rest[..i], Some(&rest[i + 1..])),
            _ => (rest, None),
        };
        if let Some(tag) = tag {
            if !TAG_RE.is_match(tag) {
                return Err(ReferenceError::invalid(input, "malformed tag"));
            }
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, remainder)) if looks_like_registry(first) => (first, remainder.to_string()),
            _ => (DEFAULT_REGISTRY, name.to_string()),
        };
        if !HOST_RE.is_match(registry) {
            return Err(ReferenceError::invalid(input, "malformed registry host"));
        }
        let registry = normalize_registry(registry);
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };
        if repository.len() > MAX_REPOSITORY_LEN {
            return Err(ReferenceError::invalid(input, "repository name too long"));
        }
        if !repository.split('/').all(|c| COMPONENT_RE.is_match(c)) {
            return Err(ReferenceError::invalid(input, "malformed repository"));
        }

        let identifier = match (digest, tag) {
            (Some(d), _) => Identifier::Digest(d.to_string()),
            (None, Some(t)) => Identifier::Tag(t.to_string()),
            (None, None) => Identifier::Tag(DEFAULT_TAG.to_string()),
        };
        Ok(Self { registry, repository, identifier })
    }

    /// `registry/repository`, without the identifier.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.registry, self.repository, self.identifier.suffix())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn looks_like_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn normalize_registry(host: &str) -> String {
    if host == "docker.io" { DEFAULT_REGISTRY.to_string() } else { host.to_string() }
}

/// Destination root in the mirror registry: a host, optionally followed by a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRoot(String);

impl MirrorRoot {
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let trimmed = input.trim_end_matches('/');
        let (host, path) = match trimmed.split_once('/') {
            Some((host, path)) => (host, Some(path)),
            None => (trimmed, None),
        };
        if host.is_empty() || !looks_like_registry(host) || !HOST_RE.is_match(host) {
            return Err(ReferenceError::invalid(input, "mirror root must start with a registry host"));
        }
        if let Some(path) = path {
            if !path.split('/').all(|c| COMPONENT_RE.is_match(c)) {
                return Err(ReferenceError::invalid(input, "malformed mirror root path"));
            }
        }
        let host = normalize_registry(host);
        Ok(Self(match path {
            Some(path) => format!("{}/{}", host, path),
            None => host,
        }))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn host(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// True when `reference` already lives under this root.
    pub fn contains(&self, reference: &ImageReference) -> bool {
        let name = reference.name();
        name.len() > self.0.len() && name.starts_with(&self.0) && name.as_bytes()[self.0.len()] == b'/'
    }
}

impl fmt::Display for MirrorRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replace `:`, `/` and `.` with `_`, folding to lowercase so the result is a
/// valid single repository component.
pub fn escape(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            ':' | '/' | '.' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Map `src` to its location in the mirror. References already under `root`
/// map to themselves.
pub fn map(src: &ImageReference, root: &MirrorRoot) -> Result<ImageReference, ReferenceError> {
    if root.contains(src) {
        return Ok(src.clone());
    }
    let dst = format!("{}/{}{}", root, escape(&src.name()), src.identifier.suffix());
    ImageReference::parse(&dst).map_err(|_| ReferenceError::invalid(&dst, "mirror destination does not reparse"))
}
