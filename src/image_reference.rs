use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

pub const DOCKER_HUB_REGISTRY: &str = "docker.io";
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
const DOCKER_HUB_OFFICIAL_NAMESPACE: &str = "library";
const DEFAULT_TAG: &str = "latest";

static PATH_COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("valid path component regex")
});
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("valid tag regex"));
static DIGEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-fA-F0-9]{32,}$").expect("valid digest regex")
});
static REGISTRY_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9](?:[a-zA-Z0-9.-]*[a-zA-Z0-9])?(?::[0-9]+)?$")
        .expect("valid registry host regex")
});

/// A fully qualified container image reference, normalized the way the Docker CLI does it:
/// `ubuntu` becomes `docker.io/library/ubuntu` and an absent tag means `latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("image reference is empty")]
    Empty,
    #[error("repository is missing")]
    MissingRepository,
    #[error("invalid registry: {0}")]
    InvalidRegistry(String),
    #[error("invalid repository: {0}")]
    InvalidRepository(String),
    #[error("invalid tag: {0}")]
    InvalidTag(String),
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        let (name_and_tag, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                if !DIGEST.is_match(digest) {
                    return Err(ParseError::InvalidDigest(digest.to_string()));
                }
                (name, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // A colon only separates a tag when it follows the last slash, otherwise it is a port
        let (name, tag) = match name_and_tag.rfind(':') {
            Some(pos) if pos > name_and_tag.rfind('/').unwrap_or(0) => {
                let tag = &name_and_tag[pos + 1..];
                if !TAG.is_match(tag) {
                    return Err(ParseError::InvalidTag(tag.to_string()));
                }
                (&name_and_tag[..pos], Some(tag.to_string()))
            }
            _ => (name_and_tag, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first.to_string(), rest.to_string()),
            _ => (DOCKER_HUB_REGISTRY.to_string(), name.to_string()),
        };

        if !REGISTRY_HOST.is_match(&registry) {
            return Err(ParseError::InvalidRegistry(registry));
        }
        if repository.is_empty() {
            return Err(ParseError::MissingRepository);
        }
        if !repository.split('/').all(|c| PATH_COMPONENT.is_match(c)) {
            return Err(ParseError::InvalidRepository(repository));
        }

        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("{}/{}", DOCKER_HUB_OFFICIAL_NAMESPACE, repository)
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Host that serves the registry's /v2/ API
    pub fn api_host(&self) -> &str {
        if self.registry == DOCKER_HUB_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// The manifest reference to request: the digest when pinned, otherwise the tag
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }
}

fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}
