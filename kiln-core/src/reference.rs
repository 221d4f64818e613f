//! Canonical image references: `[registry/][namespace/]repository[:tag][@digest]`.
//!
//! Grounded on `cargo-green`'s `ImageUri` (a validated `nutype` newtype over
//! `String`) and on the `Reference`/`Digest` split used by container-image
//! tooling more broadly: a reference always resolves to a registry host, a
//! repository path, and an optional tag and/or digest, at least one of which
//! must be present.

use std::fmt;

use nutype::nutype;

/// Docker Hub aliases normalize to the canonical registry host, per
/// spec §3 ("Image Reference").
const DOCKER_HUB_ALIASES: [&str; 2] = ["docker.io", "index.docker.io"];
const DOCKER_HUB_CANONICAL: &str = "registry-1.docker.io";
const LIBRARY_NAMESPACE: &str = "library";

/// A SHA-256 content digest in `sha256:<64 hex>` form.
#[nutype(validate(predicate = is_sha256_digest), derive(Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef))]
pub struct Digest(String);

#[must_use]
fn is_sha256_digest(s: &str) -> bool {
    s.strip_prefix("sha256:").is_some_and(|hex| hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
}

impl Digest {
    #[must_use]
    pub fn from_bytes(algorithm_prefixed_hex: impl Into<String>) -> Result<Self, String> {
        Self::try_new(algorithm_prefixed_hex.into()).map_err(|e| e.to_string())
    }

    #[must_use]
    pub fn hex(&self) -> &str {
        self.as_ref().trim_start_matches("sha256:")
    }
}

/// A parsed, canonical container image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub registry: String,
    pub namespace: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl Reference {
    /// Parse a reference in `[registry/][namespace/]repository[:tag][@digest]`
    /// form, applying Docker Hub alias normalization and the `library/`
    /// default namespace per spec §3.
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.is_empty() {
            return Err("image reference cannot be empty".to_owned());
        }

        let (path_and_tag, digest) = match s.split_once('@') {
            Some((lhs, digest)) => (lhs, Some(Digest::from_bytes(digest.to_owned())?)),
            None => (s, None),
        };

        let (path, tag) = split_tag(path_and_tag);

        let segments: Vec<&str> = path.split('/').collect();
        let (registry, namespace, repository) = match segments.as_slice() {
            [repo] => (DOCKER_HUB_CANONICAL.to_owned(), Some(LIBRARY_NAMESPACE.to_owned()), (*repo).to_owned()),
            [ns, repo] if !looks_like_host(ns) => {
                (DOCKER_HUB_CANONICAL.to_owned(), Some((*ns).to_owned()), (*repo).to_owned())
            }
            [host, rest @ ..] if !rest.is_empty() => {
                let registry = normalize_registry(host);
                let (namespace, repository) = split_namespace(rest);
                (registry, namespace, repository)
            }
            _ => return Err(format!("cannot parse image reference: {s:?}")),
        };

        if tag.is_none() && digest.is_none() {
            return Err(format!("image reference needs a tag or digest: {s:?}"));
        }

        Ok(Self { registry, namespace, repository, tag, digest })
    }

    #[must_use]
    pub fn locked(&self) -> bool {
        self.digest.is_some()
    }

    #[must_use]
    pub fn lock(&self, digest: Digest) -> Self {
        Self { digest: Some(digest), ..self.clone() }
    }

    #[must_use]
    pub fn unlocked(&self) -> Self {
        Self { digest: None, ..self.clone() }
    }

    #[must_use]
    pub fn path(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{}", self.repository),
            None => self.repository.clone(),
        }
    }
}

fn looks_like_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn normalize_registry(host: &str) -> String {
    if DOCKER_HUB_ALIASES.contains(&host) {
        DOCKER_HUB_CANONICAL.to_owned()
    } else {
        host.to_owned()
    }
}

fn split_namespace<'a>(rest: &[&'a str]) -> (Option<String>, String) {
    match rest {
        [repo] => (None, (*repo).to_owned()),
        [ns @ .., repo] => (Some(ns.join("/")), (*repo).to_owned()),
        [] => unreachable!("caller checked non-empty"),
    }
}

fn split_tag(path: &str) -> (&str, Option<String>) {
    // A tag follows the final `:` after the final `/`, distinguishing it
    // from a `host:port` prefix.
    let last_slash = path.rfind('/');
    let search_from = last_slash.map_or(0, |i| i + 1);
    match path[search_from..].rfind(':') {
        Some(rel) => {
            let idx = search_from + rel;
            (&path[..idx], Some(path[idx + 1..].to_owned()))
        }
        None => (path, None),
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.path())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("alpine:3.18", DOCKER_HUB_CANONICAL, Some("library"), "alpine", Some("3.18"); "bare name defaults to library")]
    #[test_case("fenollp/supergreen:tagged", DOCKER_HUB_CANONICAL, Some("fenollp"), "supergreen", Some("tagged"); "namespace/repo defaults host")]
    #[test_case("ghcr.io/org/app:v1", "ghcr.io", Some("org"), "app", Some("v1"); "fully qualified")]
    #[test_case("docker.io/library/rust:1.85", DOCKER_HUB_CANONICAL, Some("library"), "rust", Some("1.85"); "docker.io alias normalizes")]
    #[test_case("index.docker.io/library/rust:1.85", DOCKER_HUB_CANONICAL, Some("library"), "rust", Some("1.85"); "index.docker.io alias normalizes")]
    #[test_case("localhost:5000/app:v1", "localhost:5000", None, "app", Some("v1"); "local registry with port")]
    fn parses(input: &str, registry: &str, namespace: Option<&str>, repository: &str, tag: Option<&str>) {
        let r = Reference::parse(input).unwrap();
        assert_eq!(r.registry, registry);
        assert_eq!(r.namespace.as_deref(), namespace);
        assert_eq!(r.repository, repository);
        assert_eq!(r.tag.as_deref(), tag);
    }

    #[test]
    fn requires_tag_or_digest() {
        assert!(Reference::parse("alpine").is_err());
    }

    #[test]
    fn parses_with_digest() {
        let digest = "sha256:".to_owned() + &"a".repeat(64);
        let r = Reference::parse(&format!("alpine@{digest}")).unwrap();
        assert!(r.locked());
        assert_eq!(r.digest.unwrap().to_string(), digest);
    }

    #[test]
    fn lock_and_unlock_roundtrip() {
        let r = Reference::parse("alpine:3.18").unwrap();
        let digest = Digest::from_bytes("sha256:".to_owned() + &"b".repeat(64)).unwrap();
        let locked = r.lock(digest.clone());
        assert!(locked.locked());
        assert_eq!(locked.unlocked(), r);
    }

    #[test]
    fn rejects_malformed_digest() {
        assert!(Digest::from_bytes("sha1:abc").is_err());
        assert!(Digest::from_bytes("sha256:nothex").is_err());
    }
}
