//! Maps a third-party image onto the backup registry.
//!
//! The destination of `[registry/][path/]repository[:tag][@digest]` is always
//! `[provider/]username/repository[:tag][@digest]`: the source registry and any
//! nested path are dropped, so every backup lands in the operator's own account.

use crate::credentials::{CredentialsProvider, RegistryCredentials};
use crate::error::Result;
use std::sync::Arc;

/// Returns the repository name (last path segment) and the tag of an image.
/// Either is empty when absent. A digest suffix is ignored here.
pub fn repo_and_tag(image: &str) -> (String, String) {
    let (name_and_tag, _) = split_digest(image);
    if name_and_tag.is_empty() {
        return (String::new(), String::new());
    }

    let last_slash = name_and_tag.rfind('/');
    let (without_tag, tag) = match name_and_tag.rfind(':') {
        Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
            (&name_and_tag[..pos], &name_and_tag[pos + 1..])
        }
        _ => (name_and_tag, ""),
    };

    let repository = without_tag.rsplit('/').next().unwrap_or(without_tag);
    (repository.to_string(), tag.to_string())
}

fn split_digest(image: &str) -> (&str, Option<&str>) {
    match image.split_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (image, None),
    }
}

/// Builds the destination image for `source` from already loaded credentials.
/// An empty source yields an empty destination.
pub fn destination_image(source: &str, credentials: &RegistryCredentials) -> String {
    let (repository, tag) = repo_and_tag(source);
    if repository.is_empty() {
        return String::new();
    }

    let mut destination = String::new();
    if let Some(provider) = &credentials.provider {
        destination.push_str(provider);
        destination.push('/');
    }
    destination.push_str(&credentials.username);
    destination.push('/');
    destination.push_str(&repository);

    if !tag.is_empty() {
        destination.push(':');
        destination.push_str(&tag);
    }
    if let (_, Some(digest)) = split_digest(source) {
        destination.push('@');
        destination.push_str(digest);
    }

    destination
}

/// Resolves destination images, loading credentials fresh on every call
#[derive(Clone)]
pub struct Resolver {
    credentials: Arc<dyn CredentialsProvider>,
}

impl Resolver {
    pub fn new(credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self { credentials }
    }

    pub fn resolve(&self, source: &str) -> Result<String> {
        let credentials = self.credentials.load()?;
        Ok(destination_image(source, &credentials))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::error::Error;
    use crate::secret_string::SecretString;

    const USERNAME: &str = "foo";
    const PASSWORD: &str = "bar";
    const PROVIDER: &str = "test";

    fn credentials(provider: &str) -> RegistryCredentials {
        RegistryCredentials::new(
            Some(provider.to_string()),
            USERNAME.to_string(),
            SecretString::new(PASSWORD),
        )
        .unwrap()
    }

    #[test]
    fn test_repo_and_tag() {
        let cases = [
            ("ubuntu", "ubuntu", ""),
            ("quay.io/busybox", "busybox", ""),
            ("ubuntu:1.0", "ubuntu", "1.0"),
            ("quay.io/testrepo:v2.0", "testrepo", "v2.0"),
            ("localhost:5000/team/app", "app", ""),
            ("localhost:5000/team/app:3", "app", "3"),
            ("", "", ""),
        ];

        for (input, repo, tag) in cases {
            assert_eq!(
                repo_and_tag(input),
                (repo.to_string(), tag.to_string()),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn test_destination_image() {
        let cases = [
            (PROVIDER, "ubuntu", "test/foo/ubuntu"),
            ("", "ubuntu", "foo/ubuntu"),
            (PROVIDER, "quay.io/busybox", "test/foo/busybox"),
            (PROVIDER, "ubuntu:1.0", "test/foo/ubuntu:1.0"),
            (PROVIDER, "quay.io/testrepo:v2.0", "test/foo/testrepo:v2.0"),
            ("", "quay.io/testrepo:v2.0", "foo/testrepo:v2.0"),
        ];

        for (provider, input, output) in cases {
            assert_eq!(destination_image(input, &credentials(provider)), output);
        }
    }

    #[test]
    fn test_destination_keeps_digest() {
        let digest = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let source = format!("gcr.io/distroless/static:nonroot@{}", digest);
        assert_eq!(
            destination_image(&source, &credentials("")),
            format!("foo/static:nonroot@{}", digest)
        );
    }

    #[test]
    fn test_destination_is_stable_under_reresolution() {
        let creds = credentials(PROVIDER);
        let once = destination_image("quay.io/prometheus/node-exporter:v1.8.0", &creds);
        let twice = destination_image(&once, &creds);
        assert_eq!(once, "test/foo/node-exporter:v1.8.0");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_source_resolves_to_empty() {
        assert_eq!(destination_image("", &credentials(PROVIDER)), "");
    }

    #[test]
    fn test_resolver_is_deterministic() {
        let resolver = Resolver::new(Arc::new(StaticCredentials(credentials(PROVIDER))));
        let first = resolver.resolve("nginx:1.14.2").unwrap();
        let second = resolver.resolve("nginx:1.14.2").unwrap();
        assert_eq!(first, "test/foo/nginx:1.14.2");
        assert_eq!(first, second);
    }

    #[test]
    fn test_resolver_propagates_missing_credentials() {
        struct Missing;
        impl CredentialsProvider for Missing {
            fn load(&self) -> Result<RegistryCredentials> {
                Err(Error::CredentialsMissing)
            }
        }

        let resolver = Resolver::new(Arc::new(Missing));
        assert!(matches!(
            resolver.resolve("ubuntu"),
            Err(Error::CredentialsMissing)
        ));
    }
}
