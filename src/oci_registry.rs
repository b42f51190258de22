use crate::config::RegistryConfig;
use crate::credentials::RegistryCredentials;
use crate::image_reference::ImageReference;
use crate::secret_string::SecretString;
use anyhow::Context;
use regex::Regex;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Body, Certificate, Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info};

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

static CHALLENGE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("valid challenge regex"));

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned {status} for {method} {url}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
    },

    #[error("token request to {realm} failed: {reason}")]
    Auth { realm: String, reason: String },

    #[error("failed to parse manifest {reference}: {source}")]
    Manifest {
        reference: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("content digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("registry did not return an upload location for {0}")]
    MissingUploadLocation(String),

    #[error("invalid registry URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    Anonymous,
    Basic {
        username: String,
        password: SecretString,
    },
}

impl From<&RegistryCredentials> for RegistryAuth {
    fn from(credentials: &RegistryCredentials) -> Self {
        RegistryAuth::Basic {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        }
    }
}

/// Raw manifest bytes as served by the registry, together with their digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub media_type: String,
    pub digest: String,
    pub content: Vec<u8>,
}

/// Everything needed to recreate an image in another repository: the top-level manifest,
/// child manifests of an index, and the digests of every config and layer blob.
#[derive(Debug, Clone)]
pub struct PulledImage {
    pub source: ImageReference,
    pub auth: RegistryAuth,
    pub manifest: Manifest,
    pub children: Vec<Manifest>,
    pub blobs: BTreeSet<String>,
}

impl PulledImage {
    pub fn digest(&self) -> &str {
        &self.manifest.digest
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    media_type: Option<String>,
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Read and write access to OCI distribution registries
pub trait Registry: Send + Sync {
    /// Digest of the manifest `reference` currently points at
    fn fetch_digest(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
    ) -> impl Future<Output = Result<String, RegistryError>> + Send;

    fn pull(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
    ) -> impl Future<Output = Result<PulledImage, RegistryError>> + Send;

    /// Copies all blobs of `image` into `reference`'s repository, then its manifests.
    /// The tag only becomes visible once the final manifest upload succeeds.
    fn push(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
        image: &PulledImage,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;
}

pub fn create_client(config: &RegistryConfig) -> anyhow::Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder();

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

#[derive(Clone)]
pub struct RegistryClient {
    http: Client,
    insecure_registries: Vec<String>,
}

impl RegistryClient {
    pub fn new(http: Client, insecure_registries: Vec<String>) -> Self {
        Self {
            http,
            insecure_registries,
        }
    }

    fn origin(&self, reference: &ImageReference) -> String {
        let scheme = if self
            .insecure_registries
            .iter()
            .any(|host| host == &reference.registry)
        {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, reference.api_host())
    }

    fn repository_url(&self, reference: &ImageReference) -> String {
        format!("{}/v2/{}", self.origin(reference), reference.repository)
    }

    fn session<'a>(
        &'a self,
        reference: &ImageReference,
        auth: &'a RegistryAuth,
        actions: &str,
    ) -> Session<'a> {
        Session {
            http: &self.http,
            auth,
            scope: format!("repository:{}:{}", reference.repository, actions),
            credential: None,
        }
    }

    async fn fetch_manifest(
        &self,
        session: &mut Session<'_>,
        reference: &ImageReference,
        manifest_reference: &str,
    ) -> Result<Manifest, RegistryError> {
        let url = format!(
            "{}/manifests/{}",
            self.repository_url(reference),
            manifest_reference
        );
        debug!("Fetching manifest from URL {}", url);
        let response = session
            .send(|http| http.get(&url).header(ACCEPT, accept_manifests()))
            .await?;
        let response = ensure_success(Method::GET, &url, response)?;

        let header_digest = header_value(&response, DOCKER_CONTENT_DIGEST);
        let content_type = header_value(&response, CONTENT_TYPE.as_str());
        let content = response.bytes().await?.to_vec();
        let digest = header_digest.unwrap_or_else(|| sha256_digest(&content));

        if manifest_reference.contains(':') && digest != manifest_reference {
            return Err(RegistryError::DigestMismatch {
                expected: manifest_reference.to_string(),
                actual: digest,
            });
        }

        let media_type = match content_type {
            Some(media_type) if is_manifest_media_type(&media_type) => media_type,
            _ => parse_manifest(reference, &content)?
                .media_type
                .unwrap_or_else(|| OCI_MANIFEST.to_string()),
        };

        Ok(Manifest {
            media_type,
            digest,
            content,
        })
    }

    async fn blob_exists(
        &self,
        session: &mut Session<'_>,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<bool, RegistryError> {
        let url = format!("{}/blobs/{}", self.repository_url(reference), digest);
        let response = session.send(|http| http.head(&url)).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(RegistryError::Status {
                method: Method::HEAD,
                url,
                status,
            }),
        }
    }

    async fn copy_blob(
        &self,
        source: &mut Session<'_>,
        image: &PulledImage,
        destination: &mut Session<'_>,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<(), RegistryError> {
        let source_url = format!("{}/blobs/{}", self.repository_url(&image.source), digest);
        let response = source.send(|http| http.get(&source_url)).await?;
        let response = ensure_success(Method::GET, &source_url, response)?;
        let content_length = response.content_length();

        let uploads_url = format!("{}/blobs/uploads/", self.repository_url(reference));
        let upload = destination.send(|http| http.post(&uploads_url)).await?;
        let upload = ensure_success(Method::POST, &uploads_url, upload)?;
        let location = header_value(&upload, LOCATION.as_str())
            .ok_or_else(|| RegistryError::MissingUploadLocation(uploads_url.clone()))?;

        let mut upload_url = Url::parse(&self.origin(reference))
            .and_then(|origin| origin.join(&location))
            .map_err(|e| RegistryError::InvalidUrl {
                url: location.clone(),
                reason: e.to_string(),
            })?;
        upload_url.query_pairs_mut().append_pair("digest", digest);

        debug!(
            "Streaming blob {} ({} bytes) to {}",
            digest,
            content_length.map_or_else(|| "unknown".to_string(), |len| len.to_string()),
            reference
        );
        let expected = digest.starts_with("sha256:").then(|| digest.to_string());
        let mut request = self
            .http
            .put(upload_url.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::wrap_stream(verified_stream(
                response.bytes_stream(),
                expected,
            )));
        if let Some(len) = content_length {
            request = request.header(CONTENT_LENGTH, len);
        }
        let response = destination.send_once(request).await?;
        ensure_success(Method::PUT, upload_url.as_str(), response)?;
        Ok(())
    }

    async fn put_manifest(
        &self,
        session: &mut Session<'_>,
        reference: &ImageReference,
        manifest_reference: &str,
        manifest: &Manifest,
    ) -> Result<(), RegistryError> {
        let url = format!(
            "{}/manifests/{}",
            self.repository_url(reference),
            manifest_reference
        );
        debug!("Uploading manifest {} to {}", manifest.digest, url);
        let response = session
            .send(|http| {
                http.put(&url)
                    .header(CONTENT_TYPE, manifest.media_type.as_str())
                    .body(manifest.content.clone())
            })
            .await?;
        ensure_success(Method::PUT, &url, response)?;
        Ok(())
    }
}

impl Registry for RegistryClient {
    async fn fetch_digest(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<String, RegistryError> {
        let mut session = self.session(reference, auth, "pull");
        let url = format!(
            "{}/manifests/{}",
            self.repository_url(reference),
            reference.manifest_reference()
        );
        let response = session
            .send(|http| http.head(&url).header(ACCEPT, accept_manifests()))
            .await?;
        let response = ensure_success(Method::HEAD, &url, response)?;
        if let Some(digest) = header_value(&response, DOCKER_CONTENT_DIGEST) {
            return Ok(digest);
        }

        // Some registries omit the digest header on HEAD
        let manifest = self
            .fetch_manifest(&mut session, reference, reference.manifest_reference())
            .await?;
        Ok(manifest.digest)
    }

    async fn pull(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<PulledImage, RegistryError> {
        info!("Pulling image manifest {}", reference);
        let mut session = self.session(reference, auth, "pull");
        let manifest = self
            .fetch_manifest(&mut session, reference, reference.manifest_reference())
            .await?;

        let document = parse_manifest(reference, &manifest.content)?;
        let mut children = Vec::with_capacity(document.manifests.len());
        let mut blobs = BTreeSet::new();
        collect_blobs(&document, &mut blobs);

        for child in &document.manifests {
            let child_manifest = self
                .fetch_manifest(&mut session, reference, &child.digest)
                .await?;
            collect_blobs(
                &parse_manifest(reference, &child_manifest.content)?,
                &mut blobs,
            );
            children.push(child_manifest);
        }

        debug!(
            "Pulled {} with digest {}, {} child manifests and {} blobs",
            reference,
            manifest.digest,
            children.len(),
            blobs.len()
        );

        Ok(PulledImage {
            source: reference.clone(),
            auth: auth.clone(),
            manifest,
            children,
            blobs,
        })
    }

    async fn push(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
        image: &PulledImage,
    ) -> Result<(), RegistryError> {
        info!("Pushing {} to {}", image.source, reference);
        let mut source = self.session(&image.source, &image.auth, "pull");
        let mut destination = self.session(reference, auth, "pull,push");

        for digest in &image.blobs {
            if self.blob_exists(&mut destination, reference, digest).await? {
                debug!("Blob {} already present in {}", digest, reference);
                continue;
            }
            self.copy_blob(&mut source, image, &mut destination, reference, digest)
                .await?;
        }

        for child in &image.children {
            self.put_manifest(&mut destination, reference, &child.digest, child)
                .await?;
        }

        let target = reference
            .tag
            .as_deref()
            .unwrap_or_else(|| reference.manifest_reference());
        self.put_manifest(&mut destination, reference, target, &image.manifest)
            .await?;

        info!("Pushed {} with digest {}", reference, image.digest());
        Ok(())
    }
}

enum Credential {
    Bearer(SecretString),
    Basic,
}

/// Per-operation auth state. A 401 challenge is answered once and the resulting
/// credential is reused for the remaining requests of the same operation.
struct Session<'a> {
    http: &'a Client,
    auth: &'a RegistryAuth,
    scope: String,
    credential: Option<Credential>,
}

impl Session<'_> {
    async fn send(
        &mut self,
        build: impl Fn(&Client) -> RequestBuilder,
    ) -> Result<Response, RegistryError> {
        let response = self.execute(&build).await?;
        if response.status() != StatusCode::UNAUTHORIZED || self.credential.is_some() {
            return Ok(response);
        }

        let Some(challenge) = header_value(&response, WWW_AUTHENTICATE.as_str()) else {
            return Ok(response);
        };
        match self.answer_challenge(&challenge).await? {
            Some(credential) => {
                self.credential = Some(credential);
                self.execute(&build).await
            }
            None => Ok(response),
        }
    }

    async fn execute(
        &self,
        build: &impl Fn(&Client) -> RequestBuilder,
    ) -> Result<Response, RegistryError> {
        Ok(self.authorize(build(self.http)).send().await?)
    }

    /// Sends a request whose body can only be produced once. The challenge is not
    /// answered here, so an earlier request of the session must have done that.
    async fn send_once(&self, request: RequestBuilder) -> Result<Response, RegistryError> {
        Ok(self.authorize(request).send().await?)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match (&self.credential, self.auth) {
            (Some(Credential::Bearer(token)), _) => request.bearer_auth(token.expose_secret()),
            (Some(Credential::Basic), RegistryAuth::Basic { username, password }) => {
                request.basic_auth(username, Some(password.expose_secret()))
            }
            _ => request,
        }
    }

    async fn answer_challenge(
        &self,
        challenge: &str,
    ) -> Result<Option<Credential>, RegistryError> {
        let (scheme, params) = challenge.split_once(' ').unwrap_or((challenge, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Ok(match self.auth {
                RegistryAuth::Basic { .. } => Some(Credential::Basic),
                RegistryAuth::Anonymous => None,
            });
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Ok(None);
        }

        let mut realm = None;
        let mut query = vec![("scope", self.scope.clone())];
        for caps in CHALLENGE_PARAM.captures_iter(params) {
            match &caps[1] {
                "realm" => realm = Some(caps[2].to_string()),
                "service" => query.push(("service", caps[2].to_string())),
                _ => {}
            }
        }
        let Some(realm) = realm else {
            return Ok(None);
        };

        debug!("Requesting registry token from {} for {}", realm, self.scope);
        let mut request = self.http.get(&realm).query(&query);
        if let RegistryAuth::Basic { username, password } = self.auth {
            request = request.basic_auth(username, Some(password.expose_secret()));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Auth {
                realm,
                reason: format!("status {}", response.status()),
            });
        }
        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .map(|t| Some(Credential::Bearer(SecretString::new(t))))
            .ok_or_else(|| RegistryError::Auth {
                realm,
                reason: "response contains no token".to_string(),
            })
    }
}

fn accept_manifests() -> String {
    [OCI_MANIFEST, OCI_INDEX, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST].join(", ")
}

fn is_manifest_media_type(media_type: &str) -> bool {
    [OCI_MANIFEST, OCI_INDEX, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST].contains(&media_type)
}

fn parse_manifest(
    reference: &ImageReference,
    content: &[u8],
) -> Result<ManifestDocument, RegistryError> {
    serde_json::from_slice(content).map_err(|source| RegistryError::Manifest {
        reference: reference.to_string(),
        source,
    })
}

fn collect_blobs(document: &ManifestDocument, blobs: &mut BTreeSet<String>) {
    if let Some(config) = &document.config {
        blobs.insert(config.digest.clone());
    }
    blobs.extend(document.layers.iter().map(|layer| layer.digest.clone()));
}

fn ensure_success(method: Method, url: &str, response: Response) -> Result<Response, RegistryError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(RegistryError::Status {
            method,
            url: url.to_string(),
            status: response.status(),
        })
    }
}

fn header_value(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_owned())
}

pub fn sha256_digest(content: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(content)))
}

/// Passes blob chunks through while hashing them. The last chunk is held back until
/// the digest is known, so on a mismatch the stream fails before the upload it feeds
/// can complete.
fn verified_stream<S, B>(
    chunks: S,
    expected: Option<String>,
) -> impl Stream<Item = Result<B, io::Error>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    stream::unfold(
        (Box::pin(chunks), Some(Sha256::new()), expected, None),
        |(mut chunks, hasher, expected, mut pending)| async move {
            let mut hasher = hasher?;
            loop {
                match chunks.next().await {
                    Some(Ok(chunk)) => {
                        hasher.update(&chunk);
                        if let Some(ready) = pending.replace(chunk) {
                            return Some((Ok(ready), (chunks, Some(hasher), expected, pending)));
                        }
                    }
                    Some(Err(e)) => {
                        return Some((Err(io::Error::other(e)), (chunks, None, None, None)));
                    }
                    None => {
                        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
                        return match expected {
                            Some(expected) if expected != actual => {
                                let mismatch = RegistryError::DigestMismatch { expected, actual };
                                Some((Err(io::Error::other(mismatch)), (chunks, None, None, None)))
                            }
                            _ => pending.map(|last| (Ok(last), (chunks, None, None, None))),
                        };
                    }
                }
            }
        },
    )
}
