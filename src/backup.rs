use crate::credentials::CredentialsProvider;
use crate::error::{Error, Result};
use crate::image_reference::ImageReference;
use crate::oci_registry::{Registry, RegistryAuth};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Makes sure a destination image holds the same content as a source image
pub trait ImageBackup: Send + Sync {
    fn ensure_copied(
        &self,
        source: &str,
        destination: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub struct BackupEngine<R> {
    registry: R,
    credentials: Arc<dyn CredentialsProvider>,
    cancel: CancellationToken,
}

impl<R: Registry> BackupEngine<R> {
    pub fn new(
        registry: R,
        credentials: Arc<dyn CredentialsProvider>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            credentials,
            cancel,
        }
    }

    async fn cancellable<T>(&self, operation: impl Future<Output = T>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            output = operation => Ok(output),
        }
    }
}

fn parse_reference(image: &str) -> Result<ImageReference> {
    ImageReference::parse(image).map_err(|source| Error::InvalidReference {
        reference: image.to_string(),
        source,
    })
}

impl<R: Registry> ImageBackup for BackupEngine<R> {
    async fn ensure_copied(&self, source: &str, destination: &str) -> Result<()> {
        let source_ref = parse_reference(source)?;
        let destination_ref = parse_reference(destination)?;

        let credentials = self.credentials.load()?;
        let auth = RegistryAuth::from(&credentials);

        let image = self
            .cancellable(self.registry.pull(&source_ref, &auth))
            .await?
            .map_err(|source| Error::SourceFetchFailed {
                reference: source_ref.to_string(),
                source,
            })?;

        // The destination is probed anonymously; any failure here most likely means it does not exist yet
        match self
            .cancellable(
                self.registry
                    .fetch_digest(&destination_ref, &RegistryAuth::Anonymous),
            )
            .await?
        {
            Ok(digest) if digest == image.digest() => {
                info!(
                    "Skipping backup of {}, {} already has digest {}",
                    source_ref, destination_ref, digest
                );
                return Ok(());
            }
            Ok(digest) => info!(
                "Destination {} has digest {}, source {} has digest {}",
                destination_ref,
                digest,
                source_ref,
                image.digest()
            ),
            Err(e) if e.is_not_found() => {
                debug!("Destination {} does not exist yet", destination_ref)
            }
            Err(e) => warn!(
                "Could not read destination {}, pushing anyway: {}",
                destination_ref, e
            ),
        }

        self.cancellable(self.registry.push(&destination_ref, &auth, &image))
            .await?
            .map_err(|source| Error::PushFailed {
                reference: destination_ref.to_string(),
                source,
            })?;

        info!(
            "Backed up {} to {} with digest {}",
            source_ref,
            destination_ref,
            image.digest()
        );
        Ok(())
    }
}
