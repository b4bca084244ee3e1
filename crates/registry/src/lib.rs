//! imirror registry: image pull/push over the OCI distribution protocol and
//! mirror credentials from the environment.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use imirror_core::{Blob, CredentialProvider, Credentials, Identifier, ImageContent, ImageReference, ImageStore};
use metrics::{counter, histogram};
use oci_distribution::{
    client::{ClientConfig, ClientProtocol, Config, ImageData, ImageLayer},
    manifest::{self, OciImageManifest},
    secrets::RegistryAuth,
    Client, Reference,
};
use tracing::debug;

pub const USERNAME_ENV: &str = "REGISTRY_USERNAME";
pub const PASSWORD_ENV: &str = "REGISTRY_PASSWORD";

const ACCEPTED_LAYER_TYPES: [&str; 4] = [
    manifest::IMAGE_LAYER_MEDIA_TYPE,
    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
];

/// Image store backed by `oci-distribution`. HTTPS everywhere except the
/// listed insecure registries.
#[derive(Clone)]
pub struct OciImageStore {
    inner: Client,
}

impl OciImageStore {
    pub fn new(insecure_registries: Vec<String>) -> Self {
        Self { inner: Client::new(client_config(insecure_registries)) }
    }
}

impl Default for OciImageStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn client_config(insecure_registries: Vec<String>) -> ClientConfig {
    let protocol = if insecure_registries.is_empty() {
        ClientProtocol::Https
    } else {
        ClientProtocol::HttpsExcept(insecure_registries)
    };
    ClientConfig { protocol, ..Default::default() }
}

#[async_trait::async_trait]
impl ImageStore for OciImageStore {
    async fn pull(&self, reference: &ImageReference, auth: &Credentials) -> Result<ImageContent> {
        let t0 = std::time::Instant::now();
        let image = self
            .inner
            .pull(&oci_reference(reference), &registry_auth(auth), ACCEPTED_LAYER_TYPES.to_vec())
            .await
            .with_context(|| format!("pulling {}", reference))?;
        histogram!("registry_pull_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(image = %reference, layers = image.layers.len(), "pulled");
        Ok(convert_image(image))
    }

    async fn push(&self, reference: &ImageReference, content: &ImageContent, auth: &Credentials) -> Result<()> {
        let t0 = std::time::Instant::now();
        let layers: Vec<ImageLayer> =
            content.layers.iter().map(|b| ImageLayer::new(b.data.clone(), b.media_type.clone(), None)).collect();
        let config = Config::new(content.config.data.clone(), content.config.media_type.clone(), None);
        let manifest = content
            .manifest
            .clone()
            .map(serde_json::from_value::<OciImageManifest>)
            .transpose()
            .context("decoding pulled manifest")?;
        let resp = self
            .inner
            .push(&oci_reference(reference), &layers, config, &registry_auth(auth), manifest)
            .await
            .with_context(|| format!("pushing {}", reference))?;
        histogram!("registry_push_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("registry_push_total", 1u64);
        debug!(image = %reference, manifest_url = %resp.manifest_url, "pushed");
        Ok(())
    }
}

fn oci_reference(r: &ImageReference) -> Reference {
    match &r.identifier {
        Identifier::Tag(tag) => Reference::with_tag(r.registry.clone(), r.repository.clone(), tag.clone()),
        Identifier::Digest(digest) => Reference::with_digest(r.registry.clone(), r.repository.clone(), digest.clone()),
    }
}

fn registry_auth(c: &Credentials) -> RegistryAuth {
    match c {
        Credentials::Anonymous => RegistryAuth::Anonymous,
        Credentials::Basic { username, password } => RegistryAuth::Basic(username.clone(), password.clone()),
    }
}

fn convert_image(image: ImageData) -> ImageContent {
    ImageContent {
        manifest: image.manifest.as_ref().and_then(|m| serde_json::to_value(m).ok()),
        config: Blob { media_type: image.config.media_type, data: image.config.data },
        layers: image.layers.into_iter().map(|l| Blob { media_type: l.media_type, data: l.data }).collect(),
        digest: image.digest,
    }
}

/// Push credentials taken from `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`;
/// source images are pulled anonymously.
#[derive(Clone, Default)]
pub struct EnvCredentials {
    push: Credentials,
}

impl EnvCredentials {
    pub fn from_env() -> Self {
        Self::from_values(std::env::var(USERNAME_ENV).ok(), std::env::var(PASSWORD_ENV).ok())
    }

    pub fn from_values(username: Option<String>, password: Option<String>) -> Self {
        let push = match username.filter(|u| !u.is_empty()) {
            Some(username) => Credentials::Basic { username, password: password.unwrap_or_default() },
            None => Credentials::Anonymous,
        };
        Self { push }
    }
}

impl CredentialProvider for EnvCredentials {
    fn push_credentials(&self) -> Credentials {
        self.push.clone()
    }
}
