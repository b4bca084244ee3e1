//! Mirror resolver: make sure an image exists in the mirror registry and
//! return the reference workloads should use.

use std::sync::Arc;

use imirror_core::{map, CredentialProvider, ImageReference, ImageStore, MirrorRoot, ReferenceError};
use metrics::counter;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error(transparent)]
    InvalidReference(#[from] ReferenceError),
    #[error("mirror read src={src}: {source:#}")]
    RemoteRead {
        src: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("mirror write src={src} dst={dst}: {source:#}")]
    RemoteWrite {
        src: String,
        dst: String,
        #[source]
        source: anyhow::Error,
    },
}

pub struct Mirror {
    root: MirrorRoot,
    images: Arc<dyn ImageStore>,
    credentials: Arc<dyn CredentialProvider>,
}

impl Mirror {
    pub fn new(root: MirrorRoot, images: Arc<dyn ImageStore>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { root, images, credentials }
    }

    pub fn root(&self) -> &MirrorRoot {
        &self.root
    }

    /// Ensure `image` is in the mirror registry. References already under the
    /// mirror root come back unchanged without touching the network; anything
    /// else is pulled and pushed to its mirror location on every call.
    pub async fn ensure(&self, image: &str) -> Result<String, MirrorError> {
        let src = ImageReference::parse(image)?;
        if self.root.contains(&src) {
            return Ok(image.to_string());
        }
        let dst = map(&src, &self.root)?;

        let content = self
            .images
            .pull(&src, &self.credentials.pull_credentials(&src))
            .await
            .map_err(|e| MirrorError::RemoteRead { src: src.to_string(), source: e })?;
        self.images
            .push(&dst, &content, &self.credentials.push_credentials())
            .await
            .map_err(|e| MirrorError::RemoteWrite { src: src.to_string(), dst: dst.to_string(), source: e })?;

        counter!("mirror_push_total", 1u64);
        info!(src = %src, dst = %dst, "mirrored image");
        Ok(dst.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockImageStore, StaticCredentials};
    use imirror_core::Credentials;

    fn mirror(images: Arc<MockImageStore>) -> Mirror {
        let creds = StaticCredentials::basic("bot", "pw");
        Mirror::new(MirrorRoot::parse("mirror.local").unwrap(), images, Arc::new(creds))
    }

    #[tokio::test]
    async fn already_mirrored_is_identity_without_io() {
        let images = Arc::new(MockImageStore::new());
        let m = mirror(images.clone());
        let img = "mirror.local/quay_io_app_web:v1";
        assert_eq!(m.ensure(img).await.unwrap(), img);
        assert_eq!(images.pulls().len(), 0);
        assert_eq!(images.pushes().len(), 0);
    }

    #[tokio::test]
    async fn remap_pulls_anonymously_and_pushes_with_mirror_credentials() {
        let images = Arc::new(MockImageStore::new());
        let m = mirror(images.clone());
        let dst = m.ensure("registry.example.com:5000/app/web:v1").await.unwrap();
        assert_eq!(dst, "mirror.local/registry_example_com_5000_app_web:v1");
        assert_eq!(images.pulls(), vec![("registry.example.com:5000/app/web:v1".to_string(), Credentials::Anonymous)]);
        assert_eq!(
            images.pushes(),
            vec![(dst.clone(), Credentials::Basic { username: "bot".into(), password: "pw".into() })]
        );
        assert!(images.contains(&dst));
    }

    #[tokio::test]
    async fn errors_keep_their_shape() {
        let images = Arc::new(MockImageStore::new());
        let m = mirror(images.clone());
        assert!(matches!(m.ensure("Not A Ref").await, Err(MirrorError::InvalidReference(_))));

        images.fail_pull("index.docker.io/library/redis:7");
        let err = m.ensure("redis:7").await.unwrap_err();
        assert!(matches!(err, MirrorError::RemoteRead { ref src, .. } if src == "index.docker.io/library/redis:7"));
        assert!(images.pushes().is_empty());

        images.fail_push("mirror.local/ghcr_io_org_tool:v3");
        let err = m.ensure("ghcr.io/org/tool:v3").await.unwrap_err();
        match err {
            MirrorError::RemoteWrite { src, dst, .. } => {
                assert_eq!(src, "ghcr.io/org/tool:v3");
                assert_eq!(dst, "mirror.local/ghcr_io_org_tool:v3");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!images.contains("mirror.local/ghcr_io_org_tool:v3"));
    }

    #[tokio::test]
    async fn ensure_pushes_on_every_remap() {
        let images = Arc::new(MockImageStore::new());
        let m = mirror(images.clone());
        m.ensure("nginx:1.25").await.unwrap();
        m.ensure("nginx:1.25").await.unwrap();
        assert_eq!(images.pushes().len(), 2);
    }
}
