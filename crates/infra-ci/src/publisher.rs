//! Registry publishing of built images.

use crate::engine::ContainerEngine;
use infra_core::{Credential, ResolvedTagSet, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Pushes a built image under every resolved tag.
///
/// A failure stops the publish for this image. Tags already pushed stay in
/// the registry and the local image is kept.
#[derive(Clone)]
pub struct Publisher {
    engine: Arc<dyn ContainerEngine>,
    credential: Option<Credential>,
}

impl Publisher {
    pub fn new(engine: Arc<dyn ContainerEngine>, credential: Option<Credential>) -> Self {
        Self { engine, credential }
    }

    /// Log in, tag `local_image` with each reference and push it.
    ///
    /// Returns the pushed references in tag order.
    pub async fn publish(&self, local_image: &str, tags: &ResolvedTagSet) -> Result<Vec<String>> {
        let mut pushed = Vec::with_capacity(tags.len());
        self.publish_into(local_image, tags, &mut pushed).await?;
        Ok(pushed)
    }

    /// Like [`Publisher::publish`], appending each reference to `pushed` as
    /// soon as its push succeeds. On error `pushed` holds what reached the
    /// registry.
    pub async fn publish_into(
        &self,
        local_image: &str,
        tags: &ResolvedTagSet,
        pushed: &mut Vec<String>,
    ) -> Result<()> {
        match &self.credential {
            Some(credential) => self.engine.login(&tags.registry, credential).await?,
            None => warn!(registry = %tags.registry, "No registry credential, pushing without login"),
        }

        let already = pushed.len();
        for reference in tags.references() {
            let step = async {
                self.engine.tag(local_image, &reference).await?;
                self.engine.push(&reference).await
            };
            if let Err(e) = step.await {
                if pushed.len() > already {
                    warn!(pushed = ?&pushed[already..], "Publish aborted after partial push");
                }
                return Err(e);
            }
            info!(reference = %reference, "Pushed");
            pushed.push(reference);
        }
        Ok(())
    }
}
