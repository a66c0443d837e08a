//! Image builder operations.

use crate::builder::Builder;
use crate::configuration::{ImageConfiguration, PullPolicy};
use crate::error::Result;
use crate::orchestrator::{ImageHandle, Orchestrator};

impl Builder<ImageConfiguration> {
    pub fn with_pull_policy(&self, policy: PullPolicy) -> Self {
        self.merge(ImageConfiguration {
            pull_policy: Some(policy),
            ..Default::default()
        })
    }

    /// Remove the image again when the handle is disposed.
    pub fn with_remove_on_dispose(&self, remove: bool) -> Self {
        self.merge(ImageConfiguration {
            remove_on_dispose: remove,
            ..Default::default()
        })
    }

    /// Make the image available locally according to the pull policy.
    pub async fn resolve(&self, orchestrator: &Orchestrator) -> Result<ImageHandle> {
        orchestrator.resolve_image(&self.build()?).await
    }
}
