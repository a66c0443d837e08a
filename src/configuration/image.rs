//! Image configuration and pull policies.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::configuration::combine;
use crate::configuration::{Labelled, Named, ResourceConfiguration, check_labels};
use crate::engine::LocalImage;
use crate::resource::ResourceKind;

/// Decides whether an image must be pulled, given the locally cached copy.
#[derive(Clone)]
pub struct PullPolicy {
    name: &'static str,
    predicate: Arc<dyn Fn(Option<&LocalImage>) -> bool + Send + Sync>,
}

impl PullPolicy {
    /// Pull only when no local copy exists.
    pub fn missing() -> Self {
        Self {
            name: "missing",
            predicate: Arc::new(|cached| cached.is_none()),
        }
    }

    /// Always pull, even if a local copy exists.
    pub fn always() -> Self {
        Self {
            name: "always",
            predicate: Arc::new(|_| true),
        }
    }

    /// Never pull; creation fails later if the image is absent.
    pub fn never() -> Self {
        Self {
            name: "never",
            predicate: Arc::new(|_| false),
        }
    }

    /// Caller-supplied predicate.
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(Option<&LocalImage>) -> bool + Send + Sync + 'static,
    {
        Self {
            name: "custom",
            predicate: Arc::new(predicate),
        }
    }

    /// Whether to pull given the cached image, if any.
    pub fn should_pull(&self, cached: Option<&LocalImage>) -> bool {
        (self.predicate)(cached)
    }
}

impl Default for PullPolicy {
    fn default() -> Self {
        Self::missing()
    }
}

impl fmt::Debug for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PullPolicy({})", self.name)
    }
}

/// Desired state of an image resource.
#[derive(Debug, Clone, Default)]
pub struct ImageConfiguration {
    /// Image reference, e.g. `postgres:16-alpine`.
    pub reference: Option<String>,
    pub pull_policy: Option<PullPolicy>,
    /// Labels used to filter locally cached images.
    pub labels: BTreeMap<String, String>,
    /// Remove the image again when the handle is disposed.
    pub remove_on_dispose: bool,
}

impl ResourceConfiguration for ImageConfiguration {
    const KIND: ResourceKind = ResourceKind::Image;

    fn merge(&self, newer: &Self) -> Self {
        Self {
            reference: combine::scalar(&self.reference, &newer.reference),
            pull_policy: combine::scalar(&self.pull_policy, &newer.pull_policy),
            labels: combine::mapping(&self.labels, &newer.labels),
            remove_on_dispose: combine::flag(self.remove_on_dispose, newer.remove_on_dispose),
        }
    }

    fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        match self.reference.as_deref() {
            None => violations.push("image reference is required".to_string()),
            Some(r) if r.trim().is_empty() || r.contains(char::is_whitespace) => {
                violations.push(format!("invalid image reference '{}'", r))
            }
            Some(_) => {}
        }
        check_labels(&self.labels, &mut violations);
        violations
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

impl Named for ImageConfiguration {
    fn named(name: String) -> Self {
        Self {
            reference: Some(name),
            ..Default::default()
        }
    }

    fn name(&self) -> Option<&str> {
        self.reference.as_deref()
    }
}

impl Labelled for ImageConfiguration {
    fn labelled(labels: BTreeMap<String, String>) -> Self {
        Self {
            labels,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached() -> LocalImage {
        LocalImage {
            id: "sha256:abc".to_string(),
            repo_tags: vec!["alpine:3".to_string()],
        }
    }

    #[test]
    fn test_pull_policies() {
        let image = cached();
        assert!(PullPolicy::missing().should_pull(None));
        assert!(!PullPolicy::missing().should_pull(Some(&image)));
        assert!(PullPolicy::always().should_pull(Some(&image)));
        assert!(!PullPolicy::never().should_pull(None));

        let by_tag = PullPolicy::custom(|c| c.is_none_or(|i| !i.repo_tags.contains(&"alpine:3".to_string())));
        assert!(!by_tag.should_pull(Some(&image)));
    }

    #[test]
    fn test_reference_required() {
        let violations = ImageConfiguration::default().violations();
        assert_eq!(violations, vec!["image reference is required".to_string()]);
        assert!(ImageConfiguration::named("alpine:3".to_string()).violations().is_empty());
    }
}
