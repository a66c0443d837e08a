//! Removal of everything matching a set of label filters.

use serde::Serialize;

use crate::engine::ContainerEngine;
use crate::reaper::Filter;
use crate::resource::ResourceKind;

/// What a prune removed, per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub containers: Vec<String>,
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
    pub images: Vec<String>,
    /// Objects that could not be listed or removed.
    pub errors: Vec<String>,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.containers.len() + self.networks.len() + self.volumes.len() + self.images.len()
    }

    fn removed_mut(&mut self, kind: ResourceKind) -> &mut Vec<String> {
        match kind {
            ResourceKind::Container => &mut self.containers,
            ResourceKind::Network => &mut self.networks,
            ResourceKind::Volume => &mut self.volumes,
            ResourceKind::Image => &mut self.images,
        }
    }

    pub fn merge(&mut self, other: PruneReport) {
        self.containers.extend(other.containers);
        self.networks.extend(other.networks);
        self.volumes.extend(other.volumes);
        self.images.extend(other.images);
        self.errors.extend(other.errors);
    }
}

/// Remove every object matching any filter.
///
/// Containers go first so networks and volumes are no longer in use.
/// Networks get a second pass since endpoints can linger briefly after
/// their container is gone.
pub async fn prune(engine: &dyn ContainerEngine, filters: &[Filter]) -> PruneReport {
    let mut report = PruneReport::default();
    let mut retry_networks = Vec::new();

    for kind in [
        ResourceKind::Container,
        ResourceKind::Network,
        ResourceKind::Volume,
        ResourceKind::Image,
    ] {
        for filter in filters {
            let ids = match engine.list_labelled(kind, &filter.key, &filter.value).await {
                Ok(ids) => ids,
                Err(e) => {
                    report.errors.push(format!("list {} {}: {}", kind, filter, e));
                    continue;
                }
            };
            for id in ids {
                match engine.remove(kind, &id).await {
                    Ok(()) => report.removed_mut(kind).push(id),
                    Err(e) if e.is_not_found() => {}
                    Err(e) if kind == ResourceKind::Network => {
                        tracing::debug!("Network {} not removed on first pass: {}", id, e);
                        retry_networks.push(id);
                    }
                    Err(e) => report.errors.push(format!("remove {} {}: {}", kind, id, e)),
                }
            }
        }
    }

    for id in retry_networks {
        match engine.remove_network(&id).await {
            Ok(()) => report.networks.push(id),
            Err(e) if e.is_not_found() => {}
            Err(e) => report.errors.push(format!("remove network {}: {}", id, e)),
        }
    }

    tracing::info!(
        "Pruned {} container(s), {} network(s), {} volume(s), {} image(s)",
        report.containers.len(),
        report.networks.len(),
        report.volumes.len(),
        report.images.len()
    );
    report
}
