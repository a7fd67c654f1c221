//! Reconstitution cache (component A): the in-memory projection of
//! ResourceSlices into per-resource manifests keyed by synthesis UUID, with
//! readiness-group ordered traversal.

pub mod readiness;

use crate::util::Error;
use eno_types::ResourceSlice;
use readiness::Expr;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

pub const READINESS_ANNOTATION: &str = "eno.azure.io/readiness";
pub const READINESS_GROUP_ANNOTATION: &str = "eno.azure.io/readiness-group";
pub const RECONCILE_INTERVAL_ANNOTATION: &str = "eno.azure.io/reconcile-interval";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Clone)]
pub struct CachedResource {
    pub ref_: ResourceRef,
    pub manifest: serde_json::Value,
    pub slice_name: String,
    pub index: usize,
    pub deleted: bool,
    pub readiness_group: u32,
    pub readiness: Option<Expr>,
    pub reconcile_interval: Option<std::time::Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositionKey {
    pub namespace: String,
    pub name: String,
}

#[derive(Default)]
struct SynthesisEntry {
    by_ref: HashMap<ResourceRef, CachedResource>,
    by_group: BTreeMap<u32, Vec<ResourceRef>>,
}

#[derive(Default)]
struct CompositionEntry {
    syntheses: HashMap<String, SynthesisEntry>,
}

#[derive(Default)]
pub struct Cache {
    inner: RwLock<HashMap<CompositionKey, CompositionEntry>>,
}

/// Extracts the `(group, kind, namespace, name)` identity from a decoded
/// manifest. Shared between [`Cache::fill`] and callers that need to match
/// up a manifest with its slice-status entry without re-deriving the logic.
pub fn resource_ref_from_manifest(manifest: &serde_json::Value) -> Option<ResourceRef> {
    let kind = manifest.get("kind")?.as_str()?.to_string();
    let api_version = manifest.get("apiVersion")?.as_str()?;
    let group = api_version.split('/').next().unwrap_or("").to_string();
    let name = manifest
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())?
        .to_string();
    let namespace = manifest
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some(ResourceRef {
        group,
        kind,
        namespace,
        name,
    })
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CompositionKey, uuid: &str, r: &ResourceRef) -> Option<CachedResource> {
        let inner = self.inner.read().unwrap();
        inner
            .get(key)?
            .syntheses
            .get(uuid)?
            .by_ref
            .get(r)
            .cloned()
    }

    pub fn has_synthesis(&self, key: &CompositionKey, uuid: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .get(key)
            .map(|e| e.syntheses.contains_key(uuid))
            .unwrap_or(false)
    }

    /// Returns the resources in the nearest adjacent non-empty readiness
    /// group in the given direction relative to `group`. Empty on
    /// out-of-range or unknown synthesis.
    pub fn range_by_readiness_group(
        &self,
        key: &CompositionKey,
        uuid: &str,
        group: u32,
        direction: Direction,
    ) -> Vec<CachedResource> {
        let inner = self.inner.read().unwrap();
        let Some(synthesis) = inner.get(key).and_then(|e| e.syntheses.get(uuid)) else {
            return Vec::new();
        };
        let next_group = match direction {
            Direction::Before => synthesis.by_group.range(..group).next_back(),
            Direction::After => synthesis.by_group.range((group + 1)..).next(),
        };
        let Some((_, refs)) = next_group else {
            return Vec::new();
        };
        refs.iter()
            .filter_map(|r| synthesis.by_ref.get(r))
            .cloned()
            .collect()
    }

    /// Every readiness group present for `(composition, synthesis)`, ascending.
    pub fn groups(&self, key: &CompositionKey, uuid: &str) -> Vec<u32> {
        let inner = self.inner.read().unwrap();
        inner
            .get(key)
            .and_then(|e| e.syntheses.get(uuid))
            .map(|s| s.by_group.keys().copied().collect())
            .unwrap_or_default()
    }

    /// All resources in exactly `group` (not the "nearest adjacent"
    /// traversal [`Self::range_by_readiness_group`] performs).
    pub fn resources_in_group(&self, key: &CompositionKey, uuid: &str, group: u32) -> Vec<CachedResource> {
        let inner = self.inner.read().unwrap();
        let Some(synthesis) = inner.get(key).and_then(|e| e.syntheses.get(uuid)) else {
            return Vec::new();
        };
        synthesis
            .by_group
            .get(&group)
            .into_iter()
            .flatten()
            .filter_map(|r| synthesis.by_ref.get(r))
            .cloned()
            .collect()
    }

    /// Idempotently ingests a set of slices for `(composition, synthesis)`.
    /// `composition_deleting` mirrors the composition's `deletionTimestamp`:
    /// while set, ingestion of any non-deleted manifest is rejected, since
    /// accepting it would re-materialize a resource an informer race is
    /// about to tell the sync loop to delete.
    pub fn fill(
        &self,
        key: CompositionKey,
        uuid: String,
        slices: &[ResourceSlice],
        composition_deleting: bool,
    ) -> Result<(), Error> {
        let mut entry = SynthesisEntry::default();

        for slice in slices {
            let slice_name = slice.metadata.name.clone().unwrap_or_default();
            for (index, item) in slice.spec.resources.iter().enumerate() {
                if composition_deleting && !item.deleted {
                    return Err(Error::Terminal(format!(
                        "refusing to ingest non-deleted resource at {}[{}] while composition is deleting",
                        slice_name, index
                    )));
                }

                let manifest: serde_json::Value = serde_json::from_str(&item.manifest)?;
                let kind = manifest
                    .get("kind")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::Terminal(format!("{slice_name}[{index}] missing kind")))?
                    .to_string();
                let api_version = manifest
                    .get("apiVersion")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        Error::Terminal(format!("{slice_name}[{index}] missing apiVersion"))
                    })?;
                let group = api_version.split('/').next().unwrap_or("").to_string();
                let name = manifest
                    .get("metadata")
                    .and_then(|m| m.get("name"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        Error::Terminal(format!("{slice_name}[{index}] missing metadata.name"))
                    })?
                    .to_string();
                let namespace = manifest
                    .get("metadata")
                    .and_then(|m| m.get("namespace"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);

                let annotations = manifest
                    .get("metadata")
                    .and_then(|m| m.get("annotations"))
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);

                let readiness_group = annotations
                    .get(READINESS_GROUP_ANNOTATION)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<u32>().ok())
                    .unwrap_or(0);

                let readiness = annotations
                    .get(READINESS_ANNOTATION)
                    .and_then(|v| v.as_str())
                    .map(readiness::parse)
                    .transpose()
                    .map_err(|e| Error::Terminal(e.to_string()))?;

                let reconcile_interval = item
                    .reconcile_interval
                    .as_deref()
                    .map(parse_duration::parse)
                    .transpose()?;

                let r = ResourceRef {
                    group,
                    kind,
                    namespace,
                    name,
                };
                entry.by_group.entry(readiness_group).or_default().push(r.clone());
                entry.by_ref.insert(
                    r.clone(),
                    CachedResource {
                        ref_: r,
                        manifest,
                        slice_name: slice_name.clone(),
                        index,
                        deleted: item.deleted,
                        readiness_group,
                        readiness,
                        reconcile_interval,
                    },
                );
            }
        }

        let mut inner = self.inner.write().unwrap();
        inner.entry(key).or_default().syntheses.insert(uuid, entry);
        Ok(())
    }

    /// Drops cached syntheses for `key` not in `{current, previous}`. Passing
    /// `None` for both drops every synthesis cached for the key.
    pub fn purge(&self, key: &CompositionKey, current: Option<&str>, previous: Option<&str>) {
        let mut inner = self.inner.write().unwrap();
        let Some(entry) = inner.get_mut(key) else {
            return;
        };
        entry
            .syntheses
            .retain(|uuid, _| Some(uuid.as_str()) == current || Some(uuid.as_str()) == previous);
        if entry.syntheses.is_empty() {
            inner.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_types::{ResourceSliceItem, ResourceSliceSpec};
    use kube::api::ObjectMeta;

    fn slice(name: &str, items: Vec<(&str, bool, u32)>) -> ResourceSlice {
        let resources = items
            .into_iter()
            .map(|(n, deleted, group)| {
                let manifest = serde_json::json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {
                        "name": n,
                        "annotations": {READINESS_GROUP_ANNOTATION: group.to_string()}
                    }
                });
                ResourceSliceItem {
                    manifest: manifest.to_string(),
                    deleted,
                    reconcile_interval: None,
                }
            })
            .collect();
        ResourceSlice {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: ResourceSliceSpec {
                resources,
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn fill_then_get_roundtrips() {
        let cache = Cache::new();
        let key = CompositionKey {
            namespace: "default".into(),
            name: "c1".into(),
        };
        let slices = vec![slice("s1", vec![("cm1", false, 0)])];
        cache
            .fill(key.clone(), "u1".into(), &slices, false)
            .unwrap();
        let r = ResourceRef {
            group: "".into(),
            kind: "ConfigMap".into(),
            namespace: None,
            name: "cm1".into(),
        };
        assert!(cache.get(&key, "u1", &r).is_some());
        assert!(cache.has_synthesis(&key, "u1"));
    }

    #[test]
    fn range_by_readiness_group_walks_adjacent_groups() {
        let cache = Cache::new();
        let key = CompositionKey {
            namespace: "default".into(),
            name: "c1".into(),
        };
        let slices = vec![slice(
            "s1",
            vec![("a", false, 0), ("b", false, 2), ("c", false, 5)],
        )];
        cache
            .fill(key.clone(), "u1".into(), &slices, false)
            .unwrap();

        let before = cache.range_by_readiness_group(&key, "u1", 5, Direction::Before);
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].ref_.name, "b");

        let after = cache.range_by_readiness_group(&key, "u1", 0, Direction::After);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].ref_.name, "b");

        let none = cache.range_by_readiness_group(&key, "u1", 5, Direction::After);
        assert!(none.is_empty());
    }

    #[test]
    fn purge_drops_stale_syntheses() {
        let cache = Cache::new();
        let key = CompositionKey {
            namespace: "default".into(),
            name: "c1".into(),
        };
        cache
            .fill(key.clone(), "old".into(), &[slice("s1", vec![("a", false, 0)])], false)
            .unwrap();
        cache
            .fill(key.clone(), "new".into(), &[slice("s2", vec![("b", false, 0)])], false)
            .unwrap();
        cache.purge(&key, Some("new"), None);
        assert!(!cache.has_synthesis(&key, "old"));
        assert!(cache.has_synthesis(&key, "new"));
    }

    #[test]
    fn fill_rejects_non_deleted_manifest_while_composition_deleting() {
        let cache = Cache::new();
        let key = CompositionKey {
            namespace: "default".into(),
            name: "c1".into(),
        };
        let err = cache
            .fill(key, "u1".into(), &[slice("s1", vec![("a", false, 0)])], true)
            .unwrap_err();
        assert!(matches!(err, Error::Terminal(_)));
    }
}
