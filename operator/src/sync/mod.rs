//! Sync controller (component D): three-way JSON merge of each cached
//! manifest onto the target cluster, respecting readiness-group ordering.

pub mod writebuffer;

use crate::cache::{Cache, CachedResource, CompositionKey, Direction, readiness};
use crate::config::OperatorConfig;
use crate::util::{Error, PROBE_INTERVAL, colors::FG2, merge::three_way_merge_patch};
use eno_types::{Composition, ResourceSlice, ResourceState};
use futures::stream::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    Api, Client, ResourceExt,
    api::{DynamicObject, Patch, PatchParams, ListParams},
    core::GroupVersionKind,
    discovery::{self, Scope},
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use writebuffer::{SliceKey, WriteBuffer};

struct Context {
    client: Client,
    cache: Arc<Cache>,
    write_buffer: Arc<WriteBuffer>,
    #[cfg(feature = "metrics")]
    metrics: crate::util::metrics::ControllerMetrics,
}

pub async fn run(
    client: Client,
    cache: Arc<Cache>,
    write_buffer: Arc<WriteBuffer>,
    _config: Arc<OperatorConfig>,
) -> Result<(), Error> {
    println!("{}", "starting sync controller".green());

    let context = Arc::new(Context {
        client: client.clone(),
        cache,
        write_buffer: write_buffer.clone(),
        #[cfg(feature = "metrics")]
        metrics: crate::util::metrics::ControllerMetrics::new("sync"),
    });

    let slices: Api<ResourceSlice> = Api::all(client);
    let controller = Controller::new(slices, Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_| async {});

    tokio::select! {
        _ = controller => {}
        res = flush_loop(write_buffer) => return res,
    }
    Ok(())
}

/// Drains the status write-buffer at a fixed cadence, independent of any
/// single reconcile, so a slice with no further reconciles still gets its
/// buffered writes flushed instead of waiting on the next event.
async fn flush_loop(write_buffer: Arc<WriteBuffer>) -> Result<(), Error> {
    let mut interval = tokio::time::interval(Duration::from_millis(200));
    loop {
        interval.tick().await;
        if let Err(e) = write_buffer.flush().await {
            eprintln!("{}", format!("write-buffer flush error: {e}").color(FG2));
        }
    }
}

const LABEL_COMPOSITION_NAME: &str = "eno.azure.io/composition-name";

async fn reconcile(slice: Arc<ResourceSlice>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = slice
        .namespace()
        .ok_or_else(|| Error::UserInput("ResourceSlice must be namespaced".to_string()))?;
    let Some(composition_name) = slice.labels().get(LABEL_COMPOSITION_NAME).cloned() else {
        return Ok(Action::await_change());
    };
    let uuid = slice.spec.synthesis_uuid.clone();
    let comp_key = CompositionKey {
        namespace: namespace.clone(),
        name: composition_name.clone(),
    };

    #[cfg(feature = "metrics")]
    ctx.metrics.record_reconcile(&composition_name, &namespace);

    let compositions: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);
    let composition = match compositions.get_opt(&composition_name).await? {
        Some(c) => c,
        None => return Ok(Action::await_change()),
    };
    let deleting = composition.metadata.deletion_timestamp.is_some();

    let slices_api: Api<ResourceSlice> = Api::namespaced(ctx.client.clone(), &namespace);
    let lp = ListParams::default().labels(&format!(
        "{LABEL_COMPOSITION_NAME}={composition_name},eno.azure.io/synthesis-uuid={uuid}"
    ));
    let sibling_slices = slices_api.list(&lp).await?;
    let ready_index = ready_index_from_slices(&sibling_slices.items);
    ctx.cache
        .fill(comp_key.clone(), uuid.clone(), &sibling_slices.items, deleting)?;

    // Previous synthesis' manifests, for the three-way merge base.
    let previous_uuid = composition
        .status
        .as_ref()
        .and_then(|s| s.previous_synthesis.as_ref())
        .map(|s| s.uuid.clone());
    if let Some(previous_uuid) = &previous_uuid
        && !ctx.cache.has_synthesis(&comp_key, previous_uuid)
    {
        let lp = ListParams::default().labels(&format!(
            "{LABEL_COMPOSITION_NAME}={composition_name},eno.azure.io/synthesis-uuid={previous_uuid}"
        ));
        let previous_slices = slices_api.list(&lp).await?;
        ctx.cache
            .fill(comp_key.clone(), previous_uuid.clone(), &previous_slices.items, deleting)?;
    }

    ctx.cache.purge(&comp_key, Some(&uuid), previous_uuid.as_deref());

    for group in ctx.cache.groups(&comp_key, &uuid) {
        if group > 0 && !group_ready(&ctx, &comp_key, &uuid, group, &ready_index) {
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
        for resource in ctx.cache.resources_in_group(&comp_key, &uuid, group) {
            reconcile_one(&ctx, &comp_key, previous_uuid.as_deref(), &resource).await?;
        }
    }

    Ok(Action::requeue(PROBE_INTERVAL))
}

/// Maps `(slice name, resource index)` to whether the slice's persisted
/// status already recorded that resource as ready. Built fresh from the
/// sibling slices fetched for this reconcile, since the cache itself only
/// holds spec-side manifest data, not status.
fn ready_index_from_slices(
    slices: &[ResourceSlice],
) -> std::collections::HashMap<(String, usize), bool> {
    let mut index = std::collections::HashMap::new();
    for slice in slices {
        let Some(name) = slice.metadata.name.clone() else { continue };
        let Some(status) = &slice.status else { continue };
        for (i, state) in status.resources.iter().enumerate() {
            index.insert((name.clone(), i), state.ready.is_some());
        }
    }
    index
}

/// All resources in every group strictly below `group` must be observed
/// ready before `group` may be applied.
fn group_ready(
    ctx: &Context,
    comp_key: &CompositionKey,
    uuid: &str,
    group: u32,
    ready_index: &std::collections::HashMap<(String, usize), bool>,
) -> bool {
    let mut cursor = group;
    loop {
        let preceding = ctx
            .cache
            .range_by_readiness_group(comp_key, uuid, cursor, Direction::Before);
        if preceding.is_empty() {
            return true;
        }
        if preceding.iter().any(|r| !resource_marked_ready(r, ready_index)) {
            return false;
        }
        cursor = preceding[0].readiness_group;
    }
}

fn resource_marked_ready(
    r: &CachedResource,
    ready_index: &std::collections::HashMap<(String, usize), bool>,
) -> bool {
    if r.deleted {
        return true;
    }
    ready_index
        .get(&(r.slice_name.clone(), r.index))
        .copied()
        .unwrap_or(false)
}

async fn reconcile_one(
    ctx: &Context,
    comp_key: &CompositionKey,
    previous_uuid: Option<&str>,
    resource: &CachedResource,
) -> Result<(), Error> {
    let previous_manifest = previous_uuid
        .and_then(|u| ctx.cache.get(comp_key, u, &resource.ref_))
        .map(|r| r.manifest)
        .unwrap_or(serde_json::json!({}));

    let gvk = GroupVersionKind::gvk(&resource.ref_.group, infer_version(&resource.manifest), &resource.ref_.kind);
    let (api_resource, _caps) = discovery::oneshot::pinned_kind(&ctx.client, &gvk)
        .await
        .map_err(|e| Error::Terminal(format!("discovery failed for {gvk:?}: {e}")))?;
    let namespace = resource.ref_.namespace.as_deref();
    let api: Api<DynamicObject> = match (namespace, api_resource.scope()) {
        (Some(ns), _) => Api::namespaced_with(ctx.client.clone(), ns, &api_resource),
        (None, Scope::Namespaced) => Api::default_namespaced_with(ctx.client.clone(), &api_resource),
        (None, Scope::Cluster) => Api::all_with(ctx.client.clone(), &api_resource),
    };

    let live = api.get_opt(&resource.ref_.name).await?;

    let applied = match (&live, resource.deleted) {
        (None, true) => None,
        (Some(_), true) => {
            api.delete(&resource.ref_.name, &Default::default()).await.ok();
            None
        }
        (None, false) => {
            let created = api.create(&Default::default(), &to_dynamic(resource)?).await?;
            Some(created)
        }
        (Some(live), false) => {
            let live_value = serde_json::to_value(live)?;
            let patch = three_way_merge_patch(&previous_manifest, &resource.manifest, &live_value);
            if patch.as_object().is_some_and(|m| m.is_empty()) {
                Some(live.clone())
            } else {
                let patched = api
                    .patch(
                        &resource.ref_.name,
                        &PatchParams::apply(crate::util::MANAGER_NAME),
                        &Patch::Merge(patch),
                    )
                    .await?;
                Some(patched)
            }
        }
    };

    if let Some(applied) = applied {
        let live_value = serde_json::to_value(&applied)?;
        let state = evaluate_readiness(resource, &live_value)?;
        ctx.write_buffer.buffer(
            SliceKey {
                namespace: comp_key.namespace.clone(),
                name: resource.slice_name.clone(),
            },
            resource.index,
            state,
        );
    } else {
        ctx.write_buffer.buffer(
            SliceKey {
                namespace: comp_key.namespace.clone(),
                name: resource.slice_name.clone(),
            },
            resource.index,
            ResourceState {
                reconciled: true,
                deleted: true,
                ..Default::default()
            },
        );
    }

    Ok(())
}

fn infer_version(manifest: &serde_json::Value) -> &str {
    manifest
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .and_then(|s| s.split('/').next_back())
        .unwrap_or("v1")
}

fn to_dynamic(resource: &CachedResource) -> Result<DynamicObject, Error> {
    Ok(serde_json::from_value(resource.manifest.clone())?)
}

fn evaluate_readiness(resource: &CachedResource, live: &serde_json::Value) -> Result<ResourceState, Error> {
    let Some(expr) = &resource.readiness else {
        return Ok(ResourceState {
            reconciled: true,
            ready: Some(Time(chrono::Utc::now())),
            ..Default::default()
        });
    };
    match readiness::evaluate(expr, live) {
        Ok(readiness::Readiness::Boolean(true)) => Ok(ResourceState {
            reconciled: true,
            ready: Some(Time(chrono::Utc::now())),
            ..Default::default()
        }),
        Ok(readiness::Readiness::Boolean(false)) => Ok(ResourceState {
            reconciled: true,
            ready: None,
            ..Default::default()
        }),
        Ok(readiness::Readiness::Timestamp(t)) => Ok(ResourceState {
            reconciled: true,
            ready: Some(t),
            ..Default::default()
        }),
        Err(e) => Ok(ResourceState {
            reconciled: true,
            ready: None,
            reconciliation_error: Some(e.to_string()),
            ..Default::default()
        }),
    }
}

fn on_error(slice: Arc<ResourceSlice>, error: &Error, _ctx: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!("sync error on {}: {error}", slice.name_any()).color(FG2)
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResourceRef;
    use eno_types::{ResourceSliceItem, ResourceSliceSpec, ResourceSliceStatus};
    use kube::api::ObjectMeta;

    fn cached(slice_name: &str, index: usize, deleted: bool) -> CachedResource {
        CachedResource {
            ref_: ResourceRef {
                group: String::new(),
                kind: "ConfigMap".into(),
                namespace: None,
                name: "cm".into(),
            },
            manifest: serde_json::json!({}),
            slice_name: slice_name.to_string(),
            index,
            deleted,
            readiness_group: 0,
            readiness: None,
            reconcile_interval: None,
        }
    }

    #[test]
    fn ready_index_reads_status_ready_timestamps() {
        let slice = ResourceSlice {
            metadata: ObjectMeta {
                name: Some("s1".into()),
                ..Default::default()
            },
            spec: ResourceSliceSpec {
                resources: vec![ResourceSliceItem::default(), ResourceSliceItem::default()],
                ..Default::default()
            },
            status: Some(ResourceSliceStatus {
                resources: vec![
                    ResourceState {
                        ready: Some(Time(chrono::Utc::now())),
                        ..Default::default()
                    },
                    ResourceState::default(),
                ],
            }),
        };
        let index = ready_index_from_slices(&[slice]);
        assert_eq!(index.get(&("s1".to_string(), 0)), Some(&true));
        assert_eq!(index.get(&("s1".to_string(), 1)), Some(&false));
    }

    #[test]
    fn resource_marked_ready_defaults_to_false_when_absent() {
        let index = std::collections::HashMap::new();
        assert!(!resource_marked_ready(&cached("s1", 0, false), &index));
    }

    #[test]
    fn resource_marked_ready_true_for_deleted_resources() {
        let index = std::collections::HashMap::new();
        assert!(resource_marked_ready(&cached("s1", 0, true), &index));
    }

    #[test]
    fn resource_marked_ready_consults_index() {
        let mut index = std::collections::HashMap::new();
        index.insert(("s1".to_string(), 0), true);
        assert!(resource_marked_ready(&cached("s1", 0, false), &index));
    }
}
