//! Exec controller (component G): streams synthesizer input over a pod's
//! stdin, parses its stdout, and persists the result as ResourceSlices.

use crate::cache::{RECONCILE_INTERVAL_ANNOTATION, resource_ref_from_manifest};
use crate::podlifecycle::LABEL_SYNTHESIS_UUID;
use crate::util::{Error, colors::FG2, patch::cas_patch_status};
use chrono::Utc;
use eno_types::{
    Composition, CompositionStatus, InputResourceRef, InputWrapper, ResourceSlice,
    ResourceSliceItem, ResourceSliceSpec, ResourceState, ResourceList, SliceRef, Synthesis, Synthesizer,
};
use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::{
    Api, Client, ResourceExt,
    api::{AttachParams, ObjectMeta},
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Output manifests are packed into slices no larger than this, matching the
/// etcd-object-size headroom a ResourceSlice must leave for its own envelope.
const MAX_SLICE_BYTES: usize = 512 * 1024;

struct Context {
    client: Client,
}

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "starting exec controller".green());
    let context = Arc::new(Context { client: client.clone() });
    let pods: Api<Pod> = Api::all(client);
    Controller::new(pods, Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_| async {})
        .await;
    Ok(())
}

async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(namespace) = pod.namespace() else {
        return Ok(Action::await_change());
    };
    let labels = pod.labels();
    let (Some(comp_name), Some(pod_uuid)) = (
        labels.get(crate::podlifecycle::LABEL_COMPOSITION_NAME).cloned(),
        labels.get(LABEL_SYNTHESIS_UUID).cloned(),
    ) else {
        return Ok(Action::await_change());
    };

    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    if !ready {
        return Ok(Action::requeue(Duration::from_secs(2)));
    }

    let compositions: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(composition) = compositions.get_opt(&comp_name).await? else {
        return Ok(Action::await_change());
    };
    let Some(status) = &composition.status else {
        return Ok(Action::await_change());
    };
    let Some(in_flight) = &status.in_flight_synthesis else {
        return Ok(Action::await_change());
    };
    if in_flight.uuid != pod_uuid {
        return Ok(Action::await_change());
    }
    if in_flight.synthesized.is_some() {
        // Idempotence: a retry after the slices were already persisted and
        // the composition updated is a silent no-op.
        return Ok(Action::await_change());
    }

    let synthesizers: Api<Synthesizer> = Api::namespaced(ctx.client.clone(), &namespace);
    let synthesizer = synthesizers.get(&composition.spec.synthesizer.name).await?;
    let exec_timeout = parse_duration::parse(&synthesizer.spec.exec_timeout)?;

    let input = build_input(&composition, &synthesizer)?;
    let outputs = match tokio::time::timeout(
        exec_timeout,
        exec_synthesis(&ctx.client, &namespace, &pod.name_any(), &input),
    )
    .await
    {
        Ok(Ok(outputs)) => outputs,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(Error::Exec(format!(
                "exec timed out after {}",
                synthesizer.spec.exec_timeout
            )));
        }
    };

    let previous_items = previous_slice_items(&ctx.client, &namespace, status).await?;
    let slices = pack_slices(&outputs, &previous_items);

    let attempt = in_flight.attempts;
    let mut slice_refs = Vec::with_capacity(slices.len());
    let slices_api: Api<ResourceSlice> = Api::namespaced(ctx.client.clone(), &namespace);
    for (i, items) in slices.into_iter().enumerate() {
        let name = format!("{comp_name}-{pod_uuid}-{i}");
        let slice = ResourceSlice {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "eno.azure.io/v1".to_string(),
                    kind: "Composition".to_string(),
                    name: comp_name.clone(),
                    uid: composition.metadata.uid.clone().unwrap_or_default(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                labels: Some(
                    [
                        (crate::podlifecycle::LABEL_COMPOSITION_NAME.to_string(), comp_name.clone()),
                        (LABEL_SYNTHESIS_UUID.to_string(), pod_uuid.clone()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                finalizers: Some(vec![crate::util::CLEANUP_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: ResourceSliceSpec {
                composition_generation: composition.metadata.generation.unwrap_or(0),
                synthesis_uuid: pod_uuid.clone(),
                attempt,
                resources: items,
            },
            status: None,
        };
        match slices_api.create(&Default::default(), &slice).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 409 => {}
            Err(e) => return Err(e.into()),
        }
        slice_refs.push(SliceRef { name });
    }

    let expected_uuid = pod_uuid.clone();
    cas_patch_status::<CompositionStatus, Composition>(
        ctx.client.clone(),
        &namespace,
        &comp_name,
        move |s| {
            let Some(cur) = &s.in_flight_synthesis else { return };
            if cur.uuid != expected_uuid || cur.synthesized.is_some() {
                return;
            }
            let mut synthesis = cur.clone();
            synthesis.synthesized = Some(Time(Utc::now()));
            synthesis.resource_slices = slice_refs.clone();

            if let Some(current) = s.current_synthesis.take()
                && current.synthesized.is_some()
            {
                s.previous_synthesis = Some(current);
            }
            s.current_synthesis = Some(synthesis);
            s.in_flight_synthesis = None;
        },
    )
    .await?;

    Ok(Action::requeue(Duration::from_secs(5)))
}

fn build_input(composition: &Composition, synthesizer: &Synthesizer) -> Result<ResourceList, Error> {
    let bindings: HashMap<&str, &eno_types::Binding> = composition
        .spec
        .bindings
        .iter()
        .map(|b| (b.key.as_str(), b))
        .collect();

    let mut items = Vec::with_capacity(synthesizer.spec.refs.len());
    for r in &synthesizer.spec.refs {
        let Some(binding) = bindings.get(r.key.as_str()) else {
            return Err(Error::Terminal(format!(
                "synthesizer ref {:?} has no matching binding",
                r.key
            )));
        };
        let (group, kind) = split_group_kind(&binding.resource);
        let wrapper = InputWrapper::new(
            r.key.clone(),
            InputResourceRef {
                group,
                kind,
                name: binding.resource.clone(),
                namespace: binding.namespace.clone(),
            },
        );
        items.push(serde_json::to_value(wrapper)?);
    }
    Ok(ResourceList::new(items))
}

fn split_group_kind(resource: &str) -> (String, String) {
    match resource.split_once('/') {
        Some((group, kind)) => (group.to_string(), kind.to_string()),
        None => (String::new(), resource.to_string()),
    }
}

async fn exec_synthesis(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    input: &ResourceList,
) -> Result<Vec<(serde_json::Value, Option<String>)>, Error> {
    // The container's entrypoint *is* `synthesizer.spec.command`; we attach to
    // its existing stdio rather than exec a second process.
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let mut attached = pods
        .attach(pod_name, &AttachParams::default().stdin(true).stdout(true).stderr(true))
        .await?;

    let mut stdin = attached.stdin().ok_or_else(|| Error::Exec("pod has no stdin stream".to_string()))?;
    let payload = serde_json::to_vec(input)?;
    stdin
        .write_all(&payload)
        .await
        .map_err(|e| Error::Exec(format!("writing stdin: {e}")))?;
    stdin
        .close()
        .await
        .map_err(|e| Error::Exec(format!("closing stdin: {e}")))?;

    let mut stdout_buf = Vec::new();
    if let Some(mut stdout) = attached.stdout() {
        stdout
            .read_to_end(&mut stdout_buf)
            .await
            .map_err(|e| Error::Exec(format!("reading stdout: {e}")))?;
    }

    let mut stderr_buf = Vec::new();
    if let Some(mut stderr) = attached.stderr() {
        stderr.read_to_end(&mut stderr_buf).await.ok();
    }

    let status = attached.take_status();
    if let Some(status) = status
        && let Some(status) = status.await
        && status.status.as_deref() == Some("Failure")
    {
        let stderr = String::from_utf8_lossy(&stderr_buf);
        let truncated: String = stderr.chars().take(256).collect();
        return Err(Error::Exec(truncated));
    }

    let list: ResourceList = serde_json::from_slice(&stdout_buf)
        .map_err(|e| Error::Exec(format!("parsing synthesizer stdout: {e}")))?;

    Ok(list
        .items
        .into_iter()
        .map(|mut item| {
            let reconcile_interval = item
                .get_mut("metadata")
                .and_then(|m| m.get_mut("annotations"))
                .and_then(|a| a.as_object_mut())
                .and_then(|annotations| annotations.remove(RECONCILE_INTERVAL_ANNOTATION))
                .and_then(|v| v.as_str().map(str::to_string));
            (item, reconcile_interval)
        })
        .collect())
}

async fn previous_slice_items(
    client: &Client,
    namespace: &str,
    status: &CompositionStatus,
) -> Result<Vec<(serde_json::Value, bool)>, Error> {
    let Some(previous) = status.current_synthesis.as_ref().filter(|s| s.synthesized.is_some()) else {
        return Ok(Vec::new());
    };
    let slices_api: Api<ResourceSlice> = Api::namespaced(client.clone(), namespace);
    let mut items = Vec::new();
    for slice_ref in &previous.resource_slices {
        let Some(slice) = slices_api.get_opt(&slice_ref.name).await? else {
            continue;
        };
        for (i, item) in slice.spec.resources.iter().enumerate() {
            let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&item.manifest) else {
                continue;
            };
            let already_deleted = slice
                .status
                .as_ref()
                .and_then(|s| s.resources.get(i))
                .map(|r| r.deleted)
                .unwrap_or(false);
            items.push((manifest, item.deleted || already_deleted));
        }
    }
    Ok(items)
}

/// Packs new output manifests into one or more slices bounded by
/// [`MAX_SLICE_BYTES`], carrying forward tombstones for resources the new
/// synthesis dropped but whose prior state wasn't already reconciled-deleted.
fn pack_slices(
    outputs: &[(serde_json::Value, Option<String>)],
    previous_items: &[(serde_json::Value, bool)],
) -> Vec<Vec<ResourceSliceItem>> {
    let mut new_refs = std::collections::HashSet::new();
    let mut all_items: Vec<ResourceSliceItem> = Vec::new();

    for (manifest, reconcile_interval) in outputs {
        if let Some(r) = resource_ref_from_manifest(manifest) {
            new_refs.insert(r);
        }
        all_items.push(ResourceSliceItem {
            manifest: manifest.to_string(),
            deleted: false,
            reconcile_interval: reconcile_interval.clone(),
        });
    }

    for (manifest, already_deleted) in previous_items {
        if *already_deleted {
            continue;
        }
        let Some(r) = resource_ref_from_manifest(manifest) else {
            continue;
        };
        if new_refs.contains(&r) {
            continue;
        }
        all_items.push(ResourceSliceItem {
            manifest: manifest.to_string(),
            deleted: true,
            reconcile_interval: None,
        });
    }

    let mut slices: Vec<Vec<ResourceSliceItem>> = Vec::new();
    let mut current: Vec<ResourceSliceItem> = Vec::new();
    let mut current_bytes = 0usize;
    for item in all_items {
        let item_bytes = item.manifest.len();
        if !current.is_empty() && current_bytes + item_bytes > MAX_SLICE_BYTES {
            slices.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += item_bytes;
        current.push(item);
    }
    if !current.is_empty() || slices.is_empty() {
        slices.push(current);
    }
    slices
}

fn on_error(pod: Arc<Pod>, error: &Error, _ctx: Arc<Context>) -> Action {
    eprintln!("{}", format!("exec error on {}: {error}", pod.name_any()).color(FG2));
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(name: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name}
        })
    }

    fn output(name: &str) -> (serde_json::Value, Option<String>) {
        (manifest(name), None)
    }

    #[test]
    fn pack_slices_includes_new_outputs() {
        let slices = pack_slices(&[output("a")], &[]);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 1);
        assert!(!slices[0][0].deleted);
    }

    #[test]
    fn pack_slices_carries_reconcile_interval() {
        let slices = pack_slices(&[(manifest("a"), Some("5m".to_string()))], &[]);
        let flat: Vec<_> = slices.into_iter().flatten().collect();
        assert_eq!(flat[0].reconcile_interval.as_deref(), Some("5m"));
    }

    #[test]
    fn pack_slices_tombstones_dropped_resources() {
        let previous = vec![(manifest("old"), false)];
        let slices = pack_slices(&[output("new")], &previous);
        let flat: Vec<_> = slices.into_iter().flatten().collect();
        assert_eq!(flat.len(), 2);
        assert!(flat.iter().any(|i| i.deleted));
        assert!(flat.iter().find(|i| i.deleted).unwrap().reconcile_interval.is_none());
    }

    #[test]
    fn pack_slices_skips_already_deleted_tombstones() {
        let previous = vec![(manifest("old"), true)];
        let slices = pack_slices(&[output("new")], &previous);
        let flat: Vec<_> = slices.into_iter().flatten().collect();
        assert_eq!(flat.len(), 1);
    }

    #[test]
    fn pack_slices_splits_on_size() {
        let big = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "big"},
            "data": {"blob": "x".repeat(MAX_SLICE_BYTES)}
        });
        let slices = pack_slices(&[(big.clone(), None), (big, None)], &[]);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn build_input_errors_on_unmatched_ref() {
        let composition = Composition::new("c1", Default::default());
        let mut synthesizer = Synthesizer::new("s1", Default::default());
        synthesizer.spec.refs.push(eno_types::Ref {
            key: "missing".to_string(),
            resource: "v1/ConfigMap".to_string(),
        });
        assert!(build_input(&composition, &synthesizer).is_err());
    }
}
