//! Slice cleanup controller (component C): deletes orphaned ResourceSlices
//! and manages the slice finalizer.

use crate::aggregator::DELETION_STRATEGY_ANNOTATION;
use crate::util::{CLEANUP_FINALIZER, Error, colors::FG2};
use chrono::Utc;
use eno_types::{Composition, ResourceSlice};
use futures::stream::StreamExt;
use jsonptr::PointerBuf;
use json_patch::{PatchOperation, RemoveOperation, TestOperation};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, Patch, PatchParams, Preconditions},
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;

struct Context {
    client: Client,
}

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "starting slice-cleanup controller".green());
    let context = Arc::new(Context { client: client.clone() });
    let slices: Api<ResourceSlice> = Api::all(client);
    Controller::new(slices, Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_| async {})
        .await;
    Ok(())
}

async fn reconcile(slice: Arc<ResourceSlice>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = slice
        .namespace()
        .ok_or_else(|| Error::UserInput("ResourceSlice must be namespaced".to_string()))?;
    let name = slice.name_any();

    let age = slice
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| Utc::now().signed_duration_since(t.0))
        .unwrap_or_default();
    if age < chrono::Duration::seconds(5) {
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    let owner_name = slice
        .owner_references()
        .iter()
        .find(|o| o.kind == "Composition")
        .map(|o| o.name.clone());

    // This controller keeps no local reflector cache for Composition, so
    // there is only one read path to the apiserver available here — this
    // `get_opt` call is the single authoritative read the destructive-delete
    // decision is made against, not a stale cache in need of a second,
    // independent check.
    let compositions: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);
    let composition = match &owner_name {
        Some(n) => compositions.get_opt(n).await?,
        None => None,
    };

    let should_delete = should_delete(&slice, composition.as_ref());

    if should_delete {
        let slices_api: Api<ResourceSlice> = Api::namespaced(ctx.client.clone(), &namespace);
        let pre = Preconditions {
            uid: slice.metadata.uid.clone(),
            resource_version: slice.metadata.resource_version.clone(),
        };
        match slices_api
            .delete(
                &name,
                &DeleteParams {
                    preconditions: Some(pre),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 || e.code == 409 => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(Action::await_change());
    }

    if should_release_finalizer(&slice, composition.as_ref()) && has_finalizer(&slice) {
        release_finalizer(&ctx.client, &namespace, &name, &slice).await?;
    }

    Ok(Action::requeue(Duration::from_secs(30)))
}

fn should_delete(slice: &ResourceSlice, composition: Option<&Composition>) -> bool {
    let Some(composition) = composition else {
        // Owning composition is gone entirely: always eligible, unless this
        // slice's synthesis is still (improbably) referenced as in-flight.
        return true;
    };

    let composition_deleted = composition.metadata.deletion_timestamp.is_some();
    let synthesis_terminated = terminated_for(slice, composition);
    if synthesis_terminated && composition_deleted {
        return true;
    }

    let in_flight_uuid = composition
        .status
        .as_ref()
        .and_then(|s| s.in_flight_synthesis.as_ref())
        .map(|s| s.uuid.as_str());
    if in_flight_uuid == Some(slice.spec.synthesis_uuid.as_str()) {
        return false;
    }

    let older_generation = composition
        .status
        .as_ref()
        .map(|s| slice.spec.composition_generation < current_generation(s))
        .unwrap_or(false);
    let referenced = is_referenced(slice, composition);
    if older_generation && !referenced {
        return true;
    }

    let superseded_attempt = composition
        .status
        .as_ref()
        .and_then(|s| {
            [s.current_synthesis.as_ref(), s.previous_synthesis.as_ref()]
                .into_iter()
                .flatten()
                .find(|syn| syn.uuid == slice.spec.synthesis_uuid)
        })
        .map(|syn| slice.spec.attempt < syn.attempts)
        .unwrap_or(false);

    superseded_attempt
}

fn terminated_for(slice: &ResourceSlice, composition: &Composition) -> bool {
    composition
        .status
        .as_ref()
        .map(|s| {
            !is_referenced(slice, composition)
                || s.in_flight_synthesis.is_none()
        })
        .unwrap_or(true)
}

fn current_generation(status: &eno_types::CompositionStatus) -> i64 {
    status
        .current_synthesis
        .as_ref()
        .map(|s| s.observed_composition_generation)
        .unwrap_or(0)
}

fn is_referenced(slice: &ResourceSlice, composition: &Composition) -> bool {
    composition
        .status
        .as_ref()
        .map(|s| {
            [s.current_synthesis.as_ref(), s.previous_synthesis.as_ref()]
                .into_iter()
                .flatten()
                .any(|syn| syn.uuid == slice.spec.synthesis_uuid)
        })
        .unwrap_or(false)
}

fn should_release_finalizer(slice: &ResourceSlice, composition: Option<&Composition>) -> bool {
    let Some(composition) = composition else {
        return true;
    };
    if composition.metadata.deletion_timestamp.is_some() {
        return true;
    }
    let orphaning = composition
        .annotations()
        .get(DELETION_STRATEGY_ANNOTATION)
        .map(|v| v == "orphan")
        .unwrap_or(false);
    let all_deleted = slice
        .status
        .as_ref()
        .map(|s| s.resources.iter().all(|r| r.deleted))
        .unwrap_or(slice.spec.resources.is_empty());
    all_deleted || orphaning
}

fn has_finalizer(slice: &ResourceSlice) -> bool {
    slice.finalizers().iter().any(|f| f == CLEANUP_FINALIZER)
}

async fn release_finalizer(
    client: &Client,
    namespace: &str,
    name: &str,
    slice: &ResourceSlice,
) -> Result<(), Error> {
    let index = slice
        .finalizers()
        .iter()
        .position(|f| f == CLEANUP_FINALIZER)
        .unwrap();
    let api: Api<ResourceSlice> = Api::namespaced(client.clone(), namespace);
    let patch = Patch::Json::<ResourceSlice>(json_patch::Patch(vec![
        PatchOperation::Test(TestOperation {
            path: PointerBuf::parse(format!("/metadata/finalizers/{index}")).unwrap(),
            value: serde_json::json!(CLEANUP_FINALIZER),
        }),
        PatchOperation::Remove(RemoveOperation {
            path: PointerBuf::parse(format!("/metadata/finalizers/{index}")).unwrap(),
        }),
    ]));
    match api
        .patch(name, &PatchParams::apply(crate::util::MANAGER_NAME), &patch)
        .await
    {
        Ok(_) | Err(kube::Error::Api(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn on_error(slice: Arc<ResourceSlice>, error: &Error, _ctx: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!("cleanup error on {}: {error}", slice.name_any()).color(FG2)
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_types::{CompositionStatus, ResourceSliceSpec, ResourceState, Synthesis};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn slice_with(uuid: &str, generation: i64, attempt: u32) -> ResourceSlice {
        ResourceSlice {
            metadata: ObjectMeta::default(),
            spec: ResourceSliceSpec {
                composition_generation: generation,
                synthesis_uuid: uuid.to_string(),
                attempt,
                ..Default::default()
            },
            status: None,
        }
    }

    fn composition_with(status: CompositionStatus) -> Composition {
        let mut c = Composition::new("c1", Default::default());
        c.status = Some(status);
        c
    }

    #[test]
    fn deletes_when_owner_composition_gone() {
        let slice = slice_with("u1", 1, 0);
        assert!(should_delete(&slice, None));
    }

    #[test]
    fn keeps_slice_referenced_by_current_synthesis() {
        let slice = slice_with("u1", 1, 0);
        let syn = Synthesis::new("u1".into(), Time(Utc::now()));
        let composition = composition_with(CompositionStatus {
            current_synthesis: Some(syn),
            ..Default::default()
        });
        assert!(!should_delete(&slice, Some(&composition)));
    }

    #[test]
    fn never_deletes_slice_for_in_flight_synthesis() {
        let slice = slice_with("u1", 1, 0);
        let syn = Synthesis::new("u1".into(), Time(Utc::now()));
        let composition = composition_with(CompositionStatus {
            in_flight_synthesis: Some(syn),
            ..Default::default()
        });
        assert!(!should_delete(&slice, Some(&composition)));
    }

    #[test]
    fn deletes_slice_from_older_unreferenced_generation() {
        let slice = slice_with("old-uuid", 1, 0);
        let mut syn = Synthesis::new("new-uuid".into(), Time(Utc::now()));
        syn.observed_composition_generation = 2;
        let composition = composition_with(CompositionStatus {
            current_synthesis: Some(syn),
            ..Default::default()
        });
        assert!(should_delete(&slice, Some(&composition)));
    }

    #[test]
    fn deletes_superseded_attempt_of_same_synthesis() {
        let slice = slice_with("u1", 1, 0);
        let mut syn = Synthesis::new("u1".into(), Time(Utc::now()));
        syn.attempts = 2;
        let composition = composition_with(CompositionStatus {
            current_synthesis: Some(syn),
            ..Default::default()
        });
        assert!(should_delete(&slice, Some(&composition)));
    }

    #[test]
    fn releases_finalizer_once_all_resources_deleted() {
        let slice = ResourceSlice {
            metadata: ObjectMeta::default(),
            spec: ResourceSliceSpec {
                resources: vec![Default::default()],
                ..Default::default()
            },
            status: Some(eno_types::ResourceSliceStatus {
                resources: vec![ResourceState { deleted: true, ..Default::default() }],
            }),
        };
        let composition = composition_with(CompositionStatus::default());
        assert!(should_release_finalizer(&slice, Some(&composition)));
    }

    #[test]
    fn does_not_release_finalizer_while_resources_remain() {
        let slice = ResourceSlice {
            metadata: ObjectMeta::default(),
            spec: ResourceSliceSpec {
                resources: vec![Default::default()],
                ..Default::default()
            },
            status: Some(eno_types::ResourceSliceStatus {
                resources: vec![ResourceState { deleted: false, ..Default::default() }],
            }),
        };
        let composition = composition_with(CompositionStatus::default());
        assert!(!should_release_finalizer(&slice, Some(&composition)));
    }

    #[test]
    fn releases_finalizer_when_orphaning() {
        let slice = ResourceSlice {
            metadata: ObjectMeta::default(),
            spec: ResourceSliceSpec {
                resources: vec![Default::default()],
                ..Default::default()
            },
            status: Some(eno_types::ResourceSliceStatus {
                resources: vec![ResourceState { deleted: false, ..Default::default() }],
            }),
        };
        let mut composition = composition_with(CompositionStatus::default());
        composition.metadata.annotations = Some(
            [(DELETION_STRATEGY_ANNOTATION.to_string(), "orphan".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(should_release_finalizer(&slice, Some(&composition)));
    }
}
