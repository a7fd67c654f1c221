//! Slice-status aggregator (component B): folds per-resource slice status
//! into composition-level `Reconciled`/`Ready` times and the first error.

use crate::composition::FORCE_RESYNTHESIS_ANNOTATION;
use crate::util::{Error, MANAGER_NAME, PROBE_INTERVAL, colors::FG2, patch::patch_status};
use chrono::Utc;
use eno_types::{Composition, ResourceSlice};
use futures::stream::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    Api, Client, ResourceExt,
    api::{ListParams, Patch, PatchParams},
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;

pub const DELETION_STRATEGY_ANNOTATION: &str = "eno.azure.io/deletion-strategy";

struct Context {
    client: Client,
}

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "starting slice-status aggregator".green());
    let context = Arc::new(Context { client: client.clone() });
    let compositions: Api<Composition> = Api::all(client.clone());
    Controller::new(compositions, Default::default())
        .owns(Api::<ResourceSlice>::all(client), Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_| async {})
        .await;
    Ok(())
}

async fn reconcile(composition: Arc<Composition>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = composition
        .namespace()
        .ok_or_else(|| Error::UserInput("Composition must be namespaced".to_string()))?;
    let name = composition.name_any();

    let Some(status) = &composition.status else {
        return Ok(Action::await_change());
    };
    let Some(current) = &status.current_synthesis else {
        return Ok(Action::await_change());
    };
    if current.resource_slices.is_empty() {
        // Empty composition: Ready mirrors the freshly computed Reconciled time.
        if current.reconciled.is_none() {
            patch_status::<eno_types::CompositionStatus, _>(ctx.client.clone(), &composition, |s| {
                if let Some(cur) = &mut s.current_synthesis {
                    cur.reconciled = Some(Time(Utc::now()));
                    cur.ready = cur.reconciled.clone();
                }
            })
            .await?;
        }
        return Ok(Action::requeue(PROBE_INTERVAL));
    }

    let slices_api: Api<ResourceSlice> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut resources = Vec::new();
    let mut missing = false;
    for slice_ref in &current.resource_slices {
        match slices_api.get_opt(&slice_ref.name).await? {
            Some(slice) => resources.push(slice),
            None => missing = true,
        }
    }

    if missing {
        let synthesized_age = current
            .synthesized
            .as_ref()
            .map(|t| Utc::now().signed_duration_since(t.0))
            .unwrap_or_default();
        if synthesized_age < chrono::Duration::seconds(5) {
            return Ok(Action::requeue(Duration::from_secs(2)));
        }
        // Double-checked with an uncached read above (this controller has no
        // separate cache layer); if still missing and no synthesis is
        // in-flight, request a forced resynthesis. The composition controller
        // consumes and clears the annotation once it starts a fresh synthesis.
        if status.in_flight_synthesis.is_none() && !is_orphaning(&composition) {
            eprintln!(
                "{}",
                format!("{name}: missing ResourceSlice, forcing resynthesis").color(FG2)
            );
            force_resynthesis(&ctx.client, &namespace, &name).await?;
        }
        return Ok(Action::requeue(PROBE_INTERVAL));
    }

    let deleting = composition.metadata.deletion_timestamp.is_some();
    let orphaning = is_orphaning(&composition);

    let (all_ready, max_ready, all_reconciled, first_error) =
        fold_resource_states(&resources, deleting, orphaning);

    let new_reconciled = all_reconciled.then(|| Time(Utc::now()));
    let new_ready = if all_ready { max_ready } else { None };

    let changed = new_reconciled.as_ref().map(|t| t.0) != current.reconciled.as_ref().map(|t| t.0)
        || new_ready.as_ref().map(|t| t.0) != current.ready.as_ref().map(|t| t.0);

    let write_error = status.simplified.status == "Reconciling";

    if changed || (write_error && first_error != status.simplified.error) {
        patch_status::<eno_types::CompositionStatus, _>(ctx.client.clone(), &composition, |s| {
            if let Some(cur) = &mut s.current_synthesis {
                cur.reconciled = new_reconciled;
                cur.ready = new_ready;
            }
            if write_error {
                s.simplified.error = first_error;
            }
        })
        .await?;
    }

    Ok(Action::requeue(PROBE_INTERVAL))
}

/// Folds every resource across `resources` into `(all_ready, max_ready,
/// all_reconciled, first_error)`. A resource with no status entry counts as
/// not-ready/not-reconciled unless it's already been deleted while the
/// composition deletes without orphaning.
fn fold_resource_states(
    resources: &[ResourceSlice],
    deleting: bool,
    orphaning: bool,
) -> (bool, Option<Time>, bool, Option<String>) {
    let mut all_ready = true;
    let mut max_ready: Option<Time> = None;
    let mut all_reconciled = true;
    let mut first_error: Option<String> = None;

    for slice in resources {
        let Some(slice_status) = &slice.status else {
            all_ready = false;
            all_reconciled = false;
            continue;
        };
        for (i, item) in slice.spec.resources.iter().enumerate() {
            let state = slice_status.resources.get(i);
            let reconciled = state.map(|s| s.reconciled).unwrap_or(false)
                || (deleting && !orphaning && state.map(|s| s.deleted).unwrap_or(false));
            if !reconciled {
                all_reconciled = false;
            }
            match state.and_then(|s| s.ready.as_ref()) {
                Some(ready) => {
                    if max_ready.as_ref().is_none_or(|m| ready.0 > m.0) {
                        max_ready = Some(ready.clone());
                    }
                }
                None if !item.deleted => all_ready = false,
                None => {}
            }
            if first_error.is_none()
                && let Some(err) = state.and_then(|s| s.reconciliation_error.as_ref())
            {
                first_error = Some(err.clone());
            }
        }
    }

    (all_ready, max_ready, all_reconciled, first_error)
}

async fn force_resynthesis(client: &Client, namespace: &str, name: &str) -> Result<(), Error> {
    let api: Api<Composition> = Api::namespaced(client.clone(), namespace);
    let patch = Patch::Merge(serde_json::json!({
        "metadata": { "annotations": { FORCE_RESYNTHESIS_ANNOTATION: "true" } }
    }));
    match api.patch(name, &PatchParams::apply(MANAGER_NAME), &patch).await {
        Ok(_) | Err(kube::Error::Api(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_orphaning(composition: &Composition) -> bool {
    composition
        .annotations()
        .get(DELETION_STRATEGY_ANNOTATION)
        .map(|v| v == "orphan")
        .unwrap_or(false)
}

fn on_error(composition: Arc<Composition>, error: &Error, _ctx: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!("aggregator error on {}: {error}", composition.name_any()).color(FG2)
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_types::{ResourceSliceItem, ResourceSliceSpec, ResourceSliceStatus, ResourceState};
    use kube::api::ObjectMeta;

    fn item(deleted: bool) -> ResourceSliceItem {
        ResourceSliceItem {
            manifest: "{}".into(),
            deleted,
            reconcile_interval: None,
        }
    }

    fn slice(items: Vec<ResourceSliceItem>, states: Option<Vec<ResourceState>>) -> ResourceSlice {
        ResourceSlice {
            metadata: ObjectMeta::default(),
            spec: ResourceSliceSpec { resources: items, ..Default::default() },
            status: states.map(|resources| ResourceSliceStatus { resources }),
        }
    }

    #[test]
    fn fold_treats_missing_status_as_not_ready() {
        let slices = vec![slice(vec![item(false)], None)];
        let (all_ready, max_ready, all_reconciled, err) = fold_resource_states(&slices, false, false);
        assert!(!all_ready);
        assert!(!all_reconciled);
        assert!(max_ready.is_none());
        assert!(err.is_none());
    }

    #[test]
    fn fold_reports_all_ready_when_every_resource_has_ready_time() {
        let t1 = Time(Utc::now());
        let t2 = Time(Utc::now() + chrono::Duration::seconds(5));
        let slices = vec![slice(
            vec![item(false), item(false)],
            Some(vec![
                ResourceState { ready: Some(t1), reconciled: true, ..Default::default() },
                ResourceState { ready: Some(t2.clone()), reconciled: true, ..Default::default() },
            ]),
        )];
        let (all_ready, max_ready, all_reconciled, _) = fold_resource_states(&slices, false, false);
        assert!(all_ready);
        assert!(all_reconciled);
        assert_eq!(max_ready.unwrap().0, t2.0);
    }

    #[test]
    fn fold_surfaces_first_reconciliation_error() {
        let slices = vec![slice(
            vec![item(false)],
            Some(vec![ResourceState {
                reconciliation_error: Some("boom".into()),
                ..Default::default()
            }]),
        )];
        let (_, _, _, err) = fold_resource_states(&slices, false, false);
        assert_eq!(err.as_deref(), Some("boom"));
    }

    #[test]
    fn fold_counts_deleted_resource_as_reconciled_while_composition_deletes() {
        let slices = vec![slice(
            vec![item(true)],
            Some(vec![ResourceState { deleted: true, reconciled: false, ..Default::default() }]),
        )];
        let (all_ready, _, all_reconciled, _) = fold_resource_states(&slices, true, false);
        assert!(all_ready);
        assert!(all_reconciled);
    }

    #[test]
    fn fold_does_not_credit_deletion_when_orphaning() {
        let slices = vec![slice(
            vec![item(true)],
            Some(vec![ResourceState { deleted: true, reconciled: false, ..Default::default() }]),
        )];
        let (_, _, all_reconciled, _) = fold_resource_states(&slices, true, true);
        assert!(!all_reconciled);
    }

    #[test]
    fn is_orphaning_reads_deletion_strategy_annotation() {
        let mut composition = Composition::new("c1", Default::default());
        composition.metadata.annotations = Some(
            [(DELETION_STRATEGY_ANNOTATION.to_string(), "orphan".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(is_orphaning(&composition));
        assert!(!is_orphaning(&Composition::new("c2", Default::default())));
    }
}
