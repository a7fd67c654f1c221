//! Composition controller (component H): finalizer discipline, synthesis
//! timeout cancellation, the deletion deadlock-breaker, and the pure
//! `simplified_status` projection.

use crate::util::{CLEANUP_FINALIZER, Error, colors::FG2, patch::patch_status};
use chrono::Utc;
use eno_types::{Composition, CompositionStatus, Synthesis, Synthesizer};
use futures::stream::StreamExt;
use jsonptr::PointerBuf;
use json_patch::{AddOperation, PatchOperation};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;

/// Set by the aggregator (component B) when a referenced ResourceSlice has
/// gone missing without a corresponding in-flight synthesis; cleared here
/// once it has served its purpose of triggering a fresh synthesis.
pub const FORCE_RESYNTHESIS_ANNOTATION: &str = "eno.azure.io/force-resynthesis";

struct Context {
    client: Client,
}

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "starting composition controller".green());
    let context = Arc::new(Context { client: client.clone() });
    let compositions: Api<Composition> = Api::all(client);
    Controller::new(compositions, Default::default())
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

    if !has_finalizer(&composition) && composition.metadata.deletion_timestamp.is_none() {
        add_finalizer(&ctx.client, &namespace, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let synthesizer = fetch_synthesizer(&ctx, &namespace, &composition).await?;

    if composition.metadata.deletion_timestamp.is_some() {
        reconcile_deleting(&ctx, &composition, synthesizer.as_ref()).await?;
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    if let Some(status) = &composition.status
        && let Some(in_flight) = &status.in_flight_synthesis
        && in_flight.canceled.is_none()
        && let (Some(initialized), Some(synthesizer)) = (&in_flight.initialized, &synthesizer)
    {
        let pod_timeout = parse_duration::parse(&synthesizer.spec.pod_timeout)?;
        let elapsed = Utc::now().signed_duration_since(initialized.0);
        if elapsed.to_std().unwrap_or_default() > pod_timeout {
            cancel_synthesis(&ctx.client, &namespace, &name, &in_flight.uuid).await?;
        }
    }

    if let Some(synthesizer) = &synthesizer {
        let forced = composition.annotations().get(FORCE_RESYNTHESIS_ANNOTATION).is_some();
        if should_start_synthesis(&composition, synthesizer, composition.status.as_ref(), forced) {
            maybe_start_synthesis(&ctx.client, &namespace, &name).await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
    }

    let simplified = simplified_status(&composition, synthesizer.as_ref());
    let needs_write = composition
        .status
        .as_ref()
        .map(|s| s.simplified.status != simplified.status || s.simplified.error != simplified.error)
        .unwrap_or(true);
    if needs_write {
        patch_status::<CompositionStatus, Composition>(ctx.client.clone(), &composition, |s| {
            s.simplified.status = simplified.status.clone();
            s.simplified.error = simplified.error.clone();
        })
        .await?;
    }

    Ok(Action::requeue(Duration::from_secs(15)))
}

async fn fetch_synthesizer(
    ctx: &Context,
    namespace: &str,
    composition: &Composition,
) -> Result<Option<Synthesizer>, Error> {
    let synthesizers: Api<Synthesizer> = Api::namespaced(ctx.client.clone(), namespace);
    Ok(synthesizers.get_opt(&composition.spec.synthesizer.name).await?)
}

/// Whether a new synthesis should be started: no synthesis has ever run, the
/// composition's spec generation has moved on from the one CurrentSynthesis
/// observed, the synthesizer's minimum generation requirement has advanced
/// past what was last observed, or a caller has explicitly forced one.
fn should_start_synthesis(
    composition: &Composition,
    synthesizer: &Synthesizer,
    status: Option<&CompositionStatus>,
    forced: bool,
) -> bool {
    let Some(status) = status else {
        return true;
    };
    if status.in_flight_synthesis.is_some() {
        return false;
    }
    let Some(current) = &status.current_synthesis else {
        return true;
    };
    let generation = composition.metadata.generation.unwrap_or(0);
    if current.observed_composition_generation != generation {
        return true;
    }
    if composition.spec.synthesizer.min_generation > current.observed_synthesizer_generation {
        return true;
    }
    let _ = synthesizer;
    forced
}

/// Re-fetches the composition and synthesizer, re-checks
/// [`should_start_synthesis`] against the fresh read to close the race with a
/// concurrent reconcile, then CAS-writes a brand new `InFlightSynthesis`.
async fn maybe_start_synthesis(client: &Client, namespace: &str, name: &str) -> Result<(), Error> {
    let compositions: Api<Composition> = Api::namespaced(client.clone(), namespace);
    let current = compositions.get(name).await?;

    let synthesizers: Api<Synthesizer> = Api::namespaced(client.clone(), namespace);
    let Some(synthesizer) = synthesizers.get_opt(&current.spec.synthesizer.name).await? else {
        return Ok(());
    };

    let forced = current.annotations().get(FORCE_RESYNTHESIS_ANNOTATION).is_some();
    if !should_start_synthesis(&current, &synthesizer, current.status.as_ref(), forced) {
        return Ok(());
    }

    let generation = current.metadata.generation.unwrap_or(0);
    let synthesizer_generation = synthesizer.status.as_ref().map(|s| s.current_generation).unwrap_or(0);
    let uuid = uuid::Uuid::new_v4().to_string();
    let now = Time(Utc::now());

    patch_status::<CompositionStatus, Composition>(client.clone(), &current, |s| {
        let mut synthesis = Synthesis::new(uuid, now);
        synthesis.observed_composition_generation = generation;
        synthesis.observed_synthesizer_generation = synthesizer_generation;
        s.in_flight_synthesis = Some(synthesis);
    })
    .await?;

    if forced {
        clear_force_resynthesis_annotation(client, namespace, name).await?;
    }
    Ok(())
}

async fn clear_force_resynthesis_annotation(client: &Client, namespace: &str, name: &str) -> Result<(), Error> {
    let api: Api<Composition> = Api::namespaced(client.clone(), namespace);
    let patch = Patch::Merge(serde_json::json!({
        "metadata": { "annotations": { FORCE_RESYNTHESIS_ANNOTATION: serde_json::Value::Null } }
    }));
    match api.patch(name, &PatchParams::apply(crate::util::MANAGER_NAME), &patch).await {
        Ok(_) | Err(kube::Error::Api(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Stamps `ObservedCompositionGeneration`/`Synthesized` on the current
/// synthesis so the reconstitution cache doesn't keep the composition alive
/// forever waiting for a reconcile that will never come once deletion starts.
async fn reconcile_deleting(
    ctx: &Context,
    composition: &Composition,
    synthesizer: Option<&Synthesizer>,
) -> Result<(), Error> {
    let generation = composition.metadata.generation.unwrap_or(0);

    // Deadlock breaker: a synthesis in flight when deletion starts will never
    // finish (nothing schedules its pod once the composition's gone), so
    // CurrentSynthesis would otherwise sit forever without a Reconciled time
    // and the finalizer could never release. If a prior synthesis actually
    // produced output, restore it to CurrentSynthesis so sync/aggregator have
    // something real to drain to completion before we let go.
    let needs_restore = composition.status.as_ref().is_some_and(needs_previous_restore);
    if needs_restore {
        patch_status::<CompositionStatus, Composition>(ctx.client.clone(), composition, |s| {
            if s.current_synthesis.is_none()
                && s.previous_synthesis.as_ref().is_some_and(|p| p.synthesized.is_some())
            {
                s.current_synthesis = s.previous_synthesis.take();
            }
        })
        .await?;
        return Ok(());
    }

    let needs_stamp = composition
        .status
        .as_ref()
        .and_then(|s| s.current_synthesis.as_ref())
        .map(|s| s.observed_composition_generation != generation || s.synthesized.is_none())
        .unwrap_or(false);
    if needs_stamp {
        patch_status::<CompositionStatus, Composition>(ctx.client.clone(), composition, |s| {
            if let Some(cur) = &mut s.current_synthesis {
                cur.observed_composition_generation = generation;
                if cur.synthesized.is_none() {
                    cur.synthesized = Some(Time(Utc::now()));
                }
            }
        })
        .await?;
    }

    if should_release_finalizer(composition, synthesizer) && has_finalizer(composition) {
        release_finalizer(&ctx.client, &composition.namespace().unwrap(), &composition.name_any(), composition).await?;
    }
    Ok(())
}

fn needs_previous_restore(status: &CompositionStatus) -> bool {
    status.current_synthesis.is_none()
        && status.previous_synthesis.as_ref().is_some_and(|p| p.synthesized.is_some())
}

fn should_release_finalizer(composition: &Composition, synthesizer: Option<&Synthesizer>) -> bool {
    let Some(status) = &composition.status else {
        return false;
    };
    if status.in_flight_synthesis.is_some() {
        return false;
    }
    let reconciled = status
        .current_synthesis
        .as_ref()
        .map(|s| s.reconciled.is_some())
        .unwrap_or(true);
    if reconciled {
        return true;
    }
    // Narrow force-unblock: an addon composition whose owning Symphony no
    // longer exists would otherwise wait forever for a reconcile that can't
    // happen, since nothing will ever apply its output again.
    is_orphaned_addon(composition, synthesizer)
}

fn is_orphaned_addon(composition: &Composition, synthesizer: Option<&Synthesizer>) -> bool {
    let owned_by_symphony = composition
        .owner_references()
        .iter()
        .any(|o| o.kind == "Symphony" || o.kind == "CompositionSet");
    owned_by_symphony && synthesizer.is_none()
}

fn has_finalizer(composition: &Composition) -> bool {
    composition.finalizers().iter().any(|f| f == CLEANUP_FINALIZER)
}

async fn add_finalizer(client: &Client, namespace: &str, name: &str) -> Result<(), Error> {
    let api: Api<Composition> = Api::namespaced(client.clone(), namespace);
    let patch = Patch::Json::<Composition>(json_patch::Patch(vec![PatchOperation::Add(
        AddOperation {
            path: PointerBuf::parse("/metadata/finalizers/-").unwrap(),
            value: serde_json::json!(CLEANUP_FINALIZER),
        },
    )]));
    api.patch(name, &PatchParams::apply(crate::util::MANAGER_NAME), &patch)
        .await?;
    Ok(())
}

async fn release_finalizer(client: &Client, namespace: &str, name: &str, composition: &Composition) -> Result<(), Error> {
    let Some(index) = composition.finalizers().iter().position(|f| f == CLEANUP_FINALIZER) else {
        return Ok(());
    };
    let api: Api<Composition> = Api::namespaced(client.clone(), namespace);
    let patch = Patch::Json::<Composition>(json_patch::Patch(vec![PatchOperation::Remove(
        json_patch::RemoveOperation {
            path: PointerBuf::parse(format!("/metadata/finalizers/{index}")).unwrap(),
        },
    )]));
    match api.patch(name, &PatchParams::apply(crate::util::MANAGER_NAME), &patch).await {
        Ok(_) | Err(kube::Error::Api(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn cancel_synthesis(client: &Client, namespace: &str, name: &str, expected_uuid: &str) -> Result<(), Error> {
    let expected_uuid = expected_uuid.to_string();
    crate::util::patch::cas_patch_status::<CompositionStatus, Composition>(
        client.clone(),
        namespace,
        name,
        move |s| {
            if let Some(cur) = &mut s.in_flight_synthesis
                && cur.uuid == expected_uuid
                && cur.canceled.is_none()
            {
                cur.canceled = Some(Time(Utc::now()));
            }
        },
    )
    .await?;
    Ok(())
}

/// Closed set of user-facing phases. Pure function of composition+synthesizer
/// state; the `Reconciling` phase carries forward whatever error the
/// aggregator (component B) last wrote.
fn simplified_status(composition: &Composition, synthesizer: Option<&Synthesizer>) -> eno_types::Simplified {
    if composition.metadata.deletion_timestamp.is_some() {
        return status("Deleting", None);
    }
    let Some(synthesizer) = synthesizer else {
        return status("MissingSynthesizer", None);
    };
    let Some(s) = &composition.status else {
        return status("Unknown", None);
    };

    if let Some(in_flight) = &s.in_flight_synthesis {
        if in_flight.canceled.is_some() {
            let error = in_flight
                .results
                .iter()
                .rev()
                .find(|r| r.severity == eno_types::ResultSeverity::Error)
                .map(|r| r.message.clone())
                .or_else(|| Some("Timeout".to_string()));
            return status("SynthesisBackoff", error);
        }
        return status("Synthesizing", None);
    }

    let Some(current) = &s.current_synthesis else {
        let mismatched = s
            .input_revisions
            .iter()
            .any(|r| r.synthesizer_generation.is_some_and(|g| g < synthesizer.status.as_ref().map(|s| s.current_generation).unwrap_or(0)));
        if s.input_revisions.is_empty() {
            return status("MissingInputs", None);
        }
        if mismatched {
            return status("MismatchedInputs", None);
        }
        return status("PendingSynthesis", None);
    };

    if let Some(error) = first_error(current) {
        return status("Reconciling", Some(error));
    }

    match (current.ready.is_some(), current.reconciled.is_some()) {
        (true, true) => status("Ready", None),
        (false, true) => status("NotReady", None),
        (_, false) => status("Reconciling", None),
    }
}

fn first_error(synthesis: &Synthesis) -> Option<String> {
    synthesis
        .results
        .iter()
        .find(|r| r.severity == eno_types::ResultSeverity::Error)
        .map(|r| r.message.clone())
}

fn status(status: &str, error: Option<String>) -> eno_types::Simplified {
    eno_types::Simplified {
        status: status.to_string(),
        error,
        resolved_synth_name: None,
    }
}

fn on_error(composition: Arc<Composition>, error: &Error, _ctx: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!("composition error on {}: {error}", composition.name_any()).color(FG2)
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthesizer() -> Synthesizer {
        Synthesizer::new("s1", Default::default())
    }

    #[test]
    fn deleting_wins_over_everything() {
        let mut c = Composition::new("c1", Default::default());
        c.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert_eq!(simplified_status(&c, Some(&synthesizer())).status, "Deleting");
    }

    #[test]
    fn missing_synthesizer_when_absent() {
        let c = Composition::new("c1", Default::default());
        assert_eq!(simplified_status(&c, None).status, "MissingSynthesizer");
    }

    #[test]
    fn synthesizing_while_in_flight() {
        let mut c = Composition::new("c1", Default::default());
        c.status = Some(CompositionStatus {
            in_flight_synthesis: Some(Synthesis::new("u1".into(), Time(Utc::now()))),
            ..Default::default()
        });
        assert_eq!(simplified_status(&c, Some(&synthesizer())).status, "Synthesizing");
    }

    #[test]
    fn backoff_reports_timeout_with_no_error() {
        let mut c = Composition::new("c1", Default::default());
        let mut syn = Synthesis::new("u1".into(), Time(Utc::now()));
        syn.canceled = Some(Time(Utc::now()));
        c.status = Some(CompositionStatus {
            in_flight_synthesis: Some(syn),
            ..Default::default()
        });
        let s = simplified_status(&c, Some(&synthesizer()));
        assert_eq!(s.status, "SynthesisBackoff");
        assert_eq!(s.error.as_deref(), Some("Timeout"));
    }

    #[test]
    fn ready_when_current_ready_and_reconciled() {
        let mut c = Composition::new("c1", Default::default());
        let mut syn = Synthesis::new("u1".into(), Time(Utc::now()));
        syn.ready = Some(Time(Utc::now()));
        syn.reconciled = Some(Time(Utc::now()));
        c.status = Some(CompositionStatus {
            current_synthesis: Some(syn),
            ..Default::default()
        });
        assert_eq!(simplified_status(&c, Some(&synthesizer())).status, "Ready");
    }

    #[test]
    fn not_ready_when_reconciled_but_not_ready() {
        let mut c = Composition::new("c1", Default::default());
        let mut syn = Synthesis::new("u1".into(), Time(Utc::now()));
        syn.reconciled = Some(Time(Utc::now()));
        c.status = Some(CompositionStatus {
            current_synthesis: Some(syn),
            ..Default::default()
        });
        assert_eq!(simplified_status(&c, Some(&synthesizer())).status, "NotReady");
    }

    #[test]
    fn reconciling_while_unreconciled() {
        let mut c = Composition::new("c1", Default::default());
        let syn = Synthesis::new("u1".into(), Time(Utc::now()));
        c.status = Some(CompositionStatus {
            current_synthesis: Some(syn),
            ..Default::default()
        });
        assert_eq!(simplified_status(&c, Some(&synthesizer())).status, "Reconciling");
    }

    #[test]
    fn starts_synthesis_when_no_status_exists() {
        let c = Composition::new("c1", Default::default());
        assert!(should_start_synthesis(&c, &synthesizer(), None, false));
    }

    #[test]
    fn does_not_start_while_in_flight() {
        let mut c = Composition::new("c1", Default::default());
        let status = CompositionStatus {
            in_flight_synthesis: Some(Synthesis::new("u1".into(), Time(Utc::now()))),
            ..Default::default()
        };
        c.status = Some(status.clone());
        assert!(!should_start_synthesis(&c, &synthesizer(), Some(&status), false));
    }

    #[test]
    fn starts_synthesis_on_generation_bump() {
        let mut c = Composition::new("c1", Default::default());
        c.metadata.generation = Some(2);
        let mut syn = Synthesis::new("u1".into(), Time(Utc::now()));
        syn.observed_composition_generation = 1;
        let status = CompositionStatus {
            current_synthesis: Some(syn),
            ..Default::default()
        };
        c.status = Some(status.clone());
        assert!(should_start_synthesis(&c, &synthesizer(), Some(&status), false));
    }

    #[test]
    fn starts_synthesis_on_min_generation_advance() {
        let mut c = Composition::new("c1", Default::default());
        c.metadata.generation = Some(1);
        c.spec.synthesizer.min_generation = 3;
        let mut syn = Synthesis::new("u1".into(), Time(Utc::now()));
        syn.observed_composition_generation = 1;
        syn.observed_synthesizer_generation = 2;
        let status = CompositionStatus {
            current_synthesis: Some(syn),
            ..Default::default()
        };
        c.status = Some(status.clone());
        assert!(should_start_synthesis(&c, &synthesizer(), Some(&status), false));
    }

    #[test]
    fn settled_composition_does_not_start_unless_forced() {
        let mut c = Composition::new("c1", Default::default());
        c.metadata.generation = Some(1);
        let mut syn = Synthesis::new("u1".into(), Time(Utc::now()));
        syn.observed_composition_generation = 1;
        let status = CompositionStatus {
            current_synthesis: Some(syn),
            ..Default::default()
        };
        c.status = Some(status.clone());
        assert!(!should_start_synthesis(&c, &synthesizer(), Some(&status), false));
        assert!(should_start_synthesis(&c, &synthesizer(), Some(&status), true));
    }

    #[test]
    fn restores_previous_synthesis_when_deleted_mid_flight() {
        let mut previous = Synthesis::new("old".into(), Time(Utc::now()));
        previous.synthesized = Some(Time(Utc::now()));
        let status = CompositionStatus {
            current_synthesis: None,
            previous_synthesis: Some(previous),
            in_flight_synthesis: Some(Synthesis::new("new".into(), Time(Utc::now()))),
            ..Default::default()
        };
        assert!(needs_previous_restore(&status));
    }

    #[test]
    fn does_not_restore_when_previous_never_synthesized() {
        let status = CompositionStatus {
            current_synthesis: None,
            previous_synthesis: Some(Synthesis::new("old".into(), Time(Utc::now()))),
            ..Default::default()
        };
        assert!(!needs_previous_restore(&status));
    }

    #[test]
    fn does_not_restore_when_current_already_set() {
        let status = CompositionStatus {
            current_synthesis: Some(Synthesis::new("cur".into(), Time(Utc::now()))),
            previous_synthesis: Some(Synthesis::new("old".into(), Time(Utc::now()))),
            ..Default::default()
        };
        assert!(!needs_previous_restore(&status));
    }

    #[test]
    fn missing_inputs_before_any_synthesis() {
        let mut c = Composition::new("c1", Default::default());
        c.status = Some(CompositionStatus::default());
        assert_eq!(simplified_status(&c, Some(&synthesizer())).status, "MissingInputs");
    }
}
