//! Pod lifecycle controller (component E): drives a synthesis attempt's pod
//! from nonexistent through running to deleted.

use crate::config::OperatorConfig;
use crate::util::{Error, colors::FG2, patch::cas_patch_status};
use chrono::Utc;
use eno_common::backoff;
use eno_types::{Composition, CompositionStatus, Synthesizer};
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, Pod, PodSecurityContext, PodSpec, SecurityContext, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ListParams, ObjectMeta, Preconditions},
    runtime::{
        Controller,
        controller::Action,
        watcher::Config as WatcherConfig,
    },
};
use owo_colors::OwoColorize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const LABEL_COMPOSITION_NAME: &str = "eno.azure.io/composition-name";
pub const LABEL_COMPOSITION_NAMESPACE: &str = "eno.azure.io/composition-namespace";
pub const LABEL_SYNTHESIS_UUID: &str = "eno.azure.io/synthesis-uuid";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const ANNOTATION_COMPOSITION_GENERATION: &str = "eno.azure.io/composition-generation";
pub const ANNOTATION_SYNTHESIZER_GENERATION: &str = "eno.azure.io/synthesizer-generation";

struct Context {
    client: Client,
    config: Arc<OperatorConfig>,
}

pub async fn run(client: Client, config: Arc<OperatorConfig>) -> Result<(), Error> {
    println!("{}", "starting pod-lifecycle controller".green());
    let context = Arc::new(Context { client: client.clone(), config });
    let compositions: Api<Composition> = Api::all(client.clone());
    Controller::new(compositions, WatcherConfig::default())
        .owns(Api::<Pod>::all(client), WatcherConfig::default())
        .run(reconcile, on_error, context)
        .for_each(|_| async {})
        .await;
    Ok(())
}

enum PodAction {
    Idle,
    Backoff(Duration),
    Create,
    Observe,
    Delete { reason: &'static str },
    NoOp,
}

async fn reconcile(composition: Arc<Composition>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = composition
        .namespace()
        .ok_or_else(|| Error::UserInput("Composition must be namespaced".to_string()))?;
    let name = composition.name_any();

    let Some(status) = &composition.status else {
        return Ok(Action::await_change());
    };

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ctx.config.namespace);
    let lp = ListParams::default().labels(&format!(
        "{LABEL_COMPOSITION_NAME}={name},{LABEL_COMPOSITION_NAMESPACE}={namespace}"
    ));
    let existing_pods = pods.list(&lp).await?;

    let action = determine_action(&composition, status, &existing_pods.items);

    match action {
        PodAction::Idle | PodAction::NoOp | PodAction::Observe => {
            Ok(Action::requeue(Duration::from_secs(10)))
        }
        PodAction::Backoff(remaining) => Ok(Action::requeue(remaining)),
        PodAction::Create => {
            create_pod(&ctx, &composition, status).await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        PodAction::Delete { reason } => {
            for pod in &existing_pods.items {
                delete_pod(&ctx.client, &ctx.config.namespace, pod, reason).await?;
            }
            Ok(Action::requeue(Duration::from_secs(2)))
        }
    }
}

fn determine_action(composition: &Composition, status: &CompositionStatus, pods: &[Pod]) -> PodAction {
    if composition.metadata.deletion_timestamp.is_some() {
        return if pods.is_empty() {
            PodAction::Idle
        } else {
            PodAction::Delete { reason: "CompositionDeleted" }
        };
    }

    let Some(in_flight) = &status.in_flight_synthesis else {
        return if pods.is_empty() {
            PodAction::Idle
        } else {
            PodAction::Delete { reason: "NoInFlightSynthesis" }
        };
    };

    if in_flight.canceled.is_some() {
        return if pods.is_empty() {
            PodAction::Idle
        } else {
            PodAction::Delete { reason: "Canceled" }
        };
    }

    if in_flight.synthesized.is_some() {
        return PodAction::Delete { reason: "Synthesized" };
    }

    let matching: Vec<&Pod> = pods
        .iter()
        .filter(|p| p.labels().get(LABEL_SYNTHESIS_UUID) == Some(&in_flight.uuid))
        .collect();
    let mismatched: Vec<&Pod> = pods
        .iter()
        .filter(|p| p.labels().get(LABEL_SYNTHESIS_UUID) != Some(&in_flight.uuid))
        .collect();

    if !mismatched.is_empty() {
        return PodAction::Delete { reason: "Superseded" };
    }

    if let Some(pod_creation) = &in_flight.pod_creation
        && in_flight.attempts > 0
    {
        let wait = backoff::linear(Duration::from_millis(250), in_flight.attempts);
        let elapsed = Utc::now().signed_duration_since(pod_creation.0);
        let elapsed = Duration::from_secs(elapsed.num_seconds().max(0) as u64);
        if elapsed < wait {
            return PodAction::Backoff(wait - elapsed);
        }
    }

    if matching.is_empty() {
        return PodAction::Create;
    }

    // One replacement in flight while an old one terminates is allowed; a
    // second is rejected to avoid thundering herds.
    let terminating: Vec<&&Pod> = matching
        .iter()
        .filter(|p| p.metadata.deletion_timestamp.is_some())
        .collect();
    let live = matching.len() - terminating.len();
    if !terminating.is_empty() && live == 0 {
        return PodAction::Create;
    }

    PodAction::Observe
}

async fn create_pod(ctx: &Context, composition: &Composition, status: &CompositionStatus) -> Result<(), Error> {
    let in_flight = status.in_flight_synthesis.as_ref().unwrap();
    let namespace = composition.namespace().unwrap();
    let comp_name = composition.name_any();

    let synthesizers: Api<Synthesizer> = Api::namespaced(ctx.client.clone(), &namespace);
    let synthesizer = synthesizers.get(&composition.spec.synthesizer.name).await?;

    let pod_name = format!("eno-synth-{}", &in_flight.uuid[..8.min(in_flight.uuid.len())]);

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_COMPOSITION_NAME.to_string(), comp_name.clone());
    labels.insert(LABEL_COMPOSITION_NAMESPACE.to_string(), namespace.clone());
    labels.insert(LABEL_SYNTHESIS_UUID.to_string(), in_flight.uuid.clone());
    labels.insert(LABEL_MANAGED_BY.to_string(), "eno".to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(
        ANNOTATION_COMPOSITION_GENERATION.to_string(),
        composition.metadata.generation.unwrap_or(0).to_string(),
    );
    annotations.insert(
        ANNOTATION_SYNTHESIZER_GENERATION.to_string(),
        synthesizer.status.as_ref().map(|s| s.current_generation).unwrap_or(0).to_string(),
    );

    let mut env = vec![
        env("COMPOSITION_NAME", &comp_name),
        env("COMPOSITION_NAMESPACE", &namespace),
        env("SYNTHESIS_UUID", &in_flight.uuid),
        env("SYNTHESIS_ATTEMPT", &in_flight.attempts.to_string()),
    ];
    let core_names: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
    for e in &composition.spec.synthesis_env {
        if !core_names.contains(&e.name.as_str()) {
            env.push(env(&e.name, &e.value));
        }
    }
    for e in &synthesizer.spec.env {
        if !core_names.contains(&e.name.as_str()) {
            env.push(env(&e.name, &e.value));
        }
    }

    let toleration = ctx.config.taint_toleration().map(|(key, value)| Toleration {
        key: Some(key.to_string()),
        value: Some(value.to_string()),
        operator: Some("Equal".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    });

    let mut node_selector = BTreeMap::new();
    if let Some((key, value)) = ctx.config.node_affinity() {
        node_selector.insert(key.to_string(), value.to_string());
    }

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(ctx.config.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![OwnerReference {
                api_version: "eno.azure.io/v1".to_string(),
                kind: "Composition".to_string(),
                name: comp_name.clone(),
                uid: composition.metadata.uid.clone().unwrap_or_default(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            service_account_name: Some(ctx.config.service_account.clone()),
            restart_policy: Some("Never".to_string()),
            node_selector: (!node_selector.is_empty()).then_some(node_selector),
            tolerations: toleration.map(|t| vec![t]),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                seccomp_profile: Some(k8s_openapi::api::core::v1::SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            containers: vec![Container {
                name: "synthesizer".to_string(),
                image: Some(synthesizer.spec.image.clone()),
                command: (!synthesizer.spec.command.is_empty()).then(|| synthesizer.spec.command.clone()),
                stdin: Some(true),
                env: Some(env),
                security_context: Some(SecurityContext {
                    allow_privilege_escalation: Some(false),
                    read_only_root_filesystem: Some(true),
                    run_as_non_root: Some(true),
                    capabilities: Some(Capabilities {
                        drop: Some(vec!["ALL".to_string()]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    };

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ctx.config.namespace);
    match pods.create(&Default::default(), &pod).await {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 409 => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    // Compare-and-set: only bump Attempts/PodCreation if the in-flight
    // synthesis we just created a pod for is still the live one.
    let expected_uuid = in_flight.uuid.clone();
    cas_patch_status::<CompositionStatus, Composition>(
        ctx.client.clone(),
        &namespace,
        &comp_name,
        |s| {
            if let Some(cur) = &mut s.in_flight_synthesis
                && cur.uuid == expected_uuid
                && cur.synthesized.is_none()
            {
                cur.attempts += 1;
                cur.pod_creation = Some(Time(Utc::now()));
            }
        },
    )
    .await?;

    Ok(())
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

async fn delete_pod(client: &Client, namespace: &str, pod: &Pod, reason: &str) -> Result<(), Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let name = pod.name_any();
    println!("{}", format!("deleting pod {name}: {reason}").color(FG2));
    let pre = Preconditions {
        uid: pod.metadata.uid.clone(),
        resource_version: pod.metadata.resource_version.clone(),
    };
    match pods
        .delete(&name, &DeleteParams { preconditions: Some(pre), ..Default::default() })
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 || e.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn on_error(composition: Arc<Composition>, error: &Error, _ctx: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!("pod-lifecycle error on {}: {error}", composition.name_any()).color(FG2)
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_types::Synthesis;

    fn composition_with(in_flight: Option<Synthesis>, deleting: bool) -> (Composition, CompositionStatus) {
        let mut c = Composition::new("c1", Default::default());
        if deleting {
            c.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
        let status = CompositionStatus {
            in_flight_synthesis: in_flight,
            ..Default::default()
        };
        (c, status)
    }

    #[test]
    fn idle_when_no_in_flight_synthesis() {
        let (c, s) = composition_with(None, false);
        assert!(matches!(determine_action(&c, &s, &[]), PodAction::Idle));
    }

    #[test]
    fn create_when_no_matching_pod() {
        let mut syn = Synthesis::new("u1".into(), Time(Utc::now()));
        syn.attempts = 0;
        let (c, s) = composition_with(Some(syn), false);
        assert!(matches!(determine_action(&c, &s, &[]), PodAction::Create));
    }

    #[test]
    fn deletes_on_synthesized() {
        let mut syn = Synthesis::new("u1".into(), Time(Utc::now()));
        syn.synthesized = Some(Time(Utc::now()));
        let (c, s) = composition_with(Some(syn), false);
        assert!(matches!(
            determine_action(&c, &s, &[]),
            PodAction::Delete { reason: "Synthesized" }
        ));
    }

    #[test]
    fn backoff_before_creation_window_elapses() {
        let mut syn = Synthesis::new("u1".into(), Time(Utc::now()));
        syn.attempts = 2;
        syn.pod_creation = Some(Time(Utc::now()));
        let (c, s) = composition_with(Some(syn), false);
        assert!(matches!(determine_action(&c, &s, &[]), PodAction::Backoff(_)));
    }
}
