//! Pod GC controller (component F): watches synthesizer pods directly and
//! applies an orthogonal set of deletion policies, independent of the
//! composition-level state machine in [`crate::podlifecycle`].

use crate::config::OperatorConfig;
use crate::podlifecycle::{LABEL_COMPOSITION_NAME, LABEL_COMPOSITION_NAMESPACE, LABEL_SYNTHESIS_UUID};
use crate::util::{Error, colors::FG2, patch::patch_status};
use chrono::Utc;
use eno_types::{Composition, CompositionStatus, ResultEntry, ResultSeverity, Synthesizer};
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, Preconditions},
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;

struct Context {
    client: Client,
    config: Arc<OperatorConfig>,
}

/// Watches only the namespace synthesizer pods are created in: this
/// controller force-deletes anything it finds there without the expected
/// label set, so it must never be pointed at `Api::all`.
pub async fn run(client: Client, config: Arc<OperatorConfig>) -> Result<(), Error> {
    println!("{}", "starting pod-gc controller".green());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &config.namespace);
    let context = Arc::new(Context { client, config });
    Controller::new(pods, Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_| async {})
        .await;
    Ok(())
}

enum Disposition {
    Keep,
    Requeue(Duration),
    Delete { reason: &'static str, error: Option<String> },
}

async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(namespace) = pod.namespace() else {
        return Ok(Action::await_change());
    };

    let labels = pod.labels();
    let comp_name = labels.get(LABEL_COMPOSITION_NAME).cloned();
    let comp_namespace = labels.get(LABEL_COMPOSITION_NAMESPACE).cloned();
    let pod_uuid = labels.get(LABEL_SYNTHESIS_UUID).cloned();

    // A synthesizer pod always carries the full label set; anything missing
    // one in our namespace is a leftover from a crashed create and is
    // force-deleted outright.
    let (Some(comp_name), Some(comp_namespace), Some(pod_uuid)) = (comp_name, comp_namespace, pod_uuid)
    else {
        force_delete_pod(&ctx.client, &namespace, &pod).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    };

    let compositions: Api<Composition> = Api::namespaced(ctx.client.clone(), &comp_namespace);
    let composition = compositions.get_opt(&comp_name).await?;

    let synthesizer_deleted = match &composition {
        Some(composition) => {
            let synthesizers: Api<Synthesizer> = Api::namespaced(ctx.client.clone(), &comp_namespace);
            synthesizers.get_opt(&composition.spec.synthesizer.name).await?.is_none()
        }
        None => false,
    };

    let disposition = determine_disposition(&pod, composition.as_ref(), &pod_uuid, synthesizer_deleted);

    match disposition {
        Disposition::Keep => Ok(Action::requeue(Duration::from_secs(30))),
        Disposition::Requeue(d) => Ok(Action::requeue(d)),
        Disposition::Delete { reason, error } => {
            if let (Some(error), Some(composition)) = (&error, &composition) {
                record_result(&ctx.client, composition, error.clone()).await?;
            }
            delete_pod(&ctx.client, &namespace, &pod, reason).await?;
            Ok(Action::requeue(Duration::from_secs(1)))
        }
    }
}

fn determine_disposition(
    pod: &Pod,
    composition: Option<&Composition>,
    pod_uuid: &str,
    synthesizer_deleted: bool,
) -> Disposition {
    let Some(composition) = composition else {
        return Disposition::Delete { reason: "OwnerDeleted", error: None };
    };
    if composition.metadata.deletion_timestamp.is_some() {
        return Disposition::Delete { reason: "OwnerDeleted", error: None };
    }

    if synthesizer_deleted {
        return Disposition::Delete { reason: "SynthesizerDeleted", error: None };
    }

    let age = pod
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| Utc::now().signed_duration_since(t.0))
        .unwrap_or_default();
    if age < chrono::Duration::seconds(1) {
        return Disposition::Requeue(Duration::from_secs(1));
    }

    if let Some(reason) = image_pull_error(pod) {
        return Disposition::Delete {
            reason: "ImagePullError",
            error: Some(reason),
        };
    }

    let scheduled = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "PodScheduled" && c.status == "True");
    let has_container_status = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|c| !c.is_empty())
        .unwrap_or(false);
    if scheduled && !has_container_status && age > chrono::Duration::minutes(2) {
        return Disposition::Delete {
            reason: "ContainerCreationTimeout",
            error: Some("timed out waiting for container status after scheduling".to_string()),
        };
    }

    let Some(status) = &composition.status else {
        return Disposition::Keep;
    };

    if let Some(in_flight) = &status.in_flight_synthesis {
        if in_flight.uuid != pod_uuid {
            return Disposition::Delete { reason: "Superseded", error: None };
        }
        if in_flight.canceled.is_some() {
            return Disposition::Delete { reason: "Timeout", error: None };
        }
        return Disposition::Keep;
    }

    if status
        .current_synthesis
        .as_ref()
        .map(|s| s.uuid == pod_uuid)
        .unwrap_or(false)
    {
        return Disposition::Delete { reason: "Success", error: None };
    }

    Disposition::Requeue(Duration::from_secs(1))
}

fn image_pull_error(pod: &Pod) -> Option<String> {
    const REASONS: [&str; 3] = ["ErrImagePull", "ImagePullBackOff", "InvalidImageName"];
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .find_map(|cs| {
            let waiting = cs.state.as_ref()?.waiting.as_ref()?;
            let reason = waiting.reason.as_deref()?;
            if REASONS.contains(&reason) {
                Some(waiting.message.clone().unwrap_or_else(|| reason.to_string()))
            } else {
                None
            }
        })
}

async fn record_result(client: &Client, composition: &Composition, message: String) -> Result<(), Error> {
    patch_status::<CompositionStatus, Composition>(client.clone(), composition, |s| {
        if let Some(in_flight) = &mut s.in_flight_synthesis {
            in_flight.results.push(ResultEntry {
                severity: ResultSeverity::Error,
                message,
                tags: Default::default(),
            });
        }
    })
    .await?;
    Ok(())
}

async fn force_delete_pod(client: &Client, namespace: &str, pod: &Pod) -> Result<(), Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let name = pod.name_any();
    println!("{}", format!("pod-gc force-deleting unlabeled pod {name}").color(FG2));
    match pods.delete(&name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn delete_pod(client: &Client, namespace: &str, pod: &Pod, reason: &str) -> Result<(), Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let name = pod.name_any();
    println!("{}", format!("pod-gc deleting {name}: {reason}").color(FG2));
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

fn on_error(pod: Arc<Pod>, error: &Error, _ctx: Arc<Context>) -> Action {
    eprintln!("{}", format!("pod-gc error on {}: {error}", pod.name_any()).color(FG2));
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_types::Synthesis;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn pod_with_status(cs: Vec<(&str, Option<&str>)>) -> Pod {
        use k8s_openapi::api::core::v1::{ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus};
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(
                    cs.into_iter()
                        .map(|(name, reason)| ContainerStatus {
                            name: name.to_string(),
                            state: reason.map(|r| ContainerState {
                                waiting: Some(ContainerStateWaiting {
                                    reason: Some(r.to_string()),
                                    message: None,
                                }),
                                ..Default::default()
                            }),
                            ready: false,
                            restart_count: 0,
                            image: String::new(),
                            image_id: String::new(),
                            started: None,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn detects_image_pull_backoff() {
        let pod = pod_with_status(vec![("synthesizer", Some("ImagePullBackOff"))]);
        assert!(image_pull_error(&pod).is_some());
    }

    #[test]
    fn ignores_other_waiting_reasons() {
        let pod = pod_with_status(vec![("synthesizer", Some("ContainerCreating"))]);
        assert!(image_pull_error(&pod).is_none());
    }

    #[test]
    fn deletes_when_owner_composition_gone() {
        let pod = Pod::default();
        assert!(matches!(
            determine_disposition(&pod, None, "u1", false),
            Disposition::Delete { reason: "OwnerDeleted", .. }
        ));
    }

    #[test]
    fn deletes_when_synthesizer_gone() {
        let mut composition = Composition::new("c1", Default::default());
        composition.status = Some(CompositionStatus {
            current_synthesis: Some(Synthesis::new("u1".into(), Time(Utc::now()))),
            ..Default::default()
        });
        let mut pod = Pod::default();
        pod.metadata.creation_timestamp = Some(Time(Utc::now() - chrono::Duration::seconds(10)));
        assert!(matches!(
            determine_disposition(&pod, Some(&composition), "u1", true),
            Disposition::Delete { reason: "SynthesizerDeleted", .. }
        ));
    }

    #[test]
    fn deletes_on_uuid_mismatch() {
        let mut syn = Synthesis::new("other".into(), Time(Utc::now()));
        syn.pod_creation = Some(Time(Utc::now() - chrono::Duration::seconds(10)));
        let composition = Composition::new(
            "c1",
            Default::default(),
        );
        let mut composition = composition;
        composition.status = Some(CompositionStatus {
            in_flight_synthesis: Some(syn),
            ..Default::default()
        });
        let mut pod = Pod::default();
        pod.metadata.creation_timestamp = Some(Time(Utc::now() - chrono::Duration::seconds(10)));
        assert!(matches!(
            determine_disposition(&pod, Some(&composition), "u1", false),
            Disposition::Delete { reason: "Superseded", .. }
        ));
    }
}
