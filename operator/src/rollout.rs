//! Rollout controller (component I): advances `spec.synthesizer.minGeneration`
//! on compositions toward a synthesizer's current generation, one composition
//! per pass, honoring `rolloutCooldown`.

use crate::util::{Error, colors::FG2, patch::patch_status};
use chrono::Utc;
use eno_types::{Composition, Synthesizer, SynthesizerStatus};
use futures::stream::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    Api, Client, ResourceExt,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;

struct Context {
    client: Client,
}

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "starting rollout controller".green());
    let context = Arc::new(Context { client: client.clone() });
    let synthesizers: Api<Synthesizer> = Api::all(client.clone());
    Controller::new(synthesizers, Default::default())
        .watches(
            Api::<Composition>::all(client),
            Default::default(),
            |composition: Composition| {
                let Some(namespace) = composition.namespace() else {
                    return vec![];
                };
                vec![
                    kube::runtime::reflector::ObjectRef::new(&composition.spec.synthesizer.name)
                        .within(&namespace),
                ]
            },
        )
        .run(reconcile, on_error, context)
        .for_each(|_| async {})
        .await;
    Ok(())
}

async fn reconcile(synthesizer: Arc<Synthesizer>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = synthesizer
        .namespace()
        .ok_or_else(|| Error::UserInput("Synthesizer must be namespaced".to_string()))?;
    let name = synthesizer.name_any();
    let generation = synthesizer.metadata.generation.unwrap_or(0);
    let status = synthesizer.status.clone().unwrap_or_default();
    let cooldown = parse_duration::parse(&synthesizer.spec.rollout_cooldown)?;

    if status.current_generation == generation {
        return Ok(Action::requeue(Duration::from_secs(60)));
    }

    if let Some(last) = &status.last_rollout_time {
        let elapsed = Utc::now().signed_duration_since(last.0);
        if elapsed.to_std().unwrap_or_default() < cooldown {
            let remaining = cooldown - elapsed.to_std().unwrap_or_default();
            return Ok(Action::requeue(remaining));
        }
    }

    let compositions: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut candidates = compositions
        .list(&Default::default())
        .await?
        .items
        .into_iter()
        .filter(|c| c.spec.synthesizer.name == name)
        .collect::<Vec<_>>();
    candidates.shuffle(&mut rand::rng());

    let Some(chosen) = candidates.iter().find(|c| eligible(c, generation, cooldown)) else {
        finish_rollout(&ctx.client, &namespace, &name, generation).await?;
        return Ok(Action::requeue(Duration::from_secs(60)));
    };

    advance(&ctx.client, chosen, generation).await?;
    mark_rolled_out(&ctx.client, &namespace, &name).await?;

    Ok(Action::requeue(cooldown))
}

/// A composition is eligible to be advanced toward `synth_generation` unless:
/// its current synthesis is younger than the cooldown, it already requires at
/// least `synth_generation`, it has never synthesized, it's mid-synthesis, or
/// it has already observed the current generation.
fn eligible(composition: &Composition, synth_generation: i64, cooldown: Duration) -> bool {
    if composition.spec.synthesizer.min_generation >= synth_generation {
        return false;
    }
    let Some(status) = &composition.status else {
        return false;
    };
    if status.in_flight_synthesis.is_some() {
        return false;
    }
    let Some(current) = &status.current_synthesis else {
        return false;
    };
    if current.observed_synthesizer_generation >= synth_generation {
        return false;
    }
    let age = current
        .synthesized
        .as_ref()
        .map(|t| Utc::now().signed_duration_since(t.0))
        .unwrap_or_default();
    if age.to_std().unwrap_or_default() < cooldown {
        return false;
    }
    true
}

async fn advance(client: &Client, composition: &Composition, generation: i64) -> Result<(), Error> {
    let namespace = composition.namespace().unwrap();
    let name = composition.name_any();
    let api: Api<Composition> = Api::namespaced(client.clone(), &namespace);
    let patch = kube::api::Patch::Merge(serde_json::json!({
        "spec": { "synthesizer": { "minGeneration": generation } }
    }));
    api.patch(&name, &kube::api::PatchParams::apply(crate::util::MANAGER_NAME), &patch)
        .await?;
    Ok(())
}

async fn mark_rolled_out(client: &Client, namespace: &str, name: &str) -> Result<(), Error> {
    let api: Api<Synthesizer> = Api::namespaced(client.clone(), namespace);
    let current = api.get(name).await?;
    patch_status::<SynthesizerStatus, Synthesizer>(client.clone(), &current, |s| {
        s.last_rollout_time = Some(Time(Utc::now()));
    })
    .await?;
    Ok(())
}

async fn finish_rollout(client: &Client, namespace: &str, name: &str, generation: i64) -> Result<(), Error> {
    let api: Api<Synthesizer> = Api::namespaced(client.clone(), namespace);
    let current = api.get(name).await?;
    if current.status.as_ref().map(|s| s.current_generation) == Some(generation) {
        return Ok(());
    }
    patch_status::<SynthesizerStatus, Synthesizer>(client.clone(), &current, |s| {
        s.current_generation = generation;
    })
    .await?;
    Ok(())
}

fn on_error(synthesizer: Arc<Synthesizer>, error: &Error, _ctx: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!("rollout error on {}: {error}", synthesizer.name_any()).color(FG2)
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_types::{Composition, CompositionStatus, Synthesis};
    use std::time::Duration as StdDuration;

    fn composition_at(generation: i64, min_generation: i64, synthesized_secs_ago: i64) -> Composition {
        let mut c = Composition::new("c1", Default::default());
        c.spec.synthesizer.min_generation = min_generation;
        let mut syn = Synthesis::new("u1".into(), Time(Utc::now()));
        syn.observed_synthesizer_generation = generation;
        syn.synthesized = Some(Time(Utc::now() - chrono::Duration::seconds(synthesized_secs_ago)));
        c.status = Some(CompositionStatus {
            current_synthesis: Some(syn),
            ..Default::default()
        });
        c
    }

    #[test]
    fn eligible_when_behind_and_settled() {
        let c = composition_at(1, 1, 120);
        assert!(eligible(&c, 2, StdDuration::from_secs(30)));
    }

    #[test]
    fn not_eligible_when_min_generation_already_current() {
        let c = composition_at(1, 2, 120);
        assert!(!eligible(&c, 2, StdDuration::from_secs(30)));
    }

    #[test]
    fn not_eligible_when_too_young() {
        let c = composition_at(1, 1, 1);
        assert!(!eligible(&c, 2, StdDuration::from_secs(30)));
    }

    #[test]
    fn not_eligible_when_in_flight() {
        let mut c = composition_at(1, 1, 120);
        c.status.as_mut().unwrap().in_flight_synthesis = Some(Synthesis::new("u2".into(), Time(Utc::now())));
        assert!(!eligible(&c, 2, StdDuration::from_secs(30)));
    }

    #[test]
    fn not_eligible_when_already_observed_current_generation() {
        let c = composition_at(2, 1, 120);
        assert!(!eligible(&c, 2, StdDuration::from_secs(30)));
    }
}
