//! CompositionSet expander (component J): ensures exactly one child
//! `Composition` per listed synthesizer ref, propagating spec changes and
//! tearing down children whose synthesizer has left the set.
//!
//! Lower priority than the seven core loops (see `SPEC_FULL.md` §1), but
//! spec.md's own body gives it a complete algorithm, so it ships alongside
//! them rather than staying an external collaborator.

use crate::util::{Error, colors::FG2, hash_spec};
use eno_common::annotations::SPEC_HASH;
use eno_types::{Composition, CompositionSet, CompositionSpec, SynthesizerRef};
use futures::stream::StreamExt;
use kube::{
    Api, Client, ResourceExt,
    api::{ObjectMeta, Patch, PatchParams},
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const LABEL_OWNER: &str = "eno.azure.io/composition-set";

struct Context {
    client: Client,
}

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "starting compositionset controller".green());
    let context = Arc::new(Context { client: client.clone() });
    let sets: Api<CompositionSet> = Api::all(client.clone());
    Controller::new(sets, Default::default())
        .owns(Api::<Composition>::all(client), Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_| async {})
        .await;
    Ok(())
}

async fn reconcile(set: Arc<CompositionSet>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = set
        .namespace()
        .ok_or_else(|| Error::UserInput("CompositionSet must be namespaced".to_string()))?;
    let name = set.name_any();

    if set.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let compositions: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);
    let lp = kube::api::ListParams::default().labels(&format!("{LABEL_OWNER}={name}"));
    let children = compositions.list(&lp).await?.items;

    let plan = build_plan(&set, &children);

    for stale in plan.delete {
        if stale.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let stale_name = stale.name_any();
        match compositions.delete(&stale_name, &Default::default()).await {
            Ok(_) | Err(kube::Error::Api(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    for synth_ref in &plan.create {
        create_child(&compositions, &set, &namespace, &name, synth_ref).await?;
    }

    for (existing, desired_spec, desired_hash) in plan.update {
        update_child(&compositions, &existing, &desired_spec, &desired_hash).await?;
    }

    Ok(Action::requeue(Duration::from_secs(30)))
}

struct Plan<'a> {
    create: Vec<&'a SynthesizerRef>,
    update: Vec<(Composition, CompositionSpec, String)>,
    delete: Vec<Composition>,
}

/// Computes which children to create, update, or delete to bring `children`
/// in line with `set.spec.synthesizers`. Duplicates for the same synthesizer
/// ref are resolved by keeping the oldest (by creation timestamp, ties broken
/// by name) and deleting the rest.
fn build_plan<'a>(set: &'a CompositionSet, children: &[Composition]) -> Plan<'a> {
    let mut by_synth: BTreeMap<&str, Vec<&Composition>> = BTreeMap::new();
    for child in children {
        by_synth.entry(child.spec.synthesizer.name.as_str()).or_default().push(child);
    }

    let mut create = Vec::new();
    let mut update = Vec::new();
    let mut delete = Vec::new();

    let wanted: std::collections::HashSet<&str> =
        set.spec.synthesizers.iter().map(|r| r.name.as_str()).collect();

    for synth_ref in &set.spec.synthesizers {
        let Some(group) = by_synth.get(synth_ref.name.as_str()) else {
            create.push(synth_ref);
            continue;
        };
        let mut sorted = group.clone();
        sorted.sort_by(|a, b| {
            a.metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .cmp(&b.metadata.creation_timestamp.as_ref().map(|t| t.0))
                .then_with(|| a.name_any().cmp(&b.name_any()))
        });
        let (oldest, rest) = sorted.split_first().unwrap();
        delete.extend(rest.iter().map(|c| (*c).clone()));

        let spec = desired_spec(set, synth_ref);
        let desired_hash = hash_spec(&spec);
        if oldest.annotations().get(SPEC_HASH) != Some(&desired_hash) {
            update.push(((*oldest).clone(), spec, desired_hash));
        }
    }

    for child in children {
        if !wanted.contains(child.spec.synthesizer.name.as_str()) {
            delete.push(child.clone());
        }
    }

    Plan { create, update, delete }
}

fn desired_spec(set: &CompositionSet, synth_ref: &SynthesizerRef) -> CompositionSpec {
    CompositionSpec {
        synthesizer: synth_ref.clone(),
        bindings: set.spec.bindings.clone(),
        inputs: Vec::new(),
        synthesis_env: Vec::new(),
    }
}

fn child_name(set_name: &str, synth_ref: &SynthesizerRef) -> String {
    format!("{set_name}-{}", synth_ref.name)
}

async fn create_child(
    compositions: &Api<Composition>,
    set: &CompositionSet,
    namespace: &str,
    set_name: &str,
    synth_ref: &SynthesizerRef,
) -> Result<(), Error> {
    let spec = desired_spec(set, synth_ref);
    let hash = hash_spec(&spec);
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_OWNER.to_string(), set_name.to_string());
    let mut annotations = BTreeMap::new();
    annotations.insert(SPEC_HASH.to_string(), hash);

    let composition = Composition {
        metadata: ObjectMeta {
            name: Some(child_name(set_name, synth_ref)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_ref(set)]),
            ..Default::default()
        },
        spec,
        status: None,
    };

    match compositions.create(&Default::default(), &composition).await {
        Ok(_) | Err(kube::Error::Api(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn update_child(
    compositions: &Api<Composition>,
    existing: &Composition,
    desired_spec: &CompositionSpec,
    desired_hash: &str,
) -> Result<(), Error> {
    let name = existing.name_any();
    let patch = Patch::Merge(serde_json::json!({
        "spec": desired_spec,
        "metadata": { "annotations": { SPEC_HASH: desired_hash } }
    }));
    compositions
        .patch(&name, &PatchParams::apply(crate::util::MANAGER_NAME), &patch)
        .await?;
    Ok(())
}

fn owner_ref(set: &CompositionSet) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
    k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
        api_version: "eno.azure.io/v1".to_string(),
        kind: "CompositionSet".to_string(),
        name: set.name_any(),
        uid: set.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn on_error(set: Arc<CompositionSet>, error: &Error, _ctx: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!("compositionset error on {}: {error}", set.name_any()).color(FG2)
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn synth_ref(name: &str) -> SynthesizerRef {
        SynthesizerRef { name: name.to_string(), min_generation: 0, label_selector: None }
    }

    fn child(synth_name: &str, created_secs_ago: i64, suffix: &str) -> Composition {
        let mut c = Composition::new(&format!("cs-{synth_name}{suffix}"), Default::default());
        c.spec.synthesizer = synth_ref(synth_name);
        c.metadata.creation_timestamp = Some(Time(
            chrono::Utc::now() - chrono::Duration::seconds(created_secs_ago),
        ));
        c
    }

    fn set_with(synths: Vec<&str>) -> CompositionSet {
        let mut s = CompositionSet::new("cs", Default::default());
        s.spec.synthesizers = synths.into_iter().map(synth_ref).collect();
        s
    }

    #[test]
    fn creates_missing_children() {
        let set = set_with(vec!["s1"]);
        let plan = build_plan(&set, &[]);
        assert_eq!(plan.create.len(), 1);
        assert_eq!(plan.create[0].name, "s1");
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn deletes_children_whose_synthesizer_left_the_set() {
        let set = set_with(vec!["s1"]);
        let children = vec![child("s1", 100, ""), child("s2", 100, "")];
        let plan = build_plan(&set, &children);
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.delete[0].spec.synthesizer.name, "s2");
    }

    #[test]
    fn duplicate_children_keep_oldest_delete_rest() {
        let set = set_with(vec!["s1"]);
        let children = vec![child("s1", 10, "-new"), child("s1", 1000, "-old")];
        let plan = build_plan(&set, &children);
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.delete[0].name_any(), "cs-s1-new");
    }

    #[test]
    fn no_changes_when_up_to_date() {
        let set = set_with(vec!["s1"]);
        let mut c = child("s1", 100, "");
        let spec = desired_spec(&set, &synth_ref("s1"));
        c.metadata.annotations = Some(
            [(SPEC_HASH.to_string(), hash_spec(&spec))]
                .into_iter()
                .collect(),
        );
        let plan = build_plan(&set, &[c]);
        assert!(plan.create.is_empty());
        assert!(plan.update.is_empty());
        assert!(plan.delete.is_empty());
    }
}
