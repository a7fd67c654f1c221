use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single reference from a synthesizer to an input resource, matched to a
/// [`Binding`] by `key`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Ref {
    pub key: String,
    pub resource: String,
}

/// Maps a synthesizer's input key to a concrete resource name/namespace.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Binding {
    pub key: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SynthesizerRef {
    pub name: String,
    #[serde(default)]
    pub min_generation: i64,
    #[serde(default)]
    pub label_selector: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct InputRevision {
    pub key: String,
    pub resource_version: String,
    #[serde(default)]
    pub revision: Option<i64>,
    #[serde(default)]
    pub synthesizer_generation: Option<i64>,
    #[serde(default)]
    pub composition_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResultEntry {
    pub severity: ResultSeverity,
    pub message: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ResultSeverity {
    Info,
    Warning,
    Error,
}

impl Default for ResultSeverity {
    fn default() -> Self {
        Self::Info
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SliceRef {
    pub name: String,
}

/// One attempt at synthesizing a composition's output.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Synthesis {
    pub uuid: String,
    #[serde(default)]
    pub observed_composition_generation: i64,
    #[serde(default)]
    pub observed_synthesizer_generation: i64,
    #[serde(default)]
    pub initialized: Option<Time>,
    #[serde(default)]
    pub pod_creation: Option<Time>,
    #[serde(default)]
    pub synthesized: Option<Time>,
    #[serde(default)]
    pub reconciled: Option<Time>,
    #[serde(default)]
    pub ready: Option<Time>,
    #[serde(default)]
    pub canceled: Option<Time>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub results: Vec<ResultEntry>,
    #[serde(default)]
    pub resource_slices: Vec<SliceRef>,
}

impl Synthesis {
    pub fn new(uuid: String, now: Time) -> Self {
        Self {
            uuid,
            initialized: Some(now),
            ..Default::default()
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Simplified {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub resolved_synth_name: Option<String>,
}

// ---------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "Composition",
    plural = "compositions",
    derive = "PartialEq",
    status = "CompositionStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.simplified.status\", \"name\": \"STATUS\", \"type\": \"string\" }"
)]
pub struct CompositionSpec {
    pub synthesizer: SynthesizerRef,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub inputs: Vec<serde_json::Value>,
    #[serde(default)]
    pub synthesis_env: Vec<EnvVar>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CompositionStatus {
    #[serde(default)]
    pub current_synthesis: Option<Synthesis>,
    #[serde(default)]
    pub previous_synthesis: Option<Synthesis>,
    #[serde(default)]
    pub in_flight_synthesis: Option<Synthesis>,
    #[serde(default)]
    pub input_revisions: Vec<InputRevision>,
    #[serde(default)]
    pub simplified: Simplified,
}

// ---------------------------------------------------------------------
// Synthesizer
// ---------------------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "Synthesizer",
    plural = "synthesizers",
    derive = "PartialEq",
    status = "SynthesizerStatus",
    namespaced
)]
#[kube(derive = "Default")]
pub struct SynthesizerSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    /// Duration string, e.g. "2m". Parsed with `parse_duration`.
    #[serde(default = "default_pod_timeout")]
    pub pod_timeout: String,
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout: String,
    #[serde(default = "default_rollout_cooldown")]
    pub rollout_cooldown: String,
    #[serde(default)]
    pub refs: Vec<Ref>,
    #[serde(default)]
    pub pod_overrides: Option<serde_json::Value>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

fn default_pod_timeout() -> String {
    "2m".to_string()
}

fn default_exec_timeout() -> String {
    "15s".to_string()
}

fn default_rollout_cooldown() -> String {
    "30s".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SynthesizerStatus {
    #[serde(default)]
    pub current_generation: i64,
    #[serde(default)]
    pub last_rollout_time: Option<Time>,
}

// ---------------------------------------------------------------------
// ResourceSlice
// ---------------------------------------------------------------------

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResourceSliceItem {
    /// JSON-encoded manifest.
    pub manifest: String,
    #[serde(default)]
    pub deleted: bool,
    /// Duration string, e.g. "30s".
    #[serde(default)]
    pub reconcile_interval: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "ResourceSlice",
    plural = "resourceslices",
    derive = "PartialEq",
    status = "ResourceSliceStatus",
    namespaced
)]
#[kube(derive = "Default")]
pub struct ResourceSliceSpec {
    #[serde(default)]
    pub composition_generation: i64,
    pub synthesis_uuid: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub resources: Vec<ResourceSliceItem>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResourceState {
    #[serde(default)]
    pub reconciled: bool,
    #[serde(default)]
    pub ready: Option<Time>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub reconciliation_error: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResourceSliceStatus {
    #[serde(default)]
    pub resources: Vec<ResourceState>,
}

// ---------------------------------------------------------------------
// CompositionSet / Symphony
// ---------------------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "CompositionSet",
    plural = "compositionsets",
    derive = "PartialEq",
    status = "CompositionSetStatus",
    namespaced
)]
#[kube(derive = "Default")]
pub struct CompositionSetSpec {
    #[serde(default)]
    pub synthesizers: Vec<SynthesizerRef>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CompositionSetStatus {
    #[serde(default)]
    pub observed_generation: i64,
}

/// Shares `CompositionSetSpec`'s shape; kept distinct at the API level for
/// wire compatibility with callers that address it by its own kind, but the
/// expander in `eno-operator` treats both kinds generically.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "Symphony",
    plural = "symphonies",
    derive = "PartialEq",
    status = "CompositionSetStatus",
    namespaced
)]
#[kube(derive = "Default")]
pub struct SymphonySpec {
    #[serde(default)]
    pub synthesizers: Vec<SynthesizerRef>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

// ---------------------------------------------------------------------
// Pod exec wire types (not CRDs — see eno-operator::exec)
// ---------------------------------------------------------------------

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct InputResourceRef {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct InputWrapper {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub key: String,
    pub resource: InputResourceRef,
}

impl InputWrapper {
    pub fn new(key: String, resource: InputResourceRef) -> Self {
        Self {
            api_version: "eno.azure.io/v1".to_string(),
            kind: "Input".to_string(),
            key,
            resource,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResourceList {
    #[serde(rename = "apiVersion", default = "resource_list_api_version")]
    pub api_version: String,
    #[serde(default = "resource_list_kind")]
    pub kind: String,
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
}

fn resource_list_api_version() -> String {
    "config.kubernetes.io/v1".to_string()
}

fn resource_list_kind() -> String {
    "ResourceList".to_string()
}

impl ResourceList {
    pub fn new(items: Vec<serde_json::Value>) -> Self {
        Self {
            api_version: resource_list_api_version(),
            kind: resource_list_kind(),
            items,
        }
    }
}
