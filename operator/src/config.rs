use clap::Parser;

/// Process-wide operational configuration, parsed once in `main` and shared
/// (behind an `Arc`) with every controller's context.
#[derive(Parser, Debug, Clone)]
#[command(name = "eno-operator", about = "Kubernetes-native configuration synthesis operator")]
pub struct OperatorConfig {
    /// Namespace synthesizer pods are created in.
    #[arg(long, env = "POD_NAMESPACE", default_value = "eno-system")]
    pub namespace: String,

    /// Service account synthesizer pods run as.
    #[arg(long, env = "POD_SERVICE_ACCOUNT", default_value = "eno-executor")]
    pub service_account: String,

    /// Image used to run the executor sidecar, when one is needed instead of
    /// the synthesizer's own image.
    #[arg(long, env = "EXECUTOR_IMAGE", default_value = "")]
    pub executor_image: String,

    #[arg(long, env = "NODE_AFFINITY_KEY", default_value = "")]
    pub node_affinity_key: String,

    #[arg(long, env = "NODE_AFFINITY_VALUE", default_value = "")]
    pub node_affinity_value: String,

    #[arg(long, env = "TAINT_TOLERATION_KEY", default_value = "")]
    pub taint_toleration_key: String,

    #[arg(long, env = "TAINT_TOLERATION_VALUE", default_value = "")]
    pub taint_toleration_value: String,

    /// Token-bucket rate, in slices/sec, for ResourceSlice creation and
    /// status-write-buffer flushes.
    #[arg(long, env = "SLICE_CREATION_QPS", default_value_t = 20.0)]
    pub slice_creation_qps: f64,

    /// Frequency, in lines/sec, the status logger caps itself to.
    #[arg(long, env = "STATUS_LOGGER_FREQUENCY", default_value_t = 50.0)]
    pub status_logger_frequency: f64,
}

impl OperatorConfig {
    pub fn node_affinity(&self) -> Option<(&str, &str)> {
        if self.node_affinity_key.is_empty() {
            None
        } else {
            Some((&self.node_affinity_key, &self.node_affinity_value))
        }
    }

    pub fn taint_toleration(&self) -> Option<(&str, &str)> {
        if self.taint_toleration_key.is_empty() {
            None
        } else {
            Some((&self.taint_toleration_key, &self.taint_toleration_value))
        }
    }
}
