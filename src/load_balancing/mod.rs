pub mod balancer;
pub mod instance_metrics;
pub mod metrics_source;
pub mod rotation;

pub use balancer::{
    AdaptiveBalancer, InstanceSelector, InstanceStats, LoadBalancerStats, RankedCandidate,
    Selection,
};
pub use instance_metrics::{InFlightCall, InstanceMetrics, InstanceMetricsConfig};
pub use metrics_source::{FixedMetrics, InstanceMetricsSource, MetricSnapshot, NeutralMetrics};
pub use rotation::{RotationConfig, RotationEntry, RotationHandle, RotationStore};
