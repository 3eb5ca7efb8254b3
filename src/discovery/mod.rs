pub mod service_discovery;

pub use service_discovery::{
    ServiceChangeEvent, ServiceChangeReceiver, ServiceChangeSender, ServiceDiscovery,
    StaticDiscovery, StaticDiscoveryConfig,
};
