//! Configuration: bridge settings, flow definitions and endpoint sanitizing

pub mod flow;
pub mod sanitize;
pub mod settings;

pub use flow::{FlowConfig, NodeConfig};
pub use sanitize::{sanitize, EndpointConfig, RawEndpointConfig};
pub use settings::{BridgeConfig, StoreBackend, StoreConfig};
