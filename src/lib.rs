//! Redis Flow Bridge - shared Redis connections for flow-based message nodes
//!
//! Nodes subscribe to channels, publish to channels, and enrich messages with
//! hash lookups. Connections to the store are pooled per endpoint and scope,
//! reference counted, and torn down when the last node lets go.

pub mod cli;
pub mod config;
pub mod error;
pub mod flow;
pub mod logging;
pub mod models;
pub mod nodes;
pub mod pool;
pub mod store;

// Re-export commonly used items
pub use config::settings::BridgeConfig;
pub use config::{sanitize, EndpointConfig, FlowConfig, RawEndpointConfig};
pub use error::{Error, Result};
pub use flow::{Flow, InboundMessage};
pub use logging::{init_logger_with_config, log_debug, log_error, log_info, log_warning};
pub use models::{FlowMessage, NodeEvent, NodeEventKind, NodeStatus};
pub use pool::{ConnectionIdentity, ConnectionPool, SharedConnection};

/// Runtime utilities for creating single-threaded vs multi-threaded Tokio runtimes
pub mod runtime {
    use crate::config::settings::RuntimeConfig;
    use anyhow::{Context, Result};
    use tokio::runtime::{Builder, Runtime};

    /// Create a Tokio runtime based on the configuration
    pub fn create_runtime(config: &RuntimeConfig) -> Result<Runtime> {
        match config.mode.as_str() {
            "single_threaded" => {
                tracing::debug!("Initializing single-threaded runtime");
                Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("Failed to create single-threaded runtime")
            }
            "multi_threaded" => {
                let mut builder = Builder::new_multi_thread();
                builder.enable_all();

                match config.worker_threads {
                    Some(threads) if threads > 0 => {
                        tracing::debug!(
                            "Initializing multi-threaded runtime with {} worker threads",
                            threads
                        );
                        builder.worker_threads(threads);
                    }
                    _ => {
                        tracing::debug!(
                            "Initializing multi-threaded runtime with auto-detected CPU cores"
                        );
                    }
                }

                builder
                    .build()
                    .context("Failed to create multi-threaded runtime")
            }
            _ => {
                tracing::warn!(
                    "Unknown runtime mode '{}', defaulting to single-threaded",
                    config.mode
                );
                Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("Failed to create default single-threaded runtime")
            }
        }
    }

    /// Execute an async function with the configured runtime
    pub fn run_with_runtime<F, T>(config: &RuntimeConfig, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let runtime = create_runtime(config)?;
        runtime.block_on(future)
    }

}
