//! `run` subcommand: host a flow and bridge it to stdin/stdout

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, FlowConfig};
use crate::flow::{Flow, InboundMessage};
use crate::models::NodeEvent;
use crate::pool::ConnectionPool;
use crate::store::connector_for;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Flow file (YAML) describing endpoints and nodes
    #[arg(long, short)]
    pub flow: PathBuf,

    /// How long to keep reporting events after stdin closes, in milliseconds
    #[arg(long, default_value = "500")]
    pub drain_ms: u64,
}

/// One line of output
#[derive(Serialize)]
struct EventLine<'a> {
    time: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a NodeEvent,
}

fn event_line(event: &NodeEvent, time: DateTime<Utc>) -> serde_json::Result<String> {
    serde_json::to_string(&EventLine { time, event })
}

fn parse_inbound(line: &str) -> Option<InboundMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(inbound) => Some(inbound),
        Err(e) => {
            warn!("Ignoring malformed input line: {}", e);
            None
        }
    }
}

async fn write_event(out: &mut tokio::io::Stdout, event: &NodeEvent) -> Result<()> {
    let mut line = event_line(event, Utc::now())?;
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

impl RunArgs {
    pub async fn execute(&self, config: &BridgeConfig) -> Result<()> {
        let flow_config = FlowConfig::from_yaml_file(&self.flow)?;
        let connector = connector_for(&config.store)?;
        info!(
            "Running flow {} on the {} store",
            self.flow.display(),
            connector.backend_name()
        );

        let pool = Arc::new(ConnectionPool::new(connector));
        let mut flow = Flow::start(&flow_config, pool)
            .await
            .context("Failed to start flow")?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line.context("Failed to read stdin")? {
                        Some(line) => {
                            if let Some(inbound) = parse_inbound(&line) {
                                let node = inbound.node.clone();
                                if let Err(e) = flow.dispatch(inbound).await {
                                    warn!("Input for '{}' rejected: {}", node, e);
                                }
                            }
                        }
                        None => {
                            debug!("stdin closed");
                            break;
                        }
                    }
                }
                Some(event) = flow.next_event() => {
                    write_event(&mut stdout, &event).await?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
            }
        }

        // Let in-flight lookups report before closing the nodes
        let drain = tokio::time::sleep(Duration::from_millis(self.drain_ms));
        tokio::pin!(drain);
        loop {
            tokio::select! {
                Some(event) = flow.next_event() => write_event(&mut stdout, &event).await?,
                _ = &mut drain => break,
            }
        }

        flow.stop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FlowMessage, NodeEventKind, NodeStatus};
    use chrono::TimeZone;
    use serde_json::{json, Value};

    #[test]
    fn test_event_line_shape() {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let event = NodeEvent {
            node: "sub".to_string(),
            kind: NodeEventKind::Message {
                msg: FlowMessage::new(json!({"a": 1})).with_topic("ch1"),
            },
        };

        let line: Value = serde_json::from_str(&event_line(&event, time).unwrap()).unwrap();
        assert_eq!(line["time"], "2024-05-01T12:00:00Z");
        assert_eq!(line["node"], "sub");
        assert_eq!(line["kind"], "message");
        assert_eq!(line["msg"]["payload"], json!({"a": 1}));
        assert_eq!(line["msg"]["topic"], "ch1");

        let status = NodeEvent {
            node: "pub".to_string(),
            kind: NodeEventKind::Status {
                status: NodeStatus::disconnected(),
            },
        };
        let line: Value = serde_json::from_str(&event_line(&status, time).unwrap()).unwrap();
        assert_eq!(line["kind"], "status");
    }

    #[test]
    fn test_parse_inbound() {
        let inbound = parse_inbound(r#"{"node": "pub", "payload": [1, 2]}"#).unwrap();
        assert_eq!(inbound.node, "pub");
        assert_eq!(inbound.msg.payload, json!([1, 2]));

        assert!(parse_inbound("   ").is_none());
        assert!(parse_inbound("not json").is_none());
        assert!(parse_inbound(r#"{"payload": 1}"#).is_none());
    }
}
