//! `check` subcommand: validate a flow file without connecting to anything

use anyhow::Result;
use clap::Args;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::config::{sanitize, FlowConfig};

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Flow file (YAML) describing endpoints and nodes
    #[arg(long, short)]
    pub flow: PathBuf,
}

/// Human readable summary of a validated flow. Passwords are masked.
pub fn summarize(flow: &FlowConfig) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Endpoints ({}):", flow.endpoints.len());
    for (name, raw) in &flow.endpoints {
        let _ = writeln!(out, "  {:<16} {}", name, sanitize(raw));
    }

    let _ = writeln!(out, "Nodes ({}):", flow.nodes.len());
    for node in &flow.nodes {
        let _ = writeln!(
            out,
            "  {:<16} {:<10} -> {}",
            node.name(),
            node.kind(),
            node.server()
        );
    }

    out
}

impl CheckArgs {
    pub fn execute(&self) -> Result<()> {
        let flow = FlowConfig::from_yaml_file(&self.flow)?;
        flow.validate()?;

        print!("{}", summarize(&flow));
        println!("Flow {} is valid", self.flow.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FLOW: &str = r#"
endpoints:
  secured:
    host: redis.internal
    port: "6380"
    pass: hunter2
nodes:
  - {type: publisher, name: out, server: secured, channel: events}
"#;

    #[test]
    fn test_summary_masks_password() {
        let flow = FlowConfig::from_yaml_str(FLOW).unwrap();
        let summary = summarize(&flow);

        assert!(summary.contains("redis.internal:6380"));
        assert!(summary.contains("publisher"));
        assert!(!summary.contains("hunter2"));
    }

    #[test]
    fn test_execute_rejects_invalid_flow() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "endpoints: {{}}\nnodes:\n  - {{type: lookup, name: l, server: nowhere, hash: h, key: k}}\n"
        )
        .unwrap();

        let args = CheckArgs {
            flow: file.path().to_path_buf(),
        };
        assert!(args.execute().is_err());
    }
}
