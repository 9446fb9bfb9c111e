//! The `cap` command surface.
//!
//! [`run_cli`] executes a parsed [`Cli`]; [`build_trace`] turns a
//! [`TraceScript`] into a trace through the typed append operations, so
//! scripted traces are held to the same rules as programmatic ones.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use clearpath_domain::{DecisionMeta, NodeId, NodeType};
use clearpath_export::{
    export_json, export_json_pretty, export_record_json, import_json, render_trace_markdown,
};
use clearpath_trace::{assemble_record, Trace, TraceBuilder, TraceSource};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cap")]
#[command(about = "Clearpath Audit Protocol (CAP-1.0) trace tool")]
pub struct Cli {
    /// Tracing filter directives; falls back to `RUST_LOG`, then `warn`.
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_filter(&self) -> Option<&str> {
        self.log_filter.as_deref()
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build a trace from a JSON step script.
    Build(BuildArgs),
    /// Verify an exported trace; exits non-zero when it is invalid.
    Verify(InputArgs),
    /// Render an exported trace as markdown.
    Render(InputArgs),
    /// Assemble a decision record from an exported trace.
    Record(RecordArgs),
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    #[arg(long)]
    script: PathBuf,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Args)]
pub struct InputArgs {
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    outcome: Option<String>,
}

/// A scripted trace: steps are appended in order, then boundaries registered.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceScript {
    pub agent_id: String,
    pub context: String,
    #[serde(default)]
    pub steps: Vec<ScriptStep>,
    #[serde(default)]
    pub boundaries: Vec<ScriptBoundary>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptStep {
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub content: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptBoundary {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<String>,
}

/// Installs a stderr subscriber so stdout stays machine-readable.
pub fn init_tracing(filter: Option<&str>) {
    let env_filter = match filter {
        Some(directives) => EnvFilter::try_new(directives).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .unwrap_or_else(|| EnvFilter::new("warn"));

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Executes a parsed `cap` command.
///
/// # Errors
/// Returns an error when an input file cannot be read or imported, when a
/// script is rejected, or when `verify` finds the trace invalid.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Build(args) => run_build(&args),
        Command::Verify(args) => {
            let trace = read_trace(&args.input)?;
            let result = trace.verify();
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.valid {
                return Err(anyhow!(
                    "trace verification failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                ));
            }
            Ok(())
        }
        Command::Render(args) => {
            let trace = read_trace(&args.input)?;
            println!("{}", render_trace_markdown(&trace));
            Ok(())
        }
        Command::Record(args) => {
            let trace = read_trace(&args.input)?;
            let record = assemble_record(&trace, args.outcome.as_deref());
            println!("{}", export_record_json(&record)?);
            Ok(())
        }
    }
}

fn run_build(args: &BuildArgs) -> Result<()> {
    let body = fs::read_to_string(&args.script)
        .with_context(|| format!("failed reading script {}", args.script.display()))?;
    let script = serde_json::from_str::<TraceScript>(&body)
        .with_context(|| format!("failed parsing script {}", args.script.display()))?;
    let builder = build_trace(&script)?;

    let exported = if args.pretty {
        export_json_pretty(&builder)?
    } else {
        export_json(&builder)?
    };

    match &args.output {
        Some(path) => {
            fs::write(path, &exported)
                .with_context(|| format!("failed writing trace to {}", path.display()))?;
            tracing::info!(path = %path.display(), nodes = builder.nodes().len(), "trace written");
            let summary = serde_json::json!({
                "output": path.display().to_string(),
                "nodes": builder.nodes().len(),
                "valid": builder.verify().valid,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        None => println!("{exported}"),
    }
    Ok(())
}

/// Appends every scripted step, then registers every scripted boundary.
///
/// # Errors
/// Returns an error for a repeated or unknown label, decision fields on a
/// non-`DECIDE` step, or any append or boundary rejection from the builder.
pub fn build_trace(script: &TraceScript) -> Result<TraceBuilder> {
    let mut builder = TraceBuilder::new(script.agent_id.clone(), script.context.clone());
    let mut labels = BTreeMap::<&str, NodeId>::new();

    for step in &script.steps {
        if labels.contains_key(step.label.as_str()) {
            bail!("step label {} is used more than once", step.label);
        }
        let node_type = step
            .node_type
            .parse::<NodeType>()
            .with_context(|| format!("step {}", step.label))?;
        let evidence = resolve_labels(&labels, &step.evidence)
            .with_context(|| format!("step {}", step.label))?;

        let has_decision_fields = !step.alternatives.is_empty() || step.reasoning.is_some();
        if has_decision_fields && node_type != NodeType::Decide {
            bail!(
                "step {}: alternatives and reasoning only apply to DECIDE steps",
                step.label
            );
        }

        let content = step.content.clone();
        let node = match node_type {
            NodeType::Decide => {
                let decision = DecisionMeta::new(
                    step.alternatives.clone(),
                    step.reasoning.clone().unwrap_or_default(),
                );
                builder.decide(content, &decision, &evidence, step.confidence)
            }
            NodeType::Derive => builder.derive(content, &evidence, step.confidence),
            NodeType::Observe if evidence.is_empty() => builder.observe(content, step.confidence),
            NodeType::Assume if evidence.is_empty() => builder.assume(content, step.confidence),
            NodeType::Act if evidence.is_empty() => builder.act(content, step.confidence),
            other => builder.append(other, content, &evidence, step.confidence, None),
        }
        .with_context(|| format!("step {}", step.label))?;
        labels.insert(step.label.as_str(), node.id);
    }

    for boundary in &script.boundaries {
        let node_ids = resolve_labels(&labels, &boundary.nodes)
            .with_context(|| format!("boundary {}", boundary.name))?;
        builder
            .set_boundary(
                boundary.name.clone(),
                &node_ids,
                boundary.description.as_deref(),
            )
            .with_context(|| format!("boundary {}", boundary.name))?;
    }

    tracing::info!(
        agent_id = %script.agent_id,
        nodes = builder.nodes().len(),
        boundaries = builder.boundaries().len(),
        "built trace from script"
    );
    Ok(builder)
}

fn resolve_labels(labels: &BTreeMap<&str, NodeId>, wanted: &[String]) -> Result<Vec<NodeId>> {
    wanted
        .iter()
        .map(|label| {
            labels
                .get(label.as_str())
                .copied()
                .ok_or_else(|| anyhow!("unknown step label {label}"))
        })
        .collect()
}

fn read_trace(path: &Path) -> Result<Trace> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed reading trace {}", path.display()))?;
    import_json(&body).with_context(|| format!("failed importing trace {}", path.display()))
}
