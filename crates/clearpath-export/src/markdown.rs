use clearpath_domain::{format_rfc3339, NodeType, TraceNode, SCHEMA_VERSION};
use clearpath_trace::{owning_boundary, TraceSource, VerifyResult};
use time::UtcOffset;

/// Renders the audit view of `source` under an already computed `result`.
#[must_use]
pub fn render_markdown<S: TraceSource + ?Sized>(source: &S, result: &VerifyResult) -> String {
    let header = source.header();
    let created_at =
        format_rfc3339(header.created_at).unwrap_or_else(|_| header.created_at.to_string());

    let mut lines = vec![
        format!("# Decision Trace: {}", header.context),
        format!("**Agent:** {}", header.agent_id),
        format!("**Created:** {created_at}"),
        format!("**Schema:** {SCHEMA_VERSION}"),
        format!("**Verification:** {}", verification_banner(result)),
        String::new(),
        "## Trace".to_string(),
        String::new(),
    ];

    for node in source.nodes() {
        lines.push(format!(
            "### [{}] {}",
            node.node_type,
            clock_time(node)
        ));
        push_body(&mut lines, node);
        if !node.evidence.is_empty() {
            let evidence = node
                .evidence
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>();
            lines.push(format!("*Evidence: {}*", evidence.join(", ")));
        }
        if let Some(boundary) = owning_boundary(node.id, source.boundaries()) {
            lines.push(format!("*Trust boundary: {}*", boundary.name));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

/// Verifies `source` and renders it.
#[must_use]
pub fn render_trace_markdown<S: TraceSource + ?Sized>(source: &S) -> String {
    render_markdown(source, &source.verify())
}

fn verification_banner(result: &VerifyResult) -> String {
    if result.valid {
        return "✅ Valid".to_string();
    }
    match (&result.error, result.broken_at) {
        (Some(error), Some(node_id)) => format!("❌ Invalid ({error} at {node_id})"),
        (Some(error), None) => format!("❌ Invalid ({error})"),
        (None, Some(node_id)) => format!("❌ Invalid (at {node_id})"),
        (None, None) => "❌ Invalid".to_string(),
    }
}

fn clock_time(node: &TraceNode) -> String {
    let utc = node.timestamp.to_offset(UtcOffset::UTC);
    format!("{:02}:{:02}:{:02}", utc.hour(), utc.minute(), utc.second())
}

fn push_body(lines: &mut Vec<String>, node: &TraceNode) {
    if node.node_type != NodeType::Decide {
        lines.push(node.content.clone());
        return;
    }

    lines.push(format!("**Decision:** {}", node.content));
    if let Some(decision) = node.decision() {
        if !decision.alternatives.is_empty() {
            lines.push(format!(
                "**Alternatives considered:** {}",
                decision.alternatives.join(", ")
            ));
        }
        if !decision.reasoning.is_empty() {
            lines.push(format!("**Reasoning:** {}", decision.reasoning));
        }
    }
}
