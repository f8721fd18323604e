use std::collections::{HashMap, HashSet};

use tracing::debug;

use stepflow_core::error::{FlowError, Result};
use stepflow_core::types::Finding;
use stepflow_core::workflow::{Node, NodeType, Workflow};

use crate::condition::Condition;

/// Knobs that change what counts as a valid workflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    /// Accept a workflow without a `start` node by entering at the first
    /// declared node (reported as a warning instead of an error).
    pub allow_implicit_entry: bool,
}

/// How the run's first node was found.
#[derive(Debug, Clone, Copy)]
pub enum Entry<'a> {
    /// The workflow's single `start` node.
    Start(&'a Node),
    /// No `start` node; the first declared executable node.
    Implicit(&'a Node),
}

impl<'a> Entry<'a> {
    pub fn node(&self) -> &'a Node {
        match self {
            Self::Start(node) | Self::Implicit(node) => node,
        }
    }
}

/// Determine where a run begins.
///
/// The error is the finding explaining why no entry could be chosen.
pub fn resolve_entry<'a>(
    workflow: &'a Workflow,
    options: &ValidateOptions,
) -> std::result::Result<Entry<'a>, Finding> {
    let starts: Vec<&Node> = workflow.start_nodes().collect();
    match starts.as_slice() {
        [single] => Ok(Entry::Start(*single)),
        [_, second, ..] => {
            let ids: Vec<&str> = starts.iter().map(|n| n.id.as_str()).collect();
            Err(Finding::error(
                Some(second.id.clone()),
                format!("multiple start nodes: {}", ids.join(", ")),
            ))
        }
        [] => {
            if !options.allow_implicit_entry {
                return Err(Finding::error(None, "workflow has no start node"));
            }
            workflow
                .nodes()
                .iter()
                .find(|n| n.kind != NodeType::Annotation)
                .map(Entry::Implicit)
                .ok_or_else(|| Finding::error(None, "workflow has no executable nodes"))
        }
    }
}

/// Statically check a workflow. Never mutates it.
///
/// Findings come out grouped by check: references, orphans, node
/// configuration, cycles, entry point.
pub fn validate(workflow: &Workflow, options: &ValidateOptions) -> Vec<Finding> {
    let mut findings = Vec::new();

    check_references(workflow, &mut findings);
    check_orphans(workflow, &mut findings);
    check_config(workflow, &mut findings);

    let entry = resolve_entry(workflow, options);
    check_cycles(workflow, entry.as_ref().ok().map(|e| e.node()), &mut findings);

    match entry {
        Ok(Entry::Implicit(node)) => findings.push(Finding::warning(
            Some(node.id.clone()),
            format!("no start node; entering at first node '{}'", node.id),
        )),
        Ok(Entry::Start(_)) => {}
        Err(finding) => findings.push(finding),
    }

    debug!(
        workflow_id = %workflow.id,
        errors = findings.iter().filter(|f| f.is_error()).count(),
        warnings = findings.iter().filter(|f| !f.is_error()).count(),
        "Workflow validated"
    );
    findings
}

pub fn has_errors(findings: &[Finding]) -> bool {
    findings.iter().any(Finding::is_error)
}

/// Validate and turn error findings into [`FlowError::Validation`].
/// On success the (possibly empty) warnings are returned.
pub fn ensure_valid(workflow: &Workflow, options: &ValidateOptions) -> Result<Vec<Finding>> {
    let findings = validate(workflow, options);
    if has_errors(&findings) {
        Err(FlowError::Validation(findings))
    } else {
        Ok(findings)
    }
}

fn check_references(workflow: &Workflow, findings: &mut Vec<Finding>) {
    for edge in &workflow.edges {
        if !workflow.contains(&edge.from) {
            findings.push(Finding::error(
                Some(edge.from.clone()),
                format!("edge source '{}' does not exist", edge.from),
            ));
        }
        if !workflow.contains(&edge.to) {
            let owner = workflow.contains(&edge.from).then(|| edge.from.clone());
            findings.push(Finding::error(
                owner,
                format!("edge target '{}' does not exist", edge.to),
            ));
        }
    }

    for node in workflow.nodes().iter().filter(|n| n.kind == NodeType::Decision) {
        for (field, target) in [("truePath", node.true_path()), ("falsePath", node.false_path())] {
            if let Some(target) = target {
                if !workflow.contains(target) {
                    findings.push(Finding::error(
                        Some(node.id.clone()),
                        format!("{} target '{}' does not exist", field, target),
                    ));
                }
            }
        }
    }
}

fn check_orphans(workflow: &Workflow, findings: &mut Vec<Finding>) {
    for node in workflow.nodes() {
        if matches!(node.kind, NodeType::Start | NodeType::Annotation) {
            continue;
        }
        if !workflow.has_incoming(&node.id) {
            findings.push(Finding::warning(
                Some(node.id.clone()),
                "node is unreachable (no incoming edge or branch)",
            ));
        }
    }
}

fn check_config(workflow: &Workflow, findings: &mut Vec<Finding>) {
    for node in workflow.nodes() {
        let id = Some(node.id.clone());
        match node.kind {
            NodeType::Action | NodeType::Loop => {
                if node.script().is_none() {
                    findings.push(Finding::error(id.clone(), format!("{} node has no script", node.kind)));
                }
                if node.kind == NodeType::Loop && node.iterations.as_ref().map_or(true, |i| i.is_blank()) {
                    findings.push(Finding::error(id.clone(), "loop node has no iteration count"));
                }
            }
            NodeType::Decision => {
                match node.condition() {
                    None => findings.push(Finding::error(id.clone(), "decision node has no condition")),
                    Some(text) => {
                        if let Err(e) = Condition::parse(text) {
                            findings.push(Finding::warning(
                                id.clone(),
                                format!("condition will not evaluate: {}", e),
                            ));
                        }
                    }
                }
                if node.true_path().is_none() {
                    findings.push(Finding::error(id.clone(), "decision node has no truePath"));
                }
                if node.false_path().is_none() {
                    findings.push(Finding::error(id.clone(), "decision node has no falsePath"));
                }
            }
            NodeType::Start | NodeType::End | NodeType::Delay | NodeType::Annotation => {}
        }

        if matches!(node.kind, NodeType::Decision | NodeType::End | NodeType::Annotation) {
            continue;
        }
        match workflow.outgoing(&node.id).count() {
            0 => findings.push(Finding::warning(
                id,
                "node has no outgoing edge; the run ends here",
            )),
            1 => {}
            n => findings.push(Finding::warning(
                id,
                format!("node has {} outgoing edges; only the first is followed", n),
            )),
        }
    }
}

/// Depth-first search for back-edges. Only a `loop` node may close a
/// cycle; any other back-edge target is reported once.
fn check_cycles(workflow: &Workflow, entry: Option<&Node>, findings: &mut Vec<Finding>) {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        OnStack,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut reported: HashSet<&str> = HashSet::new();

    let roots = entry
        .into_iter()
        .chain(workflow.nodes().iter())
        .map(|n| n.id.as_str());

    for root in roots {
        if marks.contains_key(root) {
            continue;
        }
        // (node, successors, next successor index)
        let mut stack: Vec<(&str, Vec<&str>, usize)> = vec![(root, workflow.successors(root), 0)];
        marks.insert(root, Mark::OnStack);

        while let Some((current, successors, next)) = stack.last_mut() {
            let Some(&target) = successors.get(*next) else {
                marks.insert(*current, Mark::Done);
                stack.pop();
                continue;
            };
            *next += 1;

            let Some(target_node) = workflow.node(target) else {
                continue;
            };
            match marks.get(target) {
                Some(Mark::OnStack) => {
                    if target_node.kind != NodeType::Loop && reported.insert(target) {
                        findings.push(Finding::error(
                            Some(target.to_string()),
                            format!(
                                "cycle through '{}' is not mediated by a loop node",
                                target
                            ),
                        ));
                    }
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(target, Mark::OnStack);
                    stack.push((target, workflow.successors(target), 0));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::types::Severity;
    use stepflow_core::workflow::Iterations;

    fn linear() -> Workflow {
        Workflow::new("wf", "Linear")
            .with_node(Node::start("s"))
            .with_node(Node::action("a", "a.py"))
            .with_node(Node::end("e"))
            .with_edge("s", "a")
            .with_edge("a", "e")
    }

    fn errors(findings: &[Finding]) -> Vec<&Finding> {
        findings.iter().filter(|f| f.is_error()).collect()
    }

    #[test]
    fn test_valid_linear_workflow() {
        let findings = validate(&linear(), &ValidateOptions::default());
        assert!(findings.is_empty(), "{:?}", findings);
        assert!(ensure_valid(&linear(), &ValidateOptions::default()).is_ok());
    }

    #[test]
    fn test_missing_branch_target_is_error_on_decision() {
        let wf = Workflow::new("wf", "Branch")
            .with_node(Node::start("s"))
            .with_node(Node::decision("d", "x > 1", "e", "nowhere"))
            .with_node(Node::end("e"))
            .with_edge("s", "d");
        let findings = validate(&wf, &ValidateOptions::default());
        let errs = errors(&findings);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].node_id.as_deref(), Some("d"));
        assert!(errs[0].message.contains("nowhere"));
    }

    #[test]
    fn test_missing_edge_endpoint() {
        let wf = linear().with_edge("e", "ghost");
        let findings = validate(&wf, &ValidateOptions::default());
        assert!(findings
            .iter()
            .any(|f| f.is_error() && f.message.contains("'ghost'") && f.node_id.as_deref() == Some("e")));
    }

    #[test]
    fn test_orphan_is_warning() {
        let mut wf = linear();
        wf.add_node(Node::action("lonely", "x.py")).unwrap();
        wf.edges.push(stepflow_core::workflow::Edge::new("lonely", "e"));
        let findings = validate(&wf, &ValidateOptions::default());
        let orphan = findings
            .iter()
            .find(|f| f.node_id.as_deref() == Some("lonely"))
            .unwrap();
        assert_eq!(orphan.severity, Severity::Warning);
        assert!(!has_errors(&findings));
    }

    #[test]
    fn test_annotation_is_not_orphan() {
        let mut wf = linear();
        wf.add_node(Node::new("note", NodeType::Annotation)).unwrap();
        assert!(validate(&wf, &ValidateOptions::default()).is_empty());
    }

    #[test]
    fn test_incomplete_config() {
        let mut bad_loop = Node::new("l", NodeType::Loop);
        bad_loop.iterations = Some(Iterations::Text(" ".into()));
        let mut no_cond = Node::new("d", NodeType::Decision);
        no_cond.true_path = Some("e".into());

        let wf = Workflow::new("wf", "Broken")
            .with_node(Node::start("s"))
            .with_node(Node::new("a", NodeType::Action))
            .with_node(bad_loop)
            .with_node(no_cond)
            .with_node(Node::end("e"))
            .with_edge("s", "a")
            .with_edge("a", "l")
            .with_edge("l", "d");
        let findings = validate(&wf, &ValidateOptions::default());
        let messages: Vec<String> = errors(&findings).iter().map(|f| f.to_string()).collect();

        assert!(messages.contains(&"error [a]: action node has no script".to_string()));
        assert!(messages.contains(&"error [l]: loop node has no script".to_string()));
        assert!(messages.contains(&"error [l]: loop node has no iteration count".to_string()));
        assert!(messages.contains(&"error [d]: decision node has no condition".to_string()));
        assert!(messages.contains(&"error [d]: decision node has no falsePath".to_string()));
        assert!(!messages.iter().any(|m| m.contains("truePath")));
    }

    #[test]
    fn test_unparseable_condition_is_warning() {
        let wf = Workflow::new("wf", "Cond")
            .with_node(Node::start("s"))
            .with_node(Node::decision("d", "x >", "e", "e"))
            .with_node(Node::end("e"))
            .with_edge("s", "d");
        let findings = validate(&wf, &ValidateOptions::default());
        assert!(!has_errors(&findings));
        assert!(findings.iter().any(|f| f.message.starts_with("condition will not evaluate")));
    }

    #[test]
    fn test_cycle_without_loop_is_error_at_cycle_entry() {
        let wf = Workflow::new("wf", "Cycle")
            .with_node(Node::start("s"))
            .with_node(Node::action("a", "a.py"))
            .with_node(Node::action("b", "b.py"))
            .with_node(Node::decision("d", "done", "e", "a"))
            .with_node(Node::end("e"))
            .with_edge("s", "a")
            .with_edge("a", "b")
            .with_edge("b", "d");
        let findings = validate(&wf, &ValidateOptions::default());
        let errs = errors(&findings);
        assert_eq!(errs.len(), 1, "{:?}", findings);
        assert_eq!(errs[0].node_id.as_deref(), Some("a"));
        assert!(errs[0].message.contains("not mediated by a loop node"));
    }

    #[test]
    fn test_cycle_through_loop_node_is_allowed() {
        let wf = Workflow::new("wf", "Retry")
            .with_node(Node::start("s"))
            .with_node(Node::looping("l", "step.py", Iterations::Count(3), "i"))
            .with_node(Node::decision("d", "ok", "e", "l"))
            .with_node(Node::end("e"))
            .with_edge("s", "l")
            .with_edge("l", "d");
        let findings = validate(&wf, &ValidateOptions::default());
        assert!(!has_errors(&findings), "{:?}", findings);
    }

    #[test]
    fn test_self_loop_on_action_is_error() {
        let wf = linear().with_edge("a", "a");
        let findings = validate(&wf, &ValidateOptions::default());
        assert!(errors(&findings)
            .iter()
            .any(|f| f.node_id.as_deref() == Some("a") && f.message.contains("cycle")));
    }

    #[test]
    fn test_unreachable_cycle_still_found() {
        let wf = linear()
            .with_node(Node::action("x", "x.py"))
            .with_node(Node::action("y", "y.py"))
            .with_edge("x", "y")
            .with_edge("y", "x");
        let findings = validate(&wf, &ValidateOptions::default());
        assert!(errors(&findings).iter().any(|f| f.node_id.as_deref() == Some("x")));
    }

    #[test]
    fn test_multiple_outgoing_edges_warns() {
        let wf = linear().with_node(Node::end("e2")).with_edge("a", "e2");
        let findings = validate(&wf, &ValidateOptions::default());
        assert!(findings
            .iter()
            .any(|f| f.node_id.as_deref() == Some("a") && f.message.contains("only the first")));
        assert!(!has_errors(&findings));
    }

    #[test]
    fn test_entry_resolution() {
        let options = ValidateOptions::default();
        let binding = linear();
        let entry = resolve_entry(&binding, &options).unwrap();
        assert!(matches!(entry, Entry::Start(n) if n.id == "s"));

        let two_starts = linear().with_node(Node::start("s2")).with_edge("s2", "e");
        let err = resolve_entry(&two_starts, &options).unwrap_err();
        assert!(err.is_error());
        assert_eq!(err.node_id.as_deref(), Some("s2"));

        let headless = Workflow::new("wf", "Headless")
            .with_node(Node::new("note", NodeType::Annotation))
            .with_node(Node::action("a", "a.py"))
            .with_node(Node::end("e"))
            .with_edge("a", "e");
        assert!(resolve_entry(&headless, &options).is_err());
        let findings = validate(&headless, &options);
        assert!(findings.iter().any(|f| f.is_error() && f.message.contains("no start node")));

        let lenient = ValidateOptions { allow_implicit_entry: true };
        let entry = resolve_entry(&headless, &lenient).unwrap();
        assert!(matches!(entry, Entry::Implicit(n) if n.id == "a"));
        let findings = validate(&headless, &lenient);
        assert!(!has_errors(&findings), "{:?}", findings);
        assert!(findings.iter().any(|f| f.message.contains("entering at first node 'a'")));
    }

    #[test]
    fn test_ensure_valid_returns_validation_error() {
        let wf = linear().with_edge("a", "missing");
        let err = ensure_valid(&wf, &ValidateOptions::default()).unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
        assert_eq!(err.node_id(), Some("a"));
    }
}
