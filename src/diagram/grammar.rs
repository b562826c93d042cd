//! Parser and validator for the declarative flowchart grammar.
//!
//! The diagram chain asks the model for flowchart text (nodes with ids
//! and labels, edges with optional labels, subgraphs, style classes).
//! This module parses that text into a structured [`Flowchart`], checks
//! the invariants (unique node ids, every edge endpoint declared), and
//! re-emits normalized text with duplicate edges collapsed and the
//! standard style palette applied.

use std::collections::BTreeMap;

/// Style classes applied by the post-processor.
pub const STYLE_PALETTE: &[(&str, &str)] = &[
    ("internal", "fill:#1f6feb,stroke:#0d419d,color:#ffffff"),
    ("external", "fill:#8957e5,stroke:#6639ba,color:#ffffff"),
    ("storage", "fill:#2da44e,stroke:#1a7f37,color:#ffffff"),
    ("entry", "fill:#d29922,stroke:#9e6a03,color:#ffffff"),
];

/// A parse failure with the offending line for repair prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based line number.
    pub line: usize,
    /// What went wrong.
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// A declared node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Unique identifier.
    pub id: String,
    /// Display label (defaults to the id).
    pub label: String,
    /// Bracket shape as written (`[`, `(`, `{`, `([`, `[(`, `((`).
    pub shape: String,
}

/// A directed or undirected edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Optional edge label.
    pub label: Option<String>,
    /// Whether the edge is directed (`-->`) or plain (`---`).
    pub directed: bool,
}

/// A named subgraph grouping node ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subgraph {
    /// Subgraph title.
    pub name: String,
    /// Ids of member nodes, in declaration order.
    pub node_ids: Vec<String>,
}

/// A parsed flowchart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flowchart {
    /// Layout direction (`TD`, `LR`, …).
    pub direction: String,
    /// Declared nodes, in order of first appearance.
    pub nodes: Vec<Node>,
    /// Edges in declaration order.
    pub edges: Vec<Edge>,
    /// Subgraphs in declaration order.
    pub subgraphs: Vec<Subgraph>,
    /// `class <ids> <name>` assignments: node id → class name.
    pub class_assignments: BTreeMap<String, String>,
    /// `classDef` lines as written: class name → style text.
    pub class_defs: BTreeMap<String, String>,
}

impl Flowchart {
    /// Whether a node id is declared.
    pub fn has_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    /// Ids referenced by edges but never declared with a label.
    pub fn undeclared_edge_endpoints(&self) -> Vec<String> {
        let mut missing = Vec::new();
        for edge in &self.edges {
            for id in [&edge.from, &edge.to] {
                if !self.has_node(id) && !missing.contains(id) {
                    missing.push(id.clone());
                }
            }
        }
        missing
    }

    /// Declare any edge endpoints that lack an explicit declaration,
    /// using the id as the label.
    pub fn declare_missing_endpoints(&mut self) {
        for id in self.undeclared_edge_endpoints() {
            self.nodes.push(Node {
                label: id.clone(),
                id,
                shape: "[".to_owned(),
            });
        }
    }

    /// Collapse duplicate edges (same endpoints and direction), keeping
    /// the first occurrence's label.
    pub fn collapse_duplicate_edges(&mut self) {
        let mut seen: Vec<(String, String, bool)> = Vec::new();
        self.edges.retain(|edge| {
            let key = (edge.from.clone(), edge.to.clone(), edge.directed);
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        });
    }

    /// Apply the standard style palette: any assigned class from the
    /// palette gets its `classDef`, unknown assignments are dropped.
    pub fn apply_style_palette(&mut self) {
        self.class_assignments
            .retain(|_, class| STYLE_PALETTE.iter().any(|(name, _)| name == class));
        for (name, style) in STYLE_PALETTE {
            if self.class_assignments.values().any(|c| c == name) {
                self.class_defs
                    .entry((*name).to_owned())
                    .or_insert_with(|| (*style).to_owned());
            }
        }
    }

    /// Check the structural invariants.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant: duplicate
    /// node ids or an edge endpoint that is not declared.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if seen.contains(&&node.id) {
                return Err(format!("node id declared twice: {}", node.id));
            }
            seen.push(&node.id);
        }
        for edge in &self.edges {
            for id in [&edge.from, &edge.to] {
                if !self.has_node(id) {
                    return Err(format!("edge references undeclared node: {id}"));
                }
            }
        }
        Ok(())
    }

    /// Emit normalized flowchart text.
    pub fn render(&self) -> String {
        let direction = if self.direction.is_empty() {
            "TD"
        } else {
            &self.direction
        };
        let mut out = format!("flowchart {direction}\n");

        let in_subgraph: Vec<&String> = self
            .subgraphs
            .iter()
            .flat_map(|s| s.node_ids.iter())
            .collect();

        for node in &self.nodes {
            if !in_subgraph.contains(&&node.id) {
                out.push_str(&format!("    {}\n", render_node(node)));
            }
        }
        for subgraph in &self.subgraphs {
            out.push_str(&format!("    subgraph {}\n", subgraph.name));
            for id in &subgraph.node_ids {
                if let Some(node) = self.nodes.iter().find(|n| &n.id == id) {
                    out.push_str(&format!("        {}\n", render_node(node)));
                }
            }
            out.push_str("    end\n");
        }
        for edge in &self.edges {
            let arrow = if edge.directed { "-->" } else { "---" };
            match &edge.label {
                Some(label) => {
                    out.push_str(&format!("    {} {arrow}|{label}| {}\n", edge.from, edge.to));
                }
                None => out.push_str(&format!("    {} {arrow} {}\n", edge.from, edge.to)),
            }
        }
        for (id, class) in &self.class_assignments {
            out.push_str(&format!("    class {id} {class}\n"));
        }
        for (name, style) in &self.class_defs {
            out.push_str(&format!("    classDef {name} {style}\n"));
        }
        out
    }
}

fn render_node(node: &Node) -> String {
    let (open, close) = match node.shape.as_str() {
        "(" => ("(", ")"),
        "{" => ("{", "}"),
        "([" => ("([", "])"),
        "[(" => ("[(", ")]"),
        "((" => ("((", "))"),
        _ => ("[", "]"),
    };
    if node.label == node.id && node.shape == "[" {
        node.id.clone()
    } else {
        format!("{}{open}{}{close}", node.id, node.label)
    }
}

/// Parse flowchart text.
///
/// # Errors
///
/// Returns the first [`ParseError`] encountered; the message is fed back
/// to the model on the repair round.
pub fn parse(text: &str) -> std::result::Result<Flowchart, ParseError> {
    let mut chart = Flowchart::default();
    let mut current_subgraph: Option<Subgraph> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with("%%") {
            continue;
        }

        if let Some(rest) = line
            .strip_prefix("flowchart")
            .or_else(|| line.strip_prefix("graph"))
            && (rest.is_empty() || rest.starts_with(char::is_whitespace))
        {
            let direction = rest.trim();
            if !chart.direction.is_empty() {
                return Err(ParseError {
                    line: line_no,
                    message: "duplicate flowchart header".into(),
                });
            }
            chart.direction = if direction.is_empty() {
                "TD".to_owned()
            } else {
                direction.to_owned()
            };
            continue;
        }

        if let Some(rest) = line.strip_prefix("subgraph ") {
            if current_subgraph.is_some() {
                return Err(ParseError {
                    line: line_no,
                    message: "nested subgraphs are not supported".into(),
                });
            }
            let name = rest.trim().trim_matches('"').to_owned();
            if name.is_empty() {
                return Err(ParseError {
                    line: line_no,
                    message: "subgraph requires a name".into(),
                });
            }
            current_subgraph = Some(Subgraph {
                name,
                node_ids: Vec::new(),
            });
            continue;
        }

        if line == "end" {
            match current_subgraph.take() {
                Some(subgraph) => chart.subgraphs.push(subgraph),
                None => {
                    return Err(ParseError {
                        line: line_no,
                        message: "'end' outside a subgraph".into(),
                    });
                }
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("classDef ") {
            let mut parts = rest.trim().splitn(2, char::is_whitespace);
            let name = parts.next().unwrap_or("").to_owned();
            let style = parts.next().unwrap_or("").trim().to_owned();
            if name.is_empty() || style.is_empty() {
                return Err(ParseError {
                    line: line_no,
                    message: "classDef requires a name and a style".into(),
                });
            }
            chart.class_defs.insert(name, style);
            continue;
        }

        if let Some(rest) = line.strip_prefix("class ") {
            let mut parts = rest.trim().rsplitn(2, char::is_whitespace);
            let class = parts.next().unwrap_or("").to_owned();
            let ids = parts.next().unwrap_or("");
            if class.is_empty() || ids.is_empty() {
                return Err(ParseError {
                    line: line_no,
                    message: "class requires node ids and a class name".into(),
                });
            }
            for id in ids.split(',') {
                chart
                    .class_assignments
                    .insert(id.trim().to_owned(), class.clone());
            }
            continue;
        }

        // Node declaration and/or edge chain.
        parse_statement(line, line_no, &mut chart, current_subgraph.as_mut())?;
    }

    if current_subgraph.is_some() {
        return Err(ParseError {
            line: text.lines().count(),
            message: "subgraph not closed with 'end'".into(),
        });
    }

    Ok(chart)
}

/// Parse a `A[Label] -->|edge| B(Other) --> C` statement.
fn parse_statement(
    line: &str,
    line_no: usize,
    chart: &mut Flowchart,
    mut subgraph: Option<&mut Subgraph>,
) -> std::result::Result<(), ParseError> {
    let mut rest = line;
    let (first_id, consumed) = parse_node_token(rest, line_no, chart)?;
    if let Some(sub) = subgraph.as_deref_mut()
        && !sub.node_ids.contains(&first_id)
    {
        sub.node_ids.push(first_id.clone());
    }
    rest = rest[consumed..].trim_start();

    let mut previous = first_id;
    while !rest.is_empty() {
        let directed = if rest.starts_with("-->") {
            rest = &rest[3..];
            true
        } else if rest.starts_with("---") {
            rest = &rest[3..];
            false
        } else {
            return Err(ParseError {
                line: line_no,
                message: format!("expected an arrow, found: {rest}"),
            });
        };

        rest = rest.trim_start();
        let mut label = None;
        if let Some(after) = rest.strip_prefix('|') {
            let close = after.find('|').ok_or_else(|| ParseError {
                line: line_no,
                message: "unterminated edge label".into(),
            })?;
            label = Some(after[..close].trim().to_owned());
            rest = after[close + 1..].trim_start();
        }

        let (next_id, consumed) = parse_node_token(rest, line_no, chart)?;
        if let Some(sub) = subgraph.as_deref_mut()
            && !sub.node_ids.contains(&next_id)
        {
            sub.node_ids.push(next_id.clone());
        }
        rest = rest[consumed..].trim_start();

        chart.edges.push(Edge {
            from: previous,
            to: next_id.clone(),
            label,
            directed,
        });
        previous = next_id;
    }

    Ok(())
}

/// Parse one node token (`id` with an optional bracketed label) at the
/// start of `rest`. Returns the node id and the bytes consumed.
fn parse_node_token(
    rest: &str,
    line_no: usize,
    chart: &mut Flowchart,
) -> std::result::Result<(String, usize), ParseError> {
    let id_len = rest
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map_or(rest.len(), |(i, _)| i);
    if id_len == 0 {
        return Err(ParseError {
            line: line_no,
            message: format!("expected a node id, found: {rest}"),
        });
    }
    let id = rest[..id_len].to_owned();
    let after_id = &rest[id_len..];

    let openers: &[(&str, &str)] = &[
        ("([", "])"),
        ("[(", ")]"),
        ("((", "))"),
        ("[", "]"),
        ("(", ")"),
        ("{", "}"),
    ];
    for (open, close) in openers {
        if let Some(after_open) = after_id.strip_prefix(open) {
            let close_pos = after_open.find(close).ok_or_else(|| ParseError {
                line: line_no,
                message: format!("unterminated node label for {id}"),
            })?;
            let label = after_open[..close_pos].trim().trim_matches('"').to_owned();
            declare_node(chart, &id, &label, open, line_no)?;
            return Ok((id, id_len + open.len() + close_pos + close.len()));
        }
    }

    // Bare reference without a label; not a declaration.
    Ok((id, id_len))
}

fn declare_node(
    chart: &mut Flowchart,
    id: &str,
    label: &str,
    shape: &str,
    line_no: usize,
) -> std::result::Result<(), ParseError> {
    if let Some(existing) = chart.nodes.iter().find(|n| n.id == id) {
        if existing.label != label {
            return Err(ParseError {
                line: line_no,
                message: format!("node id declared twice with different labels: {id}"),
            });
        }
        return Ok(());
    }
    chart.nodes.push(Node {
        id: id.to_owned(),
        label: label.to_owned(),
        shape: shape.to_owned(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(text: &str) -> Flowchart {
        match parse(text) {
            Ok(chart) => chart,
            Err(e) => unreachable!("parse failed: {e}"),
        }
    }

    // ── parsing ───────────────────────────────────────────────

    #[test]
    fn parses_header_and_nodes() {
        let chart = parse_ok("flowchart TD\n    A[Start]\n    B[End]\n");
        assert_eq!(chart.direction, "TD");
        assert_eq!(chart.nodes.len(), 2);
        assert_eq!(chart.nodes[0].id, "A");
        assert_eq!(chart.nodes[0].label, "Start");
    }

    #[test]
    fn parses_edge_with_inline_declarations() {
        let chart = parse_ok("flowchart LR\n    A[Web] --> B[Api]\n");
        assert_eq!(chart.nodes.len(), 2);
        assert_eq!(chart.edges.len(), 1);
        assert_eq!(chart.edges[0].from, "A");
        assert_eq!(chart.edges[0].to, "B");
        assert!(chart.edges[0].directed);
        assert!(chart.edges[0].label.is_none());
    }

    #[test]
    fn parses_edge_labels() {
        let chart = parse_ok("flowchart TD\n    A[X] -->|calls| B[Y]\n");
        assert_eq!(chart.edges[0].label.as_deref(), Some("calls"));
    }

    #[test]
    fn parses_edge_chains() {
        let chart = parse_ok("flowchart TD\n    A[1] --> B[2] --> C[3]\n");
        assert_eq!(chart.edges.len(), 2);
        assert_eq!(chart.edges[1].from, "B");
        assert_eq!(chart.edges[1].to, "C");
    }

    #[test]
    fn parses_node_shapes() {
        let chart = parse_ok(
            "flowchart TD\n    A[rect]\n    B(round)\n    C{diamond}\n    D([stadium])\n    E[(cylinder)]\n    F((circle))\n",
        );
        assert_eq!(chart.nodes.len(), 6);
        assert_eq!(chart.nodes[1].shape, "(");
        assert_eq!(chart.nodes[2].shape, "{");
        assert_eq!(chart.nodes[3].shape, "([");
        assert_eq!(chart.nodes[4].shape, "[(");
        assert_eq!(chart.nodes[5].shape, "((");
    }

    #[test]
    fn parses_subgraphs() {
        let chart = parse_ok(
            "flowchart TD\n    subgraph backend\n        A[Api]\n        B[Worker]\n    end\n    A --> B\n",
        );
        assert_eq!(chart.subgraphs.len(), 1);
        assert_eq!(chart.subgraphs[0].name, "backend");
        assert_eq!(chart.subgraphs[0].node_ids, vec!["A", "B"]);
    }

    #[test]
    fn parses_class_lines() {
        let chart = parse_ok(
            "flowchart TD\n    A[X]\n    B[Y]\n    class A,B internal\n    classDef internal fill:#123456\n",
        );
        assert_eq!(chart.class_assignments.get("A").map(String::as_str), Some("internal"));
        assert_eq!(chart.class_assignments.get("B").map(String::as_str), Some("internal"));
        assert!(chart.class_defs.contains_key("internal"));
    }

    #[test]
    fn ignores_comments_and_blanks() {
        let chart = parse_ok("flowchart TD\n\n%% a comment\n    A[X]\n");
        assert_eq!(chart.nodes.len(), 1);
    }

    #[test]
    fn undirected_edges() {
        let chart = parse_ok("flowchart TD\n    A[X] --- B[Y]\n");
        assert!(!chart.edges[0].directed);
    }

    // ── parse errors ──────────────────────────────────────────

    #[test]
    fn error_on_unterminated_label() {
        let err = parse("flowchart TD\n    A[oops\n");
        assert!(err.is_err());
        match err {
            Err(e) => {
                assert_eq!(e.line, 2);
                assert!(e.message.contains("unterminated"));
            }
            Ok(_) => unreachable!("expected parse error"),
        }
    }

    #[test]
    fn error_on_unterminated_edge_label() {
        assert!(parse("flowchart TD\n    A[X] -->|oops B[Y]\n").is_err());
    }

    #[test]
    fn error_on_unclosed_subgraph() {
        assert!(parse("flowchart TD\n    subgraph s\n    A[X]\n").is_err());
    }

    #[test]
    fn error_on_stray_end() {
        assert!(parse("flowchart TD\n    end\n").is_err());
    }

    #[test]
    fn error_on_conflicting_redeclaration() {
        assert!(parse("flowchart TD\n    A[one]\n    A[two]\n").is_err());
    }

    #[test]
    fn identical_redeclaration_is_fine() {
        let chart = parse_ok("flowchart TD\n    A[same]\n    A[same] --> B[X]\n");
        assert_eq!(chart.nodes.iter().filter(|n| n.id == "A").count(), 1);
    }

    #[test]
    fn error_on_garbage_after_node() {
        assert!(parse("flowchart TD\n    A[X] ~~> B[Y]\n").is_err());
    }

    // ── normalization ─────────────────────────────────────────

    #[test]
    fn declares_missing_endpoints() {
        let mut chart = parse_ok("flowchart TD\n    A[X] --> B\n");
        assert_eq!(chart.undeclared_edge_endpoints(), vec!["B".to_owned()]);
        chart.declare_missing_endpoints();
        assert!(chart.has_node("B"));
        assert!(chart.validate().is_ok());
    }

    #[test]
    fn collapses_duplicate_edges() {
        let mut chart =
            parse_ok("flowchart TD\n    A[X] -->|first| B[Y]\n    A --> B\n    A --> B\n");
        assert_eq!(chart.edges.len(), 3);
        chart.collapse_duplicate_edges();
        assert_eq!(chart.edges.len(), 1);
        assert_eq!(chart.edges[0].label.as_deref(), Some("first"));
    }

    #[test]
    fn style_palette_adds_defs_for_used_classes() {
        let mut chart = parse_ok("flowchart TD\n    A[X]\n    class A storage\n");
        chart.apply_style_palette();
        assert!(chart.class_defs.contains_key("storage"));
        assert!(!chart.class_defs.contains_key("external"));
    }

    #[test]
    fn style_palette_drops_unknown_classes() {
        let mut chart = parse_ok("flowchart TD\n    A[X]\n    class A madeup\n");
        chart.apply_style_palette();
        assert!(chart.class_assignments.is_empty());
    }

    // ── validation ────────────────────────────────────────────

    #[test]
    fn validate_catches_undeclared_endpoint() {
        let chart = parse_ok("flowchart TD\n    A[X] --> Ghost\n");
        assert!(chart.validate().is_err());
    }

    #[test]
    fn validate_passes_wellformed() {
        let chart = parse_ok("flowchart TD\n    A[X] --> B[Y]\n    B --> A\n");
        assert!(chart.validate().is_ok());
    }

    // ── render round trip ─────────────────────────────────────

    #[test]
    fn render_parses_back() {
        let mut chart = parse_ok(
            "flowchart TD\n    subgraph core\n        A[Api]\n    end\n    A -->|stores| B[(Db)]\n    class B storage\n",
        );
        chart.declare_missing_endpoints();
        chart.apply_style_palette();
        let rendered = chart.render();
        let reparsed = parse_ok(&rendered);
        assert!(reparsed.validate().is_ok());
        assert_eq!(reparsed.edges.len(), chart.edges.len());
        assert!(reparsed.has_node("A"));
        assert!(reparsed.has_node("B"));
        assert!(rendered.contains("classDef storage"));
    }

    #[test]
    fn render_defaults_direction() {
        let chart = Flowchart::default();
        assert!(chart.render().starts_with("flowchart TD"));
    }
}
