//! Architecture diagram pipeline: three-stage prompt chain.
//!
//! Stage 1 asks the model for prose describing the system design; stage
//! 2 binds the described components to concrete tree paths (hallucinated
//! paths are rejected and re-prompted once); stage 3 synthesizes the
//! flowchart text, which is parsed, normalized, and validated by
//! [`grammar`], with one repair round on parse failure.

pub mod grammar;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::PromptContext;
use crate::error::{GitcastError, Result};
use crate::ingest::FileTree;
use crate::llm::{ChatParams, ChatRequest, LanguageModel, strip_code_fences};

/// Output token budget for the stage-1 explanation.
const EXPLANATION_MAX_TOKENS: u32 = 1_200;

/// Temperature for the stage-1 explanation.
const EXPLANATION_TEMPERATURE: f32 = 0.3;

/// One component bound to concrete repository paths (stage 2 output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentMapping {
    /// Component name from the stage-1 prose.
    pub component: String,
    /// Tree paths realizing the component.
    pub paths: Vec<String>,
    /// Short role description.
    pub role: String,
}

/// The diagram prompt chain.
pub struct DiagramPipeline {
    model: Arc<dyn LanguageModel>,
    // Full diagram results keyed by (normalized url, content hash, model id).
    cache: std::sync::Mutex<HashMap<String, String>>,
}

impl DiagramPipeline {
    /// Create a pipeline over the given model.
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            cache: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Cache key for a full diagram result.
    pub fn cache_key(&self, normalized_url: &str, content_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalized_url.as_bytes());
        hasher.update(b"\n");
        hasher.update(content_hash.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.model.model_id().as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Generate a diagram, reusing a cached result when the repository
    /// content is unchanged.
    pub async fn generate_cached(
        &self,
        normalized_url: &str,
        content_hash: &str,
        tree: &FileTree,
        context: &PromptContext,
    ) -> Result<String> {
        let key = self.cache_key(normalized_url, content_hash);
        if let Ok(cache) = self.cache.lock()
            && let Some(cached) = cache.get(&key)
        {
            debug!("diagram cache hit for {normalized_url}");
            return Ok(cached.clone());
        }

        let diagram = self.generate(tree, context).await?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, diagram.clone());
        }
        Ok(diagram)
    }

    /// Run the three-stage chain and return validated flowchart text.
    pub async fn generate(&self, tree: &FileTree, context: &PromptContext) -> Result<String> {
        let explanation = self.explain_design(context).await?;
        info!("stage 1 complete: {} chars of prose", explanation.len());

        let mapping = self.map_files(tree, &explanation).await?;
        info!("stage 2 complete: {} components", mapping.len());

        let diagram = self.synthesize_graph(&explanation, &mapping).await?;
        info!("stage 3 complete: {} chars of flowchart", diagram.len());
        Ok(diagram)
    }

    /// Stage 1: free-text system design explanation.
    async fn explain_design(&self, context: &PromptContext) -> Result<String> {
        let prompt = format!(
            "Describe the architecture of this repository: its main components, \
             how data flows between them, and which external services or \
             dependencies it relies on. Write concise prose, no markup.\n\n\
             ## File tree\n\n{}\n## README\n\n{}",
            context.tree_text, context.readme_text
        );
        let request = ChatRequest::user_prompt(
            prompt,
            ChatParams {
                temperature: Some(EXPLANATION_TEMPERATURE),
                max_output_tokens: Some(EXPLANATION_MAX_TOKENS),
                ..ChatParams::default()
            },
        );
        Ok(self.model.chat(&request).await?)
    }

    /// Stage 2: bind components to concrete paths, rejecting paths not
    /// present in the tree with one re-prompt.
    async fn map_files(&self, tree: &FileTree, explanation: &str) -> Result<Vec<ComponentMapping>> {
        let prompt = format!(
            "Given this architecture description and file tree, map each \
             component to the paths that implement it. Use ONLY paths that \
             appear in the tree, verbatim. Respond with a JSON array of \
             {{\"component\", \"paths\", \"role\"}} objects and nothing else.\n\n\
             ## Description\n\n{explanation}\n\n## File tree\n\n{}",
            tree.render()
        );
        let request = ChatRequest::user_prompt(prompt.clone(), ChatParams::with_temperature(0.0));
        let reply = self.model.chat(&request).await?;
        let mut mapping = parse_mapping(&reply)?;

        let rejected = reject_unknown_paths(&mut mapping, tree);
        if !rejected.is_empty() {
            warn!("stage 2 rejected {} hallucinated paths", rejected.len());
            let repair = format!(
                "{prompt}\n\nYour previous answer referenced paths that do not \
                 exist in the tree: {}. Answer again using only existing paths.",
                rejected.join(", ")
            );
            let request = ChatRequest::user_prompt(repair, ChatParams::with_temperature(0.0));
            let reply = self.model.chat(&request).await?;
            mapping = parse_mapping(&reply)?;
            let still_rejected = reject_unknown_paths(&mut mapping, tree);
            if !still_rejected.is_empty() {
                debug!("dropping {} paths after repair", still_rejected.len());
            }
        }

        Ok(mapping)
    }

    /// Stage 3: synthesize flowchart text, with one repair round on a
    /// parse or validation failure.
    async fn synthesize_graph(
        &self,
        explanation: &str,
        mapping: &[ComponentMapping],
    ) -> Result<String> {
        let mapping_json =
            serde_json::to_string_pretty(mapping).unwrap_or_else(|_| "[]".to_owned());
        let prompt = format!(
            "Produce a flowchart for this architecture in Mermaid flowchart \
             syntax. Declare every node with an id and a label before or when \
             it is used in an edge. You may use subgraphs and assign the style \
             classes internal, external, storage, and entry with `class` \
             lines. Output only the flowchart text.\n\n\
             ## Description\n\n{explanation}\n\n## Component files\n\n{mapping_json}"
        );
        let request = ChatRequest::user_prompt(prompt.clone(), ChatParams::with_temperature(0.0));
        let reply = self.model.chat(&request).await?;

        match postprocess_diagram(&reply) {
            Ok(diagram) => Ok(diagram),
            Err(parse_message) => {
                warn!("stage 3 output invalid, repairing: {parse_message}");
                let repair = format!(
                    "{prompt}\n\nYour previous flowchart failed to parse: \
                     {parse_message}. Produce a corrected flowchart."
                );
                let request =
                    ChatRequest::user_prompt(repair, ChatParams::with_temperature(0.0));
                let reply = self.model.chat(&request).await?;
                postprocess_diagram(&reply).map_err(|e| {
                    GitcastError::Validation(format!("diagram generation failed: {e}"))
                })
            }
        }
    }
}

/// Parse the stage-2 JSON mapping.
fn parse_mapping(reply: &str) -> Result<Vec<ComponentMapping>> {
    let cleaned = strip_code_fences(reply);
    serde_json::from_str(cleaned)
        .map_err(|e| GitcastError::Validation(format!("component mapping is not valid JSON: {e}")))
}

/// Remove paths not present in the tree; returns what was removed.
/// Components left with no paths are dropped entirely.
fn reject_unknown_paths(mapping: &mut Vec<ComponentMapping>, tree: &FileTree) -> Vec<String> {
    let mut rejected = Vec::new();
    for component in mapping.iter_mut() {
        component.paths.retain(|path| {
            if tree.contains_path(path) {
                true
            } else {
                rejected.push(path.clone());
                false
            }
        });
    }
    mapping.retain(|c| !c.paths.is_empty());
    rejected
}

/// Parse, normalize, and validate stage-3 output; the error string is
/// the repair-prompt feedback.
fn postprocess_diagram(reply: &str) -> std::result::Result<String, String> {
    let cleaned = strip_code_fences(reply);
    let mut chart = grammar::parse(cleaned).map_err(|e| e.to_string())?;
    chart.declare_missing_endpoints();
    chart.collapse_duplicate_edges();
    chart.apply_style_palette();
    chart.validate()?;
    Ok(chart.render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::EntryKind;
    use crate::test_utils::ScriptedModel;

    fn tree_of(paths: &[&str]) -> FileTree {
        let entries: Vec<(String, EntryKind)> = paths
            .iter()
            .map(|p| ((*p).to_owned(), EntryKind::File))
            .collect();
        FileTree::from_flat(&entries, 5_000)
    }

    fn context() -> PromptContext {
        PromptContext {
            tree_text: "main.py\nREADME.md\n".into(),
            readme_text: "A CLI that greets the world.".into(),
            selected_files: vec![],
            token_estimate: 20,
        }
    }

    // ── stage post-processors ─────────────────────────────────

    #[test]
    fn parse_mapping_accepts_fenced_json() {
        let reply = "```json\n[{\"component\":\"cli\",\"paths\":[\"main.py\"],\"role\":\"entry\"}]\n```";
        let mapping = parse_mapping(reply);
        assert!(mapping.is_ok());
        match mapping {
            Ok(m) => {
                assert_eq!(m.len(), 1);
                assert_eq!(m[0].component, "cli");
            }
            Err(_) => unreachable!("mapping parsed"),
        }
    }

    #[test]
    fn parse_mapping_rejects_garbage() {
        assert!(parse_mapping("not json at all").is_err());
    }

    #[test]
    fn reject_unknown_paths_filters_and_reports() {
        let tree = tree_of(&["main.py", "src/app.py"]);
        let mut mapping = vec![
            ComponentMapping {
                component: "cli".into(),
                paths: vec!["main.py".into(), "ghost.py".into()],
                role: "entry".into(),
            },
            ComponentMapping {
                component: "phantom".into(),
                paths: vec!["does/not/exist.py".into()],
                role: "none".into(),
            },
        ];
        let rejected = reject_unknown_paths(&mut mapping, &tree);
        assert_eq!(rejected, vec!["ghost.py".to_owned(), "does/not/exist.py".to_owned()]);
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping[0].paths, vec!["main.py".to_owned()]);
    }

    #[test]
    fn postprocess_validates_and_normalizes() {
        let reply = "```\nflowchart TD\n    A[Cli] --> B\n    A --> B\n```";
        let result = postprocess_diagram(reply);
        assert!(result.is_ok());
        match result {
            Ok(diagram) => {
                // Missing endpoint declared, duplicate edge collapsed.
                let reparsed = grammar::parse(&diagram);
                assert!(reparsed.is_ok());
                match reparsed {
                    Ok(chart) => {
                        assert!(chart.has_node("B"));
                        assert_eq!(chart.edges.len(), 1);
                    }
                    Err(_) => unreachable!("normalized diagram reparses"),
                }
            }
            Err(_) => unreachable!("postprocess succeeded"),
        }
    }

    #[test]
    fn postprocess_reports_parse_failure() {
        let result = postprocess_diagram("flowchart TD\n    A[broken\n");
        assert!(result.is_err());
        match result {
            Err(message) => assert!(message.contains("unterminated")),
            Ok(_) => unreachable!("expected failure"),
        }
    }

    // ── chain behavior with a scripted model ──────────────────

    #[tokio::test]
    async fn chain_runs_three_stages() {
        let model = Arc::new(ScriptedModel::new(vec![
            "The CLI reads input and greets the user.".into(),
            "[{\"component\":\"cli\",\"paths\":[\"main.py\"],\"role\":\"entry point\"}]".into(),
            "flowchart TD\n    A[main.py] --> B[stdout]\n    class A entry\n".into(),
        ]));
        let pipeline = DiagramPipeline::new(model.clone());
        let tree = tree_of(&["main.py", "README.md"]);
        let result = pipeline.generate(&tree, &context()).await;
        assert!(result.is_ok());
        match result {
            Ok(diagram) => {
                assert!(diagram.contains("main.py"));
                assert!(diagram.contains("classDef entry"));
            }
            Err(_) => unreachable!("chain succeeded"),
        }
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn hallucinated_paths_trigger_one_reprompt() {
        let model = Arc::new(ScriptedModel::new(vec![
            "prose".into(),
            "[{\"component\":\"cli\",\"paths\":[\"invented.py\"],\"role\":\"x\"}]".into(),
            "[{\"component\":\"cli\",\"paths\":[\"main.py\"],\"role\":\"x\"}]".into(),
            "flowchart TD\n    A[Cli] --> B[Out]\n".into(),
        ]));
        let pipeline = DiagramPipeline::new(model.clone());
        let tree = tree_of(&["main.py"]);
        let result = pipeline.generate(&tree, &context()).await;
        assert!(result.is_ok());
        assert_eq!(model.calls(), 4);
        // The repair prompt names the rejected path.
        assert!(model.request_text(2).contains("invented.py"));
    }

    #[tokio::test]
    async fn broken_diagram_gets_one_repair_round() {
        let model = Arc::new(ScriptedModel::new(vec![
            "prose".into(),
            "[{\"component\":\"cli\",\"paths\":[\"main.py\"],\"role\":\"x\"}]".into(),
            "flowchart TD\n    A[broken\n".into(),
            "flowchart TD\n    A[Fixed] --> B[Out]\n".into(),
        ]));
        let pipeline = DiagramPipeline::new(model.clone());
        let tree = tree_of(&["main.py"]);
        let result = pipeline.generate(&tree, &context()).await;
        assert!(result.is_ok());
        assert_eq!(model.calls(), 4);
    }

    #[tokio::test]
    async fn second_parse_failure_is_terminal() {
        let model = Arc::new(ScriptedModel::new(vec![
            "prose".into(),
            "[{\"component\":\"cli\",\"paths\":[\"main.py\"],\"role\":\"x\"}]".into(),
            "flowchart TD\n    A[broken\n".into(),
            "still [ broken\n".into(),
        ]));
        let pipeline = DiagramPipeline::new(model);
        let tree = tree_of(&["main.py"]);
        let result = pipeline.generate(&tree, &context()).await;
        assert!(matches!(result, Err(GitcastError::Validation(_))));
    }

    #[tokio::test]
    async fn cached_generation_skips_the_model() {
        let model = Arc::new(ScriptedModel::new(vec![
            "prose".into(),
            "[{\"component\":\"cli\",\"paths\":[\"main.py\"],\"role\":\"x\"}]".into(),
            "flowchart TD\n    A[Cli] --> B[Out]\n".into(),
        ]));
        let pipeline = DiagramPipeline::new(model.clone());
        let tree = tree_of(&["main.py"]);
        let first = pipeline
            .generate_cached("https://github.com/x/y", "hash-1", &tree, &context())
            .await;
        assert!(first.is_ok());
        assert_eq!(model.calls(), 3);

        let second = pipeline
            .generate_cached("https://github.com/x/y", "hash-1", &tree, &context())
            .await;
        assert!(second.is_ok());
        // No further model calls.
        assert_eq!(model.calls(), 3);
        match (first, second) {
            (Ok(a), Ok(b)) => assert_eq!(a, b),
            _ => unreachable!("both generations succeeded"),
        }
    }

    #[test]
    fn cache_key_varies_with_inputs() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let pipeline = DiagramPipeline::new(model);
        let a = pipeline.cache_key("https://github.com/x/y", "h1");
        let b = pipeline.cache_key("https://github.com/x/y", "h2");
        let c = pipeline.cache_key("https://github.com/x/z", "h1");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, pipeline.cache_key("https://github.com/x/y", "h1"));
    }
}
