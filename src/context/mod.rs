//! Prompt-context construction: snapshot → token-budgeted payload.
//!
//! Each LLM chain receives a [`PromptContext`] built for its purpose.
//! The builder estimates tokens with a shared heuristic (the provider
//! tokenizer is not shipped) and reduces over-budget inputs in a fixed
//! order: drop the lowest-priority selected files, truncate the README
//! at a paragraph boundary, then collapse file-tree subtrees to counts.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ContextConfig;
use crate::ingest::{FileRole, RepoSnapshot};

/// Per-file content cap applied before budgeting, in characters.
const FILE_CONTENT_CHAR_CAP: usize = 6_000;

/// What the context is being built for; weights file retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// Architecture diagram chain: manifests and structure first.
    Diagram,
    /// Podcast script chain: README and docs first.
    Podcast,
    /// Conversational Q&A chain: broad coverage.
    Qa,
}

/// A token-budgeted prompt payload derived from a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptContext {
    /// Pretty-printed file tree (possibly collapsed).
    pub tree_text: String,
    /// README text (possibly truncated at a paragraph boundary).
    pub readme_text: String,
    /// Selected files: `(path, truncated content)`, retention order.
    pub selected_files: Vec<(String, String)>,
    /// Heuristic token estimate for the whole payload.
    pub token_estimate: usize,
}

impl PromptContext {
    /// Render the context as one prompt block.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("## File tree\n\n");
        out.push_str(&self.tree_text);
        if !self.readme_text.is_empty() {
            out.push_str("\n## README\n\n");
            out.push_str(&self.readme_text);
        }
        for (path, content) in &self.selected_files {
            out.push_str(&format!("\n## File: {path}\n\n"));
            out.push_str(content);
            out.push('\n');
        }
        out
    }
}

/// Heuristic token estimate: roughly four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Context builder with a configured budget.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    config: ContextConfig,
}

impl ContextBuilder {
    /// Create a builder from configuration.
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Build a purpose-weighted context within the token budget.
    pub fn build(&self, snapshot: &RepoSnapshot, purpose: Purpose) -> PromptContext {
        let budget = self.config.token_budget();

        let mut files: Vec<(String, String, FileRole)> = snapshot
            .files
            .iter()
            .map(|f| {
                (
                    f.path.clone(),
                    truncate_at_line(&f.content, FILE_CONTENT_CHAR_CAP),
                    f.role,
                )
            })
            .collect();
        // Retention order: highest purpose weight first; ties keep the
        // ingestion order.
        files.sort_by(|a, b| purpose_weight(purpose, b.2).cmp(&purpose_weight(purpose, a.2)));

        let mut tree_text = snapshot.tree.render();
        let mut readme_text = snapshot.readme.clone();

        let estimate = |tree: &str, readme: &str, files: &[(String, String, FileRole)]| {
            estimate_tokens(tree)
                + estimate_tokens(readme)
                + files
                    .iter()
                    .map(|(p, c, _)| estimate_tokens(p) + estimate_tokens(c))
                    .sum::<usize>()
        };

        // 1. Drop lowest-priority files.
        while estimate(&tree_text, &readme_text, &files) > budget && !files.is_empty() {
            let dropped = files.pop();
            if let Some((path, _, _)) = dropped {
                debug!("context over budget, dropping {path}");
            }
        }

        // 2. Truncate README at a paragraph boundary.
        while estimate(&tree_text, &readme_text, &files) > budget && !readme_text.is_empty() {
            match drop_last_paragraph(&readme_text) {
                Some(shorter) => readme_text = shorter,
                None => readme_text = String::new(),
            }
        }

        // 3. Collapse tree subtrees to counts, shallower each pass.
        for depth in (1..=3).rev() {
            if estimate(&tree_text, &readme_text, &files) <= budget {
                break;
            }
            tree_text = snapshot.tree.render_collapsed(depth);
        }

        // Last resort so the invariant always holds.
        let remaining = budget.saturating_sub(estimate("", &readme_text, &files));
        if estimate_tokens(&tree_text) > remaining {
            tree_text = truncate_at_line(&tree_text, remaining.saturating_mul(4));
        }

        let token_estimate = estimate(&tree_text, &readme_text, &files);
        PromptContext {
            tree_text,
            readme_text,
            selected_files: files.into_iter().map(|(p, c, _)| (p, c)).collect(),
            token_estimate,
        }
    }
}

/// Retention weight of a file role for a given purpose; higher survives
/// longer under budget pressure.
fn purpose_weight(purpose: Purpose, role: FileRole) -> u8 {
    match purpose {
        Purpose::Diagram => match role {
            FileRole::Manifest => 4,
            FileRole::EntryPoint => 3,
            FileRole::Module => 2,
            FileRole::Doc => 1,
        },
        Purpose::Podcast => match role {
            FileRole::Doc => 4,
            FileRole::Manifest => 3,
            FileRole::EntryPoint => 2,
            FileRole::Module => 1,
        },
        Purpose::Qa => match role {
            FileRole::Manifest => 4,
            FileRole::Doc => 3,
            FileRole::EntryPoint => 2,
            FileRole::Module => 1,
        },
    }
}

/// Remove the last paragraph (blank-line separated); `None` when there
/// is only one left.
fn drop_last_paragraph(text: &str) -> Option<String> {
    let trimmed = text.trim_end();
    let cut = trimmed.rfind("\n\n")?;
    Some(trimmed[..cut].to_owned())
}

/// Truncate to at most `max_chars`, backing up to a line boundary.
fn truncate_at_line(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let prefix: String = text.chars().take(max_chars).collect();
    match prefix.rfind('\n') {
        Some(cut) if cut > 0 => prefix[..cut].to_owned(),
        _ => prefix,
    }
}
