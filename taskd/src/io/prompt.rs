//! Prompt pack builder for engine input.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When the rendered prompt exceeds the byte budget, droppable context sections are
//! removed in a fixed order and the last section (the task history) is cut from
//! the front, keeping the most recent entries.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::plan::render_plan;
use crate::io::context::{ParentSummary, UserContext};
use crate::record::Step;

const CONTEXT_TEMPLATE: &str = include_str!("prompts/context.md");
const PLANNING_TEMPLATE: &str = include_str!("prompts/planning.md");
const EXECUTION_TEMPLATE: &str = include_str!("prompts/execution.md");
const FINALIZATION_TEMPLATE: &str = include_str!("prompts/finalization.md");

const DROP_ORDER: [&str; 5] = ["skills", "memories", "parent", "instructions", "core"];
const TRUNCATED_NOTE: &str = "[earlier entries truncated]\n";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section pattern")
});

pub struct PlanningInput<'a> {
    pub context: &'a UserContext,
    pub request: &'a str,
    pub parent: Option<&'a ParentSummary>,
}

pub struct ExecutionInput<'a> {
    pub context: &'a UserContext,
    pub request: &'a str,
    pub plan: &'a [Step],
    pub step: &'a str,
    pub history: &'a str,
    /// Latest `--- USER DECISION ---` body, if any.
    pub decision: Option<&'a str>,
}

pub struct FinalizationInput<'a> {
    pub context: &'a UserContext,
    pub request: &'a str,
    pub history: &'a str,
}

/// Renders prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("context", CONTEXT_TEMPLATE)
            .context("load context template")?;
        env.add_template("planning", PLANNING_TEMPLATE)
            .context("load planning template")?;
        env.add_template("execution", EXECUTION_TEMPLATE)
            .context("load execution template")?;
        env.add_template("finalization", FINALIZATION_TEMPLATE)
            .context("load finalization template")?;
        Ok(Self { env, budget_bytes })
    }

    pub fn planning(&self, input: &PlanningInput<'_>) -> Result<String> {
        let rendered = self
            .env
            .get_template("planning")?
            .render(context! {
                ctx => input.context,
                request => input.request,
                parent => input.parent,
            })
            .context("render planning prompt")?;
        Ok(self.fit(&rendered))
    }

    pub fn execution(&self, input: &ExecutionInput<'_>) -> Result<String> {
        let rendered = self
            .env
            .get_template("execution")?
            .render(context! {
                ctx => input.context,
                request => input.request,
                plan => render_plan(input.plan),
                step => input.step,
                history => non_empty(input.history),
                decision => input.decision.and_then(non_empty),
            })
            .context("render execution prompt")?;
        Ok(self.fit(&rendered))
    }

    pub fn finalization(&self, input: &FinalizationInput<'_>) -> Result<String> {
        let rendered = self
            .env
            .get_template("finalization")?
            .render(context! {
                ctx => input.context,
                request => input.request,
                history => non_empty(input.history),
            })
            .context("render finalization prompt")?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }
}

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    /// Section content after its marker.
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    let separators = sections.len().saturating_sub(1) * 2;
    sections.iter().map(|s| s.content.len()).sum::<usize>() + separators
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    if total_len(sections) <= budget {
        return;
    }

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let over = total_len(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let before_len = last.content.len();
    let cut = ceil_char_boundary(&last.content, over + TRUNCATED_NOTE.len());
    if cut >= last.content.len() {
        last.content.clear();
    } else {
        last.content = format!("{TRUNCATED_NOTE}{}", &last.content[cut..]);
    }
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

/// Smallest char boundary in `text` at or after `idx` (or `text.len()`).
fn ceil_char_boundary(text: &str, idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    (idx..=text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(text.len())
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::context::ContextFile;
    use crate::record::StepState;

    fn user_context() -> UserContext {
        UserContext {
            core: vec![ContextFile {
                name: "rules.md".to_string(),
                body: "Answer in Russian.".to_string(),
            }],
            instructions: vec![ContextFile {
                name: "tone.md".to_string(),
                body: "Be brief.".to_string(),
            }],
            memories: vec![ContextFile {
                name: "facts.md".to_string(),
                body: "Lives in Berlin.".to_string(),
            }],
            skills: Some("web_search".to_string()),
        }
    }

    /// Verifies context files and the parent summary land in the planning prompt
    /// ahead of the request.
    #[test]
    fn planning_prompt_carries_context_and_parent() {
        let ctx = user_context();
        let parent = ParentSummary {
            request: "find flights".to_string(),
            answer: None,
        };
        let prompt = PromptBuilder::new(100_000)
            .expect("builder")
            .planning(&PlanningInput {
                context: &ctx,
                request: "now book the cheapest",
                parent: Some(&parent),
            })
            .expect("render");

        let contract = prompt.find("### Planning Contract").expect("contract");
        let core = prompt.find("FILE rules.md:").expect("core file");
        let parent_pos = prompt.find("User: find flights").expect("parent");
        let request = prompt.find("now book the cheapest").expect("request");
        assert!(contract < core && core < parent_pos && parent_pos < request);
        assert!(prompt.contains("Assistant: No Answer"));
        assert!(prompt.contains("web_search"));
        assert!(!prompt.contains("<!--"));
    }

    /// Verifies the execution prompt shows the in-progress plan, the step and the
    /// latest decision.
    #[test]
    fn execution_prompt_shows_plan_and_decision() {
        let ctx = UserContext::default();
        let plan = vec![
            Step {
                text: "fetch data".to_string(),
                state: StepState::Done,
            },
            Step {
                text: "summarize".to_string(),
                state: StepState::InProgress,
            },
        ];
        let prompt = PromptBuilder::new(100_000)
            .expect("builder")
            .execution(&ExecutionInput {
                context: &ctx,
                request: "report",
                plan: &plan,
                step: "summarize",
                history: "## fetch data\nrows",
                decision: Some("yes"),
            })
            .expect("render");

        assert!(prompt.contains("- [x] fetch data\n- [/] summarize"));
        assert!(prompt.contains("<step>\nsummarize\n</step>"));
        assert!(prompt.contains("User decision on the previous confirmation: yes"));
        assert!(!prompt.contains("### User Instructions"));
    }

    /// Verifies budget enforcement drops low-priority context first and cuts
    /// history from the front.
    #[test]
    fn budget_drops_context_then_trims_history_head() {
        let ctx = UserContext {
            skills: Some("skill ".repeat(100)),
            memories: vec![ContextFile {
                name: "m.md".to_string(),
                body: "memory ".repeat(100),
            }],
            ..user_context()
        };
        let history = format!("{}## latest\nnewest result", "old entry\n".repeat(200));
        let builder = PromptBuilder::new(900).expect("builder");
        let prompt = builder
            .finalization(&FinalizationInput {
                context: &ctx,
                request: "report",
                history: &history,
            })
            .expect("render");

        assert!(prompt.len() <= 900, "len {}", prompt.len());
        assert!(!prompt.contains("### Available Skills"));
        assert!(!prompt.contains("### User Memories"));
        assert!(prompt.contains("### Finalization Contract"));
        assert!(prompt.contains("report"));
        assert!(prompt.contains(TRUNCATED_NOTE.trim_end()));
        assert!(prompt.ends_with("newest result\n</history>"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut sections = vec![ParsedSection {
            key: "history".to_string(),
            required: false,
            content: "ёжик ".repeat(40),
        }];
        apply_budget_to_sections(&mut sections, 60);
        assert!(sections[0].content.starts_with(TRUNCATED_NOTE));
        assert!(total_len(&sections) <= 60);
    }
}
