//! Generator agent: renders a task graph (or feedback on a previous script)
//! into one executable script.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::core::task_graph::TaskGraph;
use crate::core::types::DesignRequest;
use crate::error::GenerationError;
use crate::io::generator::Message;
use crate::io::prompt::{GeneratorPrompt, PromptEngine, TaskView};

use super::{AgentBase, extract_code};

const SYSTEM_PROMPT: &str = "You write Python scripts for a CAD engine's embedded interpreter. \
     You answer with one fenced python code block.";

/// What a generation call works from.
#[derive(Debug, Clone, Copy)]
pub struct GenerationInput<'a> {
    pub request: &'a DesignRequest,
    pub task_graph: Option<&'a TaskGraph>,
    /// Script of the previous attempt (refine path).
    pub previous_script: Option<&'a str>,
    /// Validator feedback, passed to the model verbatim.
    pub feedback: Option<&'a str>,
}

pub struct GeneratorAgent {
    base: AgentBase,
    prompts: Arc<PromptEngine>,
    allowed_modules: Vec<String>,
}

impl GeneratorAgent {
    pub fn new(base: AgentBase, prompts: Arc<PromptEngine>, allowed_modules: Vec<String>) -> Self {
        Self {
            base,
            prompts,
            allowed_modules,
        }
    }

    #[instrument(skip_all, fields(
        request_id = %input.request.id(),
        refine = input.feedback.is_some(),
    ))]
    pub fn generate(&self, input: GenerationInput<'_>) -> Result<String, GenerationError> {
        if input.task_graph.is_none() && input.previous_script.is_none() {
            return Err(GenerationError::MissingInput);
        }
        let levels = match input.task_graph {
            Some(graph) => TaskView::levels(graph, &graph.execution_order()?),
            None => Vec::new(),
        };

        let prompt = self
            .prompts
            .render_generator(&GeneratorPrompt {
                prompt: input.request.prompt(),
                levels,
                allowed_modules: self.allowed_modules.clone(),
                previous_script: input.previous_script,
                feedback: input.feedback,
            })
            .map_err(GenerationError::Prompt)?;
        let response = self.base.call_model(
            vec![Message::system(SYSTEM_PROMPT), Message::user(prompt)],
            "generate script",
        )?;

        let script = extract_code(&response.content);
        if script.is_empty() {
            return Err(GenerationError::EmptyScript);
        }
        info!(bytes = script.len(), lines = script.lines().count(), "script generated");
        Ok(script)
    }
}
