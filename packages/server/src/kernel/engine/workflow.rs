//! Workflow template loading and parameter injection.
//!
//! The engine consumes a directed graph of operations ("workflow") as JSON.
//! We ship a static text-to-image template with well-known injection points
//! and fill in the validated submission parameters per job.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::kernel::jobs::SubmissionParams;

/// Node ids of the template's injection points.
const NODE_SAMPLER: &str = "/3/inputs";
const NODE_CHECKPOINT: &str = "/4/inputs";
const NODE_LATENT: &str = "/5/inputs";
const NODE_POSITIVE: &str = "/6/inputs";
const NODE_NEGATIVE: &str = "/7/inputs";
const NODE_SAVE: &str = "/9/inputs";

#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    template: Value,
}

impl WorkflowTemplate {
    /// Load a template from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read workflow template {}", path.display()))?;
        let template = serde_json::from_str(&raw)
            .with_context(|| format!("workflow template {} is not valid JSON", path.display()))?;
        Ok(Self { template })
    }

    /// The built-in text-to-image template.
    pub fn builtin() -> Self {
        let template = serde_json::from_str(include_str!("../../../workflows/t2i_basic.json"))
            .expect("built-in workflow template is valid JSON");
        Self { template }
    }

    /// Render a workflow for one job: template plus injected parameters.
    pub fn render(&self, params: &SubmissionParams, seed: i64, filename_prefix: &str) -> Value {
        let mut workflow = self.template.clone();

        if let Some(inputs) = workflow.pointer_mut(NODE_SAMPLER) {
            inputs["seed"] = json!(seed);
            inputs["steps"] = json!(params.steps);
            inputs["cfg"] = json!(params.cfg_scale);
            inputs["sampler_name"] = json!(params.sampler.engine_name());
        }
        if let Some(inputs) = workflow.pointer_mut(NODE_CHECKPOINT) {
            if let Some(model) = &params.model {
                inputs["ckpt_name"] = json!(model);
            }
        }
        if let Some(inputs) = workflow.pointer_mut(NODE_LATENT) {
            inputs["width"] = json!(params.width);
            inputs["height"] = json!(params.height);
            inputs["batch_size"] = json!(params.batch_size);
        }
        if let Some(inputs) = workflow.pointer_mut(NODE_POSITIVE) {
            inputs["text"] = json!(params.prompt);
        }
        if let Some(inputs) = workflow.pointer_mut(NODE_NEGATIVE) {
            inputs["text"] = json!(params.negative_prompt.as_deref().unwrap_or(""));
        }
        if let Some(inputs) = workflow.pointer_mut(NODE_SAVE) {
            inputs["filename_prefix"] = json!(filename_prefix);
        }

        workflow
    }
}
