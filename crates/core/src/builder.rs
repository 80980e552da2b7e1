//! Materializes a submittable job from a template plus runtime parameters.
//!
//! Every node is classified into a [`NodeRole`] by its normalized class
//! type; each role has exactly one substitution rule. Unrecognized nodes
//! pass through untouched.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::template::{JobTemplate, TemplateNode};
use crate::types::NodeId;

/// Value forced into a sampler's `preview_method` input.
pub const PREVIEW_METHOD_AUTO: &str = "auto";

const TEXT_INPUT: &str = "text";
const SEED_INPUT: &str = "seed";
const PREVIEW_METHOD_INPUT: &str = "preview_method";
const IMAGE_INPUT: &str = "image";
const FILENAME_PREFIX_INPUT: &str = "filename_prefix";

/// The part a node plays in a booth workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    TextPrompt,
    Sampler,
    ImageLoad,
    ImageSave,
    /// Not one of ours; submitted as-is.
    Passthrough,
}

impl NodeRole {
    /// Classify a ComfyUI class type. Matching ignores case and spaces.
    pub fn classify(class_type: &str) -> Self {
        match normalize_class_type(class_type).as_str() {
            "textmultiline" | "textmultilinewidget" | "textmultilineprompt" => Self::TextPrompt,
            "ksampler" | "ksampler(efficient)" => Self::Sampler,
            "loadimage" => Self::ImageLoad,
            "saveimage" => Self::ImageSave,
            _ => Self::Passthrough,
        }
    }
}

fn normalize_class_type(class_type: &str) -> String {
    class_type
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// How the sampler seed is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedPolicy {
    /// Fresh uniform seed in `[0, 2^32)` on every build.
    #[default]
    Random,
    Fixed(u32),
}

impl SeedPolicy {
    fn next(self) -> u32 {
        match self {
            Self::Random => rand::random::<u32>(),
            Self::Fixed(seed) => seed,
        }
    }
}

/// Per-submission runtime values.
#[derive(Debug, Clone)]
pub struct JobParameters {
    pub prompt_text: String,
    pub seed: SeedPolicy,
    /// Image reference handed to the load-image node (a path the
    /// service can read).
    pub source_image_ref: String,
    /// Output-name prefix for the save-image node.
    pub output_tag: String,
}

/// A fully-resolved graph ready for submission. Never mutated after build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmittedJob {
    nodes: BTreeMap<NodeId, TemplateNode>,
    #[serde(skip)]
    outputs: Vec<(NodeId, u32)>,
}

impl SubmittedJob {
    pub fn node(&self, id: &str) -> Option<&TemplateNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &TemplateNode)> {
        self.nodes.iter()
    }

    /// `(node, output slot)` pairs the service should execute to.
    pub fn desired_outputs(&self) -> &[(NodeId, u32)] {
        &self.outputs
    }

    /// The graph in ComfyUI's API format.
    pub fn to_prompt_json(&self) -> Value {
        serde_json::to_value(&self.nodes).unwrap_or(Value::Null)
    }
}

/// Build a [`SubmittedJob`] from a deep copy of `template`.
pub fn build(template: &JobTemplate, params: &JobParameters) -> SubmittedJob {
    let mut nodes = template.to_nodes();
    let mut outputs = Vec::new();

    for (id, node) in nodes.iter_mut() {
        let role = NodeRole::classify(&node.class_type);
        let inputs = &mut node.inputs;
        match role {
            NodeRole::TextPrompt => {
                inputs.insert(TEXT_INPUT.into(), Value::from(params.prompt_text.clone()));
            }
            NodeRole::Sampler => {
                inputs.insert(SEED_INPUT.into(), Value::from(params.seed.next()));
                if let Some(preview) = inputs.get_mut(PREVIEW_METHOD_INPUT) {
                    tracing::debug!(node = %id, previous = %preview, "Forcing preview method to auto");
                    *preview = Value::from(PREVIEW_METHOD_AUTO);
                }
            }
            NodeRole::ImageLoad => {
                inputs.insert(
                    IMAGE_INPUT.into(),
                    Value::from(params.source_image_ref.clone()),
                );
            }
            NodeRole::ImageSave => {
                inputs.insert(
                    FILENAME_PREFIX_INPUT.into(),
                    Value::from(params.output_tag.clone()),
                );
                outputs.push((id.clone(), 0));
            }
            NodeRole::Passthrough => {}
        }
    }

    tracing::debug!(nodes = nodes.len(), outputs = outputs.len(), "Built job");
    SubmittedJob { nodes, outputs }
}
