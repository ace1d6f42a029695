use serde::{Deserialize, Serialize};

use crate::scene::Scene;

pub const DEFAULT_NEGATIVE_PROMPT: &str = "ugly, poorly drawn, bad anatomy, extra limb, missing limb, mutation, blurry, watermark, text, signature, low quality, jpeg artifacts";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImagePrompt {
    pub positive: String,
    pub negative: String,
}

/// Turns a canonical scene into a prompt for the image engine.
pub trait PromptFormatter {
    fn format(&self, scene: &Scene) -> ImagePrompt;
}

/// Ordered assembly: style prefix, subject and action, environment,
/// lighting and camera, quality tags, style suffix. Empty parts are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyledPromptFormatter {
    #[serde(default)]
    pub style_prefix: String,
    #[serde(default)]
    pub quality_tags: String,
    #[serde(default)]
    pub style_suffix: String,
    #[serde(default)]
    pub negative_prompt: String,
}

impl PromptFormatter for StyledPromptFormatter {
    fn format(&self, scene: &Scene) -> ImagePrompt {
        let visual = &scene.visual;
        let subject_action = join_non_empty(
            " ",
            &[visual.visual_subject.as_str(), visual.visual_action.as_str()],
        );
        let lighting_camera = join_non_empty(
            ", ",
            &[visual.lighting.as_str(), visual.camera_shot.as_str()],
        );

        let positive = join_non_empty(
            ", ",
            &[
                self.style_prefix.as_str(),
                subject_action.as_str(),
                visual.background_environment.as_str(),
                lighting_camera.as_str(),
                self.quality_tags.as_str(),
                self.style_suffix.as_str(),
            ],
        );

        ImagePrompt {
            positive,
            negative: self.negative_prompt.trim().to_string(),
        }
    }
}

fn join_non_empty(separator: &str, parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}
