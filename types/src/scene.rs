use serde::{Deserialize, Serialize};

pub type SceneId = u32;

pub const DEFAULT_SCENE_DURATION: u32 = 8;
pub const MIN_SCENE_DURATION: u32 = 3;
pub const MAX_SCENE_DURATION: u32 = 30;

/// The five-field description of a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualBreakdown {
    #[serde(default)]
    pub visual_subject: String,

    #[serde(default)]
    pub visual_action: String,

    #[serde(default)]
    pub background_environment: String,

    #[serde(default)]
    pub lighting: String,

    #[serde(default)]
    pub camera_shot: String,
}

impl VisualBreakdown {
    pub fn is_empty(&self) -> bool {
        [
            &self.visual_subject,
            &self.visual_action,
            &self.background_environment,
            &self.lighting,
            &self.camera_shot,
        ]
        .iter()
        .all(|field| field.trim().is_empty())
    }
}

/// Visual description as it appears on the wire.
///
/// Older scene files carry one combined `visual_prompt`; newer ones carry the
/// five-field breakdown. The legacy variant is tried first so that a record
/// with a `visual_prompt` is never read as an empty breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VisualDescription {
    Legacy { visual_prompt: String },
    Structured(VisualBreakdown),
}

impl VisualDescription {
    /// Coerce either shape into the five-field breakdown.
    ///
    /// A legacy prompt becomes the subject with every other field empty, so
    /// prompt construction treats it as one opaque description.
    pub fn normalize(self) -> VisualBreakdown {
        match self {
            Self::Legacy { visual_prompt } => VisualBreakdown {
                visual_subject: visual_prompt.trim().to_string(),
                ..VisualBreakdown::default()
            },
            Self::Structured(breakdown) => breakdown,
        }
    }
}

/// One scene exactly as read from JSON, before normalization.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SceneRecord {
    pub scene_id: SceneId,
    pub audio_text: String,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(flatten)]
    pub visual: VisualDescription,
}

impl SceneRecord {
    pub fn normalize(self) -> Scene {
        let duration = self.duration.map_or(DEFAULT_SCENE_DURATION, |d| {
            if d.is_finite() {
                // clamped first, so the cast cannot truncate
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let rounded = d
                    .round()
                    .clamp(f64::from(MIN_SCENE_DURATION), f64::from(MAX_SCENE_DURATION))
                    as u32;
                rounded
            } else {
                DEFAULT_SCENE_DURATION
            }
        });

        Scene {
            scene_id: self.scene_id,
            visual: self.visual.normalize(),
            audio_text: self.audio_text.trim().to_string(),
            duration,
        }
    }
}

/// Canonical scene used by every stage after validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub scene_id: SceneId,
    #[serde(flatten)]
    pub visual: VisualBreakdown,
    pub audio_text: String,
    pub duration: u32,
}

impl Scene {
    /// Scenes with no narration are skipped by the audio and merge stages.
    pub fn has_narration(&self) -> bool {
        !self.audio_text.trim().is_empty()
    }
}

/// The validated scene list of one project, ordered by `scene_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectScenes {
    pub topic: String,
    scenes: Vec<Scene>,
}

impl ProjectScenes {
    pub(crate) fn new(topic: &str, mut scenes: Vec<Scene>) -> Self {
        scenes.sort_by_key(|scene| scene.scene_id);
        Self {
            topic: topic.to_string(),
            scenes,
        }
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn get(&self, scene_id: SceneId) -> Option<&Scene> {
        self.scenes.iter().find(|scene| scene.scene_id == scene_id)
    }

    /// Keep at most `max` scenes, lowest ids first.
    #[must_use]
    pub fn limit(mut self, max: usize) -> Self {
        self.scenes.truncate(max.max(1));
        self
    }

    /// Serialize the scenes in the canonical five-field shape.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.scenes)
    }
}
