// Scene data shared by every stage of the pipeline.
//
// Stage 1 produces a JSON array of scene records, every later stage reads it
// back. Both directions go through `validate` so that a malformed file is
// caught before any expensive generation work starts.

mod cleaning;
mod fallback;
mod prompt;
mod scene;
mod slug;
mod validate;

pub use cleaning::extract_scene_candidates;
pub use fallback::fallback_scenes;
pub use prompt::{
    DEFAULT_NEGATIVE_PROMPT, ImagePrompt, PromptFormatter, StyledPromptFormatter,
};
pub use scene::{
    DEFAULT_SCENE_DURATION, MAX_SCENE_DURATION, MIN_SCENE_DURATION,
    ProjectScenes, Scene, SceneId, SceneRecord, VisualBreakdown,
    VisualDescription,
};
pub use slug::slugify;
pub use validate::{SchemaError, parse_scene_file, validate};
