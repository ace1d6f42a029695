use crate::scene::{
    DEFAULT_SCENE_DURATION, ProjectScenes, Scene, VisualBreakdown,
};

/// Generic placeholder scenes used when text generation never produced a
/// parseable scene list and the fallback policy allows continuing.
pub fn fallback_scenes(topic: &str) -> ProjectScenes {
    let beats = [
        (
            "a wide establishing view introducing the subject",
            "slow push in",
            format!("Welcome. Today we explore {topic}."),
        ),
        (
            "a detailed look at the most striking aspect of the subject",
            "gentle pan across the frame",
            "Let's dive deeper and uncover what makes it fascinating.".to_string(),
        ),
        (
            "a calm closing image of the subject",
            "slow pull back",
            "Thank you for watching. Stay curious.".to_string(),
        ),
    ];

    let scenes = beats
        .into_iter()
        .zip(1..)
        .map(|((subject, camera, narration), scene_id)| Scene {
            scene_id,
            visual: VisualBreakdown {
                visual_subject: format!("{topic}, {subject}"),
                visual_action: String::new(),
                background_environment: "cinematic environment".to_string(),
                lighting: "soft natural lighting".to_string(),
                camera_shot: camera.to_string(),
            },
            audio_text: narration,
            duration: DEFAULT_SCENE_DURATION,
        })
        .collect();

    ProjectScenes::new(topic, scenes)
}
