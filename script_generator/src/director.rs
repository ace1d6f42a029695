//! Instructions given to the text model.

pub const SYSTEM_PROMPT: &str = r#"You are a film director writing the storyboard for a short narrated video.

Answer with a JSON array and nothing else: no markdown, no commentary.
Each element describes one scene:

{
  "scene_id": 1,
  "visual_subject": "who or what is on screen",
  "visual_action": "what the subject is doing",
  "background_environment": "where the scene takes place",
  "lighting": "light quality, direction and color",
  "camera_shot": "shot size, angle and lens",
  "audio_text": "narration for this scene, at most two sentences",
  "duration": 8
}

Rules:
- scene_id counts up from 1.
- duration is in seconds, between 3 and 30.
- Keep the subject and visual style consistent from scene to scene.
- The narration tells one story with a beginning, a middle and an end.
- Visual fields describe only what a camera can see; never put text or
  captions in the picture."#;

pub fn user_prompt(topic: &str, max_scenes: usize) -> String {
    let upper = max_scenes.clamp(1, 6);
    let lower = upper.min(4);
    if lower == upper {
        format!("Write a storyboard of {upper} scenes about: {topic}")
    } else {
        format!("Write a storyboard of {lower} to {upper} scenes about: {topic}")
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::user_prompt;

    #[test]
    fn test_user_prompt_scene_range() {
        assert_eq!(
            user_prompt("the history of coffee", 10),
            "Write a storyboard of 4 to 6 scenes about: the history of coffee"
        );
        assert_eq!(
            user_prompt("tea", 2),
            "Write a storyboard of 2 scenes about: tea"
        );
    }
}
