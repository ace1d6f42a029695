use std::collections::HashSet;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::scene::{ProjectScenes, SceneId, SceneRecord};

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("scene list is empty")]
    Empty,
    #[error("scene file is not a JSON array")]
    NotAnArray,
    #[error("scene at index {index} is not a JSON object")]
    NotAnObject { index: usize },
    #[error("scene at index {index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("scene at index {index} has an invalid `{field}`: {reason}")]
    InvalidField {
        index: usize,
        field: &'static str,
        reason: String,
    },
    #[error("duplicate scene_id {0}")]
    DuplicateSceneId(SceneId),
    #[error("no JSON array found in model output")]
    NoJsonArray,
    #[error("model output could not be parsed: {0}")]
    Unparseable(String),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to compile pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Validate raw scene candidates and produce the canonical scene list.
///
/// Fails on an empty array, on records missing `scene_id` or `audio_text`
/// and on duplicate ids. The returned scenes are ordered by `scene_id`, not
/// by their position in `raw_candidates`. An empty `audio_text` string is
/// accepted here; the stages that need narration skip that scene.
///
/// # Errors
/// Returns the first `SchemaError` found.
pub fn validate(
    raw_candidates: &[Value],
    topic: &str,
) -> Result<ProjectScenes, SchemaError> {
    if raw_candidates.is_empty() {
        return Err(SchemaError::Empty);
    }

    let mut seen = HashSet::new();
    let mut scenes = Vec::with_capacity(raw_candidates.len());

    for (index, candidate) in raw_candidates.iter().enumerate() {
        let Value::Object(object) = candidate else {
            return Err(SchemaError::NotAnObject { index });
        };

        let object = coerce_fields(index, object)?;

        let record: SceneRecord = serde_json::from_value(Value::Object(object))
            .map_err(|e| SchemaError::InvalidField {
                index,
                field: "visual",
                reason: e.to_string(),
            })?;

        if !seen.insert(record.scene_id) {
            return Err(SchemaError::DuplicateSceneId(record.scene_id));
        }

        scenes.push(record.normalize());
    }

    Ok(ProjectScenes::new(topic, scenes))
}

/// Parse the contents of a `*_scenes.json` file and validate it.
///
/// # Errors
/// Returns `SchemaError::Json` for malformed JSON, `SchemaError::NotAnArray`
/// when the top level is not an array, and any validation error.
pub fn parse_scene_file(
    contents: &str,
    topic: &str,
) -> Result<ProjectScenes, SchemaError> {
    match serde_json::from_str::<Value>(contents)? {
        Value::Array(candidates) => validate(&candidates, topic),
        _ => Err(SchemaError::NotAnArray),
    }
}

// Checks the required fields and coerces the numeric ones, so that
// `"scene_id": "3"` and `"duration": "8"` from a model are accepted.
fn coerce_fields(
    index: usize,
    object: &Map<String, Value>,
) -> Result<Map<String, Value>, SchemaError> {
    let mut object = object.clone();

    let scene_id = match object.get("scene_id") {
        None | Some(Value::Null) => {
            return Err(SchemaError::MissingField {
                index,
                field: "scene_id",
            });
        }
        Some(value) => parse_scene_id(value).ok_or_else(|| {
            SchemaError::InvalidField {
                index,
                field: "scene_id",
                reason: format!("expected a positive integer, got {value}"),
            }
        })?,
    };
    object.insert("scene_id".to_string(), Value::from(scene_id));

    match object.get("audio_text") {
        None | Some(Value::Null) => {
            return Err(SchemaError::MissingField {
                index,
                field: "audio_text",
            });
        }
        Some(Value::String(_)) => {}
        Some(other) => {
            return Err(SchemaError::InvalidField {
                index,
                field: "audio_text",
                reason: format!("expected a string, got {other}"),
            });
        }
    }

    match object.get("duration") {
        Some(Value::String(s)) => {
            let parsed = s.trim().parse::<f64>().ok().map(Value::from);
            object.insert("duration".to_string(), parsed.unwrap_or(Value::Null));
        }
        Some(Value::Number(_) | Value::Null) | None => {}
        Some(_) => {
            object.insert("duration".to_string(), Value::Null);
        }
    }

    Ok(object)
}

fn parse_scene_id(value: &Value) -> Option<SceneId> {
    let id = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    SceneId::try_from(id).ok().filter(|id| *id > 0)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn ids(project: &ProjectScenes) -> Vec<SceneId> {
        project.scenes().iter().map(|s| s.scene_id).collect()
    }

    #[test]
    fn rejects_empty_array() {
        assert!(matches!(validate(&[], "t"), Err(SchemaError::Empty)));
    }

    #[test]
    fn rejects_missing_audio_text() {
        let raw = vec![
            json!({"scene_id": 1, "audio_text": "Hello", "visual_prompt": "a"}),
            json!({"scene_id": 2, "visual_prompt": "b"}),
        ];

        let err = validate(&raw, "t").unwrap_err();
        assert!(matches!(
            err,
            SchemaError::MissingField {
                index: 1,
                field: "audio_text"
            }
        ));
    }

    #[test]
    fn rejects_missing_scene_id() {
        let raw = vec![json!({"audio_text": "Hello"})];

        let err = validate(&raw, "t").unwrap_err();
        assert!(matches!(
            err,
            SchemaError::MissingField {
                index: 0,
                field: "scene_id"
            }
        ));
    }

    #[test]
    fn rejects_duplicate_scene_ids() {
        let raw = vec![
            json!({"scene_id": 4, "audio_text": "a"}),
            json!({"scene_id": 2, "audio_text": "b"}),
            json!({"scene_id": "4", "audio_text": "c"}),
        ];

        let err = validate(&raw, "t").unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateSceneId(4)));
    }

    #[test]
    fn rejects_zero_and_negative_ids() {
        for id in [json!(0), json!(-3), json!(1.5), json!("abc")] {
            let raw = vec![json!({"scene_id": id, "audio_text": "a"})];
            assert!(matches!(
                validate(&raw, "t"),
                Err(SchemaError::InvalidField {
                    field: "scene_id",
                    ..
                })
            ));
        }
    }

    #[test]
    fn rejects_non_object_entries() {
        let raw = vec![json!({"scene_id": 1, "audio_text": "a"}), json!("x")];
        assert!(matches!(
            validate(&raw, "t"),
            Err(SchemaError::NotAnObject { index: 1 })
        ));
    }

    #[test]
    fn orders_by_scene_id_not_position() {
        let raw = vec![
            json!({"scene_id": 10, "audio_text": "ten"}),
            json!({"scene_id": 2, "audio_text": "two"}),
            json!({"scene_id": 1, "audio_text": "one"}),
        ];

        let project = validate(&raw, "Counting").unwrap();
        assert_eq!(ids(&project), vec![1, 2, 10]);
        assert_eq!(project.get(10).unwrap().audio_text, "ten");
        assert_eq!(project.topic, "Counting");
    }

    #[test]
    fn accepts_empty_narration() {
        let raw = vec![
            json!({"scene_id": 1, "audio_text": "Hello", "duration": 5}),
            json!({"scene_id": 2, "audio_text": "", "duration": 5}),
        ];

        let project = validate(&raw, "t").unwrap();
        assert!(project.get(1).unwrap().has_narration());
        assert!(!project.get(2).unwrap().has_narration());
    }

    #[test]
    fn accepts_both_visual_shapes_in_one_file() {
        let raw = vec![
            json!({"scene_id": 1, "audio_text": "a", "visual_prompt": "old style"}),
            json!({
                "scene_id": 2,
                "audio_text": "b",
                "visual_subject": "new",
                "lighting": "soft",
                "duration": "7"
            }),
        ];

        let project = validate(&raw, "t").unwrap();
        assert_eq!(project.get(1).unwrap().visual.visual_subject, "old style");
        assert_eq!(project.get(2).unwrap().visual.lighting, "soft");
        assert_eq!(project.get(2).unwrap().duration, 7);
    }

    #[test]
    fn parses_scene_file_contents() {
        let contents = r#"[{"scene_id": 1, "audio_text": "Hi"}]"#;
        let project = parse_scene_file(contents, "t").unwrap();
        assert_eq!(project.len(), 1);

        assert!(matches!(
            parse_scene_file(r#"{"scene_id": 1}"#, "t"),
            Err(SchemaError::NotAnArray)
        ));
        assert!(matches!(
            parse_scene_file("not json", "t"),
            Err(SchemaError::Json(_))
        ));
    }
}
