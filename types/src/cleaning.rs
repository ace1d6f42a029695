use regex::Regex;
use serde_json::Value;

use crate::validate::SchemaError;

/// Extract the scene candidates from free-form model output.
///
/// Language models wrap JSON in markdown fences, add chatter around it,
/// drop the comma between objects, leave trailing commas, or split one list
/// into several arrays. This undoes those failure modes and returns the
/// objects of every array it can parse, in order.
///
/// # Errors
/// Returns `SchemaError::NoJsonArray` if the text holds no array at all and
/// `SchemaError::Unparseable` if none of the arrays parse.
pub fn extract_scene_candidates(raw: &str) -> Result<Vec<Value>, SchemaError> {
    let fence = Regex::new(r"```(?:json)?\s*")?;
    let text = fence.replace_all(raw, "");

    let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) else {
        return Err(SchemaError::NoJsonArray);
    };
    if start >= end {
        return Err(SchemaError::NoJsonArray);
    }

    // whole span first, it survives nested arrays inside objects
    let span = repair(&text[start..=end])?;
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&span) {
        return Ok(items);
    }

    let array = Regex::new(r"\[[\s\S]*?\]")?;
    let mut candidates = Vec::new();
    let mut found = 0;
    for m in array.find_iter(&text) {
        found += 1;
        let fixed = repair(m.as_str())?;
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&fixed) {
            candidates.extend(items);
        }
    }

    if candidates.is_empty() {
        return Err(SchemaError::Unparseable(format!(
            "{found} array(s) found, none parsed"
        )));
    }
    Ok(candidates)
}

fn repair(fragment: &str) -> Result<String, SchemaError> {
    let missing_comma = Regex::new(r"\}\s*\{")?;
    let trailing_bracket = Regex::new(r",\s*\]")?;
    let trailing_brace = Regex::new(r",\s*\}")?;

    let fixed = missing_comma.replace_all(fragment, "}, {");
    let fixed = trailing_bracket.replace_all(&fixed, "]");
    let fixed = trailing_brace.replace_all(&fixed, "}");
    Ok(fixed.into_owned())
}
