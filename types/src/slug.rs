use regex::Regex;

const MAX_SLUG_CHARS: usize = 50;

/// Turn a display topic into a directory-safe slug.
///
/// `"Cats in Space!!!"` becomes `"cats_in_space"`. A topic with nothing
/// usable left becomes `"untitled"`.
///
/// # Errors
/// Only fails if the built-in patterns do not compile.
pub fn slugify(topic: &str) -> Result<String, regex::Error> {
    let unsafe_chars = Regex::new(r"[^\w\s-]")?;
    let whitespace = Regex::new(r"\s+")?;

    let cleaned = unsafe_chars.replace_all(topic, "");
    let joined = whitespace.replace_all(&cleaned, "_");

    let truncated: String = joined.chars().take(MAX_SLUG_CHARS).collect();
    let slug = truncated.trim_matches('_').to_lowercase();

    if slug.is_empty() {
        Ok("untitled".to_string())
    } else {
        Ok(slug)
    }
}
