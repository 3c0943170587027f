use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static UNSAFE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9 _-]").unwrap());

const MAX_STEM_CHARS: usize = 100;
const MAX_EXT_CHARS: usize = 8;
const FALLBACK_STEM: &str = "video";
const FALLBACK_EXT: &str = "mp4";

/// Reduces a title to `[A-Za-z0-9 _-]`, folding accents first.
pub fn sanitize_stem(name: &str) -> String {
    let folded: String = name.nfkd().filter(char::is_ascii).collect();
    let cleaned = UNSAFE_RE.replace_all(&folded, "");
    let collapsed = WS_RE.replace_all(cleaned.trim(), " ");
    let truncated: String = collapsed.chars().take(MAX_STEM_CHARS).collect();
    let truncated = truncated.trim();

    if truncated.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        truncated.to_string()
    }
}

pub fn sanitize_extension(ext: &str) -> String {
    let ext: String = ext
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(MAX_EXT_CHARS)
        .collect::<String>()
        .to_ascii_lowercase();
    if ext.is_empty() {
        FALLBACK_EXT.to_string()
    } else {
        ext
    }
}

pub fn display_name(stem: &str, ext: &str) -> String {
    format!("{}.{}", sanitize_stem(stem), sanitize_extension(ext))
}

/// Sanitizes a full `stem.ext` name; a missing extension becomes `mp4`.
pub fn sanitize_display_name(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => display_name(stem, ext),
        _ => display_name(name, FALLBACK_EXT),
    }
}
