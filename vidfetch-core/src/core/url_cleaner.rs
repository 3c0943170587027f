use std::fmt;

use serde::Serialize;
use url::Url;

use crate::error::ValidationError;
use crate::models::platform::Platform;

/// A whitelisted, normalized URL. Only [`canonicalize`] builds one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CanonicalUrl {
    url: String,
    platform: Platform,
}

impl CanonicalUrl {
    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// YouTube ids are exactly this long; longer candidates are cut to it.
const YOUTUBE_ID_LEN: usize = 11;

/// Validates `raw` against the platform whitelist, extracts the content id
/// and rebuilds the URL in the platform's single canonical form. Tracking
/// and playlist parameters, ports, fragments and mobile hosts all fall away.
///
/// A whitelisted URL that names no video (a homepage, a playlist, a watch
/// page without `v`) is refused with [`ValidationError::NoContentId`].
///
/// Running it again on its own output returns the same value.
pub fn canonicalize(raw: &str, max_len: usize) -> Result<CanonicalUrl, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::Empty);
    }
    if raw.len() > max_len {
        return Err(ValidationError::TooLong { max: max_len });
    }

    let url = Url::parse(raw).map_err(|e| match e {
        url::ParseError::RelativeUrlWithoutBase => ValidationError::UnsupportedScheme,
        _ => ValidationError::Malformed,
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::UnsupportedScheme);
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(ValidationError::Credentials);
    }

    let host = url
        .host_str()
        .ok_or(ValidationError::Malformed)?
        .trim_end_matches('.')
        .to_ascii_lowercase();
    let platform = Platform::from_host(&host).ok_or(ValidationError::UnsupportedHost)?;

    let segments: Vec<&str> = url
        .path_segments()
        .map(|parts| parts.filter(|part| !part.is_empty()).collect())
        .unwrap_or_default();

    let canonical = match platform {
        Platform::YouTube => youtube_url(&host, &url, &segments),
        Platform::Facebook => facebook_url(&host, &url, &segments),
        Platform::Instagram => instagram_url(&segments),
        Platform::Twitter => twitter_url(&segments),
    }
    .ok_or(ValidationError::NoContentId {
        platform: platform.name(),
    })?;

    Ok(CanonicalUrl {
        url: canonical,
        platform,
    })
}

fn youtube_url(host: &str, url: &Url, segments: &[&str]) -> Option<String> {
    let candidate = if is_host(host, "youtu.be") {
        segments.first().map(|id| id.to_string())
    } else {
        query_value(url, "v").or_else(|| match segments {
            [kind, id, ..] if matches!(*kind, "embed" | "v" | "e" | "shorts" | "live") => {
                Some(id.to_string())
            }
            _ => None,
        })
    }?;

    let end = candidate
        .find(|c: char| !is_token_char(c))
        .unwrap_or(candidate.len());
    let id = candidate[..end].get(..YOUTUBE_ID_LEN)?;
    Some(format!("https://www.youtube.com/watch?v={}", id))
}

fn facebook_url(host: &str, url: &Url, segments: &[&str]) -> Option<String> {
    if is_host(host, "fb.watch") {
        let code = segments.first().filter(|code| is_token(code))?;
        return Some(format!("https://fb.watch/{}/", code));
    }

    if let Some(id) = segment_after(segments, "reel").filter(|id| is_numeric(id)) {
        return Some(format!("https://www.facebook.com/reel/{}", id));
    }
    if let Some(pos) = segments.iter().position(|part| *part == "share") {
        if let [kind @ ("v" | "r"), id, ..] = &segments[pos + 1..] {
            if is_token(id) {
                return Some(format!("https://www.facebook.com/share/{}/{}/", kind, id));
            }
        }
    }

    if let Some(id) = ["v", "video_id", "story_fbid"]
        .iter()
        .filter_map(|key| query_value(url, key))
        .find(|id| is_token(id))
    {
        return Some(facebook_watch(&id));
    }
    if let Some(pos) = segments.iter().position(|part| *part == "videos") {
        // `/videos/<id>` or `/videos/<title>/<id>`
        if let Some(id) = segments[pos + 1..].iter().take(2).find(|id| is_numeric(id)) {
            return Some(facebook_watch(id));
        }
    }
    if let Some(id) = segment_after(segments, "posts")
        .filter(|id| is_numeric(id) || (id.starts_with("pfbid") && is_token(id)))
    {
        return Some(facebook_watch(id));
    }
    if segments.first() == Some(&"groups") {
        if let Some(id) = segment_after(segments, "permalink").filter(|id| is_numeric(id)) {
            return Some(facebook_watch(id));
        }
    }
    if let Some(id) = segment_after(segments, "events").filter(|id| is_numeric(id)) {
        return Some(format!("https://www.facebook.com/events/{}", id));
    }
    None
}

fn facebook_watch(id: &str) -> String {
    format!("https://www.facebook.com/watch?v={}", id)
}

fn instagram_url(segments: &[&str]) -> Option<String> {
    if let Some(pos) = segments.iter().position(|part| *part == "stories") {
        match &segments[pos + 1..] {
            [owner, id, ..] if is_numeric(id) && is_username(owner) => {
                return Some(format!("https://www.instagram.com/stories/{}/{}/", owner, id));
            }
            [id, ..] if is_numeric(id) => {
                return Some(format!("https://www.instagram.com/stories/highlights/{}/", id));
            }
            _ => {}
        }
    }

    segments.windows(2).find_map(|pair| {
        let kind = match pair[0] {
            "p" => "p",
            "reel" | "reels" => "reel",
            "tv" => "tv",
            _ => return None,
        };
        is_token(pair[1]).then(|| format!("https://www.instagram.com/{}/{}/", kind, pair[1]))
    })
}

fn twitter_url(segments: &[&str]) -> Option<String> {
    let status = segment_after(segments, "status").or_else(|| segment_after(segments, "statuses"));
    if let Some(id) = status.filter(|id| is_numeric(id)) {
        return Some(format!("https://x.com/i/status/{}", id));
    }
    match segments {
        ["i", kind @ ("broadcasts" | "spaces"), id, ..] if is_token(id) => {
            Some(format!("https://x.com/i/{}/{}", kind, id))
        }
        _ => None,
    }
}

fn is_host(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// First non-empty value of `key`; later duplicates are ignored.
fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, v)| k == key && !v.is_empty())
        .map(|(_, v)| v.into_owned())
}

fn segment_after<'a>(segments: &[&'a str], marker: &str) -> Option<&'a str> {
    segments
        .windows(2)
        .find(|pair| pair[0] == marker)
        .map(|pair| pair[1])
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_token_char)
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_username(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| is_token_char(c) || c == '.')
}
