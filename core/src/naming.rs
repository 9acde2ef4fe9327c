//! Destination file names for downloaded media.
//!
//! Resolution order: explicit name, last url path segment,
//! `Content-Disposition` filename, then a generated unique name carrying the
//! caller's default suffix.

use percent_encoding::percent_decode_str;
use url::Url;
use uuid::Uuid;

pub fn resolve_file_name(
    explicit: Option<&str>,
    url: &str,
    content_disposition: Option<&str>,
    default_suffix: &str,
) -> String {
    explicit
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(sanitize_filename)
        .or_else(|| filename_from_url(url).map(|name| sanitize_filename(&name)))
        .or_else(|| {
            filename_from_content_disposition(content_disposition)
                .map(|name| sanitize_filename(&name))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| generated_name(default_suffix))
}

pub fn generated_name(default_suffix: &str) -> String {
    let suffix = sanitize_filename(default_suffix);
    let suffix = if suffix.is_empty() || suffix.starts_with('.') {
        suffix
    } else {
        format!(".{}", suffix)
    };
    format!("{}{}", Uuid::new_v4().simple(), suffix)
}

pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    Some(decode_component(segment)).filter(|name| !name.is_empty())
}

/// `filename*=` (RFC 5987, charset prefix dropped) wins over `filename=`.
pub fn filename_from_content_disposition(value: Option<&str>) -> Option<String> {
    let params: Vec<(String, &str)> = value?
        .split(';')
        .filter_map(|part| part.split_once('='))
        .map(|(key, raw)| (key.trim().to_ascii_lowercase(), raw.trim().trim_matches('"')))
        .collect();

    let extended = params
        .iter()
        .find(|(key, _)| key == "filename*")
        .map(|&(_, raw)| {
            let encoded = raw.split_once("''").map(|(_, rest)| rest).unwrap_or(raw);
            decode_component(encoded)
        });
    let plain = params
        .iter()
        .find(|(key, _)| key == "filename")
        .map(|&(_, raw)| raw.to_string());

    extended
        .filter(|name| !name.is_empty())
        .or(plain.filter(|name| !name.is_empty()))
}

/// Percent-decodes one path component; separators never survive decoding.
fn decode_component(value: &str) -> String {
    percent_decode_str(value)
        .decode_utf8_lossy()
        .chars()
        .map(|ch| if ch == '/' || ch == '\\' || ch.is_control() { '_' } else { ch })
        .collect()
}

/// Maps to a portable character set. May return an empty string.
fn sanitize_filename(name: &str) -> String {
    let mut out = String::new();
    let mut last_was_sep = false;
    for ch in name.chars() {
        let allowed =
            ch.is_alphanumeric() || matches!(ch, '.' | '_' | '-' | '(' | ')' | '[' | ']');
        let mapped = if allowed { ch } else { '_' };
        if mapped == '_' {
            if last_was_sep {
                continue;
            }
            last_was_sep = true;
        } else {
            last_was_sep = false;
        }
        out.push(mapped);
    }
    out.trim_matches('_').trim_start_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_path_segment_wins() {
        let name = resolve_file_name(
            None,
            "https://cdn.example.com/media/video.mp4",
            Some("attachment; filename=\"other.mp4\""),
            ".mp4",
        );
        assert_eq!(name, "video.mp4");
    }

    #[test]
    fn explicit_name_wins_over_everything() {
        let name = resolve_file_name(Some("clip.mkv"), "https://example.com/video.mp4", None, ".mp4");
        assert_eq!(name, "clip.mkv");
    }

    #[test]
    fn content_disposition_used_without_path_segment() {
        let name = resolve_file_name(
            None,
            "https://example.com/",
            Some("attachment; filename=\"movie.mp4\""),
            ".mp4",
        );
        assert_eq!(name, "movie.mp4");

        let star = filename_from_content_disposition(Some(
            "attachment; filename=\"a.mp4\"; filename*=UTF-8''b%20c.mp4",
        ));
        assert_eq!(star.as_deref(), Some("b c.mp4"));
    }

    #[test]
    fn generated_names_carry_suffix_and_never_collide() {
        let url = "https://example.com/";
        let first = resolve_file_name(None, url, None, ".mp4");
        let second = resolve_file_name(None, url, None, ".mp4");
        assert!(first.ends_with(".mp4"));
        assert!(second.ends_with(".mp4"));
        assert_ne!(first, second);
        assert!(generated_name("mp4").ends_with(".mp4"));
    }

    #[test]
    fn percent_encoded_segment_is_decoded_and_sanitized() {
        assert_eq!(
            resolve_file_name(None, "https://example.com/a/my%20video%3F.mp4", None, ".mp4"),
            "my_video_.mp4"
        );
        assert_eq!(
            filename_from_url("https://example.com/a/%2E%2E%2Fetc").as_deref(),
            Some(".._etc")
        );
    }

    #[test]
    fn multibyte_names_survive_decoding() {
        assert_eq!(
            resolve_file_name(None, "https://example.com/%E8%A7%86%E9%A2%91.mp4", None, ".mp4"),
            "视频.mp4"
        );
        assert_eq!(
            filename_from_content_disposition(Some("inline; FILENAME*=UTF-8''caf%C3%A9.mp4")).as_deref(),
            Some("café.mp4")
        );
    }
}
