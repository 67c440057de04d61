use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::process::Command;
use tracing::warn;

use crate::config::Settings;
use crate::errors::MetadataError;
use crate::media::{
    PlaylistItem, PlaylistMetadata, SingleVideoMetadata, VideoFormat, VideoMetadata,
};

static YOUTUBE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(https?://)?(www\.)?(youtube\.com|youtu\.be)/.+$").unwrap());

pub fn validate_youtube_url(url: &str) -> bool {
    YOUTUBE_URL.is_match(url)
}

/// Resolves a URL to its metadata without downloading anything.
///
/// `-j --flat-playlist` emits NDJSON: playlists produce one object per
/// entry (and sometimes a main playlist object), single videos produce
/// exactly one object with the full format list.
pub async fn fetch(settings: &Settings, url: &str) -> Result<VideoMetadata, MetadataError> {
    if !validate_youtube_url(url) {
        return Err(MetadataError::InvalidUrl);
    }

    let mut cmd = Command::new(&settings.ytdlp_bin);
    cmd.args(["-j", "--flat-playlist", "--no-warnings"]);
    if let Some(browser) = &settings.cookies_from_browser {
        cmd.args(["--cookies-from-browser", browser]);
    }
    cmd.arg(url);

    let output = cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("Metadata fetch failed for {}: {}", url, stderr.trim());
        return Err(MetadataError::Tool(stderr.trim().to_string()));
    }

    parse_metadata(&String::from_utf8_lossy(&output.stdout), url)
}

/// Builds the metadata union from the tool's NDJSON output. Three
/// scenarios: an explicit playlist object, a bare stream of more than one
/// video object (synthesized into a playlist), or a single video.
pub fn parse_metadata(stdout: &str, url: &str) -> Result<VideoMetadata, MetadataError> {
    let mut main_playlist: Option<Value> = None;
    let mut items: Vec<Value> = Vec::new();

    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let Ok(json) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if json.get("_type").and_then(Value::as_str) == Some("playlist")
            || json.get("entries").is_some()
        {
            main_playlist = Some(json);
        } else {
            items.push(json);
        }
    }

    if let Some(main) = main_playlist {
        let entries: Vec<Value> = match main.get("entries").and_then(Value::as_array) {
            Some(e) if !e.is_empty() => e.clone(),
            _ => items,
        };
        let item_count = main
            .get("playlist_count")
            .and_then(Value::as_u64)
            .map(|c| c as usize)
            .unwrap_or(entries.len());

        return Ok(VideoMetadata::Playlist(PlaylistMetadata {
            id: str_field(&main, "id"),
            title: str_field(&main, "title"),
            thumbnail: last_thumbnail(&main).unwrap_or_default(),
            uploader: uploader_of(&main),
            item_count,
            items: entries.iter().map(playlist_item).collect(),
            original_url: Some(url.to_string()),
        }));
    }

    if items.len() > 1 {
        // NDJSON stream of videos with no surrounding playlist object.
        let first = &items[0];
        return Ok(VideoMetadata::Playlist(PlaylistMetadata {
            id: "synthetic_playlist".to_string(),
            title: format!("Playlist ({} videos)", items.len()),
            thumbnail: last_thumbnail(first).unwrap_or_default(),
            uploader: "Unknown".to_string(),
            item_count: items.len(),
            items: items.iter().map(playlist_item).collect(),
            original_url: Some(url.to_string()),
        }));
    }

    let Some(video) = items.into_iter().next() else {
        return Err(MetadataError::NoMetadata);
    };

    let formats = video
        .get("formats")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(format_of).collect())
        .unwrap_or_default();

    Ok(VideoMetadata::Video(SingleVideoMetadata {
        id: str_field(&video, "id"),
        title: str_field(&video, "title"),
        thumbnail: last_thumbnail(&video).unwrap_or_default(),
        uploader: uploader_of(&video),
        duration: video.get("duration").and_then(Value::as_f64).unwrap_or(0.0),
        formats,
        description: video.get("description").and_then(Value::as_str).map(str::to_string),
        view_count: video.get("view_count").and_then(Value::as_u64),
        original_url: Some(url.to_string()),
    }))
}

fn str_field(value: &Value, key: &str) -> String {
    value.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn uploader_of(value: &Value) -> String {
    value
        .get("uploader")
        .or_else(|| value.get("channel"))
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string()
}

/// The last entry of `thumbnails` is the largest; fall back to the flat
/// `thumbnail` field.
fn last_thumbnail(value: &Value) -> Option<String> {
    value
        .get("thumbnails")
        .and_then(Value::as_array)
        .and_then(|t| t.last())
        .and_then(|t| t.get("url"))
        .and_then(Value::as_str)
        .or_else(|| value.get("thumbnail").and_then(Value::as_str))
        .map(str::to_string)
}

fn playlist_item(entry: &Value) -> PlaylistItem {
    let id = str_field(entry, "id");
    let url = entry
        .get("webpage_url")
        .or_else(|| entry.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", id));

    PlaylistItem {
        url,
        id,
        title: str_field(entry, "title"),
        duration: entry.get("duration").and_then(Value::as_f64).unwrap_or(0.0),
        uploader: uploader_of(entry),
        thumbnail: last_thumbnail(entry),
    }
}

fn format_of(value: &Value) -> Option<VideoFormat> {
    Some(VideoFormat {
        format_id: value.get("format_id").and_then(Value::as_str)?.to_string(),
        ext: str_field(value, "ext"),
        resolution: str_field(value, "resolution"),
        filesize: value
            .get("filesize")
            .or_else(|| value.get("filesize_approx"))
            .and_then(Value::as_u64),
        vcodec: value.get("vcodec").and_then(Value::as_str).map(str::to_string),
        acodec: value.get("acodec").and_then(Value::as_str).map(str::to_string),
        format_note: value.get("format_note").and_then(Value::as_str).map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        assert!(validate_youtube_url("https://www.youtube.com/watch?v=abc123"));
        assert!(validate_youtube_url("youtu.be/abc123"));
        assert!(validate_youtube_url("http://youtube.com/playlist?list=PL1"));
        assert!(!validate_youtube_url("https://example.com/watch?v=abc"));
        assert!(!validate_youtube_url(""));
        assert!(!validate_youtube_url("youtube.com"));
    }

    #[test]
    fn single_video_with_formats() {
        let ndjson = r#"{"id":"abc","title":"A Video","duration":213.0,"uploader":"Chan","thumbnails":[{"url":"small.jpg"},{"url":"big.jpg"}],"view_count":42,"formats":[{"format_id":"137","ext":"mp4","resolution":"1920x1080","vcodec":"avc1","acodec":"none"},{"resolution":"missing format_id, skipped"}]}"#;
        let meta = parse_metadata(ndjson, "https://youtu.be/abc").unwrap();
        match meta {
            VideoMetadata::Video(v) => {
                assert_eq!(v.id, "abc");
                assert_eq!(v.duration, 213.0);
                assert_eq!(v.thumbnail, "big.jpg");
                assert_eq!(v.uploader, "Chan");
                assert_eq!(v.formats.len(), 1);
                assert_eq!(v.formats[0].format_id, "137");
            }
            other => panic!("expected video, got {:?}", other),
        }
    }

    #[test]
    fn explicit_playlist_object() {
        let ndjson = concat!(
            r#"{"_type":"playlist","id":"PL1","title":"Mix","playlist_count":2,"channel":"Chan","entries":[{"id":"v1","title":"One","duration":10},{"id":"v2","title":"Two","url":"https://youtu.be/v2"}]}"#,
        );
        let meta = parse_metadata(ndjson, "https://youtube.com/playlist?list=PL1").unwrap();
        match meta {
            VideoMetadata::Playlist(p) => {
                assert_eq!(p.id, "PL1");
                assert_eq!(p.item_count, 2);
                assert_eq!(p.items[0].url, "https://www.youtube.com/watch?v=v1");
                assert_eq!(p.items[1].url, "https://youtu.be/v2");
                assert_eq!(p.uploader, "Chan");
            }
            other => panic!("expected playlist, got {:?}", other),
        }
    }

    #[test]
    fn bare_item_stream_becomes_synthetic_playlist() {
        let ndjson = "{\"id\":\"v1\",\"title\":\"One\"}\n{\"id\":\"v2\",\"title\":\"Two\"}\nnot json\n";
        let meta = parse_metadata(ndjson, "url").unwrap();
        match meta {
            VideoMetadata::Playlist(p) => {
                assert_eq!(p.id, "synthetic_playlist");
                assert_eq!(p.title, "Playlist (2 videos)");
                assert_eq!(p.items.len(), 2);
            }
            other => panic!("expected playlist, got {:?}", other),
        }
    }

    #[test]
    fn empty_output_is_an_error() {
        assert!(matches!(parse_metadata("", "url"), Err(MetadataError::NoMetadata)));
        assert!(matches!(parse_metadata("garbage\n", "url"), Err(MetadataError::NoMetadata)));
    }
}
