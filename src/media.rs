use serde::{Deserialize, Serialize};

/// One stream variant reported by the downloader for a single video.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VideoFormat {
    pub format_id: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleVideoMetadata {
    pub id: String,
    pub title: String,
    pub thumbnail: String,
    pub uploader: String,
    pub duration: f64,
    pub formats: Vec<VideoFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub uploader: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistMetadata {
    pub id: String,
    pub title: String,
    pub thumbnail: String,
    pub uploader: String,
    pub item_count: usize,
    pub items: Vec<PlaylistItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
}

/// What a URL resolves to: one video with its formats, or a playlist of
/// lightweight entries. Consumed read-only by the download pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VideoMetadata {
    Video(SingleVideoMetadata),
    Playlist(PlaylistMetadata),
}

/// Distinct vertical resolutions available for a single video, highest
/// first, each flagged with whether any stream at that height carries
/// audio. Playlists report no uniform quality set.
pub fn available_qualities(metadata: &VideoMetadata) -> Vec<QualityOption> {
    let VideoMetadata::Video(video) = metadata else {
        return Vec::new();
    };

    let mut map: Vec<(u32, bool)> = Vec::new();
    for format in &video.formats {
        if format.resolution.is_empty() || format.resolution == "audio only" {
            continue;
        }
        let Some(height) = format
            .resolution
            .split('x')
            .nth(1)
            .and_then(|h| h.parse::<u32>().ok())
        else {
            continue;
        };
        let has_audio = format.acodec.as_deref().is_some_and(|a| a != "none");
        match map.iter_mut().find(|(h, _)| *h == height) {
            Some(entry) => entry.1 |= has_audio,
            None => map.push((height, has_audio)),
        }
    }

    map.sort_by(|a, b| b.0.cmp(&a.0));
    map.into_iter()
        .map(|(height, has_audio)| QualityOption { quality: format!("{}p", height), has_audio })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityOption {
    pub quality: String,
    #[serde(rename = "hasAudio")]
    pub has_audio: bool,
}
