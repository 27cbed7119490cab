use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{PlaybackStatus, TrackInfo};

/// Activity type shown as "Listening to ..."
pub const ACTIVITY_LISTENING: u8 = 2;

/// Longest text the peer accepts in a single activity field
pub const MAX_FIELD_BYTES: usize = 128;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Activity {
    #[serde(rename = "type")]
    pub kind: u8,
    pub details: String,
    pub state: String,
    pub assets: Assets,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Timestamps>,
    pub buttons: Vec<Button>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Assets {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_text: Option<String>,
    pub large_image: String,
}

/// Unix timestamps in seconds
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Timestamps {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Button {
    pub label: String,
    pub url: String,
}

/// Fixed strings used when a track has no artwork or album page
#[derive(Debug, Clone)]
pub struct PresenceStyle {
    pub fallback_image: String,
    pub fallback_url: String,
    pub button_label: String,
}

impl Default for PresenceStyle {
    fn default() -> Self {
        Self {
            fallback_image: "apple_music_logo".to_string(),
            fallback_url: "https://music.apple.com/".to_string(),
            button_label: "Listen to Album".to_string(),
        }
    }
}

/// Current wall clock as unix seconds
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Build the presence activity for a track at wall-clock time `now` (unix seconds)
pub fn build_activity(track: &TrackInfo, now: i64, style: &PresenceStyle) -> Activity {
    let state = match track.playback_status {
        PlaybackStatus::Paused => format!("Paused | {}", track.artist),
        _ => track.artist.clone(),
    };

    let large_text = (!track.album_title.is_empty()).then(|| clamp(&track.album_title));

    let large_image = match track.thumbnail_url.as_deref() {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => style.fallback_image.clone(),
    };

    // Only a playing track gets a progress bar
    let timestamps = (track.playback_status == PlaybackStatus::Playing).then(|| {
        let start = now - track.position.as_secs() as i64;
        Timestamps {
            start,
            end: start + track.duration.as_secs() as i64,
        }
    });

    let url = match track.album_url.as_deref() {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => style.fallback_url.clone(),
    };

    Activity {
        kind: ACTIVITY_LISTENING,
        details: clamp(&track.title),
        state: clamp(&state),
        assets: Assets {
            large_text,
            large_image,
        },
        timestamps,
        buttons: vec![Button {
            label: style.button_label.clone(),
            url,
        }],
    }
}

/// Truncate to the peer's field limit without splitting a character
fn clamp(text: &str) -> String {
    if text.len() <= MAX_FIELD_BYTES {
        return text.to_string();
    }

    let mut end = MAX_FIELD_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn playing_track() -> TrackInfo {
        TrackInfo {
            title: "Song".to_string(),
            artist: "Band".to_string(),
            album_title: "Album".to_string(),
            duration: Duration::from_secs(200),
            position: Duration::from_secs(30),
            playback_status: PlaybackStatus::Playing,
            thumbnail_url: None,
            album_url: None,
        }
    }

    #[test]
    fn test_playing_payload_has_timestamps() {
        let now = 1_700_000_000;
        let activity = build_activity(&playing_track(), now, &PresenceStyle::default());

        let timestamps = activity.timestamps.unwrap();
        assert_eq!(timestamps.start, now - 30);
        assert_eq!(timestamps.end, now + 170);
        assert_eq!(activity.state, "Band");
        assert_eq!(activity.details, "Song");
        assert_eq!(activity.kind, 2);
    }

    #[test]
    fn test_paused_payload_prefixes_state_and_drops_timestamps() {
        let mut track = playing_track();
        track.playback_status = PlaybackStatus::Paused;

        let activity = build_activity(&track, 1_700_000_000, &PresenceStyle::default());
        assert_eq!(activity.state, "Paused | Band");

        let json = serde_json::to_value(&activity).unwrap();
        assert!(json.get("timestamps").is_none());
    }

    #[test]
    fn test_stopped_payload_has_no_timestamps() {
        let mut track = playing_track();
        track.playback_status = PlaybackStatus::Stopped;

        let activity = build_activity(&track, 0, &PresenceStyle::default());
        assert!(activity.timestamps.is_none());
        assert_eq!(activity.state, "Band");
    }

    #[test]
    fn test_fallback_assets_and_button() {
        let mut track = playing_track();
        track.album_title.clear();

        let activity = build_activity(&track, 0, &PresenceStyle::default());
        let json = serde_json::to_value(&activity).unwrap();

        assert_eq!(json["assets"]["large_image"], "apple_music_logo");
        assert!(json["assets"].get("large_text").is_none());
        assert_eq!(json["buttons"][0]["label"], "Listen to Album");
        assert_eq!(json["buttons"][0]["url"], "https://music.apple.com/");
        assert_eq!(json["type"], 2);
    }

    #[test]
    fn test_resolved_artwork_is_used() {
        let mut track = playing_track();
        track.thumbnail_url = Some("https://img.example/100x100.jpg".to_string());
        track.album_url = Some("https://music.example/album/1".to_string());

        let activity = build_activity(&track, 0, &PresenceStyle::default());
        assert_eq!(activity.assets.large_image, "https://img.example/100x100.jpg");
        assert_eq!(activity.assets.large_text.as_deref(), Some("Album"));
        assert_eq!(activity.buttons[0].url, "https://music.example/album/1");
    }

    #[test]
    fn test_long_fields_clamped_on_char_boundary() {
        let mut track = playing_track();
        track.title = "é".repeat(100);

        let activity = build_activity(&track, 0, &PresenceStyle::default());
        assert!(activity.details.len() <= MAX_FIELD_BYTES);
        assert_eq!(activity.details.chars().count(), 64);
    }
}
