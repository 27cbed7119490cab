use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};
use std::time::{Duration, Instant};

/// Separator some players put between artist and album when the album field is empty
pub const ARTIST_ALBUM_SEPARATOR: &str = " — ";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackInfo {
    pub title: String,
    pub artist: String,
    pub album_title: String,
    pub duration: Duration,
    pub position: Duration,
    pub playback_status: PlaybackStatus,
    pub thumbnail_url: Option<String>,
    pub album_url: Option<String>,
}

impl TrackInfo {
    /// A snapshot is publishable once it has a length, a title and an artist
    pub fn is_valid(&self) -> bool {
        !self.duration.is_zero() && !self.title.is_empty() && !self.artist.is_empty()
    }

    /// Split "Artist — Album" out of the artist field when no album was reported
    pub fn correct_details(&mut self) {
        if !self.album_title.is_empty() {
            return;
        }

        if let Some((artist, album)) = self.artist.split_once(ARTIST_ALBUM_SEPARATOR) {
            let (artist, album) = (artist.to_string(), album.to_string());
            self.artist = artist;
            self.album_title = album;
        }
    }

    /// Key used for artwork lookups
    pub fn artwork_key(&self) -> (String, String) {
        (self.artist.clone(), self.album_title.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Stopped,
    #[default]
    #[serde(other)]
    Other,
}

/// Fields a forced refresh should re-read from the live session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForceUpdateFlags(u32);

impl ForceUpdateFlags {
    pub const NONE: Self = Self(0);
    pub const TITLE: Self = Self(1 << 0);
    pub const ARTIST: Self = Self(1 << 1);
    pub const ALBUM: Self = Self(1 << 2);
    pub const DURATION: Self = Self(1 << 3);
    pub const POSITION: Self = Self(1 << 4);
    /// Not read from the session: `SessionMonitor::force_update` drops any artwork
    /// so the orchestrator's next artwork pass looks it up again
    pub const THUMBNAIL: Self = Self(1 << 5);
    pub const STATUS: Self = Self(1 << 6);

    /// Everything the session itself reports (artwork is resolved elsewhere)
    pub const SESSION: Self = Self(
        Self::TITLE.0
            | Self::ARTIST.0
            | Self::ALBUM.0
            | Self::DURATION.0
            | Self::POSITION.0
            | Self::STATUS.0,
    );
    pub const ALL: Self = Self(Self::SESSION.0 | Self::THUMBNAIL.0);

    /// True if any flag in `other` is set
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True if every flag in `other` is set
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ForceUpdateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ForceUpdateFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Link state of the IPC transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Where the orchestrator is in its connect/bridge cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BridgeState {
    #[default]
    Idle,
    WaitingForPeer,
    Connecting,
    Bridging,
    ShuttingDown,
}

#[derive(Debug, Clone, Default)]
pub struct AppState {
    pub bridge_state: BridgeState,
    pub connection: ConnectionState,
    pub session_attached: bool,
    pub current_track: Option<TrackInfo>,
    pub published_count: u64,
    pub last_published_at: Option<Instant>,
}
