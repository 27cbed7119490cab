//! Media session monitoring
//!
//! `SessionMonitor` follows the one media session that belongs to the target
//! application and keeps a snapshot of its track. It is fed by a
//! [`SessionSource`], which pushes change events and answers synchronous pulls.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use crate::artwork::Artwork;
use crate::error::SessionError;
use crate::types::{ForceUpdateFlags, PlaybackStatus, TrackInfo};

/// Identifies one session within a source
pub type SessionKey = String;

/// Track facts as the session reports them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTrack {
    pub title: String,
    pub artist: String,
    pub album_title: String,
    pub playback_status: PlaybackStatus,
    pub position: Duration,
    pub duration: Duration,
}

/// One entry of the source's session list
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub key: SessionKey,
    /// Identity of the application that owns the session
    pub app_id: String,
    /// Last time the session reported activity, if the source knows
    pub last_active: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The set of available sessions changed
    SessionSetChanged,
    PropertiesChanged(SessionKey),
    PlaybackChanged(SessionKey),
}

pub type EventHandler = Arc<dyn Fn(&EventKind) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Push/pull access to the platform's media sessions.
///
/// Implementations must not hold their own locks while running event
/// handlers: handlers call back into `sessions`/`pull`/`subscribe`.
pub trait SessionSource: Send + Sync {
    fn sessions(&self) -> Result<Vec<SessionInfo>, SessionError>;

    fn pull(&self, key: &str) -> Result<RawTrack, SessionError>;

    /// For `SessionSetChanged` the handler sees every event; the per-session
    /// kinds only fire for their own key.
    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}

pub type UpdateHandler = Arc<dyn Fn(&TrackInfo) + Send + Sync>;
pub type AttachHandler = Arc<dyn Fn(bool) + Send + Sync>;

struct Attached {
    key: SessionKey,
    subscriptions: Vec<SubscriptionId>,
}

#[derive(Default)]
struct Slot {
    session: Option<Attached>,
    track: Option<TrackInfo>,
    captured_at: Option<Instant>,
    set_subscription: Option<SubscriptionId>,
}

pub struct SessionMonitor {
    source: Arc<dyn SessionSource>,
    target_app: String,
    seek_tolerance: Duration,
    slot: Mutex<Slot>,
    handler: Mutex<Option<UpdateHandler>>,
    attach_handler: Mutex<Option<AttachHandler>>,
    attached: Mutex<bool>,
    attach_changed: Condvar,
    stopped: AtomicBool,
    this: Weak<SessionMonitor>,
}

impl SessionMonitor {
    pub fn new(
        source: Arc<dyn SessionSource>,
        target_app: impl Into<String>,
        seek_tolerance: Duration,
    ) -> Arc<Self> {
        let target_app = target_app.into();
        Arc::new_cyclic(|this| Self {
            source,
            target_app,
            seek_tolerance,
            slot: Mutex::new(Slot::default()),
            handler: Mutex::new(None),
            attach_handler: Mutex::new(None),
            attached: Mutex::new(false),
            attach_changed: Condvar::new(),
            stopped: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Subscribe to session-set changes and adopt a target session if one exists
    pub fn initialize(&self) {
        {
            let mut slot = self.slot.lock();
            if slot.set_subscription.is_none() {
                let id = self
                    .source
                    .subscribe(EventKind::SessionSetChanged, self.event_handler());
                slot.set_subscription = Some(id);
            }
        }

        self.refresh_sessions();
    }

    /// Replace the update handler
    pub fn set_update_handler<F>(&self, handler: F)
    where
        F: Fn(&TrackInfo) + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    /// Replace the attach/detach handler.
    ///
    /// Runs while the snapshot lock is held, so it sees events in order; it must
    /// not call back into the monitor.
    pub fn set_attach_handler<F>(&self, handler: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        *self.attach_handler.lock() = Some(Arc::new(handler));
    }

    /// Re-read `flags` from the live session and merge them into the snapshot.
    ///
    /// `THUMBNAIL` only drops the current artwork; lookups happen in the bridge.
    pub fn force_update(&self, flags: ForceUpdateFlags, invoke_handler: bool) -> Option<TrackInfo> {
        let snapshot = {
            let mut slot = self.slot.lock();
            let key = slot.session.as_ref()?.key.clone();
            slot.track.as_ref()?;

            let raw = match self.source.pull(&key) {
                Ok(raw) => Some(raw),
                Err(e) => {
                    log::debug!("Forced refresh of {} failed: {}", key, e);
                    None
                }
            };

            let slot = &mut *slot;
            let track = slot.track.as_mut()?;
            let artwork_key = track.artwork_key();
            if let Some(raw) = raw {
                merge(track, &raw, flags);
                if flags.intersects(ForceUpdateFlags::POSITION) {
                    slot.captured_at = Some(Instant::now());
                }
            }
            track.correct_details();

            // Artwork belongs to the old artist/album
            if flags.intersects(ForceUpdateFlags::THUMBNAIL) || track.artwork_key() != artwork_key {
                track.thumbnail_url = None;
                track.album_url = None;
            }
            track.clone()
        };

        if invoke_handler && snapshot.is_valid() {
            self.emit(&snapshot);
        }
        Some(snapshot)
    }

    /// Duration and position both read back non-zero
    pub fn is_valid_track(&self) -> bool {
        self.slot
            .lock()
            .track
            .as_ref()
            .map(|t| !t.duration.is_zero() && !t.position.is_zero())
            .unwrap_or(false)
    }

    pub fn current_track(&self) -> Option<TrackInfo> {
        self.slot.lock().track.clone()
    }

    pub fn is_attached(&self) -> bool {
        *self.attached.lock()
    }

    /// Block until the attach state equals `attached`, the monitor stops, or `timeout` passes
    pub fn wait_for_attach(&self, attached: bool, timeout: Duration) -> bool {
        let mut state = self.attached.lock();
        let stopped = &self.stopped;
        self.attach_changed.wait_while_for(
            &mut state,
            |state| *state != attached && !stopped.load(Ordering::Acquire),
            timeout,
        );
        *state == attached
    }

    /// Merge a resolved artwork lookup, if the snapshot still has that artist/album
    pub fn apply_artwork(&self, artist: &str, album: &str, artwork: Artwork) -> bool {
        let snapshot = {
            let mut slot = self.slot.lock();
            let Some(track) = slot.track.as_mut() else {
                return false;
            };
            if track.artist != artist || track.album_title != album {
                return false;
            }
            if track.thumbnail_url == artwork.thumbnail_url && track.album_url == artwork.page_url {
                return true;
            }

            track.thumbnail_url = artwork.thumbnail_url;
            track.album_url = artwork.page_url;
            track.clone()
        };

        if snapshot.is_valid() {
            self.emit(&snapshot);
        }
        true
    }

    /// Wake waiters, drop every source subscription and forget the session
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        {
            let _state = self.attached.lock();
            self.attach_changed.notify_all();
        }

        let mut slot = self.slot.lock();
        if let Some(id) = slot.set_subscription.take() {
            self.source.unsubscribe(id);
        }
        self.release_session(&mut slot);
        slot.track = None;
    }

    fn event_handler(&self) -> EventHandler {
        let this = self.this.clone();
        Arc::new(move |kind: &EventKind| {
            if let Some(monitor) = this.upgrade() {
                monitor.on_event(kind);
            }
        })
    }

    fn on_event(&self, kind: &EventKind) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        match kind {
            EventKind::SessionSetChanged => self.refresh_sessions(),
            EventKind::PropertiesChanged(key) | EventKind::PlaybackChanged(key) => {
                self.refresh_track(key)
            }
        }
    }

    /// Re-scan the session list and attach to / detach from the target
    fn refresh_sessions(&self) {
        let sessions = match self.source.sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                log::warn!("Failed to list media sessions: {}", e);
                Vec::new()
            }
        };

        let emitted = {
            let mut slot = self.slot.lock();
            match select_target(&sessions, &self.target_app) {
                Some(info) => {
                    let adopted = slot.session.as_ref().map(|s| &s.key) != Some(&info.key);
                    if adopted {
                        self.release_session(&mut slot);
                        slot.track = None;
                        slot.captured_at = None;
                        log::info!("Found media session {} ({})", info.key, info.app_id);
                        slot.session = Some(Attached {
                            key: info.key.clone(),
                            subscriptions: vec![
                                self.source.subscribe(
                                    EventKind::PropertiesChanged(info.key.clone()),
                                    self.event_handler(),
                                ),
                                self.source.subscribe(
                                    EventKind::PlaybackChanged(info.key.clone()),
                                    self.event_handler(),
                                ),
                            ],
                        });
                    }
                    self.pull_into(&mut slot, &info.key, adopted)
                }
                None => {
                    if slot.session.is_some() {
                        log::info!("Media session for {} went away", self.target_app);
                    }
                    self.release_session(&mut slot);
                    slot.track = None;
                    slot.captured_at = None;
                    self.set_attached(false);
                    None
                }
            }
        };

        if let Some(track) = emitted {
            self.emit(&track);
        }
    }

    /// Property/playback change on a session
    fn refresh_track(&self, key: &str) {
        let emitted = {
            let mut slot = self.slot.lock();
            if slot.session.as_ref().map(|s| s.key.as_str()) != Some(key) {
                return;
            }
            self.pull_into(&mut slot, key, false)
        };

        if let Some(track) = emitted {
            self.emit(&track);
        }
    }

    /// Replace the snapshot from a full pull; returns the track if the handler should see it
    fn pull_into(&self, slot: &mut Slot, key: &str, always_emit: bool) -> Option<TrackInfo> {
        let raw = match self.source.pull(key) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Failed to read media session {}: {}", key, e);
                if slot.track.is_none() {
                    self.set_attached(false);
                }
                return None;
            }
        };

        let now = Instant::now();
        let mut next = TrackInfo {
            title: raw.title,
            artist: raw.artist,
            album_title: raw.album_title,
            duration: raw.duration,
            position: raw.position,
            playback_status: raw.playback_status,
            thumbnail_url: None,
            album_url: None,
        };
        next.correct_details();

        let changed = match (&slot.track, slot.captured_at) {
            (Some(prev), Some(at)) => {
                // Artwork belongs to artist+album; keep it across refreshes of the same record
                if prev.artwork_key() == next.artwork_key() {
                    next.thumbnail_url = prev.thumbnail_url.clone();
                    next.album_url = prev.album_url.clone();
                }
                differs_meaningfully(prev, now.duration_since(at), &next, self.seek_tolerance)
            }
            _ => true,
        };

        slot.track = Some(next.clone());
        slot.captured_at = Some(now);
        self.set_attached(true);

        ((always_emit || changed) && next.is_valid()).then_some(next)
    }

    fn release_session(&self, slot: &mut Slot) {
        if let Some(attached) = slot.session.take() {
            for id in attached.subscriptions {
                self.source.unsubscribe(id);
            }
        }
    }

    fn set_attached(&self, value: bool) {
        let changed = {
            let mut attached = self.attached.lock();
            let changed = *attached != value;
            *attached = value;
            self.attach_changed.notify_all();
            changed
        };

        if changed {
            let handler = self.attach_handler.lock().clone();
            if let Some(handler) = handler {
                handler(value);
            }
        }
    }

    fn emit(&self, track: &TrackInfo) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(track);
        }
    }
}

fn merge(track: &mut TrackInfo, raw: &RawTrack, flags: ForceUpdateFlags) {
    if flags.intersects(ForceUpdateFlags::TITLE) {
        track.title = raw.title.clone();
    }
    if flags.intersects(ForceUpdateFlags::ARTIST) {
        track.artist = raw.artist.clone();
    }
    if flags.intersects(ForceUpdateFlags::ALBUM) {
        track.album_title = raw.album_title.clone();
    }
    if flags.intersects(ForceUpdateFlags::DURATION) {
        track.duration = raw.duration;
    }
    if flags.intersects(ForceUpdateFlags::POSITION) {
        track.position = raw.position;
    }
    if flags.intersects(ForceUpdateFlags::STATUS) {
        track.playback_status = raw.playback_status;
    }
}

/// Pick the target session: most recently active match, ties go to enumeration order
pub fn select_target<'a>(sessions: &'a [SessionInfo], target_app: &str) -> Option<&'a SessionInfo> {
    sessions
        .iter()
        .filter(|s| s.app_id.contains(target_app))
        .fold(None, |best: Option<&SessionInfo>, candidate| match best {
            Some(best) if candidate.last_active <= best.last_active => Some(best),
            _ => Some(candidate),
        })
}

/// Whether `next` is worth publishing after `prev`, captured `elapsed` ago.
///
/// Position alone counts only when it jumps away from where playback should be.
pub fn differs_meaningfully(
    prev: &TrackInfo,
    elapsed: Duration,
    next: &TrackInfo,
    tolerance: Duration,
) -> bool {
    if prev.title != next.title
        || prev.artist != next.artist
        || prev.album_title != next.album_title
        || prev.duration != next.duration
        || prev.playback_status != next.playback_status
        || prev.thumbnail_url != next.thumbnail_url
        || prev.album_url != next.album_url
    {
        return true;
    }

    let expected = if prev.playback_status == PlaybackStatus::Playing {
        prev.position + elapsed
    } else {
        prev.position
    };

    let drift = if next.position > expected {
        next.position - expected
    } else {
        expected - next.position
    };
    drift > tolerance
}
