//! Shared fixtures for the end-to-end bridge tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nowplaying_presence::artwork::{Artwork, ArtworkResolver};
use nowplaying_presence::bridge::{Bridge, BridgeHandle};
use nowplaying_presence::codec::Opcode;
use nowplaying_presence::config::BridgeConfig;
use nowplaying_presence::error::SessionError;
use nowplaying_presence::probe::ProcessProbe;
use nowplaying_presence::session::{
    EventHandler, EventKind, RawTrack, SessionInfo, SessionMonitor, SessionSource, SubscriptionId,
};
use nowplaying_presence::transport::mock::{MockConnector, MockWire};
use nowplaying_presence::transport::{endpoint_candidates, TransportClient};
use nowplaying_presence::types::PlaybackStatus;

pub const TARGET_APP: &str = "AppleInc.AppleMusic";
pub const PEER: &str = "Discord";
pub const ENDPOINT: &str = "ipc-0";

/// Session source driven by hand
#[derive(Default)]
pub struct FakeSource {
    sessions: Mutex<Vec<SessionInfo>>,
    tracks: Mutex<HashMap<String, RawTrack>>,
    handlers: Mutex<Vec<(SubscriptionId, EventKind, EventHandler)>>,
    next_id: AtomicU64,
}

impl FakeSource {
    pub fn add_session(&self, key: &str, app_id: &str, track: RawTrack) {
        self.sessions.lock().push(SessionInfo {
            key: key.to_string(),
            app_id: app_id.to_string(),
            last_active: None,
        });
        self.tracks.lock().insert(key.to_string(), track);
    }

    pub fn set_track(&self, key: &str, track: RawTrack) {
        self.tracks.lock().insert(key.to_string(), track);
    }

    pub fn clear_sessions(&self) {
        self.sessions.lock().clear();
        self.tracks.lock().clear();
    }

    pub fn fire(&self, kind: EventKind) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(&kind);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl SessionSource for FakeSource {
    fn sessions(&self) -> Result<Vec<SessionInfo>, SessionError> {
        Ok(self.sessions.lock().clone())
    }

    fn pull(&self, key: &str) -> Result<RawTrack, SessionError> {
        self.tracks
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(key.to_string()))
    }

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.handlers.lock().push((id, kind, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.handlers.lock().retain(|(i, _, _)| *i != id);
    }
}

/// Process probe whose answer the test flips
#[derive(Default)]
pub struct ScriptedProbe {
    running: AtomicBool,
}

impl ScriptedProbe {
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

impl ProcessProbe for ScriptedProbe {
    fn is_running(&self, name: &str) -> bool {
        name == PEER && self.running.load(Ordering::SeqCst)
    }
}

/// Artwork resolver with a canned answer that counts lookups
#[derive(Default)]
pub struct StubResolver {
    answer: Artwork,
    calls: AtomicUsize,
}

impl StubResolver {
    pub fn returning(thumbnail: &str, page: &str) -> Self {
        Self {
            answer: Artwork {
                thumbnail_url: Some(thumbnail.to_string()),
                page_url: Some(page.to_string()),
            },
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ArtworkResolver for StubResolver {
    fn resolve(&self, _artist: &str, _album: &str) -> Artwork {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

pub struct Harness {
    pub bridge: Bridge,
    pub handle: BridgeHandle,
    pub source: Arc<FakeSource>,
    pub connector: MockConnector,
    pub wire: MockWire,
    pub probe: Arc<ScriptedProbe>,
    pub resolver: Arc<StubResolver>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), StubResolver::default())
    }

    pub fn with(config: BridgeConfig, resolver: StubResolver) -> Self {
        let source = Arc::new(FakeSource::default());
        let connector = MockConnector::new();
        let wire = connector.wire();
        let probe = Arc::new(ScriptedProbe::default());
        let resolver = Arc::new(resolver);

        let transport = TransportClient::new(
            config.client_id.clone(),
            endpoint_candidates("ipc-", 10),
            Box::new(connector.clone()),
        );
        let monitor = SessionMonitor::new(
            Arc::clone(&source) as Arc<dyn SessionSource>,
            config.target_app.clone(),
            config.seek_tolerance,
        );
        let bridge = Bridge::new(
            config,
            transport,
            monitor,
            Arc::clone(&probe) as Arc<dyn ProcessProbe>,
            Arc::clone(&resolver) as Arc<dyn ArtworkResolver>,
        );
        let handle = bridge.handle();

        Self {
            bridge,
            handle,
            source,
            connector,
            wire,
            probe,
            resolver,
        }
    }

    /// Peer process running and its socket accepting
    pub fn peer_up(&self) {
        self.probe.set_running(true);
        self.connector.set_listening(Some(ENDPOINT));
    }

    pub fn peer_down(&self) {
        self.probe.set_running(false);
        self.connector.set_listening(None);
        self.wire.hang_up();
    }

    pub fn attach(&self, track: RawTrack) {
        self.source.add_session("am", TARGET_APP, track);
        self.source.fire(EventKind::SessionSetChanged);
    }

    pub fn detach(&self) {
        self.source.clear_sessions();
        self.source.fire(EventKind::SessionSetChanged);
    }

    pub fn change_track(&self, track: RawTrack) {
        self.source.set_track("am", track);
        self.source.fire(EventKind::PropertiesChanged("am".to_string()));
    }

    pub fn handshakes(&self) -> usize {
        handshakes(&self.wire)
    }

    pub fn activities(&self) -> Vec<serde_json::Value> {
        activities(&self.wire)
    }

    pub fn clears(&self) -> usize {
        clears(&self.wire)
    }
}

pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        target_app: TARGET_APP.to_string(),
        peer_process: PEER.to_string(),
        endpoint_prefix: "ipc-".to_string(),
        tick_interval: Duration::from_millis(20),
        thumbnail_refresh_ticks: 2,
        ..BridgeConfig::default()
    }
}

pub fn track(title: &str, artist: &str, album: &str, position: u64, duration: u64) -> RawTrack {
    RawTrack {
        title: title.to_string(),
        artist: artist.to_string(),
        album_title: album.to_string(),
        playback_status: PlaybackStatus::Playing,
        position: Duration::from_secs(position),
        duration: Duration::from_secs(duration),
    }
}

fn message_payloads(wire: &MockWire) -> Vec<serde_json::Value> {
    wire.frames()
        .into_iter()
        .filter(|f| f.opcode == Opcode::Message.code())
        .filter_map(|f| serde_json::from_slice(&f.payload).ok())
        .collect()
}

pub fn handshakes(wire: &MockWire) -> usize {
    wire.frames()
        .iter()
        .filter(|f| f.opcode == Opcode::Handshake.code())
        .count()
}

/// Published activities, oldest first
pub fn activities(wire: &MockWire) -> Vec<serde_json::Value> {
    message_payloads(wire)
        .into_iter()
        .filter_map(|m| m["args"].get("activity").cloned())
        .collect()
}

/// SET_ACTIVITY commands that carried no activity
pub fn clears(wire: &MockWire) -> usize {
    message_payloads(wire)
        .iter()
        .filter(|m| m["cmd"] == "SET_ACTIVITY" && m["args"].get("activity").is_none())
        .count()
}
