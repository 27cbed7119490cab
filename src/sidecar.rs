use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, SystemTime};

use crate::config::SidecarCommand;
use crate::error::SessionError;
use crate::session::{EventHandler, EventKind, RawTrack, SessionInfo, SessionSource, SubscriptionId};
use crate::types::PlaybackStatus;

/// One JSON line from the sidecar's stdout
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SidecarMessage {
    /// Full session list; replaces whatever we had
    Sessions { sessions: Vec<SessionEntry> },
    Track {
        id: String,
        event: TrackEvent,
        track: TrackPayload,
    },
    Error { message: String },
}

#[derive(Debug, Deserialize)]
struct SessionEntry {
    id: String,
    app_id: String,
    /// Unix time in milliseconds
    #[serde(default)]
    last_active: Option<u64>,
    #[serde(default)]
    track: Option<TrackPayload>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TrackEvent {
    Properties,
    Playback,
}

#[derive(Debug, Deserialize)]
struct TrackPayload {
    #[serde(default)]
    title: String,
    #[serde(default)]
    artist: String,
    #[serde(default)]
    album_title: String,
    #[serde(default)]
    playback_status: PlaybackStatus,
    #[serde(default)]
    position_ms: u64,
    #[serde(default)]
    duration_ms: u64,
}

impl From<TrackPayload> for RawTrack {
    fn from(payload: TrackPayload) -> Self {
        RawTrack {
            title: payload.title,
            artist: payload.artist,
            album_title: payload.album_title,
            playback_status: payload.playback_status,
            position: Duration::from_millis(payload.position_ms),
            duration: Duration::from_millis(payload.duration_ms),
        }
    }
}

#[derive(Default)]
struct Cache {
    sessions: Vec<SessionInfo>,
    tracks: HashMap<String, RawTrack>,
}

#[derive(Default)]
struct Inner {
    child: Mutex<Option<Child>>,
    cache: Mutex<Cache>,
    subscribers: Mutex<Vec<(SubscriptionId, EventKind, EventHandler)>>,
    next_id: AtomicU64,
    exited: AtomicBool,
}

impl Inner {
    fn handle_line(&self, line: &str) -> Result<()> {
        let message: SidecarMessage =
            serde_json::from_str(line).context("Failed to parse sidecar message")?;

        match message {
            SidecarMessage::Sessions { sessions } => {
                log::debug!("Session list received: {} sessions", sessions.len());
                {
                    let mut cache = self.cache.lock();
                    let mut previous = std::mem::take(&mut cache.tracks);
                    let mut listed = Vec::with_capacity(sessions.len());

                    for entry in sessions {
                        // A session listed without a track keeps the one we already had
                        let track = entry.track.map(RawTrack::from).or_else(|| previous.remove(&entry.id));
                        if let Some(track) = track {
                            cache.tracks.insert(entry.id.clone(), track);
                        }
                        listed.push(SessionInfo {
                            key: entry.id,
                            app_id: entry.app_id,
                            last_active: entry
                                .last_active
                                .map(|ms| SystemTime::UNIX_EPOCH + Duration::from_millis(ms)),
                        });
                    }
                    cache.sessions = listed;
                }
                self.dispatch(&EventKind::SessionSetChanged);
            }
            SidecarMessage::Track { id, event, track } => {
                let track = RawTrack::from(track);
                log::debug!("Track update on {}: {} - {} ({:?})", id, track.title, track.artist, track.playback_status);
                self.cache.lock().tracks.insert(id.clone(), track);

                let kind = match event {
                    TrackEvent::Properties => EventKind::PropertiesChanged(id),
                    TrackEvent::Playback => EventKind::PlaybackChanged(id),
                };
                self.dispatch(&kind);
            }
            SidecarMessage::Error { message } => {
                log::error!("Sidecar error: {}", message);
            }
        }

        Ok(())
    }

    /// The reader hit EOF: every session is gone with it
    fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
        {
            let mut cache = self.cache.lock();
            cache.sessions.clear();
            cache.tracks.clear();
        }
        self.dispatch(&EventKind::SessionSetChanged);
    }

    fn dispatch(&self, kind: &EventKind) {
        // Handlers call back into the source; don't hold the lock while they run
        let handlers: Vec<EventHandler> = self
            .subscribers
            .lock()
            .iter()
            .filter(|(_, wanted, _)| wanted == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(kind);
        }
    }
}

/// Session source backed by a helper process that prints JSON lines
pub struct SidecarSource {
    inner: Arc<Inner>,
}

impl SidecarSource {
    /// Spawn the sidecar and start reading its output
    pub fn spawn(command: &SidecarCommand) -> Result<Self> {
        log::info!("Spawning sidecar: {} {:?}", command.program, command.args);

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn sidecar {:?}", command.program))?;

        log::info!("Sidecar process spawned with PID: {}", child.id());

        let stdout = child
            .stdout
            .take()
            .context("Failed to capture sidecar stdout")?;
        let stderr = child
            .stderr
            .take()
            .context("Failed to capture sidecar stderr")?;

        let source = Self::detached();
        *source.inner.child.lock() = Some(child);

        let weak = Arc::downgrade(&source.inner);
        thread::Builder::new()
            .name("sidecar-stdout".to_string())
            .spawn(move || read_stdout(stdout, weak))
            .context("Failed to start sidecar stdout reader")?;

        thread::Builder::new()
            .name("sidecar-stderr".to_string())
            .spawn(move || read_stderr(stderr))
            .context("Failed to start sidecar stderr reader")?;

        Ok(source)
    }

    /// A source with no process behind it
    fn detached() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
        }
    }

    /// Check if the sidecar is still running
    pub fn is_running(&self) -> bool {
        let mut child_guard = self.inner.child.lock();
        match child_guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    log::warn!("Sidecar process has exited: {}", status);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    log::error!("Error checking sidecar status: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    /// Stop the sidecar: terminate, wait up to 2s, then kill
    pub fn stop(&self) -> Result<()> {
        let child_option = self.inner.child.lock().take();
        let Some(mut child) = child_option else {
            return Ok(());
        };

        log::info!("Stopping sidecar process with PID {}...", child.id());

        #[cfg(unix)]
        {
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(child.id().to_string())
                .output();
        }

        #[cfg(windows)]
        {
            child.kill().ok();
        }

        let max_wait = Duration::from_millis(2000);
        let check_interval = Duration::from_millis(100);
        let mut waited = Duration::ZERO;

        while waited < max_wait {
            thread::sleep(check_interval);
            waited += check_interval;

            match child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("Sidecar process exited with status: {:?}", status);
                    return Ok(());
                }
                Ok(None) => continue,
                Err(e) => {
                    log::error!("Error checking sidecar status: {}", e);
                    break;
                }
            }
        }

        log::warn!("Sidecar didn't stop after {:?}, killing it", max_wait);
        child.kill().context("Failed to kill sidecar process")?;
        child.wait().context("Failed to wait for sidecar process")?;
        Ok(())
    }

    #[cfg(test)]
    fn handle_line(&self, line: &str) -> Result<()> {
        self.inner.handle_line(line)
    }
}

impl SessionSource for SidecarSource {
    fn sessions(&self) -> Result<Vec<SessionInfo>, SessionError> {
        if self.inner.exited.load(Ordering::Acquire) {
            return Err(SessionError::SourceUnavailable(
                "sidecar process exited".to_string(),
            ));
        }
        Ok(self.inner.cache.lock().sessions.clone())
    }

    fn pull(&self, key: &str) -> Result<RawTrack, SessionError> {
        let cache = self.inner.cache.lock();
        if let Some(track) = cache.tracks.get(key) {
            return Ok(track.clone());
        }
        if cache.sessions.iter().any(|s| s.key == key) {
            Err(SessionError::NoMediaProperties(key.to_string()))
        } else {
            Err(SessionError::UnknownSession(key.to_string()))
        }
    }

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner.subscribers.lock().push((id, kind, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.subscribers.lock().retain(|(existing, _, _)| *existing != id);
    }
}

impl Drop for SidecarSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Error stopping sidecar in Drop: {}", e);
        }
    }
}

/// Read stdout from the sidecar (JSON messages)
fn read_stdout(stdout: std::process::ChildStdout, inner: Weak<Inner>) {
    let reader = BufReader::new(stdout);

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::error!("Error reading sidecar stdout: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(e) = inner.handle_line(&line) {
            log::error!("{:#}: {}", e, line);
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.mark_exited();
    }
    log::warn!("Sidecar stdout reader stopped");
}

/// Read stderr from the sidecar (debug logs)
fn read_stderr(stderr: std::process::ChildStderr) {
    let reader = BufReader::new(stderr);

    for line in reader.lines() {
        match line {
            Ok(line) => {
                if !line.trim().is_empty() {
                    log::info!("[Sidecar] {}", line);
                }
            }
            Err(e) => {
                log::error!("Error reading sidecar stderr: {}", e);
                break;
            }
        }
    }

    log::debug!("Sidecar stderr reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn record(source: &SidecarSource, kind: EventKind) -> Arc<Mutex<Vec<EventKind>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        source.subscribe(kind, Arc::new(move |k: &EventKind| sink.lock().push(k.clone())));
        seen
    }

    #[test]
    fn test_session_list_replaces_cache() {
        let source = SidecarSource::detached();
        let events = record(&source, EventKind::SessionSetChanged);

        source
            .handle_line(
                r#"{"type":"sessions","sessions":[
                    {"id":"1","app_id":"AppleInc.AppleMusic","last_active":1700000000000,
                     "track":{"title":"Song","artist":"Band","album_title":"Album",
                              "playback_status":"playing","position_ms":12000,"duration_ms":200000}},
                    {"id":"2","app_id":"Spotify.exe"}
                ]}"#,
            )
            .unwrap();

        let sessions = source.sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].app_id, "AppleInc.AppleMusic");
        assert!(sessions[0].last_active.is_some());
        assert!(sessions[1].last_active.is_none());

        let track = source.pull("1").unwrap();
        assert_eq!(track.title, "Song");
        assert_eq!(track.playback_status, PlaybackStatus::Playing);
        assert_eq!(track.position, Duration::from_secs(12));
        assert_eq!(track.duration, Duration::from_secs(200));

        assert!(matches!(source.pull("2"), Err(SessionError::NoMediaProperties(_))));
        assert!(matches!(source.pull("3"), Err(SessionError::UnknownSession(_))));
        assert_eq!(*events.lock(), vec![EventKind::SessionSetChanged]);

        source
            .handle_line(r#"{"type":"sessions","sessions":[]}"#)
            .unwrap();
        assert!(source.sessions().unwrap().is_empty());
        assert!(source.pull("1").is_err());
    }

    #[test]
    fn test_track_events_reach_only_their_subscribers() {
        let source = SidecarSource::detached();
        let props = record(&source, EventKind::PropertiesChanged("1".to_string()));
        let playback = record(&source, EventKind::PlaybackChanged("1".to_string()));
        let other = record(&source, EventKind::PlaybackChanged("2".to_string()));

        source
            .handle_line(r#"{"type":"track","id":"1","event":"playback","track":{"title":"Song","playback_status":"paused"}}"#)
            .unwrap();

        assert!(props.lock().is_empty());
        assert_eq!(playback.lock().len(), 1);
        assert!(other.lock().is_empty());
        assert_eq!(source.pull("1").unwrap().playback_status, PlaybackStatus::Paused);
    }

    #[test]
    fn test_unknown_status_maps_to_other() {
        let source = SidecarSource::detached();
        source
            .handle_line(r#"{"type":"track","id":"1","event":"properties","track":{"playback_status":"changing"}}"#)
            .unwrap();
        assert_eq!(source.pull("1").unwrap().playback_status, PlaybackStatus::Other);
    }

    #[test]
    fn test_bad_lines_are_errors() {
        let source = SidecarSource::detached();
        assert!(source.handle_line("not json").is_err());
        assert!(source.handle_line(r#"{"type":"mystery"}"#).is_err());
        assert!(source.handle_line(r#"{"type":"error","message":"no access"}"#).is_ok());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let source = SidecarSource::detached();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let id = source.subscribe(
            EventKind::SessionSetChanged,
            Arc::new(move |_: &EventKind| *sink.lock() += 1),
        );

        source.handle_line(r#"{"type":"sessions","sessions":[]}"#).unwrap();
        source.unsubscribe(id);
        source.handle_line(r#"{"type":"sessions","sessions":[]}"#).unwrap();

        assert_eq!(*seen.lock(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_spawned_process_feeds_cache_and_stops() {
        let script = r#"echo '{"type":"sessions","sessions":[{"id":"7","app_id":"AppleInc.AppleMusic"}]}'; exec sleep 30"#;
        let source = SidecarSource::spawn(&SidecarCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while source.sessions().map(|s| s.is_empty()).unwrap_or(true) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(source.sessions().unwrap()[0].key, "7");
        assert!(source.is_running());

        source.stop().unwrap();
        assert!(!source.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_exit_makes_source_unavailable() {
        let source = SidecarSource::spawn(&SidecarCommand {
            program: "true".to_string(),
            args: Vec::new(),
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while source.sessions().is_ok() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }

        assert!(matches!(source.sessions(), Err(SessionError::SourceUnavailable(_))));
    }
}
