//! Connection/session orchestration
//!
//! `Bridge` owns the transport and reconciles three signals into presence
//! updates: the peer process showing up (reconnect requests from the probe),
//! the media session attaching or detaching, and the health of the IPC link.
//! Everything reaches the loop through one command queue, so the loop is the
//! only code that touches the transport.

use parking_lot::{Condvar, Mutex};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::artwork::ArtworkResolver;
use crate::config::BridgeConfig;
use crate::presence::{build_activity, unix_now};
use crate::probe::ProcessProbe;
use crate::session::SessionMonitor;
use crate::state::{create_state, SharedState};
use crate::transport::TransportClient;
use crate::types::{BridgeState, ForceUpdateFlags, TrackInfo};

/// Work items for the orchestrator loop
#[derive(Debug, Clone)]
pub enum Command {
    /// The peer may be reachable: connect if we aren't
    RequestReconnect,
    /// The session produced a snapshot worth publishing
    Publish(TrackInfo),
    AttachChanged(bool),
    Shutdown,
}

/// Stop flag that sleeping threads can wait on
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, cv) = &*self.inner;
        *flag.lock() = true;
        cv.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep up to `timeout`; returns true if shutdown was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cv) = &*self.inner;
        let mut stopped = flag.lock();
        cv.wait_while_for(&mut stopped, |stopped| !*stopped, timeout);
        *stopped
    }
}

/// Cloneable way for other threads to poke the bridge
#[derive(Clone)]
pub struct BridgeHandle {
    commands: Sender<Command>,
    shutdown: ShutdownSignal,
}

impl BridgeHandle {
    pub fn request_reconnect(&self) {
        self.send(Command::RequestReconnect);
    }

    /// Ask the loop to stop and wake everything waiting on the shutdown signal
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        self.send(Command::Shutdown);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.wait_timeout(timeout)
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("Bridge loop is gone, dropping command");
        }
    }
}

pub struct Bridge {
    config: BridgeConfig,
    transport: TransportClient,
    monitor: Arc<SessionMonitor>,
    probe: Arc<dyn ProcessProbe>,
    artwork: Arc<dyn ArtworkResolver>,
    state: SharedState,
    bridge_state: BridgeState,
    commands: Sender<Command>,
    inbox: Receiver<Command>,
    shutdown: ShutdownSignal,
    ticks_until_artwork: u32,
    last_artwork_key: Option<(String, String)>,
    last_tick: Instant,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        transport: TransportClient,
        monitor: Arc<SessionMonitor>,
        probe: Arc<dyn ProcessProbe>,
        artwork: Arc<dyn ArtworkResolver>,
    ) -> Self {
        let (commands, inbox) = mpsc::channel();

        let updates = commands.clone();
        monitor.set_update_handler(move |track| {
            if updates.send(Command::Publish(track.clone())).is_err() {
                log::debug!("Bridge loop is gone, dropping track update");
            }
        });

        let attach = commands.clone();
        monitor.set_attach_handler(move |attached| {
            if attach.send(Command::AttachChanged(attached)).is_err() {
                log::debug!("Bridge loop is gone, dropping attach change");
            }
        });

        Self {
            config,
            transport,
            monitor,
            probe,
            artwork,
            state: create_state(),
            bridge_state: BridgeState::Idle,
            commands,
            inbox,
            shutdown: ShutdownSignal::new(),
            ticks_until_artwork: 0,
            last_artwork_key: None,
            last_tick: Instant::now(),
        }
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            commands: self.commands.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn shared_state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    pub fn state(&self) -> BridgeState {
        self.bridge_state
    }

    /// Leave Idle and start following media sessions
    pub fn start(&mut self) {
        if self.bridge_state != BridgeState::Idle {
            return;
        }

        self.set_state(BridgeState::WaitingForPeer);
        self.monitor.initialize();
    }

    /// Run until shutdown
    pub fn run(mut self) {
        self.start();

        while self.bridge_state != BridgeState::ShuttingDown {
            if self.shutdown.is_triggered() {
                self.finish();
                break;
            }

            let wait = self
                .config
                .tick_interval
                .saturating_sub(self.last_tick.elapsed());

            match self.inbox.recv_timeout(wait) {
                Ok(command) => self.handle_command(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.finish(),
            }

            // Commands can arrive faster than the tick; don't let them starve it
            if self.bridge_state != BridgeState::ShuttingDown
                && self.last_tick.elapsed() >= self.config.tick_interval
            {
                self.tick();
            }
        }

        log::info!("Bridge loop stopped");
    }

    /// Handle every queued command without blocking. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(command) = self.inbox.try_recv() {
            self.handle_command(command);
            handled += 1;
        }
        handled
    }

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::RequestReconnect => match self.bridge_state {
                BridgeState::WaitingForPeer | BridgeState::Connecting => {
                    self.connect();
                }
                BridgeState::Bridging if !self.transport.is_connected() => {
                    self.connect();
                }
                _ => {}
            },
            Command::Publish(track) => self.publish(&track),
            Command::AttachChanged(attached) => {
                self.state.write().session_attached = attached;
                if attached {
                    log::info!("Media session attached");
                    self.ticks_until_artwork = 0;
                } else {
                    log::info!("Media session detached");
                    self.state.write().current_track = None;
                    if self.bridge_state == BridgeState::Bridging {
                        self.teardown("media session detached");
                    }
                }
            }
            Command::Shutdown => self.finish(),
        }
    }

    /// Periodic work while a session is attached
    pub fn tick(&mut self) {
        self.last_tick = Instant::now();

        if self.shutdown.is_triggered() || self.bridge_state == BridgeState::ShuttingDown {
            return;
        }
        if !self.monitor.is_attached() {
            return;
        }

        if !self.probe.is_running(&self.config.peer_process) {
            if self.bridge_state == BridgeState::Bridging || self.transport.is_connected() {
                self.teardown("peer process is no longer running");
            }
            return;
        }

        let healthy =
            self.bridge_state == BridgeState::Bridging && self.transport.probe_liveness();
        if !healthy && !self.connect() {
            return;
        }

        // A just-attached track may not have its timeline yet
        if !self.monitor.is_valid_track() {
            self.monitor
                .force_update(ForceUpdateFlags::DURATION | ForceUpdateFlags::POSITION, true);
        }

        self.artwork_tick();
    }

    fn connect(&mut self) -> bool {
        self.set_state(BridgeState::Connecting);

        match self.transport.connect() {
            Ok(()) => {
                self.set_state(BridgeState::Bridging);
                if self.monitor.is_attached() {
                    // Publish the current track on the fresh connection
                    self.monitor.force_update(ForceUpdateFlags::SESSION, true);
                }
                true
            }
            Err(e) => {
                log::info!("Could not connect to presence peer: {}", e);
                self.set_state(BridgeState::WaitingForPeer);
                false
            }
        }
    }

    fn publish(&mut self, track: &TrackInfo) {
        if self.bridge_state != BridgeState::Bridging {
            log::debug!("Not bridging, skipping update for {}", track.title);
            return;
        }
        if !track.is_valid() {
            return;
        }

        // New record without artwork: resolve it on the next tick
        if track.thumbnail_url.is_none() && self.last_artwork_key.as_ref() != Some(&track.artwork_key()) {
            self.ticks_until_artwork = 0;
        }

        let activity = build_activity(track, unix_now(), &self.config.presence);
        match self.transport.send_message(&activity) {
            Ok(()) => {
                log::info!("Now playing: {} - {} ({:?})", track.title, track.artist, track.playback_status);
                let mut state = self.state.write();
                state.current_track = Some(track.clone());
                state.published_count += 1;
                state.last_published_at = Some(Instant::now());
            }
            Err(e) if e.requires_reconnect() => {
                log::warn!("Presence update failed, waiting to reconnect: {}", e);
                self.set_state(BridgeState::WaitingForPeer);
            }
            Err(e) => log::warn!("Presence update dropped: {}", e),
        }
    }

    fn artwork_tick(&mut self) {
        if self.ticks_until_artwork > 0 {
            self.ticks_until_artwork -= 1;
            return;
        }
        self.ticks_until_artwork = self.config.thumbnail_refresh_ticks;

        let Some(track) = self.monitor.current_track() else {
            return;
        };
        if !track.is_valid() {
            return;
        }

        let key = track.artwork_key();
        if track.thumbnail_url.is_some() && self.last_artwork_key.as_ref() == Some(&key) {
            return;
        }

        self.last_artwork_key = Some(key.clone());
        let (artist, album) = key;
        let artwork = self.artwork.resolve(&artist, &album);
        if artwork.thumbnail_url.is_none() {
            log::debug!("No artwork found for {} - {}", artist, album);
        }
        self.monitor.apply_artwork(&artist, &album, artwork);
    }

    fn teardown(&mut self, reason: &str) {
        log::info!("Dropping presence connection: {}", reason);
        if self.transport.is_connected() {
            if let Err(e) = self.transport.clear_activity() {
                log::debug!("Failed to clear presence: {}", e);
            }
        }
        self.transport.close();
        self.set_state(BridgeState::WaitingForPeer);
    }

    fn finish(&mut self) {
        if self.bridge_state == BridgeState::ShuttingDown {
            return;
        }

        self.set_state(BridgeState::ShuttingDown);
        self.shutdown.trigger();

        if self.transport.is_connected() {
            if let Err(e) = self.transport.clear_activity() {
                log::debug!("Failed to clear presence on shutdown: {}", e);
            }
        }
        self.transport.close();
        self.monitor.shutdown();
        self.sync_connection();
    }

    fn set_state(&mut self, next: BridgeState) {
        if self.bridge_state != next {
            log::debug!("Bridge state {:?} -> {:?}", self.bridge_state, next);
        }
        self.bridge_state = next;
        self.state.write().bridge_state = next;
        self.sync_connection();
    }

    fn sync_connection(&self) {
        self.state.write().connection = self.transport.state();
    }
}
