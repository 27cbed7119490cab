use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bridge::BridgeHandle;

/// Answers "is a process with this executable name running?"
pub trait ProcessProbe: Send + Sync {
    fn is_running(&self, name: &str) -> bool;
}

/// Asks the operating system
///
/// - **Linux**: scans `/proc/<pid>/comm`
/// - **macOS**: `pgrep -x`
/// - **Windows**: `tasklist` filtered by image name
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl ProcessProbe for SystemProcesses {
    #[cfg(target_os = "linux")]
    fn is_running(&self, name: &str) -> bool {
        // The kernel truncates comm to 15 bytes
        let wanted = comm_name(name);

        let Ok(entries) = std::fs::read_dir("/proc") else {
            return false;
        };

        entries.flatten().any(|entry| {
            let file_name = entry.file_name();
            let is_pid = file_name
                .to_str()
                .map(|s| s.bytes().all(|b| b.is_ascii_digit()))
                .unwrap_or(false);
            if !is_pid {
                return false;
            }

            std::fs::read_to_string(entry.path().join("comm"))
                .map(|comm| comm.trim_end() == wanted)
                .unwrap_or(false)
        })
    }

    #[cfg(target_os = "macos")]
    fn is_running(&self, name: &str) -> bool {
        match std::process::Command::new("pgrep").arg("-x").arg(name).output() {
            Ok(output) => output.status.success(),
            Err(e) => {
                log::debug!("pgrep failed: {}", e);
                false
            }
        }
    }

    #[cfg(windows)]
    fn is_running(&self, name: &str) -> bool {
        let output = std::process::Command::new("tasklist")
            .args(["/FI", &format!("IMAGENAME eq {}", name), "/NH", "/FO", "CSV"])
            .output();

        match output {
            Ok(output) => {
                let listing = String::from_utf8_lossy(&output.stdout).to_lowercase();
                listing.contains(&format!("\"{}\"", name.to_lowercase()))
            }
            Err(e) => {
                log::debug!("tasklist failed: {}", e);
                false
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    fn is_running(&self, _name: &str) -> bool {
        false
    }
}

#[cfg(any(target_os = "linux", test))]
fn comm_name(name: &str) -> &str {
    let name = name.strip_suffix(".exe").unwrap_or(name);
    let mut end = name.len().min(15);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// One probe pass: request a reconnect if the peer is running
pub fn check_peer(probe: &dyn ProcessProbe, peer_process: &str, bridge: &BridgeHandle) -> bool {
    let running = probe.is_running(peer_process);
    if running {
        bridge.request_reconnect();
    }
    running
}

/// Poll for the peer process and raise a reconnect whenever it is seen
pub fn spawn_peer_watch(
    probe: Arc<dyn ProcessProbe>,
    peer_process: String,
    interval: Duration,
    bridge: BridgeHandle,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("peer-probe".to_string())
        .spawn(move || {
            log::debug!("Watching for {} every {:?}", peer_process, interval);
            loop {
                check_peer(probe.as_ref(), &peer_process, &bridge);
                if bridge.wait_for_shutdown(interval) {
                    break;
                }
            }
            log::debug!("Peer probe stopped");
        })
}
