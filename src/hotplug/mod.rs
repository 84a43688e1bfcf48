//! Hotplug watcher over the input device directory.
//!
//! An inotify watch on `/dev/input` turns node creation and removal into
//! attach/detach commands for the input pipeline. Attribute changes are
//! forwarded as attach requests too: udev adjusts permissions shortly
//! after a node appears, and the pipeline's detach-then-attach handling of
//! already-tracked names makes the retry harmless.

use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use thiserror::Error;
use tracing::debug;

use crate::input::is_event_node;

/// Hotplug watcher error types.
#[derive(Error, Debug)]
pub enum HotplugError {
    /// The inotify instance or watch could not be created.
    #[error("could not watch the input device directory: {0}")]
    Watch(#[source] Errno),

    /// Reading queued notifications failed.
    #[error("could not read hotplug notifications: {0}")]
    Read(#[source] Errno),
}

/// A device-node change under the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A node appeared (or changed attributes); attach it.
    Attach(String),
    /// A node disappeared; detach it.
    Detach(String),
}

/// Nonblocking inotify watch delivering attach/detach commands.
pub struct HotplugWatcher {
    inotify: Inotify,
}

impl HotplugWatcher {
    /// Starts watching a device directory.
    pub fn new(dir: &Path) -> Result<Self, HotplugError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(HotplugError::Watch)?;
        inotify
            .add_watch(
                dir,
                AddWatchFlags::IN_CREATE
                    | AddWatchFlags::IN_DELETE
                    | AddWatchFlags::IN_MOVED_TO
                    | AddWatchFlags::IN_MOVED_FROM
                    | AddWatchFlags::IN_ATTRIB,
            )
            .map_err(HotplugError::Watch)?;
        Ok(Self { inotify })
    }

    /// Borrowed fd for the poll set.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.inotify.as_fd()
    }

    /// Drains queued notifications into attach/detach commands.
    ///
    /// Only `event*` nodes are interesting; everything else in the
    /// directory (`mouseN`, `mice`, `by-id/`, …) is ignored.
    pub fn drain(&mut self) -> Result<Vec<HotplugEvent>, HotplugError> {
        let events = match self.inotify.read_events() {
            Ok(events) => events,
            Err(Errno::EAGAIN) => return Ok(Vec::new()),
            Err(errno) => return Err(HotplugError::Read(errno)),
        };

        let mut commands = Vec::new();
        for event in events {
            let Some(name) = event.name.as_ref().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_event_node(name) {
                continue;
            }
            let removed = event
                .mask
                .intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MOVED_FROM);
            let command = if removed {
                HotplugEvent::Detach(name.to_string())
            } else {
                HotplugEvent::Attach(name.to_string())
            };
            debug!("[hotplug] {command:?}");
            commands.push(command);
        }
        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_watcher_reports_node_lifecycle() {
        let dir = std::env::temp_dir().join(format!("wayveil-hotplug-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let mut watcher = HotplugWatcher::new(&dir).unwrap();

        fs::write(dir.join("event3"), b"").unwrap();
        fs::write(dir.join("mouse0"), b"").unwrap();
        fs::remove_file(dir.join("event3")).unwrap();

        let events = watcher.drain().unwrap();
        assert!(events.contains(&HotplugEvent::Attach("event3".to_string())));
        assert!(events.contains(&HotplugEvent::Detach("event3".to_string())));
        assert!(!events
            .iter()
            .any(|e| matches!(e, HotplugEvent::Attach(n) if n == "mouse0")));

        fs::remove_file(dir.join("mouse0")).ok();
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_drain_on_quiet_directory_is_empty() {
        let dir = std::env::temp_dir().join(format!("wayveil-quiet-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let mut watcher = HotplugWatcher::new(&dir).unwrap();
        assert!(watcher.drain().unwrap().is_empty());
        fs::remove_dir_all(&dir).ok();
    }
}
