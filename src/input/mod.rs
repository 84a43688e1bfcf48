//! Input capture: the libinput pipeline and exclusive device grabs.
//!
//! Devices are opened through a path-backed libinput context so that
//! attach/detach decisions stay with the hotplug watcher rather than udev.
//! Every device is grabbed exclusively (`EVIOCGRAB`) at open; without
//! exclusivity any other process could read the raw events and the
//! anonymization would be trivially bypassable, so a failed grab is fatal.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::os::raw::c_int;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use input::event::keyboard::{KeyState, KeyboardEvent, KeyboardEventTrait};
use input::event::pointer::PointerEvent;
use input::event::{DeviceEvent, Event, EventTrait};
use input::{Device, Libinput, LibinputInterface};
use thiserror::Error;
use tracing::{debug, warn};

use crate::layout::GlobalSpace;

/// Directory holding the kernel's input device nodes.
pub const INPUT_DEVICE_DIR: &str = "/dev/input";

/// Input pipeline error types.
#[derive(Error, Debug)]
pub enum InputError {
    /// The device directory could not be scanned.
    #[error("could not scan {INPUT_DEVICE_DIR}: {0}")]
    Scan(#[from] std::io::Error),

    /// The libinput context failed to process its fd.
    #[error("libinput dispatch failed: {0}")]
    Dispatch(std::io::Error),

    /// An exclusive grab failed.
    #[error("could not grab evdev device '{0}' exclusively")]
    GrabFailed(String),
}

nix::ioctl_write_ptr!(eviocgrab, b'E', 0x90, c_int);

/// What a decoded device event means to the release path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    /// Keyboard key press or release.
    Key,
    /// Pointer button press or release.
    Button,
    /// Scroll motion, tagged with its hardware source.
    Scroll(ScrollSource),
    /// A device finished attaching (tap-to-click setup happens at release).
    DeviceAdded,
    /// Buffered for ordering but dropped at release (touch, gestures).
    Passthrough,
}

/// Hardware origin of a scroll event, forwarded to the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollSource {
    /// Mouse wheel detents.
    Wheel,
    /// Touchpad two-finger scroll.
    Finger,
    /// Continuous device without detents.
    Continuous,
}

/// A decoded event held in the delay queue until release.
#[derive(Debug)]
pub struct BufferedEvent {
    /// The owned libinput event, replayed verbatim at release time.
    pub event: Event,
    /// Decoded kind tag.
    pub kind: DeviceEventKind,
}

/// What the event loop should do with a freshly decoded event.
#[derive(Debug)]
pub enum Classified {
    /// Relative pointer motion in device units.
    MotionRelative {
        /// Horizontal delta.
        dx: f64,
        /// Vertical delta.
        dy: f64,
    },
    /// Absolute pointer motion already transformed to global coordinates.
    MotionAbsolute {
        /// Global X.
        x: f64,
        /// Global Y.
        y: f64,
    },
    /// Keyboard key transition (also feeds the escape combo).
    Key {
        /// evdev key code.
        code: u32,
        /// Pressed or released.
        pressed: bool,
    },
    /// Buffer the event for delayed replay.
    Buffer(DeviceEventKind),
    /// A device went away; drop its queued packets.
    DeviceRemoved(Device),
    /// Nothing to do.
    Discard,
}

/// Classifies a decoded event against the current pointer space.
///
/// Motion events need the pointer space for the absolute transform and are
/// discarded while no output is confirmed; everything else buffers
/// normally.
pub fn classify(event: &Event, space: Option<&GlobalSpace>) -> Classified {
    match event {
        Event::Pointer(PointerEvent::Motion(motion)) => {
            if space.is_none() {
                return Classified::Discard;
            }
            Classified::MotionRelative {
                dx: motion.dx(),
                dy: motion.dy(),
            }
        }
        Event::Pointer(PointerEvent::MotionAbsolute(motion)) => {
            let Some(space) = space else {
                return Classified::Discard;
            };
            // The transform scales the device range onto [0, extent); the
            // extents are positive whenever a pointer space exists.
            let width = space.extent_x.max(1) as u32;
            let height = space.extent_y.max(1) as u32;
            Classified::MotionAbsolute {
                x: motion.absolute_x_transformed(width),
                y: motion.absolute_y_transformed(height),
            }
        }
        Event::Pointer(PointerEvent::Button(_)) => Classified::Buffer(DeviceEventKind::Button),
        Event::Pointer(PointerEvent::ScrollWheel(_)) => {
            Classified::Buffer(DeviceEventKind::Scroll(ScrollSource::Wheel))
        }
        Event::Pointer(PointerEvent::ScrollFinger(_)) => {
            Classified::Buffer(DeviceEventKind::Scroll(ScrollSource::Finger))
        }
        Event::Pointer(PointerEvent::ScrollContinuous(_)) => {
            Classified::Buffer(DeviceEventKind::Scroll(ScrollSource::Continuous))
        }
        Event::Keyboard(KeyboardEvent::Key(key)) => Classified::Key {
            code: key.key(),
            pressed: key.key_state() == KeyState::Pressed,
        },
        Event::Device(DeviceEvent::Added(_)) => Classified::Buffer(DeviceEventKind::DeviceAdded),
        Event::Device(DeviceEvent::Removed(removed)) => {
            Classified::DeviceRemoved(removed.device())
        }
        Event::Touch(_) | Event::Gesture(_) => Classified::Buffer(DeviceEventKind::Passthrough),
        _ => Classified::Discard,
    }
}

/// Opens device nodes for libinput with an exclusive grab.
struct GrabInterface {
    failed: Rc<RefCell<Option<String>>>,
}

impl LibinputInterface for GrabInterface {
    fn open_restricted(&mut self, path: &Path, flags: i32) -> Result<OwnedFd, i32> {
        let file = OpenOptions::new()
            .custom_flags(flags)
            .read((flags & libc::O_RDONLY != 0) | (flags & libc::O_RDWR != 0))
            .write((flags & libc::O_WRONLY != 0) | (flags & libc::O_RDWR != 0))
            .open(path)
            .map_err(|err| err.raw_os_error().unwrap_or(-1))?;

        let grab: c_int = 1;
        // SAFETY: the fd is a freshly opened evdev node and the argument
        // points at a live c_int for the duration of the call.
        if let Err(errno) = unsafe { eviocgrab(file.as_raw_fd(), &grab) } {
            *self.failed.borrow_mut() = Some(path.display().to_string());
            return Err(-(errno as i32));
        }

        debug!("[input] grabbed {}", path.display());
        Ok(file.into())
    }

    fn close_restricted(&mut self, fd: OwnedFd) {
        // The grab dies with the descriptor.
        drop(File::from(fd));
    }
}

/// The libinput context plus the set of attached device nodes.
pub struct InputPipeline {
    context: Libinput,
    devices: HashMap<String, Device>,
    grab_failure: Rc<RefCell<Option<String>>>,
}

impl InputPipeline {
    /// Creates a path-backed libinput context with grabbing opens.
    pub fn new() -> Self {
        let grab_failure = Rc::new(RefCell::new(None));
        let context = Libinput::new_from_path(GrabInterface {
            failed: Rc::clone(&grab_failure),
        });
        Self {
            context,
            devices: HashMap::new(),
            grab_failure,
        }
    }

    /// Attaches every existing `event*` node under `dir`.
    pub fn scan(&mut self, dir: &Path) -> Result<usize, InputError> {
        let mut attached = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if is_event_node(name) {
                self.attach(name);
                attached += 1;
            }
        }
        self.check_grab()?;
        debug!("[input] attached {attached} device(s) from {}", dir.display());
        Ok(attached)
    }

    /// Attaches a device node by name (`eventN`).
    ///
    /// A reappearing name is treated as detach-then-attach so a stale
    /// handle never lingers.
    pub fn attach(&mut self, name: &str) -> Option<Device> {
        if self.devices.contains_key(name) {
            self.detach(name);
        }
        let path: PathBuf = [INPUT_DEVICE_DIR, name].iter().collect();
        match self.context.path_add_device(&path.to_string_lossy()) {
            Some(device) => {
                debug!("[input] attached {name} ({:?})", device.name());
                self.devices.insert(name.to_string(), device.clone());
                Some(device)
            }
            None => {
                warn!("[input] could not add device node {name}");
                None
            }
        }
    }

    /// Detaches a device node by name, returning its handle for draining.
    pub fn detach(&mut self, name: &str) -> Option<Device> {
        let device = self.devices.remove(name)?;
        debug!("[input] detached {name}");
        self.context.path_remove_device(device.clone());
        Some(device)
    }

    /// Whether a node name is currently attached.
    pub fn is_attached(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Pumps the libinput fd; decoded events become available to `next`.
    pub fn dispatch(&mut self) -> Result<(), InputError> {
        self.context.dispatch().map_err(InputError::Dispatch)?;
        self.check_grab()
    }

    /// Takes the next decoded event, if any.
    pub fn next_event(&mut self) -> Option<Event> {
        self.context.next()
    }

    /// Raw fd for the poll set.
    pub fn fd(&self) -> RawFd {
        self.context.as_raw_fd()
    }

    /// Surfaces a grab failure recorded by the open hook. Anonymization is
    /// void without exclusivity, so callers treat this as fatal.
    pub fn check_grab(&mut self) -> Result<(), InputError> {
        match self.grab_failure.borrow_mut().take() {
            Some(path) => Err(InputError::GrabFailed(path)),
            None => Ok(()),
        }
    }
}

impl Default for InputPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a directory entry names an evdev event node.
pub fn is_event_node(name: &str) -> bool {
    name.strip_prefix("event")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_node_names() {
        assert!(is_event_node("event0"));
        assert!(is_event_node("event27"));
        assert!(!is_event_node("event"));
        assert!(!is_event_node("event0x"));
        assert!(!is_event_node("mouse0"));
        assert!(!is_event_node("mice"));
        assert!(!is_event_node("by-id"));
    }
}
