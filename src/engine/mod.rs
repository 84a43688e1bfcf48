//! The anonymization engine and its cooperative event loop.
//!
//! One `Engine` value owns every piece of mutable state: the bound Wayland
//! globals, per-output slots, the output layout, the delay queue, the
//! virtual cursor, the escape-combo watcher, and the libinput pipeline.
//! Protocol callbacks receive it as the `Dispatch` state type (see
//! `dispatch`); nothing lives in globals.
//!
//! The loop is single-threaded and cooperative. Each pass prepares a
//! nonblocking Wayland read, drains decoded input into the scheduler,
//! releases due packets to the virtual devices, redraws pending overlay
//! frames, and then polls the Wayland socket, the libinput fd, and the
//! hotplug watcher — sleeping exactly until the queue head is due, or
//! indefinitely when the queue is empty. Only that poll blocks.

mod dispatch;

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use input::event::keyboard::{KeyState, KeyboardEvent, KeyboardEventTrait};
use input::event::pointer::{Axis, ButtonState, PointerEvent, PointerScrollEvent};
use input::event::{Event, EventTrait};
use memmap2::MmapOptions;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};
use wayland_client::globals::{registry_queue_init, GlobalList};
use wayland_client::protocol::{
    wl_compositor::WlCompositor, wl_keyboard::WlKeyboard, wl_output::WlOutput,
    wl_pointer, wl_registry::WlRegistry, wl_seat::WlSeat, wl_shm::WlShm,
};
use wayland_client::{Connection, Proxy, QueueHandle};
use wayland_protocols::xdg::xdg_output::zv1::client::zxdg_output_manager_v1::ZxdgOutputManagerV1;
use wayland_protocols::xdg::xdg_output::zv1::client::zxdg_output_v1::ZxdgOutputV1;
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
};
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_shell_v1::ZwlrLayerShellV1;
use wayland_protocols_wlr::virtual_pointer::v1::client::{
    zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
    zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1,
};
use xkbcommon::xkb;

use crate::combo::EscapeCombo;
use crate::config::Config;
use crate::cursor::{self, Point, VirtualCursor};
use crate::hotplug::{HotplugEvent, HotplugWatcher};
use crate::input::{
    classify, BufferedEvent, Classified, DeviceEventKind, InputPipeline, ScrollSource,
    INPUT_DEVICE_DIR,
};
use crate::layout::{OutputMap, MAX_OUTPUTS};
use crate::overlay::OverlayLayer;
use crate::scheduler::{DelayQueue, PacketBody};
use crate::util::{wire_time, Clock, Entropy, WIRE_TIME_LIMIT};

// Wire values shared by the virtual-keyboard protocol.
const KEY_STATE_RELEASED: u32 = 0;
const KEY_STATE_PRESSED: u32 = 1;
const KEYMAP_FORMAT_XKB_V1: u32 = 1;

/// xkb keycodes are evdev keycodes offset by 8.
const EVDEV_XKB_OFFSET: u32 = 8;

/// Outcome of one input-drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Keep looping.
    Continue,
    /// The escape combo matched; shut down with exit code 0.
    Exit,
}

/// Tracks the seat's xkb keymap so replayed keys carry correct modifiers.
struct XkbTracker {
    context: xkb::Context,
    state: Option<xkb::State>,
    keymap_text: Option<String>,
}

impl XkbTracker {
    fn new() -> Self {
        Self {
            context: xkb::Context::new(xkb::CONTEXT_NO_FLAGS),
            state: None,
            keymap_text: None,
        }
    }

    /// Whether a keymap has been forwarded and compiled. Key events are
    /// dropped until then; the compositor could not interpret them anyway.
    fn ready(&self) -> bool {
        self.state.is_some()
    }

    fn matches(&self, text: &str) -> bool {
        self.keymap_text.as_deref() == Some(text)
    }

    fn install(&mut self, text: String) -> Result<()> {
        let keymap = xkb::Keymap::new_from_string(
            &self.context,
            text.clone(),
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| anyhow!("could not compile the xkb keymap sent by the compositor"))?;
        self.state = Some(xkb::State::new(&keymap));
        self.keymap_text = Some(text);
        Ok(())
    }

    fn serialize(&self) -> (u32, u32, u32, u32) {
        match &self.state {
            Some(state) => (
                state.serialize_mods(xkb::STATE_MODS_DEPRESSED),
                state.serialize_mods(xkb::STATE_MODS_LATCHED),
                state.serialize_mods(xkb::STATE_MODS_LOCKED),
                state.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
            ),
            None => (0, 0, 0, 0),
        }
    }

    fn update_key(&mut self, evdev_code: u32, pressed: bool) {
        if let Some(state) = &mut self.state {
            let direction = if pressed {
                xkb::KeyDirection::Down
            } else {
                xkb::KeyDirection::Up
            };
            state.update_key((evdev_code + EVDEV_XKB_OFFSET).into(), direction);
        }
    }
}

/// Everything bound to one attached output.
struct OutputSlot {
    global_name: u32,
    output: WlOutput,
    xdg_output: ZxdgOutputV1,
    layer: OverlayLayer,
}

/// The single owning state value threaded through the event loop.
pub struct Engine {
    qh: QueueHandle<Engine>,
    registry: WlRegistry,
    cfg: Config,

    clock: Clock,
    entropy: Entropy,
    layout: OutputMap,
    cursor: VirtualCursor,
    queue: DelayQueue<BufferedEvent>,
    combo: EscapeCombo,
    pipeline: InputPipeline,
    xkb: XkbTracker,

    slots: Box<[Option<OutputSlot>; MAX_OUTPUTS]>,

    compositor: WlCompositor,
    shm: WlShm,
    seat: WlSeat,
    keyboard: Option<WlKeyboard>,
    layer_shell: ZwlrLayerShellV1,
    xdg_output_manager: ZxdgOutputManagerV1,
    virtual_pointer: ZwlrVirtualPointerV1,
    virtual_keyboard: ZwpVirtualKeyboardV1,

    /// First failure raised inside a protocol callback; callbacks cannot
    /// return errors, so the loop re-raises this after each dispatch.
    fatal: Option<anyhow::Error>,
}

impl Engine {
    /// Binds all required globals and attaches the initial outputs.
    ///
    /// Every missing global is a startup-fatal error with a named
    /// diagnostic; wayveil cannot degrade gracefully without any of them.
    pub fn new(cfg: Config, globals: &GlobalList, qh: &QueueHandle<Engine>) -> Result<Self> {
        let compositor: WlCompositor = globals
            .bind(qh, 4..=6, ())
            .context("compositor does not provide wl_compositor (v4+)")?;
        let shm: WlShm = globals
            .bind(qh, 1..=2, ())
            .context("compositor does not provide wl_shm")?;
        let seat: WlSeat = globals
            .bind(qh, 1..=9, ())
            .context("compositor does not provide wl_seat")?;
        let layer_shell: ZwlrLayerShellV1 = globals.bind(qh, 1..=4, ()).context(
            "compositor does not provide zwlr_layer_shell_v1; \
             the overlay cursor cannot be drawn",
        )?;
        let xdg_output_manager: ZxdgOutputManagerV1 = globals
            .bind(qh, 1..=3, ())
            .context("compositor does not provide zxdg_output_manager_v1")?;
        let pointer_manager: ZwlrVirtualPointerManagerV1 = globals.bind(qh, 1..=2, ()).context(
            "compositor does not provide zwlr_virtual_pointer_manager_v1 \
             (requires a wlroots-based compositor)",
        )?;
        let keyboard_manager: ZwpVirtualKeyboardManagerV1 = globals
            .bind(qh, 1..=1, ())
            .context("compositor does not provide zwp_virtual_keyboard_manager_v1")?;

        let virtual_pointer = pointer_manager.create_virtual_pointer(None, qh, ());
        let virtual_keyboard = keyboard_manager.create_virtual_keyboard(&seat, qh, ());

        let seat_count = globals
            .contents()
            .with_list(|list| list.iter().filter(|g| g.interface == "wl_seat").count());
        if seat_count > 1 {
            warn!("multiple seats detected, all but the first will be ignored");
        }

        let max_delay = cfg.max_delay;
        let combo = cfg.combo.clone();
        let mut engine = Self {
            qh: qh.clone(),
            registry: globals.registry().clone(),
            cfg,
            clock: Clock::new(),
            entropy: Entropy::open().context("could not open the entropy source")?,
            layout: OutputMap::new(),
            cursor: VirtualCursor::new(),
            queue: DelayQueue::new(max_delay),
            combo,
            pipeline: InputPipeline::new(),
            xkb: XkbTracker::new(),
            slots: Box::new(std::array::from_fn(|_| None)),
            compositor,
            shm,
            seat,
            keyboard: None,
            layer_shell,
            xdg_output_manager,
            virtual_pointer,
            virtual_keyboard,
            fatal: None,
        };

        let initial_outputs: Vec<(u32, u32)> = globals.contents().with_list(|list| {
            list.iter()
                .filter(|g| g.interface == "wl_output")
                .map(|g| (g.name, g.version))
                .collect()
        });
        for (name, version) in initial_outputs {
            engine.attach_output(name, version);
        }
        engine.check_fatal()?;

        Ok(engine)
    }

    /// Grabs every existing input device node.
    pub fn scan_input_devices(&mut self) -> Result<()> {
        let attached = self
            .pipeline
            .scan(Path::new(INPUT_DEVICE_DIR))
            .context("could not open input devices")?;
        info!("grabbed {attached} input device node(s)");
        Ok(())
    }

    /// Drains all currently decoded input events into the scheduler.
    pub fn drain_input(&mut self) -> Result<ControlFlow> {
        while let Some(event) = self.pipeline.next_event() {
            match classify(&event, self.layout.space()) {
                Classified::MotionRelative { dx, dy } => {
                    let Some(space) = self.layout.space().copied() else {
                        continue;
                    };
                    self.cursor.aim_relative(dx, dy, &space);
                    self.relocate_and_schedule()?;
                }
                Classified::MotionAbsolute { x, y } => {
                    self.cursor.aim_absolute(x, y);
                    self.relocate_and_schedule()?;
                }
                Classified::Key { code, pressed } => {
                    if self.combo.observe(code, pressed) {
                        info!("escape key combo matched");
                        return Ok(ControlFlow::Exit);
                    }
                    self.schedule_device(event, DeviceEventKind::Key)?;
                }
                Classified::Buffer(kind) => self.schedule_device(event, kind)?,
                Classified::DeviceRemoved(device) => {
                    let drained = self
                        .queue
                        .drain_device(|buffered| buffered.event.device() == device);
                    if drained > 0 {
                        debug!("[engine] drained {drained} packet(s) from removed device");
                    }
                }
                Classified::Discard => {}
            }
        }
        Ok(ControlFlow::Continue)
    }

    /// Releases every packet whose scheduled time has arrived.
    pub fn release_due(&mut self) -> Result<()> {
        let now = self.clock.now_ms();
        while let Some(packet) = self.queue.pop_due(now) {
            let ts = wire_time(packet.sched_time)
                .context("cannot release buffered events; supervisor should restart wayveil")?;
            match packet.body {
                PacketBody::PointerMove { x, y } => self.replay_pointer_move(ts, x, y),
                PacketBody::Device(buffered) => self.replay_device(ts, buffered),
            }
        }
        Ok(())
    }

    /// Redraws every output whose overlay is marked pending.
    pub fn redraw_pending(&mut self) {
        let cursor = self.cursor.point();
        let local = self.layout.abs_to_local(cursor.x, cursor.y);
        let color = self.cfg.cursor_color;
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            let Some(entry) = entry.as_mut() else {
                continue;
            };
            if !entry.layer.frame_pending {
                continue;
            }
            let cursor_local = local
                .filter(|l| l.output == slot)
                .map(|l| (l.x, l.y));
            entry.layer.draw(cursor_local, color);
        }
    }

    /// Pumps the libinput fd.
    pub fn dispatch_input(&mut self) -> Result<()> {
        self.pipeline.dispatch().context("input decoding failed")?;
        Ok(())
    }

    /// Applies one hotplug command from the device-node watcher.
    pub fn handle_hotplug(&mut self, event: HotplugEvent) -> Result<()> {
        match event {
            HotplugEvent::Attach(name) => {
                self.pipeline.attach(&name);
                self.pipeline
                    .check_grab()
                    .context("hotplugged device could not be grabbed")?;
            }
            HotplugEvent::Detach(name) => {
                if let Some(device) = self.pipeline.detach(&name) {
                    let drained = self
                        .queue
                        .drain_device(|buffered| buffered.event.device() == device);
                    if drained > 0 {
                        debug!("[engine] drained {drained} packet(s) from detached {name}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Poll timeout derived from the queue head (see the scheduler).
    pub fn poll_timeout(&self) -> PollTimeout {
        match self.queue.poll_deadline(self.clock.now_ms()) {
            Some(ms) => {
                let ms = ms.clamp(0, i64::from(i32::MAX)) as i32;
                PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
            }
            None => PollTimeout::NONE,
        }
    }

    /// Fails once the monotonic clock can no longer be narrowed to the
    /// wire format; the process must restart to rebase its epoch.
    pub fn guard_clock(&self) -> Result<()> {
        let now = self.clock.now_ms();
        if now > WIRE_TIME_LIMIT {
            return Err(anyhow!(
                "monotonic clock crossed the 32-bit wire boundary after {now} ms; \
                 restart required"
            ));
        }
        Ok(())
    }

    /// Re-raises the first error recorded inside a protocol callback.
    pub fn check_fatal(&mut self) -> Result<()> {
        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Raw libinput fd for the poll set.
    pub fn input_fd(&self) -> RawFd {
        self.pipeline.fd()
    }

    fn record_fatal(&mut self, err: anyhow::Error) {
        if self.fatal.is_none() {
            self.fatal = Some(err);
        } else {
            debug!("[engine] suppressing secondary failure: {err:#}");
        }
    }

    /// Binds a new output global into a free slot.
    fn attach_output(&mut self, global_name: u32, version: u32) {
        let Some(slot) = self.slots.iter().position(|s| s.is_none()) else {
            self.record_fatal(anyhow!(
                "cannot handle more than {MAX_OUTPUTS} displays attached at once"
            ));
            return;
        };
        let output: WlOutput =
            self.registry
                .bind(global_name, version.min(4), &self.qh, slot);
        let xdg_output = self
            .xdg_output_manager
            .get_xdg_output(&output, &self.qh, slot);
        self.layout.reset_slot(slot);
        let layer = OverlayLayer::new(
            &self.compositor,
            &self.layer_shell,
            &output,
            &self.qh,
            slot,
        );
        self.slots[slot] = Some(OutputSlot {
            global_name,
            output,
            xdg_output,
            layer,
        });
        debug!("[engine] output global {global_name} bound to slot {slot}");
    }

    /// Tears down an output on hotplug-out and recomputes the space.
    fn detach_output(&mut self, global_name: u32) {
        let Some(slot) = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.global_name == global_name))
        else {
            return;
        };
        if let Some(entry) = self.slots[slot].take() {
            entry.layer.destroy();
            entry.xdg_output.destroy();
            if entry.output.version() >= 3 {
                entry.output.release();
            }
        }
        self.layout.remove(slot);
        if let Err(err) = self.layout.recalc() {
            self.record_fatal(err.into());
            return;
        }
        debug!("[engine] output global {global_name} removed from slot {slot}");
    }

    /// Promotes pending geometry on `wl_output::done` and recomputes.
    fn finish_output_configure(&mut self, slot: usize) {
        if !self.layout.promote(slot) {
            // Zero-valued geometry; the compositor has not described the
            // output yet.
            return;
        }
        if let Err(err) = self.layout.recalc() {
            self.record_fatal(err.into());
        }
    }

    /// Handles a layer-surface configure for a slot.
    fn handle_layer_configure(&mut self, slot: usize, serial: u32, width: u32, height: u32) {
        let shm = self.shm.clone();
        let qh = self.qh.clone();
        let result = match self.slots[slot].as_mut() {
            Some(entry) => entry.layer.configure(&shm, &qh, slot, serial, width, height),
            None => Ok(()),
        };
        if let Err(err) = result {
            self.record_fatal(err.into());
        }
    }

    /// Forwards the seat's keymap to the virtual keyboard and compiles it
    /// for local modifier tracking. Identical keymaps are deduplicated.
    fn handle_keymap(&mut self, fd: OwnedFd, size: u32) -> Result<()> {
        let file = File::from(fd);
        // SAFETY: private read-only mapping of the keymap fd the
        // compositor just handed us, unmapped before the file closes.
        let map = unsafe { MmapOptions::new().len(size as usize).map_copy_read_only(&file) }
            .context("could not map the compositor keymap")?;
        let end = map.iter().position(|&b| b == 0).unwrap_or(map.len());
        let text = std::str::from_utf8(&map[..end])
            .context("compositor keymap is not valid UTF-8")?;
        if self.xkb.matches(text) {
            return Ok(());
        }
        self.virtual_keyboard
            .keymap(KEYMAP_FORMAT_XKB_V1, file.as_fd(), size);
        let text = text.to_string();
        self.xkb.install(text)
    }

    /// Walks the cursor to its new position and schedules (or coalesces)
    /// the resulting pointer-move packet.
    fn relocate_and_schedule(&mut self) -> Result<()> {
        let prev = self.cursor.prev_point();
        if self.layout.abs_to_local(prev.x, prev.y).is_none() {
            // The previous position is off every confirmed output (first
            // motion after startup, or the output under the cursor was
            // unplugged). Re-home and start clean.
            let Some((slot, geometry)) = self.layout.first_confirmed() else {
                return Ok(());
            };
            debug!("[engine] cursor position invalid, re-homing to output slot {slot}");
            self.cursor.rehome(Point::new(geometry.x, geometry.y));
        }

        let start = self.cursor.prev_point();
        let target = self.cursor.point();
        let end = cursor::glide(&self.layout, start, target)
            .context("virtual cursor state is inconsistent")?;
        self.cursor.settle(end);

        if let Some(local) = self.layout.abs_to_local(start.x, start.y) {
            self.mark_frame_pending(local.output);
        }
        if let Some(local) = self.layout.abs_to_local(end.x, end.y) {
            self.mark_frame_pending(local.output);
        }

        if self.queue.coalesce_pointer_move(end.x, end.y) {
            return Ok(());
        }
        let now = self.clock.now_ms();
        self.queue
            .enqueue(PacketBody::PointerMove { x: end.x, y: end.y }, now, &mut self.entropy)
            .context("could not schedule pointer move")?;
        Ok(())
    }

    fn mark_frame_pending(&mut self, slot: usize) {
        if let Some(entry) = self.slots[slot].as_mut() {
            entry.layer.frame_pending = true;
        }
    }

    fn schedule_device(&mut self, event: Event, kind: DeviceEventKind) -> Result<()> {
        let now = self.clock.now_ms();
        self.queue
            .enqueue(
                PacketBody::Device(BufferedEvent { event, kind }),
                now,
                &mut self.entropy,
            )
            .context("could not schedule input event")?;
        Ok(())
    }

    /// Emits a released pointer move through the virtual pointer.
    fn replay_pointer_move(&self, ts: u32, x: i32, y: i32) {
        let Some(space) = self.layout.space() else {
            // All outputs vanished while the packet was queued.
            return;
        };
        // A target scheduled before an output change may sit outside the
        // current space; clamp it back in rather than emit garbage.
        let x = x.clamp(space.origin_x, space.extent_x - 1);
        let y = y.clamp(space.origin_y, space.extent_y - 1);
        // Origin-relative values and extents fit u32: both operands are
        // i32 and the differences are non-negative by construction.
        let local_x = (i64::from(x) - i64::from(space.origin_x)) as u32;
        let local_y = (i64::from(y) - i64::from(space.origin_y)) as u32;
        let extent_x = (i64::from(space.extent_x) - i64::from(space.origin_x)) as u32;
        let extent_y = (i64::from(space.extent_y) - i64::from(space.origin_y)) as u32;
        self.virtual_pointer
            .motion_absolute(ts, local_x, local_y, extent_x, extent_y);
        self.virtual_pointer.frame();
    }

    /// Replays a buffered device event through the virtual devices.
    fn replay_device(&mut self, ts: u32, buffered: BufferedEvent) {
        match buffered.kind {
            DeviceEventKind::Key => {
                if !self.xkb.ready() {
                    return;
                }
                if let Event::Keyboard(KeyboardEvent::Key(key_event)) = &buffered.event {
                    let key = key_event.key();
                    let pressed = key_event.key_state() == KeyState::Pressed;
                    let (depressed, latched, locked, group) = self.xkb.serialize();
                    self.virtual_keyboard
                        .modifiers(depressed, latched, locked, group);
                    self.virtual_keyboard.key(
                        ts,
                        key,
                        if pressed {
                            KEY_STATE_PRESSED
                        } else {
                            KEY_STATE_RELEASED
                        },
                    );
                    self.xkb.update_key(key, pressed);
                }
            }
            DeviceEventKind::Button => {
                if let Event::Pointer(PointerEvent::Button(button_event)) = &buffered.event {
                    let state = match button_event.button_state() {
                        ButtonState::Pressed => wl_pointer::ButtonState::Pressed,
                        ButtonState::Released => wl_pointer::ButtonState::Released,
                    };
                    // libinput and the virtual-pointer protocol both use
                    // evdev button codes; pass them straight through.
                    self.virtual_pointer.button(ts, button_event.button(), state);
                    self.virtual_pointer.frame();
                }
            }
            DeviceEventKind::Scroll(source) => match &buffered.event {
                Event::Pointer(PointerEvent::ScrollWheel(ev)) => self.replay_scroll(ts, ev, source),
                Event::Pointer(PointerEvent::ScrollFinger(ev)) => {
                    self.replay_scroll(ts, ev, source)
                }
                Event::Pointer(PointerEvent::ScrollContinuous(ev)) => {
                    self.replay_scroll(ts, ev, source)
                }
                _ => {}
            },
            DeviceEventKind::DeviceAdded => {
                let mut device = buffered.event.device();
                if device.config_tap_finger_count() > 0 {
                    let _ = device.config_tap_set_enabled(true);
                }
            }
            DeviceEventKind::Passthrough => {}
        }
    }

    fn replay_scroll<E: PointerScrollEvent>(&self, ts: u32, event: &E, source: ScrollSource) {
        let source_wire = match source {
            ScrollSource::Wheel => wl_pointer::AxisSource::Wheel,
            ScrollSource::Finger => wl_pointer::AxisSource::Finger,
            ScrollSource::Continuous => wl_pointer::AxisSource::Continuous,
        };
        for (axis, wire_axis) in [
            (Axis::Vertical, wl_pointer::Axis::VerticalScroll),
            (Axis::Horizontal, wl_pointer::Axis::HorizontalScroll),
        ]
        {
            if event.has_axis(axis) {
                let value = event.scroll_value(axis);
                if value == 0.0 {
                    self.virtual_pointer.axis_stop(ts, wire_axis);
                } else {
                    self.virtual_pointer.axis(ts, wire_axis, value);
                }
                // The source accompanies every present axis, even one
                // whose zero delta only produced an axis_stop.
                self.virtual_pointer.axis_source(source_wire);
            }
        }
        self.virtual_pointer.frame();
    }
}

/// Flushes outbound Wayland requests, tolerating socket backpressure.
fn flush(conn: &Connection) -> Result<()> {
    use wayland_client::backend::WaylandError;
    match conn.flush() {
        Ok(()) => Ok(()),
        Err(WaylandError::Io(ref err)) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
        Err(err) => Err(err).context("could not flush the Wayland connection"),
    }
}

/// Connects to the compositor and runs the anonymization loop.
///
/// Returns `Ok(())` only when the escape combo fires; every other return
/// is a fatal error.
pub fn run(cfg: Config) -> Result<()> {
    let conn = Connection::connect_to_env()
        .context("could not connect to the Wayland display (is WAYLAND_DISPLAY set?)")?;
    let (globals, mut event_queue) =
        registry_queue_init::<Engine>(&conn).context("could not enumerate Wayland globals")?;
    let qh = event_queue.handle();
    let mut engine = Engine::new(cfg, &globals, &qh)?;

    event_queue
        .roundtrip(&mut engine)
        .context("initial Wayland roundtrip failed")?;
    engine.check_fatal()?;

    engine.scan_input_devices()?;
    let mut hotplug = HotplugWatcher::new(Path::new(INPUT_DEVICE_DIR))
        .context("could not start the input hotplug watcher")?;

    info!("entering anonymization loop");
    loop {
        engine.guard_clock()?;

        let read_guard = loop {
            match event_queue.prepare_read() {
                Some(guard) => break guard,
                None => {
                    event_queue
                        .dispatch_pending(&mut engine)
                        .context("Wayland dispatch failed")?;
                    engine.check_fatal()?;
                }
            }
        };
        flush(&conn)?;

        if engine.drain_input()? == ControlFlow::Exit {
            return Ok(());
        }
        engine.release_due()?;
        engine.redraw_pending();
        flush(&conn)?;

        let timeout = engine.poll_timeout();
        let (wayland_ready, input_ready, hotplug_ready) = {
            // SAFETY: the libinput fd stays open for the lifetime of the
            // pipeline, which outlives this scope.
            let input_fd = unsafe { BorrowedFd::borrow_raw(engine.input_fd()) };
            let mut fds = [
                PollFd::new(read_guard.connection_fd(), PollFlags::POLLIN),
                PollFd::new(input_fd, PollFlags::POLLIN),
                PollFd::new(hotplug.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, timeout) {
                Ok(_) => {
                    let ready = |fd: &PollFd| {
                        fd.revents()
                            .is_some_and(|revents| revents.contains(PollFlags::POLLIN))
                    };
                    (ready(&fds[0]), ready(&fds[1]), ready(&fds[2]))
                }
                Err(Errno::EINTR) => (false, false, false),
                Err(errno) => return Err(anyhow::Error::new(errno).context("poll failed")),
            }
        };

        if wayland_ready {
            read_guard
                .read()
                .context("could not read Wayland events")?;
            event_queue
                .dispatch_pending(&mut engine)
                .context("Wayland dispatch failed")?;
            engine.check_fatal()?;
        } else {
            drop(read_guard);
        }
        if input_ready {
            engine.dispatch_input()?;
        }
        if hotplug_ready {
            for event in hotplug.drain().context("hotplug watcher failed")? {
                engine.handle_hotplug(event)?;
            }
        }
    }
}
