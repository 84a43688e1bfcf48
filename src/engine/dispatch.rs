//! Wayland protocol dispatch for the engine.
//!
//! Every callback mutates the one `Engine` value under the cooperative
//! model: handlers run synchronously inside `dispatch_pending` and never
//! re-enter. Failures raised here are recorded on the engine and
//! re-raised by the loop, since `Dispatch` handlers cannot return errors.

use tracing::{debug, warn};
use wayland_client::globals::GlobalListContents;
use wayland_client::protocol::{
    wl_buffer, wl_compositor::WlCompositor, wl_keyboard, wl_output, wl_region::WlRegion,
    wl_registry, wl_seat, wl_shm::WlShm, wl_shm_pool::WlShmPool, wl_surface::WlSurface,
};
use wayland_client::{delegate_noop, Connection, Dispatch, QueueHandle, WEnum};
use wayland_protocols::xdg::xdg_output::zv1::client::zxdg_output_manager_v1::ZxdgOutputManagerV1;
use wayland_protocols::xdg::xdg_output::zv1::client::zxdg_output_v1;
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
};
use wayland_protocols_wlr::layer_shell::v1::client::{
    zwlr_layer_shell_v1::ZwlrLayerShellV1, zwlr_layer_surface_v1,
};
use wayland_protocols_wlr::virtual_pointer::v1::client::{
    zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
    zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1,
};

use super::Engine;
use crate::overlay::BufferId;

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for Engine {
    fn event(
        engine: &mut Self,
        _registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => match interface.as_str() {
                "wl_output" => engine.attach_output(name, version),
                "wl_seat" => {
                    warn!("additional seat advertised, all but the first will be ignored");
                }
                _ => {}
            },
            wl_registry::Event::GlobalRemove { name } => engine.detach_output(name),
            _ => {}
        }
    }
}

impl Dispatch<wl_output::WlOutput, usize> for Engine {
    fn event(
        engine: &mut Self,
        _output: &wl_output::WlOutput,
        event: wl_output::Event,
        slot: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // Geometry comes from xdg-output; wl_output only marks the end of
        // a configure cycle.
        if let wl_output::Event::Done = event {
            engine.finish_output_configure(*slot);
        }
    }
}

impl Dispatch<zxdg_output_v1::ZxdgOutputV1, usize> for Engine {
    fn event(
        engine: &mut Self,
        _xdg_output: &zxdg_output_v1::ZxdgOutputV1,
        event: zxdg_output_v1::Event,
        slot: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zxdg_output_v1::Event::LogicalPosition { x, y } => {
                engine.layout.stage_position(*slot, x, y);
            }
            zxdg_output_v1::Event::LogicalSize { width, height } => {
                engine.layout.stage_size(*slot, width, height);
            }
            // Deprecated since xdg-output v3; wl_output::done closes the
            // cycle instead.
            zxdg_output_v1::Event::Done => {}
            _ => {}
        }
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for Engine {
    fn event(
        engine: &mut Self,
        _seat: &wl_seat::WlSeat,
        event: wl_seat::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_seat::Event::Capabilities {
                capabilities: WEnum::Value(capabilities),
            } => {
                if capabilities.contains(wl_seat::Capability::Keyboard) {
                    if engine.keyboard.is_none() {
                        let keyboard = engine.seat.get_keyboard(qh, ());
                        engine.keyboard = Some(keyboard);
                    }
                } else {
                    engine.record_fatal(anyhow::anyhow!(
                        "seat advertises no keyboard capability; cannot track the keymap"
                    ));
                }
            }
            wl_seat::Event::Name { name } => debug!("[engine] seat name: {name}"),
            _ => {}
        }
    }
}

impl Dispatch<wl_keyboard::WlKeyboard, ()> for Engine {
    fn event(
        engine: &mut Self,
        _keyboard: &wl_keyboard::WlKeyboard,
        event: wl_keyboard::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // Only the keymap matters; the daemon never has keyboard focus,
        // and real key events arrive through libinput anyway.
        if let wl_keyboard::Event::Keymap { format, fd, size } = event {
            if format != WEnum::Value(wl_keyboard::KeymapFormat::XkbV1) {
                warn!("compositor sent a non-xkb keymap; ignoring it");
                return;
            }
            if let Err(err) = engine.handle_keymap(fd, size) {
                engine.record_fatal(err);
            }
        }
    }
}

impl Dispatch<zwlr_layer_surface_v1::ZwlrLayerSurfaceV1, usize> for Engine {
    fn event(
        engine: &mut Self,
        _layer_surface: &zwlr_layer_surface_v1::ZwlrLayerSurfaceV1,
        event: zwlr_layer_surface_v1::Event,
        slot: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_layer_surface_v1::Event::Configure {
                serial,
                width,
                height,
            } => {
                engine.handle_layer_configure(*slot, serial, width, height);
            }
            zwlr_layer_surface_v1::Event::Closed => {
                if let Some(entry) = engine.slots[*slot].as_mut() {
                    entry.layer.closed();
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, BufferId> for Engine {
    fn event(
        engine: &mut Self,
        _buffer: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        id: &BufferId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            if let Some(entry) = engine.slots[id.slot].as_mut() {
                entry.layer.frame_released(id.frame);
            }
        }
    }
}

// Objects that emit no events we care about.
delegate_noop!(Engine: ignore WlShm);
delegate_noop!(Engine: ignore WlSurface);
delegate_noop!(Engine: WlCompositor);
delegate_noop!(Engine: WlShmPool);
delegate_noop!(Engine: WlRegion);
delegate_noop!(Engine: ZwlrLayerShellV1);
delegate_noop!(Engine: ZxdgOutputManagerV1);
delegate_noop!(Engine: ZwlrVirtualPointerManagerV1);
delegate_noop!(Engine: ZwlrVirtualPointerV1);
delegate_noop!(Engine: ZwpVirtualKeyboardManagerV1);
delegate_noop!(Engine: ZwpVirtualKeyboardV1);
