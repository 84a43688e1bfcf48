//! Overlay cursor rendering.
//!
//! Delayed pointer replay means the compositor's own cursor lags behind
//! the user's hand, so wayveil draws the live cursor itself: one
//! layer-shell surface per output, anchored to all four edges, on the
//! overlay layer, with an empty input region so it never swallows events.
//!
//! Each surface is backed by a shared-memory pool holding a small ring of
//! ARGB8888 frames. A frame is `Free` until it is attached and committed,
//! `InFlight` until the compositor releases it, and the cursor block drawn
//! into it is blanked before the frame is reused. Redraw requests are
//! skipped silently while the surface is unconfigured or no free frame is
//! available; the `frame_pending` flag stays set so the next loop pass
//! retries.

use std::fs::File;
use std::os::fd::AsFd;

use memmap2::{MmapMut, MmapOptions};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::ftruncate;
use thiserror::Error;
use tracing::debug;
use wayland_client::protocol::{
    wl_compositor::WlCompositor,
    wl_output::WlOutput,
    wl_shm::{self, WlShm},
    wl_shm_pool::WlShmPool,
    wl_surface::WlSurface,
};
use wayland_client::QueueHandle;
use wayland_protocols_wlr::layer_shell::v1::client::{
    zwlr_layer_shell_v1::{Layer, ZwlrLayerShellV1},
    zwlr_layer_surface_v1::{Anchor, ZwlrLayerSurfaceV1},
};

use crate::engine::Engine;

/// Half-width of the drawn cursor block in pixels.
pub const CURSOR_RADIUS: i32 = 15;

/// Frames per output pool.
const FRAME_RING_SIZE: usize = 2;

/// Bytes per ARGB8888 pixel.
const BYTES_PER_PIXEL: u32 = 4;

/// Namespace reported to the layer-shell.
const LAYER_NAMESPACE: &str = "wayveil";

/// Overlay error types.
#[derive(Error, Debug)]
pub enum OverlayError {
    /// Shared memory for the frame pool could not be allocated.
    #[error("could not allocate shared memory for the overlay frame pool: {0}")]
    ShmAlloc(#[from] nix::errno::Errno),

    /// Mapping the frame pool failed.
    #[error("could not map the overlay frame pool: {0}")]
    Map(#[from] std::io::Error),

    /// The configured surface size is not representable.
    #[error("overlay surface size {width}x{height} is out of range")]
    SizeOutOfRange {
        /// Configured width.
        width: u32,
        /// Configured height.
        height: u32,
    },
}

/// Identifies a ring frame in `wl_buffer` user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId {
    /// Output slot owning the buffer.
    pub slot: usize,
    /// Frame index within the ring.
    pub frame: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Free,
    InFlight,
}

struct Frame {
    buffer: wayland_client::protocol::wl_buffer::WlBuffer,
    state: FrameState,
    /// Local cursor position drawn into this frame, blanked before reuse.
    last_cursor: Option<(i32, i32)>,
}

struct FramePool {
    wl_pool: WlShmPool,
    map: MmapMut,
    frames: Vec<Frame>,
    /// Keeps the memfd alive for the compositor's benefit.
    _file: File,
}

impl FramePool {
    fn destroy(self) {
        for frame in &self.frames {
            frame.buffer.destroy();
        }
        self.wl_pool.destroy();
    }
}

/// Per-output overlay surface with its frame ring.
pub struct OverlayLayer {
    surface: WlSurface,
    layer_surface: ZwlrLayerSurfaceV1,
    configured: bool,
    /// Set when the cursor moved across this output and a redraw is owed.
    pub frame_pending: bool,
    width: u32,
    height: u32,
    frame_size: usize,
    pool: Option<FramePool>,
}

impl OverlayLayer {
    /// Creates the layer surface for an output and commits the initial
    /// (unsized) state so the compositor sends a configure.
    pub fn new(
        compositor: &WlCompositor,
        layer_shell: &ZwlrLayerShellV1,
        output: &WlOutput,
        qh: &QueueHandle<Engine>,
        slot: usize,
    ) -> Self {
        let surface = compositor.create_surface(qh, ());
        let layer_surface = layer_shell.get_layer_surface(
            &surface,
            Some(output),
            Layer::Overlay,
            LAYER_NAMESPACE.to_string(),
            qh,
            slot,
        );
        layer_surface.set_anchor(Anchor::Top | Anchor::Bottom | Anchor::Left | Anchor::Right);

        // The overlay must never intercept input.
        let region = compositor.create_region(qh, ());
        surface.set_input_region(Some(&region));
        region.destroy();

        surface.commit();

        Self {
            surface,
            layer_surface,
            configured: false,
            frame_pending: true,
            width: 0,
            height: 0,
            frame_size: 0,
            pool: None,
        }
    }

    /// Handles a layer-surface configure: acks and (re)allocates the pool.
    pub fn configure(
        &mut self,
        shm: &WlShm,
        qh: &QueueHandle<Engine>,
        slot: usize,
        serial: u32,
        width: u32,
        height: u32,
    ) -> Result<(), OverlayError> {
        self.layer_surface.ack_configure(serial);
        if width == 0 || height == 0 {
            // Nothing drawable yet; wait for a sized configure.
            return Ok(());
        }
        if self.configured && self.width == width && self.height == height {
            return Ok(());
        }

        let stride = u64::from(width) * u64::from(BYTES_PER_PIXEL);
        let frame_size = stride * u64::from(height);
        let pool_size = frame_size * FRAME_RING_SIZE as u64;
        if pool_size > i32::MAX as u64 {
            return Err(OverlayError::SizeOutOfRange { width, height });
        }

        if let Some(old) = self.pool.take() {
            old.destroy();
        }

        let fd = memfd_create(
            c"wayveil-frames",
            MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
        )?;
        ftruncate(&fd, pool_size as i64)?;
        let file = File::from(fd);
        // SAFETY: the mapping covers exactly the region just allocated and
        // lives no longer than the file it maps.
        let map = unsafe { MmapOptions::new().len(pool_size as usize).map_mut(&file) }?;

        let wl_pool = shm.create_pool(file.as_fd(), pool_size as i32, qh, ());
        let frames = (0..FRAME_RING_SIZE)
            .map(|frame| Frame {
                buffer: wl_pool.create_buffer(
                    (frame as u64 * frame_size) as i32,
                    width as i32,
                    height as i32,
                    stride as i32,
                    wl_shm::Format::Argb8888,
                    qh,
                    BufferId { slot, frame },
                ),
                state: FrameState::Free,
                last_cursor: None,
            })
            .collect();

        self.pool = Some(FramePool {
            wl_pool,
            map,
            frames,
            _file: file,
        });
        self.width = width;
        self.height = height;
        self.frame_size = frame_size as usize;
        self.configured = true;
        self.frame_pending = true;
        debug!("[overlay] slot {slot} configured at {width}x{height}");
        Ok(())
    }

    /// The layer surface was closed by the compositor.
    pub fn closed(&mut self) {
        self.configured = false;
    }

    /// Returns a released frame to the ring.
    pub fn frame_released(&mut self, frame: usize) {
        if let Some(pool) = self.pool.as_mut() {
            if let Some(frame) = pool.frames.get_mut(frame) {
                frame.state = FrameState::Free;
            }
        }
    }

    /// Draws the cursor (or its absence) into a free frame and commits.
    ///
    /// Skipped silently while unconfigured or with no free frame;
    /// `frame_pending` then stays set and the next pass retries.
    pub fn draw(&mut self, cursor_local: Option<(i32, i32)>, color: u32) {
        if !self.configured {
            return;
        }
        let Some(pool) = self.pool.as_mut() else {
            return;
        };
        let Some(idx) = pool
            .frames
            .iter()
            .position(|f| f.state == FrameState::Free)
        else {
            return;
        };
        self.frame_pending = false;

        let frame_size = self.frame_size;
        let width = self.width as i32;
        let height = self.height as i32;
        let pixels = &mut pool.map[idx * frame_size..(idx + 1) * frame_size];
        let frame = &mut pool.frames[idx];

        if let Some((last_x, last_y)) = frame.last_cursor.take() {
            // Blank whatever this frame drew the last time around.
            draw_block(pixels, width, height, last_x, last_y, CURSOR_RADIUS, 0, false);
            damage_clamped(&self.surface, last_x, last_y, CURSOR_RADIUS);
        }
        if let Some((x, y)) = cursor_local {
            draw_block(pixels, width, height, x, y, CURSOR_RADIUS, color, true);
            damage_clamped(&self.surface, x, y, CURSOR_RADIUS);
            frame.last_cursor = Some((x, y));
        }

        self.surface.attach(Some(&frame.buffer), 0, 0);
        self.surface.commit();
        frame.state = FrameState::InFlight;
    }

    /// Tears down all protocol objects for this output.
    pub fn destroy(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.destroy();
        }
        self.layer_surface.destroy();
        self.surface.destroy();
    }
}

/// Damages the cursor block, clamping negative origins to the surface.
fn damage_clamped(surface: &WlSurface, x: i32, y: i32, radius: i32) {
    let side = 2 * radius + 1;
    surface.damage_buffer((x - radius).max(0), (y - radius).max(0), side, side);
}

/// Draws a square block centered on `(x, y)` into an ARGB8888 buffer.
///
/// With `crosshair` set, the row and column through the center are painted
/// in `color` and the rest of the block is cleared; without it the whole
/// block is cleared. The block is clipped to the buffer bounds.
pub fn draw_block(
    pixels: &mut [u8],
    width: i32,
    height: i32,
    x: i32,
    y: i32,
    radius: i32,
    color: u32,
    crosshair: bool,
) {
    let start_x = (x - radius).max(0);
    let start_y = (y - radius).max(0);
    let end_x = (x + radius).min(width - 1);
    let end_y = (y + radius).min(height - 1);

    for row in start_y..=end_y {
        for col in start_x..=end_x {
            let value = if crosshair && (col == x || row == y) {
                color
            } else {
                0x0000_0000
            };
            let offset = (row as usize * width as usize + col as usize) * 4;
            pixels[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(pixels: &[u8], width: i32, x: i32, y: i32) -> u32 {
        let offset = (y as usize * width as usize + x as usize) * 4;
        u32::from_le_bytes(pixels[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_draw_block_crosshair_pattern() {
        let (w, h) = (64, 64);
        let mut pixels = vec![0u8; (w * h * 4) as usize];
        draw_block(&mut pixels, w, h, 32, 32, 5, 0xFFFF_0000, true);

        // Center row and column carry the color.
        assert_eq!(pixel(&pixels, w, 32, 32), 0xFFFF_0000);
        assert_eq!(pixel(&pixels, w, 27, 32), 0xFFFF_0000);
        assert_eq!(pixel(&pixels, w, 32, 37), 0xFFFF_0000);
        // Block corners are cleared, outside is untouched.
        assert_eq!(pixel(&pixels, w, 27, 27), 0);
        assert_eq!(pixel(&pixels, w, 26, 32), 0);
    }

    #[test]
    fn test_draw_block_blank_clears_everything() {
        let (w, h) = (16, 16);
        let mut pixels = vec![0xAAu8; (w * h * 4) as usize];
        draw_block(&mut pixels, w, h, 8, 8, 3, 0xFFFF_0000, false);
        assert_eq!(pixel(&pixels, w, 8, 8), 0);
        assert_eq!(pixel(&pixels, w, 5, 5), 0);
        // Outside the block the old contents survive.
        assert_eq!(pixel(&pixels, w, 0, 0), 0xAAAA_AAAA);
    }

    #[test]
    fn test_draw_block_clips_at_edges() {
        let (w, h) = (8, 8);
        let mut pixels = vec![0u8; (w * h * 4) as usize];
        // Centered outside the corner; must not panic and must paint the
        // clipped crosshair arm that falls inside.
        draw_block(&mut pixels, w, h, 0, 0, 4, 0xFF00_FF00, true);
        assert_eq!(pixel(&pixels, w, 0, 0), 0xFF00_FF00);
        assert_eq!(pixel(&pixels, w, 4, 0), 0xFF00_FF00);
        draw_block(&mut pixels, w, h, 7, 7, 4, 0xFF00_FF00, true);
        assert_eq!(pixel(&pixels, w, 7, 7), 0xFF00_FF00);
    }

    #[test]
    fn test_draw_block_fully_outside_is_noop() {
        let (w, h) = (8, 8);
        let mut pixels = vec![0u8; (w * h * 4) as usize];
        draw_block(&mut pixels, w, h, -20, -20, 4, 0xFFFF_FFFF, true);
        assert!(pixels.iter().all(|&b| b == 0));
    }
}
