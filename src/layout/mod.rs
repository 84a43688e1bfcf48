//! Output geometry tracking and the global pointer space.
//!
//! The compositor describes each output's logical position and size through
//! `zxdg_output_v1`; updates are staged into a pending slot and promoted to
//! the confirmed geometry only when `wl_output::done` signals a completed
//! configure cycle. The global pointer space is the bounding box of all
//! confirmed outputs. wayveil walks the cursor pixel-by-pixel through that
//! space, so a layout whose outputs do not form a single connected group
//! (touching or overlapping at edges or corners) cannot be supported and is
//! rejected outright.

use thiserror::Error;
use tracing::debug;

/// Upper bound on simultaneously attached outputs.
pub const MAX_OUTPUTS: usize = 128;

/// Layout error types.
#[derive(Error, Debug)]
pub enum LayoutError {
    /// The confirmed outputs do not form one connected group.
    #[error(
        "multiple screens are attached and gaps are present between them; \
         wayveil cannot operate in this configuration"
    )]
    Gapped,

    /// The combined layout exceeds the representable coordinate range.
    #[error("combined screen layout exceeds the supported coordinate range")]
    SpaceOverflow,
}

/// Location and size of one output in compositor-global space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputGeometry {
    /// Left edge in global coordinates.
    pub x: i32,
    /// Top edge in global coordinates.
    pub y: i32,
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
}

impl OutputGeometry {
    /// Whether a global point falls inside this output.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        let x = i64::from(x);
        let y = i64::from(y);
        x >= i64::from(self.x)
            && y >= i64::from(self.y)
            && x < i64::from(self.x) + i64::from(self.width)
            && y < i64::from(self.y) + i64::from(self.height)
    }

    /// Whether two outputs touch or overlap.
    ///
    /// Grow this rectangle by one pixel in every direction; any touch,
    /// including a single-pixel corner contact, then shows up as an
    /// ordinary intersection.
    pub fn touches(&self, other: &OutputGeometry) -> bool {
        let ax0 = i64::from(self.x) - 1;
        let ay0 = i64::from(self.y) - 1;
        let ax1 = i64::from(self.x) + i64::from(self.width) + 1;
        let ay1 = i64::from(self.y) + i64::from(self.height) + 1;

        let bx0 = i64::from(other.x);
        let by0 = i64::from(other.y);
        let bx1 = i64::from(other.x) + i64::from(other.width);
        let by1 = i64::from(other.y) + i64::from(other.height);

        ax0 < bx1 && bx0 < ax1 && ay0 < by1 && by0 < ay1
    }

    fn is_unset(&self) -> bool {
        self.x == 0 && self.y == 0 && self.width == 0 && self.height == 0
    }
}

/// Bounding box of all confirmed outputs.
///
/// `extent_x`/`extent_y` are the maximum lower-right corner, not widths;
/// the usable pointer area is `[origin, extent)` per axis. The origin can
/// be nonzero when outputs sit at negative coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalSpace {
    /// Minimum left edge across confirmed outputs.
    pub origin_x: i32,
    /// Minimum top edge across confirmed outputs.
    pub origin_y: i32,
    /// Maximum right edge across confirmed outputs.
    pub extent_x: i32,
    /// Maximum bottom edge across confirmed outputs.
    pub extent_y: i32,
}

/// A global point resolved to an output-local position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCoord {
    /// Slot index of the containing output.
    pub output: usize,
    /// X relative to the output's origin.
    pub x: i32,
    /// Y relative to the output's origin.
    pub y: i32,
}

/// Pending and confirmed geometry for every output slot, plus the derived
/// global pointer space.
pub struct OutputMap {
    pending: Box<[OutputGeometry; MAX_OUTPUTS]>,
    confirmed: Box<[Option<OutputGeometry>; MAX_OUTPUTS]>,
    space: Option<GlobalSpace>,
}

impl OutputMap {
    /// Creates an empty map; no outputs, no pointer space.
    pub fn new() -> Self {
        Self {
            pending: Box::new([OutputGeometry::default(); MAX_OUTPUTS]),
            confirmed: Box::new([None; MAX_OUTPUTS]),
            space: None,
        }
    }

    /// Resets a slot for a freshly attached output.
    pub fn reset_slot(&mut self, slot: usize) {
        self.pending[slot] = OutputGeometry::default();
        self.confirmed[slot] = None;
    }

    /// Stages a logical-position update for an output.
    pub fn stage_position(&mut self, slot: usize, x: i32, y: i32) {
        self.pending[slot].x = x;
        self.pending[slot].y = y;
    }

    /// Stages a logical-size update for an output.
    pub fn stage_size(&mut self, slot: usize, width: i32, height: i32) {
        self.pending[slot].width = width;
        self.pending[slot].height = height;
    }

    /// Promotes the pending geometry on a completed configure cycle.
    ///
    /// An all-zero geometry means the compositor has not described the
    /// output yet; the update is discarded and `false` returned.
    pub fn promote(&mut self, slot: usize) -> bool {
        if self.pending[slot].is_unset() {
            return false;
        }
        self.confirmed[slot] = Some(self.pending[slot]);
        true
    }

    /// Drops an output on hotplug-out.
    pub fn remove(&mut self, slot: usize) {
        self.reset_slot(slot);
    }

    /// Recomputes the global pointer space from the confirmed outputs.
    ///
    /// Fails when the outputs do not form a single connected group: the
    /// cursor walk cannot cross a gap, so the layout is unusable.
    pub fn recalc(&mut self) -> Result<(), LayoutError> {
        let screens: Vec<OutputGeometry> = self.confirmed.iter().flatten().copied().collect();
        if screens.is_empty() {
            self.space = None;
            return Ok(());
        }

        let mut origin_x = i64::MAX;
        let mut origin_y = i64::MAX;
        let mut extent_x = i64::MIN;
        let mut extent_y = i64::MIN;
        for screen in &screens {
            origin_x = origin_x.min(i64::from(screen.x));
            origin_y = origin_y.min(i64::from(screen.y));
            extent_x = extent_x.max(i64::from(screen.x) + i64::from(screen.width));
            extent_y = extent_y.max(i64::from(screen.y) + i64::from(screen.height));
        }

        // Flood-fill over the touches-or-overlaps graph; every confirmed
        // output must be reachable from the first one.
        let mut visited = vec![false; screens.len()];
        let mut frontier = vec![0usize];
        visited[0] = true;
        let mut reachable = 1usize;
        while let Some(current) = frontier.pop() {
            for (idx, screen) in screens.iter().enumerate() {
                if !visited[idx] && screens[current].touches(screen) {
                    visited[idx] = true;
                    reachable += 1;
                    frontier.push(idx);
                }
            }
        }
        if reachable != screens.len() {
            return Err(LayoutError::Gapped);
        }

        let space = GlobalSpace {
            origin_x: i32::try_from(origin_x).map_err(|_| LayoutError::SpaceOverflow)?,
            origin_y: i32::try_from(origin_y).map_err(|_| LayoutError::SpaceOverflow)?,
            extent_x: i32::try_from(extent_x).map_err(|_| LayoutError::SpaceOverflow)?,
            extent_y: i32::try_from(extent_y).map_err(|_| LayoutError::SpaceOverflow)?,
        };
        debug!(
            "[layout] pointer space ({}, {}) .. ({}, {}) across {} output(s)",
            space.origin_x,
            space.origin_y,
            space.extent_x,
            space.extent_y,
            screens.len()
        );
        self.space = Some(space);
        Ok(())
    }

    /// The current global pointer space, if any output is confirmed.
    pub fn space(&self) -> Option<&GlobalSpace> {
        self.space.as_ref()
    }

    /// Confirmed geometry of a slot.
    pub fn confirmed(&self, slot: usize) -> Option<&OutputGeometry> {
        self.confirmed.get(slot).and_then(|g| g.as_ref())
    }

    /// Lowest-indexed confirmed output.
    pub fn first_confirmed(&self) -> Option<(usize, &OutputGeometry)> {
        self.confirmed
            .iter()
            .enumerate()
            .find_map(|(idx, g)| g.as_ref().map(|g| (idx, g)))
    }

    /// Resolves a global point to an output-local coordinate.
    ///
    /// Returns `None` when the point lies in a void (inside the bounding
    /// box but on no confirmed output).
    pub fn abs_to_local(&self, x: i32, y: i32) -> Option<LocalCoord> {
        self.confirmed
            .iter()
            .enumerate()
            .find_map(|(idx, geometry)| {
                let geometry = geometry.as_ref()?;
                geometry.contains(x, y).then(|| LocalCoord {
                    output: idx,
                    x: x - geometry.x,
                    y: y - geometry.y,
                })
            })
    }

    /// Converts an output-local coordinate back to global space.
    pub fn local_to_abs(&self, x: i32, y: i32, slot: usize) -> Option<(i32, i32)> {
        let geometry = self.confirmed(slot)?;
        if x < 0 || y < 0 || x >= geometry.width || y >= geometry.height {
            return None;
        }
        Some((geometry.x + x, geometry.y + y))
    }
}

impl Default for OutputMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirm(map: &mut OutputMap, slot: usize, x: i32, y: i32, w: i32, h: i32) {
        map.stage_position(slot, x, y);
        map.stage_size(slot, w, h);
        assert!(map.promote(slot));
    }

    #[test]
    fn test_promote_rejects_unset_geometry() {
        let mut map = OutputMap::new();
        assert!(!map.promote(0));
        assert!(map.confirmed(0).is_none());
    }

    #[test]
    fn test_promote_accepts_origin_output() {
        // (0, 0) with a nonzero size is the common single-monitor case.
        let mut map = OutputMap::new();
        confirm(&mut map, 0, 0, 0, 1920, 1080);
        map.recalc().unwrap();
        let space = map.space().unwrap();
        assert_eq!((space.origin_x, space.origin_y), (0, 0));
        assert_eq!((space.extent_x, space.extent_y), (1920, 1080));
    }

    #[test]
    fn test_bounding_box_with_negative_origin() {
        let mut map = OutputMap::new();
        confirm(&mut map, 0, -100, 0, 100, 50);
        confirm(&mut map, 1, 0, 0, 50, 50);
        map.recalc().unwrap();
        let space = *map.space().unwrap();
        assert_eq!(
            space,
            GlobalSpace {
                origin_x: -100,
                origin_y: 0,
                extent_x: 50,
                extent_y: 50,
            }
        );
    }

    #[test]
    fn test_corner_touch_is_connected() {
        let mut map = OutputMap::new();
        confirm(&mut map, 0, 0, 0, 100, 100);
        confirm(&mut map, 1, 100, 100, 50, 50);
        assert!(map.recalc().is_ok());
    }

    #[test]
    fn test_gap_is_fatal() {
        let mut map = OutputMap::new();
        confirm(&mut map, 0, 0, 0, 100, 100);
        confirm(&mut map, 1, 150, 0, 100, 100);
        assert!(matches!(map.recalc(), Err(LayoutError::Gapped)));
    }

    #[test]
    fn test_gap_recovers_after_removal() {
        let mut map = OutputMap::new();
        confirm(&mut map, 0, 0, 0, 100, 100);
        confirm(&mut map, 1, 150, 0, 100, 100);
        assert!(map.recalc().is_err());
        map.remove(1);
        assert!(map.recalc().is_ok());
    }

    #[test]
    fn test_abs_to_local_in_void() {
        // Side-by-side screens of different heights leave a void below the
        // shorter one.
        let mut map = OutputMap::new();
        confirm(&mut map, 0, 0, 0, 1000, 1000);
        confirm(&mut map, 3, 1000, 0, 1000, 500);
        map.recalc().unwrap();

        assert_eq!(
            map.abs_to_local(1500, 100),
            Some(LocalCoord {
                output: 3,
                x: 500,
                y: 100
            })
        );
        assert!(map.abs_to_local(1500, 700).is_none());
    }

    #[test]
    fn test_local_abs_round_trip() {
        let mut map = OutputMap::new();
        confirm(&mut map, 0, 0, 0, 1000, 1000);
        confirm(&mut map, 1, 1000, 0, 800, 600);
        map.recalc().unwrap();

        for &(x, y, slot) in &[(0, 0, 0usize), (999, 999, 0), (0, 0, 1), (799, 599, 1)] {
            let (gx, gy) = map.local_to_abs(x, y, slot).unwrap();
            assert_eq!(
                map.abs_to_local(gx, gy),
                Some(LocalCoord { output: slot, x, y })
            );
        }
    }

    #[test]
    fn test_local_to_abs_out_of_range() {
        let mut map = OutputMap::new();
        confirm(&mut map, 0, 0, 0, 100, 100);
        map.recalc().unwrap();
        assert!(map.local_to_abs(100, 0, 0).is_none());
        assert!(map.local_to_abs(0, -1, 0).is_none());
        assert!(map.local_to_abs(0, 0, 1).is_none());
    }

    #[test]
    fn test_first_confirmed_skips_empty_slots() {
        let mut map = OutputMap::new();
        confirm(&mut map, 5, 0, 0, 100, 100);
        assert_eq!(map.first_confirmed().unwrap().0, 5);
    }

    #[test]
    fn test_space_cleared_when_last_output_leaves() {
        let mut map = OutputMap::new();
        confirm(&mut map, 0, 0, 0, 100, 100);
        map.recalc().unwrap();
        assert!(map.space().is_some());
        map.remove(0);
        map.recalc().unwrap();
        assert!(map.space().is_none());
    }
}
