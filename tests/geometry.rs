//! Multi-output geometry and void-glide scenarios.

use wayveil::cursor::{self, Point, VirtualCursor};
use wayveil::layout::{LocalCoord, OutputMap};

fn build(screens: &[(i32, i32, i32, i32)]) -> OutputMap {
    let mut outputs = OutputMap::new();
    for (slot, &(x, y, w, h)) in screens.iter().enumerate() {
        outputs.stage_position(slot, x, y);
        outputs.stage_size(slot, w, h);
        assert!(outputs.promote(slot));
    }
    outputs.recalc().unwrap();
    outputs
}

#[test]
fn transform_round_trip_over_every_output() {
    let outputs = build(&[(0, 0, 1920, 1080), (1920, 0, 1280, 1024), (-640, 0, 640, 480)]);
    for slot in 0..3 {
        let geometry = *outputs.confirmed(slot).unwrap();
        for (x, y) in [
            (0, 0),
            (geometry.width - 1, geometry.height - 1),
            (geometry.width / 2, geometry.height / 3),
        ] {
            let (gx, gy) = outputs.local_to_abs(x, y, slot).unwrap();
            assert_eq!(
                outputs.abs_to_local(gx, gy),
                Some(LocalCoord { output: slot, x, y })
            );
        }
    }
}

#[test]
fn one_pixel_corner_touch_counts_as_connected() {
    build(&[(0, 0, 100, 100), (100, 100, 100, 100)]);
}

#[test]
fn gapped_layout_is_rejected() {
    let mut outputs = OutputMap::new();
    outputs.stage_position(0, 0, 0);
    outputs.stage_size(0, 100, 100);
    assert!(outputs.promote(0));
    outputs.stage_position(1, 101, 0);
    outputs.stage_size(1, 100, 100);
    assert!(outputs.promote(1));
    assert!(outputs.recalc().is_err());
}

#[test]
fn void_glide_reaches_valid_target_across_ragged_edge() {
    // A at (0,0,1000,1000), B at (1000,500,1000,500). A motion from
    // (500,100) by (+600,+600) targets (1100,700), skirting the void at
    // y<500, x>=1000.
    let outputs = build(&[(0, 0, 1000, 1000), (1000, 500, 1000, 500)]);
    let mut cursor = VirtualCursor::new();
    cursor.rehome(Point::new(500, 100));

    let space = *outputs.space().unwrap();
    cursor.aim_relative(600.0, 600.0, &space);
    assert_eq!(cursor.point(), Point::new(1100, 700));

    let end = cursor::glide(&outputs, cursor.prev_point(), cursor.point()).unwrap();
    cursor.settle(end);

    // The target was valid in B, and the walked path stayed within the
    // union of the screens.
    assert_eq!(end, Point::new(1100, 700));
    let local = outputs.abs_to_local(end.x, end.y).unwrap();
    assert_eq!(local.output, 1);

    for pos in 0.. {
        let p = cursor::traverse_line(Point::new(500, 100), end, pos);
        assert!(
            outputs.abs_to_local(p.x, p.y).is_some(),
            "walk passed through a void at {p:?}"
        );
        if p == end {
            break;
        }
    }
}

#[test]
fn void_glide_slides_to_wall_when_target_is_unreachable() {
    let outputs = build(&[(0, 0, 1000, 1000), (1000, 500, 1000, 500)]);
    // Straight east into the void above B.
    let end = cursor::glide(&outputs, Point::new(500, 100), Point::new(1500, 100)).unwrap();
    assert_eq!(end, Point::new(999, 100));
}

#[test]
fn pointer_space_with_negative_origin() {
    let outputs = build(&[(-640, 0, 640, 480), (0, 0, 1920, 1080)]);
    let space = *outputs.space().unwrap();
    assert_eq!(space.origin_x, -640);
    assert_eq!(space.extent_x, 1920);

    // A walk across the seam at x=0 stays valid.
    let end = cursor::glide(&outputs, Point::new(-320, 240), Point::new(500, 240)).unwrap();
    assert_eq!(end, Point::new(500, 240));
}
