//! End-to-end scheduling scenarios across the queue, cursor, and layout.

use wayveil::cursor::{self, VirtualCursor};
use wayveil::layout::OutputMap;
use wayveil::scheduler::{DelayQueue, PacketBody};
use wayveil::util::Entropy;

fn two_screens_side_by_side() -> OutputMap {
    let mut outputs = OutputMap::new();
    for (slot, x) in [(0usize, 0), (1usize, 1000)] {
        outputs.stage_position(slot, x, 0);
        outputs.stage_size(slot, 1000, 1000);
        assert!(outputs.promote(slot));
    }
    outputs.recalc().unwrap();
    outputs
}

#[test]
fn burst_of_events_releases_in_order_within_bounds() {
    let mut entropy = Entropy::open().unwrap();
    let mut queue: DelayQueue<u8> = DelayQueue::new(100);

    let mut schedules = Vec::new();
    for now in [0i64, 1, 2, 3, 4] {
        let sched = queue
            .enqueue(PacketBody::Device(0), now, &mut entropy)
            .unwrap();
        assert!(sched >= now, "delays are strictly additive");
        assert!(sched <= now + 100);
        schedules.push(sched);
    }
    assert!(schedules.windows(2).all(|w| w[0] <= w[1]));

    // Releasing drains in the same order the packets arrived.
    let mut released = 0;
    let horizon = schedules.last().copied().unwrap();
    for now in 0..=horizon {
        while let Some(packet) = queue.pop_due(now) {
            assert!(packet.sched_time <= now);
            assert_eq!(packet.sched_time, schedules[released]);
            released += 1;
        }
    }
    assert_eq!(released, schedules.len());
}

#[test]
fn zero_delay_reproduces_enqueue_timestamps() {
    let mut entropy = Entropy::open().unwrap();
    let mut queue: DelayQueue<u8> = DelayQueue::new(0);

    for now in [5i64, 6, 9] {
        let sched = queue
            .enqueue(PacketBody::Device(1), now, &mut entropy)
            .unwrap();
        assert_eq!(sched, now);
    }
}

#[test]
fn rapid_motion_coalesces_to_one_pending_move() {
    let outputs = two_screens_side_by_side();
    let mut entropy = Entropy::open().unwrap();
    let mut queue: DelayQueue<u8> = DelayQueue::new(100);
    let mut cursor = VirtualCursor::new();

    // Three absolute motion samples inside one millisecond.
    for (x, y) in [(10.0, 10.0), (20.0, 20.0), (30.0, 30.0)] {
        cursor.aim_absolute(x, y);
        let end = cursor::glide(&outputs, cursor.prev_point(), cursor.point()).unwrap();
        cursor.settle(end);
        if !queue.coalesce_pointer_move(end.x, end.y) {
            queue
                .enqueue(PacketBody::PointerMove { x: end.x, y: end.y }, 0, &mut entropy)
                .unwrap();
        }
    }

    assert_eq!(queue.len(), 1, "steady state holds exactly one move");
    let tail = queue.iter().last().unwrap();
    assert_eq!(tail.body, PacketBody::PointerMove { x: 30, y: 30 });
}

#[test]
fn moves_separated_by_device_events_do_not_fuse() {
    let mut entropy = Entropy::open().unwrap();
    let mut queue: DelayQueue<u8> = DelayQueue::new(0);

    queue
        .enqueue(PacketBody::PointerMove { x: 1, y: 1 }, 0, &mut entropy)
        .unwrap();
    queue.enqueue(PacketBody::Device(9), 1, &mut entropy).unwrap();
    // The tail is a device event now, so this move must append.
    assert!(!queue.coalesce_pointer_move(2, 2));
    queue
        .enqueue(PacketBody::PointerMove { x: 2, y: 2 }, 2, &mut entropy)
        .unwrap();

    let bodies: Vec<_> = queue.iter().map(|p| p.body.clone()).collect();
    assert_eq!(
        bodies,
        vec![
            PacketBody::PointerMove { x: 1, y: 1 },
            PacketBody::Device(9),
            PacketBody::PointerMove { x: 2, y: 2 },
        ]
    );
}

#[test]
fn detached_device_packets_never_release() {
    let mut entropy = Entropy::open().unwrap();
    let mut queue: DelayQueue<u8> = DelayQueue::new(0);

    queue.enqueue(PacketBody::Device(1), 0, &mut entropy).unwrap();
    queue.enqueue(PacketBody::Device(2), 1, &mut entropy).unwrap();
    queue.enqueue(PacketBody::Device(1), 2, &mut entropy).unwrap();
    assert_eq!(queue.drain_device(|d| *d == 1), 2);

    let mut survivors = Vec::new();
    while let Some(packet) = queue.pop_due(i64::MAX - 1) {
        survivors.push(packet.body);
    }
    assert_eq!(survivors, vec![PacketBody::Device(2)]);
}

#[test]
fn queue_regains_full_randomness_after_drain() {
    let mut entropy = Entropy::open().unwrap();
    let mut queue: DelayQueue<u8> = DelayQueue::new(50);

    let sched = queue
        .enqueue(PacketBody::Device(0), 0, &mut entropy)
        .unwrap();
    while queue.pop_due(sched).is_none() {}

    // Long after the backlog cleared, the lower bound is zero again.
    assert_eq!(queue.delay_bounds(sched + 1000), (0, 50));
}
