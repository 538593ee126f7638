// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Byte-ring invariants: conservation of space, contiguous bounds, and
// wraparound behaviour of the index moves.

use libcmtspeech::ring::RingBuffer;

fn check_invariants(ring: &RingBuffer) {
    // One octet is reserved: readable + writable space is size - 1.
    assert_eq!(
        ring.avail_for_read() + ring.avail_for_write() + 1,
        ring.size()
    );
    assert!(ring.cavail_for_read() <= ring.avail_for_read());
    assert!(ring.cavail_for_write() <= ring.avail_for_write());
}

#[test]
fn fresh_ring_is_empty() {
    let ring = RingBuffer::new(128);
    assert_eq!(ring.avail_for_read(), 0);
    assert_eq!(ring.avail_for_write(), 127);
    assert_eq!(ring.cavail_for_write(), 127);
    check_invariants(&ring);
}

#[test]
fn fill_to_capacity() {
    let mut ring = RingBuffer::new(16);
    ring.move_write(15);
    assert_eq!(ring.avail_for_read(), 15);
    assert_eq!(ring.avail_for_write(), 0);
    check_invariants(&ring);
}

#[test]
fn conservation_over_moves() {
    // Non-power-of-two size on purpose.
    let mut ring = RingBuffer::new(100);
    let steps = [7usize, 13, 1, 25, 3, 17, 9];

    let mut queued = 0usize;
    for round in 0..50 {
        let n = steps[round % steps.len()];
        if ring.avail_for_write() >= n {
            ring.move_write(n);
            queued += n;
        }
        check_invariants(&ring);

        let m = steps[(round + 3) % steps.len()];
        if ring.avail_for_read() >= m {
            ring.move_read(m);
            queued -= m;
        }
        assert_eq!(ring.avail_for_read(), queued);
        check_invariants(&ring);
    }
}

#[test]
fn contiguous_read_stops_at_wrap() {
    let mut ring = RingBuffer::new(16);
    // Move both indices near the end, then wrap the write index.
    ring.move_write(14);
    ring.move_read(12);
    ring.move_write(4); // write_idx wraps to 2
    assert_eq!(ring.avail_for_read(), 6);
    assert_eq!(ring.cavail_for_read(), 4); // up to the end of the buffer
    check_invariants(&ring);
}

#[test]
fn contiguous_write_stops_at_wrap() {
    let mut ring = RingBuffer::new(16);
    ring.move_write(10);
    ring.move_read(5);
    // Readable 5, writable 10, but only 6 contiguous before the end.
    assert_eq!(ring.avail_for_write(), 10);
    assert_eq!(ring.cavail_for_write(), 6);
    check_invariants(&ring);
}

#[test]
fn write_up_to_sentinel_when_read_at_zero() {
    let mut ring = RingBuffer::new(16);
    ring.move_write(8);
    // read_idx == 0: contiguous write must leave the sentinel octet free.
    assert_eq!(ring.cavail_for_write(), 7);
    check_invariants(&ring);
}

#[test]
fn reset_rewinds_indices() {
    let mut ring = RingBuffer::new(32);
    ring.move_write(20);
    ring.move_read(6);
    ring.reset();
    assert_eq!(ring.read_idx(), 0);
    assert_eq!(ring.write_idx(), 0);
    assert_eq!(ring.avail_for_read(), 0);
    check_invariants(&ring);
}

#[test]
fn data_access_follows_indices() {
    let mut ring = RingBuffer::new(8);
    let wi = ring.write_idx();
    ring.data_mut()[wi..wi + 3].copy_from_slice(b"abc");
    ring.move_write(3);

    let ri = ring.read_idx();
    assert_eq!(&ring.data()[ri..ri + 3], b"abc");
    ring.move_read(3);
    assert_eq!(ring.avail_for_read(), 0);
}
