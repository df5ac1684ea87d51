//! Keyboard tests: ring-buffer semantics and the scancode-to-ASCII
//! pipeline behind `handle_scancode`/`getchar`.

use boxos::keyboard::{self, InputRing};

#[test]
fn ring_preserves_order() {
    let mut ring = InputRing::new();
    assert!(!ring.has_input());
    assert!(ring.push(b'x'));
    assert!(ring.push(b'y'));
    assert!(ring.has_input());
    assert_eq!(ring.pop(), Some(b'x'));
    assert_eq!(ring.pop(), Some(b'y'));
    assert_eq!(ring.pop(), None);
}

#[test]
fn full_ring_drops_input() {
    let mut ring = InputRing::new();
    // One slot always stays unused to distinguish full from empty.
    for i in 0..255 {
        assert!(ring.push(i as u8), "push {} should fit", i);
    }
    assert!(!ring.push(0xFF), "256th byte must be dropped");
    assert_eq!(ring.pop(), Some(0));
    assert!(ring.push(0xFF), "space freed by pop is reusable");
}

#[test]
fn clear_empties_the_ring() {
    let mut ring = InputRing::new();
    ring.push(b'a');
    ring.push(b'b');
    ring.clear();
    assert!(!ring.has_input());
    assert_eq!(ring.pop(), None);
}

#[test]
fn wraparound_keeps_fifo_order() {
    let mut ring = InputRing::new();
    // Drive the indices around the ring several times.
    for round in 0..1000u32 {
        assert!(ring.push((round % 251) as u8));
        assert_eq!(ring.pop(), Some((round % 251) as u8));
    }
    assert!(!ring.has_input());
}

/// The global pipeline shares state, so the scenario runs as one
/// sequential test: press a/b/c, drain, flush.
#[test]
fn scancode_pipeline_end_to_end() {
    keyboard::flush();

    // Press (and release) a, b, c.
    keyboard::handle_scancode(0x1E);
    keyboard::handle_scancode(0x9E);
    keyboard::handle_scancode(0x30);
    keyboard::handle_scancode(0xB0);
    keyboard::handle_scancode(0x2E);
    keyboard::handle_scancode(0xAE);

    assert!(keyboard::has_input());
    assert_eq!(keyboard::getchar(), b'a');
    assert_eq!(keyboard::getchar(), b'b');
    assert_eq!(keyboard::getchar(), b'c');
    assert_eq!(keyboard::getchar(), 0, "drained buffer reads as NUL");

    // Shifted input produces uppercase; releasing shift restores it.
    keyboard::handle_scancode(0x2A); // left shift down
    keyboard::handle_scancode(0x1E);
    keyboard::handle_scancode(0xAA); // left shift up
    keyboard::handle_scancode(0x1E);
    assert_eq!(keyboard::getchar(), b'A');
    assert_eq!(keyboard::getchar(), b'a');

    // Digits shift into symbols.
    keyboard::handle_scancode(0x36); // right shift down
    keyboard::handle_scancode(0x02);
    keyboard::handle_scancode(0xB6); // right shift up
    assert_eq!(keyboard::getchar(), b'!');

    // Extended scancodes (arrow keys etc.) produce no line input.
    keyboard::handle_scancode(0xE0);
    keyboard::handle_scancode(0x48);
    assert!(!keyboard::has_input());

    // Enter and backspace come through as control bytes.
    keyboard::handle_scancode(0x1C);
    keyboard::handle_scancode(0x0E);
    assert_eq!(keyboard::getchar(), b'\n');
    assert_eq!(keyboard::getchar(), 0x08);

    // Flush discards pending input.
    keyboard::handle_scancode(0x1E);
    keyboard::flush();
    assert!(!keyboard::has_input());
    assert_eq!(keyboard::getchar(), 0);
}
