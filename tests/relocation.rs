mod common;

use common::*;
use gen_image::Reloc;
use so_loader::{Error, ImageState};

#[test]
fn internal_relocations_rela() {
    internal_relocations(false);
}

#[test]
fn internal_relocations_rel() {
    internal_relocations(true);
}

fn internal_relocations(rel: bool) {
    init_logger();
    let generated = build(fixture().use_rel(rel));
    let mut image = load(&generated);
    image.relocate().unwrap();
    assert_eq!(image.state(), ImageState::Relocated);

    let answer = addr(&image, &generated, "answer");
    let counter = addr(&image, &generated, "counter");
    assert_eq!(read_usize(addr(&image, &generated, "answer_ptr")), answer);
    assert_eq!(read_usize(addr(&image, &generated, "answer_abs")), answer);
    assert_eq!(read_usize(addr(&image, &generated, "counter_plus")), counter + 4);

    let place = addr(&image, &generated, "counter_rel32");
    let offset = read_i32(place) as isize;
    assert_eq!(place.wrapping_add_signed(offset), counter);

    // imports wait for resolve
    assert_eq!(read_usize(addr(&image, &generated, "value_ptr")), 0);
    assert_eq!(read_usize(got(&image, &generated, "host_add")), 0);
}

#[test]
fn two_bases_hold_their_own_addresses() {
    init_logger();
    let generated = build(fixture());
    let mut first = load(&generated);
    let mut second = load(&generated);
    assert_ne!(first.base(), second.base());
    first.relocate().unwrap();
    second.relocate().unwrap();

    let answer = generated.layout.symbol("answer") as usize;
    for image in [&first, &second] {
        assert_eq!(
            read_usize(addr(image, &generated, "answer_ptr")),
            image.base() + answer
        );
        assert_eq!(
            read_usize(addr(image, &generated, "answer_abs")),
            image.base() + answer
        );
    }
}

#[test]
fn relocating_twice_is_a_state_error() {
    init_logger();
    let generated = build(fixture());
    let mut image = load(&generated);
    image.relocate().unwrap();
    let err = image.relocate().unwrap_err();
    assert!(matches!(err, Error::State { .. }), "{err}");
    assert_eq!(image.state(), ImageState::Relocated);
}

#[test]
fn out_of_order_steps_are_state_errors() {
    init_logger();
    let generated = build(fixture());
    let mut image = load(&generated);
    assert!(matches!(
        image.resolve(&host_table(), false),
        Err(Error::State { .. })
    ));
    assert!(matches!(image.finalize(), Err(Error::State { .. })));
    assert!(matches!(
        unsafe { image.initialize() },
        Err(Error::State { .. })
    ));
    assert_eq!(image.state(), ImageState::Loaded);
}

#[test]
fn unsupported_relocation_writes_nothing() {
    init_logger();
    let generated = build(fixture().pointer("copied", Reloc::Raw(UNSUPPORTED_RELOC)));
    let mut image = load(&generated);
    let err = image.relocate().unwrap_err();
    assert!(matches!(err, Error::Relocation { .. }), "{err}");
    assert_eq!(image.state(), ImageState::Loaded);
    // planned writes ahead of the bad record were not committed
    assert_eq!(read_usize(addr(&image, &generated, "answer_ptr")), 0);
    // a retry fails the same way instead of reporting a state error
    assert!(matches!(image.relocate(), Err(Error::Relocation { .. })));
}
