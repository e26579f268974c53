mod common;

use common::*;
use gen_image::Reloc;
use so_loader::{Error, ImageState, SymbolLookup, SymbolMap, symbol_map};

#[test]
fn imports_are_bound() {
    init_logger();
    let generated = build(fixture());
    let mut image = load(&generated);
    image.relocate().unwrap();
    image.resolve(&host_table(), false).unwrap();
    assert_eq!(image.state(), ImageState::Resolved);

    let host_value = &HOST_VALUE as *const u64 as usize;
    assert_eq!(
        read_usize(got(&image, &generated, "host_add")),
        host_add as usize
    );
    assert_eq!(read_usize(got(&image, &generated, "host_value")), host_value);
    assert_eq!(
        read_usize(addr(&image, &generated, "value_ptr")),
        host_value
    );
    // the weak import is tolerated and left null
    assert_eq!(image.unresolved(), ["optional_hook"]);
    assert_eq!(read_usize(got(&image, &generated, "optional_hook")), 0);
}

#[test]
fn missing_import_fails_without_writing() {
    init_logger();
    let generated = build(fixture().import("undefined_fn"));
    let mut image = load(&generated);
    image.relocate().unwrap();

    match image.resolve(&host_table(), false) {
        Err(Error::UnresolvedSymbol { name }) => assert_eq!(name, "undefined_fn"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(image.state(), ImageState::Relocated);
    assert_eq!(read_usize(got(&image, &generated, "host_add")), 0);

    // the image can be resolved again with missing imports allowed
    image.resolve(&host_table(), true).unwrap();
    assert_eq!(image.unresolved(), ["optional_hook", "undefined_fn"]);
    assert_eq!(read_usize(got(&image, &generated, "undefined_fn")), 0);
    assert_eq!(
        read_usize(got(&image, &generated, "host_add")),
        host_add as usize
    );
}

#[test]
fn resolving_twice_is_a_state_error() {
    init_logger();
    let generated = build(fixture());
    let mut image = load(&generated);
    image.relocate().unwrap();
    image.resolve(&host_table(), false).unwrap();
    assert!(matches!(
        image.resolve(&host_table(), false),
        Err(Error::State { .. })
    ));
}

#[test]
fn closures_and_chained_tables() {
    init_logger();
    let generated = build(fixture());
    let mut image = load(&generated);
    image.relocate().unwrap();

    let functions: SymbolMap = symbol_map! { "host_add" => host_add };
    let data = |name: &str| -> Option<*const ()> {
        (name == "host_value").then_some(&HOST_VALUE as *const u64 as *const ())
    };
    image.resolve(&functions.or(&data), false).unwrap();
    assert_eq!(
        read_usize(got(&image, &generated, "host_value")),
        &HOST_VALUE as *const u64 as usize
    );
}

#[test]
fn images_resolve_against_each_other() {
    init_logger();
    let provider_bytes = build(fixture());
    let mut provider = load(&provider_bytes);
    provider.relocate().unwrap();
    provider.resolve(&host_table(), false).unwrap();

    let consumer_bytes = build(
        gen_image::ImageBuilder::new(arch())
            .import("answer")
            .import_data("counter")
            .pointer("answer_ref", Reloc::Absolute("answer".into(), 0))
            .pointer("counter_ref", Reloc::Absolute("counter".into(), 8)),
    );
    let mut consumer = load(&consumer_bytes);
    consumer.relocate().unwrap();
    consumer.resolve(&host_table().or(&provider), false).unwrap();

    assert_eq!(
        read_usize(addr(&consumer, &consumer_bytes, "answer_ref")),
        provider.find_symbol("answer").unwrap()
    );
    assert_eq!(
        read_usize(addr(&consumer, &consumer_bytes, "counter_ref")),
        provider.find_symbol("counter").unwrap() + 8
    );
    assert_eq!(
        read_usize(got(&consumer, &consumer_bytes, "counter")),
        provider.find_symbol("counter").unwrap()
    );
}

#[cfg(target_arch = "x86_64")]
#[test]
fn resolved_code_runs() {
    init_logger();
    let generated = build(fixture());
    let image = ready(&generated);

    let answer = unsafe { image.get::<extern "C" fn() -> i32>("answer").unwrap() };
    assert_eq!(answer(), 42);
    let call_host = unsafe { image.get::<extern "C" fn(i32, i32) -> i32>("call_host").unwrap() };
    assert_eq!(call_host(2, 3), 5);
    let compute = unsafe { image.get::<extern "C" fn(i32) -> i32>("compute").unwrap() };
    assert_eq!(compute(5), 13);
}
