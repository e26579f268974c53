use criterion::{Criterion, criterion_group, criterion_main};
use gen_image::{Arch, ImageBuilder, Reloc};
use so_loader::{Loader, SymbolMap, symbol_map};
use std::hint::black_box;

extern "C" fn host_add(a: i32, b: i32) -> i32 {
    a + b
}

fn fixture() -> Vec<u8> {
    let mut builder = ImageBuilder::new(Arch::host().unwrap())
        .import("host_add")
        .function("answer", &[0xc3; 16]);
    for idx in 0..256 {
        builder = builder.pointer(format!("ptr_{idx}"), Reloc::Relative("answer".into()));
    }
    builder.build().unwrap().bytes
}

fn table() -> SymbolMap {
    symbol_map! { "host_add" => host_add }
}

fn load_benchmark(c: &mut Criterion) {
    let bytes = fixture();
    let table = table();
    c.bench_function("so_loader:load", |b| {
        b.iter(|| {
            let mut image = Loader::new().load("bench.so", &bytes, None).unwrap();
            image.relocate().unwrap();
            image.resolve(&table, false).unwrap();
            image.finalize().unwrap();
            image
        });
    });
}

fn get_symbol_benchmark(c: &mut Criterion) {
    let bytes = fixture();
    let image = Loader::new().load("bench.so", &bytes, None).unwrap();
    c.bench_function("so_loader:find_symbol", |b| {
        b.iter(|| image.find_symbol(black_box("ptr_200")).unwrap())
    });
    let table = table();
    c.bench_function("symbol_map:get", |b| {
        b.iter(|| table.get(black_box("host_add")).unwrap())
    });
}

criterion_group!(benches, load_benchmark, get_symbol_benchmark);
criterion_main!(benches);
