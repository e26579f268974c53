/// Builds a [`SymbolMap`](crate::SymbolMap) from `name => address` pairs.
///
/// Every value is cast with `as *const ()`, so function items, function
/// pointers and raw pointers to data all work.
///
/// # Example
/// ```
/// use so_loader::{SymbolLookup, symbol_map};
///
/// extern "C" fn host_abort() {}
/// static ANSWER: i32 = 42;
///
/// let table = symbol_map! {
///     "abort" => host_abort,
///     "answer" => &ANSWER as *const i32,
/// };
/// assert_eq!(table.len(), 2);
/// assert!(table.lookup("abort").is_some());
/// ```
#[macro_export]
macro_rules! symbol_map {
    () => {
        $crate::SymbolMap::new()
    };
    ($($name:expr => $addr:expr),+ $(,)?) => {{
        let mut map = $crate::SymbolMap::new();
        $(
            map.insert($name, $addr as *const ());
        )+
        map
    }};
}

/// Load an image from memory
/// # Example
/// ```no_run
/// # use so_loader::load_image;
/// # let bytes: [u8; 0] = [];
/// // anywhere
/// let image = load_image!("liba.so", &bytes);
/// // at a fixed base
/// let image = load_image!("liba.so", &bytes, 0x4000_0000);
/// ```
#[macro_export]
macro_rules! load_image {
    ($name:expr, $bytes:expr) => {
        $crate::Loader::new().load($name, $bytes, None)
    };
    ($name:expr, $bytes:expr, $base:expr) => {
        $crate::Loader::new().load($name, $bytes, Some($base))
    };
}
