//! Symbol tables: the image's own dynamic symbols and the host-supplied
//! resolution tables imports are bound against.
use crate::{
    Result, arch,
    dynamic::ElfDynamic,
    elf::{ElfSymbol, SYM_SIZE, Sym, read_struct},
    format_error,
    segment::ImageSegments,
};
use alloc::{string::String, sync::Arc, vec::Vec};
use core::{
    fmt::Debug,
    hash::{Hash, Hasher},
    marker::PhantomData,
    ops,
};
use elf::abi::{STT_FILE, STT_FUNC};
use foldhash::{SharedSeed, fast::FoldHasher};
use hashbrown::HashTable;

const HASHER: FoldHasher<'static> = FoldHasher::with_seed(0, SharedSeed::global_fixed());

#[inline]
fn hash_name(name: &str) -> u64 {
    let mut hasher = HASHER.clone();
    name.as_bytes().hash(&mut hasher);
    hasher.finish()
}

/// The dynamic symbol table of an image, copied out of the mapping at load.
pub(crate) struct SymbolTable {
    symbols: Vec<ElfSymbol>,
    strtab: Vec<u8>,
    /// `(start, len)` of every symbol name inside `strtab`.
    names: Vec<(usize, usize)>,
    /// Exported symbols by name.
    exports: HashTable<usize>,
}

impl SymbolTable {
    pub(crate) fn new(segments: &ImageSegments, dynamic: &ElfDynamic) -> Result<Self> {
        let strtab = segments
            .bytes(dynamic.strtab.vaddr, dynamic.strtab.size)
            .ok_or_else(|| format_error("string table out of bounds"))?
            .to_vec();
        let raw = segments
            .bytes(dynamic.symtab, dynamic.sym_count * SYM_SIZE)
            .ok_or_else(|| format_error("symbol table out of bounds"))?;

        let mut symbols = Vec::with_capacity(dynamic.sym_count);
        let mut names = Vec::with_capacity(dynamic.sym_count);
        for idx in 0..dynamic.sym_count {
            let sym: Sym = read_struct(raw, idx * SYM_SIZE)
                .ok_or_else(|| format_error("symbol table out of bounds"))?;
            let symbol = ElfSymbol::new(sym);
            names.push(name_span(&strtab, symbol.st_name())?);
            symbols.push(symbol);
        }

        let mut table = SymbolTable {
            symbols,
            strtab,
            names,
            exports: HashTable::new(),
        };
        let mut exports = HashTable::with_capacity(table.symbols.len());
        for (idx, symbol) in table.symbols.iter().enumerate() {
            if !symbol.is_export() || symbol.st_type() == STT_FILE {
                continue;
            }
            let name = table.name(idx);
            if name.is_empty() {
                continue;
            }
            let hash = hash_name(name);
            // The first definition of a name wins.
            if exports.find(hash, |&other| table.name(other) == name).is_none() {
                exports.insert_unique(hash, idx, |&other| hash_name(table.name(other)));
            }
        }
        table.exports = exports;
        Ok(table)
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.symbols.len()
    }

    #[inline]
    pub(crate) fn symbol(&self, idx: usize) -> Option<&ElfSymbol> {
        self.symbols.get(idx)
    }

    /// Name of symbol `idx`; empty for out-of-range indices.
    #[inline]
    pub(crate) fn name(&self, idx: usize) -> &str {
        match self.names.get(idx) {
            Some(&(start, len)) => {
                // Spans were validated as UTF-8 when the table was built.
                unsafe { core::str::from_utf8_unchecked(&self.strtab[start..start + len]) }
            }
            None => "",
        }
    }

    /// A NUL-terminated string at `offset` in the string table.
    pub(crate) fn str_at(&self, offset: usize) -> Option<&str> {
        let (start, len) = name_span(&self.strtab, offset).ok()?;
        core::str::from_utf8(&self.strtab[start..start + len]).ok()
    }

    /// Looks up an exported symbol by name.
    pub(crate) fn lookup_export(&self, name: &str) -> Option<&ElfSymbol> {
        self.exports
            .find(hash_name(name), |&idx| self.name(idx) == name)
            .map(|&idx| &self.symbols[idx])
    }

    #[cfg(feature = "log")]
    #[inline]
    pub(crate) fn export_count(&self) -> usize {
        self.exports.len()
    }

    /// Size of the function whose code starts at `vaddr`, when the symbol
    /// table records one.
    pub(crate) fn function_size(&self, vaddr: usize) -> Option<usize> {
        self.symbols
            .iter()
            .filter(|sym| sym.st_type() == STT_FUNC && !sym.is_undef() && sym.st_size() != 0)
            .find(|sym| arch::code_address(sym.st_value()) == vaddr)
            .map(ElfSymbol::st_size)
    }
}

fn name_span(strtab: &[u8], offset: usize) -> Result<(usize, usize)> {
    let tail = strtab
        .get(offset..)
        .ok_or_else(|| format_error("symbol name out of string table"))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| format_error("unterminated symbol name"))?;
    core::str::from_utf8(&tail[..len]).map_err(|_| format_error("symbol name is not UTF-8"))?;
    Ok((offset, len))
}

/// A trait for looking up symbols by name.
///
/// The resolver asks the lookup for every import of an image. Closures,
/// [`SymbolMap`], other images and chains built with [`SymbolLookup::or`] all
/// implement it.
///
/// # Examples
///
/// ```rust
/// use so_loader::SymbolLookup;
///
/// extern "C" fn host_abort() {}
///
/// let lookup = |name: &str| -> Option<*const ()> {
///     (name == "abort").then_some(host_abort as *const ())
/// };
/// assert!(lookup.lookup("abort").is_some());
/// assert!(lookup.lookup("exit").is_none());
/// ```
pub trait SymbolLookup {
    /// Finds the address of a symbol by its name.
    ///
    /// # Returns
    /// * `Some(ptr)` - The symbol's address if found.
    /// * `None` - Symbol not found.
    fn lookup(&self, name: &str) -> Option<*const ()>;

    /// Chains two lookups: names missing from `self` are looked up in `other`.
    fn or<'a, L>(&'a self, other: &'a L) -> Or<'a, Self, L>
    where
        L: SymbolLookup + ?Sized,
    {
        Or {
            first: self,
            second: other,
        }
    }
}

impl<F: ?Sized> SymbolLookup for F
where
    F: Fn(&str) -> Option<*const ()>,
{
    fn lookup(&self, name: &str) -> Option<*const ()> {
        self(name)
    }
}

impl<S: SymbolLookup + ?Sized> SymbolLookup for Arc<S> {
    fn lookup(&self, name: &str) -> Option<*const ()> {
        (**self).lookup(name)
    }
}

impl SymbolLookup for () {
    fn lookup(&self, _name: &str) -> Option<*const ()> {
        None
    }
}

/// Two lookups tried in order. Built by [`SymbolLookup::or`].
pub struct Or<'a, A: ?Sized, B: ?Sized> {
    first: &'a A,
    second: &'a B,
}

impl<A, B> SymbolLookup for Or<'_, A, B>
where
    A: SymbolLookup + ?Sized,
    B: SymbolLookup + ?Sized,
{
    fn lookup(&self, name: &str) -> Option<*const ()> {
        self.first
            .lookup(name)
            .or_else(|| self.second.lookup(name))
    }
}

/// An ordered `{name → address}` table of host functions and data objects.
///
/// Lookups are hashed; iteration follows insertion order. Inserting a name that
/// is already present replaces its address in place.
#[derive(Default)]
pub struct SymbolMap {
    entries: Vec<(String, usize)>,
    index: HashTable<usize>,
}

impl SymbolMap {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty table with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        SymbolMap {
            entries: Vec::with_capacity(capacity),
            index: HashTable::with_capacity(capacity),
        }
    }

    /// Adds `name`, returning the address it replaced.
    pub fn insert(&mut self, name: impl Into<String>, addr: *const ()) -> Option<*const ()> {
        let name = name.into();
        let hash = hash_name(&name);
        let entries = &mut self.entries;
        if let Some(&idx) = self.index.find(hash, |&idx| entries[idx].0 == name) {
            let old = core::mem::replace(&mut entries[idx].1, addr as usize);
            return Some(old as *const ());
        }
        let idx = entries.len();
        entries.push((name, addr as usize));
        self.index
            .insert_unique(hash, idx, |&idx| hash_name(&entries[idx].0));
        None
    }

    /// Returns the address registered for `name`.
    pub fn get(&self, name: &str) -> Option<*const ()> {
        self.index
            .find(hash_name(name), |&idx| self.entries[idx].0 == name)
            .map(|&idx| self.entries[idx].1 as *const ())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, *const ())> {
        self.entries
            .iter()
            .map(|(name, addr)| (name.as_str(), *addr as *const ()))
    }
}

impl Debug for SymbolMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(name, addr)| (name, addr)))
            .finish()
    }
}

impl SymbolLookup for SymbolMap {
    #[inline]
    fn lookup(&self, name: &str) -> Option<*const ()> {
        self.get(name)
    }
}

impl<S: Into<String>> FromIterator<(S, *const ())> for SymbolMap {
    fn from_iter<I: IntoIterator<Item = (S, *const ())>>(iter: I) -> Self {
        let mut map = SymbolMap::new();
        map.extend(iter);
        map
    }
}

impl<S: Into<String>> Extend<(S, *const ())> for SymbolMap {
    fn extend<I: IntoIterator<Item = (S, *const ())>>(&mut self, iter: I) {
        for (name, addr) in iter {
            self.insert(name, addr);
        }
    }
}

/// Typed symbol in a loaded image, bound to the image's lifetime.
pub struct Symbol<'lib, T: 'lib> {
    ptr: *mut (),
    pd: PhantomData<&'lib T>,
}

impl<'lib, T> Symbol<'lib, T> {
    #[inline]
    pub(crate) fn new(ptr: *mut ()) -> Self {
        Symbol {
            ptr,
            pd: PhantomData,
        }
    }

    pub fn into_raw(self) -> *const () {
        self.ptr
    }
}

impl<'lib, T> ops::Deref for Symbol<'lib, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*(&self.ptr as *const *mut _ as *const T) }
    }
}

unsafe impl<T: Send> Send for Symbol<'_, T> {}
unsafe impl<T: Sync> Sync for Symbol<'_, T> {}
