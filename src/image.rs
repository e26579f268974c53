//! A loaded image and its load pipeline.
use crate::{
    Result,
    arch::{self, PROLOGUE_WINDOW},
    dynamic::ElfDynamic,
    hook::{HookHandle, HookInstaller},
    hook_error,
    mmap::{DefaultMmap, Mmap, ProtFlags},
    relocation::{self, PendingImport},
    segment::{ImageSegments, Segment, page_down, page_up, plan_protections},
    state_error,
    symbol::{Symbol, SymbolLookup, SymbolTable},
};
use alloc::{format, string::String, vec::Vec};
use core::fmt::Debug;
use delegate::delegate;
use elf::abi::SHN_ABS;

/// Where an image is in its load pipeline.
///
/// Transitions only move forward, except that installing a hook on a
/// finalized image moves it back to [`ImageState::Hooked`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageState {
    /// Segments are copied, nothing is relocated yet.
    Loaded,
    /// Internal relocations are applied, imports are pending.
    Relocated,
    /// Every import is bound or tolerated.
    Resolved,
    /// At least one hook was installed since the last finalize.
    Hooked,
    /// Caches are flushed and page protections applied.
    Finalized,
}

/// Everything the loader hands over to a new image.
pub(crate) struct ImageParts<M: Mmap> {
    pub(crate) name: String,
    pub(crate) segments: ImageSegments,
    pub(crate) segment_list: Vec<Segment>,
    pub(crate) relro: Option<(usize, usize)>,
    pub(crate) dynamic: ElfDynamic,
    pub(crate) symtab: SymbolTable,
    pub(crate) entry: Option<usize>,
    pub(crate) needed_libs: Vec<String>,
    pub(crate) soname: Option<String>,
    pub(crate) protect: bool,
    pub(crate) hooks: HookInstaller<M>,
}

/// A shared object mapped into the current process.
///
/// Produced by [`Loader::load`](crate::Loader::load). Before any of its code
/// runs it must go through [`relocate`](Image::relocate),
/// [`resolve`](Image::resolve) and [`finalize`](Image::finalize); hooks may be
/// installed any time after resolution. Dropping the image runs its
/// finalizers (if it was initialized) and releases the mapping along with
/// every trampoline its hooks use.
pub struct Image<M: Mmap = DefaultMmap> {
    name: String,
    segment_list: Vec<Segment>,
    relro: Option<(usize, usize)>,
    dynamic: ElfDynamic,
    symtab: SymbolTable,
    entry: Option<usize>,
    needed_libs: Vec<String>,
    soname: Option<String>,
    protect: bool,
    state: ImageState,
    initialized: bool,
    pending: Vec<PendingImport>,
    unresolved: Vec<String>,
    hook_list: Vec<HookHandle>,
    hooks: HookInstaller<M>,
    // Dropped last: finalizers and trampolines point into the mapping.
    segments: ImageSegments,
}

// The raw mapping is only mutated through `&mut self`.
unsafe impl<M: Mmap> Send for Image<M> {}
unsafe impl<M: Mmap> Sync for Image<M> {}

impl<M: Mmap> Debug for Image<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.name)
            .field("base", &format_args!("0x{:x}", self.base()))
            .field("state", &self.state)
            .field("needed_libs", &self.needed_libs)
            .finish()
    }
}

impl<M: Mmap> Image<M> {
    pub(crate) fn from_parts(parts: ImageParts<M>) -> Self {
        Image {
            name: parts.name,
            segment_list: parts.segment_list,
            relro: parts.relro,
            dynamic: parts.dynamic,
            symtab: parts.symtab,
            entry: parts.entry,
            needed_libs: parts.needed_libs,
            soname: parts.soname,
            protect: parts.protect,
            state: ImageState::Loaded,
            initialized: false,
            pending: Vec::new(),
            unresolved: Vec::new(),
            hook_list: Vec::new(),
            hooks: parts.hooks,
            segments: parts.segments,
        }
    }

    delegate! {
        to self.segments {
            /// Gets the base address of the image.
            pub fn base(&self) -> usize;
            /// Gets the number of bytes mapped for the image.
            pub fn mapped_len(&self) -> usize;
            /// Returns true if `addr` lies inside the image's mapping.
            pub fn contains(&self, addr: usize) -> bool;
        }
    }

    /// Gets the name the image was loaded under.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the `PT_LOAD` segments, in program header order.
    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segment_list
    }

    /// Gets the address of the entry point, if the image has one.
    #[inline]
    pub fn entry(&self) -> Option<usize> {
        self.entry.map(|vaddr| self.base().wrapping_add(vaddr))
    }

    /// Gets the names in `DT_NEEDED`.
    #[inline]
    pub fn needed_libs(&self) -> &[String] {
        &self.needed_libs
    }

    #[inline]
    pub fn soname(&self) -> Option<&str> {
        self.soname.as_deref()
    }

    #[inline]
    pub fn state(&self) -> ImageState {
        self.state
    }

    /// Imports left unbound by [`Image::resolve`], in symbol table order.
    #[inline]
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    /// Hooks installed through this image, oldest first.
    #[inline]
    pub fn hooks(&self) -> &[HookHandle] {
        &self.hook_list
    }

    /// Number of entries in the dynamic symbol table, the null symbol included.
    #[inline]
    pub fn symbol_count(&self) -> usize {
        self.symtab.count()
    }

    /// Applies every relocation that needs nothing outside the image.
    ///
    /// Relative relocations get the load base, relocations against symbols
    /// defined here get their final address. Relocations against undefined
    /// symbols are kept for [`Image::resolve`]. On error nothing is written
    /// and the image stays [`ImageState::Loaded`].
    pub fn relocate(&mut self) -> Result<()> {
        if self.state != ImageState::Loaded {
            return Err(state_error(format!(
                "[{}] cannot relocate an image in state {:?}",
                self.name, self.state
            )));
        }
        let records = relocation::parse_relocations(&self.segments, &self.dynamic)?;
        self.pending = relocation::relocate(&mut self.segments, &self.symtab, &records)?;
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] relocated {} records, {} imports over {} slots pending",
            self.name,
            records.len(),
            self.pending.len(),
            self.pending.iter().map(PendingImport::slot_count).sum::<usize>()
        );
        self.state = ImageState::Relocated;
        Ok(())
    }

    /// Binds every import through `table`.
    ///
    /// A missing import fails with [`Error::UnresolvedSymbol`](crate::Error)
    /// unless it is weak or `allow_missing` is set; in that case nothing is
    /// written and `resolve` may be called again with another table.
    pub fn resolve<L: SymbolLookup + ?Sized>(&mut self, table: &L, allow_missing: bool) -> Result<()> {
        if self.state != ImageState::Relocated {
            return Err(state_error(format!(
                "[{}] cannot resolve an image in state {:?}",
                self.name, self.state
            )));
        }
        let unresolved = relocation::resolve(
            &mut self.segments,
            &self.symtab,
            &self.pending,
            table,
            allow_missing,
            &self.name,
        )?;
        self.pending = Vec::new();
        self.unresolved = unresolved;
        self.state = ImageState::Resolved;
        Ok(())
    }

    /// Looks up an exported symbol and returns its address.
    pub fn find_symbol(&self, name: &str) -> Option<usize> {
        let symbol = self.symtab.lookup_export(name)?;
        if symbol.st_shndx() == SHN_ABS as usize {
            Some(symbol.st_value())
        } else {
            Some(self.base().wrapping_add(symbol.st_value()))
        }
    }

    /// Gets a typed handle to an exported symbol.
    ///
    /// # Safety
    /// `T` must match the symbol's actual type, and code must not be called
    /// before the image is finalized.
    ///
    /// # Examples
    /// ```no_run
    /// # use so_loader::Loader;
    /// # let mut image = Loader::new().load("liba.so", &[], None).unwrap();
    /// let answer = unsafe { image.get::<extern "C" fn() -> i32>("answer").unwrap() };
    /// println!("{}", answer());
    /// ```
    pub unsafe fn get<'lib, T>(&'lib self, name: &str) -> Option<Symbol<'lib, T>> {
        self.find_symbol(name).map(|addr| Symbol::new(addr as *mut ()))
    }

    /// Redirects the function at `target` to `substitute`.
    ///
    /// `target` must lie in an executable segment of this image with room for
    /// the jump. When the symbol table records the size of the function at
    /// `target`, a function shorter than the jump is rejected and no bytes
    /// past its end are moved into a trampoline. Hooking a finalized image re-opens the patched pages and
    /// moves it back to [`ImageState::Hooked`]; call [`Image::finalize`]
    /// again afterwards.
    ///
    /// # Safety
    /// No thread may be executing the first instructions of `target`, and
    /// `substitute` must have the target's signature. A target with no sized
    /// symbol must be at least as long as the jump.
    pub unsafe fn install_hook(&mut self, target: usize, substitute: usize) -> Result<HookHandle> {
        if self.state < ImageState::Resolved {
            return Err(state_error(format!(
                "[{}] cannot hook an image in state {:?}",
                self.name, self.state
            )));
        }
        let code = arch::code_address(target);
        let patch_len = arch::jump_patch(target, substitute).len();
        let vaddr = code.wrapping_sub(self.base());
        let segment = self
            .segment_list
            .iter()
            .find(|seg| seg.prot.contains(ProtFlags::PROT_EXEC) && seg.contains(vaddr, patch_len))
            .ok_or_else(|| {
                hook_error(format!(
                    "[{}] 0x{:x} is not in an executable segment with room for a {}-byte jump",
                    self.name, target, patch_len
                ))
            })?;
        let mut available = (segment.end() - vaddr).min(PROLOGUE_WINDOW);
        if let Some(size) = self.symtab.function_size(vaddr) {
            if size < patch_len {
                return Err(hook_error(format!(
                    "[{}] function at 0x{:x} is {} bytes, the jump needs {}",
                    self.name, target, size, patch_len
                )));
            }
            available = available.min(size);
        }
        let prot = if self.protect {
            let page = self.segments.page_size();
            plan_protections(
                page_down(vaddr, page),
                page_up(vaddr + patch_len, page),
                page,
                &self.segment_list,
                self.relro,
            )
            .iter()
            .fold(ProtFlags::PROT_NONE, |acc, range| acc | range.prot)
        } else {
            ProtFlags::RWX
        };

        let handle = unsafe { self.hooks.install_within(target, substitute, available, prot)? };
        self.hook_list.push(handle);
        self.state = ImageState::Hooked;
        Ok(handle)
    }

    /// Hooks the exported function `name`.
    ///
    /// # Safety
    /// As for [`Image::install_hook`].
    pub unsafe fn hook_symbol(&mut self, name: &str, substitute: usize) -> Result<HookHandle> {
        let target = self
            .find_symbol(name)
            .ok_or_else(|| hook_error(format!("[{}] does not export [{}]", self.name, name)))?;
        unsafe { self.install_hook(target, substitute) }
    }

    /// Makes the image safe to execute.
    ///
    /// Flushes the instruction cache over the mapping and, when the loader's
    /// `protect` option is on, gives every page the protection its segments
    /// ask for.
    pub fn finalize(&mut self) -> Result<()> {
        match self.state {
            ImageState::Finalized => return Ok(()),
            ImageState::Resolved | ImageState::Hooked => {}
            state => {
                return Err(state_error(format!(
                    "[{}] cannot finalize an image in state {:?}",
                    self.name, state
                )));
            }
        }
        self.segments.flush_icache();
        if self.protect {
            let start = self.segments.start();
            let end = start + self.segments.mapped_len();
            for range in plan_protections(
                start,
                end,
                self.segments.page_size(),
                &self.segment_list,
                self.relro,
            ) {
                #[cfg(feature = "log")]
                log::trace!(
                    "[{}] protect 0x{:x}-0x{:x} {:?}",
                    self.name,
                    self.base().wrapping_add(range.start),
                    self.base().wrapping_add(range.end),
                    range.prot
                );
                self.segments.protect(range.start, range.end, range.prot)?;
            }
        }
        #[cfg(feature = "log")]
        log::debug!("[{}] finalized", self.name);
        self.state = ImageState::Finalized;
        Ok(())
    }

    /// Runs `DT_INIT` and then every `DT_INIT_ARRAY` entry.
    ///
    /// # Safety
    /// Runs code from the image; every import it touches must be bound to a
    /// working host function.
    pub unsafe fn initialize(&mut self) -> Result<()> {
        if self.state != ImageState::Finalized {
            return Err(state_error(format!(
                "[{}] cannot initialize an image in state {:?}",
                self.name, self.state
            )));
        }
        if self.initialized {
            return Err(state_error(format!("[{}] is already initialized", self.name)));
        }
        self.initialized = true;
        if let Some(init) = self.dynamic.init {
            #[cfg(feature = "log")]
            log::trace!("[{}] DT_INIT", self.name);
            unsafe { self.call(self.base().wrapping_add(init.get())) };
        }
        for func in self.array(self.dynamic.init_array) {
            unsafe { self.call(func) };
        }
        Ok(())
    }

    /// Function pointers of an init or fini array, skipping the 0 and -1
    /// sentinels.
    fn array(&self, table: Option<crate::dynamic::Table>) -> Vec<usize> {
        let Some(table) = table else {
            return Vec::new();
        };
        (0..table.size / size_of::<usize>())
            .filter_map(|idx| self.segments.read_usize(table.vaddr + idx * size_of::<usize>()))
            .filter(|&func| func != 0 && func != usize::MAX)
            .collect()
    }

    unsafe fn call(&self, func: usize) {
        let func: extern "C" fn() = unsafe { core::mem::transmute(func) };
        func();
    }
}

impl<M: Mmap> SymbolLookup for Image<M> {
    fn lookup(&self, name: &str) -> Option<*const ()> {
        self.find_symbol(name).map(|addr| addr as *const ())
    }
}

impl<M: Mmap> Drop for Image<M> {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }
        #[cfg(feature = "log")]
        log::trace!("[{}] running finalizers", self.name);
        for func in self.array(self.dynamic.fini_array).into_iter().rev() {
            unsafe { self.call(func) };
        }
        if let Some(fini) = self.dynamic.fini {
            unsafe { self.call(self.base().wrapping_add(fini.get())) };
        }
    }
}
