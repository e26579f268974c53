use crate::{
    Error, Result,
    dynamic::ElfDynamic,
    elf::{ElfHeader, ElfPhdr},
    format_error,
    hook::HookInstaller,
    image::{Image, ImageParts},
    mmap::{DefaultMmap, MapFlags, Mmap, ProtFlags},
    segment::{ImageSegments, Segment, page_down, page_up},
    symbol::SymbolTable,
};
use alloc::{format, string::String, vec::Vec};
use core::{ffi::c_void, marker::PhantomData, ptr::NonNull};
use elf::abi::{PT_DYNAMIC, PT_GNU_RELRO, PT_LOAD};

/// Context provided to hook functions during loading.
pub struct LoadHookContext<'a> {
    name: &'a str,
    phdr: &'a ElfPhdr,
    segment: &'a Segment,
    segments: &'a ImageSegments,
}

impl<'a> LoadHookContext<'a> {
    /// Returns the name of the image being loaded.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Returns the program header of the segment just copied.
    pub fn phdr(&self) -> &ElfPhdr {
        self.phdr
    }

    /// Returns the segment as placed in memory.
    pub fn segment(&self) -> &Segment {
        self.segment
    }

    /// Returns the image mapping.
    pub fn segments(&self) -> &ImageSegments {
        self.segments
    }
}

/// Hook run for every `PT_LOAD` segment after it has been copied.
///
/// Returning an error aborts the load and releases the mapping.
///
/// # Examples
/// ```rust
/// use so_loader::{LoadHook, LoadHookContext, Result};
///
/// struct MyHook;
///
/// impl LoadHook for MyHook {
///     fn call(&self, ctx: &LoadHookContext<'_>) -> Result<()> {
///         println!("Processing segment: {:?}", ctx.phdr());
///         Ok(())
///     }
/// }
/// ```
pub trait LoadHook {
    /// Executes the hook with the provided context.
    fn call(&self, ctx: &LoadHookContext<'_>) -> Result<()>;
}

impl<F> LoadHook for F
where
    F: Fn(&LoadHookContext<'_>) -> Result<()>,
{
    fn call(&self, ctx: &LoadHookContext<'_>) -> Result<()> {
        (self)(ctx)
    }
}

impl LoadHook for () {
    fn call(&self, _ctx: &LoadHookContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// The image loader.
///
/// Maps position-independent shared objects into the current process. The
/// returned [`Image`] still has to be relocated, resolved and finalized before
/// its code may run.
///
/// # Examples
/// ```no_run
/// use so_loader::Loader;
///
/// let bytes = std::fs::read("libgame.so").unwrap();
/// let image = Loader::new().load("libgame.so", &bytes, None).unwrap();
/// ```
pub struct Loader<M = DefaultMmap, H = ()>
where
    M: Mmap,
    H: LoadHook,
{
    hook: H,
    protect: bool,
    _marker: PhantomData<M>,
}

impl Loader<DefaultMmap, ()> {
    /// Creates a new `Loader` with default settings.
    pub fn new() -> Self {
        Self::with_mmap()
    }
}

impl Default for Loader<DefaultMmap, ()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Mmap> Loader<M, ()> {
    /// Creates a loader that obtains memory through `M`.
    pub fn with_mmap() -> Self {
        Loader {
            hook: (),
            protect: true,
            _marker: PhantomData,
        }
    }
}

impl<M: Mmap, H: LoadHook> Loader<M, H> {
    /// Sets the hook run for every loaded segment.
    pub fn with_hook<NewHook: LoadHook>(self, hook: NewHook) -> Loader<M, NewHook> {
        Loader {
            hook,
            protect: self.protect,
            _marker: PhantomData,
        }
    }

    /// Whether [`Image::finalize`] applies per-segment protections. On by
    /// default; when off, images stay readable, writable and executable.
    pub fn protect(mut self, protect: bool) -> Self {
        self.protect = protect;
        self
    }

    /// Loads `bytes` as an image named `name`.
    ///
    /// With `requested_base` the image must land exactly there, otherwise
    /// [`Error::Placement`] is returned. Without it the system picks an
    /// address that satisfies the largest segment alignment.
    pub fn load(
        &mut self,
        name: &str,
        bytes: &[u8],
        requested_base: Option<usize>,
    ) -> Result<Image<M>> {
        let ehdr = ElfHeader::parse(bytes)?;
        let phdrs = ehdr.phdrs(bytes)?;

        let page = M::page_size();
        let mut min_vaddr = usize::MAX;
        let mut max_vaddr = 0;
        let mut max_align = page;
        let mut dynamic = None;
        let mut relro = None;
        for phdr in &phdrs {
            match phdr.p_type() {
                PT_LOAD => {
                    if phdr.p_filesz() > phdr.p_memsz() {
                        return Err(format_error("segment file size exceeds its memory size"));
                    }
                    match phdr.p_offset().checked_add(phdr.p_filesz()) {
                        Some(end) if end <= bytes.len() => {}
                        _ => return Err(format_error("segment lies outside the file")),
                    }
                    let end = phdr
                        .p_vaddr()
                        .checked_add(phdr.p_memsz())
                        .filter(|end| *end <= usize::MAX - page)
                        .ok_or_else(|| format_error("segment address overflows"))?;
                    min_vaddr = min_vaddr.min(phdr.p_vaddr());
                    max_vaddr = max_vaddr.max(end);
                    if phdr.p_align().is_power_of_two() {
                        max_align = max_align.max(phdr.p_align());
                    }
                }
                PT_DYNAMIC => dynamic = Some((phdr.p_vaddr(), phdr.p_memsz())),
                PT_GNU_RELRO => relro = Some((phdr.p_vaddr(), phdr.p_memsz())),
                _ => {}
            }
        }
        if min_vaddr == usize::MAX {
            return Err(format_error("image has no loadable segments"));
        }
        let (dyn_vaddr, dyn_size) =
            dynamic.ok_or_else(|| format_error("image has no dynamic section"))?;
        let min_vaddr = page_down(min_vaddr, page);
        let len = page_up(max_vaddr, page) - min_vaddr;

        let mut segments = map_span::<M>(name, requested_base, min_vaddr, len, max_align, page)?;

        let mut segment_list = Vec::new();
        for phdr in phdrs.iter().filter(|phdr| phdr.p_type() == PT_LOAD) {
            let segment = Segment {
                vaddr: phdr.p_vaddr(),
                file_size: phdr.p_filesz(),
                mem_size: phdr.p_memsz(),
                prot: ImageSegments::map_prot(phdr.p_flags()),
            };
            let dst = segments
                .bytes_mut(segment.vaddr, segment.mem_size)
                .ok_or_else(|| format_error("segment lies outside the mapping"))?;
            let (file, bss) = dst.split_at_mut(segment.file_size);
            file.copy_from_slice(&bytes[phdr.p_offset()..phdr.p_offset() + segment.file_size]);
            bss.fill(0);

            #[cfg(feature = "log")]
            log::trace!(
                "[{}] segment 0x{:x}-0x{:x} {:?}",
                name,
                segments.base() + segment.vaddr,
                segments.base() + segment.end(),
                segment.prot
            );

            self.hook.call(&LoadHookContext {
                name,
                phdr,
                segment: &segment,
                segments: &segments,
            })?;
            segment_list.push(segment);
        }

        let dynamic = ElfDynamic::parse(&segments, dyn_vaddr, dyn_size)?;
        let symtab = SymbolTable::new(&segments, &dynamic)?;
        let needed_libs = dynamic
            .needed_libs
            .iter()
            .map(|&off| {
                symtab
                    .str_at(off)
                    .map(String::from)
                    .ok_or_else(|| format_error("invalid DT_NEEDED name"))
            })
            .collect::<Result<Vec<_>>>()?;
        let soname = dynamic
            .soname
            .map(|off| {
                symtab
                    .str_at(off)
                    .map(String::from)
                    .ok_or_else(|| format_error("invalid DT_SONAME"))
            })
            .transpose()?;
        let entry = match ehdr.e_entry() {
            0 => None,
            entry if segments.check(entry, 1) => Some(entry),
            _ => return Err(format_error("entry point lies outside the image")),
        };

        #[cfg(feature = "log")]
        log::debug!(
            "[{}] loaded at 0x{:x} ({} bytes, {} symbols, {} exports)",
            name,
            segments.base(),
            segments.mapped_len(),
            symtab.count(),
            symtab.export_count()
        );

        Ok(Image::from_parts(ImageParts {
            name: String::from(name),
            segments,
            segment_list,
            relro,
            dynamic,
            symtab,
            entry,
            needed_libs,
            soname,
            protect: self.protect,
            hooks: HookInstaller::with_mmap(),
        }))
    }
}

/// Maps the read/write/execute region the image span lives in.
fn map_span<M: Mmap>(
    _name: &str,
    requested_base: Option<usize>,
    min_vaddr: usize,
    len: usize,
    align: usize,
    page: usize,
) -> Result<ImageSegments> {
    let map = |addr: usize, len: usize| -> Result<NonNull<c_void>> {
        unsafe { M::mmap_anonymous(addr, len, ProtFlags::RWX, MapFlags::MAP_PRIVATE) }.map_err(
            |err| {
                crate::allocation_error(format!(
                    "cannot map 0x{:x} bytes for the image: {}",
                    len, err
                ))
            },
        )
    };

    let segments = match requested_base {
        Some(base) => {
            let target = base.wrapping_add(min_vaddr);
            let memory = map(target, len)?;
            let actual = memory.as_ptr() as usize;
            if actual != target {
                unsafe { M::munmap(memory, len)? };
                return Err(Error::Placement {
                    requested: base,
                    actual: actual.wrapping_sub(min_vaddr),
                });
            }
            ImageSegments::new::<M>(memory, len, base, min_vaddr, len)
        }
        None => {
            // Over-reserve so an aligned start exists inside the mapping.
            let map_len = len + align - page;
            let memory = map(0, map_len)?;
            let start = page_up(memory.as_ptr() as usize, align);
            let base = start.wrapping_sub(min_vaddr);
            match unsafe { trim_slack::<M>(memory, map_len, start, len) } {
                Ok(Some(span)) => ImageSegments::new::<M>(span, len, base, min_vaddr, len),
                Ok(None) => ImageSegments::new::<M>(memory, map_len, base, min_vaddr, len),
                Err(err) => {
                    unsafe { M::munmap(memory, map_len)? };
                    return Err(err);
                }
            }
        }
    };

    #[cfg(feature = "log")]
    log::trace!(
        "[{}] mapped 0x{:x} bytes at 0x{:x}",
        _name,
        len,
        segments.mapped_start()
    );
    Ok(segments)
}

/// Trims the alignment slack around `[start, start + len)`.
///
/// Returns the span as a mapping of its own once both ends are released, or
/// `None` when the backend keeps the whole region mapped.
unsafe fn trim_slack<M: Mmap>(
    memory: NonNull<c_void>,
    map_len: usize,
    start: usize,
    len: usize,
) -> Result<Option<NonNull<c_void>>> {
    let mapped = memory.as_ptr() as usize;
    let head = start - mapped;
    let tail = map_len - head - len;
    let mut released = true;
    for (addr, slack) in [(mapped, head), (start + len, tail)] {
        if slack == 0 {
            continue;
        }
        let addr = NonNull::new(addr as *mut c_void)
            .ok_or_else(|| crate::mmap_error("alignment slack starts at null"))?;
        released &= unsafe { M::trim(addr, slack)? };
    }
    if !released {
        return Ok(None);
    }
    #[cfg(feature = "log")]
    log::trace!("released 0x{:x} bytes of alignment slack", head + tail);
    Ok(NonNull::new(start as *mut c_void))
}
