//! Parsing the `.dynamic` section
use crate::{
    Result,
    elf::{DYN_SIZE, Dyn, RELA_SIZE, REL_SIZE, SYM_SIZE},
    format_error,
    segment::ImageSegments,
};
use alloc::vec::Vec;
use core::num::NonZeroUsize;
use elf::abi::*;

/// A table inside the image: virtual address and size in bytes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Table {
    pub vaddr: usize,
    pub size: usize,
}

/// Relocation entry layout of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RelFormat {
    Rel,
    Rela,
}

impl RelFormat {
    #[inline]
    pub(crate) fn entry_size(self) -> usize {
        match self {
            RelFormat::Rel => REL_SIZE,
            RelFormat::Rela => RELA_SIZE,
        }
    }
}

/// Information in the dynamic section, with every table checked against the
/// mapping.
pub(crate) struct ElfDynamic {
    /// DT_SYMTAB
    pub symtab: usize,
    /// DT_STRTAB + DT_STRSZ
    pub strtab: Table,
    /// Number of entries in the dynamic symbol table.
    pub sym_count: usize,
    /// DT_RELA / DT_REL tables followed by DT_JMPREL.
    pub relocations: Vec<(Table, RelFormat)>,
    /// DT_INIT
    pub init: Option<NonZeroUsize>,
    /// DT_FINI
    pub fini: Option<NonZeroUsize>,
    /// DT_INIT_ARRAY + DT_INIT_ARRAYSZ
    pub init_array: Option<Table>,
    /// DT_FINI_ARRAY + DT_FINI_ARRAYSZ
    pub fini_array: Option<Table>,
    /// DT_NEEDED string offsets.
    pub needed_libs: Vec<usize>,
    /// DT_SONAME string offset.
    pub soname: Option<usize>,
}

#[derive(Default)]
struct RawDynamic {
    symtab: Option<usize>,
    strtab: Option<usize>,
    strsz: usize,
    hash: Option<usize>,
    gnu_hash: Option<usize>,
    rela: Option<usize>,
    relasz: usize,
    rel: Option<usize>,
    relsz: usize,
    jmprel: Option<usize>,
    pltrelsz: usize,
    pltrel: Option<usize>,
    init: Option<NonZeroUsize>,
    fini: Option<NonZeroUsize>,
    init_array: Option<usize>,
    init_arraysz: usize,
    fini_array: Option<usize>,
    fini_arraysz: usize,
    needed_libs: Vec<usize>,
    soname: Option<usize>,
}

impl ElfDynamic {
    /// Walks the dynamic entries at `vaddr` (at most `size` bytes) in the mapped
    /// image.
    pub(crate) fn parse(segments: &ImageSegments, vaddr: usize, size: usize) -> Result<Self> {
        let mut raw = RawDynamic::default();
        let count = size / DYN_SIZE;
        for idx in 0..count {
            let bytes = segments
                .bytes(vaddr + idx * DYN_SIZE, DYN_SIZE)
                .ok_or_else(|| format_error("dynamic section out of bounds"))?;
            let dynamic: Dyn = crate::elf::read_struct(bytes, 0)
                .ok_or_else(|| format_error("dynamic section out of bounds"))?;
            let val = dynamic.d_un as usize;
            match dynamic.d_tag as i64 {
                DT_NULL => break,
                DT_SYMTAB => raw.symtab = Some(val),
                DT_STRTAB => raw.strtab = Some(val),
                DT_STRSZ => raw.strsz = val,
                DT_HASH => raw.hash = Some(val),
                DT_GNU_HASH => raw.gnu_hash = Some(val),
                DT_RELA => raw.rela = Some(val),
                DT_RELASZ => raw.relasz = val,
                DT_REL => raw.rel = Some(val),
                DT_RELSZ => raw.relsz = val,
                DT_JMPREL => raw.jmprel = Some(val),
                DT_PLTRELSZ => raw.pltrelsz = val,
                DT_PLTREL => raw.pltrel = Some(val),
                DT_INIT => raw.init = NonZeroUsize::new(val),
                DT_FINI => raw.fini = NonZeroUsize::new(val),
                DT_INIT_ARRAY => raw.init_array = Some(val),
                DT_INIT_ARRAYSZ => raw.init_arraysz = val,
                DT_FINI_ARRAY => raw.fini_array = Some(val),
                DT_FINI_ARRAYSZ => raw.fini_arraysz = val,
                DT_NEEDED => raw.needed_libs.push(val),
                DT_SONAME => raw.soname = Some(val),
                _ => {}
            }
        }
        raw.finish(segments)
    }
}

impl RawDynamic {
    fn finish(self, segments: &ImageSegments) -> Result<ElfDynamic> {
        let table = |vaddr: usize, size: usize, what: &'static str| -> Result<Table> {
            if segments.check(vaddr, size) {
                Ok(Table { vaddr, size })
            } else {
                Err(format_error(what))
            }
        };

        let symtab = self
            .symtab
            .ok_or_else(|| format_error("dynamic section does not have DT_SYMTAB"))?;
        let strtab = self
            .strtab
            .ok_or_else(|| format_error("dynamic section does not have DT_STRTAB"))?;
        let strtab = table(strtab, self.strsz, "string table out of bounds")?;

        let sym_count = if let Some(hash) = self.hash {
            sysv_sym_count(segments, hash)?
        } else if let Some(gnu_hash) = self.gnu_hash {
            gnu_sym_count(segments, gnu_hash)?
        } else {
            return Err(format_error(
                "dynamic section has neither DT_HASH nor DT_GNU_HASH",
            ));
        };
        if sym_count == 0 || !segments.check(symtab, sym_count * SYM_SIZE) {
            return Err(format_error("symbol table out of bounds"));
        }

        let mut relocations = Vec::new();
        if let Some(rela) = self.rela {
            relocations.push((
                table(rela, self.relasz, "DT_RELA table out of bounds")?,
                RelFormat::Rela,
            ));
        }
        if let Some(rel) = self.rel {
            relocations.push((
                table(rel, self.relsz, "DT_REL table out of bounds")?,
                RelFormat::Rel,
            ));
        }
        if let Some(jmprel) = self.jmprel {
            let format = match self.pltrel.map(|v| v as i64) {
                Some(DT_REL) => RelFormat::Rel,
                Some(DT_RELA) => RelFormat::Rela,
                None if self.rel.is_some() && self.rela.is_none() => RelFormat::Rel,
                None => RelFormat::Rela,
                Some(_) => return Err(format_error("invalid DT_PLTREL")),
            };
            relocations.push((
                table(jmprel, self.pltrelsz, "DT_JMPREL table out of bounds")?,
                format,
            ));
        }
        for (table, format) in &relocations {
            if table.size % format.entry_size() != 0 {
                return Err(format_error("relocation table size is not a multiple of its entry size"));
            }
        }

        let init_array = self
            .init_array
            .map(|vaddr| table(vaddr, self.init_arraysz, "DT_INIT_ARRAY out of bounds"))
            .transpose()?;
        let fini_array = self
            .fini_array
            .map(|vaddr| table(vaddr, self.fini_arraysz, "DT_FINI_ARRAY out of bounds"))
            .transpose()?;
        for func in [self.init, self.fini].into_iter().flatten() {
            if !segments.check(func.get(), 1) {
                return Err(format_error("DT_INIT/DT_FINI out of bounds"));
            }
        }
        for name in self.needed_libs.iter().chain(self.soname.iter()) {
            if *name >= strtab.size {
                return Err(format_error("DT_NEEDED/DT_SONAME out of string table"));
            }
        }

        Ok(ElfDynamic {
            symtab,
            strtab,
            sym_count,
            relocations,
            init: self.init,
            fini: self.fini,
            init_array,
            fini_array,
            needed_libs: self.needed_libs,
            soname: self.soname,
        })
    }
}

/// Symbol count of a SysV hash table: `nchain`.
fn sysv_sym_count(segments: &ImageSegments, hash: usize) -> Result<usize> {
    segments
        .read_u32(hash + 4)
        .map(|nchain| nchain as usize)
        .ok_or_else(|| format_error("DT_HASH out of bounds"))
}

/// Symbol count of a GNU hash table: one past the last symbol reachable from
/// any bucket chain.
fn gnu_sym_count(segments: &ImageSegments, hash: usize) -> Result<usize> {
    let oob = || format_error("DT_GNU_HASH out of bounds");
    let nbucket = segments.read_u32(hash).ok_or_else(oob)? as usize;
    let symbias = segments.read_u32(hash + 4).ok_or_else(oob)? as usize;
    let nbloom = segments.read_u32(hash + 8).ok_or_else(oob)? as usize;
    let buckets = hash + 16 + nbloom * size_of::<usize>();
    let chains = buckets + nbucket * size_of::<u32>();

    let mut last = 0;
    for idx in 0..nbucket {
        last = last.max(segments.read_u32(buckets + idx * 4).ok_or_else(oob)? as usize);
    }
    if last < symbias {
        return Ok(symbias);
    }
    loop {
        let chain = segments
            .read_u32(chains + (last - symbias) * 4)
            .ok_or_else(oob)?;
        if chain & 1 != 0 {
            break;
        }
        last += 1;
    }
    Ok(last + 1)
}
