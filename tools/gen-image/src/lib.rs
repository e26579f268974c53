//! Writes small position-independent ELF64 shared objects in memory.
//!
//! The images carry exactly what a dynamic loader looks at: program headers,
//! a dynamic section, a dynamic symbol table with a SysV or GNU hash,
//! relocation tables and the code and data they patch. There are no section headers.
//!
//! Layout (virtual address == file offset):
//!
//! ```text
//! text segment (R X)   ehdr, phdrs, .dynsym, .dynstr, .hash, .rela.dyn, .rela.plt, .text
//! relro pages  (R W)   .dynamic, .init_array, .fini_array, .got
//! data pages   (R W)   .data objects, then .bss
//! ```
use anyhow::{Result, anyhow, bail};
use byteorder::{LittleEndian, WriteBytesExt};
use elf::abi::*;
use std::collections::HashMap;

/// Segment alignment and granularity of the layout.
pub const PAGE: u64 = 0x1000;

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const PHDR_COUNT: u64 = 4;
const SYM_SIZE: u64 = 24;
const RELA_SIZE: u64 = 24;
const REL_SIZE: u64 = 16;
const DYN_SIZE: u64 = 16;

const R_AARCH64_PREL32: u32 = 261;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    /// The architecture of the running process, if the writer supports it.
    pub fn host() -> Option<Arch> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::Aarch64)
        } else {
            None
        }
    }

    fn machine(self) -> u16 {
        match self {
            Arch::X86_64 => EM_X86_64,
            Arch::Aarch64 => EM_AARCH64,
        }
    }

    fn r_relative(self) -> u32 {
        match self {
            Arch::X86_64 => R_X86_64_RELATIVE,
            Arch::Aarch64 => R_AARCH64_RELATIVE,
        }
    }

    fn r_abs(self) -> u32 {
        match self {
            Arch::X86_64 => R_X86_64_64,
            Arch::Aarch64 => R_AARCH64_ABS64,
        }
    }

    fn r_pc32(self) -> u32 {
        match self {
            Arch::X86_64 => R_X86_64_PC32,
            Arch::Aarch64 => R_AARCH64_PREL32,
        }
    }

    fn r_glob_dat(self) -> u32 {
        match self {
            Arch::X86_64 => R_X86_64_GLOB_DAT,
            Arch::Aarch64 => R_AARCH64_GLOB_DAT,
        }
    }

    fn r_jump_slot(self) -> u32 {
        match self {
            Arch::X86_64 => R_X86_64_JUMP_SLOT,
            Arch::Aarch64 => R_AARCH64_JUMP_SLOT,
        }
    }
}

/// How the contents of a data object are filled in at load time.
#[derive(Clone, Debug)]
pub enum Reloc {
    /// Address of a defined symbol, as a base-relative relocation.
    Relative(String),
    /// `S + A` against any symbol, defined or imported.
    Absolute(String, i64),
    /// `S + A - P` in 32 bits.
    Pc32(String, i64),
    /// A relocation of the given type with no symbol and no addend.
    Raw(u32),
}

/// A place in a function's code that refers to another symbol.
///
/// On x86-64 the four bytes at `at` receive the rel32 distance from `end` (the
/// end of the instruction) to the target. On AArch64 the instruction at `at`
/// is a literal load whose imm19 field receives the distance to the target.
/// Imported targets resolve to their GOT slot.
#[derive(Clone, Debug)]
pub struct CodeRef {
    pub at: usize,
    pub end: usize,
    pub target: String,
}

impl CodeRef {
    pub fn new(at: usize, end: usize, target: impl Into<String>) -> Self {
        CodeRef {
            at,
            end,
            target: target.into(),
        }
    }
}

#[derive(Clone, Debug)]
struct Function {
    name: String,
    code: Vec<u8>,
    refs: Vec<CodeRef>,
    bind: u8,
}

#[derive(Clone, Debug)]
struct Object {
    name: String,
    data: Vec<u8>,
    reloc: Option<Reloc>,
}

#[derive(Clone, Debug)]
struct Import {
    name: String,
    weak: bool,
    func: bool,
}

/// Describes the image to write.
#[derive(Clone, Debug)]
pub struct ImageBuilder {
    arch: Arch,
    functions: Vec<Function>,
    objects: Vec<Object>,
    imports: Vec<Import>,
    absolutes: Vec<(String, u64)>,
    init: Option<String>,
    fini: Option<String>,
    init_array: Vec<String>,
    fini_array: Vec<String>,
    needed: Vec<String>,
    soname: Option<String>,
    entry: Option<String>,
    bss: u64,
    rel: bool,
    gnu_hash: bool,
    align: u64,
}

/// Addresses of everything the writer placed, relative to the image base.
#[derive(Clone, Debug, Default)]
pub struct Layout {
    pub symbols: HashMap<String, u64>,
    pub got: HashMap<String, u64>,
    pub text: (u64, u64),
    pub data: (u64, u64),
    pub relro: (u64, u64),
    pub bss: (u64, u64),
    pub dynamic: (u64, u64),
}

impl Layout {
    /// Offset of a defined symbol. Panics if the image does not define it.
    pub fn symbol(&self, name: &str) -> u64 {
        self.symbols[name]
    }
}

/// A written image.
#[derive(Clone, Debug)]
pub struct Generated {
    pub bytes: Vec<u8>,
    pub layout: Layout,
}

struct Sym {
    name: u32,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

struct RelEntry {
    offset: u64,
    symbol: u64,
    kind: u32,
    addend: i64,
    /// Bytes the implicit addend occupies in REL mode.
    width: usize,
}

fn align(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

impl ImageBuilder {
    pub fn new(arch: Arch) -> Self {
        ImageBuilder {
            arch,
            functions: Vec::new(),
            objects: Vec::new(),
            imports: Vec::new(),
            absolutes: Vec::new(),
            init: None,
            fini: None,
            init_array: Vec::new(),
            fini_array: Vec::new(),
            needed: Vec::new(),
            soname: None,
            entry: None,
            bss: 0,
            rel: false,
            gnu_hash: false,
            align: PAGE,
        }
    }

    /// An exported function.
    pub fn function(self, name: impl Into<String>, code: &[u8]) -> Self {
        self.function_with_refs(name, code, &[])
    }

    /// An exported function whose code refers to other symbols.
    pub fn function_with_refs(mut self, name: impl Into<String>, code: &[u8], refs: &[CodeRef]) -> Self {
        self.functions.push(Function {
            name: name.into(),
            code: code.to_vec(),
            refs: refs.to_vec(),
            bind: STB_GLOBAL,
        });
        self
    }

    /// A function that is not exported.
    pub fn local_function(mut self, name: impl Into<String>, code: &[u8]) -> Self {
        self.functions.push(Function {
            name: name.into(),
            code: code.to_vec(),
            refs: Vec::new(),
            bind: STB_LOCAL,
        });
        self
    }

    /// An exported data object with fixed contents.
    pub fn object(mut self, name: impl Into<String>, data: &[u8]) -> Self {
        self.objects.push(Object {
            name: name.into(),
            data: data.to_vec(),
            reloc: None,
        });
        self
    }

    /// An exported data object filled by a relocation.
    pub fn pointer(mut self, name: impl Into<String>, reloc: Reloc) -> Self {
        let size = match reloc {
            Reloc::Pc32(..) => 4,
            _ => 8,
        };
        self.objects.push(Object {
            name: name.into(),
            data: vec![0; size],
            reloc: Some(reloc),
        });
        self
    }

    /// An imported function, bound through a `JUMP_SLOT` GOT entry.
    pub fn import(mut self, name: impl Into<String>) -> Self {
        self.imports.push(Import {
            name: name.into(),
            weak: false,
            func: true,
        });
        self
    }

    /// A weak imported function.
    pub fn weak_import(mut self, name: impl Into<String>) -> Self {
        self.imports.push(Import {
            name: name.into(),
            weak: true,
            func: true,
        });
        self
    }

    /// An imported data object, bound through a `GLOB_DAT` GOT entry.
    pub fn import_data(mut self, name: impl Into<String>) -> Self {
        self.imports.push(Import {
            name: name.into(),
            weak: false,
            func: false,
        });
        self
    }

    /// An exported `SHN_ABS` symbol.
    pub fn absolute(mut self, name: impl Into<String>, value: u64) -> Self {
        self.absolutes.push((name.into(), value));
        self
    }

    /// Sets `DT_INIT`.
    pub fn init(mut self, func: impl Into<String>) -> Self {
        self.init = Some(func.into());
        self
    }

    /// Sets `DT_FINI`.
    pub fn fini(mut self, func: impl Into<String>) -> Self {
        self.fini = Some(func.into());
        self
    }

    /// Appends to `DT_INIT_ARRAY`.
    pub fn init_array(mut self, func: impl Into<String>) -> Self {
        self.init_array.push(func.into());
        self
    }

    /// Appends to `DT_FINI_ARRAY`.
    pub fn fini_array(mut self, func: impl Into<String>) -> Self {
        self.fini_array.push(func.into());
        self
    }

    pub fn needed(mut self, lib: impl Into<String>) -> Self {
        self.needed.push(lib.into());
        self
    }

    pub fn soname(mut self, soname: impl Into<String>) -> Self {
        self.soname = Some(soname.into());
        self
    }

    pub fn entry(mut self, func: impl Into<String>) -> Self {
        self.entry = Some(func.into());
        self
    }

    /// Zero-filled bytes after the data objects.
    pub fn bss(mut self, size: u64) -> Self {
        self.bss = size;
        self
    }

    /// Emits REL tables with implicit addends instead of RELA.
    pub fn use_rel(mut self, rel: bool) -> Self {
        self.rel = rel;
        self
    }

    /// `p_align` of both `PT_LOAD` segments. The layout itself stays page
    /// granular.
    pub fn segment_align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    /// Emits `DT_GNU_HASH` instead of `DT_HASH`.
    pub fn use_gnu_hash(mut self, gnu_hash: bool) -> Self {
        self.gnu_hash = gnu_hash;
        self
    }

    pub fn build(&self) -> Result<Generated> {
        let arch = self.arch;

        // String table.
        let mut dynstr = vec![0u8];
        let mut add_str = |s: &str| -> u32 {
            let off = dynstr.len() as u32;
            dynstr.extend_from_slice(s.as_bytes());
            dynstr.push(0);
            off
        };
        let import_names: Vec<u32> = self.imports.iter().map(|i| add_str(&i.name)).collect();
        let abs_names: Vec<u32> = self.absolutes.iter().map(|(n, _)| add_str(n)).collect();
        let func_names: Vec<u32> = self.functions.iter().map(|f| add_str(&f.name)).collect();
        let obj_names: Vec<u32> = self.objects.iter().map(|o| add_str(&o.name)).collect();
        let needed: Vec<u32> = self.needed.iter().map(|n| add_str(n)).collect();
        let soname = self.soname.as_deref().map(&mut add_str);

        // Symbol indices: null, imports, absolutes, functions, objects.
        let sym_count = 1 + self.imports.len() + self.absolutes.len() + self.functions.len() + self.objects.len();
        let mut sym_index: HashMap<&str, u64> = HashMap::new();
        let mut idx = 1u64;
        for name in self
            .imports
            .iter()
            .map(|i| i.name.as_str())
            .chain(self.absolutes.iter().map(|(n, _)| n.as_str()))
            .chain(self.functions.iter().map(|f| f.name.as_str()))
            .chain(self.objects.iter().map(|o| o.name.as_str()))
        {
            if sym_index.insert(name, idx).is_some() {
                bail!("symbol [{}] is defined twice", name);
            }
            idx += 1;
        }

        // Relocation counts decide the table sizes.
        let rel_size = if self.rel { REL_SIZE } else { RELA_SIZE };
        let dyn_count = self.objects.iter().filter(|o| o.reloc.is_some()).count()
            + self.imports.iter().filter(|i| !i.func).count()
            + self.init_array.len()
            + self.fini_array.len();
        let plt_count = self.imports.iter().filter(|i| i.func).count();

        // Text segment.
        let dynsym_off = align(EHDR_SIZE + PHDR_SIZE * PHDR_COUNT, 8);
        let dynstr_off = dynsym_off + SYM_SIZE * sym_count as u64;
        let hash_off = align(dynstr_off + dynstr.len() as u64, 8);
        // Imports are not hashed, so the GNU chain starts after them.
        let symbias = 1 + self.imports.len();
        let hash_size = if self.gnu_hash {
            16 + 8 + 4 + 4 * (sym_count - symbias) as u64
        } else {
            4 * (3 + sym_count as u64)
        };
        let reldyn_off = align(hash_off + hash_size, 8);
        let relplt_off = reldyn_off + rel_size * dyn_count as u64;
        let mut cursor = align(relplt_off + rel_size * plt_count as u64, 16);
        let text_start = cursor;
        let mut symbols: HashMap<String, u64> = HashMap::new();
        let mut func_addrs = Vec::new();
        for func in &self.functions {
            func_addrs.push(cursor);
            symbols.insert(func.name.clone(), cursor);
            cursor = align(cursor + func.code.len() as u64, 16);
        }
        let text_end = cursor;

        // Relro pages.
        let dynamic_entries = 5
            + if dyn_count > 0 { 3 } else { 0 }
            + if plt_count > 0 { 3 } else { 0 }
            + self.init.is_some() as usize
            + self.fini.is_some() as usize
            + if self.init_array.is_empty() { 0 } else { 2 }
            + if self.fini_array.is_empty() { 0 } else { 2 }
            + needed.len()
            + soname.is_some() as usize
            + 1;
        let data_start = align(text_end, PAGE);
        let dynamic_off = data_start;
        let dynamic_size = DYN_SIZE * dynamic_entries as u64;
        let init_array_off = dynamic_off + dynamic_size;
        let fini_array_off = init_array_off + 8 * self.init_array.len() as u64;
        let got_off = fini_array_off + 8 * self.fini_array.len() as u64;
        let mut got: HashMap<String, u64> = HashMap::new();
        for (i, import) in self.imports.iter().enumerate() {
            got.insert(import.name.clone(), got_off + 8 * i as u64);
        }
        let relro_end = align(got_off + 8 * self.imports.len() as u64, PAGE);

        // Data objects and bss.
        let mut cursor = relro_end;
        let mut obj_addrs = Vec::new();
        for obj in &self.objects {
            cursor = align(cursor, 8);
            obj_addrs.push(cursor);
            symbols.insert(obj.name.clone(), cursor);
            cursor += obj.data.len() as u64;
        }
        let file_end = cursor.max(relro_end);
        let bss_start = align(file_end, 8);
        let mem_end = bss_start + self.bss;
        for (name, value) in &self.absolutes {
            symbols.insert(name.clone(), *value);
        }

        let mut buf = vec![0u8; file_end as usize];

        let func_addr = |name: &str| -> Result<u64> {
            self.functions
                .iter()
                .position(|f| f.name == name)
                .map(|i| func_addrs[i])
                .ok_or_else(|| anyhow!("no function named [{}]", name))
        };
        let defined = |name: &str| -> Result<u64> {
            symbols
                .get(name)
                .copied()
                .ok_or_else(|| anyhow!("no symbol named [{}]", name))
        };
        let symbol_of = |name: &str| -> Result<u64> {
            sym_index
                .get(name)
                .copied()
                .ok_or_else(|| anyhow!("no symbol named [{}]", name))
        };

        // Relocations.
        let mut reldyn = Vec::new();
        for (obj, &addr) in self.objects.iter().zip(&obj_addrs) {
            let entry = match &obj.reloc {
                None => continue,
                Some(Reloc::Relative(target)) => RelEntry {
                    offset: addr,
                    symbol: 0,
                    kind: arch.r_relative(),
                    addend: defined(target)? as i64,
                    width: 8,
                },
                Some(Reloc::Absolute(target, addend)) => RelEntry {
                    offset: addr,
                    symbol: symbol_of(target)?,
                    kind: arch.r_abs(),
                    addend: *addend,
                    width: 8,
                },
                Some(Reloc::Pc32(target, addend)) => RelEntry {
                    offset: addr,
                    symbol: symbol_of(target)?,
                    kind: arch.r_pc32(),
                    addend: *addend,
                    width: 4,
                },
                Some(Reloc::Raw(kind)) => RelEntry {
                    offset: addr,
                    symbol: 0,
                    kind: *kind,
                    addend: 0,
                    width: 8,
                },
            };
            reldyn.push(entry);
        }
        for (i, import) in self.imports.iter().enumerate().filter(|(_, i)| !i.func) {
            reldyn.push(RelEntry {
                offset: got_off + 8 * i as u64,
                symbol: symbol_of(&import.name)?,
                kind: arch.r_glob_dat(),
                addend: 0,
                width: 8,
            });
        }
        for (slot, func) in self
            .init_array
            .iter()
            .enumerate()
            .map(|(i, f)| (init_array_off + 8 * i as u64, f))
            .chain(
                self.fini_array
                    .iter()
                    .enumerate()
                    .map(|(i, f)| (fini_array_off + 8 * i as u64, f)),
            )
        {
            reldyn.push(RelEntry {
                offset: slot,
                symbol: 0,
                kind: arch.r_relative(),
                addend: func_addr(func)? as i64,
                width: 8,
            });
        }
        let mut relplt = Vec::new();
        for (i, import) in self.imports.iter().enumerate().filter(|(_, i)| i.func) {
            relplt.push(RelEntry {
                offset: got_off + 8 * i as u64,
                symbol: symbol_of(&import.name)?,
                kind: arch.r_jump_slot(),
                addend: 0,
                width: 8,
            });
        }

        // Code, with references patched.
        for (func, &addr) in self.functions.iter().zip(&func_addrs) {
            let code = &mut buf[addr as usize..addr as usize + func.code.len()];
            code.copy_from_slice(&func.code);
            for r in &func.refs {
                let target = match got.get(&r.target) {
                    Some(&slot) => slot,
                    None => defined(&r.target)?,
                };
                match arch {
                    Arch::X86_64 => {
                        let disp = target as i64 - (addr + r.end as u64) as i64;
                        let disp = i32::try_from(disp)?;
                        code[r.at..r.at + 4].copy_from_slice(&disp.to_le_bytes());
                    }
                    Arch::Aarch64 => {
                        let dist = target as i64 - (addr + r.at as u64) as i64;
                        if dist % 4 != 0 {
                            bail!("literal target of [{}] is not word aligned", func.name);
                        }
                        let insn = u32::from_le_bytes(code[r.at..r.at + 4].try_into()?);
                        let imm19 = ((dist / 4) as u32) & 0x7ffff;
                        code[r.at..r.at + 4].copy_from_slice(&(insn | imm19 << 5).to_le_bytes());
                    }
                }
            }
        }

        // Data objects.
        for (obj, &addr) in self.objects.iter().zip(&obj_addrs) {
            buf[addr as usize..addr as usize + obj.data.len()].copy_from_slice(&obj.data);
        }

        // Implicit addends live in the slots.
        if self.rel {
            for entry in reldyn.iter().chain(&relplt) {
                let at = entry.offset as usize;
                match entry.width {
                    4 => buf[at..at + 4].copy_from_slice(&(entry.addend as i32).to_le_bytes()),
                    _ => buf[at..at + 8].copy_from_slice(&entry.addend.to_le_bytes()),
                }
            }
        }

        // Symbol table.
        let mut syms = vec![Sym {
            name: 0,
            info: 0,
            shndx: SHN_UNDEF,
            value: 0,
            size: 0,
        }];
        for (import, &name) in self.imports.iter().zip(&import_names) {
            let bind = if import.weak { STB_WEAK } else { STB_GLOBAL };
            let kind = if import.func { STT_FUNC } else { STT_OBJECT };
            syms.push(Sym {
                name,
                info: bind << 4 | kind,
                shndx: SHN_UNDEF,
                value: 0,
                size: 0,
            });
        }
        for ((_, value), &name) in self.absolutes.iter().zip(&abs_names) {
            syms.push(Sym {
                name,
                info: STB_GLOBAL << 4 | STT_NOTYPE,
                shndx: SHN_ABS,
                value: *value,
                size: 0,
            });
        }
        for ((func, &addr), &name) in self.functions.iter().zip(&func_addrs).zip(&func_names) {
            syms.push(Sym {
                name,
                info: func.bind << 4 | STT_FUNC,
                shndx: 1,
                value: addr,
                size: func.code.len() as u64,
            });
        }
        for ((obj, &addr), &name) in self.objects.iter().zip(&obj_addrs).zip(&obj_names) {
            syms.push(Sym {
                name,
                info: STB_GLOBAL << 4 | STT_OBJECT,
                shndx: 2,
                value: addr,
                size: obj.data.len() as u64,
            });
        }

        let mut out = Vec::new();
        for sym in &syms {
            out.write_u32::<LittleEndian>(sym.name)?;
            out.write_u8(sym.info)?;
            out.write_u8(0)?;
            out.write_u16::<LittleEndian>(sym.shndx)?;
            out.write_u64::<LittleEndian>(sym.value)?;
            out.write_u64::<LittleEndian>(sym.size)?;
        }
        write_at(&mut buf, dynsym_off, &out);
        write_at(&mut buf, dynstr_off, &dynstr);

        // One bucket chaining every symbol.
        let mut out = Vec::new();
        if self.gnu_hash {
            out.write_u32::<LittleEndian>(1)?;
            out.write_u32::<LittleEndian>(symbias as u32)?;
            out.write_u32::<LittleEndian>(1)?;
            out.write_u32::<LittleEndian>(0)?;
            // A full bloom word lets every name through.
            out.write_u64::<LittleEndian>(u64::MAX)?;
            let first = if symbias < sym_count { symbias as u32 } else { 0 };
            out.write_u32::<LittleEndian>(first)?;
            let names = self
                .absolutes
                .iter()
                .map(|(n, _)| n.as_str())
                .chain(self.functions.iter().map(|f| f.name.as_str()))
                .chain(self.objects.iter().map(|o| o.name.as_str()));
            let hashed = sym_count - symbias;
            for (i, name) in names.enumerate() {
                let end = if i + 1 == hashed { 1 } else { 0 };
                out.write_u32::<LittleEndian>(gnu_hash(name) & !1 | end)?;
            }
        } else {
            out.write_u32::<LittleEndian>(1)?;
            out.write_u32::<LittleEndian>(sym_count as u32)?;
            out.write_u32::<LittleEndian>(sym_count as u32 - 1)?;
            for i in 0..sym_count as u32 {
                out.write_u32::<LittleEndian>(i.saturating_sub(1))?;
            }
        }
        write_at(&mut buf, hash_off, &out);

        write_at(&mut buf, reldyn_off, &encode_relocs(&reldyn, self.rel)?);
        write_at(&mut buf, relplt_off, &encode_relocs(&relplt, self.rel)?);

        // Dynamic section.
        let (tag, size_tag, ent_tag) = if self.rel {
            (DT_REL, DT_RELSZ, DT_RELENT)
        } else {
            (DT_RELA, DT_RELASZ, DT_RELAENT)
        };
        let mut dynamic: Vec<(i64, u64)> = vec![
            (if self.gnu_hash { DT_GNU_HASH } else { DT_HASH }, hash_off),
            (DT_STRTAB, dynstr_off),
            (DT_SYMTAB, dynsym_off),
            (DT_STRSZ, dynstr.len() as u64),
            (DT_SYMENT, SYM_SIZE),
        ];
        if dyn_count > 0 {
            dynamic.push((tag, reldyn_off));
            dynamic.push((size_tag, rel_size * dyn_count as u64));
            dynamic.push((ent_tag, rel_size));
        }
        if plt_count > 0 {
            dynamic.push((DT_JMPREL, relplt_off));
            dynamic.push((DT_PLTRELSZ, rel_size * plt_count as u64));
            dynamic.push((DT_PLTREL, tag as u64));
        }
        if let Some(init) = &self.init {
            dynamic.push((DT_INIT, func_addr(init)?));
        }
        if let Some(fini) = &self.fini {
            dynamic.push((DT_FINI, func_addr(fini)?));
        }
        if !self.init_array.is_empty() {
            dynamic.push((DT_INIT_ARRAY, init_array_off));
            dynamic.push((DT_INIT_ARRAYSZ, 8 * self.init_array.len() as u64));
        }
        if !self.fini_array.is_empty() {
            dynamic.push((DT_FINI_ARRAY, fini_array_off));
            dynamic.push((DT_FINI_ARRAYSZ, 8 * self.fini_array.len() as u64));
        }
        for &lib in &needed {
            dynamic.push((DT_NEEDED, lib as u64));
        }
        if let Some(soname) = soname {
            dynamic.push((DT_SONAME, soname as u64));
        }
        dynamic.push((DT_NULL, 0));
        debug_assert_eq!(dynamic.len(), dynamic_entries);
        let mut out = Vec::new();
        for (tag, val) in dynamic {
            out.write_i64::<LittleEndian>(tag)?;
            out.write_u64::<LittleEndian>(val)?;
        }
        write_at(&mut buf, dynamic_off, &out);

        // Headers.
        let entry = match &self.entry {
            Some(func) => func_addr(func)?,
            None => 0,
        };
        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', ELFCLASS64, ELFDATA2LSB, EV_CURRENT, 0]);
        out.extend_from_slice(&[0; 8]);
        out.write_u16::<LittleEndian>(ET_DYN)?;
        out.write_u16::<LittleEndian>(arch.machine())?;
        out.write_u32::<LittleEndian>(EV_CURRENT as u32)?;
        out.write_u64::<LittleEndian>(entry)?;
        out.write_u64::<LittleEndian>(EHDR_SIZE)?;
        out.write_u64::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(EHDR_SIZE as u16)?;
        out.write_u16::<LittleEndian>(PHDR_SIZE as u16)?;
        out.write_u16::<LittleEndian>(PHDR_COUNT as u16)?;
        out.write_u16::<LittleEndian>(64)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(0)?;

        let phdrs = [
            (PT_LOAD, PF_R | PF_X, 0, text_end, text_end, self.align),
            (PT_LOAD, PF_R | PF_W, data_start, file_end - data_start, mem_end - data_start, self.align),
            (PT_DYNAMIC, PF_R | PF_W, dynamic_off, dynamic_size, dynamic_size, 8),
            (PT_GNU_RELRO, PF_R, data_start, relro_end - data_start, relro_end - data_start, 1),
        ];
        for (p_type, flags, vaddr, filesz, memsz, p_align) in phdrs {
            out.write_u32::<LittleEndian>(p_type)?;
            out.write_u32::<LittleEndian>(flags)?;
            out.write_u64::<LittleEndian>(vaddr)?;
            out.write_u64::<LittleEndian>(vaddr)?;
            out.write_u64::<LittleEndian>(vaddr)?;
            out.write_u64::<LittleEndian>(filesz)?;
            out.write_u64::<LittleEndian>(memsz)?;
            out.write_u64::<LittleEndian>(p_align)?;
        }
        write_at(&mut buf, 0, &out);

        Ok(Generated {
            bytes: buf,
            layout: Layout {
                symbols,
                got,
                text: (text_start, text_end),
                data: (data_start, mem_end),
                relro: (data_start, relro_end),
                bss: (bss_start, mem_end),
                dynamic: (dynamic_off, dynamic_size),
            },
        })
    }
}

fn encode_relocs(entries: &[RelEntry], rel: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for entry in entries {
        out.write_u64::<LittleEndian>(entry.offset)?;
        out.write_u64::<LittleEndian>(entry.symbol << 32 | entry.kind as u64)?;
        if !rel {
            out.write_i64::<LittleEndian>(entry.addend)?;
        }
    }
    Ok(out)
}

/// The GNU symbol hash (`dl_new_hash`).
fn gnu_hash(name: &str) -> u32 {
    name.bytes()
        .fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(b as u32))
}

fn write_at(buf: &mut [u8], offset: u64, data: &[u8]) {
    buf[offset as usize..offset as usize + data.len()].copy_from_slice(data);
}
