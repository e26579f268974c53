//! Relocation of images and binding of their imports.
//!
//! Both passes work in two phases: every write is computed and checked against
//! the mapping first, then all of them are committed. A pass that fails leaves
//! the image exactly as it found it.
use crate::{
    Error, Result,
    arch::{REL_GOT, REL_JUMP_SLOT, REL_NONE, REL_PC32, REL_RELATIVE, REL_SYMBOLIC, rel_type_to_str},
    dynamic::{ElfDynamic, RelFormat},
    elf::{REL_BIT, REL_MASK, Rel, Rela, read_struct},
    relocate_error,
    segment::ImageSegments,
    symbol::{SymbolLookup, SymbolTable},
};
use alloc::{collections::BTreeMap, format, string::String, vec::Vec};
use elf::abi::SHN_ABS;

/// One entry of a relocation table.
///
/// REL entries carry their addend in the slot itself; it is read when the
/// table is decoded so both formats look the same from here on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RelocationRecord {
    /// Offset of the slot from the image base.
    pub offset: usize,
    /// Architecture relocation type.
    pub kind: u32,
    /// Index into the dynamic symbol table, 0 for none.
    pub symbol: usize,
    /// Value added to the symbol address.
    pub addend: isize,
}

/// A slot waiting for an import's address.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PendingSlot {
    offset: usize,
    kind: u32,
    addend: isize,
}

/// All slots that reference one undefined symbol.
#[derive(Debug)]
pub(crate) struct PendingImport {
    pub symbol: usize,
    slots: Vec<PendingSlot>,
}

impl PendingImport {
    #[cfg(feature = "log")]
    #[inline]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Value {
    Word(usize),
    U32(u32),
}

#[derive(Clone, Copy, Debug)]
struct Write {
    offset: usize,
    value: Value,
}

impl Write {
    #[inline]
    fn size(&self) -> usize {
        match self.value {
            Value::Word(_) => size_of::<usize>(),
            Value::U32(_) => size_of::<u32>(),
        }
    }
}

/// Checked writes, applied all at once.
#[derive(Default)]
struct WritePlan {
    writes: Vec<Write>,
}

impl WritePlan {
    fn push(&mut self, segments: &ImageSegments, write: Write) -> Result<()> {
        if !segments.check(write.offset, write.size()) {
            return Err(relocate_error(format!(
                "relocation slot 0x{:x} lies outside the image",
                write.offset
            )));
        }
        self.writes.push(write);
        Ok(())
    }

    fn commit(self, segments: &mut ImageSegments) {
        for write in self.writes {
            unsafe {
                match write.value {
                    Value::Word(value) => segments.write_usize(write.offset, value),
                    Value::U32(value) => segments.write_u32(write.offset, value),
                }
            }
        }
    }
}

/// Decodes every relocation table of the image, in table order.
pub(crate) fn parse_relocations(
    segments: &ImageSegments,
    dynamic: &ElfDynamic,
) -> Result<Vec<RelocationRecord>> {
    let mut records = Vec::new();
    for (table, format) in &dynamic.relocations {
        let bytes = segments
            .bytes(table.vaddr, table.size)
            .ok_or_else(|| crate::format_error("relocation table out of bounds"))?;
        let count = table.size / format.entry_size();
        records.reserve(count);
        for idx in 0..count {
            let offset = idx * format.entry_size();
            let record = match format {
                RelFormat::Rela => {
                    let rela: Rela = read_struct(bytes, offset)
                        .ok_or_else(|| crate::format_error("relocation table out of bounds"))?;
                    RelocationRecord {
                        offset: rela.r_offset as usize,
                        kind: (rela.r_info as usize & REL_MASK) as u32,
                        symbol: rela.r_info as usize >> REL_BIT,
                        addend: rela.r_addend as isize,
                    }
                }
                RelFormat::Rel => {
                    let rel: Rel = read_struct(bytes, offset)
                        .ok_or_else(|| crate::format_error("relocation table out of bounds"))?;
                    let kind = (rel.r_info as usize & REL_MASK) as u32;
                    let slot = rel.r_offset as usize;
                    RelocationRecord {
                        offset: slot,
                        kind,
                        symbol: rel.r_info as usize >> REL_BIT,
                        addend: implicit_addend(segments, slot, kind)?,
                    }
                }
            };
            records.push(record);
        }
    }
    Ok(records)
}

fn implicit_addend(segments: &ImageSegments, slot: usize, kind: u32) -> Result<isize> {
    let addend = match kind {
        REL_NONE => Some(0),
        REL_PC32 => segments.read_u32(slot).map(|v| v as i32 as isize),
        _ => segments.read_usize(slot).map(|v| v as isize),
    };
    addend.ok_or_else(|| {
        relocate_error(format!(
            "relocation slot 0x{:x} lies outside the image",
            slot
        ))
    })
}

/// The value a symbolic relocation stores for symbol address `s`.
fn symbolic_value(kind: u32, s: usize, addend: isize, place: usize) -> Result<Value> {
    match kind {
        REL_SYMBOLIC => Ok(Value::Word(s.wrapping_add_signed(addend))),
        REL_GOT | REL_JUMP_SLOT => Ok(Value::Word(s)),
        REL_PC32 => {
            let value = (s as isize)
                .wrapping_add(addend)
                .wrapping_sub(place as isize);
            #[cfg(target_pointer_width = "64")]
            if i32::try_from(value).is_err() {
                return Err(relocate_error(format!(
                    "{} value 0x{:x} does not fit in 32 bits",
                    rel_type_to_str(kind),
                    value
                )));
            }
            Ok(Value::U32(value as u32))
        }
        _ => Err(unsupported(kind)),
    }
}

#[cold]
fn unsupported(kind: u32) -> Error {
    relocate_error(format!(
        "unsupported relocation type {} ({})",
        rel_type_to_str(kind),
        kind
    ))
}

/// Applies every record that needs nothing from outside the image and returns
/// the slots that wait for imports, ordered by symbol index.
pub(crate) fn relocate(
    segments: &mut ImageSegments,
    symtab: &SymbolTable,
    records: &[RelocationRecord],
) -> Result<Vec<PendingImport>> {
    let base = segments.base();
    let mut plan = WritePlan::default();
    let mut pending: BTreeMap<usize, Vec<PendingSlot>> = BTreeMap::new();

    for record in records {
        let place = base.wrapping_add(record.offset);
        match record.kind {
            REL_NONE => continue,
            REL_RELATIVE => {
                plan.push(
                    segments,
                    Write {
                        offset: record.offset,
                        value: Value::Word(base.wrapping_add_signed(record.addend)),
                    },
                )?;
                continue;
            }
            REL_SYMBOLIC | REL_GOT | REL_JUMP_SLOT | REL_PC32 => {}
            kind => return Err(unsupported(kind)),
        }

        let s = if record.symbol == 0 {
            0
        } else {
            let symbol = symtab.symbol(record.symbol).ok_or_else(|| {
                relocate_error(format!(
                    "relocation at 0x{:x} references symbol {} past the end of the symbol table",
                    record.offset, record.symbol
                ))
            })?;
            if symbol.is_undef() {
                let slot = PendingSlot {
                    offset: record.offset,
                    kind: record.kind,
                    addend: record.addend,
                };
                // Validate the slot now so resolve cannot fail on layout.
                let size = if record.kind == REL_PC32 {
                    size_of::<u32>()
                } else {
                    size_of::<usize>()
                };
                if !segments.check(record.offset, size) {
                    return Err(relocate_error(format!(
                        "relocation slot 0x{:x} lies outside the image",
                        record.offset
                    )));
                }
                pending.entry(record.symbol).or_default().push(slot);
                continue;
            }
            if symbol.st_shndx() == SHN_ABS as usize {
                symbol.st_value()
            } else {
                base.wrapping_add(symbol.st_value())
            }
        };
        plan.push(
            segments,
            Write {
                offset: record.offset,
                value: symbolic_value(record.kind, s, record.addend, place)?,
            },
        )?;
    }

    #[cfg(feature = "log")]
    {
        let relative = records.iter().filter(|r| r.kind == REL_RELATIVE).count();
        log::debug!(
            "relocation: {} relative, {} bound locally, {} imports pending",
            relative,
            plan.writes.len() - relative,
            pending.len()
        );
    }

    plan.commit(segments);
    Ok(pending
        .into_iter()
        .map(|(symbol, slots)| PendingImport { symbol, slots })
        .collect())
}

/// Binds every pending import through `table`.
///
/// Returns the names that stayed unbound: weak imports, or any import when
/// `allow_missing` is set. Their word-sized slots are written as zero.
pub(crate) fn resolve<L: SymbolLookup + ?Sized>(
    segments: &mut ImageSegments,
    symtab: &SymbolTable,
    pending: &[PendingImport],
    table: &L,
    allow_missing: bool,
    _image: &str,
) -> Result<Vec<String>> {
    let base = segments.base();
    let mut plan = WritePlan::default();
    let mut unresolved = Vec::new();

    for import in pending {
        let name = symtab.name(import.symbol);
        match table.lookup(name) {
            Some(addr) => {
                #[cfg(feature = "log")]
                log::trace!(
                    "binding file [{}] symbol [{}] to 0x{:x}",
                    _image,
                    name,
                    addr as usize
                );
                for slot in &import.slots {
                    let value =
                        symbolic_value(slot.kind, addr as usize, slot.addend, base.wrapping_add(slot.offset))?;
                    plan.push(
                        segments,
                        Write {
                            offset: slot.offset,
                            value,
                        },
                    )?;
                }
            }
            None => {
                let weak = symtab
                    .symbol(import.symbol)
                    .is_some_and(|symbol| symbol.is_weak());
                if !weak && !allow_missing {
                    return Err(Error::UnresolvedSymbol {
                        name: String::from(name),
                    });
                }
                #[cfg(feature = "log")]
                log::warn!(
                    "[{}] symbol [{}] left unresolved{}",
                    _image,
                    name,
                    if weak { " (weak)" } else { "" }
                );
                for slot in import.slots.iter().filter(|slot| slot.kind != REL_PC32) {
                    plan.push(
                        segments,
                        Write {
                            offset: slot.offset,
                            value: Value::Word(0),
                        },
                    )?;
                }
                unresolved.push(String::from(name));
            }
        }
    }

    plan.commit(segments);
    Ok(unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolic_values() {
        assert_eq!(
            symbolic_value(REL_SYMBOLIC, 0x1000, 8, 0).ok(),
            Some(Value::Word(0x1008))
        );
        assert_eq!(
            symbolic_value(REL_GOT, 0x1000, 8, 0).ok(),
            Some(Value::Word(0x1000))
        );
        assert_eq!(
            symbolic_value(REL_JUMP_SLOT, 0x1000, 0, 0).ok(),
            Some(Value::Word(0x1000))
        );
        assert_eq!(
            symbolic_value(REL_PC32, 0x1000, -4, 0x2000).ok(),
            Some(Value::U32((-0x1004i32) as u32))
        );
        assert!(matches!(
            symbolic_value(REL_RELATIVE, 0, 0, 0),
            Err(Error::Relocation { .. })
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn pc32_overflow_is_an_error() {
        assert!(matches!(
            symbolic_value(REL_PC32, 0x7fff_0000_0000, 0, 0x1000),
            Err(Error::Relocation { .. })
        ));
    }
}
