use crate::{*, error::*, demangle::*, dwarf, sink::*};

// Mach-O parsing and producers. Only the 64-bit little-endian flavor is
// handled; 32-bit, big-endian and fat binaries are rejected as unsupported
// rather than misparsed.

pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const MH_CIGAM_64: u32 = 0xcffaedfe;
pub const MH_MAGIC_32: u32 = 0xfeedface;
pub const MH_CIGAM_32: u32 = 0xcefaedfe;
pub const FAT_MAGIC: u32 = 0xbebafeca; // 0xcafebabe stored big-endian, read little

const LC_SYMTAB: u32 = 0x2;
const LC_SEGMENT_64: u32 = 0x19;

const MACH_HEADER_SIZE: u64 = 32;
const SEGMENT_COMMAND_SIZE: u64 = 72;
const SECTION_SIZE: u64 = 80;
const SYMTAB_COMMAND_SIZE: u64 = 24;
const NLIST_SIZE: u64 = 16;

const SECTION_TYPE_MASK: u32 = 0xff;
const S_ZEROFILL: u32 = 0x1;
const S_GB_ZEROFILL: u32 = 0xc;
const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;

const N_STAB: u8 = 0xe0;
const N_TYPE: u8 = 0x0e;
const N_SECT: u8 = 0x0e;

fn magic_of(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes(data[..4].try_into().unwrap()))
}

// Any Mach-O flavor, including the ones we refuse to parse.
pub fn is_macho_file(data: &[u8]) -> bool {
    matches!(magic_of(data), Some(MH_MAGIC_64 | MH_CIGAM_64 | MH_MAGIC_32 | MH_CIGAM_32 | FAT_MAGIC))
}

fn bytes(data: &[u8], off: u64, n: u64) -> Result<&[u8]> {
    let end = match off.checked_add(n) {
        Some(e) => e,
        None => return err!(IntegerOverflow, "offset 0x{:x} + 0x{:x} overflows", off, n),
    };
    if end > data.len() as u64 {
        return err!(Truncated, "read of 0x{:x} bytes at offset 0x{:x} is out of bounds (file has 0x{:x})", n, off, data.len());
    }
    Ok(&data[off as usize..end as usize])
}

fn u32_at(data: &[u8], off: u64) -> Result<u32> { Ok(u32::from_le_bytes(bytes(data, off, 4)?.try_into().unwrap())) }
fn u64_at(data: &[u8], off: u64) -> Result<u64> { Ok(u64::from_le_bytes(bytes(data, off, 8)?.try_into().unwrap())) }

// segname/sectname are fixed 16-byte fields, NUL-padded.
fn fixed_name(field: &[u8]) -> String {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..len]).into_owned()
}

#[derive(Debug)]
pub struct MachOSegment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub sections: Vec<MachOSection>,
}

#[derive(Debug)]
pub struct MachOSection {
    pub name: String,
    pub segment_name: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u64,
    pub flags: u32,
}

impl MachOSection {
    pub fn filesize(&self) -> u64 {
        match self.flags & SECTION_TYPE_MASK {
            S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL => 0,
            _ => self.size,
        }
    }
}

#[derive(Debug)]
pub struct MachOSymtab {
    pub symoff: u64,
    pub nsyms: u64,
    pub stroff: u64,
    pub strsize: u64,
}

#[derive(Debug)]
pub struct MachOFile<'a> {
    data: &'a [u8],
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub segments: Vec<MachOSegment>,
    pub symtab: Option<MachOSymtab>,
}

impl<'a> MachOFile<'a> {
    pub fn parse(data: &'a [u8]) -> Result<MachOFile<'a>> {
        match magic_of(data) {
            Some(MH_MAGIC_64) => (),
            Some(MH_CIGAM_64) => return err!(Unsupported, "big-endian Mach-O is not supported"),
            Some(MH_MAGIC_32 | MH_CIGAM_32) => return err!(Unsupported, "32-bit Mach-O is not supported"),
            Some(FAT_MAGIC) => return err!(Unsupported, "fat Mach-O binaries are not supported; extract one architecture first"),
            _ => return err!(Malformed, "not a Mach-O file"),
        }

        let ncmds = u32_at(data, 16)?;
        let sizeofcmds = u32_at(data, 20)?;
        let mut file = MachOFile {data, ncmds, sizeofcmds, segments: Vec::new(), symtab: None};

        let mut off = MACH_HEADER_SIZE;
        for _ in 0..ncmds {
            let cmd = u32_at(data, off)?;
            let cmdsize = u32_at(data, off + 4)? as u64;
            if cmdsize < 8 {
                return err!(Malformed, "load command size {} too small", cmdsize);
            }
            match cmd {
                LC_SEGMENT_64 => {
                    if cmdsize < SEGMENT_COMMAND_SIZE {
                        return err!(Malformed, "LC_SEGMENT_64 command too small");
                    }
                    let name = fixed_name(bytes(data, off + 8, 16)?);
                    let mut segment = MachOSegment {
                        name: name.clone(),
                        vmaddr: u64_at(data, off + 24)?,
                        vmsize: u64_at(data, off + 32)?,
                        fileoff: u64_at(data, off + 40)?,
                        filesize: u64_at(data, off + 48)?,
                        sections: Vec::new(),
                    };
                    let nsects = u32_at(data, off + 64)? as u64;
                    if SEGMENT_COMMAND_SIZE + nsects * SECTION_SIZE > cmdsize {
                        return err!(Malformed, "LC_SEGMENT_64 command too small for {} sections", nsects);
                    }
                    for i in 0..nsects {
                        let soff = off + SEGMENT_COMMAND_SIZE + i * SECTION_SIZE;
                        segment.sections.push(MachOSection {
                            name: fixed_name(bytes(data, soff, 16)?),
                            segment_name: name.clone(),
                            addr: u64_at(data, soff + 32)?,
                            size: u64_at(data, soff + 40)?,
                            offset: u32_at(data, soff + 48)? as u64,
                            flags: u32_at(data, soff + 64)?,
                        });
                    }
                    file.segments.push(segment);
                }
                LC_SYMTAB => {
                    if cmdsize < SYMTAB_COMMAND_SIZE {
                        return err!(Malformed, "LC_SYMTAB command too small");
                    }
                    file.symtab = Some(MachOSymtab {
                        symoff: u32_at(data, off + 8)? as u64,
                        nsyms: u32_at(data, off + 12)? as u64,
                        stroff: u32_at(data, off + 16)? as u64,
                        strsize: u32_at(data, off + 20)? as u64,
                    });
                }
                _ => (),
            }
            off += cmdsize;
        }
        Ok(file)
    }

    pub fn header_region(&self) -> (u64, u64) {
        (0, MACH_HEADER_SIZE + self.sizeofcmds as u64)
    }

    fn strtab_name(&self, strx: u64) -> Result<&'a str> {
        let symtab = self.symtab.as_ref().unwrap();
        if strx >= symtab.strsize {
            return err!(Malformed, "string table index 0x{:x} out of bounds", strx);
        }
        let table = bytes(self.data, symtab.stroff, symtab.strsize)?;
        let tail = &table[strx as usize..];
        let len = match tail.iter().position(|&b| b == 0) {
            Some(len) => len,
            None => return err!(Malformed, "no NUL terminator found in string table"),
        };
        Ok(std::str::from_utf8(&tail[..len])?)
    }
}

// __PAGEZERO spans 4 GB of deliberately unmapped address space; counting it
// would drown everything else in the VM column.
fn is_pagezero(segment: &MachOSegment) -> bool {
    segment.name == "__PAGEZERO"
}

fn read_macho_segments(sink: &mut RangeSink) -> Result<()> {
    let macho = MachOFile::parse(sink.file.data())?;
    for segment in &macho.segments {
        if is_pagezero(segment) {
            continue;
        }
        sink.add_range(&segment.name, segment.vmaddr, segment.vmsize, segment.fileoff, segment.filesize)?;
    }
    Ok(())
}

fn read_macho_sections(sink: &mut RangeSink) -> Result<()> {
    let macho = MachOFile::parse(sink.file.data())?;
    for segment in &macho.segments {
        for section in &segment.sections {
            let vmsize = if segment.name == "__DWARF" {0} else {section.size};
            sink.add_range(&section.name, section.addr, vmsize, section.offset, section.filesize())?;
        }
    }
    Ok(())
}

fn read_macho_symbols(sink: &mut RangeSink) -> Result<()> {
    let macho = MachOFile::parse(sink.file.data())?;
    let symtab = match &macho.symtab {
        Some(symtab) => symtab,
        None => return Ok(()),
    };

    // nlist entries carry no size. Sort the defined symbols by address and
    // size each one by the distance to the next, clamped to the end of the
    // section it lives in.
    let mut section_ends: Vec<(u64, u64)> = Vec::new(); // (addr, end), sorted
    for segment in &macho.segments {
        for section in &segment.sections {
            section_ends.push((section.addr, section.addr + section.size));
        }
    }
    section_ends.sort_unstable();

    let mut syms: Vec<(u64, &str)> = Vec::new();
    for i in 0..symtab.nsyms {
        let off = symtab.symoff + i * NLIST_SIZE;
        let n_strx = u32_at(macho.data, off)? as u64;
        let n_type = bytes(macho.data, off + 4, 1)?[0];
        let n_sect = bytes(macho.data, off + 5, 1)?[0];
        let n_value = u64_at(macho.data, off + 8)?;

        if n_type & N_STAB != 0 {
            continue; // debugging entry
        }
        if n_type & N_TYPE != N_SECT || n_sect == 0 {
            continue; // undefined or absolute
        }
        let name = macho.strtab_name(n_strx)?;
        if name.is_empty() {
            continue;
        }
        syms.push((n_value, name));
    }
    syms.sort_unstable_by_key(|&(addr, _)| addr);

    let data_source = sink.data_source;
    for i in 0..syms.len() {
        let (addr, name) = syms[i];
        let section_end = match section_ends.iter().rfind(|&&(start, end)| start <= addr && addr < end) {
            Some(&(_, end)) => end,
            None => continue,
        };
        let mut end = section_end;
        for &(next_addr, _) in &syms[i + 1..] {
            if next_addr > addr {
                end = end.min(next_addr);
                break;
            }
        }
        if end <= addr {
            continue;
        }
        let name = match data_source {
            DataSource::CppSymbols => demangle(name),
            DataSource::CppSymbolsStripped => strip_name(&demangle(name)).to_string(),
            _ => name.to_string(),
        };
        sink.add_vm_range_allow_alias(addr, end - addr, &name)?;
    }
    Ok(())
}

fn read_macho_dwarf<'a>(macho: &MachOFile<'a>, dwarf: &mut dwarf::File<'a>) -> Result<()> {
    for segment in &macho.segments {
        if segment.name != "__DWARF" {
            continue;
        }
        for section in &segment.sections {
            let contents = bytes(macho.data, section.offset, section.filesize())?;
            match section.name.as_str() {
                "__debug_info" => dwarf.debug_info = contents,
                "__debug_abbrev" => dwarf.debug_abbrev = contents,
                "__debug_str" => dwarf.debug_str = contents,
                "__debug_line" => dwarf.debug_line = contents,
                "__debug_aranges" => dwarf.debug_aranges = contents,
                "__debug_ranges" => dwarf.debug_ranges = contents,
                _ => (),
            }
        }
    }
    Ok(())
}

pub fn process_base_map(sink: &mut RangeSink) -> Result<()> {
    read_macho_segments(sink)
}

pub fn process_file(sinks: &mut [RangeSink]) -> Result<()> {
    for sink in sinks {
        match sink.data_source {
            DataSource::Segments => read_macho_segments(sink)?,
            DataSource::Sections => read_macho_sections(sink)?,
            DataSource::Symbols | DataSource::CppSymbols | DataSource::CppSymbolsStripped => read_macho_symbols(sink)?,
            DataSource::ArchiveMembers => {
                return err!(Unsupported, "archive members are not a thing in Mach-O files");
            }
            DataSource::CompileUnits => {
                let macho = MachOFile::parse(sink.file.data())?;
                let mut dwarf = dwarf::File::default();
                read_macho_dwarf(&macho, &mut dwarf)?;
                dwarf::read_compile_units(&dwarf, sink)?;
            }
            DataSource::Inlines => {
                let macho = MachOFile::parse(sink.file.data())?;
                let mut dwarf = dwarf::File::default();
                read_macho_dwarf(&macho, &mut dwarf)?;
                dwarf::read_inlines(&dwarf, sink, true)?;
            }
        }

        // The load commands themselves.
        let macho = MachOFile::parse(sink.file.data())?;
        let header = macho.header_region();
        sink.add_file_range("[Mach-O Headers]", header.0, header.1)?;
        // Anything not claimed above.
        sink.add_file_range("[Unmapped]", 0, sink.file.data().len() as u64)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::macho::*;
    use crate::input::*;
    use crate::range_map::*;

    fn w32(d: &mut [u8], off: usize, val: u32) { d[off..off + 4].copy_from_slice(&val.to_le_bytes()); }
    fn w64(d: &mut [u8], off: usize, val: u64) { d[off..off + 8].copy_from_slice(&val.to_le_bytes()); }

    // Header + one __TEXT segment (one __text section) + LC_SYMTAB with two
    // function symbols.
    fn simple_macho() -> Vec<u8> {
        let mut d = vec![0u8; 0x800];
        w32(&mut d, 0, MH_MAGIC_64);
        w32(&mut d, 4, 0x0100_0007); // CPU_TYPE_X86_64
        w32(&mut d, 12, 2); // MH_EXECUTE
        w32(&mut d, 16, 2); // ncmds
        w32(&mut d, 20, (72 + 80 + 24) as u32); // sizeofcmds

        // LC_SEGMENT_64 __TEXT
        let seg = 32;
        w32(&mut d, seg, 0x19);
        w32(&mut d, seg + 4, 72 + 80);
        d[seg + 8..seg + 14].copy_from_slice(b"__TEXT");
        w64(&mut d, seg + 24, 0x1000); // vmaddr
        w64(&mut d, seg + 32, 0x100); // vmsize
        w64(&mut d, seg + 40, 0x400); // fileoff
        w64(&mut d, seg + 48, 0x100); // filesize
        w32(&mut d, seg + 64, 1); // nsects

        // section __text
        let sect = seg + 72;
        d[sect..sect + 6].copy_from_slice(b"__text");
        d[sect + 16..sect + 22].copy_from_slice(b"__TEXT");
        w64(&mut d, sect + 32, 0x1000); // addr
        w64(&mut d, sect + 40, 0x80); // size
        w32(&mut d, sect + 48, 0x400); // offset

        // LC_SYMTAB
        let sym = sect + 80;
        w32(&mut d, sym, 0x2);
        w32(&mut d, sym + 4, 24);
        w32(&mut d, sym + 8, 0x600); // symoff
        w32(&mut d, sym + 12, 2); // nsyms
        w32(&mut d, sym + 16, 0x640); // stroff
        w32(&mut d, sym + 20, 16); // strsize

        // nlist_64 entries
        w32(&mut d, 0x600, 1); // n_strx -> "_main"
        d[0x604] = 0x0f; // N_SECT | N_EXT
        d[0x605] = 1;
        w64(&mut d, 0x608, 0x1000);
        w32(&mut d, 0x610, 7); // n_strx -> "_helper"
        d[0x614] = 0x0e; // N_SECT
        d[0x615] = 1;
        w64(&mut d, 0x618, 0x1040);

        d[0x641..0x646].copy_from_slice(b"_main");
        d[0x647..0x64e].copy_from_slice(b"_helper");
        d
    }

    #[test]
    fn parse_macho() {
        let data = simple_macho();
        let macho = MachOFile::parse(&data).unwrap();
        assert_eq!(macho.segments.len(), 1);
        assert_eq!(macho.segments[0].name, "__TEXT");
        assert_eq!(macho.segments[0].sections[0].name, "__text");
        assert_eq!(macho.segments[0].sections[0].addr, 0x1000);
        assert!(macho.symtab.is_some());
    }

    #[test]
    fn rejects_unsupported_flavors() {
        let mut d = vec![0u8; 0x20];
        w32(&mut d, 0, MH_MAGIC_32);
        assert!(MachOFile::parse(&d).unwrap_err().is_unsupported());
        w32(&mut d, 0, FAT_MAGIC);
        assert!(MachOFile::parse(&d).unwrap_err().is_unsupported());
    }

    #[test]
    fn symbols_are_sized_by_successor() {
        let data = simple_macho();
        let file = InputFile::from_contents("test.macho", data);

        let munger = NameMunger::new();
        let mut base_sink = RangeSink::new(&file, DataSource::Segments, None);
        base_sink.add_output(&munger);
        process_base_map(&mut base_sink).unwrap();
        let base = base_sink.into_maps().pop().unwrap();

        let mut sink = RangeSink::new(&file, DataSource::Symbols, Some(&base));
        sink.add_output(&munger);
        read_macho_symbols(&mut sink).unwrap();
        let map = sink.into_maps().pop().unwrap();
        let entries: Vec<(u64, u64, String)> = map.vm.iter().map(|(&s, e)| (s, e.end, e.label.clone())).collect();
        assert_eq!(entries, vec![
            (0x1000, 0x1040, "_main".to_string()),   // sized by next symbol
            (0x1040, 0x1080, "_helper".to_string()), // sized by section end
        ]);
    }
}
