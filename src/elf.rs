use crate::{*, error::*, demangle::*, dwarf, input::*, sink::*};
use bitflags::bitflags;

// ELF and ar-archive parsing, and the producers that turn them into labeled
// ranges. Handles both ELF classes and both endiannesses, which is why headers
// are read field by field instead of memcpy'd into libc structs.

pub const EI_NIDENT: usize = 16;
pub const ELFCLASS32: u8 = 1;
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ELFDATA2MSB: u8 = 2;

pub const ET_REL: u16 = 1;

pub const SHN_UNDEF: u32 = 0;
pub const SHN_XINDEX: u16 = 0xffff;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_NOBITS: u32 = 8;

pub const SHF_WRITE: u64 = 0x1;
pub const SHF_ALLOC: u64 = 0x2;
pub const SHF_EXECINSTR: u64 = 0x4;

pub const PT_LOAD: u32 = 1;

pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXEC = 0x1;
        const WRITE = 0x2;
        const READ = 0x4;
    }
}

// Endian-aware fixed-offset field reads. Every accessor bounds-checks; a short
// read anywhere in the headers is a Truncated error, not a panic.
#[derive(Clone, Copy)]
struct Reader<'a> {
    data: &'a [u8],
    little_endian: bool,
}

impl<'a> Reader<'a> {
    fn bytes(&self, off: u64, n: u64) -> Result<&'a [u8]> {
        let end = match off.checked_add(n) {
            Some(e) => e,
            None => return err!(IntegerOverflow, "offset 0x{:x} + 0x{:x} overflows", off, n),
        };
        if end > self.data.len() as u64 {
            return err!(Truncated, "read of 0x{:x} bytes at offset 0x{:x} is out of bounds (file has 0x{:x})", n, off, self.data.len());
        }
        Ok(&self.data[off as usize..end as usize])
    }

    fn u8(&self, off: u64) -> Result<u8> {
        Ok(self.bytes(off, 1)?[0])
    }
    fn u16(&self, off: u64) -> Result<u16> {
        let b: [u8; 2] = self.bytes(off, 2)?.try_into().unwrap();
        Ok(if self.little_endian {u16::from_le_bytes(b)} else {u16::from_be_bytes(b)})
    }
    fn u32(&self, off: u64) -> Result<u32> {
        let b: [u8; 4] = self.bytes(off, 4)?.try_into().unwrap();
        Ok(if self.little_endian {u32::from_le_bytes(b)} else {u32::from_be_bytes(b)})
    }
    fn u64(&self, off: u64) -> Result<u64> {
        let b: [u8; 8] = self.bytes(off, 8)?.try_into().unwrap();
        Ok(if self.little_endian {u64::from_le_bytes(b)} else {u64::from_be_bytes(b)})
    }
}

// Headers normalized to the 64-bit shapes; 32-bit inputs are widened on read.
#[derive(Clone, Copy, Debug, Default)]
pub struct ElfHeader {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ElfSectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ElfSegmentHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ElfSymbol {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

fn read_ehdr(r: Reader, is_64: bool) -> Result<ElfHeader> {
    if is_64 {
        Ok(ElfHeader {
            e_type: r.u16(16)?, e_machine: r.u16(18)?, e_version: r.u32(20)?,
            e_entry: r.u64(24)?, e_phoff: r.u64(32)?, e_shoff: r.u64(40)?,
            e_flags: r.u32(48)?, e_ehsize: r.u16(52)?, e_phentsize: r.u16(54)?,
            e_phnum: r.u16(56)?, e_shentsize: r.u16(58)?, e_shnum: r.u16(60)?,
            e_shstrndx: r.u16(62)?,
        })
    } else {
        Ok(ElfHeader {
            e_type: r.u16(16)?, e_machine: r.u16(18)?, e_version: r.u32(20)?,
            e_entry: r.u32(24)? as u64, e_phoff: r.u32(28)? as u64, e_shoff: r.u32(32)? as u64,
            e_flags: r.u32(36)?, e_ehsize: r.u16(40)?, e_phentsize: r.u16(42)?,
            e_phnum: r.u16(44)?, e_shentsize: r.u16(46)?, e_shnum: r.u16(48)?,
            e_shstrndx: r.u16(50)?,
        })
    }
}

fn read_shdr(r: Reader, off: u64, is_64: bool) -> Result<ElfSectionHeader> {
    if is_64 {
        Ok(ElfSectionHeader {
            sh_name: r.u32(off)?, sh_type: r.u32(off + 4)?, sh_flags: r.u64(off + 8)?,
            sh_addr: r.u64(off + 16)?, sh_offset: r.u64(off + 24)?, sh_size: r.u64(off + 32)?,
            sh_link: r.u32(off + 40)?, sh_info: r.u32(off + 44)?,
            sh_addralign: r.u64(off + 48)?, sh_entsize: r.u64(off + 56)?,
        })
    } else {
        Ok(ElfSectionHeader {
            sh_name: r.u32(off)?, sh_type: r.u32(off + 4)?, sh_flags: r.u32(off + 8)? as u64,
            sh_addr: r.u32(off + 12)? as u64, sh_offset: r.u32(off + 16)? as u64, sh_size: r.u32(off + 20)? as u64,
            sh_link: r.u32(off + 24)?, sh_info: r.u32(off + 28)?,
            sh_addralign: r.u32(off + 32)? as u64, sh_entsize: r.u32(off + 36)? as u64,
        })
    }
}

fn read_phdr(r: Reader, off: u64, is_64: bool) -> Result<ElfSegmentHeader> {
    if is_64 {
        Ok(ElfSegmentHeader {
            p_type: r.u32(off)?, p_flags: r.u32(off + 4)?, p_offset: r.u64(off + 8)?,
            p_vaddr: r.u64(off + 16)?, p_paddr: r.u64(off + 24)?, p_filesz: r.u64(off + 32)?,
            p_memsz: r.u64(off + 40)?, p_align: r.u64(off + 48)?,
        })
    } else {
        Ok(ElfSegmentHeader {
            p_type: r.u32(off)?, p_offset: r.u32(off + 4)? as u64, p_vaddr: r.u32(off + 8)? as u64,
            p_paddr: r.u32(off + 12)? as u64, p_filesz: r.u32(off + 16)? as u64, p_memsz: r.u32(off + 20)? as u64,
            p_flags: r.u32(off + 24)?, p_align: r.u32(off + 28)? as u64,
        })
    }
}

fn read_sym(r: Reader, off: u64, is_64: bool) -> Result<ElfSymbol> {
    if is_64 {
        Ok(ElfSymbol {
            st_name: r.u32(off)?, st_info: r.u8(off + 4)?, st_other: r.u8(off + 5)?,
            st_shndx: r.u16(off + 6)?, st_value: r.u64(off + 8)?, st_size: r.u64(off + 16)?,
        })
    } else {
        Ok(ElfSymbol {
            st_name: r.u32(off)?, st_value: r.u32(off + 4)? as u64, st_size: r.u32(off + 8)? as u64,
            st_info: r.u8(off + 12)?, st_other: r.u8(off + 13)?, st_shndx: r.u16(off + 14)?,
        })
    }
}

// A view of one ELF image. `base_offset` is where this image starts within the
// input file (nonzero for archive members), so every file range handed to a
// sink is already in whole-input coordinates.
pub struct ElfFile<'a> {
    data: &'a [u8],
    pub base_offset: u64,
    pub is_64: bool,
    pub little_endian: bool,
    pub header: ElfHeader,
    pub section_count: u64,
    pub section_string_index: u64,
    pub header_region: (u64, u64),
    pub section_headers: (u64, u64),
    pub segment_headers: (u64, u64),
}

pub struct ElfSection<'a> {
    pub header: ElfSectionHeader,
    pub contents: &'a [u8],     // empty for SHT_NOBITS
    pub file_range: (u64, u64), // whole-input file coordinates
    little_endian: bool,
    is_64: bool,
}

pub struct ElfSegment<'a> {
    pub header: ElfSegmentHeader,
    pub contents: &'a [u8],
    pub file_range: (u64, u64),
}

impl<'a> ElfFile<'a> {
    // Returns None if the data doesn't start with the ELF magic; errors only on
    // data that claims to be ELF but can't be read.
    pub fn parse(data: &'a [u8], base_offset: u64) -> Result<Option<ElfFile<'a>>> {
        if data.len() < EI_NIDENT || &data[..4] != b"\x7fELF" {
            return Ok(None);
        }

        let is_64 = match data[4] {
            ELFCLASS32 => false,
            ELFCLASS64 => true,
            class => return err!(Malformed, "unexpected ELF class: {}", class),
        };
        let little_endian = match data[5] {
            ELFDATA2LSB => true,
            ELFDATA2MSB => false,
            encoding => return err!(Malformed, "unexpected ELF data encoding: {}", encoding),
        };

        let r = Reader {data, little_endian};
        let header = read_ehdr(r, is_64)?;

        // ELF extension: when e_shnum or e_shstrndx overflow their 16-bit
        // fields, the real values live in section header 0.
        let mut section0 = None;
        if header.e_shoff > 0 && (data.len() as u64) > header.e_shoff.saturating_add(header.e_shentsize as u64) {
            section0 = Some(read_shdr(r, header.e_shoff, is_64)?);
        }

        let mut section_count = header.e_shnum as u64;
        let mut section_string_index = header.e_shstrndx as u64;
        if let Some(section0) = section0 {
            if section_count == 0 {
                section_count = section0.sh_size;
            }
            if header.e_shstrndx == SHN_XINDEX {
                section_string_index = section0.sh_link as u64;
            }
        }

        let mut elf = ElfFile {
            data, base_offset, is_64, little_endian, header, section_count, section_string_index,
            header_region: (0, 0), section_headers: (0, 0), segment_headers: (0, 0),
        };
        elf.header_region = elf.region(0, header.e_ehsize as u64)?;
        elf.section_headers = elf.region(header.e_shoff, (header.e_shentsize as u64).checked_mul(section_count)
            .ok_or_else(|| error!(IntegerOverflow, "section header table size overflows"))?)?;
        elf.segment_headers = elf.region(header.e_phoff, header.e_phentsize as u64 * header.e_phnum as u64)?;
        Ok(Some(elf))
    }

    pub fn data(&self) -> &'a [u8] { self.data }

    pub fn entire_file(&self) -> (u64, u64) {
        (self.base_offset, self.data.len() as u64)
    }

    fn reader(&self) -> Reader<'a> {
        Reader {data: self.data, little_endian: self.little_endian}
    }

    // A (offset, size) pair in whole-input coordinates, bounds-checked against
    // this image.
    fn region(&self, start: u64, n: u64) -> Result<(u64, u64)> {
        let end = match start.checked_add(n) {
            Some(e) => e,
            None => return err!(IntegerOverflow, "ELF region [0x{:x}, +0x{:x}) overflows", start, n),
        };
        if end > self.data.len() as u64 {
            return err!(Truncated, "ELF region [0x{:x}, +0x{:x}) out of bounds", start, n);
        }
        Ok((self.base_offset + start, n))
    }

    pub fn section(&self, index: u64) -> Result<ElfSection<'a>> {
        if index >= self.section_count {
            return err!(Malformed, "tried to read section {}, but there are only {}", index, self.section_count);
        }
        let off = self.header.e_shoff + self.header.e_shentsize as u64 * index;
        let header = read_shdr(self.reader(), off, self.is_64)?;

        let (contents, file_range) = if header.sh_type == SHT_NOBITS {
            (&[][..], (self.base_offset + header.sh_offset, 0))
        } else {
            let range = self.region(header.sh_offset, header.sh_size)?;
            (&self.data[header.sh_offset as usize..(header.sh_offset + header.sh_size) as usize], range)
        };

        Ok(ElfSection {header, contents, file_range, little_endian: self.little_endian, is_64: self.is_64})
    }

    pub fn segment(&self, index: u64) -> Result<ElfSegment<'a>> {
        if index >= self.header.e_phnum as u64 {
            return err!(Malformed, "segment {} doesn't exist, only {} segments", index, self.header.e_phnum);
        }
        let off = self.header.e_phoff + self.header.e_phentsize as u64 * index;
        let header = read_phdr(self.reader(), off, self.is_64)?;
        let range = self.region(header.p_offset, header.p_filesz)?;
        let contents = &self.data[header.p_offset as usize..(header.p_offset + header.p_filesz) as usize];
        Ok(ElfSegment {header, contents, file_range: range})
    }
}

impl<'a> ElfSection<'a> {
    // For SHT_STRTAB sections.
    pub fn read_name(&self, index: u32) -> Result<&'a str> {
        if index == SHN_UNDEF || index as usize >= self.contents.len() {
            return err!(Malformed, "can't read index {} from strtab, total size is {}", index, self.contents.len());
        }
        let tail = &self.contents[index as usize..];
        let len = match tail.iter().position(|&b| b == 0) {
            Some(len) => len,
            None => return err!(Malformed, "no NUL terminator found in strtab"),
        };
        Ok(std::str::from_utf8(&tail[..len])?)
    }

    // For SHT_SYMTAB sections.
    pub fn symbol_count(&self) -> Result<u64> {
        if self.header.sh_entsize == 0 {
            return err!(Malformed, "sh_entsize is zero");
        }
        Ok(self.contents.len() as u64 / self.header.sh_entsize)
    }

    pub fn read_symbol(&self, index: u64) -> Result<ElfSymbol> {
        let r = Reader {data: self.contents, little_endian: self.little_endian};
        read_sym(r, self.header.sh_entsize * index, self.is_64)
    }
}

// ar archives (static libraries), System V / GNU variant.

pub const AR_MAGIC: &[u8] = b"!<arch>\n";
const AR_HEADER_SIZE: u64 = 60;

pub fn is_archive_file(data: &[u8]) -> bool {
    data.starts_with(AR_MAGIC)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArMemberKind {
    SymbolTable,       // the archive's symbol index
    LongFilenameTable, // storage for long filenames, not a real member
    Normal,
}

pub struct ArMember<'a> {
    pub kind: ArMemberKind,
    pub filename: String, // only meaningful for Normal members
    pub header_range: (u64, u64),
    pub contents: &'a [u8],
    pub contents_offset: u64,
}

pub struct ArMemberReader<'a> {
    data: &'a [u8],
    pos: u64,
    long_filenames: &'a [u8],
}

fn parse_ar_size(field: &[u8]) -> Result<u64> {
    let s = std::str::from_utf8(field)?.trim_end();
    match s.parse::<u64>() {
        Ok(n) => Ok(n),
        Err(_) => err!(Format, "couldn't convert string '{}' to integer", s),
    }
}

impl<'a> ArMemberReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {data, pos: AR_MAGIC.len() as u64, long_filenames: &[]}
    }

    pub fn read_member(&mut self) -> Result<Option<ArMember<'a>>> {
        // Header layout: file_id[16] mtime[12] owner[6] group[6] mode[8] size[10] end[2].
        if self.data.len() as u64 - self.pos < AR_HEADER_SIZE {
            return Ok(None);
        }
        let header_off = self.pos;
        let header = &self.data[self.pos as usize..(self.pos + AR_HEADER_SIZE) as usize];
        self.pos += AR_HEADER_SIZE;

        let file_id = &header[0..16];
        let size = parse_ar_size(&header[48..58])?;
        if self.data.len() as u64 - self.pos < size {
            return err!(Truncated, "premature end of archive file");
        }
        let contents_offset = self.pos;
        let contents = &self.data[self.pos as usize..(self.pos + size) as usize];
        self.pos += size;
        // Members are padded to even offsets with "\n".
        if self.pos % 2 == 1 && self.pos < self.data.len() as u64 {
            self.pos += 1;
        }

        let mut kind = ArMemberKind::Normal;
        let mut filename = String::new();
        if file_id[0] == b'/' {
            // Special filename, internal to the format.
            if file_id[1] == b' ' {
                kind = ArMemberKind::SymbolTable;
            } else if file_id[1] == b'/' {
                kind = ArMemberKind::LongFilenameTable;
                self.long_filenames = contents;
            } else if file_id[1].is_ascii_digit() {
                let digits: Vec<u8> = file_id[1..].iter().copied().take_while(|b| b.is_ascii_digit()).collect();
                let offset = parse_ar_size(&digits)? as usize;
                if offset >= self.long_filenames.len() {
                    return Ok(None);
                }
                let tail = &self.long_filenames[offset..];
                let end = match tail.iter().position(|&b| b == b'/') {
                    Some(end) => end,
                    None => return Ok(None),
                };
                filename = String::from_utf8_lossy(&tail[..end]).into_owned();
            } else {
                return Ok(None); // unexpected special filename
            }
        } else {
            // Normal filename, slash-terminated.
            let slash = match file_id.iter().position(|&b| b == b'/') {
                Some(s) => s,
                None => {
                    eprintln!("warning: BSD-style ar archives are not supported");
                    return Ok(None);
                }
            };
            filename = String::from_utf8_lossy(&file_id[..slash]).into_owned();
        }

        Ok(Some(ArMember {kind, filename, header_range: (header_off, AR_HEADER_SIZE), contents, contents_offset}))
    }
}

// Driving producers over an input that is either one ELF file or an archive of
// them.

fn maybe_add_file_range(sink: &mut Option<&mut RangeSink>, label: &str, range: (u64, u64)) -> Result<()> {
    if let Some(sink) = sink {
        sink.add_file_range(label, range.0, range.1)?;
    }
    Ok(())
}

fn on_elf_file<F>(elf: &ElfFile, filename: &str, index_base: u64, sink: &mut Option<&mut RangeSink>, func: &mut F) -> Result<()>
where F: FnMut(&ElfFile, &str, u64, Option<&mut RangeSink>) -> Result<()> {
    func(elf, filename, index_base, sink.as_deref_mut())?;

    // Added *after* running the callback, so where there is overlap the
    // producer's own annotations take precedence.
    maybe_add_file_range(sink, "[ELF Headers]", elf.header_region)?;
    maybe_add_file_range(sink, "[ELF Headers]", elf.section_headers)?;
    maybe_add_file_range(sink, "[ELF Headers]", elf.segment_headers)?;

    // Parts of the file not claimed by anything above.
    maybe_add_file_range(sink, "[Unmapped]", elf.entire_file())?;
    Ok(())
}

pub fn for_each_elf<F>(file: &InputFile, mut sink: Option<&mut RangeSink>, mut func: F) -> Result<()>
where F: FnMut(&ElfFile, &str, u64, Option<&mut RangeSink>) -> Result<()> {
    let data = file.data();
    if is_archive_file(data) {
        let mut index_base = 0u64;
        maybe_add_file_range(&mut sink, "[AR Headers]", (0, AR_MAGIC.len() as u64))?;
        let mut reader = ArMemberReader::new(data);
        while let Some(member) = reader.read_member()? {
            maybe_add_file_range(&mut sink, "[AR Headers]", member.header_range)?;
            match member.kind {
                ArMemberKind::Normal => {
                    match ElfFile::parse(member.contents, member.contents_offset)? {
                        Some(elf) => {
                            on_elf_file(&elf, &member.filename, index_base, &mut sink, &mut func)?;
                            index_base += elf.section_count;
                        }
                        None => maybe_add_file_range(&mut sink, "[AR Non-ELF Member File]", (member.contents_offset, member.contents.len() as u64))?,
                    }
                }
                ArMemberKind::SymbolTable => {
                    maybe_add_file_range(&mut sink, "[AR Symbol Table]", (member.contents_offset, member.contents.len() as u64))?;
                }
                ArMemberKind::LongFilenameTable => {
                    maybe_add_file_range(&mut sink, "[AR Headers]", (member.contents_offset, member.contents.len() as u64))?;
                }
            }
        }
    } else {
        match ElfFile::parse(data, 0)? {
            Some(elf) => on_elf_file(&elf, &file.filename, 0, &mut sink, &mut func)?,
            None => return err!(Malformed, "not an ELF or archive file: {}", file.filename),
        }
    }
    Ok(())
}

pub fn is_object_file(data: &[u8]) -> bool {
    if is_archive_file(data) {
        return true;
    }
    match ElfFile::parse(data, 0) {
        Ok(Some(elf)) => elf.header.e_type == ET_REL,
        _ => false,
    }
}

fn check_not_object(source: &str, sink: &RangeSink) -> Result<()> {
    if is_object_file(sink.file.data()) {
        return err!(Unsupported, "can't use data source '{}' on object files (only binaries and shared libraries)", source);
    }
    Ok(())
}

// For object files, addresses are relative to the section they live in. Pack
// the section index into the high bits so sections don't collide:
// 24 bits of index (up to 16M symbols with -ffunction-sections), 40 bits of
// address (up to 1TB per section).
fn to_vm_addr(addr: u64, ndx: u64, is_object: bool) -> u64 {
    if is_object {
        (ndx << 40) | addr
    } else {
        addr
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ReportSectionsBy {
    Name,
    Flags,
    Filename,
}

fn do_read_elf_sections(sink: &mut RangeSink, report_by: ReportSectionsBy) -> Result<()> {
    let file = sink.file;
    let is_object = is_object_file(file.data());
    for_each_elf(file, Some(sink), |elf, filename, index_base, sink| {
        let sink = sink.unwrap();
        if elf.section_count == 0 {
            return Ok(());
        }

        let section_names = elf.section(elf.section_string_index)?;
        if section_names.header.sh_type != SHT_STRTAB {
            return err!(Malformed, "section string index pointed to non-strtab");
        }

        for i in 1..elf.section_count {
            let section = elf.section(i)?;
            let header = &section.header;
            if header.sh_name == SHN_UNDEF {
                return Ok(());
            }
            let name = section_names.read_name(header.sh_name)?;

            let size = header.sh_size;
            let filesize = if header.sh_type == SHT_NOBITS {0} else {size};
            let vmsize = if header.sh_flags & SHF_ALLOC != 0 {size} else {0};
            let full_addr = to_vm_addr(header.sh_addr, index_base + i, is_object);

            match report_by {
                ReportSectionsBy::Flags => {
                    let mut name_from_flags = String::from("Section [");
                    if header.sh_flags & SHF_ALLOC != 0 {
                        name_from_flags.push('A');
                    }
                    if header.sh_flags & SHF_WRITE != 0 {
                        name_from_flags.push('W');
                    }
                    if header.sh_flags & SHF_EXECINSTR != 0 {
                        name_from_flags.push('X');
                    }
                    name_from_flags.push(']');
                    sink.add_range(&name_from_flags, full_addr, vmsize, section.file_range.0, filesize)?;
                }
                ReportSectionsBy::Name => {
                    sink.add_range(name, full_addr, vmsize, section.file_range.0, filesize)?;
                }
                ReportSectionsBy::Filename => {
                    sink.add_range(filename, full_addr, vmsize, section.file_range.0, filesize)?;
                }
            }
        }

        if report_by == ReportSectionsBy::Filename {
            // Claim the unmapped parts of this member for its filename too.
            let entire = elf.entire_file();
            sink.add_file_range(filename, entire.0, entire.1)?;
        }
        Ok(())
    })
}

fn read_elf_segments(sink: &mut RangeSink) -> Result<()> {
    if is_object_file(sink.file.data()) {
        // Object files don't have segments, but flag-based pseudo-segments are
        // a useful report when -ffunction-sections/-fdata-sections makes the
        // per-section report unreadable.
        return do_read_elf_sections(sink, ReportSectionsBy::Flags);
    }

    let file = sink.file;
    for_each_elf(file, Some(sink), |elf, _filename, _index_base, sink| {
        let sink = sink.unwrap();
        for i in 0..elf.header.e_phnum as u64 {
            let segment = elf.segment(i)?;
            let header = &segment.header;
            if header.p_type != PT_LOAD {
                continue;
            }

            let flags = SegmentFlags::from_bits_truncate(header.p_flags);
            let mut name = String::from("LOAD [");
            if flags.contains(SegmentFlags::READ) {
                name.push('R');
            }
            if flags.contains(SegmentFlags::WRITE) {
                name.push('W');
            }
            if flags.contains(SegmentFlags::EXEC) {
                name.push('X');
            }
            name.push(']');

            sink.add_range(&name, header.p_vaddr, header.p_memsz, segment.file_range.0, segment.file_range.1)?;
        }
        Ok(())
    })
}

fn read_elf_symbols(sink: &mut RangeSink) -> Result<()> {
    let file = sink.file;
    let is_object = is_object_file(file.data());
    let data_source = sink.data_source;

    for_each_elf(file, Some(sink), |elf, _filename, index_base, sink| {
        let sink = sink.unwrap();
        for i in 1..elf.section_count {
            let section = elf.section(i)?;
            if section.header.sh_type != SHT_SYMTAB {
                continue;
            }

            let symbol_count = section.symbol_count()?;
            let strtab = elf.section(section.header.sh_link as u64)?;
            if strtab.header.sh_type != SHT_STRTAB {
                return err!(Malformed, "symtab section pointed to non-strtab section");
            }

            for j in 1..symbol_count {
                let sym = section.read_symbol(j)?;
                let sym_type = sym.st_info & 0xf;
                if sym_type != STT_OBJECT && sym_type != STT_FUNC {
                    continue;
                }
                if sym.st_size == 0 {
                    continue;
                }

                let name = strtab.read_name(sym.st_name)?;
                let full_addr = to_vm_addr(sym.st_value, index_base + sym.st_shndx as u64, is_object);
                let name = match data_source {
                    DataSource::CppSymbols => demangle(name),
                    DataSource::CppSymbolsStripped => strip_name(&demangle(name)).to_string(),
                    _ => name.to_string(),
                };
                sink.add_vm_range_allow_alias(full_addr, sym.st_size, &name)?;
            }
        }
        Ok(())
    })
}

// ELF binaries carry their debug info inline; hand the relevant section slices
// to the DWARF reader.
fn read_dwarf_sections<'a>(elf: &ElfFile<'a>, dwarf: &mut dwarf::File<'a>) -> Result<()> {
    dwarf.little_endian = elf.little_endian;

    let section_names = elf.section(elf.section_string_index)?;
    if section_names.header.sh_type != SHT_STRTAB {
        return err!(Malformed, "section string index pointed to non-strtab");
    }

    for i in 1..elf.section_count {
        let section = elf.section(i)?;
        if section.header.sh_name == SHN_UNDEF {
            return Ok(());
        }
        match section_names.read_name(section.header.sh_name)? {
            ".debug_aranges" => dwarf.debug_aranges = section.contents,
            ".debug_str" => dwarf.debug_str = section.contents,
            ".debug_info" => dwarf.debug_info = section.contents,
            ".debug_abbrev" => dwarf.debug_abbrev = section.contents,
            ".debug_line" => dwarf.debug_line = section.contents,
            ".debug_line_str" => dwarf.debug_line_str = section.contents,
            ".debug_str_offsets" => dwarf.debug_str_offsets = section.contents,
            ".debug_addr" => dwarf.debug_addr = section.contents,
            ".debug_ranges" => dwarf.debug_ranges = section.contents,
            ".debug_rnglists" => dwarf.debug_rnglists = section.contents,
            _ => (),
        }
    }
    Ok(())
}

pub fn process_base_map(sink: &mut RangeSink) -> Result<()> {
    if is_object_file(sink.file.data()) {
        // Object files have no segments; sections are the canonical covering.
        do_read_elf_sections(sink, ReportSectionsBy::Name)
    } else {
        read_elf_segments(sink)
    }
}

pub fn process_file(sinks: &mut [RangeSink]) -> Result<()> {
    for sink in sinks {
        match sink.data_source {
            DataSource::Segments => read_elf_segments(sink)?,
            DataSource::Sections => do_read_elf_sections(sink, ReportSectionsBy::Name)?,
            DataSource::Symbols | DataSource::CppSymbols | DataSource::CppSymbolsStripped => read_elf_symbols(sink)?,
            DataSource::ArchiveMembers => do_read_elf_sections(sink, ReportSectionsBy::Filename)?,
            DataSource::CompileUnits => {
                check_not_object("compileunits", sink)?;
                let data = sink.file.data();
                let elf = match ElfFile::parse(data, 0)? {
                    Some(elf) => elf,
                    None => return err!(Malformed, "not an ELF file: {}", sink.file.filename),
                };
                let mut dwarf = dwarf::File::default();
                read_dwarf_sections(&elf, &mut dwarf)?;
                dwarf::read_compile_units(&dwarf, sink)?;
            }
            DataSource::Inlines => {
                check_not_object("inlines", sink)?;
                let data = sink.file.data();
                let elf = match ElfFile::parse(data, 0)? {
                    Some(elf) => elf,
                    None => return err!(Malformed, "not an ELF file: {}", sink.file.filename),
                };
                let mut dwarf = dwarf::File::default();
                read_dwarf_sections(&elf, &mut dwarf)?;
                dwarf::read_inlines(&dwarf, sink, true)?;
            }
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use crate::elf::*;
    use crate::elf::testelf::*;
    use crate::range_map::*;

    fn entries(map: &RangeMap) -> Vec<(u64, u64, String)> {
        map.iter().map(|(&s, e)| (s, e.end, e.label.clone())).collect()
    }

    #[test]
    fn parse_elf64() {
        let data = simple_elf64();
        let elf = ElfFile::parse(&data, 0).unwrap().unwrap();
        assert!(elf.is_64 && elf.little_endian);
        assert_eq!(elf.section_count, 7);
        assert_eq!(elf.header.e_phnum, 2);

        let names = elf.section(elf.section_string_index).unwrap();
        assert_eq!(names.read_name(elf.section(1).unwrap().header.sh_name).unwrap(), ".text");
        assert_eq!(names.read_name(elf.section(3).unwrap().header.sh_name).unwrap(), ".bss");

        let text = elf.section(1).unwrap();
        assert_eq!(text.header.sh_addr, 0x1000);
        assert_eq!(text.file_range, (0x400, 0x100));

        let bss = elf.section(3).unwrap();
        assert_eq!(bss.header.sh_type, SHT_NOBITS);
        assert!(bss.contents.is_empty());

        let seg = elf.segment(0).unwrap();
        assert_eq!(seg.header.p_vaddr, 0x1000);
        assert_eq!(seg.file_range, (0x400, 0x100));
    }

    #[test]
    fn parse_elf_symbols() {
        let data = simple_elf64();
        let elf = ElfFile::parse(&data, 0).unwrap().unwrap();
        let symtab = elf.section(4).unwrap();
        assert_eq!(symtab.symbol_count().unwrap(), 3);
        let strtab = elf.section(5).unwrap();
        let foo = symtab.read_symbol(1).unwrap();
        assert_eq!(strtab.read_name(foo.st_name).unwrap(), "foo");
        assert_eq!(foo.st_value, 0x1000);
        assert_eq!(foo.st_size, 0x40);
    }

    #[test]
    fn non_elf_is_not_an_error() {
        assert!(ElfFile::parse(b"hello world, definitely not elf", 0).unwrap().is_none());
        assert!(ElfFile::parse(b"", 0).unwrap().is_none());
    }

    #[test]
    fn parse_elf32_big_endian_header() {
        let mut d = vec![0u8; 0x40];
        d[0..4].copy_from_slice(b"\x7fELF");
        d[4] = 1; // ELFCLASS32
        d[5] = 2; // ELFDATA2MSB
        d[16..18].copy_from_slice(&2u16.to_be_bytes()); // e_type
        d[18..20].copy_from_slice(&8u16.to_be_bytes()); // e_machine (MIPS)
        d[40..42].copy_from_slice(&52u16.to_be_bytes()); // e_ehsize
        let elf = ElfFile::parse(&d, 0).unwrap().unwrap();
        assert!(!elf.is_64 && !elf.little_endian);
        assert_eq!(elf.header.e_type, 2);
        assert_eq!(elf.header.e_machine, 8);
        assert_eq!(elf.header_region, (0, 52));
    }

    #[test]
    fn segments_producer() {
        let data = simple_elf64();
        let file = crate::input::InputFile::from_contents("test.bin", data);
        let munger = crate::sink::NameMunger::new();
        let mut sink = crate::sink::RangeSink::new(&file, crate::sink::DataSource::Segments, None);
        sink.add_output(&munger);
        process_base_map(&mut sink).unwrap();
        let map = sink.into_maps().pop().unwrap();
        assert_eq!(entries(&map.vm), vec![
            (0x1000, 0x1100, "LOAD [RX]".to_string()),
            (0x2000, 0x2040, "LOAD [RW]".to_string()), // file-backed prefix
            (0x2040, 0x3080, "LOAD [RW]".to_string()), // zero-fill tail
        ]);
        assert_eq!(entries(&map.file), vec![
            (0x400, 0x500, "LOAD [RX]".to_string()),
            (0x600, 0x640, "LOAD [RW]".to_string()),
        ]);
        // The common prefix of the RW segment must translate; the bss tail must not.
        assert_eq!(map.vm.translate(0x2010), Some(0x610));
        assert_eq!(map.vm.translate(0x3000), None);
    }

    #[test]
    fn archive_member_walk() {
        // Archive with one ELF member and one text member, long filename table
        // in between.
        let elf = simple_elf64();
        let mut ar: Vec<u8> = Vec::new();
        ar.extend_from_slice(AR_MAGIC);
        // long filename table: "libvery_long_name.o/\n"
        let longnames = b"libvery_long_name.o/\n";
        ar.extend_from_slice(format!("//{:<14}{:<12}{:<6}{:<6}{:<8}{:<10}`\n", "", "", "", "", "", longnames.len()).as_bytes());
        ar.extend_from_slice(longnames);
        if ar.len() % 2 == 1 {
            ar.push(b'\n');
        }
        // ELF member with a long name reference
        ar.extend_from_slice(format!("/0{:<14}{:<12}{:<6}{:<6}{:<8}{:<10}`\n", "", "", "", "", "", elf.len()).as_bytes());
        let elf_off = ar.len() as u64;
        ar.extend_from_slice(&elf);
        if ar.len() % 2 == 1 {
            ar.push(b'\n');
        }
        // short-named text member
        ar.extend_from_slice(format!("note.txt/{:<7}{:<12}{:<6}{:<6}{:<8}{:<10}`\n", "", "", "", "", "", 5).as_bytes());
        ar.extend_from_slice(b"hello");

        let mut reader = ArMemberReader::new(&ar);
        let m1 = reader.read_member().unwrap().unwrap();
        assert_eq!(m1.kind, ArMemberKind::LongFilenameTable);
        let m2 = reader.read_member().unwrap().unwrap();
        assert_eq!(m2.kind, ArMemberKind::Normal);
        assert_eq!(m2.filename, "libvery_long_name.o");
        assert_eq!(m2.contents_offset, elf_off);
        assert!(ElfFile::parse(m2.contents, m2.contents_offset).unwrap().is_some());
        let m3 = reader.read_member().unwrap().unwrap();
        assert_eq!(m3.filename, "note.txt");
        assert_eq!(m3.contents, b"hello");
        assert!(reader.read_member().unwrap().is_none());
    }

    #[test]
    fn object_file_detection() {
        let mut data = simple_elf64();
        assert!(!is_object_file(&data));
        w16(&mut data, 16, 1); // ET_REL
        assert!(is_object_file(&data));
        assert!(is_object_file(b"!<arch>\n"));
    }
}
