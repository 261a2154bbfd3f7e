use crate::{*, error::*, sink::*};
use gimli::{EndianSlice, RunTimeEndian, SectionId};
use std::collections::{HashMap, HashSet};

// DWARF-backed producers: compileunits (which translation unit owns each VM
// range) and inlines (which source file/line the code at each VM range came
// from). The container parser hands over raw section slices; gimli does the
// structural reading.

pub struct File<'a> {
    pub debug_info: &'a [u8],
    pub debug_abbrev: &'a [u8],
    pub debug_str: &'a [u8],
    pub debug_line: &'a [u8],
    pub debug_line_str: &'a [u8],
    pub debug_aranges: &'a [u8],
    pub debug_ranges: &'a [u8],
    pub debug_rnglists: &'a [u8],
    pub debug_str_offsets: &'a [u8],
    pub debug_addr: &'a [u8],
    pub little_endian: bool,
}

impl<'a> Default for File<'a> {
    fn default() -> Self {
        Self {
            debug_info: &[], debug_abbrev: &[], debug_str: &[], debug_line: &[], debug_line_str: &[],
            debug_aranges: &[], debug_ranges: &[], debug_rnglists: &[], debug_str_offsets: &[], debug_addr: &[],
            little_endian: true,
        }
    }
}

type Slice<'a> = EndianSlice<'a, RunTimeEndian>;

fn load_dwarf<'a>(file: &File<'a>) -> Result<gimli::Dwarf<Slice<'a>>> {
    let endian = if file.little_endian {RunTimeEndian::Little} else {RunTimeEndian::Big};
    let dwarf = gimli::Dwarf::load(|id: SectionId| -> Result<Slice<'a>> {
        let data: &'a [u8] = match id {
            SectionId::DebugInfo => file.debug_info,
            SectionId::DebugAbbrev => file.debug_abbrev,
            SectionId::DebugStr => file.debug_str,
            SectionId::DebugLine => file.debug_line,
            SectionId::DebugLineStr => file.debug_line_str,
            SectionId::DebugAranges => file.debug_aranges,
            SectionId::DebugRanges => file.debug_ranges,
            SectionId::DebugRngLists => file.debug_rnglists,
            SectionId::DebugStrOffsets => file.debug_str_offsets,
            SectionId::DebugAddr => file.debug_addr,
            _ => &[],
        };
        Ok(EndianSlice::new(data, endian))
    })?;
    Ok(dwarf)
}

// Attribute VM ranges to translation unit names. .debug_aranges exists
// precisely to answer "which unit owns this address"; units the compiler
// didn't emit aranges for fall back to the unit DIE's low_pc/high_pc/ranges.
pub fn read_compile_units(file: &File, sink: &mut RangeSink) -> Result<()> {
    if file.debug_info.is_empty() {
        return err!(Dwarf, "missing debug info (compileunits requires a binary built with -g)");
    }
    let dwarf = load_dwarf(file)?;

    let mut units: Vec<(gimli::Unit<Slice<'_>>, String)> = Vec::new();
    let mut unit_by_offset: HashMap<usize, usize> = HashMap::new();
    let mut iter = dwarf.units();
    while let Some(unit_header) = iter.next()? {
        let offset = match unit_header.offset().as_debug_info_offset() {
            Some(offset) => offset.0,
            None => continue,
        };
        let unit = dwarf.unit(unit_header)?;
        let name = match &unit.name {
            Some(name) => String::from_utf8_lossy(name.slice()).into_owned(),
            None => continue, // anonymous unit, nothing useful to attribute to
        };
        unit_by_offset.insert(offset, units.len());
        units.push((unit, name));
    }

    let mut have_aranges: HashSet<usize> = HashSet::new();
    let mut headers = dwarf.debug_aranges.headers();
    while let Some(header) = headers.next()? {
        let unit_idx = match unit_by_offset.get(&header.debug_info_offset().0) {
            Some(&idx) => idx,
            None => continue,
        };
        have_aranges.insert(unit_idx);
        let name = &units[unit_idx].1;
        let mut entries = header.entries();
        while let Some(entry) = entries.next()? {
            if entry.address() == 0 {
                // Zero-address entries are relocations that didn't survive
                // linking (gc'd sections); they'd pile up on top of each other.
                continue;
            }
            sink.add_vm_range_ignore_duplicate(entry.address(), entry.length(), name)?;
        }
    }

    for (idx, (unit, name)) in units.iter().enumerate() {
        if have_aranges.contains(&idx) {
            continue;
        }
        let mut ranges = dwarf.unit_ranges(unit)?;
        while let Some(range) = ranges.next()? {
            if range.begin == 0 || range.end <= range.begin {
                continue;
            }
            sink.add_vm_range_ignore_duplicate(range.begin, range.end - range.begin, name)?;
        }
    }
    Ok(())
}

fn row_label<'a>(dwarf: &gimli::Dwarf<Slice<'a>>, unit: &gimli::Unit<Slice<'a>>, header: &gimli::LineProgramHeader<Slice<'a>>, row: &gimli::LineRow, include_line: bool) -> Result<String> {
    let mut path = String::new();
    match row.file(header) {
        Some(file) => {
            if let Some(dir) = file.directory(header) {
                let dir = dwarf.attr_string(unit, dir)?;
                let dir = String::from_utf8_lossy(dir.slice()).into_owned();
                if !dir.is_empty() {
                    path.push_str(&dir);
                    if !path.ends_with('/') {
                        path.push('/');
                    }
                }
            }
            let name = dwarf.attr_string(unit, file.path_name())?;
            path.push_str(&String::from_utf8_lossy(name.slice()));
        }
        None => path.push_str("[None]"), // file index out of range
    }
    if include_line {
        let line = row.line().map_or(0, |line| line.get());
        Ok(format!("{}:{}", path, line))
    } else {
        Ok(path)
    }
}

// Attribute VM ranges to the source file (and line, if requested) the code at
// that address was generated from, by walking each unit's line number program.
// Each row labels [row.address, next row.address) within its sequence.
pub fn read_inlines(file: &File, sink: &mut RangeSink, include_line: bool) -> Result<()> {
    if file.debug_line.is_empty() {
        return err!(Dwarf, "missing debug info (inlines requires a binary built with -g)");
    }
    let dwarf = load_dwarf(file)?;

    let mut iter = dwarf.units();
    while let Some(unit_header) = iter.next()? {
        let unit = dwarf.unit(unit_header)?;
        let program = match unit.line_program.clone() {
            Some(program) => program,
            None => continue,
        };

        let mut rows = program.rows();
        let mut pending: Option<(u64, String)> = None;
        let mut skip_sequence = false;
        while let Some((header, row)) = rows.next_row()? {
            if row.address() == 0 {
                // Sequences starting at address zero are gc'd code whose
                // relocations were lost; they overlap real code a lot.
                skip_sequence = true;
            }
            if skip_sequence {
                if row.end_sequence() {
                    skip_sequence = false;
                    pending = None;
                }
                continue;
            }

            if let Some((start, label)) = pending.take() {
                if row.address() > start {
                    sink.add_vm_range_ignore_duplicate(start, row.address() - start, &label)?;
                }
            }
            if row.end_sequence() {
                continue;
            }
            let label = row_label(&dwarf, &unit, header, row, include_line)?;
            pending = Some((row.address(), label));
        }
    }
    Ok(())
}

// Hand-encoded DWARF sections for tests (DWARF 4 unit headers, DWARF 2
// aranges/line headers, all little-endian).
#[cfg(test)]
mod testdwarf {
    fn uleb(out: &mut Vec<u8>, mut val: u64) {
        loop {
            let mut byte = (val & 0x7f) as u8;
            val >>= 7;
            if val != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if val == 0 {
                break;
            }
        }
    }

    // One compile unit: DW_TAG_compile_unit with DW_AT_name (string),
    // DW_AT_low_pc, DW_AT_high_pc (addr). Returns the unit bytes.
    fn unit(name: &str, low_pc: u64, high_pc: u64) -> Vec<u8> {
        let mut die: Vec<u8> = Vec::new();
        uleb(&mut die, 1); // abbrev code
        die.extend_from_slice(name.as_bytes());
        die.push(0);
        die.extend_from_slice(&low_pc.to_le_bytes());
        die.extend_from_slice(&high_pc.to_le_bytes());

        let mut out: Vec<u8> = Vec::new();
        let length = 2 + 4 + 1 + die.len(); // version + abbrev_offset + address_size + DIE
        out.extend_from_slice(&(length as u32).to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes()); // DWARF version
        out.extend_from_slice(&0u32.to_le_bytes()); // abbrev offset
        out.push(8); // address size
        out.extend_from_slice(&die);
        out
    }

    pub fn debug_abbrev() -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        uleb(&mut out, 1); // abbrev code 1
        uleb(&mut out, 0x11); // DW_TAG_compile_unit
        out.push(0); // no children
        uleb(&mut out, 0x03); uleb(&mut out, 0x08); // DW_AT_name, DW_FORM_string
        uleb(&mut out, 0x11); uleb(&mut out, 0x01); // DW_AT_low_pc, DW_FORM_addr
        uleb(&mut out, 0x12); uleb(&mut out, 0x01); // DW_AT_high_pc, DW_FORM_addr
        uleb(&mut out, 0); uleb(&mut out, 0); // end of attributes
        uleb(&mut out, 0); // end of abbrevs
        out
    }

    // Two units: "one.c" (covered by aranges below), "two.c" (no aranges,
    // low/high pc only). Returns (debug_info, offset_of_unit_one).
    pub fn debug_info() -> (Vec<u8>, usize) {
        let mut out = unit("one.c", 0, 0);
        let unit2 = unit("two.c", 0x2000, 0x2040);
        out.extend_from_slice(&unit2);
        (out, 0)
    }

    // Aranges for unit one: [0x1000, 0x1040).
    pub fn debug_aranges(debug_info_offset: usize) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes()); // length, patched below
        out.extend_from_slice(&2u16.to_le_bytes()); // version
        out.extend_from_slice(&(debug_info_offset as u32).to_le_bytes());
        out.push(8); // address size
        out.push(0); // segment size
        out.extend_from_slice(&[0u8; 4]); // pad to tuple alignment (16)
        out.extend_from_slice(&0x1000u64.to_le_bytes());
        out.extend_from_slice(&0x40u64.to_le_bytes());
        out.extend_from_slice(&[0u8; 16]); // terminator tuple
        let length = (out.len() - 4) as u32;
        out[0..4].copy_from_slice(&length.to_le_bytes());
        out
    }

    // A DWARF 2 line program for one file "a.c":
    //   0x1000 line 1, 0x1020 line 5, end of sequence at 0x1040.
    pub fn debug_line() -> Vec<u8> {
        let mut program: Vec<u8> = Vec::new();
        // DW_LNE_set_address 0x1000
        program.push(0);
        uleb(&mut program, 9);
        program.push(0x02);
        program.extend_from_slice(&0x1000u64.to_le_bytes());
        program.push(0x01); // DW_LNS_copy: row (0x1000, line 1)
        program.push(0x03); // DW_LNS_advance_line
        program.push(4); // sleb +4 -> line 5
        program.push(0x02); // DW_LNS_advance_pc
        uleb(&mut program, 0x20);
        program.push(0x01); // DW_LNS_copy: row (0x1020, line 5)
        program.push(0x02); // DW_LNS_advance_pc
        uleb(&mut program, 0x20);
        // DW_LNE_end_sequence at 0x1040
        program.push(0);
        uleb(&mut program, 1);
        program.push(0x01);

        let mut header: Vec<u8> = Vec::new();
        header.push(1); // minimum_instruction_length
        header.push(1); // default_is_stmt
        header.push(0xfb); // line_base = -5
        header.push(14); // line_range
        header.push(13); // opcode_base
        header.extend_from_slice(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]); // standard opcode lengths
        header.push(0); // no include directories
        header.extend_from_slice(b"a.c\0"); // file 1
        uleb(&mut header, 0); // dir index
        uleb(&mut header, 0); // mtime
        uleb(&mut header, 0); // length
        header.push(0); // end of file table

        let mut out: Vec<u8> = Vec::new();
        let unit_length = 2 + 4 + header.len() + program.len(); // version + header_length + rest
        out.extend_from_slice(&(unit_length as u32).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes()); // version
        out.extend_from_slice(&(header.len() as u32).to_le_bytes()); // header_length
        out.extend_from_slice(&header);
        out.extend_from_slice(&program);
        out
    }

    // A unit whose line program lives at offset 0 of .debug_line.
    pub fn debug_info_with_line_program() -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        let mut die: Vec<u8> = Vec::new();
        uleb(&mut die, 1);
        die.extend_from_slice(b"a.c\0"); // DW_AT_name
        die.extend_from_slice(&0u32.to_le_bytes()); // DW_AT_stmt_list, DW_FORM_sec_offset

        let length = 2 + 4 + 1 + die.len();
        out.extend_from_slice(&(length as u32).to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(8);
        out.extend_from_slice(&die);
        out
    }

    pub fn debug_abbrev_with_stmt_list() -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        uleb(&mut out, 1);
        uleb(&mut out, 0x11); // DW_TAG_compile_unit
        out.push(0);
        uleb(&mut out, 0x03); uleb(&mut out, 0x08); // DW_AT_name, DW_FORM_string
        uleb(&mut out, 0x10); uleb(&mut out, 0x17); // DW_AT_stmt_list, DW_FORM_sec_offset
        uleb(&mut out, 0); uleb(&mut out, 0);
        uleb(&mut out, 0);
        out
    }
}

#[cfg(test)]
mod tests {
    use crate::dwarf::*;
    use crate::input::*;
    use crate::range_map::*;

    fn test_sink_base() -> DualMap {
        let mut base = DualMap::default();
        base.vm.add_dual_range(0x1000, 0x2000, Some(0x400), "LOAD").unwrap();
        base.file.add_dual_range(0x400, 0x2000, Some(0x1000), "LOAD").unwrap();
        base
    }

    fn vm_entries(map: &DualMap) -> Vec<(u64, u64, String)> {
        map.vm.iter().map(|(&s, e)| (s, e.end, e.label.clone())).collect()
    }

    #[test]
    fn compile_units_from_aranges_and_die_fallback() {
        let (info, unit1_offset) = testdwarf::debug_info();
        let abbrev = testdwarf::debug_abbrev();
        let aranges = testdwarf::debug_aranges(unit1_offset);
        let dwarf = File {
            debug_info: &info,
            debug_abbrev: &abbrev,
            debug_aranges: &aranges,
            ..Default::default()
        };

        let input = InputFile::from_contents("test", Vec::new());
        let base = test_sink_base();
        let munger = NameMunger::new();
        let mut sink = RangeSink::new(&input, DataSource::CompileUnits, Some(&base));
        sink.add_output(&munger);
        read_compile_units(&dwarf, &mut sink).unwrap();

        let map = sink.into_maps().pop().unwrap();
        assert_eq!(vm_entries(&map), vec![
            (0x1000, 0x1040, "one.c".to_string()),
            (0x2000, 0x2040, "two.c".to_string()),
        ]);
        // Translated through the base map into file space.
        assert_eq!(map.file.find_containing(0x400).unwrap().1.label, "one.c");
    }

    #[test]
    fn inlines_from_line_program() {
        let mut info: Vec<u8> = Vec::new();
        {
            // unit referencing the line program at offset 0
            let out = testdwarf::debug_info_with_line_program();
            info.extend_from_slice(&out);
        }
        let abbrev = testdwarf::debug_abbrev_with_stmt_list();
        let line = testdwarf::debug_line();
        let dwarf = File {
            debug_info: &info,
            debug_abbrev: &abbrev,
            debug_line: &line,
            ..Default::default()
        };

        let input = InputFile::from_contents("test", Vec::new());
        let base = test_sink_base();
        let munger = NameMunger::new();
        let mut sink = RangeSink::new(&input, DataSource::Inlines, Some(&base));
        sink.add_output(&munger);
        read_inlines(&dwarf, &mut sink, true).unwrap();

        let map = sink.into_maps().pop().unwrap();
        assert_eq!(vm_entries(&map), vec![
            (0x1000, 0x1020, "a.c:1".to_string()),
            (0x1020, 0x1040, "a.c:5".to_string()),
        ]);
    }

    #[test]
    fn missing_debug_info_is_an_error() {
        let input = InputFile::from_contents("test", Vec::new());
        let base = test_sink_base();
        let munger = NameMunger::new();
        let mut sink = RangeSink::new(&input, DataSource::CompileUnits, Some(&base));
        sink.add_output(&munger);
        assert!(read_compile_units(&File::default(), &mut sink).is_err());
        assert!(read_inlines(&File::default(), &mut sink, true).is_err());
    }
}
