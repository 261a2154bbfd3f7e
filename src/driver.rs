use crate::{*, error::*, input::*, log::*, output::*, range_map::*, rollup::*, sink::*};
use std::collections::BTreeMap;

// Orchestration: data source registry, option records, and the per-file scan
// that wires producers into the accounting engine.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SortBy {
    VmSize,
    FileSize,
    Both,
}

#[derive(Clone, Debug)]
pub struct CustomDataSource {
    pub name: String,
    pub base_data_source: String,
    pub rewrites: Vec<(String, String)>, // (pattern, replacement)
}

#[derive(Clone, Debug)]
pub struct Options {
    pub filenames: Vec<String>,
    pub base_filenames: Vec<String>,
    pub data_sources: Vec<String>,
    pub custom_data_sources: Vec<CustomDataSource>,
    pub max_rows_per_level: u64,
    pub sort_by: SortBy,
    pub verbose_level: i32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            filenames: Vec::new(),
            base_filenames: Vec::new(),
            data_sources: Vec::new(),
            custom_data_sources: Vec::new(),
            max_rows_per_level: 20,
            sort_by: SortBy::Both,
            verbose_level: 0,
        }
    }
}

pub fn parse_sort_by(value: &str) -> Result<SortBy> {
    match value {
        "vm" => Ok(SortBy::VmSize),
        "file" => Ok(SortBy::FileSize),
        "both" => Ok(SortBy::Both),
        _ => err!(Usage, "unknown sort key: {} (expected vm, file, or both)", value),
    }
}

pub struct DataSourceDefinition {
    pub number: DataSource,
    pub name: &'static str,
    pub description: &'static str,
}

pub const DATA_SOURCES: &[DataSourceDefinition] = &[
    DataSourceDefinition {number: DataSource::ArchiveMembers, name: "armembers", description: "the .o files in a .a file"},
    DataSourceDefinition {number: DataSource::CppSymbols, name: "cppsymbols", description: "demangled C++ symbols"},
    DataSourceDefinition {number: DataSource::CppSymbolsStripped, name: "cppxsyms", description: "demangled C++ symbols, stripped to remove function parameters"},
    DataSourceDefinition {number: DataSource::CompileUnits, name: "compileunits", description: "source file for the .o file (translation unit). requires debug info"},
    // Not a real data source; it's spliced into the key tuples by position.
    DataSourceDefinition {number: DataSource::Inlines, name: "inputfiles", description: "the filename specified on the command line"},
    DataSourceDefinition {number: DataSource::Inlines, name: "inlines", description: "source line/file where inlined code came from. requires debug info"},
    DataSourceDefinition {number: DataSource::Sections, name: "sections", description: "object file section"},
    DataSourceDefinition {number: DataSource::Segments, name: "segments", description: "load commands in the binary"},
    DataSourceDefinition {number: DataSource::Symbols, name: "symbols", description: "symbols from symbol table"},
];

// The closed set of container formats. Producers for each live in their
// module; this enum is just the dispatch point.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileKind {
    Elf, // includes ar archives of ELF objects
    MachO,
}

impl FileKind {
    pub fn identify(data: &[u8]) -> Option<FileKind> {
        if data.starts_with(b"\x7fELF") || elf::is_archive_file(data) {
            return Some(FileKind::Elf);
        }
        if macho::is_macho_file(data) {
            return Some(FileKind::MachO);
        }
        None
    }

    pub fn process_base_map(self, sink: &mut RangeSink) -> Result<()> {
        match self {
            FileKind::Elf => elf::process_base_map(sink),
            FileKind::MachO => macho::process_base_map(sink),
        }
    }

    pub fn process_file(self, sinks: &mut [RangeSink]) -> Result<()> {
        match self {
            FileKind::Elf => elf::process_file(sinks),
            FileKind::MachO => macho::process_file(sinks),
        }
    }
}

// Text-format options record loaded by -c. One "key: value" directive per
// line, '#' comments, repeated keys append, plus custom_data_source blocks:
//
//   filename: "a.out"
//   data_source: "bazel"
//   custom_data_source {
//     name: "bazel"
//     base_data_source: "compileunits"
//     rewrite {
//       pattern: "^third_party/(\\w+)"
//       replacement: "$1"
//     }
//   }
pub fn parse_options_file(text: &str, options: &mut Options) -> Result<()> {
    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0usize;
    while i < lines.len() {
        let line = lines[i].trim();
        i += 1;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("custom_data_source") {
            if rest.trim() != "{" {
                return err!(Usage, "expected '{{' after custom_data_source on line {}", i);
            }
            let source = parse_custom_data_source(&lines, &mut i)?;
            options.custom_data_sources.push(source);
        } else if let Some(value) = line.strip_prefix("filename:") {
            options.filenames.push(unquote(value));
        } else if let Some(value) = line.strip_prefix("base_filename:") {
            options.base_filenames.push(unquote(value));
        } else if let Some(value) = line.strip_prefix("data_source:") {
            options.data_sources.push(unquote(value));
        } else if let Some(value) = line.strip_prefix("max_rows_per_level:") {
            options.max_rows_per_level = value.trim().parse()
                .map_err(|_| error!(Usage, "invalid max_rows_per_level: {}", value.trim()))?;
        } else if let Some(value) = line.strip_prefix("sort_by:") {
            options.sort_by = parse_sort_by(&unquote(value))?;
        } else if let Some(value) = line.strip_prefix("verbose_level:") {
            options.verbose_level = value.trim().parse()
                .map_err(|_| error!(Usage, "invalid verbose_level: {}", value.trim()))?;
        } else {
            return err!(Usage, "unknown directive on line {}: {}", i, line);
        }
    }
    Ok(())
}

fn parse_custom_data_source(lines: &[&str], i: &mut usize) -> Result<CustomDataSource> {
    let mut source = CustomDataSource {name: String::new(), base_data_source: String::new(), rewrites: Vec::new()};
    loop {
        if *i >= lines.len() {
            return err!(Usage, "unterminated custom_data_source block");
        }
        let line = lines[*i].trim();
        *i += 1;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "}" {
            return Ok(source);
        }
        if let Some(rest) = line.strip_prefix("rewrite") {
            if rest.trim() != "{" {
                return err!(Usage, "expected '{{' after rewrite on line {}", *i);
            }
            let mut pattern = String::new();
            let mut replacement = String::new();
            loop {
                if *i >= lines.len() {
                    return err!(Usage, "unterminated rewrite block");
                }
                let line = lines[*i].trim();
                *i += 1;
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if line == "}" {
                    break;
                }
                if let Some(value) = line.strip_prefix("pattern:") {
                    pattern = unquote(value);
                } else if let Some(value) = line.strip_prefix("replacement:") {
                    replacement = unquote(value);
                } else {
                    return err!(Usage, "unknown directive in rewrite on line {}: {}", *i, line);
                }
            }
            source.rewrites.push((pattern, replacement));
        } else if let Some(value) = line.strip_prefix("name:") {
            source.name = unquote(value);
        } else if let Some(value) = line.strip_prefix("base_data_source:") {
            source.base_data_source = unquote(value);
        } else {
            return err!(Usage, "unknown directive in custom_data_source on line {}: {}", *i, line);
        }
    }
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let inner = &value[1..value.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('\\') => out.push('\\'),
                    Some('"') => out.push('"'),
                    // Leave unrecognized escapes alone; regex patterns are full
                    // of them.
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => out.push('\\'),
                }
            } else {
                out.push(c);
            }
        }
        out
    } else {
        value.to_string()
    }
}

// A data source the user can select: a producer tag plus the name rewrites to
// apply to everything it emits.
#[derive(Debug)]
pub struct ConfiguredDataSource {
    pub number: DataSource,
    pub munger: NameMunger,
}

pub fn build_source_registry(options: &Options) -> Result<BTreeMap<String, ConfiguredDataSource>> {
    let mut all_known: BTreeMap<String, ConfiguredDataSource> = BTreeMap::new();
    for def in DATA_SOURCES {
        all_known.insert(def.name.to_string(), ConfiguredDataSource {number: def.number, munger: NameMunger::new()});
    }

    for custom in &options.custom_data_sources {
        let base = match all_known.get(&custom.base_data_source) {
            None => return err!(NotFound, "custom data source '{}': no such base source '{}'", custom.name, custom.base_data_source),
            Some(base) => base,
        };
        if !base.munger.is_empty() {
            return err!(Usage, "custom data source '{}' tries to depend on custom data source '{}'", custom.name, custom.base_data_source);
        }
        let number = base.number;
        let mut munger = NameMunger::new();
        for (pattern, replacement) in &custom.rewrites {
            munger.add_regex(pattern, replacement)?;
        }
        all_known.insert(custom.name.clone(), ConfiguredDataSource {number, munger});
    }
    Ok(all_known)
}

fn vm_maps(maps: &[DualMap]) -> Vec<&RangeMap> {
    maps.iter().map(|m| &m.vm).collect()
}

fn file_maps(maps: &[DualMap]) -> Vec<&RangeMap> {
    maps.iter().map(|m| &m.file).collect()
}

fn overlay_into_rollup(maps: &[DualMap], filename: &str, filename_position: i32, rollup: &mut Rollup) -> Result<()> {
    RangeMap::compute_rollup(&vm_maps(maps), filename, filename_position, |keys, start, end| {
        rollup.add_sizes(keys, end - start, true)
    })?;
    RangeMap::compute_rollup(&file_maps(maps), filename, filename_position, |keys, start, end| {
        rollup.add_sizes(keys, end - start, false)
    })?;
    Ok(())
}

fn print_maps(maps: &[&RangeMap], filename: &str, filename_position: i32) {
    let mut last = 0u64;
    let _ = RangeMap::compute_rollup(maps, filename, filename_position, |keys, start, end| {
        if start > last {
            eprintln!("[0x{:x}, 0x{:x}] NO ENTRY", last, start);
        }
        eprintln!("[0x{:x}, 0x{:x}] {}", start, end, keys.join(", "));
        last = end;
        Ok(())
    });
}

// One input binary: build the base map, run every selected producer against
// it, then overlay all the maps (per coordinate space) into the rollup.
pub fn scan_and_rollup_file(file: &InputFile, sources: &[&ConfiguredDataSource], filename_position: i32, rollup: &mut Rollup) -> Result<()> {
    let kind = match FileKind::identify(file.data()) {
        Some(kind) => kind,
        None => return err!(Unsupported, "unknown file type for file '{}'", file.filename),
    };

    let empty_munger = NameMunger::new();
    let mut base_sink = RangeSink::new(file, DataSource::Segments, None);
    base_sink.add_output(&empty_munger);
    kind.process_base_map(&mut base_sink)?;
    let mut base = base_sink.into_maps().pop().unwrap();
    // Force-label every file byte nothing else claimed, so no byte escapes
    // accounting. Producers must not touch the base map from here on.
    base.file.add_range(0, file.data().len() as u64, NO_NAME)?;

    let mut sinks: Vec<RangeSink> = sources.iter().map(|source| {
        let mut sink = RangeSink::new(file, source.number, Some(&base));
        sink.add_output(&source.munger);
        sink
    }).collect();
    kind.process_file(&mut sinks)?;
    let source_maps: Vec<DualMap> = sinks.into_iter().map(|sink| sink.into_maps().pop().unwrap()).collect();

    let mut maps: Vec<DualMap> = Vec::with_capacity(source_maps.len() + 1);
    maps.push(base);
    maps.extend(source_maps);

    overlay_into_rollup(&maps, &file.filename, filename_position, rollup)?;

    if verbose_level() >= 1 {
        eprintln!("FILE MAP:");
        print_maps(&file_maps(&maps), &file.filename, filename_position);
        eprintln!("VM MAP:");
        print_maps(&vm_maps(&maps), &file.filename, filename_position);
    }
    Ok(())
}

pub fn run(options: &Options) -> Result<RollupOutput> {
    set_verbose_level(options.verbose_level);

    if options.filenames.is_empty() {
        return err!(Usage, "must specify at least one file");
    }
    if options.max_rows_per_level < 1 {
        return err!(Usage, "max_rows_per_level must be at least 1");
    }

    let all_known = build_source_registry(options)?;

    let data_sources: Vec<String> = if options.data_sources.is_empty() {
        vec!["sections".to_string()]
    } else {
        options.data_sources.clone()
    };

    let mut output = RollupOutput::new();
    let mut filename_position: i32 = -1;
    let mut selected: Vec<&ConfiguredDataSource> = Vec::new();
    for name in &data_sources {
        if name == "inputfiles" {
            // Position is relative to the maps vector, whose slot 0 is the
            // base map.
            filename_position = selected.len() as i32 + 1;
            output.add_data_source_name(name);
            continue;
        }
        match all_known.get(name) {
            None => return err!(NotFound, "no such data source: {}", name),
            Some(source) => {
                output.add_data_source_name(name);
                selected.push(source);
            }
        }
    }

    let mut rollup = Rollup::default();
    for filename in &options.filenames {
        let file = InputFile::open(filename)?;
        scan_and_rollup_file(&file, &selected, filename_position, &mut rollup)?;
    }

    if !options.base_filenames.is_empty() {
        let mut base = Rollup::default();
        for filename in &options.base_filenames {
            let file = InputFile::open(filename)?;
            scan_and_rollup_file(&file, &selected, filename_position, &mut base)?;
        }
        rollup.subtract(&base);
        rollup.create_diff_mode_rollup_output(Some(&base), options, &mut output)?;
    } else {
        rollup.create_rollup_output(options, &mut output)?;
    }

    Ok(output)
}
