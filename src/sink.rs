use crate::{*, error::*, input::*, range_map::*};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSource {
    ArchiveMembers,
    CppSymbols,
    CppSymbolsStripped,
    CompileUnits,
    Inlines,
    Sections,
    Segments,
    Symbols,
}

impl DataSource {
    pub fn label(self) -> &'static str {
        match self {
            DataSource::ArchiveMembers => "armembers",
            DataSource::CppSymbols => "cppsymbols",
            DataSource::CppSymbolsStripped => "cppxsyms",
            DataSource::CompileUnits => "compileunits",
            DataSource::Inlines => "inlines",
            DataSource::Sections => "sections",
            DataSource::Segments => "segments",
            DataSource::Symbols => "symbols",
        }
    }
}

// Transforms input names according to the user's configuration (custom data
// sources are a base source plus a list of regex rewrites).
#[derive(Debug)]
pub struct NameMunger {
    regexes: Vec<(regex::Regex, String)>,
}

impl NameMunger {
    pub fn new() -> Self { Self {regexes: Vec::new()} }

    // Regexes are tried in order; only the first one that matches fires.
    pub fn add_regex(&mut self, pattern: &str, replacement: &str) -> Result<()> {
        let re = regex::Regex::new(pattern)?;
        self.regexes.push((re, replacement.to_string()));
        Ok(())
    }

    pub fn is_empty(&self) -> bool { self.regexes.is_empty() }

    pub fn munge(&self, name: &str) -> String {
        if name.starts_with('[') {
            // Reserved label, don't touch.
            return name.to_string();
        }
        for (re, replacement) in &self.regexes {
            if let Some(captures) = re.captures(name) {
                let mut out = String::new();
                captures.expand(replacement, &mut out);
                return out;
            }
        }
        name.to_string()
    }
}

// The write-facing facade producers push ranges into. Multiplexes each range
// to one or more output DualMaps, munging the name per output, and uses the
// base DualMap (the `translator`) to carry labels across the VM<->file
// boundary. The base map's own sink has no translator.
pub struct RangeSink<'a> {
    pub file: &'a InputFile,
    pub data_source: DataSource,
    translator: Option<&'a DualMap>,
    outputs: Vec<(DualMap, &'a NameMunger)>,
}

impl<'a> RangeSink<'a> {
    pub fn new(file: &'a InputFile, data_source: DataSource, translator: Option<&'a DualMap>) -> Self {
        Self {file, data_source, translator, outputs: Vec::new()}
    }

    pub fn add_output(&mut self, munger: &'a NameMunger) {
        self.outputs.push((DualMap::default(), munger));
    }

    pub fn into_maps(self) -> Vec<DualMap> {
        self.outputs.into_iter().map(|(map, _)| map).collect()
    }

    // File-space only. The range lands in each output's file map and, where
    // the translator covers it, fans out into the VM map. Without a
    // translator (i.e. while building the base map itself) this is a no-op;
    // the base map is populated through add_range() and the driver's final
    // [None] sweep.
    pub fn add_file_range(&mut self, name: &str, fileoff: u64, filesize: u64) -> Result<()> {
        verbose!(3, "[{}] add_file_range({}, 0x{:x}, 0x{:x})", self.data_source.label(), name, fileoff, filesize);
        for (map, munger) in &mut self.outputs {
            let label = munger.munge(name);
            if let Some(translator) = self.translator {
                map.file.add_range_with_translation(fileoff, filesize, &label, &translator.file, &mut map.vm)?;
            }
        }
        Ok(())
    }

    // VM-space entry point; must not be used to populate the base map.
    pub fn add_vm_range(&mut self, vmaddr: u64, vmsize: u64, name: &str) -> Result<()> {
        verbose!(3, "[{}] add_vm_range({}, 0x{:x}, 0x{:x})", self.data_source.label(), name, vmaddr, vmsize);
        let translator = self.translator.expect("VM ranges require a translator");
        for (map, munger) in &mut self.outputs {
            let label = munger.munge(name);
            map.vm.add_range_with_translation(vmaddr, vmsize, &label, &translator.vm, &mut map.file)?;
        }
        Ok(())
    }

    // Like add_vm_range(), but the same address may already carry a different
    // label (e.g. weak aliases in a symbol table); the new name is an alias of
    // the old and the overlap is not noteworthy.
    pub fn add_vm_range_allow_alias(&mut self, vmaddr: u64, vmsize: u64, name: &str) -> Result<()> {
        self.add_vm_range(vmaddr, vmsize, name)
    }

    // Like add_vm_range(), but duplicates are expected and ignored silently
    // (e.g. DWARF attributing the same address range to a source file twice).
    pub fn add_vm_range_ignore_duplicate(&mut self, vmaddr: u64, vmsize: u64, name: &str) -> Result<()> {
        self.add_vm_range(vmaddr, vmsize, name)
    }

    // Combined form. If vmsize or filesize is zero, the mapping doesn't exist
    // in that space (.bss has no file bytes, .debug_* has no VM presence).
    // The common prefix becomes a dual range on both sides; the remainder goes
    // into whichever space is larger with no translation.
    pub fn add_range(&mut self, name: &str, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64) -> Result<()> {
        verbose!(3, "[{}] add_range({}, 0x{:x}, 0x{:x}, 0x{:x}, 0x{:x})", self.data_source.label(), name, vmaddr, vmsize, fileoff, filesize);
        for (map, munger) in &mut self.outputs {
            let label = munger.munge(name);
            let common = vmsize.min(filesize);

            map.vm.add_dual_range(vmaddr, common, Some(fileoff), &label)?;
            map.file.add_dual_range(fileoff, common, Some(vmaddr), &label)?;

            map.vm.add_range(vmaddr + common, vmsize - common, &label)?;
            map.file.add_range(fileoff + common, filesize - common, &label)?;
        }
        Ok(())
    }
}
