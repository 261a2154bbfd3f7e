use crate::{*, error::*, driver::*, output::*};
use std::collections::HashMap;

// A Rollup is a hierarchical tally of sizes, keyed by the label tuples the
// overlay emits. Totals are signed so that diff mode can subtract a baseline;
// addresses and sizes at the boundary stay unsigned.

pub const OTHERS_LABEL: &str = "[Other]";

#[derive(Clone, Debug, PartialEq)]
pub struct RollupRow {
    pub name: String,
    pub vmsize: i64,
    pub filesize: i64,
    pub vm_percent: f64,
    pub file_percent: f64,
    pub sorted_children: Vec<RollupRow>,
    pub shrinking: Vec<RollupRow>,
    pub mixed: Vec<RollupRow>,
    // When false, sorted_children contains actual sizes and shrinking/mixed are
    // unused. When true, sorted_children contains entities that grew, and
    // shrinking/mixed hold entries that shrank or had one dimension grow while
    // the other shrank.
    pub diff_mode: bool,
}

impl RollupRow {
    pub fn new(name: &str) -> Self {
        Self {name: name.to_string(), vmsize: 0, filesize: 0, vm_percent: 0.0, file_percent: 0.0, sorted_children: Vec::new(), shrinking: Vec::new(), mixed: Vec::new(), diff_mode: false}
    }
}

fn sign_of(val: i64) -> i64 {
    if val < 0 { -1 } else if val > 0 { 1 } else { 0 }
}

pub fn checked_add(accum: &mut i64, val: i64) -> Result<()> {
    match accum.checked_add(val) {
        Some(x) => { *accum = x; Ok(()) }
        None => err!(IntegerOverflow, "integer overflow"),
    }
}

fn percent(part: i64, whole: i64) -> f64 {
    part as f64 / whole as f64 * 100.0
}

#[derive(Default, Clone)]
pub struct Rollup {
    vm_total: i64,
    file_total: i64,
    children: HashMap<String, Rollup>,
}

impl Rollup {
    pub fn vm_total(&self) -> i64 { self.vm_total }
    pub fn file_total(&self) -> i64 { self.file_total }
    pub fn child(&self, name: &str) -> Option<&Rollup> { self.children.get(name) }

    // Adds `size` bytes under names[1..] (names[0] is the base map's label,
    // which only partitions the address space and doesn't appear in the tree).
    pub fn add_sizes(&mut self, names: &[&str], size: u64, is_vmsize: bool) -> Result<()> {
        self.add_internal(names, 1, size, is_vmsize)
    }

    fn add_internal(&mut self, names: &[&str], i: usize, size: u64, is_vmsize: bool) -> Result<()> {
        let size = match i64::try_from(size) {
            Ok(x) => x,
            Err(_) => return err!(IntegerOverflow, "size 0x{:x} overflows signed accumulator", size),
        };
        if is_vmsize {
            checked_add(&mut self.vm_total, size)?;
        } else {
            checked_add(&mut self.file_total, size)?;
        }
        if i < names.len() {
            self.children.entry(names[i].to_string()).or_default().add_internal(names, i + 1, size as u64, is_vmsize)?;
        }
        Ok(())
    }

    // Subtract the values in `other` from this, descending into all children
    // present in either tree. Nodes can go negative and children present only
    // in `other` appear with negated totals.
    pub fn subtract(&mut self, other: &Rollup) {
        self.vm_total -= other.vm_total;
        self.file_total -= other.file_total;
        for (name, other_child) in &other.children {
            self.children.entry(name.clone()).or_default().subtract(other_child);
        }
    }

    pub fn create_rollup_output(&self, options: &Options, output: &mut RollupOutput) -> Result<()> {
        self.create_diff_mode_rollup_output(None, options, output)
    }

    pub fn create_diff_mode_rollup_output(&self, base: Option<&Rollup>, options: &Options, output: &mut RollupOutput) -> Result<()> {
        let row = &mut output.toplevel_row;
        row.vmsize = self.vm_total;
        row.filesize = self.file_total;
        row.vm_percent = 100.0;
        row.file_percent = 100.0;
        self.create_rows(row, base, options, true)
    }

    fn create_rows(&self, row: &mut RollupRow, base: Option<&Rollup>, options: &Options, is_toplevel: bool) -> Result<()> {
        if let Some(base) = base {
            row.vm_percent = percent(self.vm_total, base.vm_total);
            row.file_percent = percent(self.file_total, base.file_total);
            row.diff_mode = true;
        }

        let mut sorted_children: Vec<RollupRow> = Vec::new();
        let mut shrinking: Vec<RollupRow> = Vec::new();
        let mut mixed: Vec<RollupRow> = Vec::new();

        for (name, child) in &self.children {
            let vm_sign = sign_of(child.vm_total);
            let file_sign = sign_of(child.file_total);
            debug_assert!(vm_sign >= 0 && file_sign >= 0 || base.is_some());

            // Note: (0, +) counts as growing and (0, -) as shrinking; only a
            // genuine sign disagreement is "mixed".
            let bucket = if vm_sign + file_sign < 0 {
                &mut shrinking
            } else if vm_sign != file_sign && vm_sign + file_sign == 0 {
                &mut mixed
            } else {
                &mut sorted_children
            };

            if child.vm_total != 0 || child.file_total != 0 {
                let mut r = RollupRow::new(name);
                r.vmsize = child.vm_total;
                r.filesize = child.file_total;
                bucket.push(r);
            }
        }

        let parent_name = row.name.clone();
        let (parent_vm, parent_file) = (row.vmsize, row.filesize);
        self.compute_rows(&parent_name, parent_vm, parent_file, &mut sorted_children, base, options, is_toplevel)?;
        self.compute_rows(&parent_name, parent_vm, parent_file, &mut shrinking, base, options, is_toplevel)?;
        self.compute_rows(&parent_name, parent_vm, parent_file, &mut mixed, base, options, is_toplevel)?;
        row.sorted_children = sorted_children;
        row.shrinking = shrinking;
        row.mixed = mixed;
        Ok(())
    }

    fn compute_rows(&self, parent_name: &str, parent_vm: i64, parent_file: i64, children: &mut Vec<RollupRow>, base: Option<&Rollup>, options: &Options, is_toplevel: bool) -> Result<()> {
        // A solitary "[None]" or "[Unmapped]" row is only interesting at the
        // top level.
        if !is_toplevel && children.len() == 1 && (children[0].name == "[None]" || children[0].name == "[Unmapped]") {
            children.clear();
        }

        // A single row with exactly the parent's label repeats no information.
        if children.len() == 1 && children[0].name == parent_name {
            children.clear();
        }

        if children.is_empty() {
            return Ok(());
        }

        let rank_value = |r: &RollupRow| -> u64 {
            match options.sort_by {
                SortBy::VmSize => r.vmsize.unsigned_abs(),
                SortBy::FileSize => r.filesize.unsigned_abs(),
                SortBy::Both => r.vmsize.unsigned_abs().max(r.filesize.unsigned_abs()),
            }
        };

        // First pass decides what gets collapsed: large magnitudes first, names
        // breaking ties, and "[None]" sunk to the bottom so it goes into
        // [Other] before any real row does.
        children.sort_by(|a, b| {
            let a_top = a.name != "[None]";
            let b_top = b.name != "[None]";
            b_top.cmp(&a_top)
                .then_with(|| rank_value(b).cmp(&rank_value(a)))
                .then_with(|| a.name.cmp(&b.name))
        });

        // Filter out everything but the top max_rows_per_level; the collapsed
        // rows' sizes accumulate into a synthetic [Other] row. In diff mode the
        // matching baseline children accumulate alongside so [Other]'s percent
        // has a denominator.
        let max_rows = options.max_rows_per_level as usize;
        let mut others_row = RollupRow::new(OTHERS_LABEL);
        let mut others_rollup = Rollup::default();
        let mut others_base = Rollup::default();
        while children.len() > max_rows {
            let victim = children.pop().unwrap();
            checked_add(&mut others_row.vmsize, victim.vmsize)?;
            checked_add(&mut others_row.filesize, victim.filesize)?;
            if let Some(base) = base {
                if let Some(base_child) = base.children.get(&victim.name) {
                    checked_add(&mut others_base.vm_total, base_child.vm_total)?;
                    checked_add(&mut others_base.file_total, base_child.file_total)?;
                }
            }
        }

        if others_row.vmsize != 0 || others_row.filesize != 0 {
            others_rollup.vm_total = others_row.vmsize;
            others_rollup.file_total = others_row.filesize;
            children.push(others_row);
        }

        // Re-sort with [Other] included.
        children.sort_by(|a, b| {
            rank_value(b).cmp(&rank_value(a)).then_with(|| a.name.cmp(&b.name))
        });

        if base.is_none() {
            for child in children.iter_mut() {
                child.vm_percent = percent(child.vmsize, parent_vm);
                child.file_percent = percent(child.filesize, parent_file);
            }
        }

        // Recurse into sub-rows. [Other] has no real subtree; it recurses into
        // the synthetic rollup holding only its aggregate, which yields no rows.
        let empty = Rollup::default();
        for child_row in children.iter_mut() {
            let (child_rollup, child_base) = if child_row.name == OTHERS_LABEL {
                (&others_rollup, base.map(|_| &others_base))
            } else {
                let child_rollup = match self.children.get(&child_row.name) {
                    None => return err!(Sanity, "internal error, couldn't find name {}", child_row.name),
                    Some(c) => c,
                };
                let child_base = base.map(|base| base.children.get(&child_row.name).unwrap_or(&empty));
                (child_rollup, child_base)
            };
            child_rollup.create_rows(child_row, child_base, options, false)?;
        }
        Ok(())
    }
}
