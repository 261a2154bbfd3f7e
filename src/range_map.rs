use crate::{*, error::*};
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::ops::Bound;

// Maps [u64, u64) -> label, [optional start in the companion coordinate space],
// where ranges must be non-overlapping.
//
// Used for both coordinate spaces of a binary: VM addresses and file offsets.
// `other_start` lets a map double as a translator between the two spaces
// (vm addr -> file offset or vice versa): for an entry with a translation,
// x maps to x - start + other_start for x in [start, end).

#[derive(Clone, Debug)]
pub struct Entry {
    pub label: String,
    pub end: u64,
    pub other_start: Option<u64>, // None = no translation into the companion space
}

#[derive(Default)]
pub struct RangeMap {
    // Keyed by range start.
    mappings: BTreeMap<u64, Entry>,
}

pub const NO_NAME: &str = "[None]";

fn range_end(addr: u64, size: u64) -> Result<u64> {
    match addr.checked_add(size) {
        Some(end) => Ok(end),
        None => err!(IntegerOverflow, "range [0x{:x}, +0x{:x}) overflows", addr, size),
    }
}

impl RangeMap {
    pub fn is_empty(&self) -> bool { self.mappings.is_empty() }

    pub fn iter(&self) -> btree_map::Iter<'_, u64, Entry> { self.mappings.iter() }

    // The entry containing `addr`, if any. Entries are non-overlapping, so only
    // the last entry starting at or before `addr` can contain it.
    pub fn find_containing(&self, addr: u64) -> Option<(u64, &Entry)> {
        let (&start, entry) = self.mappings.range(..=addr).next_back()?;
        if addr < entry.end {
            Some((start, entry))
        } else {
            None
        }
    }

    // The entry containing `addr`, or failing that the first entry after it.
    pub fn find_containing_or_after(&self, addr: u64) -> Option<(u64, &Entry)> {
        if let Some(hit) = self.find_containing(addr) {
            return Some(hit);
        }
        self.mappings.range((Bound::Excluded(addr), Bound::Unbounded)).next().map(|(&start, entry)| (start, entry))
    }

    pub fn translate(&self, addr: u64) -> Option<u64> {
        let (start, entry) = self.find_containing(addr)?;
        Some(addr - start + entry.other_start?)
    }

    pub fn add_range(&mut self, addr: u64, size: u64, label: &str) -> Result<()> {
        self.add_dual_range(addr, size, None, label)
    }

    // Insert [addr, addr+size) without disturbing existing entries: the first
    // writer wins, subsequent writers only fill gaps. Producers overlap all the
    // time (e.g. symbols over sections over segments), and the earlier, more
    // authoritative labeling must not be overwritten.
    //
    // If `other` is set, each inserted piece records the correspondingly
    // shifted start in the companion space.
    pub fn add_dual_range(&mut self, addr: u64, size: u64, other: Option<u64>, label: &str) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let base = addr;
        let end = range_end(addr, size)?;
        if let Some(o) = other {
            range_end(o, size)?;
        }
        let mut addr = addr;

        loop {
            // The incoming range is the one that gets truncated, never the old one.
            while let Some((start, entry)) = self.find_containing(addr) {
                verbose!(2, "warning: range [0x{:x}, 0x{:x}) for label {} overlaps existing [0x{:x}, 0x{:x}) for label {}",
                         addr, end, label, start, entry.end, entry.label);
                addr = entry.end;
            }

            if addr >= end {
                return Ok(());
            }

            let next_start = self.mappings.range((Bound::Excluded(addr), Bound::Unbounded)).next().map(|(&s, _)| s);
            let mut this_end = end;
            if let Some(next_start) = next_start {
                if end > next_start {
                    this_end = next_start;
                    verbose!(2, "warning: range [0x{:x}, 0x{:x}) for label {} overlaps existing starting at 0x{:x}",
                             addr, end, label, next_start);
                }
            }

            let other_start = match other {
                None => None,
                Some(o) => Some(addr - base + o),
            };
            self.mappings.insert(addr, Entry {label: label.to_string(), end: this_end, other_start});
            addr = this_end;
        }
    }

    // Insert [addr, addr+size) into self, and for each sub-interval that falls
    // within a translating entry of `translator`, insert the translated
    // sub-interval (same label) into `other`. One input range can fan out to
    // several output ranges when it spans translator entries (normal for
    // archive members file->VM, surprising for symbols VM->file).
    pub fn add_range_with_translation(&mut self, addr: u64, size: u64, label: &str, translator: &RangeMap, other: &mut RangeMap) -> Result<()> {
        self.add_range(addr, size, label)?;
        let end = range_end(addr, size)?;

        let from = match translator.find_containing_or_after(addr) {
            Some((start, _)) => start,
            None => return Ok(()),
        };
        for (&start, entry) in translator.mappings.range(from..) {
            if start >= end {
                break;
            }
            let lo = addr.max(start);
            let hi = end.min(entry.end);
            if lo >= hi {
                continue;
            }
            if let Some(o) = entry.other_start {
                let translated = lo - start + o;
                verbose!(3, "  -> translates to: [0x{:x}, +0x{:x})", translated, hi - lo);
                other.add_range(translated, hi - lo, label)?;
            }
        }
        Ok(())
    }

    // Walks `maps` in lockstep and calls `func(labels, start, end)` once per
    // maximal sub-interval on which every map's label is constant:
    //
    //   -----  -----  -----             ---------------
    //     |      |      1                    A,X,1
    //     |      X    -----             ---------------
    //     |      |      |                    A,X,2
    //     A    -----    |               ---------------
    //     |      |      |                      |
    //     |      |      2      ----->          |
    //     |      Y      |                    A,Y,2
    //     |      |      |                      |
    //   -----    |      |               ---------------
    //     B      |      |                    B,Y,2
    //   -----    |    -----             ---------------
    //            |                      [None],Y,[None]
    //          -----
    //
    // A map with no entry at the current point contributes "[None]". Intervals
    // where no map has data are skipped entirely. If filename_position >= 0,
    // the constant `filename` is spliced into the labels at that index.
    pub fn compute_rollup<F: FnMut(&[&str], u64, u64) -> Result<()>>(maps: &[&RangeMap], filename: &str, filename_position: i32, mut func: F) -> Result<()> {
        let mut iters: Vec<_> = maps.iter().map(|m| m.mappings.iter().peekable()).collect();
        let mut current = u64::MAX;
        for it in &mut iters {
            if let Some(&(&start, _)) = it.peek() {
                current = current.min(start);
            }
        }
        if current == u64::MAX {
            return Ok(()); // all maps empty
        }

        let mut labels: Vec<&str> = Vec::with_capacity(iters.len() + 1);
        loop {
            let mut next_break = u64::MAX;
            let mut have_data = false;
            labels.clear();

            for (i, it) in iters.iter_mut().enumerate() {
                if filename_position >= 0 && filename_position as usize == i {
                    labels.push(filename);
                }

                // Drop entries that end at or before the current point.
                while let Some(&(_, entry)) = it.peek() {
                    if entry.end <= current {
                        it.next();
                    } else {
                        break;
                    }
                }

                match it.peek() {
                    Some(&(&start, entry)) if start <= current => {
                        have_data = true;
                        labels.push(&entry.label);
                        next_break = next_break.min(entry.end);
                    }
                    Some(&(&start, _)) => {
                        labels.push(NO_NAME);
                        next_break = next_break.min(start);
                    }
                    None => labels.push(NO_NAME),
                }
            }

            if filename_position >= 0 && filename_position as usize == iters.len() {
                labels.push(filename);
            }

            if next_break == u64::MAX {
                return Ok(());
            }

            if have_data {
                func(&labels, current, next_break)?;
            }

            current = next_break;
        }
    }
}

// One logical labeling of one binary: a RangeMap per coordinate space.
// Entries added as dual ranges appear in both maps, each pointing at the
// other's start, so the pair acts as a bijection on the covered sub-intervals.
#[derive(Default)]
pub struct DualMap {
    pub vm: RangeMap,
    pub file: RangeMap,
}

#[cfg(test)]
mod tests {
    use crate::range_map::*;

    fn entries(map: &RangeMap) -> Vec<(u64, u64, String, Option<u64>)> {
        map.iter().map(|(&s, e)| (s, e.end, e.label.clone(), e.other_start)).collect()
    }

    #[test]
    fn first_writer_wins() {
        let mut map = RangeMap::default();
        map.add_range(0x100, 0x100, "a").unwrap();
        // Fully covered: no-op.
        map.add_range(0x120, 0x10, "b").unwrap();
        // Straddles the end: only the tail is inserted.
        map.add_range(0x180, 0x100, "c").unwrap();
        // Straddles the start: only the head is inserted.
        map.add_range(0x80, 0x100, "d").unwrap();
        assert_eq!(entries(&map), vec![
            (0x80, 0x100, "d".to_string(), None),
            (0x100, 0x200, "a".to_string(), None),
            (0x200, 0x280, "c".to_string(), None),
        ]);
    }

    #[test]
    fn fills_gaps_between_entries() {
        let mut map = RangeMap::default();
        map.add_range(0x100, 0x10, "a").unwrap();
        map.add_range(0x130, 0x10, "b").unwrap();
        // Covers both plus the gaps around and between them: three new pieces.
        map.add_range(0xf0, 0x70, "c").unwrap();
        assert_eq!(entries(&map), vec![
            (0xf0, 0x100, "c".to_string(), None),
            (0x100, 0x110, "a".to_string(), None),
            (0x110, 0x130, "c".to_string(), None),
            (0x130, 0x140, "b".to_string(), None),
            (0x140, 0x160, "c".to_string(), None),
        ]);
    }

    #[test]
    fn zero_size_is_noop() {
        let mut map = RangeMap::default();
        map.add_range(0x100, 0, "a").unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn boundary_at_u64_max() {
        let mut map = RangeMap::default();
        map.add_range(u64::MAX - 0x10, 0x10, "top").unwrap();
        assert_eq!(map.find_containing(u64::MAX - 1).unwrap().1.label, "top");
        assert!(map.add_range(u64::MAX - 0x10, 0x11, "over").unwrap_err().is_integer_overflow());
        // u64::MAX is a legal translation target now that the sentinel is gone.
        let mut map = RangeMap::default();
        map.add_dual_range(0x0, 0x10, Some(u64::MAX - 0x10), "x").unwrap();
        assert_eq!(map.translate(0x8), Some(u64::MAX - 0x8));
    }

    #[test]
    fn translate() {
        let mut map = RangeMap::default();
        map.add_dual_range(0x1000, 0x100, Some(0x400), "t").unwrap();
        map.add_range(0x2000, 0x100, "u").unwrap();
        assert_eq!(map.translate(0x1000), Some(0x400));
        assert_eq!(map.translate(0x10ff), Some(0x4ff));
        assert_eq!(map.translate(0x1100), None); // past the end
        assert_eq!(map.translate(0x2050), None); // entry without translation
        assert_eq!(map.translate(0x500), None);  // no entry
    }

    #[test]
    fn dual_range_truncation_keeps_translation_aligned() {
        let mut map = RangeMap::default();
        map.add_range(0x120, 0x10, "old").unwrap();
        map.add_dual_range(0x100, 0x100, Some(0x5000), "new").unwrap();
        // Both surviving pieces must translate relative to the original base.
        assert_eq!(entries(&map), vec![
            (0x100, 0x120, "new".to_string(), Some(0x5000)),
            (0x120, 0x130, "old".to_string(), None),
            (0x130, 0x200, "new".to_string(), Some(0x5030)),
        ]);
        assert_eq!(map.translate(0x1ff), Some(0x50ff));
    }

    #[test]
    fn translation_round_trip() {
        let mut dual = DualMap::default();
        dual.vm.add_dual_range(0x1000, 0x100, Some(0x400), ".text").unwrap();
        dual.file.add_dual_range(0x400, 0x100, Some(0x1000), ".text").unwrap();
        for addr in [0x1000, 0x1001, 0x10ff] {
            let file = dual.vm.translate(addr).unwrap();
            assert_eq!(dual.file.translate(file), Some(addr));
        }
    }

    #[test]
    fn add_range_with_translation_fans_out() {
        // Translator covers [0x100, 0x200) -> 0x1000 and [0x300, 0x380) -> 0x2000,
        // with an untranslatable hole in between.
        let mut translator = RangeMap::default();
        translator.add_dual_range(0x100, 0x100, Some(0x1000), "s1").unwrap();
        translator.add_range(0x200, 0x100, "hole").unwrap();
        translator.add_dual_range(0x300, 0x80, Some(0x2000), "s2").unwrap();

        let mut map = RangeMap::default();
        let mut other = RangeMap::default();
        map.add_range_with_translation(0x180, 0x200, "member.o", &translator, &mut other).unwrap();

        // Self gets the whole range, companion gets two translated pieces.
        assert_eq!(entries(&map), vec![(0x180, 0x380, "member.o".to_string(), None)]);
        assert_eq!(entries(&other), vec![
            (0x1080, 0x1100, "member.o".to_string(), None),
            (0x2000, 0x2080, "member.o".to_string(), None),
        ]);
    }

    #[test]
    fn compute_rollup_overlay() {
        // Base covers [0x1000, 0x1100) as .text; symbol map covers [0x1000, 0x1040) as foo.
        let mut base = RangeMap::default();
        base.add_range(0x1000, 0x100, ".text").unwrap();
        let mut syms = RangeMap::default();
        syms.add_range(0x1000, 0x40, "foo").unwrap();

        let mut out: Vec<(Vec<String>, u64, u64)> = Vec::new();
        RangeMap::compute_rollup(&[&base, &syms], "", -1, |labels, start, end| {
            out.push((labels.iter().map(|s| s.to_string()).collect(), start, end));
            Ok(())
        }).unwrap();
        assert_eq!(out, vec![
            (vec![".text".to_string(), "foo".to_string()], 0x1000, 0x1040),
            (vec![".text".to_string(), "[None]".to_string()], 0x1040, 0x1100),
        ]);
    }

    #[test]
    fn compute_rollup_skips_intervals_with_no_data() {
        let mut a = RangeMap::default();
        a.add_range(0x100, 0x100, "a").unwrap();
        a.add_range(0x400, 0x100, "b").unwrap();
        let mut out: Vec<(u64, u64)> = Vec::new();
        RangeMap::compute_rollup(&[&a], "", -1, |_, start, end| {
            out.push((start, end));
            Ok(())
        }).unwrap();
        // The [0x200, 0x400) gap produces nothing.
        assert_eq!(out, vec![(0x100, 0x200), (0x400, 0x500)]);
    }

    #[test]
    fn compute_rollup_covers_every_point_once() {
        let mut a = RangeMap::default();
        a.add_range(0x0, 0x10, "a1").unwrap();
        a.add_range(0x30, 0x30, "a2").unwrap();
        let mut b = RangeMap::default();
        b.add_range(0x8, 0x20, "b1").unwrap();
        b.add_range(0x50, 0x30, "b2").unwrap();

        let mut intervals: Vec<(u64, u64)> = Vec::new();
        RangeMap::compute_rollup(&[&a, &b], "", -1, |_, start, end| {
            assert!(start < end);
            intervals.push((start, end));
            Ok(())
        }).unwrap();
        // Emitted intervals must be disjoint, increasing, and cover the union of
        // both domains.
        for w in intervals.windows(2) {
            assert!(w[0].1 <= w[1].0);
        }
        let covered: u64 = intervals.iter().map(|&(s, e)| e - s).sum();
        assert_eq!(covered, 0x28 + 0x50); // |[0, 0x28)| + |[0x30, 0x80)|
    }

    #[test]
    fn compute_rollup_filename_position() {
        let mut base = RangeMap::default();
        base.add_range(0x0, 0x10, "seg").unwrap();
        let mut src = RangeMap::default();
        src.add_range(0x0, 0x10, ".text").unwrap();

        // Position 1: between the base map and the first source.
        let mut labels_seen: Vec<Vec<String>> = Vec::new();
        RangeMap::compute_rollup(&[&base, &src], "a.out", 1, |labels, _, _| {
            labels_seen.push(labels.iter().map(|s| s.to_string()).collect());
            Ok(())
        }).unwrap();
        assert_eq!(labels_seen, vec![vec!["seg".to_string(), "a.out".to_string(), ".text".to_string()]]);

        // Position past the last map appends at the end.
        let mut labels_seen: Vec<Vec<String>> = Vec::new();
        RangeMap::compute_rollup(&[&base, &src], "a.out", 2, |labels, _, _| {
            labels_seen.push(labels.iter().map(|s| s.to_string()).collect());
            Ok(())
        }).unwrap();
        assert_eq!(labels_seen, vec![vec!["seg".to_string(), ".text".to_string(), "a.out".to_string()]]);
    }
}
