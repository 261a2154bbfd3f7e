use crate::{*, error::*, rollup::*};
use std::io::Write;

// Rendering of a shaped rollup tree. The tree itself (sorting, [Other]
// collapsing, diff buckets) is built in rollup.rs; this file only formats.

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    PrettyPrint,
    Csv,
}

#[derive(Clone, Copy)]
pub struct OutputOptions {
    pub output_format: OutputFormat,
    pub max_label_len: usize,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {output_format: OutputFormat::PrettyPrint, max_label_len: 80}
    }
}

#[derive(Debug)]
pub struct RollupOutput {
    pub source_names: Vec<String>,
    pub toplevel_row: RollupRow,
}

fn fixed_width_string(input: &str, size: usize) -> String {
    if input.len() < size {
        let mut ret = input.to_string();
        while ret.len() < size {
            ret.push(' ');
        }
        ret
    } else {
        // Demangled names can contain multi-byte characters; don't cut one in
        // half.
        let mut end = size;
        while end > 0 && !input.is_char_boundary(end) {
            end -= 1;
        }
        let mut ret = input[..end].to_string();
        while ret.len() < size {
            ret.push(' ');
        }
        ret
    }
}

fn left_pad(input: &str, size: usize) -> String {
    let mut ret = input.to_string();
    while ret.len() < size {
        ret.insert(0, ' ');
    }
    ret
}

// "42", "12.4Ki", "1.23Mi", right-padded to the fixed 7-column size field.
pub fn si_print(size: i64, force_sign: bool) -> String {
    const PREFIXES: [&str; 5] = ["", "Ki", "Mi", "Gi", "Ti"];
    let mut n = 0;
    let mut size_d = size as f64;
    while size_d.abs() > 1024.0 && n < PREFIXES.len() - 1 {
        size_d /= 1024.0;
        n += 1;
    }

    let ret = if size_d.abs() > 100.0 || n == 0 {
        let s = format!("{}{}", size_d as i64, PREFIXES[n]);
        if force_sign && size > 0 {
            format!("+{}", s)
        } else {
            s
        }
    } else if size_d.abs() > 10.0 {
        if force_sign {
            format!("{:+.1}{}", size_d, PREFIXES[n])
        } else {
            format!("{:.1}{}", size_d, PREFIXES[n])
        }
    } else {
        if force_sign {
            format!("{:+.2}{}", size_d, PREFIXES[n])
        } else {
            format!("{:.2}{}", size_d, PREFIXES[n])
        }
    };

    left_pad(&ret, 7)
}

pub fn percent_string(percent: f64, diff_mode: bool) -> String {
    if diff_mode {
        if percent == 0.0 || percent.is_nan() {
            " [ = ]".to_string()
        } else if percent == -100.0 {
            " [DEL]".to_string()
        } else if percent.is_infinite() {
            " [NEW]".to_string()
        } else {
            // Keep the column fixed-width even for huge percentages.
            let str = if percent > 1000.0 {
                let digits = percent.log10() as i32 - 1;
                format!("{:+.0}e{}%", percent / 10f64.powi(digits), digits)
            } else if percent > 10.0 {
                format!("{:+4.0}%", percent)
            } else {
                format!("{:+5.1}%", percent)
            };
            left_pad(&str, 6)
        }
    } else {
        format!("{:5.1}%", percent)
    }
}

pub fn csv_escape(s: &str) -> String {
    let need_escape = s.contains('"') || s.contains(',');
    if !need_escape {
        return s.to_string();
    }
    let mut ret = String::with_capacity(s.len() + 2);
    ret.push('"');
    for ch in s.chars() {
        if ch == '"' {
            ret.push_str("\"\"");
        } else {
            ret.push(ch);
        }
    }
    ret.push('"');
    ret
}

impl RollupOutput {
    pub fn new() -> Self {
        Self {source_names: Vec::new(), toplevel_row: RollupRow::new("TOTAL")}
    }

    pub fn add_data_source_name(&mut self, name: &str) {
        self.source_names.push(name.to_string());
    }

    pub fn print(&self, options: &OutputOptions, out: &mut dyn Write) -> Result<()> {
        match options.output_format {
            OutputFormat::PrettyPrint => self.pretty_print(options.max_label_len, out),
            OutputFormat::Csv => self.print_to_csv(out),
        }
    }

    fn calculate_longest_label(&self, row: &RollupRow, indent: usize) -> usize {
        let mut ret = indent + row.name.len();
        for child in row.sorted_children.iter().chain(&row.shrinking).chain(&row.mixed) {
            ret = ret.max(self.calculate_longest_label(child, indent + 4));
        }
        ret
    }

    fn pretty_print_row(&self, row: &RollupRow, indent: usize, longest_label: usize, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "{} {} {} {} {} {}",
                 fixed_width_string("", indent),
                 percent_string(row.vm_percent, row.diff_mode),
                 si_print(row.vmsize, row.diff_mode),
                 fixed_width_string(&row.name, longest_label),
                 si_print(row.filesize, row.diff_mode),
                 percent_string(row.file_percent, row.diff_mode))?;
        Ok(())
    }

    fn pretty_print_tree(&self, row: &RollupRow, indent: usize, longest_label: usize, out: &mut dyn Write) -> Result<()> {
        // Rows print before their sub-rows. In diff mode only the buckets that
        // agree with the row's own direction print; a shrinking symbol inside a
        // growing section would read as noise.
        self.pretty_print_row(row, indent, longest_label, out)?;

        if row.vmsize > 0 || row.filesize > 0 {
            for child in &row.sorted_children {
                self.pretty_print_tree(child, indent + 4, longest_label, out)?;
            }
        }

        if row.vmsize < 0 || row.filesize < 0 {
            for child in &row.shrinking {
                self.pretty_print_tree(child, indent + 4, longest_label, out)?;
            }
        }

        if (row.vmsize < 0) != (row.filesize < 0) {
            for child in &row.mixed {
                self.pretty_print_tree(child, indent + 4, longest_label, out)?;
            }
        }
        Ok(())
    }

    fn pretty_print(&self, max_label_len: usize, out: &mut dyn Write) -> Result<()> {
        let top = &self.toplevel_row;
        let mut longest_label = top.name.len();
        for child in top.sorted_children.iter().chain(&top.shrinking).chain(&top.mixed) {
            longest_label = longest_label.max(self.calculate_longest_label(child, 0));
        }
        longest_label = longest_label.min(max_label_len);

        writeln!(out, "     VM SIZE    {}    FILE SIZE", " ".repeat(longest_label))?;
        if top.diff_mode {
            writeln!(out, " ++++++++++++++ {} ++++++++++++++", fixed_width_string("GROWING", longest_label))?;
        } else {
            writeln!(out, " -------------- {} --------------", " ".repeat(longest_label))?;
        }

        for child in &top.sorted_children {
            self.pretty_print_tree(child, 0, longest_label, out)?;
        }

        if top.diff_mode {
            if !top.shrinking.is_empty() {
                writeln!(out)?;
                writeln!(out, " -------------- {} --------------", fixed_width_string("SHRINKING", longest_label))?;
                for child in &top.shrinking {
                    self.pretty_print_tree(child, 0, longest_label, out)?;
                }
            }

            if !top.mixed.is_empty() {
                writeln!(out)?;
                writeln!(out, " -+-+-+-+-+-+-+ {} +-+-+-+-+-+-+-", fixed_width_string("MIXED", longest_label))?;
                for child in &top.mixed {
                    self.pretty_print_tree(child, 0, longest_label, out)?;
                }
            }

            writeln!(out)?;
        }

        // The TOTAL row comes after all other rows.
        self.pretty_print_row(top, 0, longest_label, out)
    }

    fn print_row_to_csv(&self, row: &RollupRow, parent_labels: &str, out: &mut dyn Write) -> Result<()> {
        if !parent_labels.is_empty() {
            write!(out, "{},", parent_labels)?;
        }
        writeln!(out, "{},{},{}", csv_escape(&row.name), row.vmsize, row.filesize)?;
        Ok(())
    }

    fn print_tree_to_csv(&self, row: &RollupRow, parent_labels: &str, out: &mut dyn Write) -> Result<()> {
        if row.sorted_children.is_empty() && row.shrinking.is_empty() && row.mixed.is_empty() {
            return self.print_row_to_csv(row, parent_labels, out);
        }
        let labels = if parent_labels.is_empty() {
            csv_escape(&row.name)
        } else {
            format!("{},{}", parent_labels, csv_escape(&row.name))
        };
        for child in row.sorted_children.iter().chain(&row.shrinking).chain(&row.mixed) {
            self.print_tree_to_csv(child, &labels, out)?;
        }
        Ok(())
    }

    fn print_to_csv(&self, out: &mut dyn Write) -> Result<()> {
        let mut names = self.source_names.clone();
        names.push("vmsize".to_string());
        names.push("filesize".to_string());
        writeln!(out, "{}", names.join(","))?;
        let top = &self.toplevel_row;
        for child in top.sorted_children.iter().chain(&top.shrinking).chain(&top.mixed) {
            self.print_tree_to_csv(child, "", out)?;
        }
        Ok(())
    }
}
