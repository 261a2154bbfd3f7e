use crate::{*, error::*};
use memmap2::Mmap;
use std::fs::File;

// A read-only view of one input binary, memory-mapped and held for the
// lifetime of the scan.
pub struct InputFile {
    pub filename: String,
    mmapped: Option<Mmap>,
    owned: Vec<u8>,
}

impl InputFile {
    pub fn open(filename: &str) -> Result<Self> {
        let file = File::open(filename).map_err(|e| Error::from_io_error(e, format!("couldn't open file '{}'", filename)))?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(Self {filename: filename.to_string(), mmapped: None, owned: Vec::new()});
        }
        let mmapped = unsafe {Mmap::map(&file)}.map_err(|e| Error::from_io_error(e, format!("couldn't mmap file '{}'", filename)))?;
        Ok(Self {filename: filename.to_string(), mmapped: Some(mmapped), owned: Vec::new()})
    }

    // For tests and synthetic inputs.
    pub fn from_contents(filename: &str, contents: Vec<u8>) -> Self {
        Self {filename: filename.to_string(), mmapped: None, owned: contents}
    }

    pub fn data(&self) -> &[u8] {
        match &self.mmapped {
            Some(m) => &m[..],
            None => &self.owned[..],
        }
    }
}
