//! Leveled progress reporting.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::errors::Result;

/// Reports to stderr, mirroring to an optional log file.
///
/// Levels: 0 errors only, 1 warnings, 2 progress, 3 debug.
pub struct Logger {
    level: u32,
    file: Option<BufWriter<File>>,
}

impl Logger {
    pub fn new(level: u32) -> Self {
        Self { level, file: None }
    }

    pub fn with_file(level: u32, path: &Path) -> Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(Self {
            level,
            file: Some(file),
        })
    }

    pub fn report(&mut self, level: u32, args: fmt::Arguments) {
        if level > self.level {
            return;
        }
        eprintln!("{args}");
        if let Some(file) = &mut self.file {
            // Mirror failures must not abort a training run
            let _ = writeln!(file, "{args}");
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_filter() {
        let mut logger = Logger::new(1);
        // No assertion surface beyond not panicking; level 3 is filtered out
        logger.report(1, format_args!("warned"));
        logger.report(3, format_args!("debug hidden"));
    }
}
