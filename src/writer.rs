use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BUFFER_SIZE: usize = 1 << 20;

/// Buffered output file handed to the pipeline.
pub struct OutputWriter(BufWriter<File>);

impl OutputWriter {
    /// Creates the output file. Without `overwrite`, an existing file is an
    /// error and is left untouched.
    pub fn create(path: &Path, overwrite: bool) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(path)?;
        Ok(OutputWriter(BufWriter::with_capacity(BUFFER_SIZE, file)))
    }

    /// Flushes the buffer and syncs the file to disk.
    pub fn finish(self) -> io::Result<()> {
        let file = self.0.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()
    }
}

impl Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Deletes a partially written output file unless the run is committed.
pub struct PartialOutput {
    path: PathBuf,
    committed: bool,
}

impl PartialOutput {
    pub fn new(path: PathBuf) -> Self {
        PartialOutput {
            path,
            committed: false,
        }
    }

    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed partial output"),
            Err(err) => warn!(
                path = %self.path.display(),
                error = %err,
                "could not remove partial output"
            ),
        }
    }
}
