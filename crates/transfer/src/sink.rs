use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use blockpull_protocol::{Announce, TransferId};

use crate::TransferError;
use crate::validation::validate_file_name;

/// Append-only destination for verified blocks.
///
/// Bytes arrive strictly in block order. Nothing is visible under the
/// final name until [`BlockSink::finalize`] succeeds.
pub trait BlockSink: Send {
    /// Appends one verified block.
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Makes the output durable and visible.
    fn finalize(&mut self) -> io::Result<()>;

    /// Discards everything written so far.
    fn abort(&mut self) -> io::Result<()>;
}

/// Opens a sink for each announced transfer.
pub trait SinkProvider: Send + Sync {
    fn open(&self, announce: &Announce) -> Result<Box<dyn BlockSink>, TransferError>;
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

/// Writes to `<name>.part` and renames it to `<name>` on finalize.
pub struct FileSink {
    writer: Option<BufWriter<File>>,
    part_path: PathBuf,
    final_path: PathBuf,
    expected: u64,
    written: u64,
    finalized: bool,
}

impl FileSink {
    /// Creates the partial file for `file_name` inside `dir`.
    ///
    /// Fails if `file_name` is not a plain name, or if either the final
    /// file or its partial file already exists. The latter means another
    /// transfer of the same name is still in flight.
    pub fn create(dir: &Path, file_name: &str, expected: u64) -> Result<Self, TransferError> {
        validate_file_name(file_name)?;

        let final_path = dir.join(file_name);
        if final_path.exists() {
            return Err(TransferError::SinkUnavailable(format!(
                "{} already exists",
                final_path.display()
            )));
        }
        let part_path = dir.join(format!("{file_name}.part"));

        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(TransferError::SinkUnavailable(format!(
                    "{} is already being written",
                    part_path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            writer: Some(BufWriter::new(file)),
            part_path,
            final_path,
            expected,
            written: 0,
            finalized: false,
        })
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("sink already closed"))
    }
}

impl BlockSink for FileSink {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer()?.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| io::Error::other("sink already closed"))?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        if self.written != self.expected {
            let _ = std::fs::remove_file(&self.part_path);
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("wrote {} bytes, expected {}", self.written, self.expected),
            ));
        }

        std::fs::rename(&self.part_path, &self.final_path)?;
        self.finalized = true;
        Ok(())
    }

    fn abort(&mut self) -> io::Result<()> {
        self.writer.take();
        match std::fs::remove_file(&self.part_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if !self.finalized {
            self.writer.take();
            let _ = std::fs::remove_file(&self.part_path);
        }
    }
}

/// Creates a [`FileSink`] per transfer inside one directory.
pub struct DirectorySinks {
    dir: PathBuf,
}

impl DirectorySinks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SinkProvider for DirectorySinks {
    fn open(&self, announce: &Announce) -> Result<Box<dyn BlockSink>, TransferError> {
        std::fs::create_dir_all(&self.dir)?;
        let sink = FileSink::create(&self.dir, &announce.file_name, announce.total_size)?;
        Ok(Box::new(sink))
    }
}

// ---------------------------------------------------------------------------
// Memory sinks
// ---------------------------------------------------------------------------

/// Lifecycle of a [`MemorySink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Open,
    Finalized,
    Aborted,
}

/// Contents and status of a [`MemorySink`], shared with the test or
/// caller that created it.
#[derive(Debug)]
pub struct MemoryOutput {
    pub data: Vec<u8>,
    pub status: SinkStatus,
}

/// In-memory [`BlockSink`].
pub struct MemorySink {
    output: Arc<Mutex<MemoryOutput>>,
}

impl MemorySink {
    pub fn new() -> (Self, Arc<Mutex<MemoryOutput>>) {
        let output = Arc::new(Mutex::new(MemoryOutput {
            data: Vec::new(),
            status: SinkStatus::Open,
        }));
        (
            Self {
                output: Arc::clone(&output),
            },
            output,
        )
    }
}

impl BlockSink for MemorySink {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let mut out = self.output.lock().unwrap();
        if out.status != SinkStatus::Open {
            return Err(io::Error::other("sink already closed"));
        }
        out.data.extend_from_slice(data);
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        let mut out = self.output.lock().unwrap();
        if out.status != SinkStatus::Open {
            return Err(io::Error::other("sink already closed"));
        }
        out.status = SinkStatus::Finalized;
        Ok(())
    }

    fn abort(&mut self) -> io::Result<()> {
        let mut out = self.output.lock().unwrap();
        out.data.clear();
        out.status = SinkStatus::Aborted;
        Ok(())
    }
}

/// [`SinkProvider`] handing out [`MemorySink`]s keyed by transfer id.
#[derive(Default)]
pub struct MemorySinks {
    outputs: Mutex<HashMap<TransferId, Arc<Mutex<MemoryOutput>>>>,
}

impl MemorySinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output of the sink opened for `id`, if any.
    pub fn output(&self, id: &TransferId) -> Option<Arc<Mutex<MemoryOutput>>> {
        self.outputs.lock().unwrap().get(id).cloned()
    }

    /// Data of a finalized transfer.
    pub fn finalized(&self, id: &TransferId) -> Option<Vec<u8>> {
        let output = self.output(id)?;
        let out = output.lock().unwrap();
        (out.status == SinkStatus::Finalized).then(|| out.data.clone())
    }
}

impl SinkProvider for MemorySinks {
    fn open(&self, announce: &Announce) -> Result<Box<dyn BlockSink>, TransferError> {
        validate_file_name(&announce.file_name)?;
        let (sink, output) = MemorySink::new();
        self.outputs
            .lock()
            .unwrap()
            .insert(announce.transfer_id.clone(), output);
        Ok(Box::new(sink))
    }
}
