//! Destinations for assembled output units

use super::SinkError;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use uuid::Uuid;

/// The host pipeline's unit-of-work boundary.
///
/// A unit is created, appended to, then either transferred downstream or
/// discarded. The gateway never looks at how units are stored.
#[async_trait]
pub trait OutputSink: Send {
    type Unit: Send;

    async fn create(&mut self) -> Result<Self::Unit, SinkError>;

    /// Append `bytes`, preceded by `prefix` when given
    async fn append(
        &mut self,
        unit: &mut Self::Unit,
        prefix: Option<&[u8]>,
        bytes: &[u8],
    ) -> Result<(), SinkError>;

    /// Mark the unit complete and forward it
    async fn transfer(&mut self, unit: Self::Unit) -> Result<(), SinkError>;

    async fn discard(&mut self, unit: Self::Unit);
}

fn append_to_vec(unit: &mut Vec<u8>, prefix: Option<&[u8]>, bytes: &[u8]) {
    if let Some(prefix) = prefix {
        unit.extend_from_slice(prefix);
    }
    unit.extend_from_slice(bytes);
}

/// Keeps transferred units in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    units: Vec<Vec<u8>>,
    discarded: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> &[Vec<u8>] {
        &self.units
    }

    /// Transferred units decoded as UTF-8
    pub fn units_lossy(&self) -> Vec<String> {
        self.units
            .iter()
            .map(|unit| String::from_utf8_lossy(unit).into_owned())
            .collect()
    }

    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn take_units(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.units)
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    type Unit = Vec<u8>;

    async fn create(&mut self) -> Result<Vec<u8>, SinkError> {
        Ok(Vec::new())
    }

    async fn append(&mut self, unit: &mut Vec<u8>, prefix: Option<&[u8]>, bytes: &[u8]) -> Result<(), SinkError> {
        append_to_vec(unit, prefix, bytes);
        Ok(())
    }

    async fn transfer(&mut self, unit: Vec<u8>) -> Result<(), SinkError> {
        self.units.push(unit);
        Ok(())
    }

    async fn discard(&mut self, _unit: Vec<u8>) {
        self.discarded += 1;
    }
}

/// Writes each unit to an async writer as one record followed by a separator
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
    separator: Vec<u8>,
    transferred: usize,
}

impl<W: AsyncWrite + Unpin + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self::with_separator(writer, b"\n".to_vec())
    }

    pub fn with_separator(writer: W, separator: Vec<u8>) -> Self {
        Self {
            writer,
            separator,
            transferred: 0,
        }
    }

    pub fn transferred(&self) -> usize {
        self.transferred
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> OutputSink for WriterSink<W> {
    type Unit = Vec<u8>;

    async fn create(&mut self) -> Result<Vec<u8>, SinkError> {
        Ok(Vec::new())
    }

    async fn append(&mut self, unit: &mut Vec<u8>, prefix: Option<&[u8]>, bytes: &[u8]) -> Result<(), SinkError> {
        append_to_vec(unit, prefix, bytes);
        Ok(())
    }

    async fn transfer(&mut self, unit: Vec<u8>) -> Result<(), SinkError> {
        self.writer.write_all(&unit).await.map_err(SinkError::Transfer)?;
        self.writer
            .write_all(&self.separator)
            .await
            .map_err(SinkError::Transfer)?;
        self.writer.flush().await.map_err(SinkError::Transfer)?;
        self.transferred += 1;
        Ok(())
    }

    async fn discard(&mut self, _unit: Vec<u8>) {}
}

/// An output unit being written to disk under a temporary name
#[derive(Debug)]
pub struct FileUnit {
    file: BufWriter<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
}

/// Writes one file per unit into a directory.
///
/// Files are named `<timestamp>-<uuid>.out` and only appear under that
/// name once transferred.
#[derive(Debug)]
pub struct DirectorySink {
    dir: PathBuf,
    transferred: Vec<PathBuf>,
}

impl DirectorySink {
    /// Create the sink, creating `dir` if needed
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(SinkError::Create)?;
        Ok(Self {
            dir,
            transferred: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Paths of the units transferred so far, oldest first
    pub fn transferred(&self) -> &[PathBuf] {
        &self.transferred
    }
}

async fn remove_temp(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        tracing::debug!(path = %path.display(), error = %e, "Failed to remove temporary unit");
    }
}

#[async_trait]
impl OutputSink for DirectorySink {
    type Unit = FileUnit;

    async fn create(&mut self) -> Result<FileUnit, SinkError> {
        let name = format!(
            "{}-{}.out",
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ"),
            Uuid::new_v4()
        );
        let temp_path = self.dir.join(format!(".{name}.part"));
        let final_path = self.dir.join(name);
        let file = File::create(&temp_path).await.map_err(SinkError::Create)?;

        Ok(FileUnit {
            file: BufWriter::new(file),
            temp_path,
            final_path,
        })
    }

    async fn append(&mut self, unit: &mut FileUnit, prefix: Option<&[u8]>, bytes: &[u8]) -> Result<(), SinkError> {
        if let Some(prefix) = prefix {
            unit.file.write_all(prefix).await.map_err(SinkError::Write)?;
        }
        unit.file.write_all(bytes).await.map_err(SinkError::Write)
    }

    async fn transfer(&mut self, unit: FileUnit) -> Result<(), SinkError> {
        let FileUnit {
            mut file,
            temp_path,
            final_path,
        } = unit;

        // Flushing the tokio file also waits for its in-flight write
        let flushed = file.flush().await;
        drop(file);
        if let Err(e) = flushed {
            remove_temp(&temp_path).await;
            return Err(SinkError::Transfer(e));
        }

        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            remove_temp(&temp_path).await;
            return Err(SinkError::Transfer(e));
        }

        tracing::trace!(path = %final_path.display(), "Wrote output unit");
        self.transferred.push(final_path);
        Ok(())
    }

    async fn discard(&mut self, unit: FileUnit) {
        let FileUnit { file, temp_path, .. } = unit;
        drop(file);
        remove_temp(&temp_path).await;
    }
}
