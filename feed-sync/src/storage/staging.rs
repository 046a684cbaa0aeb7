//! On-disk staging of batches for bulk `COPY` loads
//!
//! A [`StagedBatch`] owns a named temporary file; the file is removed when the
//! batch is dropped, whichever way the load ends.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use csv::WriterBuilder;
use tempfile::NamedTempFile;

use super::gateway::{batch_kind, GatewayResult};
use crate::schema::{DataKind, NormalizedRecord};

/// Marker written for NULL cells; passed to `COPY ... NULL`
pub const NULL_MARKER: &str = "\\N";

/// A batch written to a CSV temp file
#[derive(Debug)]
pub struct StagedBatch {
    file: NamedTempFile,
    kind: DataKind,
    rows: usize,
}

impl StagedBatch {
    /// Write `rows` as headerless CSV in [`NormalizedRecord::columns`] order
    ///
    /// Returns `None` for an empty batch.
    pub fn write(rows: &[NormalizedRecord]) -> GatewayResult<Option<Self>> {
        let Some(kind) = batch_kind(rows)? else {
            return Ok(None);
        };

        let mut file = tempfile::Builder::new()
            .prefix("feed_sync_stage_")
            .suffix(".csv")
            .tempfile()?;

        {
            let mut writer = WriterBuilder::new()
                .has_headers(false)
                .from_writer(file.as_file_mut());

            for row in rows {
                writer.write_record(
                    row.cells()
                        .iter()
                        .map(|cell| cell.as_deref().unwrap_or(NULL_MARKER)),
                )?;
            }
            writer.flush()?;
        }

        Ok(Some(Self {
            file,
            kind,
            rows: rows.len(),
        }))
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> Vec<&'static str> {
        NormalizedRecord::columns(self.kind)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Full CSV payload
    pub fn read_bytes(&mut self) -> std::io::Result<Vec<u8>> {
        let file = self.file.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        let mut payload = Vec::new();
        file.read_to_end(&mut payload)?;
        Ok(payload)
    }
}
