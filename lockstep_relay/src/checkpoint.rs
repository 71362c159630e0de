// Join point checkpoints on disk.
//
// A checkpoint is exactly what a new joiner would be sent: the join point
// snapshot, the tick it was taken at, the authoritative tick at save time, and
// every scope's retained command log (with its sequence counter). It is
// written as JSON, LZ4-compressed with the uncompressed size prepended, to a
// temporary file next to the target that is then renamed over it, so a crash
// mid-write leaves the previous checkpoint intact.

use std::io;
use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::command_log::SavedScope;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub join_tick: u64,
    pub tick: u64,
    pub snapshot: Bytes,
    pub logs: Vec<SavedScope>,
}

#[derive(thiserror::Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O: {0}")]
    Io(#[from] io::Error),
    #[error("checkpoint encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("checkpoint decompression: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
}

pub fn save(path: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let json = serde_json::to_vec(checkpoint)?;
    let compressed = lz4_flex::compress_prepend_size(&json);
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, &compressed)?;
    std::fs::rename(&tmp, path)?;
    info!(
        path = %path.display(),
        join_tick = checkpoint.join_tick,
        bytes = compressed.len(),
        "checkpoint written"
    );
    Ok(())
}

pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let compressed = std::fs::read(path)?;
    let json = lz4_flex::decompress_size_prepended(&compressed)?;
    Ok(serde_json::from_slice(&json)?)
}
