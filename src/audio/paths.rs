//! Reply artifact paths
//!
//! Synthesized replies are stored as `response_<YYYYMMDD>_<HHMMSS>.wav` in the
//! configured output directory. Earlier artifacts are never removed.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// Create the output directory if it doesn't exist.
pub fn create_output_dir(dir: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    Ok(dir.to_path_buf())
}

/// File name for a reply produced at `at`.
/// Format: response_YYYYMMDD_HHMMSS.wav
pub fn artifact_file_name(at: DateTime<Local>) -> String {
    format!("response_{}.wav", at.format("%Y%m%d_%H%M%S"))
}

/// Pick a path under `dir` that does not exist yet.
///
/// Two replies within the same second get `_1`, `_2`, ... suffixes.
pub fn generate_artifact_path(dir: &Path, at: DateTime<Local>) -> std::io::Result<PathBuf> {
    let dir = create_output_dir(dir)?;
    let name = artifact_file_name(at);
    let candidate = dir.join(&name);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let stem = name.trim_end_matches(".wav");
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{n}.wav"));
        if !candidate.exists() {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Write reply audio to a fresh artifact path and return it.
pub fn persist_artifact(dir: &Path, audio: &[u8]) -> std::io::Result<PathBuf> {
    let path = generate_artifact_path(dir, Local::now())?;
    fs::write(&path, audio)?;
    log::info!("Saved reply audio: {:?} ({} bytes)", path, audio.len());
    Ok(path)
}
