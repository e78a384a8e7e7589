//! Verification of the encoder-produced playlist before publication.
//!
//! The encoder owns manifest generation; this module only reads it back
//! and checks that every referenced segment exists under the work
//! directory with ascending indices. A manifest that fails verification
//! fails the job, reported as a diagnostic string rather than an error
//! type, since it is a terminal job outcome.

use std::path::Path;

use regex::Regex;

/// Extract the segment URI lines from playlist text. In an M3U playlist
/// every non-empty line that is not a `#` tag is a media URI.
pub fn segment_entries(playlist: &str) -> Vec<String> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

/// Read the manifest and confirm each referenced segment is present in
/// `work_dir`, named by the fixed-width pattern, in ascending index order.
/// Returns the segment URIs on success, a diagnostic on any mismatch.
pub async fn verify(manifest_path: &Path, work_dir: &Path) -> Result<Vec<String>, String> {
    let playlist = tokio::fs::read_to_string(manifest_path)
        .await
        .map_err(|e| format!("encoder reported success but manifest is unreadable: {}", e))?;

    let entries = segment_entries(&playlist);
    if entries.is_empty() {
        return Err("manifest references no segments".to_string());
    }

    let name_re = Regex::new(r"^segment_(\d{3,})\.ts$").unwrap();
    let mut last_index: Option<u64> = None;

    for entry in &entries {
        let caps = name_re
            .captures(entry)
            .ok_or_else(|| format!("unexpected segment name in manifest: {:?}", entry))?;
        let index: u64 = caps[1]
            .parse()
            .map_err(|_| format!("unparseable segment index in {:?}", entry))?;

        if let Some(previous) = last_index {
            if index <= previous {
                return Err(format!(
                    "segment indices out of order: {} after {}",
                    index, previous
                ));
            }
        }
        last_index = Some(index);

        if tokio::fs::metadata(work_dir.join(entry)).await.is_err() {
            return Err(format!("manifest references missing segment {:?}", entry));
        }
    }

    Ok(entries)
}
