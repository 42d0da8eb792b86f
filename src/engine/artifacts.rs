use std::path::Path;

use anyhow::Context;

use crate::engine::models::{Artifact, ArtifactMap};

/// Extensions the interpreter leaves behind, with their category keys.
const RECOGNIZED: &[(&str, &str)] = &[
    ("a", "aFiles"),
    ("e", "eFiles"),
    ("o", "oFiles"),
    ("lst", "lstFiles"),
    ("bst", "bstFiles"),
];

pub fn category_for(file_name: &str) -> Option<&'static str> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
    RECOGNIZED
        .iter()
        .find(|(candidate, _)| *candidate == ext)
        .map(|(_, category)| *category)
}

/// Gathers recognized files at the top level of `dir`. Must run before the
/// workspace is released.
pub async fn collect(dir: &Path) -> anyhow::Result<ArtifactMap> {
    let mut artifacts = ArtifactMap::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to list {}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(category) = category_for(&name) else {
            continue;
        };
        let bytes = tokio::fs::read(entry.path())
            .await
            .with_context(|| format!("failed to read artifact {name}"))?;
        artifacts
            .entry(category.to_string())
            .or_default()
            .push(Artifact {
                name,
                content: String::from_utf8_lossy(&bytes).into_owned(),
            });
    }

    for files in artifacts.values_mut() {
        files.sort_by(|a, b| a.name.cmp(&b.name));
    }
    Ok(artifacts)
}
