use crate::error::ExtractError;
use crate::ingest::digest_file;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Byte-identical PDFs sharing one SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub digest: String,
    pub paths: Vec<PathBuf>,
    pub keeper: PathBuf,
}

impl DuplicateGroup {
    pub fn redundant(&self) -> impl Iterator<Item = &PathBuf> {
        self.paths.iter().filter(move |path| **path != self.keeper)
    }
}

/// Result of a duplicate scan. Files that could not be read are listed in
/// `unreadable` and take no part in any group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateScan {
    pub groups: Vec<DuplicateGroup>,
    pub unreadable: Vec<PathBuf>,
}

/// Groups of two or more identical files, ordered by digest.
pub fn find_duplicates(files: &[PathBuf]) -> DuplicateScan {
    let mut by_digest: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut unreadable = Vec::new();
    for path in files {
        match digest_file(path) {
            Ok(digest) => by_digest.entry(digest).or_default().push(path.clone()),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "skipping unreadable pdf");
                unreadable.push(path.clone());
            }
        }
    }

    let groups = by_digest
        .into_iter()
        .filter(|(_, paths)| paths.len() > 1)
        .filter_map(|(digest, paths)| {
            let keeper = select_keeper(&paths)?.clone();
            Some(DuplicateGroup {
                digest,
                paths,
                keeper,
            })
        })
        .collect();

    DuplicateScan { groups, unreadable }
}

fn numeric_suffix(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let (_, suffix) = stem.rsplit_once('_')?;
    if suffix.is_empty() || !suffix.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// First path whose stem has no `_<digits>` suffix, else the lowest suffix.
pub fn select_keeper(paths: &[PathBuf]) -> Option<&PathBuf> {
    paths
        .iter()
        .find(|path| numeric_suffix(path).is_none())
        .or_else(|| paths.iter().min_by_key(|path| numeric_suffix(path)))
}

/// Every path that is a non-keeper copy in some group.
pub fn redundant_copies(groups: &[DuplicateGroup]) -> HashSet<PathBuf> {
    groups
        .iter()
        .flat_map(|group| group.redundant().cloned())
        .collect()
}

/// Writes `hash,path,keeper` rows, one per file in a duplicate group.
pub fn write_duplicate_csv(path: &Path, groups: &[DuplicateGroup]) -> Result<(), ExtractError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["hash", "path", "keeper"])?;
    for group in groups {
        for member in &group.paths {
            let keeper = if *member == group.keeper { "true" } else { "false" };
            writer.write_record([
                group.digest.as_str(),
                &*member.to_string_lossy(),
                keeper,
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}
