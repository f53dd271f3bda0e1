use crate::error::ExtractError;
use crate::models::ParsedFilename;
use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

const UNGROUPED: &str = "ungrouped";

static YEAR_TOKEN: OnceLock<Regex> = OnceLock::new();

fn year_token() -> Result<&'static Regex, ExtractError> {
    if let Some(pattern) = YEAR_TOKEN.get() {
        return Ok(pattern);
    }
    let compiled = Regex::new(r"(?:^|_)([0-9]{4}[a-z]?)(?:_|$)")?;
    Ok(YEAR_TOKEN.get_or_init(|| compiled))
}

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        if is_pdf(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

pub fn digest_file(path: &Path) -> Result<String, ExtractError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn generate_document_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct DocumentFingerprint {
    pub document_id: String,
    pub file_name: String,
    pub source_path: String,
    pub checksum: String,
    pub extracted_at: DateTime<Utc>,
}

pub fn build_document_fingerprint(path: &Path) -> Result<DocumentFingerprint, ExtractError> {
    let checksum = digest_file(path)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ExtractError::MissingFileName(path.display().to_string()))?;

    Ok(DocumentFingerprint {
        document_id: generate_document_id(path),
        file_name: name.to_string(),
        source_path: path.to_string_lossy().to_string(),
        checksum,
        extracted_at: Utc::now(),
    })
}

/// Splits an `Author_Year_Title` stem. The year is the first
/// underscore-delimited token of four digits with an optional lowercase
/// letter; without one the stem is split on its first two underscores.
pub fn parse_filename(stem: &str) -> Result<ParsedFilename, ExtractError> {
    if let Some(captures) = year_token()?.captures(stem) {
        if let (Some(whole), Some(token)) = (captures.get(0), captures.get(1)) {
            return Ok(ParsedFilename {
                author: stem[..whole.start()].to_string(),
                year: token.as_str().to_string(),
                title: stem[whole.end()..].replace('_', " ").trim().to_string(),
            });
        }
    }

    let mut parts = stem.splitn(3, '_');
    Ok(ParsedFilename {
        author: parts.next().unwrap_or_default().to_string(),
        year: parts.next().unwrap_or_default().to_string(),
        title: parts
            .next()
            .map(|rest| rest.replace('_', " ").trim().to_string())
            .unwrap_or_default(),
    })
}

/// One PDF and where its artifacts go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentJob {
    pub source: PathBuf,
    /// Name of the directory holding the PDF.
    pub group: String,
    pub stem: String,
    /// `<output>/<group>/<stem>`.
    pub output_dir: PathBuf,
}

impl DocumentJob {
    pub fn new(source: &Path, output_root: &Path) -> Result<Self, ExtractError> {
        let stem = source
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| ExtractError::MissingFileName(source.display().to_string()))?
            .to_string();
        let group = source
            .parent()
            .and_then(|parent| parent.file_name())
            .and_then(|name| name.to_str())
            .unwrap_or(UNGROUPED)
            .to_string();

        Ok(Self {
            source: source.to_path_buf(),
            output_dir: output_root.join(&group).join(&stem),
            group,
            stem,
        })
    }
}

/// Jobs for a single PDF or every PDF under a folder, in path order.
pub fn plan_jobs(input: &Path, output_root: &Path) -> Result<Vec<DocumentJob>, ExtractError> {
    if input.is_file() {
        if !is_pdf(input) {
            return Err(ExtractError::InvalidArgument(format!(
                "not a pdf file: {}",
                input.display()
            )));
        }
        return Ok(vec![DocumentJob::new(input, output_root)?]);
    }

    let files = discover_pdf_files(input);
    if files.is_empty() {
        return Err(ExtractError::InvalidArgument(format!(
            "no pdf files found in {}",
            input.display()
        )));
    }

    files
        .iter()
        .map(|path| DocumentJob::new(path, output_root))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn discover_pdf_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("b.PDF"))
            .and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("notes.txt"))?;

        let files = discover_pdf_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file_path = dir.path().join("a.pdf");
        fs::write(&file_path, b"abc")?;

        let first = digest_file(&file_path)?;
        let second = digest_file(&file_path)?;
        assert_eq!(first, second);
        assert_ne!(first, generate_document_id(&file_path));
        Ok(())
    }

    #[test]
    fn filename_with_year_token() -> Result<(), ExtractError> {
        let parsed = parse_filename("Smith_2019a_New_species_of_Pardosa")?;
        assert_eq!(parsed.author, "Smith");
        assert_eq!(parsed.year, "2019a");
        assert_eq!(parsed.title, "New species of Pardosa");

        let parsed = parse_filename("Ivanov_Petrov_1987_Spiders_of_Altai")?;
        assert_eq!(parsed.author, "Ivanov_Petrov");
        assert_eq!(parsed.year, "1987");
        assert_eq!(parsed.title, "Spiders of Altai");

        let parsed = parse_filename("2001_Checklist")?;
        assert_eq!(parsed.author, "");
        assert_eq!(parsed.year, "2001");
        assert_eq!(parsed.title, "Checklist");
        Ok(())
    }

    #[test]
    fn year_pattern_is_compiled_once() -> Result<(), ExtractError> {
        let first = year_token()?;
        parse_filename("Smith_2019_Title")?;
        assert!(std::ptr::eq(first, year_token()?));
        Ok(())
    }

    #[test]
    fn filename_without_year_splits_on_underscores() -> Result<(), ExtractError> {
        let parsed = parse_filename("Koch_undated_Die_Arachniden")?;
        assert_eq!(parsed.author, "Koch");
        assert_eq!(parsed.year, "undated");
        assert_eq!(parsed.title, "Die Arachniden");

        // Five digits is not a year token.
        let parsed = parse_filename("Simon_18921_x")?;
        assert_eq!(parsed.year, "18921");

        let parsed = parse_filename("monograph")?;
        assert_eq!(parsed.author, "monograph");
        assert_eq!(parsed.year, "");
        assert_eq!(parsed.title, "");
        Ok(())
    }

    #[test]
    fn jobs_are_grouped_by_parent_directory() -> Result<(), Box<dyn std::error::Error>> {
        let input = tempdir()?;
        let output = tempdir()?;
        let group = input.path().join("pardosa");
        fs::create_dir(&group)?;
        fs::write(group.join("Smith_2019_Palps.pdf"), b"%PDF-1.4")?;

        let jobs = plan_jobs(input.path(), output.path())?;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].group, "pardosa");
        assert_eq!(jobs[0].stem, "Smith_2019_Palps");
        assert_eq!(
            jobs[0].output_dir,
            output.path().join("pardosa").join("Smith_2019_Palps")
        );
        Ok(())
    }

    #[test]
    fn planning_fails_without_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let result = plan_jobs(dir.path(), dir.path());
        assert!(matches!(result, Err(ExtractError::InvalidArgument(_))));

        let text = dir.path().join("notes.txt");
        fs::write(&text, b"x")?;
        assert!(plan_jobs(&text, dir.path()).is_err());
        Ok(())
    }
}
