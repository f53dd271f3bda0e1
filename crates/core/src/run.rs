use crate::error::ExtractError;
use crate::ingest::DocumentJob;
use crate::pipeline::{DocumentReport, Pipeline};
use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::warn;

/// One run-log line. Statistics stay empty when the document failed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogRow {
    pub file_path: String,
    pub group: String,
    pub page_count: Option<usize>,
    pub text_length: Option<usize>,
    pub image_count: Option<usize>,
    pub ocr_used: Option<bool>,
    pub error: String,
}

impl LogRow {
    pub fn success(report: &DocumentReport) -> Self {
        Self {
            file_path: report.source.display().to_string(),
            group: report.group.clone(),
            page_count: Some(report.page_count),
            text_length: Some(report.text_length),
            image_count: Some(report.images_saved),
            ocr_used: Some(report.ocr_used),
            error: String::new(),
        }
    }

    pub fn failure(job: &DocumentJob, error: &dyn fmt::Display) -> Self {
        Self {
            file_path: job.source.display().to_string(),
            group: job.group.clone(),
            page_count: None,
            text_length: None,
            image_count: None,
            ocr_used: None,
            error: error.to_string(),
        }
    }
}

/// Append-only CSV log, flushed after every row.
pub struct RunLog {
    writer: csv::Writer<File>,
}

impl RunLog {
    /// Opens `path` for appending; the header is written only into an empty file.
    pub fn open(path: &Path) -> Result<Self, ExtractError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let empty = file.metadata()?.len() == 0;
        let writer = csv::WriterBuilder::new()
            .has_headers(empty)
            .from_writer(file);
        Ok(Self { writer })
    }

    pub fn append(&mut self, row: &LogRow) -> Result<(), ExtractError> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Totals reported at the end of every run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub documents_processed: usize,
    pub documents_failed: usize,
    pub pages_total: usize,
    pub pages_ocr: usize,
    pub pages_ocr_failed: usize,
    pub images_saved: usize,
    pub images_failed: usize,
    pub images_rejected: usize,
    pub tables_exported: usize,
    pub tables_failed: usize,
    pub chunks: usize,
    pub chunks_with_figures: usize,
    pub chunks_with_tables: usize,
    pub image_files_resolved: usize,
    pub fuzzy_injected: usize,
    pub fallback_injected: usize,
    pub cross_chunk_removed: usize,
    pub unassignable_images: usize,
}

impl RunSummary {
    pub fn record(&mut self, report: &DocumentReport) {
        self.documents_processed += 1;
        self.pages_total += report.page_count;
        self.pages_ocr += report.pages_ocr;
        self.pages_ocr_failed += report.pages_ocr_failed;
        self.images_saved += report.images_saved;
        self.images_failed += report.images_failed + report.images_unreadable;
        self.images_rejected += report.images_rejected;
        self.tables_exported += report.tables_exported;
        self.tables_failed += report.tables_failed;
        self.chunks += report.chunk_count;
        self.chunks_with_figures += report.chunks_with_figures;
        self.chunks_with_tables += report.chunks_with_tables;
        self.image_files_resolved += report.resolution.image_files_resolved;
        self.fuzzy_injected += report.resolution.fuzzy_injected;
        self.fallback_injected += report.resolution.fallback_injected;
        self.cross_chunk_removed += report.resolution.cross_chunk_removed.len();
        self.unassignable_images += report.resolution.unassignable.len();
    }

    pub fn record_failure(&mut self) {
        self.documents_failed += 1;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "documents: {} processed, {} failed",
            self.documents_processed, self.documents_failed
        )?;
        writeln!(
            f,
            "pages: {} total, {} via OCR, {} OCR failed",
            self.pages_total, self.pages_ocr, self.pages_ocr_failed
        )?;
        writeln!(
            f,
            "images: {} saved, {} failed, {} rejected",
            self.images_saved, self.images_failed, self.images_rejected
        )?;
        writeln!(
            f,
            "tables: {} exported, {} failed",
            self.tables_exported, self.tables_failed
        )?;
        writeln!(
            f,
            "chunks: {} total, {} with figures, {} with tables",
            self.chunks, self.chunks_with_figures, self.chunks_with_tables
        )?;
        write!(
            f,
            "references: {} image files resolved, {} fuzzy injected, {} fallback injected, {} cross-chunk removed, {} unassignable",
            self.image_files_resolved,
            self.fuzzy_injected,
            self.fallback_injected,
            self.cross_chunk_removed,
            self.unassignable_images
        )
    }
}

/// Records one finished document. A configuration-fatal error is logged and
/// then returned so the caller can stop the run.
pub fn settle(
    job: &DocumentJob,
    outcome: Result<DocumentReport, ExtractError>,
    log: &mut RunLog,
    summary: &mut RunSummary,
) -> Result<(), ExtractError> {
    match outcome {
        Ok(report) => {
            log.append(&LogRow::success(&report))?;
            summary.record(&report);
            Ok(())
        }
        Err(error) => {
            warn!(source = %job.source.display(), error = %error, "document failed");
            log.append(&LogRow::failure(job, &error))?;
            summary.record_failure();
            if error.is_configuration_fatal() {
                Err(error)
            } else {
                Ok(())
            }
        }
    }
}

/// Summary of a run plus the error that stopped it early, if any.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub halted: Option<ExtractError>,
}

/// Processes jobs one after another.
pub fn process_jobs(pipeline: &Pipeline, jobs: &[DocumentJob], log: &mut RunLog) -> RunOutcome {
    let mut summary = RunSummary::default();
    for job in jobs {
        if let Err(error) = settle(job, pipeline.process(job), log, &mut summary) {
            return RunOutcome {
                summary,
                halted: Some(error),
            };
        }
    }
    RunOutcome {
        summary,
        halted: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::plan_jobs;
    use crate::models::ExtractionOptions;
    use crate::pipeline::tests::{scripted_engines, write_scanned_pdf};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn log_rows_append_with_single_header() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("logs").join("run.csv");
        let job = DocumentJob::new(&dir.path().join("pardosa").join("A_2000_B.pdf"), dir.path())?;
        let row = LogRow::failure(&job, &ExtractError::PdfParse("bad xref".to_string()));

        RunLog::open(&path)?.append(&row)?;
        RunLog::open(&path)?.append(&row)?;

        let text = fs::read_to_string(&path)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "file_path,group,page_count,text_length,image_count,ocr_used,error"
        );
        assert!(lines[1].ends_with(",pardosa,,,,,pdf parse error: bad xref"));
        Ok(())
    }

    #[test]
    fn failed_document_does_not_stop_the_run() -> Result<(), Box<dyn std::error::Error>> {
        let input = tempdir()?;
        let output = tempdir()?;
        let group = input.path().join("pardosa");
        fs::create_dir(&group)?;
        fs::write(group.join("Broken_1999_Scan.pdf"), b"%PDF-1.4\n%broken")?;
        write_scanned_pdf(&group.join("Smith_2019_Palps.pdf"))?;

        let pipeline = Pipeline::new(ExtractionOptions::default(), scripted_engines()?)?;
        let jobs = plan_jobs(input.path(), output.path())?;
        let log_path = output.path().join("run.csv");
        let mut log = RunLog::open(&log_path)?;
        let outcome = process_jobs(&pipeline, &jobs, &mut log);
        assert!(outcome.halted.is_none());
        let summary = outcome.summary;

        assert_eq!(summary.documents_processed, 1);
        assert_eq!(summary.documents_failed, 1);
        assert_eq!(summary.pages_total, 2);
        assert_eq!(summary.images_saved, 1);
        assert_eq!(summary.chunks_with_figures, 1);
        assert_eq!(summary.chunks_with_tables, 0);

        let mut reader = csv::Reader::from_path(&log_path)?;
        let rows: Vec<csv::StringRecord> = reader.records().collect::<Result<_, _>>()?;
        assert_eq!(rows.len(), 2);
        assert!(rows[0][6].contains("pdf parse error"));
        assert_eq!(&rows[0][2], "");
        assert_eq!(&rows[1][2], "2");
        assert_eq!(&rows[1][6], "");

        let rendered = summary.to_string();
        assert!(rendered.starts_with("documents: 1 processed, 1 failed"));
        assert!(rendered.contains(&format!(
            "chunks: {} total, 1 with figures, 0 with tables",
            summary.chunks
        )));
        assert!(rendered.contains(&format!(
            "references: {} image files resolved",
            summary.image_files_resolved
        )));
        Ok(())
    }
}
