//! Rendering and recognition engines consumed as black boxes.
//!
//! The OCR fallback only needs "render this page to a raster" and
//! "recognize text in this raster". Local adapters shell out to poppler's
//! `pdftoppm` and to `tesseract`; [`HttpRecognizer`] posts the raster to a
//! remote OCR endpoint instead.

use crate::error::ExtractError;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, ImageFormat};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

pub trait PageRenderer: Send + Sync {
    fn render_page(&self, source: &Path, page: u32, dpi: u32) -> Result<DynamicImage, ExtractError>;
}

pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &DynamicImage, languages: &[String]) -> Result<String, ExtractError>;
}

#[derive(Debug, Clone)]
pub struct PdftoppmRenderer {
    pub program: PathBuf,
}

impl Default for PdftoppmRenderer {
    fn default() -> Self {
        Self {
            program: PathBuf::from("pdftoppm"),
        }
    }
}

impl PdftoppmRenderer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn probe(&self) -> Result<(), ExtractError> {
        run(&self.program, "pdftoppm", |command| {
            command.arg("-v");
        })
        .map(|_| ())
    }
}

impl PageRenderer for PdftoppmRenderer {
    fn render_page(&self, source: &Path, page: u32, dpi: u32) -> Result<DynamicImage, ExtractError> {
        let workdir = tempfile::tempdir()?;
        let prefix = workdir.path().join("page");
        let output = run(&self.program, "pdftoppm", |command| {
            command
                .arg("-f")
                .arg(page.to_string())
                .arg("-l")
                .arg(page.to_string())
                .arg("-r")
                .arg(dpi.to_string())
                .arg("-png")
                .arg("-singlefile")
                .arg(source)
                .arg(&prefix);
        })?;

        if !output.status.success() {
            return Err(ExtractError::RenderFailed(format!(
                "pdftoppm exited with {} for page {page}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(image::open(prefix.with_extension("png"))?)
    }
}

#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    pub program: PathBuf,
}

impl Default for TesseractRecognizer {
    fn default() -> Self {
        Self {
            program: PathBuf::from("tesseract"),
        }
    }
}

impl TesseractRecognizer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn probe(&self) -> Result<(), ExtractError> {
        run(&self.program, "tesseract", |command| {
            command.arg("--version");
        })
        .map(|_| ())
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn recognize(&self, image: &DynamicImage, languages: &[String]) -> Result<String, ExtractError> {
        let workdir = tempfile::tempdir()?;
        let raster = workdir.path().join("page.png");
        image.save_with_format(&raster, ImageFormat::Png)?;

        let output = run(&self.program, "tesseract", |command| {
            command.arg(&raster).arg("stdout");
            if !languages.is_empty() {
                command.arg("-l").arg(languages.join("+"));
            }
        })?;

        if !output.status.success() {
            return Err(ExtractError::OcrFailed(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn run(
    program: &Path,
    engine: &str,
    configure: impl FnOnce(&mut Command),
) -> Result<Output, ExtractError> {
    let mut command = Command::new(program);
    configure(&mut command);
    command.output().map_err(|error| match error.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            ExtractError::EngineUnavailable {
                engine: engine.to_string(),
                details: format!("{}: {error}", program.display()),
            }
        }
        _ => ExtractError::Io(error),
    })
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl OcrEndpointConfig {
    /// Blank values count as unset.
    pub fn new(endpoint: String, api_key: Option<String>) -> Option<Self> {
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }

        let api_key = api_key.and_then(|value| {
            let key = value.trim().to_string();
            if key.is_empty() {
                None
            } else {
                Some(key)
            }
        });

        Some(Self { endpoint, api_key })
    }
}

#[derive(Debug, Clone, Serialize)]
struct OcrRequest<'a> {
    image_base64: String,
    languages: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    lines: Option<Vec<String>>,
}

/// Recognition through a remote OCR service.
#[derive(Debug, Clone)]
pub struct HttpRecognizer {
    config: OcrEndpointConfig,
    timeout: Duration,
}

impl HttpRecognizer {
    pub fn new(config: OcrEndpointConfig) -> Result<Self, ExtractError> {
        url::Url::parse(&config.endpoint)?;
        Ok(Self {
            config,
            timeout: Duration::from_secs(120),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl TextRecognizer for HttpRecognizer {
    fn recognize(&self, image: &DynamicImage, languages: &[String]) -> Result<String, ExtractError> {
        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        let payload = OcrRequest {
            image_base64: STANDARD.encode(png),
            languages,
        };

        let client = Client::builder().timeout(self.timeout).build()?;
        let mut request = client
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().map_err(|error| {
            if error.is_connect() {
                ExtractError::EngineUnavailable {
                    engine: "ocr endpoint".to_string(),
                    details: format!("{}: {error}", self.config.endpoint),
                }
            } else {
                ExtractError::Http(error)
            }
        })?;

        if !response.status().is_success() {
            return Err(ExtractError::OcrFailed(format!(
                "OCR request to {} returned {}",
                self.config.endpoint,
                response.status()
            )));
        }

        let payload: OcrResponse = response.json()?;
        payload_to_text(payload)
    }
}

fn payload_to_text(payload: OcrResponse) -> Result<String, ExtractError> {
    if let Some(text) = payload.text.filter(|text| !text.trim().is_empty()) {
        return Ok(text);
    }

    if let Some(lines) = payload.lines {
        let joined = lines
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if !joined.is_empty() {
            return Ok(joined);
        }
    }

    Err(ExtractError::OcrFailed(
        "OCR response has no readable text".to_string(),
    ))
}
