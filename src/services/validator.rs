//! Pre-parse validation: extension, declared content type, magic signature and size
//! must agree before any container parser runs.

use crate::error::AppError;
use crate::models::{FileFormat, FormatFamily};
use serde::Serialize;
use std::path::Path;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Local file header of a zip archive (`PK\x03\x04`). Only the first two bytes are
/// required so empty archives (`PK\x05\x06`) still reach the container parser.
pub const ZIP_SIGNATURE: &[u8] = b"PK";
/// Compound document (OLE2) header.
pub const COMPOUND_SIGNATURE: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub valid: bool,
    pub format: Option<FileFormat>,
    pub family: Option<FormatFamily>,
    pub size_bytes: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FormatValidator {
    max_file_size: u64,
}

impl FormatValidator {
    pub fn new(max_file_size: usize) -> Self {
        Self {
            max_file_size: max_file_size as u64,
        }
    }

    pub fn expected_signature(family: FormatFamily) -> Option<&'static [u8]> {
        match family {
            FormatFamily::Modern | FormatFamily::Binary | FormatFamily::OpenDocument => Some(ZIP_SIGNATURE),
            FormatFamily::Legacy => Some(COMPOUND_SIGNATURE),
            FormatFamily::Delimited => None,
        }
    }

    /// Never fails for malformed input; every problem lands in `errors`.
    pub fn validate(&self, data: &[u8], filename: &str, content_type: Option<&str>) -> ValidationOutcome {
        let mut errors = Vec::new();
        let size = data.len() as u64;

        let format = FileFormat::from_filename(filename);
        match format {
            None => errors.push(format!(
                "Unsupported file extension for '{}'",
                filename
            )),
            Some(format) => {
                if let Some(declared) = content_type.map(str::trim).filter(|ct| !ct.is_empty()) {
                    if !content_type_matches(format, declared) {
                        errors.push(format!(
                            "Content type '{}' does not match .{} file",
                            declared, format
                        ));
                    }
                }
            }
        }

        if size == 0 {
            errors.push("Empty file".to_string());
        } else {
            if let Some(format) = format {
                if let Some(signature) = Self::expected_signature(format.family()) {
                    if !data.starts_with(signature) {
                        errors.push(format!(
                            "Signature mismatch: .{} files must start with {}",
                            format,
                            crate::models::signature_hex(signature, signature.len())
                        ));
                    }
                }
            }
            if size > self.max_file_size {
                errors.push(format!(
                    "File too large: {} bytes exceeds the {} byte limit",
                    size, self.max_file_size
                ));
            }
        }

        if !errors.is_empty() {
            tracing::warn!("Validation failed for {}: {:?}", filename, errors);
        }

        ValidationOutcome {
            valid: errors.is_empty(),
            format,
            family: format.map(|f| f.family()),
            size_bytes: size,
            errors,
        }
    }

    /// Reads the file from disk first; only the read itself can fail.
    pub fn validate_path(&self, path: &Path, content_type: Option<&str>) -> Result<ValidationOutcome, AppError> {
        let data = std::fs::read(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(self.validate(&data, &filename, content_type))
    }
}

fn content_type_matches(format: FileFormat, declared: &str) -> bool {
    // Parameters such as `; charset=utf-8` are ignored.
    let essence = declared
        .split(';')
        .next()
        .unwrap_or(declared)
        .trim()
        .to_ascii_lowercase();
    essence == OCTET_STREAM || format.expected_content_types().iter().any(|ct| *ct == essence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ALL_FORMATS;

    fn zip_bytes() -> Vec<u8> {
        let mut data = b"PK\x03\x04".to_vec();
        data.extend_from_slice(&[0u8; 60]);
        data
    }

    fn compound_bytes() -> Vec<u8> {
        let mut data = COMPOUND_SIGNATURE.to_vec();
        data.extend_from_slice(&[0u8; 504]);
        data
    }

    #[test]
    fn accepts_matching_zip_container() {
        let validator = FormatValidator::new(1024);
        let outcome = validator.validate(
            &zip_bytes(),
            "report.xlsx",
            Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
        );
        assert!(outcome.valid, "{:?}", outcome.errors);
        assert_eq!(outcome.format, Some(FileFormat::Xlsx));
        assert_eq!(outcome.family, Some(FormatFamily::Modern));
    }

    #[test]
    fn signature_mismatch_fails_for_every_signed_format() {
        let validator = FormatValidator::new(1024 * 1024);
        for format in ALL_FORMATS {
            let wrong = match format.family() {
                FormatFamily::Legacy => zip_bytes(),
                FormatFamily::Delimited => continue,
                _ => compound_bytes(),
            };
            for content_type in [None, Some(OCTET_STREAM), Some(format.expected_content_types()[0])] {
                let name = format!("file.{}", format);
                let outcome = validator.validate(&wrong, &name, content_type);
                assert!(!outcome.valid, "{} with {:?} should fail", name, content_type);
                assert!(
                    outcome.errors.iter().any(|e| e.starts_with("Signature mismatch")),
                    "{:?}",
                    outcome.errors
                );
            }
        }
    }

    #[test]
    fn empty_file_skips_signature_check() {
        let validator = FormatValidator::new(1024);
        let outcome = validator.validate(&[], "empty.xlsx", None);
        assert!(!outcome.valid);
        assert_eq!(outcome.errors, vec!["Empty file".to_string()]);
    }

    #[test]
    fn delimited_text_has_no_signature() {
        let validator = FormatValidator::new(1024);
        let outcome = validator.validate(b"a,b\n1,2\n", "data.csv", Some("text/csv; charset=utf-8"));
        assert!(outcome.valid, "{:?}", outcome.errors);
        assert_eq!(outcome.family, Some(FormatFamily::Delimited));
    }

    #[test]
    fn wrong_content_type_is_reported() {
        let validator = FormatValidator::new(1024);
        let outcome = validator.validate(&compound_bytes(), "old.xls", Some("image/png"));
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("image/png"));
    }

    #[test]
    fn octet_stream_is_always_accepted() {
        let validator = FormatValidator::new(1024);
        let outcome = validator.validate(&compound_bytes(), "old.xlt", Some(OCTET_STREAM));
        assert!(outcome.valid, "{:?}", outcome.errors);
    }

    #[test]
    fn oversized_and_unknown_files_fail() {
        let validator = FormatValidator::new(16);
        let outcome = validator.validate(&zip_bytes(), "big.ods", None);
        assert!(outcome.errors.iter().any(|e| e.starts_with("File too large")));

        let outcome = validator.validate(b"hello", "notes.txt", None);
        assert!(!outcome.valid);
        assert_eq!(outcome.format, None);
    }

    #[test]
    fn validate_path_surfaces_io_errors() {
        let validator = FormatValidator::new(16);
        let result = validator.validate_path(Path::new("/definitely/not/here.xlsx"), None);
        assert!(matches!(result, Err(AppError::IoError(_))));
    }
}
