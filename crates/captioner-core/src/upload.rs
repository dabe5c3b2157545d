//! Upload validation.
//!
//! Uploads cross two trust boundaries before reaching the model:
//!
//! 1. [`validate`] checks what the client *declared*: the filename extension
//!    and the multipart content type. Cheap, runs on every upload.
//! 2. [`sniff`] checks what the bytes *are*, by magic number, right before
//!    decoding. A client can declare `image/png` for any payload, so a
//!    passing declaration is never taken as proof of content.

use std::fmt;

/// Filename suffixes accepted by the declared-type check.
pub const ACCEPTED_EXTENSIONS: [&str; 3] = [".jpg", ".jpeg", ".png"];

/// Content types accepted both as declared and as sniffed.
pub const ACCEPTED_CONTENT_TYPES: [&str; 2] = ["image/jpeg", "image/png"];

/// A file received from a client, owned by a single request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub declared_content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(
        filename: impl Into<String>,
        declared_content_type: Option<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            filename: filename.into(),
            declared_content_type,
            bytes,
        }
    }

    /// The declared content type, or `"<none>"` for log lines.
    pub fn declared_type(&self) -> &str {
        self.declared_content_type.as_deref().unwrap_or("<none>")
    }
}

/// Why a declared upload was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    BadExtension,
    BadSignature,
    BadBoth,
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ValidationReason::BadExtension => "Invalid File Format",
            ValidationReason::BadSignature => "Invalid File Signature",
            ValidationReason::BadBoth => "Invalid File Format and Signature",
        };
        f.write_str(message)
    }
}

/// Result of the declared-type check.
#[derive(Debug)]
pub enum ValidationOutcome {
    Valid(UploadedFile),
    Invalid(ValidationReason),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid(_))
    }
}

/// Combine the two independent check results into one verdict.
pub fn classify(extension_ok: bool, signature_ok: bool) -> Result<(), ValidationReason> {
    match (extension_ok, signature_ok) {
        (true, true) => Ok(()),
        (false, true) => Err(ValidationReason::BadExtension),
        (true, false) => Err(ValidationReason::BadSignature),
        (false, false) => Err(ValidationReason::BadBoth),
    }
}

/// Whether the filename ends with an accepted suffix (case-sensitive).
pub fn has_accepted_extension(filename: &str) -> bool {
    ACCEPTED_EXTENSIONS
        .iter()
        .any(|ext| filename.ends_with(ext))
}

/// Whether the client-declared content type is accepted.
pub fn has_accepted_content_type(declared: Option<&str>) -> bool {
    declared.is_some_and(|ct| ACCEPTED_CONTENT_TYPES.contains(&ct))
}

/// Check the declared extension and content type of an upload.
///
/// Both checks always run; the outcome names every check that failed.
pub fn validate(file: UploadedFile) -> ValidationOutcome {
    let extension_ok = has_accepted_extension(&file.filename);
    let signature_ok = has_accepted_content_type(file.declared_content_type.as_deref());

    match classify(extension_ok, signature_ok) {
        Ok(()) => ValidationOutcome::Valid(file),
        Err(reason) => ValidationOutcome::Invalid(reason),
    }
}

/// Image types the content sniff accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
}

impl ImageKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
        }
    }

    pub fn format(&self) -> image::ImageFormat {
        match self {
            ImageKind::Jpeg => image::ImageFormat::Jpeg,
            ImageKind::Png => image::ImageFormat::Png,
        }
    }
}

/// Determine the true media type of `bytes` from their magic number.
///
/// Returns the detected MIME type as the error when it is not an accepted
/// image type. Unrecognized UTF-8 content is reported as `text/plain`.
pub fn sniff(bytes: &[u8]) -> Result<ImageKind, String> {
    match infer::get(bytes) {
        Some(kind) if kind.mime_type() == "image/jpeg" => Ok(ImageKind::Jpeg),
        Some(kind) if kind.mime_type() == "image/png" => Ok(ImageKind::Png),
        Some(kind) => Err(kind.mime_type().to_string()),
        None if bytes.is_empty() => Err("application/x-empty".to_string()),
        None if std::str::from_utf8(bytes).is_ok() => Err("text/plain".to_string()),
        None => Err("application/octet-stream".to_string()),
    }
}
