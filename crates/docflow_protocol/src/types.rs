//! Canonical enums shared by the classifier, repair engines and router.
//!
//! Every enum here is closed: new variants require a matching arm in each
//! dispatch table (classifier, converter map, layout).

use crate::state::{Cycle, State};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// File kinds
// ============================================================================

/// True content type of a file, as detected from its bytes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Pdf,
    Docx,
    Xlsx,
    Pptx,
    Doc,
    Xls,
    Ppt,
    Rtf,
    Odt,
    Ods,
    Odp,
    Html,
    Xml,
    Text,
    Jpeg,
    Png,
    Tiff,
    Bmp,
    Gif,
    Zip,
    Rar,
    #[serde(rename = "7z")]
    SevenZip,
    Tar,
    Gzip,
    Signature,
    Executable,
    Media,
    Empty,
    #[default]
    Unknown,
}

/// What the pipeline must do with a file of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    /// Consumable as-is by downstream processing.
    Direct,
    /// Legacy office format, needs conversion.
    Convert,
    /// Archive, needs extraction.
    Extract,
    /// Content is fine but the name is wrong.
    Normalize,
    /// Routable by nobody (signatures, executables, media).
    Special,
    Empty,
    Unknown,
}

impl FileKind {
    pub const ALL: [FileKind; 29] = [
        FileKind::Pdf,
        FileKind::Docx,
        FileKind::Xlsx,
        FileKind::Pptx,
        FileKind::Doc,
        FileKind::Xls,
        FileKind::Ppt,
        FileKind::Rtf,
        FileKind::Odt,
        FileKind::Ods,
        FileKind::Odp,
        FileKind::Html,
        FileKind::Xml,
        FileKind::Text,
        FileKind::Jpeg,
        FileKind::Png,
        FileKind::Tiff,
        FileKind::Bmp,
        FileKind::Gif,
        FileKind::Zip,
        FileKind::Rar,
        FileKind::SevenZip,
        FileKind::Tar,
        FileKind::Gzip,
        FileKind::Signature,
        FileKind::Executable,
        FileKind::Media,
        FileKind::Empty,
        FileKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Docx => "docx",
            FileKind::Xlsx => "xlsx",
            FileKind::Pptx => "pptx",
            FileKind::Doc => "doc",
            FileKind::Xls => "xls",
            FileKind::Ppt => "ppt",
            FileKind::Rtf => "rtf",
            FileKind::Odt => "odt",
            FileKind::Ods => "ods",
            FileKind::Odp => "odp",
            FileKind::Html => "html",
            FileKind::Xml => "xml",
            FileKind::Text => "text",
            FileKind::Jpeg => "jpeg",
            FileKind::Png => "png",
            FileKind::Tiff => "tiff",
            FileKind::Bmp => "bmp",
            FileKind::Gif => "gif",
            FileKind::Zip => "zip",
            FileKind::Rar => "rar",
            FileKind::SevenZip => "7z",
            FileKind::Tar => "tar",
            FileKind::Gzip => "gzip",
            FileKind::Signature => "signature",
            FileKind::Executable => "executable",
            FileKind::Media => "media",
            FileKind::Empty => "empty",
            FileKind::Unknown => "unknown",
        }
    }

    /// Extensions considered correct for this kind, canonical one first.
    ///
    /// Empty for kinds that have no single correct name (text, special files).
    pub fn accepted_extensions(&self) -> &'static [&'static str] {
        match self {
            FileKind::Pdf => &["pdf"],
            FileKind::Docx => &["docx"],
            FileKind::Xlsx => &["xlsx"],
            FileKind::Pptx => &["pptx"],
            FileKind::Doc => &["doc"],
            FileKind::Xls => &["xls"],
            FileKind::Ppt => &["ppt"],
            FileKind::Rtf => &["rtf"],
            FileKind::Odt => &["odt"],
            FileKind::Ods => &["ods"],
            FileKind::Odp => &["odp"],
            FileKind::Html => &["html", "htm"],
            FileKind::Xml => &["xml"],
            FileKind::Jpeg => &["jpg", "jpeg", "jpe"],
            FileKind::Png => &["png"],
            FileKind::Tiff => &["tif", "tiff"],
            FileKind::Bmp => &["bmp"],
            FileKind::Gif => &["gif"],
            FileKind::Zip => &["zip"],
            FileKind::Rar => &["rar"],
            FileKind::SevenZip => &["7z"],
            FileKind::Tar => &["tar"],
            FileKind::Gzip => &["gz", "tgz"],
            FileKind::Text
            | FileKind::Signature
            | FileKind::Executable
            | FileKind::Media
            | FileKind::Empty
            | FileKind::Unknown => &[],
        }
    }

    pub fn canonical_extension(&self) -> Option<&'static str> {
        self.accepted_extensions().first().copied()
    }

    /// Whether `ext` (without dot, any case) is a correct extension for this kind.
    ///
    /// Kinds without accepted extensions accept any name.
    pub fn matches_extension(&self, ext: Option<&str>) -> bool {
        let accepted = self.accepted_extensions();
        if accepted.is_empty() {
            return true;
        }
        match ext {
            Some(ext) => accepted.iter().any(|a| a.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }

    /// Category implied by the content alone (name issues are layered on by the classifier).
    pub fn base_category(&self) -> FileCategory {
        match self {
            FileKind::Pdf
            | FileKind::Docx
            | FileKind::Xlsx
            | FileKind::Pptx
            | FileKind::Html
            | FileKind::Xml
            | FileKind::Text
            | FileKind::Jpeg
            | FileKind::Png
            | FileKind::Tiff
            | FileKind::Bmp
            | FileKind::Gif => FileCategory::Direct,
            FileKind::Doc
            | FileKind::Xls
            | FileKind::Ppt
            | FileKind::Rtf
            | FileKind::Odt
            | FileKind::Ods
            | FileKind::Odp => FileCategory::Convert,
            FileKind::Zip | FileKind::Rar | FileKind::SevenZip | FileKind::Tar | FileKind::Gzip => {
                FileCategory::Extract
            }
            FileKind::Signature | FileKind::Executable | FileKind::Media => FileCategory::Special,
            FileKind::Empty => FileCategory::Empty,
            FileKind::Unknown => FileCategory::Unknown,
        }
    }

    /// Target format for convertible kinds.
    pub fn conversion_target(&self) -> Option<FileKind> {
        match self {
            FileKind::Doc | FileKind::Rtf | FileKind::Odt => Some(FileKind::Docx),
            FileKind::Xls | FileKind::Ods => Some(FileKind::Xlsx),
            FileKind::Ppt | FileKind::Odp => Some(FileKind::Pptx),
            _ => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(
            self,
            FileKind::Jpeg | FileKind::Png | FileKind::Tiff | FileKind::Bmp | FileKind::Gif
        )
    }

    /// Downstream route for a directly consumable file.
    pub fn route(&self, needs_processing: bool) -> Option<Route> {
        match self {
            FileKind::Pdf if needs_processing => Some(Route::PdfScan),
            FileKind::Pdf => Some(Route::PdfText),
            FileKind::Docx => Some(Route::Docx),
            FileKind::Xlsx => Some(Route::Xlsx),
            FileKind::Pptx => Some(Route::Pptx),
            FileKind::Html => Some(Route::Html),
            FileKind::Xml => Some(Route::Xml),
            FileKind::Text => Some(Route::Text),
            k if k.is_image() => Some(Route::ImageOcr),
            _ => None,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileKind::ALL
            .iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("Invalid file kind: '{}'", s))
    }
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Direct => "direct",
            FileCategory::Convert => "convert",
            FileCategory::Extract => "extract",
            FileCategory::Normalize => "normalize",
            FileCategory::Special => "special",
            FileCategory::Empty => "empty",
            FileCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Routes
// ============================================================================

/// Downstream handling route of a merge-ready unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    PdfText,
    PdfScan,
    Docx,
    Xlsx,
    Pptx,
    Html,
    Xml,
    Text,
    ImageOcr,
    Mixed,
}

impl Route {
    pub const ALL: [Route; 10] = [
        Route::PdfText,
        Route::PdfScan,
        Route::Docx,
        Route::Xlsx,
        Route::Pptx,
        Route::Html,
        Route::Xml,
        Route::Text,
        Route::ImageOcr,
        Route::Mixed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::PdfText => "pdf_text",
            Route::PdfScan => "pdf_scan",
            Route::Docx => "docx",
            Route::Xlsx => "xlsx",
            Route::Pptx => "pptx",
            Route::Html => "html",
            Route::Xml => "xml",
            Route::Text => "text",
            Route::ImageOcr => "image_ocr",
            Route::Mixed => "mixed",
        }
    }

    /// Routes that agree on family can share a unit (scanned and text PDFs).
    pub fn family(&self) -> Route {
        match self {
            Route::PdfScan => Route::PdfText,
            other => *other,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Route {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Route::ALL
            .iter()
            .find(|r| r.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid route: '{}'", s))
    }
}

// ============================================================================
// Repair operations
// ============================================================================

/// Repair operation type. Also the key for circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Convert,
    Extract,
    Normalize,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Convert,
        OperationKind::Extract,
        OperationKind::Normalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Convert => "CONVERT",
            OperationKind::Extract => "EXTRACT",
            OperationKind::Normalize => "NORMALIZE",
        }
    }

    /// Directory name under `Processing/Processing_<n>/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            OperationKind::Convert => "Convert",
            OperationKind::Extract => "Extract",
            OperationKind::Normalize => "Normalize",
        }
    }

    /// Quarantine category used when this repair is exhausted.
    pub fn failure_category(&self) -> ExceptionCategory {
        match self {
            OperationKind::Convert => ExceptionCategory::ConversionFailed,
            OperationKind::Extract => ExceptionCategory::ExtractionFailed,
            OperationKind::Normalize => ExceptionCategory::NormalizationFailed,
        }
    }

    pub fn pending_state(&self, cycle: Cycle) -> State {
        match self {
            OperationKind::Convert => State::PendingConvert(cycle),
            OperationKind::Extract => State::PendingExtract(cycle),
            OperationKind::Normalize => State::PendingNormalize(cycle),
        }
    }

    /// Repair operation a pending state is waiting on.
    pub fn for_pending(state: State) -> Option<OperationKind> {
        match state {
            State::PendingConvert(_) => Some(OperationKind::Convert),
            State::PendingExtract(_) => Some(OperationKind::Extract),
            State::PendingNormalize(_) => Some(OperationKind::Normalize),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CONVERT" => Ok(OperationKind::Convert),
            "EXTRACT" => Ok(OperationKind::Extract),
            "NORMALIZE" | "RENAME" => Ok(OperationKind::Normalize),
            _ => Err(format!("Invalid operation kind: '{}'", s)),
        }
    }
}

/// Result of a single recorded transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failed,
}

// ============================================================================
// Quarantine
// ============================================================================

/// Closed set of quarantine buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionCategory {
    Empty,
    Special,
    Ambiguous,
    Mixed,
    ConversionFailed,
    ExtractionFailed,
    NormalizationFailed,
    Anomaly,
}

impl ExceptionCategory {
    pub const ALL: [ExceptionCategory; 8] = [
        ExceptionCategory::Empty,
        ExceptionCategory::Special,
        ExceptionCategory::Ambiguous,
        ExceptionCategory::Mixed,
        ExceptionCategory::ConversionFailed,
        ExceptionCategory::ExtractionFailed,
        ExceptionCategory::NormalizationFailed,
        ExceptionCategory::Anomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionCategory::Empty => "EMPTY",
            ExceptionCategory::Special => "SPECIAL",
            ExceptionCategory::Ambiguous => "AMBIGUOUS",
            ExceptionCategory::Mixed => "MIXED",
            ExceptionCategory::ConversionFailed => "CONVERSION_FAILED",
            ExceptionCategory::ExtractionFailed => "EXTRACTION_FAILED",
            ExceptionCategory::NormalizationFailed => "NORMALIZATION_FAILED",
            ExceptionCategory::Anomaly => "ANOMALY",
        }
    }

    /// Bucket directory name under `Exceptions/Cycle_<n>/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ExceptionCategory::Empty => "Empty",
            ExceptionCategory::Special => "Special",
            ExceptionCategory::Ambiguous => "Ambiguous",
            ExceptionCategory::Mixed => "Mixed",
            ExceptionCategory::ConversionFailed => "ConversionFailed",
            ExceptionCategory::ExtractionFailed => "ExtractionFailed",
            ExceptionCategory::NormalizationFailed => "NormalizationFailed",
            ExceptionCategory::Anomaly => "Anomaly",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<ExceptionCategory> {
        ExceptionCategory::ALL
            .iter()
            .find(|c| c.dir_name() == name)
            .copied()
    }
}

impl fmt::Display for ExceptionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExceptionCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExceptionCategory::ALL
            .iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s) || c.dir_name() == s)
            .copied()
            .ok_or_else(|| format!("Invalid exception category: '{}'", s))
    }
}

/// How the classifier treats units whose files disagree on route family.
///
/// Repair always takes precedence: a mixed unit with files needing
/// conversion, extraction or renaming is repaired first and the policy only
/// applies once nothing is left to repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixedPolicy {
    /// Quarantine as `Ambiguous`.
    #[default]
    Ambiguous,
    /// Quarantine as `Mixed`.
    Mixed,
    /// Merge under the `mixed` route.
    Accept,
}
