//! Content-based file type detection.
//!
//! Names lie; bytes do not. Detection reads the head of the file and asks
//! `infer` first, then falls back to a few text sniffers. Container formats
//! (zip based office files, OLE) get a second look because their magic
//! numbers are shared between several kinds.

use docflow_protocol::FileKind;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use zip::ZipArchive;

/// Bytes read for magic-number sniffing.
const HEAD_LEN: usize = 64 * 1024;

/// Upper bound on bytes scanned for PDF font resources.
const PDF_SCAN_LIMIT: u64 = 32 * 1024 * 1024;

const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

const SIGNATURE_EXTENSIONS: &[&str] = &["sig", "p7s", "p7m", "pem", "cer", "crt", "der", "asc"];
const EXECUTABLE_EXTENSIONS: &[&str] = &["exe", "dll", "msi", "bat", "cmd", "sh", "com", "jar"];
const MEDIA_EXTENSIONS: &[&str] = &[
    "mp3", "mp4", "wav", "avi", "mov", "mkv", "flac", "ogg", "wma", "wmv",
];

/// Result of inspecting one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub kind: FileKind,
    /// Needs OCR style processing (image-only PDF, raster image).
    pub needs_processing: bool,
    /// How the kind was determined, for the classification record.
    pub detail: Option<String>,
}

impl Detection {
    fn new(kind: FileKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            needs_processing: kind.is_image(),
            detail: Some(detail.into()),
        }
    }
}

/// Detect the true kind of the file at `path`.
pub fn detect_path(path: &Path) -> io::Result<Detection> {
    let len = std::fs::metadata(path)?.len();
    if len == 0 {
        return Ok(Detection::new(FileKind::Empty, "zero length"));
    }

    let mut head = Vec::with_capacity(HEAD_LEN.min(len as usize));
    File::open(path)?
        .take(HEAD_LEN as u64)
        .read_to_end(&mut head)?;
    let ext = extension_of(path);

    let mut detection = match infer::get(&head) {
        Some(t) => from_infer(path, &head, ext.as_deref(), t),
        None => sniff_unmatched(&head, ext.as_deref()),
    };

    if detection.kind == FileKind::Pdf {
        detection.needs_processing = !pdf_has_fonts(path)?;
    }
    Ok(detection)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

fn from_infer(path: &Path, head: &[u8], ext: Option<&str>, t: infer::Type) -> Detection {
    let detail = format!("magic: {}", t.mime_type());
    let kind = match t.extension() {
        "pdf" => FileKind::Pdf,
        "docx" => FileKind::Docx,
        "xlsx" => FileKind::Xlsx,
        "pptx" => FileKind::Pptx,
        "odt" => FileKind::Odt,
        "ods" => FileKind::Ods,
        "odp" => FileKind::Odp,
        "zip" => return Detection::new(sniff_zip(path), detail),
        "doc" | "xls" | "ppt" | "msi" => return Detection::new(ole_kind(t.extension(), ext), detail),
        "rtf" => FileKind::Rtf,
        "html" => FileKind::Html,
        "xml" => FileKind::Xml,
        "jpg" | "jpx" => FileKind::Jpeg,
        "png" => FileKind::Png,
        "tif" => FileKind::Tiff,
        "bmp" => FileKind::Bmp,
        "gif" => FileKind::Gif,
        "rar" => FileKind::Rar,
        "7z" => FileKind::SevenZip,
        "tar" => FileKind::Tar,
        "gz" => FileKind::Gzip,
        "der" => FileKind::Signature,
        _ => match t.matcher_type() {
            infer::MatcherType::App => FileKind::Executable,
            infer::MatcherType::Audio | infer::MatcherType::Video => FileKind::Media,
            infer::MatcherType::Text => return sniff_unmatched(head, ext),
            _ => FileKind::Unknown,
        },
    };
    Detection::new(kind, detail)
}

/// OLE compound files share one magic number across Word, Excel,
/// PowerPoint and installers. Trust a matching name, then the sniffer.
fn ole_kind(sniffed: &str, ext: Option<&str>) -> FileKind {
    match ext {
        Some("doc") | Some("dot") => return FileKind::Doc,
        Some("xls") | Some("xlt") => return FileKind::Xls,
        Some("ppt") | Some("pps") | Some("pot") => return FileKind::Ppt,
        _ => {}
    }
    match sniffed {
        "doc" => FileKind::Doc,
        "xls" => FileKind::Xls,
        "ppt" => FileKind::Ppt,
        _ => FileKind::Unknown,
    }
}

/// Tell office documents apart from plain zip archives by their members.
fn sniff_zip(path: &Path) -> FileKind {
    let archive = File::open(path)
        .ok()
        .and_then(|f| ZipArchive::new(f).ok());
    let Some(mut archive) = archive else {
        // corrupt container; the extractor will report it
        return FileKind::Zip;
    };

    if let Ok(mut entry) = archive.by_name("mimetype") {
        let mut mime = String::new();
        if entry.read_to_string(&mut mime).is_ok() {
            match mime.trim() {
                "application/vnd.oasis.opendocument.text" => return FileKind::Odt,
                "application/vnd.oasis.opendocument.spreadsheet" => return FileKind::Ods,
                "application/vnd.oasis.opendocument.presentation" => return FileKind::Odp,
                _ => {}
            }
        }
    }

    let names: Vec<&str> = archive.file_names().collect();
    if names.iter().any(|n| n.starts_with("word/")) {
        FileKind::Docx
    } else if names.iter().any(|n| n.starts_with("xl/")) {
        FileKind::Xlsx
    } else if names.iter().any(|n| n.starts_with("ppt/")) {
        FileKind::Pptx
    } else {
        FileKind::Zip
    }
}

fn sniff_unmatched(head: &[u8], ext: Option<&str>) -> Detection {
    if head.starts_with(&OLE_MAGIC) {
        return Detection::new(ole_kind("", ext), "ole container");
    }
    if head.starts_with(b"{\\rtf") {
        return Detection::new(FileKind::Rtf, "rtf header");
    }

    let is_signature_ext = ext.is_some_and(|e| SIGNATURE_EXTENSIONS.contains(&e));
    if looks_like_text(head) {
        let text = String::from_utf8_lossy(head);
        let trimmed = text.trim_start_matches('\u{feff}').trim_start();
        if is_signature_ext || trimmed.starts_with("-----BEGIN") {
            return Detection::new(FileKind::Signature, "armored signature");
        }
        let lower = trimmed
            .chars()
            .take(1024)
            .collect::<String>()
            .to_ascii_lowercase();
        if lower.starts_with("<!doctype html") || lower.contains("<html") {
            return Detection::new(FileKind::Html, "html markup");
        }
        if lower.starts_with("<?xml") {
            return Detection::new(FileKind::Xml, "xml declaration");
        }
        return Detection::new(FileKind::Text, "plain text");
    }

    match ext {
        Some(e) if SIGNATURE_EXTENSIONS.contains(&e) => {
            Detection::new(FileKind::Signature, "binary signature")
        }
        Some(e) if EXECUTABLE_EXTENSIONS.contains(&e) => {
            Detection::new(FileKind::Executable, "executable name")
        }
        Some(e) if MEDIA_EXTENSIONS.contains(&e) => Detection::new(FileKind::Media, "media name"),
        _ => Detection {
            kind: FileKind::Unknown,
            needs_processing: false,
            detail: Some("unrecognized binary content".to_string()),
        },
    }
}

/// UTF-8 without NUL bytes. A multibyte sequence cut off by the head limit
/// still counts as text.
fn looks_like_text(head: &[u8]) -> bool {
    if head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}

/// A PDF without any font resource is a scanned image.
fn pdf_has_fonts(path: &Path) -> io::Result<bool> {
    let mut bytes = Vec::new();
    File::open(path)?
        .take(PDF_SCAN_LIMIT)
        .read_to_end(&mut bytes)?;
    Ok(bytes.windows(5).any(|w| w == b"/Font"))
}
