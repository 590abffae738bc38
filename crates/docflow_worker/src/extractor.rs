//! Archive extraction with bomb and path traversal guards.
//!
//! Zip, tar, gzip (plain or wrapping a tar), 7z and RAR archives share one
//! vetting pass: every entry is listed and checked against the member count,
//! declared total size, compression ratio and enclosed path limits before a
//! single byte is written. Extraction then goes into a hidden scratch
//! directory and is renamed into place, so a unit never holds a
//! half-extracted archive. Archives found inside earlier extraction output
//! are refused past a nesting depth.

use crate::cancel::CancellationToken;
use crate::engine::{
    remove_scratch, split_ext, split_rel, supersede, transformation, unique_rel, RepairEngine,
    RepairResult,
};
use crate::error::{RepairError, Result};
use docflow_protocol::{
    file_checksum, Cycle, ExtractorConfig, FileCategory, FileEntry, FileKind, Manifest,
    OperationKind, Outcome,
};
use flate2::read::GzDecoder;
use sevenz_rust::{Password, SevenZReader};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::ZipArchive;

const EXTRACT_SCRATCH_DIR: &str = ".extract_tmp";
const EXTRACTED_SUFFIX: &str = "_extracted";
const ENGINE_TOOL: &str = "archive";

/// Offset and value of the POSIX tar magic inside the first header block.
const USTAR_MAGIC_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";

// ============================================================================
// Formats
// ============================================================================

/// Container layout, which can differ from the detected kind for gzip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Zip,
    Tar,
    TarGz,
    Gzip,
    SevenZip,
    Rar,
}

impl Format {
    /// Tool name recorded in transformations.
    fn tool(self) -> &'static str {
        match self {
            Format::Zip => "zip",
            Format::Tar => "tar",
            Format::TarGz => "tar+gzip",
            Format::Gzip => "gzip",
            Format::SevenZip => "7z",
            Format::Rar => "unrar",
        }
    }

    fn of(kind: FileKind, path: &Path) -> Result<Self> {
        match kind {
            FileKind::Zip => Ok(Format::Zip),
            FileKind::Tar => Ok(Format::Tar),
            FileKind::SevenZip => Ok(Format::SevenZip),
            FileKind::Rar => Ok(Format::Rar),
            FileKind::Gzip if gzip_holds_tar(path)? => Ok(Format::TarGz),
            FileKind::Gzip => Ok(Format::Gzip),
            other => Err(RepairError::permanent(format!(
                "unsupported archive format {}",
                other
            ))),
        }
    }
}

/// Whether the decompressed stream starts with a tar header block.
fn gzip_holds_tar(path: &Path) -> Result<bool> {
    let mut head = Vec::with_capacity(512);
    GzDecoder::new(File::open(path)?)
        .take(512)
        .read_to_end(&mut head)
        .map_err(stream_error)?;
    Ok(head.len() >= USTAR_MAGIC_OFFSET + USTAR_MAGIC.len()
        && &head[USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + USTAR_MAGIC.len()] == USTAR_MAGIC)
}

// ============================================================================
// Vetting
// ============================================================================

/// A member that passed vetting.
#[derive(Debug, Clone)]
struct Member {
    /// Position in the archive's own listing order.
    index: usize,
    /// Name as stored in the archive.
    name: String,
    rel: PathBuf,
    size: u64,
}

/// Running totals while an archive is listed.
///
/// Limits are checked on every entry, so a hostile listing is abandoned as
/// soon as it crosses one instead of after it has been read to the end.
#[derive(Debug)]
struct Vetting<'a> {
    limits: &'a ExtractorConfig,
    archive_len: u64,
    seen: usize,
    total: u64,
    members: Vec<Member>,
}

impl<'a> Vetting<'a> {
    fn new(limits: &'a ExtractorConfig, archive_len: u64) -> Self {
        Self {
            limits,
            archive_len,
            seen: 0,
            total: 0,
            members: Vec::new(),
        }
    }

    /// Check one listed entry. `rel` is `None` when the name escapes the
    /// extraction root.
    fn admit(&mut self, name: &str, rel: Option<PathBuf>, size: u64, is_file: bool) -> Result<()> {
        let index = self.seen;
        self.seen += 1;
        if self.seen > self.limits.max_members {
            return Err(RepairError::anomaly(format!(
                "zip_bomb_count: more than {} members",
                self.limits.max_members
            )));
        }
        let rel = rel.ok_or_else(|| {
            RepairError::anomaly(format!("path_traversal: member {:?}", name))
        })?;

        self.total = self.total.saturating_add(size);
        if self.total > self.limits.max_unpacked_bytes {
            return Err(RepairError::anomaly(format!(
                "zip_bomb_size: {} bytes unpacked exceeds limit {}",
                self.total, self.limits.max_unpacked_bytes
            )));
        }
        if self.total
            > self
                .archive_len
                .saturating_mul(self.limits.max_compression_ratio)
        {
            return Err(RepairError::anomaly(format!(
                "zip_bomb_ratio: {} bytes from a {} byte archive exceeds {}:1",
                self.total, self.archive_len, self.limits.max_compression_ratio
            )));
        }

        if !is_file || rel.as_os_str().is_empty() || skipped_member(&rel) {
            return Ok(());
        }
        self.members.push(Member {
            index,
            name: name.to_string(),
            rel,
            size,
        });
        Ok(())
    }
}

/// Resolve an archive member name under the extraction root.
///
/// Backslashes count as separators. Absolute names, drive prefixes and any
/// `..` component are refused.
fn enclosed(name: &str) -> Option<PathBuf> {
    let name = name.replace('\\', "/");
    if name.starts_with('/') {
        return None;
    }
    let mut rel = PathBuf::new();
    for part in name.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part if part.contains(':') => return None,
            part => rel.push(part),
        }
    }
    Some(rel)
}

/// Extraction levels above a unit-relative path.
fn nesting_depth(rel: &str) -> usize {
    let (parent, _) = split_rel(rel);
    parent
        .split('/')
        .filter(|part| is_extraction_dir(part))
        .count()
}

fn is_extraction_dir(name: &str) -> bool {
    if name.ends_with(EXTRACTED_SUFFIX) {
        return true;
    }
    // unique_rel disambiguates as `<stem>_extracted_<n>`
    match name.rsplit_once('_') {
        Some((head, n)) => {
            head.ends_with(EXTRACTED_SUFFIX)
                && !n.is_empty()
                && n.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

// ============================================================================
// Extractor
// ============================================================================

/// Extracts archives in place.
#[derive(Debug, Clone)]
pub struct Extractor {
    limits: ExtractorConfig,
}

impl Extractor {
    pub fn new(limits: ExtractorConfig) -> Self {
        Self { limits }
    }

    /// List and vet every entry of an archive. Nothing is written.
    fn preflight(&self, format: Format, path: &Path, name: &str) -> Result<Vec<Member>> {
        let archive_len = fs::metadata(path)?.len();
        let mut vet = Vetting::new(&self.limits, archive_len);
        match format {
            Format::Zip => {
                let mut archive = ZipArchive::new(File::open(path)?).map_err(zip_error)?;
                for index in 0..archive.len() {
                    let file = archive.by_index_raw(index).map_err(zip_error)?;
                    vet.admit(file.name(), file.enclosed_name(), file.size(), !file.is_dir())?;
                }
            }
            Format::Tar => list_tar(BufReader::new(File::open(path)?), &mut vet)?,
            Format::TarGz => list_tar(GzDecoder::new(BufReader::new(File::open(path)?)), &mut vet)?,
            Format::Gzip => {
                let member = gzip_member_name(name);
                let size = gzip_declared_size(path)?;
                vet.admit(&member, enclosed(&member), size, true)?;
            }
            Format::SevenZip => {
                let reader = SevenZReader::open(path, Password::empty()).map_err(sevenz_error)?;
                for entry in &reader.archive().files {
                    vet.admit(
                        &entry.name,
                        enclosed(&entry.name),
                        entry.size,
                        !entry.is_directory,
                    )?;
                }
            }
            Format::Rar => {
                let listing = unrar::Archive::new(path)
                    .open_for_listing()
                    .map_err(rar_error)?;
                for header in listing {
                    let header = header.map_err(rar_error)?;
                    let name = header.filename.to_string_lossy().into_owned();
                    vet.admit(&name, enclosed(&name), header.unpacked_size, header.is_file())?;
                }
            }
        }
        debug!(
            archive = %path.display(),
            entries = vet.seen,
            members = vet.members.len(),
            bytes = vet.total,
            "Archive vetted"
        );
        Ok(vet.members)
    }

    /// Extract vetted members into `staging`.
    fn unpack(
        &self,
        format: Format,
        path: &Path,
        members: &[Member],
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match format {
            Format::Zip => {
                let mut archive = ZipArchive::new(File::open(path)?).map_err(zip_error)?;
                for member in members {
                    check_cancel(cancel)?;
                    let file = archive.by_index(member.index).map_err(zip_error)?;
                    write_member(file, member, staging)?;
                }
                Ok(())
            }
            Format::Tar => unpack_tar(BufReader::new(File::open(path)?), members, staging, cancel),
            Format::TarGz => unpack_tar(
                GzDecoder::new(BufReader::new(File::open(path)?)),
                members,
                staging,
                cancel,
            ),
            Format::Gzip => {
                for member in members {
                    check_cancel(cancel)?;
                    write_member(GzDecoder::new(BufReader::new(File::open(path)?)), member, staging)?;
                }
                Ok(())
            }
            Format::SevenZip => unpack_7z(path, members, staging, cancel),
            Format::Rar => unpack_rar(path, members, staging, cancel),
        }
    }

    fn extract_one(
        &self,
        dir: &Path,
        manifest: &mut Manifest,
        rel: &str,
        kind: FileKind,
        cycle: Cycle,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let depth = nesting_depth(rel);
        if depth >= self.limits.max_depth {
            return Err(RepairError::anomaly(format!(
                "nesting_depth: {} sits {} extractions deep, limit {}",
                rel, depth, self.limits.max_depth
            )));
        }

        let archive_path = dir.join(rel);
        let format = Format::of(kind, &archive_path)?;
        let (parent, name) = split_rel(rel);
        let members = self.preflight(format, &archive_path, name)?;

        let target_rel = unique_rel(
            dir,
            &format!("{}{}{}", parent, extraction_stem(format, name), EXTRACTED_SUFFIX),
            |_| false,
        );

        let scratch = dir.join(EXTRACT_SCRATCH_DIR);
        remove_scratch(&scratch)?;
        let staging = scratch.join("out");
        fs::create_dir_all(&staging)?;
        if let Err(e) = self.unpack(format, &archive_path, &members, &staging, cancel) {
            let _ = remove_scratch(&scratch);
            return Err(e);
        }

        let target = dir.join(&target_rel);
        if let Some(p) = target.parent() {
            fs::create_dir_all(p)?;
        }
        fs::rename(&staging, &target)?;
        remove_scratch(&scratch)?;

        let original = manifest
            .file_by_current_name(rel)
            .map(|f| f.original_name.clone())
            .unwrap_or_else(|| rel.to_string());
        for member in &members {
            let member_rel = member_path(&member.rel);
            let new_rel = format!("{}/{}", target_rel, member_rel);
            let path = dir.join(&new_rel);
            let mut entry = FileEntry::new(
                new_rel.clone(),
                file_checksum(&path)?,
                fs::metadata(&path)?.len(),
            );
            entry.original_name = format!("{}/{}", original, member_rel);
            entry.transformations.push(transformation(
                OperationKind::Extract,
                cycle,
                format.tool(),
                (rel, kind),
                (&new_rel, None),
                Outcome::Success,
            ));
            manifest.files.push(entry);
        }

        let superseded_rel = supersede(dir, rel)?;
        if let Some(entry) = manifest.file_by_current_name_mut(rel) {
            entry.record(transformation(
                OperationKind::Extract,
                cycle,
                format.tool(),
                (rel, kind),
                (&superseded_rel, None),
                Outcome::Success,
            ));
            entry.superseded = true;
        }
        info!(
            unit = %manifest.unit_id,
            archive = %rel,
            format = format.tool(),
            members = members.len(),
            into = %target_rel,
            "Extracted archive"
        );
        Ok(members.len())
    }
}

impl RepairEngine for Extractor {
    fn operation(&self) -> OperationKind {
        OperationKind::Extract
    }

    fn tool(&self) -> &str {
        ENGINE_TOOL
    }

    fn apply(
        &self,
        dir: &Path,
        manifest: &mut Manifest,
        cycle: Cycle,
        cancel: &CancellationToken,
    ) -> Result<RepairResult> {
        let archives: Vec<(String, FileKind)> = manifest
            .active_files()
            .filter(|f| f.kind.base_category() == FileCategory::Extract)
            .map(|f| (f.current_name.clone(), f.kind))
            .collect();

        let mut result = RepairResult::default();
        for (rel, kind) in archives {
            match self.extract_one(dir, manifest, &rel, kind, cycle, cancel) {
                Ok(count) => {
                    result.files_changed += 1;
                    result.notes.push(format!("{}: {} members", rel, count));
                }
                Err(e) => {
                    warn!(unit = %manifest.unit_id, archive = %rel, error = %e, "Extraction failed");
                    if let Some(entry) = manifest.file_by_current_name_mut(&rel) {
                        entry.record(transformation(
                            OperationKind::Extract,
                            cycle,
                            ENGINE_TOOL,
                            (&rel, kind),
                            (&rel, None),
                            Outcome::Failed,
                        ));
                    }
                    return Err(e);
                }
            }
        }
        Ok(result)
    }
}

// ============================================================================
// Per-format readers
// ============================================================================

fn list_tar<R: Read>(reader: R, vet: &mut Vetting<'_>) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().map_err(stream_error)? {
        let entry = entry.map_err(stream_error)?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let is_file = entry.header().entry_type().is_file();
        vet.admit(&name, enclosed(&name), entry.size(), is_file)?;
    }
    Ok(())
}

/// Tar entries are sequential, so members are written in one forward pass.
fn unpack_tar<R: Read>(
    reader: R,
    members: &[Member],
    staging: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let mut wanted = members.iter().peekable();
    for (index, entry) in archive.entries().map_err(stream_error)?.enumerate() {
        let Some(&member) = wanted.peek() else {
            break;
        };
        let entry = entry.map_err(stream_error)?;
        if index != member.index {
            continue;
        }
        check_cancel(cancel)?;
        write_member(entry, member, staging)?;
        wanted.next();
    }
    match wanted.next() {
        Some(member) => Err(missing_member(member)),
        None => Ok(()),
    }
}

fn unpack_7z(
    path: &Path,
    members: &[Member],
    staging: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut pending: HashMap<&str, &Member> =
        members.iter().map(|m| (m.name.as_str(), m)).collect();
    let mut failure: Option<RepairError> = None;

    let mut reader = SevenZReader::open(path, Password::empty()).map_err(sevenz_error)?;
    reader
        .for_each_entries(|entry, data| {
            let Some(member) = pending.remove(entry.name.as_str()) else {
                io::copy(data, &mut io::sink())?;
                return Ok(true);
            };
            let written = check_cancel(cancel).and_then(|()| write_member(data, member, staging));
            match written {
                Ok(()) => Ok(true),
                Err(e) => {
                    failure = Some(e);
                    Ok(false)
                }
            }
        })
        .map_err(sevenz_error)?;
    if let Some(e) = failure {
        return Err(e);
    }
    finish_pending(pending, staging)
}

fn unpack_rar(
    path: &Path,
    members: &[Member],
    staging: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut pending: HashMap<&str, &Member> =
        members.iter().map(|m| (m.name.as_str(), m)).collect();

    let mut archive = unrar::Archive::new(path)
        .open_for_processing()
        .map_err(rar_error)?;
    while let Some(header) = archive.read_header().map_err(rar_error)? {
        let name = header.entry().filename.to_string_lossy().into_owned();
        archive = match pending.remove(name.as_str()) {
            Some(member) => {
                check_cancel(cancel)?;
                let (data, rest) = header.read().map_err(rar_error)?;
                write_member(data.as_slice(), member, staging)?;
                rest
            }
            None => header.skip().map_err(rar_error)?,
        };
    }
    finish_pending(pending, staging)
}

/// Members the reader never handed over. Empty files may carry no stream.
fn finish_pending(pending: HashMap<&str, &Member>, staging: &Path) -> Result<()> {
    for member in pending.into_values() {
        if member.size > 0 {
            return Err(missing_member(member));
        }
        write_member(io::empty(), member, staging)?;
    }
    Ok(())
}

/// Copy one member to disk, refusing more bytes than its header declared.
fn write_member<R: Read>(reader: R, member: &Member, staging: &Path) -> Result<()> {
    let out_path = staging.join(&member.rel);
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(&out_path)?;
    // one byte past the declared size exposes a lying header
    let written = io::copy(&mut reader.take(member.size + 1), &mut out).map_err(stream_error)?;
    if written > member.size {
        return Err(RepairError::anomaly(format!(
            "zip_bomb_size: member {} inflates past its declared {} bytes",
            member.rel.display(),
            member.size
        )));
    }
    Ok(())
}

/// The single member of a plain gzip file is named after the file.
fn gzip_member_name(archive_name: &str) -> String {
    match split_ext(archive_name) {
        (stem, Some(ext)) if ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz") => {
            stem.to_string()
        }
        _ => archive_name.to_string(),
    }
}

/// Uncompressed size from the gzip trailer. It wraps past 4 GiB, which the
/// write bound in [`write_member`] catches.
fn gzip_declared_size(path: &Path) -> Result<u64> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < 18 {
        return Err(RepairError::permanent("corrupt archive: truncated gzip stream"));
    }
    file.seek(SeekFrom::End(-4))?;
    let mut trailer = [0u8; 4];
    file.read_exact(&mut trailer)?;
    Ok(u64::from(u32::from_le_bytes(trailer)))
}

/// Directory stem for an archive's extraction output.
fn extraction_stem(format: Format, name: &str) -> String {
    let (stem, ext) = split_ext(name);
    match format {
        Format::TarGz if matches!(ext, Some(e) if e.eq_ignore_ascii_case("tgz")) => stem.to_string(),
        Format::TarGz => split_ext(stem).0.to_string(),
        Format::Gzip => split_ext(&gzip_member_name(name)).0.to_string(),
        _ => stem.to_string(),
    }
}

/// Hidden entries and resource-fork folders never reach the unit.
fn skipped_member(rel: &Path) -> bool {
    rel.components().any(|c| match c {
        Component::Normal(part) => {
            let part = part.to_string_lossy();
            part.starts_with('.') || part == "__MACOSX"
        }
        _ => false,
    })
}

fn member_path(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(RepairError::Cancelled("extraction".to_string()));
    }
    Ok(())
}

fn missing_member(member: &Member) -> RepairError {
    RepairError::permanent(format!(
        "corrupt archive: member {} missing on second read",
        member.name
    ))
}

fn zip_error(e: ZipError) -> RepairError {
    match e {
        ZipError::Io(e) => stream_error(e),
        other => RepairError::permanent(format!("corrupt archive: {}", other)),
    }
}

/// Decoder and tar parse failures surface as io errors; they mean a broken
/// archive, not a flaky disk.
fn stream_error(e: io::Error) -> RepairError {
    match e.kind() {
        io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::Other => RepairError::permanent(format!("corrupt archive: {}", e)),
        _ => RepairError::Io(e),
    }
}

fn sevenz_error(e: sevenz_rust::Error) -> RepairError {
    RepairError::permanent(format!("corrupt archive: {}", e))
}

fn rar_error(e: unrar::error::UnrarError) -> RepairError {
    RepairError::permanent(format!("corrupt archive: {}", e))
}
