//! Legacy office format conversion.
//!
//! Conversion shells out to an office suite in headless mode. The suite
//! cannot run two conversions against one user profile, so the pool hands
//! out a fixed number of slots, each with a private profile directory.

use crate::cancel::CancellationToken;
use crate::engine::{
    absolute, remove_scratch, split_ext, split_rel, supersede, transformation, unique_rel,
    RepairEngine, RepairResult,
};
use crate::error::{RepairError, Result};
use docflow_protocol::{
    file_checksum, ConverterConfig, Cycle, FileKind, Manifest, OperationKind, Outcome,
};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Poll interval while waiting on a slot or a converter process.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Scratch directory for converter output, inside the unit.
const CONVERT_SCRATCH_DIR: &str = ".convert_tmp";

// ============================================================================
// Slot pool
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    index: usize,
    profile_dir: PathBuf,
}

/// Bounded pool of converter instances.
#[derive(Debug)]
pub struct ConverterPool {
    free: Mutex<Vec<Slot>>,
    available: Condvar,
    size: usize,
}

/// A borrowed converter slot. Returned to the pool on drop.
#[derive(Debug)]
pub struct SlotLease<'a> {
    pool: &'a ConverterPool,
    slot: Option<Slot>,
}

impl ConverterPool {
    pub fn new(size: usize, profile_root: &Path) -> Self {
        let size = size.max(1);
        let free = (0..size)
            .rev()
            .map(|index| Slot {
                index,
                profile_dir: profile_root.join(format!("slot_{}", index)),
            })
            .collect();
        Self {
            free: Mutex::new(free),
            available: Condvar::new(),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently lent out.
    pub fn in_use(&self) -> usize {
        let free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        self.size - free.len()
    }

    /// Block until a slot is free or `cancel` fires.
    pub fn acquire(&self, cancel: &CancellationToken) -> Result<SlotLease<'_>> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(slot) = free.pop() {
                return Ok(SlotLease {
                    pool: self,
                    slot: Some(slot),
                });
            }
            if cancel.is_cancelled() {
                return Err(RepairError::Cancelled(
                    "waiting for converter slot".to_string(),
                ));
            }
            free = self
                .available
                .wait_timeout(free, CANCEL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release(&self, slot: Slot) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        free.push(slot);
        self.available.notify_one();
    }
}

impl SlotLease<'_> {
    pub fn index(&self) -> usize {
        self.slot.as_ref().map(|s| s.index).unwrap_or_default()
    }

    pub fn profile_dir(&self) -> &Path {
        self.slot
            .as_ref()
            .map(|s| s.profile_dir.as_path())
            .unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

// ============================================================================
// Conversion tool
// ============================================================================

/// One conversion to perform.
#[derive(Debug, Clone)]
pub struct ConversionRequest<'a> {
    pub input: &'a Path,
    pub target: FileKind,
    /// Directory the tool writes its output into.
    pub out_dir: &'a Path,
    pub profile_dir: &'a Path,
    pub timeout: Duration,
}

/// An external converter. Returns the path of the produced file.
pub trait ConversionTool: Send + Sync {
    fn name(&self) -> &str;

    fn convert(&self, request: &ConversionRequest<'_>, cancel: &CancellationToken)
        -> Result<PathBuf>;
}

/// LibreOffice style headless converter.
#[derive(Debug, Clone)]
pub struct SofficeTool {
    binary: String,
}

impl SofficeTool {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl ConversionTool for SofficeTool {
    fn name(&self) -> &str {
        &self.binary
    }

    fn convert(
        &self,
        request: &ConversionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let ext = request.target.canonical_extension().ok_or_else(|| {
            RepairError::permanent(format!("no file extension for {}", request.target))
        })?;
        fs::create_dir_all(request.profile_dir)?;
        let profile = absolute(request.profile_dir)?;

        let mut process = Command::new(&self.binary)
            .arg("--headless")
            .arg("--norestore")
            .arg(format!("-env:UserInstallation=file://{}", profile.display()))
            .arg("--convert-to")
            .arg(ext)
            .arg("--outdir")
            .arg(request.out_dir)
            .arg(request.input)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RepairError::transient(format!("failed to start {}: {}", self.binary, e)))?;

        let status = wait_for_exit(&mut process, request.timeout, cancel, &self.binary)?;
        if !status.success() {
            let stderr = collect_stderr(&mut process);
            return Err(RepairError::tool_exit(&self.binary, status.code(), &stderr));
        }

        let stem = request
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let output = request.out_dir.join(format!("{}.{}", stem, ext));
        if !output.is_file() {
            return Err(RepairError::transient(format!(
                "{} exited cleanly but produced no {}",
                self.binary,
                output.display()
            )));
        }
        Ok(output)
    }
}

/// Collect stderr from process (consumes the stderr handle)
fn collect_stderr(process: &mut Child) -> String {
    if let Some(mut stderr) = process.stderr.take() {
        let mut output = String::new();
        match stderr.read_to_string(&mut output) {
            Ok(_) => output.trim().to_string(),
            Err(e) => format!("(failed to read stderr: {})", e),
        }
    } else {
        String::new()
    }
}

/// Kill process and reap it.
fn cleanup_process(process: &mut Child) {
    let _ = process.kill();
    let _ = process.wait();
}

/// Wait for process exit, honoring cancellation and the time budget.
fn wait_for_exit(
    process: &mut Child,
    timeout: Duration,
    cancel: &CancellationToken,
    tool: &str,
) -> Result<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            cleanup_process(process);
            return Err(RepairError::Cancelled(format!("{} conversion", tool)));
        }
        if let Some(status) = process.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            cleanup_process(process);
            return Err(RepairError::Timeout {
                what: tool.to_string(),
                after_secs: timeout.as_secs(),
            });
        }
        std::thread::sleep(CANCEL_POLL_INTERVAL);
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Converts every legacy office file of a unit to its modern equivalent.
pub struct Converter {
    pool: ConverterPool,
    tool: Arc<dyn ConversionTool>,
    timeout: Duration,
}

impl Converter {
    pub fn new(pool: ConverterPool, tool: Arc<dyn ConversionTool>, timeout: Duration) -> Self {
        Self {
            pool,
            tool,
            timeout,
        }
    }

    pub fn from_config(config: &ConverterConfig, profile_root: &Path) -> Self {
        Self::new(
            ConverterPool::new(config.slots, profile_root),
            Arc::new(SofficeTool::new(config.binary.clone())),
            config.timeout(),
        )
    }

    pub fn pool(&self) -> &ConverterPool {
        &self.pool
    }

    fn convert_one(
        &self,
        dir: &Path,
        rel: &str,
        target: FileKind,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let scratch = dir.join(CONVERT_SCRATCH_DIR);
        remove_scratch(&scratch)?;
        fs::create_dir_all(&scratch)?;

        let input = dir.join(rel);
        let lease = self.pool.acquire(cancel)?;
        debug!(slot = lease.index(), file = rel, "Converting");
        let request = ConversionRequest {
            input: &input,
            target,
            out_dir: &scratch,
            profile_dir: lease.profile_dir(),
            timeout: self.timeout,
        };
        self.tool.convert(&request, cancel)
    }
}

impl RepairEngine for Converter {
    fn operation(&self) -> OperationKind {
        OperationKind::Convert
    }

    fn tool(&self) -> &str {
        self.tool.name()
    }

    fn apply(
        &self,
        dir: &Path,
        manifest: &mut Manifest,
        cycle: Cycle,
        cancel: &CancellationToken,
    ) -> Result<RepairResult> {
        let pending: Vec<(String, FileKind, FileKind)> = manifest
            .active_files()
            .filter_map(|f| {
                f.kind
                    .conversion_target()
                    .map(|target| (f.current_name.clone(), f.kind, target))
            })
            .collect();

        let mut result = RepairResult::default();
        for (rel, kind, target) in pending {
            if cancel.is_cancelled() {
                return Err(RepairError::Cancelled("conversion".to_string()));
            }

            let converted = match self.convert_one(dir, &rel, target, cancel) {
                Ok(path) => path,
                Err(e) => {
                    warn!(unit = %manifest.unit_id, file = %rel, error = %e, "Conversion failed");
                    if let Some(entry) = manifest.file_by_current_name_mut(&rel) {
                        entry.record(transformation(
                            OperationKind::Convert,
                            cycle,
                            self.tool.name(),
                            (&rel, kind),
                            (&rel, Some(target)),
                            Outcome::Failed,
                        ));
                    }
                    let _ = remove_scratch(&dir.join(CONVERT_SCRATCH_DIR));
                    return Err(e);
                }
            };

            let (parent, name) = split_rel(&rel);
            let (stem, _) = split_ext(name);
            let ext = target.canonical_extension().unwrap_or("out");
            let wanted = format!("{}{}.{}", parent, stem, ext);

            supersede(dir, &rel)?;
            let new_rel = unique_rel(dir, &wanted, |n| manifest.file_by_current_name(n).is_some());
            fs::rename(&converted, dir.join(&new_rel))?;
            remove_scratch(&dir.join(CONVERT_SCRATCH_DIR))?;

            let path = dir.join(&new_rel);
            let checksum = file_checksum(&path)?;
            let size = fs::metadata(&path)?.len();
            if let Some(entry) = manifest.file_by_current_name_mut(&rel) {
                entry.record(transformation(
                    OperationKind::Convert,
                    cycle,
                    self.tool.name(),
                    (&rel, kind),
                    (&new_rel, Some(target)),
                    Outcome::Success,
                ));
                entry.checksum = checksum;
                entry.size = size;
                entry.needs_processing = false;
            }
            info!(unit = %manifest.unit_id, from = %rel, to = %new_rel, "Converted");
            result.files_changed += 1;
            result.notes.push(format!("{} -> {}", rel, new_rel));
        }
        Ok(result)
    }
}
