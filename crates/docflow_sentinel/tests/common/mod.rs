//! Shared fixtures for the sentinel integration tests.

#![allow(dead_code)]

use docflow_protocol::{
    BreakerConfig, ConverterConfig, Layout, PipelineConfig, RetryConfig, State, UnitId, UnitRef,
};
use docflow_sentinel::{Pipeline, Sleeper};
use docflow_state_store::ManifestStore;
use docflow_worker::{
    CancellationToken, ConversionRequest, ConversionTool, Converter, ConverterPool, RepairError,
};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

pub const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
pub const TEXT_PDF: &[u8] = b"%PDF-1.7\n1 0 obj << /Type /Font /Subtype /Type1 >> endobj\n%%EOF";

/// Legacy Word document as far as detection is concerned.
pub fn legacy_doc() -> Vec<u8> {
    let mut bytes = OLE_MAGIC.to_vec();
    bytes.extend_from_slice(&[0u8; 504]);
    bytes
}

/// Stand-in for the office suite: writes a minimal OOXML package.
#[derive(Default)]
pub struct FakeOffice {
    pub calls: AtomicUsize,
    pub fail: bool,
}

impl FakeOffice {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConversionTool for FakeOffice {
    fn name(&self) -> &str {
        "fake-office"
    }

    fn convert(
        &self,
        request: &ConversionRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<PathBuf, RepairError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RepairError::tool_exit("fake-office", Some(81), "general error"));
        }
        let stem = request.input.file_stem().unwrap().to_string_lossy();
        let ext = request.target.canonical_extension().unwrap();
        let out = request.out_dir.join(format!("{}.{}", stem, ext));
        write_zip(
            &out,
            &[
                ("[Content_Types].xml", b"<Types/>".as_slice()),
                ("word/document.xml", b"<w:document/>".as_slice()),
            ],
        );
        Ok(out)
    }
}

/// Skips backoff delays.
pub struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) {}
}

pub fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
    let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, data) in members {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
}

pub fn config(tmp: &TempDir) -> PipelineConfig {
    PipelineConfig {
        data_root: tmp.path().join("data"),
        workers: 2,
        converter: ConverterConfig {
            profile_root: Some(tmp.path().join("profiles")),
            ..Default::default()
        },
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            multiplier: 1.0,
        },
        breaker: BreakerConfig {
            failure_threshold: 100,
            cooldown_secs: 60,
        },
        ..Default::default()
    }
}

pub fn pipeline_with(config: PipelineConfig, office: Arc<FakeOffice>) -> Pipeline {
    let profiles = config.converter_profile_root();
    let converter = Converter::new(
        ConverterPool::new(1, &profiles),
        office,
        Duration::from_secs(5),
    );
    Pipeline::new(config)
        .unwrap()
        .with_engine(Arc::new(converter))
        .with_sleeper(Arc::new(NoSleep))
}

/// Drop a unit into `Input/`.
pub fn deposit(layout: &Layout, id: &str, files: &[(&str, &[u8])]) -> PathBuf {
    let dir = layout.input_dir().join(id);
    for (name, data) in files {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }
    fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn unit_at(dir: &Path) -> UnitRef {
    UnitRef::from_dir(dir).unwrap()
}

pub fn states(store: &ManifestStore, dir: &Path) -> Vec<State> {
    store
        .load(&unit_at(dir))
        .unwrap()
        .state_trace
        .iter()
        .map(|e| e.state)
        .collect()
}

pub fn id(s: &str) -> UnitId {
    UnitId::parse(s).unwrap()
}
