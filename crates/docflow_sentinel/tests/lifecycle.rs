//! End-to-end unit lifecycle scenarios.
//!
//! Each test deposits units into a temporary data root, runs the pipeline
//! with a fake office converter and checks where the units end up and what
//! their manifests recorded on the way.

mod common;

use common::*;
use docflow_protocol::{Cycle, ExceptionCategory, FileKind, Route, State};
use docflow_sentinel::{PipelineMetrics, StatusReport};
use std::fs;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

fn c(n: u8) -> Cycle {
    Cycle::new(n).unwrap()
}

/// Test that a text PDF is classified once, merged directly and never repaired
#[test]
fn test_direct_pdf_merged_without_repair() {
    let tmp = TempDir::new().unwrap();
    let office = Arc::new(FakeOffice::default());
    let pipeline = pipeline_with(config(&tmp), office.clone());
    let layout = pipeline.layout().clone();
    deposit(&layout, "P1", &[("report.pdf", TEXT_PDF)]);

    let report = pipeline.run(false).unwrap();
    let batch = report.batch.unwrap();
    assert_eq!(batch.input, 1);
    assert_eq!(batch.merged.len(), 1);
    assert_eq!(batch.classifications, 1);
    assert_eq!(batch.repairs, 0);
    assert_eq!(report.merge.merged.len(), 1);
    assert_eq!(office.calls(), 0);

    let dest = layout.ready_dir(Route::PdfText).join("P1");
    assert_eq!(
        states(pipeline.store(), &dest),
        vec![
            State::Raw,
            State::Classified(c(1)),
            State::MergedDirect,
            State::Ready
        ]
    );
    let manifest = pipeline.store().load(&unit_at(&dest)).unwrap();
    assert_eq!(manifest.processing.route, Some(Route::PdfText));
    assert_eq!(manifest.files[0].kind, FileKind::Pdf);
    assert!(!manifest.files[0].needs_processing);
    assert!(!layout.input_dir().join("P1").exists());
}

/// Test that a legacy document is converted in cycle 1 and merged in cycle 2
#[test]
fn test_legacy_document_converted_then_merged() {
    let tmp = TempDir::new().unwrap();
    let office = Arc::new(FakeOffice::default());
    let pipeline = pipeline_with(config(&tmp), office.clone());
    let layout = pipeline.layout().clone();
    deposit(&layout, "D1", &[("memo.doc", &legacy_doc())]);

    let report = pipeline.run(false).unwrap();
    assert_eq!(report.merge.merged.len(), 1);
    assert_eq!(office.calls(), 1);

    let dest = layout.ready_dir(Route::Docx).join("D1");
    assert_eq!(
        states(pipeline.store(), &dest),
        vec![
            State::Raw,
            State::Classified(c(1)),
            State::PendingConvert(c(1)),
            State::Classified(c(2)),
            State::MergedProcessed(c(2)),
            State::Ready
        ]
    );

    let manifest = pipeline.store().load(&unit_at(&dest)).unwrap();
    let file = &manifest.files[0];
    assert_eq!(file.original_name, "memo.doc");
    assert_eq!(file.current_name, "memo.docx");
    assert_eq!(file.kind, FileKind::Docx);
    assert_eq!(file.transformations.len(), 1);
    assert_eq!(manifest.processing.merge.unwrap().source, "processed_2");
    assert!(dest.join(".superseded/memo.doc").exists());
}

/// Test that a unit holding only a zero-byte file is quarantined as Empty at cycle 1
#[test]
fn test_zero_byte_file_is_empty_at_cycle_one() {
    let tmp = TempDir::new().unwrap();
    let pipeline = pipeline_with(config(&tmp), Arc::new(FakeOffice::default()));
    let layout = pipeline.layout().clone();
    deposit(&layout, "E1", &[("blank.pdf", b"")]);

    let report = pipeline.run(false).unwrap();
    assert_eq!(report.batch.unwrap().quarantined.len(), 1);

    let dest = layout
        .exception_dir(ExceptionCategory::Empty, c(1))
        .join("E1");
    let manifest = pipeline.store().load(&unit_at(&dest)).unwrap();
    assert_eq!(manifest.state, State::Exception(c(1)));
    let quarantine = manifest.processing.quarantine.unwrap();
    assert_eq!(quarantine.category, ExceptionCategory::Empty);
    assert_eq!(quarantine.cycle, c(1));
    assert_eq!(
        manifest.processing.classification.unwrap().category,
        Some(ExceptionCategory::Empty)
    );
}

/// Test that a conversion failing in every cycle ends as ConversionFailed at the bound
#[test]
fn test_conversion_failing_every_cycle_hits_the_bound() {
    let tmp = TempDir::new().unwrap();
    let office = Arc::new(FakeOffice::failing());
    let pipeline = pipeline_with(config(&tmp), office.clone());
    let layout = pipeline.layout().clone();
    deposit(&layout, "F1", &[("memo.doc", &legacy_doc())]);

    let report = pipeline.run(false).unwrap();
    let batch = report.batch.unwrap();
    assert_eq!(batch.quarantined.len(), 1);
    assert_eq!(batch.repairs, 3);
    // three cycles, two attempts each
    assert_eq!(office.calls(), 6);

    let dest = layout
        .exception_dir(ExceptionCategory::ConversionFailed, c(3))
        .join("F1");
    let trace = states(pipeline.store(), &dest);
    assert_eq!(trace.last(), Some(&State::Exception(c(3))));
    for n in 1..=3 {
        assert!(trace.contains(&State::PendingConvert(c(n))));
    }
    assert!(trace
        .iter()
        .filter_map(|s| s.cycle())
        .all(|cycle| cycle <= c(3)));

    let manifest = pipeline.store().load(&unit_at(&dest)).unwrap();
    let quarantine = manifest.processing.quarantine.unwrap();
    assert_eq!(quarantine.category, ExceptionCategory::ConversionFailed);
    assert_eq!(quarantine.cycle, c(3));
    assert_eq!(quarantine.errors.len(), 6);
    assert!(quarantine.errors.iter().all(|e| e.transient));
    assert_eq!(manifest.files[0].current_name, "memo.doc");
}

/// Test that an archive over the compression ratio cap is an anomaly and nothing is unpacked
#[test]
fn test_zip_bomb_quarantined_as_anomaly() {
    let tmp = TempDir::new().unwrap();
    let pipeline = pipeline_with(config(&tmp), Arc::new(FakeOffice::default()));
    let layout = pipeline.layout().clone();
    let dir = deposit(&layout, "Z1", &[]);
    write_zip(&dir.join("bomb.zip"), &[("zeros.bin", &vec![0u8; 2 * 1024 * 1024])]);

    pipeline.run(false).unwrap();

    let dest = layout
        .exception_dir(ExceptionCategory::Anomaly, c(1))
        .join("Z1");
    assert!(dest.join("bomb.zip").exists());
    assert!(!dest.join("bomb_extracted").exists());
    assert!(!dest.join(".extract_tmp").exists());

    let manifest = pipeline.store().load(&unit_at(&dest)).unwrap();
    let quarantine = manifest.processing.quarantine.unwrap();
    assert_eq!(quarantine.category, ExceptionCategory::Anomaly);
    assert!(quarantine.reason.contains("zip_bomb_ratio"));
}

/// Test that an archive is extracted, its members renamed and the unit merged
#[test]
fn test_archive_extracted_normalized_and_merged() {
    let tmp = TempDir::new().unwrap();
    let pipeline = pipeline_with(config(&tmp), Arc::new(FakeOffice::default()));
    let layout = pipeline.layout().clone();
    let dir = deposit(&layout, "A1", &[]);
    // a PDF hiding behind a .docx name
    write_zip(&dir.join("attachments.zip"), &[("scan.docx", TEXT_PDF)]);

    let report = pipeline.run(false).unwrap();
    assert_eq!(report.merge.merged.len(), 1);

    let dest = layout.ready_dir(Route::PdfText).join("A1");
    assert_eq!(
        states(pipeline.store(), &dest),
        vec![
            State::Raw,
            State::Classified(c(1)),
            State::PendingExtract(c(1)),
            State::Classified(c(2)),
            State::PendingNormalize(c(2)),
            State::Classified(c(3)),
            State::MergedProcessed(c(3)),
            State::Ready
        ]
    );
    assert!(dest.join("attachments_extracted/scan.pdf").exists());
}

/// Test conservation across a mixed batch and that a second run changes nothing
#[test]
fn test_conservation_and_idempotent_rerun() {
    let tmp = TempDir::new().unwrap();
    let metrics = Arc::new(PipelineMetrics::new());
    let pipeline =
        pipeline_with(config(&tmp), Arc::new(FakeOffice::default())).with_metrics(metrics.clone());
    let layout = pipeline.layout().clone();
    deposit(&layout, "U1", &[("a.pdf", TEXT_PDF)]);
    deposit(&layout, "U2", &[("b.doc", &legacy_doc())]);
    deposit(&layout, "U3", &[("c.pdf", b"")]);
    deposit(&layout, "U4", &[("d.exe", b"MZ\x90\x00\x03\x00\x00\x00")]);

    let first = pipeline.run(false).unwrap();
    let batch = first.batch.unwrap();
    assert_eq!(batch.input, 4);
    assert_eq!(batch.merged.len() + batch.quarantined.len() + batch.in_progress.len(), 4);
    assert!(batch.in_progress.is_empty());
    assert_eq!(first.status.ready(), 2);
    assert_eq!(first.status.quarantined(), 2);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.units_ingested, 4);
    assert_eq!(snapshot.units_merged, 2);
    assert_eq!(snapshot.units_quarantined, 2);

    let second = pipeline.run(false).unwrap();
    assert_eq!(second.batch.unwrap().input, 0);
    assert!(second.merge.merged.is_empty());
    assert_eq!(second.merge.already_present.len(), 2);
    assert_eq!(second.status, first.status);
}

/// Test that an unreadable manifest is set aside and the unit quarantined as an anomaly
#[test]
fn test_unreadable_manifest_is_anomaly() {
    let tmp = TempDir::new().unwrap();
    let pipeline = pipeline_with(config(&tmp), Arc::new(FakeOffice::default()));
    let layout = pipeline.layout().clone();
    let dir = deposit(&layout, "M1", &[("a.pdf", TEXT_PDF)]);
    fs::File::create(dir.join("manifest.json"))
        .unwrap()
        .write_all(b"{\"schema_version\": \"9.0\"")
        .unwrap();

    let report = pipeline.run(false).unwrap();
    assert_eq!(report.batch.unwrap().quarantined.len(), 1);

    let dest = layout
        .exception_dir(ExceptionCategory::Anomaly, c(1))
        .join("M1");
    let manifest = pipeline.store().load(&unit_at(&dest)).unwrap();
    assert_eq!(manifest.state, State::Exception(c(1)));
    assert!(fs::read_dir(&dest)
        .unwrap()
        .any(|e| e.unwrap().file_name().to_string_lossy().starts_with(".manifest.corrupt")));
}

/// Test that a ready unit edited after the merge shows up as failing validation
#[test]
fn test_tampered_ready_unit_fails_validation() {
    let tmp = TempDir::new().unwrap();
    let pipeline = pipeline_with(config(&tmp), Arc::new(FakeOffice::default()));
    let layout = pipeline.layout().clone();
    deposit(&layout, "T1", &[("report.pdf", TEXT_PDF)]);

    let first = pipeline.run(false).unwrap();
    assert_eq!(first.status.invalid, 0);

    let dest = layout.ready_dir(Route::PdfText).join("T1");
    fs::write(dest.join("report.pdf"), b"%PDF-1.4 rewritten later").unwrap();

    let second = pipeline.run(false).unwrap();
    assert_eq!(second.status.ready(), 1);
    assert_eq!(second.status.invalid, 1);
    assert!(second.status.summary().contains("1 failing validation"));
}

/// Test that an empty layout yields an empty, consistent report
#[test]
fn test_empty_run() {
    let tmp = TempDir::new().unwrap();
    let pipeline = pipeline_with(config(&tmp), Arc::new(FakeOffice::default()));
    let report = pipeline.run(false).unwrap();
    assert_eq!(report.batch.unwrap().input, 0);
    assert!(report.merge.is_clean());
    assert_eq!(report.status, StatusReport::default());
}
