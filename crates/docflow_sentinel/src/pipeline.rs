//! Unit lifecycle orchestrator.
//!
//! Drives each unit from RAW to a resting point: classify, hand to a repair
//! engine, reclassify in the next cycle, and finally park it in a merge set
//! or in quarantine. A fixed pool of worker threads consumes a queue of unit
//! references; each worker owns one unit until it rests. The merger runs
//! once every unit of the batch has come to rest.

use crate::circuit_breaker::{CircuitBreakers, Clock, SystemClock};
use crate::classifier::{Classifier, Target};
use crate::cycle_manager::{AfterRepair, CycleManager, RepairAdmission};
use crate::error::{PipelineError, Result};
use crate::error_policy::{ErrorAction, ErrorPolicy, Execution, Sleeper, ThreadSleeper};
use crate::inventory::Inventory;
use crate::merger::{child_dirs, MergeReport, Merger};
use crate::metrics::{MetricsRecorder, NoopMetrics};
use crate::monitor::{Monitor, StatusReport};
use crate::quarantine::QuarantineRouter;
use crate::unit_io::{audit, move_unit};
use chrono::Utc;
use docflow_protocol::{
    CorrelationId, Cycle, ErrorRecord, ExceptionCategory, Layout, OperationKind, PipelineConfig,
    Route, State, StateMachine, UnitId, UnitRef,
};
use docflow_state_store::{AuditEvent, AuditEventType, ManifestStore};
use docflow_worker::{
    CancellationToken, Converter, Extractor, Normalizer, RepairEngine, RepairError, RepairResult,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Where a unit stands after a step.
#[derive(Debug, Clone)]
pub struct Position {
    pub unit: UnitRef,
    pub state: State,
}

enum Step {
    Advanced(Position),
    /// The unit cannot move on right now (circuit open, cancelled).
    Parked(Position),
}

/// What classification decided, after the cycle gate.
enum Routing {
    Move(State, Option<Route>),
    Quarantine(ExceptionCategory, String),
}

/// Final position of one unit and the work spent on it.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub unit: UnitRef,
    pub state: State,
    pub classifications: u32,
    pub repairs: u32,
}

/// Aggregate result of one batch.
///
/// Every input unit lands in exactly one of `merged`, `quarantined` and
/// `in_progress`.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub input: usize,
    /// Units waiting in a merge set or already READY.
    pub merged: Vec<UnitId>,
    pub quarantined: Vec<UnitId>,
    pub in_progress: Vec<UnitId>,
    pub classifications: u64,
    pub repairs: u64,
    /// Units whose processing stopped on an error; also counted in progress.
    pub errors: Vec<(UnitId, String)>,
}

impl BatchReport {
    fn record(&mut self, outcome: &UnitOutcome) {
        self.classifications += outcome.classifications as u64;
        self.repairs += outcome.repairs as u64;
        let id = outcome.unit.id.clone();
        if outcome.state.is_merge_ready() || outcome.state == State::Ready {
            self.merged.push(id);
        } else if matches!(outcome.state, State::Exception(_)) {
            self.quarantined.push(id);
        } else {
            self.in_progress.push(id);
        }
    }

    /// Every input unit accounted for exactly once.
    pub fn check_conservation(&self) -> Result<()> {
        let total = self.merged.len() + self.quarantined.len() + self.in_progress.len();
        if total != self.input {
            return Err(PipelineError::Integrity(format!(
                "{} units in, {} accounted for ({} merged, {} quarantined, {} in progress)",
                self.input,
                total,
                self.merged.len(),
                self.quarantined.len(),
                self.in_progress.len()
            )));
        }
        let mut seen = BTreeSet::new();
        for id in self
            .merged
            .iter()
            .chain(&self.quarantined)
            .chain(&self.in_progress)
        {
            if !seen.insert(id) {
                return Err(PipelineError::Integrity(format!(
                    "unit {} counted in two buckets",
                    id
                )));
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "Batch: {} units | {} merged, {} quarantined, {} in progress | \
             {} classifications, {} repairs, {} errors",
            self.input,
            self.merged.len(),
            self.quarantined.len(),
            self.in_progress.len(),
            self.classifications,
            self.repairs,
            self.errors.len()
        )
    }
}

/// Result of a full run: processing, merge and the final layout status.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub batch: Option<BatchReport>,
    pub merge: MergeReport,
    pub status: StatusReport,
}

pub struct Pipeline {
    config: PipelineConfig,
    layout: Layout,
    store: ManifestStore,
    machine: StateMachine,
    classifier: Classifier,
    cycles: CycleManager,
    policy: ErrorPolicy,
    breakers: CircuitBreakers,
    engines: BTreeMap<OperationKind, Arc<dyn RepairEngine>>,
    router: QuarantineRouter,
    merger: Merger,
    metrics: Arc<dyn MetricsRecorder>,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
    correlation_id: CorrelationId,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        let max = config.max_cycles();
        let machine = StateMachine::new(max);
        let metrics: Arc<dyn MetricsRecorder> = Arc::new(NoopMetrics);
        let policy = ErrorPolicy::new(config.retry.clone());

        let mut engines: BTreeMap<OperationKind, Arc<dyn RepairEngine>> = BTreeMap::new();
        engines.insert(
            OperationKind::Convert,
            Arc::new(Converter::from_config(
                &config.converter,
                &config.converter_profile_root(),
            )),
        );
        engines.insert(
            OperationKind::Extract,
            Arc::new(Extractor::new(config.extractor.clone())),
        );
        engines.insert(OperationKind::Normalize, Arc::new(Normalizer::new()));

        Ok(Self {
            classifier: Classifier::new(config.mixed_policy),
            cycles: CycleManager::new(max, layout.clone()),
            breakers: CircuitBreakers::new(&config.breaker, Arc::new(SystemClock)),
            router: QuarantineRouter::new(
                layout.clone(),
                machine.clone(),
                policy.clone(),
                Arc::clone(&metrics),
            ),
            merger: Merger::new(
                layout.clone(),
                machine.clone(),
                policy.clone(),
                Arc::clone(&metrics),
            ),
            policy,
            store: ManifestStore::new(),
            engines,
            metrics,
            sleeper: Arc::new(ThreadSleeper),
            cancel: CancellationToken::new(),
            correlation_id: CorrelationId::new(),
            machine,
            layout,
            config,
        })
    }

    /// Replace the engine for its operation.
    pub fn with_engine(mut self, engine: Arc<dyn RepairEngine>) -> Self {
        self.engines.insert(engine.operation(), engine);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.router = QuarantineRouter::new(
            self.layout.clone(),
            self.machine.clone(),
            self.policy.clone(),
            Arc::clone(&metrics),
        );
        self.merger = Merger::new(
            self.layout.clone(),
            self.machine.clone(),
            self.policy.clone(),
            Arc::clone(&metrics),
        );
        self.metrics = metrics;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.breakers = CircuitBreakers::new(&self.config.breaker, clock);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // ========================================================================
    // Batch level
    // ========================================================================

    /// Create RAW manifests for freshly deposited units in `Input/`.
    ///
    /// Returns every unit directory in `Input/`, freshly ingested or not.
    pub fn ingest(&self) -> Result<Vec<UnitRef>> {
        let mut units = Vec::new();
        for dir in child_dirs(&self.layout.input_dir())? {
            let unit = match UnitRef::from_dir(&dir) {
                Ok(unit) => unit,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Skipping input directory");
                    continue;
                }
            };
            if !self.store.exists(&unit) {
                self.ingest_unit(&unit)?;
            }
            units.push(unit);
        }
        info!(units = units.len(), "Ingested input");
        Ok(units)
    }

    fn ingest_unit(&self, unit: &UnitRef) -> Result<()> {
        let manifest = self
            .store
            .create(unit, self.config.max_cycles(), None)?;
        audit(
            &self.policy,
            &unit.dir,
            AuditEvent::new(unit.id.clone(), AuditEventType::Ingest, self.correlation_id.clone())
                .details(json!({ "files": manifest.files.len() })),
        )?;
        self.metrics.unit_ingested();
        Ok(())
    }

    /// Drive every unit to a resting point with the worker pool.
    ///
    /// An invalid transition aborts the batch: remaining units are left
    /// untouched and the error is returned. Any other per-unit error is
    /// contained and reported.
    pub fn run_batch(&self, units: Vec<UnitRef>) -> Result<BatchReport> {
        let input = units.len();
        let queue = Mutex::new(VecDeque::from(units));
        let results: Mutex<Vec<(UnitId, Result<UnitOutcome>)>> = Mutex::new(Vec::new());
        let aborted = AtomicBool::new(false);
        let workers = self.config.workers.max(1).min(input.max(1));

        info!(units = input, workers, "Starting batch");
        std::thread::scope(|scope| {
            for worker in 0..workers {
                let queue = &queue;
                let results = &results;
                let aborted = &aborted;
                scope.spawn(move || loop {
                    if aborted.load(Ordering::Acquire) || self.cancel.is_cancelled() {
                        break;
                    }
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(unit) = next else { break };
                    let id = unit.id.clone();
                    debug!(worker, unit = %id, "Worker picked unit");

                    let outcome = self.process_unit(unit);
                    if let Err(e) = &outcome {
                        if e.is_fatal() {
                            error!(unit = %id, error = %e, "Fatal error, aborting batch");
                            aborted.store(true, Ordering::Release);
                        }
                    }
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((id, outcome));
                });
            }
        });

        let results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
        let leftover = queue.into_inner().unwrap_or_else(PoisonError::into_inner);

        let mut report = BatchReport {
            input,
            ..Default::default()
        };
        let mut fatal = None;
        for (id, outcome) in results {
            match outcome {
                Ok(outcome) => report.record(&outcome),
                Err(e) if e.is_fatal() => {
                    report.in_progress.push(id.clone());
                    report.errors.push((id, e.to_string()));
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
                Err(e) => {
                    warn!(unit = %id, error = %e, "Unit processing failed");
                    report.in_progress.push(id.clone());
                    report.errors.push((id, e.to_string()));
                }
            }
        }
        report
            .in_progress
            .extend(leftover.into_iter().map(|unit| unit.id));

        if let Some(e) = fatal {
            return Err(e);
        }
        report.check_conservation()?;
        info!("{}", report.summary());
        Ok(report)
    }

    /// Rebuild the queue from the layout and process every unit that still
    /// owes work, including fresh deposits.
    ///
    /// Leftovers of interrupted merges are removed and units whose directory
    /// disagrees with their manifest are moved where the manifest says they
    /// belong. Units found in more than one place are left alone.
    pub fn resume(&self) -> Result<BatchReport> {
        let max = self.config.max_cycles();
        let inventory = Inventory::scan(&self.layout, &self.store, max)?;

        for stale in &inventory.stale_staging {
            warn!(path = %stale.display(), "Removing interrupted merge");
            fs::remove_dir_all(stale)?;
        }
        let mut repaired = 0;
        for misplaced in &inventory.misplaced {
            if inventory.duplicates.contains_key(&misplaced.unit) {
                continue;
            }
            let unit = UnitRef::new(misplaced.unit.clone(), &misplaced.found);
            match move_unit(&unit, &misplaced.expected) {
                Ok(_) => repaired += 1,
                Err(e) => warn!(unit = %unit.id, error = %e, "Could not relocate unit"),
            }
        }
        let inventory = if repaired > 0 {
            info!(units = repaired, "Relocated misplaced units");
            Inventory::scan(&self.layout, &self.store, max)?
        } else {
            inventory
        };

        let queue: Vec<UnitRef> = inventory
            .pending()
            .into_iter()
            .filter(|unit| {
                let duplicated = inventory.duplicates.contains_key(&unit.id);
                if duplicated {
                    warn!(unit = %unit.id, "Unit present in more than one place, not resuming");
                }
                !duplicated
            })
            .collect();
        self.run_batch(queue)
    }

    /// Collect every merge-ready unit into `Ready/`.
    pub fn merge(&self) -> MergeReport {
        self.merger.collect(
            &self.store,
            &self.layout.merge_sources(self.config.max_cycles()),
            &self.correlation_id,
        )
    }

    /// Read-only status of the whole layout.
    pub fn status(&self) -> Result<StatusReport> {
        let monitor = Monitor::new(self.layout.clone(), self.config.max_cycles());
        Ok(monitor.status(&self.store)?)
    }

    /// Ingest, process, merge. With `merge_only` just merge.
    pub fn run(&self, merge_only: bool) -> Result<RunReport> {
        let batch = if merge_only {
            None
        } else {
            self.ingest()?;
            Some(self.resume()?)
        };
        let merge = self.merge();
        let status = self.status()?;
        info!("{}", status.summary());
        Ok(RunReport {
            batch,
            merge,
            status,
        })
    }

    // ========================================================================
    // Unit level
    // ========================================================================

    /// Drive one unit until it rests.
    pub fn process_unit(&self, unit: UnitRef) -> Result<UnitOutcome> {
        let start = Instant::now();
        let mut outcome = UnitOutcome {
            state: State::Raw,
            unit: unit.clone(),
            classifications: 0,
            repairs: 0,
        };
        let mut position = self.open_unit(unit)?;

        loop {
            outcome.unit = position.unit.clone();
            outcome.state = position.state;
            if self.cancel.is_cancelled() {
                break;
            }
            let step = match position.state {
                State::Raw => {
                    self.transition(&position.unit, State::Classified(Cycle::FIRST), "ingested")?;
                    Step::Advanced(Position {
                        unit: position.unit,
                        state: State::Classified(Cycle::FIRST),
                    })
                }
                State::Classified(cycle) => {
                    outcome.classifications += 1;
                    self.classify_unit(position.unit, cycle)?
                }
                state if state.is_pending_repair() => {
                    outcome.repairs += 1;
                    self.repair_unit(position.unit, state)?
                }
                _ => break,
            };
            match step {
                Step::Advanced(next) => position = next,
                Step::Parked(parked) => {
                    outcome.unit = parked.unit;
                    outcome.state = parked.state;
                    break;
                }
            }
        }

        self.metrics.record_unit_time(start);
        debug!(unit = %outcome.unit.id, state = %outcome.state, "Unit at rest");
        Ok(outcome)
    }

    /// Load the unit's manifest, creating it for a fresh deposit.
    ///
    /// An unreadable manifest is set aside, replaced by a fresh one and the
    /// unit quarantined as an anomaly at cycle 1.
    fn open_unit(&self, unit: UnitRef) -> Result<Position> {
        match self.store.load(&unit) {
            Ok(manifest) => Ok(Position {
                unit,
                state: manifest.state,
            }),
            Err(e) if e.is_not_found() => {
                self.ingest_unit(&unit)?;
                Ok(Position {
                    unit,
                    state: State::Raw,
                })
            }
            Err(e) if e.is_schema() => {
                warn!(unit = %unit.id, error = %e, "Unreadable manifest, quarantining");
                self.store.set_aside_corrupt(&unit)?;
                self.store.create(&unit, self.config.max_cycles(), None)?;
                let reason = format!("unreadable manifest: {}", e);
                self.store.update(&unit, |m| {
                    m.push_error(ErrorRecord {
                        at: Utc::now(),
                        cycle: Cycle::FIRST,
                        operation: None,
                        kind: "schema".to_string(),
                        message: e.to_string(),
                        transient: false,
                    });
                    Ok(())
                })?;
                let moved = self.router.quarantine(
                    &self.store,
                    &unit,
                    ExceptionCategory::Anomaly,
                    Cycle::FIRST,
                    &reason,
                    &self.correlation_id,
                )?;
                Ok(Position {
                    unit: moved,
                    state: State::Exception(Cycle::FIRST),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a transition and journal it. Returns the state left.
    fn transition(&self, unit: &UnitRef, to: State, reason: &str) -> Result<State> {
        let before = self.store.update(unit, |m| {
            let before = m.state;
            self.machine.transition(m, to, reason)?;
            Ok(before)
        })?;
        audit(
            &self.policy,
            &unit.dir,
            AuditEvent::new(unit.id.clone(), AuditEventType::Transition, self.correlation_id.clone())
                .states(before, to)
                .details(json!({ "reason": reason })),
        )?;
        Ok(before)
    }

    /// Classify a `CLASSIFIED_n` unit and act on the decision.
    ///
    /// The decision is recorded in the manifest together with the transition
    /// before the unit is moved.
    fn classify_unit(&self, unit: UnitRef, cycle: Cycle) -> Result<Step> {
        let (routing, before) = self.store.update(&unit, |m| {
            let before = m.state;
            let decision = self.classifier.classify(&unit.dir, m)?;
            let routing = match decision.target {
                Target::Merge => {
                    let state = if cycle.is_first() && m.is_pristine() {
                        State::MergedDirect
                    } else {
                        State::MergedProcessed(cycle)
                    };
                    Routing::Move(state, decision.route)
                }
                Target::Repair(op) => match self.cycles.admit_repair(m, op) {
                    RepairAdmission::Admitted(state) => Routing::Move(state, None),
                    RepairAdmission::Forced {
                        category, reason, ..
                    } => Routing::Quarantine(category, reason),
                },
                Target::Quarantine(category) => {
                    Routing::Quarantine(category, decision.reason.clone())
                }
            };
            let target_state = match &routing {
                Routing::Move(state, _) => *state,
                Routing::Quarantine(..) => State::Exception(cycle),
            };
            m.processing.classification = Some(decision.record(m, target_state));
            if let Some(route) = decision.route {
                m.processing.route = Some(route);
            }
            if let Routing::Move(state, _) = &routing {
                self.machine.transition(m, *state, &decision.reason)?;
            }
            Ok((routing, before))
        })?;
        self.metrics.unit_classified();

        match routing {
            Routing::Move(state, route) => {
                audit(
                    &self.policy,
                    &unit.dir,
                    AuditEvent::new(
                        unit.id.clone(),
                        AuditEventType::Classification,
                        self.correlation_id.clone(),
                    )
                    .states(before, state)
                    .details(json!({ "route": route.map(|r| r.as_str()) })),
                )?;
                let dest = self
                    .cycles
                    .target_directory(&unit.id, state, None, route)
                    .ok_or_else(|| {
                        PipelineError::Integrity(format!("no location for state {}", state))
                    })?;
                let moved = move_unit(&unit, &dest)?;
                Ok(Step::Advanced(Position { unit: moved, state }))
            }
            Routing::Quarantine(category, reason) => {
                let moved = self.router.quarantine(
                    &self.store,
                    &unit,
                    category,
                    cycle,
                    &reason,
                    &self.correlation_id,
                )?;
                Ok(Step::Advanced(Position {
                    unit: moved,
                    state: State::Exception(cycle),
                }))
            }
        }
    }

    /// Run the pending repair under the error policy and decide what follows.
    fn repair_unit(&self, unit: UnitRef, state: State) -> Result<Step> {
        let (op, cycle) = match (OperationKind::for_pending(state), state.cycle()) {
            (Some(op), Some(cycle)) => (op, cycle),
            _ => {
                return Err(PipelineError::Integrity(format!(
                    "{} is not a repair state",
                    state
                )))
            }
        };
        let engine = self.engines.get(&op).ok_or_else(|| {
            PipelineError::Integrity(format!("no engine registered for {}", op))
        })?;

        self.metrics.repair_started(op);
        let execution = self.policy.execute(
            op,
            self.breakers.get(op),
            self.sleeper.as_ref(),
            &self.cancel,
            |attempt| {
                if attempt > 1 {
                    self.metrics.repair_retried(op);
                }
                self.apply_engine(engine.as_ref(), &unit, cycle)
            },
        );

        match execution {
            Execution::Done { value, attempts } => {
                self.metrics.repair_succeeded(op);
                self.journal_operation(&unit, op, Ok(&value), attempts)?;
                self.after_repair(unit, op, cycle, true, None)
            }
            Execution::Failed {
                error,
                action,
                attempts,
            } => {
                self.metrics.repair_failed(op);
                self.journal_operation(&unit, op, Err(&error), attempts)?;
                match action {
                    ErrorAction::Quarantine(category) => {
                        let reason = format!("{} failed: {}", op, error);
                        let moved = self.router.quarantine(
                            &self.store,
                            &unit,
                            category,
                            cycle,
                            &reason,
                            &self.correlation_id,
                        )?;
                        Ok(Step::Advanced(Position {
                            unit: moved,
                            state: State::Exception(cycle),
                        }))
                    }
                    ErrorAction::Exhausted | ErrorAction::Retry { .. } | ErrorAction::Skip => {
                        self.after_repair(unit, op, cycle, false, Some(&error))
                    }
                }
            }
            Execution::CircuitOpen(open) => {
                self.metrics.circuit_rejected(op);
                warn!(unit = %unit.id, operation = %op, error = %open, "Repair deferred");
                self.store.update(&unit, |m| {
                    m.push_error(ErrorRecord {
                        at: Utc::now(),
                        cycle,
                        operation: Some(op),
                        kind: "circuit_open".to_string(),
                        message: open.to_string(),
                        transient: true,
                    });
                    Ok(())
                })?;
                Ok(Step::Parked(Position { unit, state }))
            }
            Execution::Cancelled => {
                info!(unit = %unit.id, operation = %op, "Repair cancelled");
                Ok(Step::Parked(Position { unit, state }))
            }
        }
    }

    /// One engine attempt. The manifest is saved whether the engine
    /// succeeds or not, since a failed engine may already have changed files.
    fn apply_engine(
        &self,
        engine: &dyn RepairEngine,
        unit: &UnitRef,
        cycle: Cycle,
    ) -> std::result::Result<RepairResult, RepairError> {
        self.store.locks().with_lock(&unit.id, || {
            let mut manifest = self
                .store
                .load(unit)
                .map_err(|e| RepairError::anomaly(format!("manifest unreadable: {}", e)))?;
            let result = engine.apply(&unit.dir, &mut manifest, cycle, &self.cancel);
            if let Err(e) = &result {
                if !e.is_cancelled() {
                    manifest.push_error(ErrorRecord {
                        at: Utc::now(),
                        cycle,
                        operation: Some(engine.operation()),
                        kind: e.kind_str().to_string(),
                        message: e.to_string(),
                        transient: e.is_transient(),
                    });
                }
            }
            manifest.updated_at = Utc::now();
            self.store
                .save(unit, &manifest)
                .map_err(|e| RepairError::transient(format!("manifest save failed: {}", e)))?;
            result
        })
    }

    fn after_repair(
        &self,
        unit: UnitRef,
        op: OperationKind,
        cycle: Cycle,
        succeeded: bool,
        error: Option<&RepairError>,
    ) -> Result<Step> {
        match self.cycles.after_repair(op, cycle, succeeded) {
            AfterRepair::Reclassify(next) => {
                let reason = match error {
                    Some(e) => format!("{} failed in cycle {}: {}", op, cycle, e),
                    None => format!("{} done in cycle {}", op, cycle),
                };
                self.transition(&unit, next, &reason)?;
                Ok(Step::Advanced(Position { unit, state: next }))
            }
            AfterRepair::Quarantine { state, category } => {
                let reason = match error {
                    Some(e) => format!("{} still failing at cycle bound {}: {}", op, cycle, e),
                    None => format!("{} still failing at cycle bound {}", op, cycle),
                };
                let moved = self.router.quarantine(
                    &self.store,
                    &unit,
                    category,
                    cycle,
                    &reason,
                    &self.correlation_id,
                )?;
                Ok(Step::Advanced(Position { unit: moved, state }))
            }
        }
    }

    fn journal_operation(
        &self,
        unit: &UnitRef,
        op: OperationKind,
        result: std::result::Result<&RepairResult, &RepairError>,
        attempts: u32,
    ) -> Result<()> {
        let event = AuditEvent::new(
            unit.id.clone(),
            match result {
                Ok(_) => AuditEventType::Operation,
                Err(_) => AuditEventType::Error,
            },
            self.correlation_id.clone(),
        )
        .operation(op.as_str());
        let details = match result {
            Ok(r) => json!({ "attempts": attempts, "files_changed": r.files_changed, "notes": r.notes }),
            Err(e) => json!({ "attempts": attempts, "kind": e.kind_str(), "error": e.to_string() }),
        };
        audit(&self.policy, &unit.dir, event.details(details))
    }
}
