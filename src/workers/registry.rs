use crate::config::Config;
use crate::prelude::*;
use crate::workers::{
    aggregator::Aggregator, anomaly::AnomalyDetector, communicator::Communicator,
    corruption::CorruptionDetector, patterns::PatternAnalyzer, regional::RegionalAnalyst,
    report::ReportWriter, textual::TextualAnalyzer, Worker, WorkerKind,
};

/// Static description of a worker kind. Reflection metadata lives here, not
/// on the instances; `None` defers to the configured default.
pub struct WorkerDescriptor {
    pub kind: WorkerKind,
    /// What this worker contributes; the planner wires `depends_on` edges to
    /// the producers of each named capability.
    pub provides: &'static str,
    pub depends_on: &'static [&'static str],
    /// Registry capability tags this worker reads from. Read-only workers
    /// touching disjoint source sets may run in parallel.
    pub data_sources: &'static [&'static str],
    pub read_only: bool,
    pub max_concurrent_instances: usize,
    pub timeout_secs: u64,
    pub quality_threshold: Option<f64>,
    pub max_reflection_iterations: Option<u32>,
    /// Router tie-break: higher wins.
    pub priority: u8,
}

impl WorkerDescriptor {
    pub fn quality_threshold(&self, config: &Config) -> f64 {
        self.quality_threshold
            .unwrap_or(config.workers.quality_threshold_default)
    }

    pub fn max_reflection_iterations(&self, config: &Config) -> u32 {
        self.max_reflection_iterations
            .unwrap_or(config.workers.max_reflection_iterations)
    }
}

/// Every worker kind this build ships. Kinds the router may know about but
/// that are absent here degrade to the communicator.
pub static CATALOG: &[WorkerDescriptor] = &[
    WorkerDescriptor {
        kind: WorkerKind::AnomalyDetector,
        provides: "anomalies",
        depends_on: &[],
        data_sources: &["contracts", "expenses"],
        read_only: true,
        max_concurrent_instances: 4,
        timeout_secs: 60,
        quality_threshold: None,
        max_reflection_iterations: None,
        priority: 8,
    },
    WorkerDescriptor {
        kind: WorkerKind::PatternAnalyzer,
        provides: "patterns",
        depends_on: &[],
        data_sources: &["procurement"],
        read_only: true,
        max_concurrent_instances: 4,
        timeout_secs: 60,
        quality_threshold: None,
        max_reflection_iterations: None,
        priority: 7,
    },
    WorkerDescriptor {
        kind: WorkerKind::CorruptionDetector,
        provides: "integrity",
        depends_on: &[],
        data_sources: &["sanctions"],
        read_only: true,
        max_concurrent_instances: 4,
        timeout_secs: 60,
        quality_threshold: Some(0.85),
        max_reflection_iterations: None,
        priority: 9,
    },
    WorkerDescriptor {
        kind: WorkerKind::RegionalAnalyst,
        provides: "regional",
        depends_on: &[],
        data_sources: &["geography", "demographics"],
        read_only: true,
        max_concurrent_instances: 2,
        timeout_secs: 60,
        quality_threshold: None,
        max_reflection_iterations: None,
        priority: 5,
    },
    WorkerDescriptor {
        kind: WorkerKind::TextualAnalyzer,
        provides: "textual",
        depends_on: &[],
        data_sources: &["gazettes", "legislative"],
        read_only: true,
        max_concurrent_instances: 2,
        timeout_secs: 60,
        quality_threshold: None,
        max_reflection_iterations: None,
        priority: 4,
    },
    WorkerDescriptor {
        kind: WorkerKind::Aggregator,
        provides: "aggregate",
        depends_on: &["anomalies", "patterns", "integrity", "regional", "textual"],
        data_sources: &[],
        read_only: true,
        max_concurrent_instances: 2,
        timeout_secs: 30,
        quality_threshold: None,
        max_reflection_iterations: Some(1),
        priority: 6,
    },
    WorkerDescriptor {
        kind: WorkerKind::ReportWriter,
        provides: "report",
        depends_on: &["aggregate"],
        data_sources: &[],
        read_only: true,
        max_concurrent_instances: 2,
        timeout_secs: 45,
        quality_threshold: Some(0.7),
        max_reflection_iterations: None,
        priority: 6,
    },
    WorkerDescriptor {
        kind: WorkerKind::Communicator,
        provides: "help",
        depends_on: &[],
        data_sources: &[],
        read_only: true,
        max_concurrent_instances: 8,
        timeout_secs: 10,
        quality_threshold: Some(0.5),
        max_reflection_iterations: Some(0),
        priority: 1,
    },
    WorkerDescriptor {
        kind: WorkerKind::OrchestratorMaster,
        provides: "coordination",
        depends_on: &[],
        data_sources: &[],
        read_only: true,
        max_concurrent_instances: 1,
        timeout_secs: 10,
        quality_threshold: Some(0.5),
        max_reflection_iterations: Some(0),
        priority: 10,
    },
];

pub fn descriptor(kind: WorkerKind) -> Option<&'static WorkerDescriptor> {
    CATALOG.iter().find(|descriptor| descriptor.kind == kind)
}

/// Worker kinds able to produce a capability, best priority first.
pub fn lookup_by_capability(capability: &str) -> Vec<&'static WorkerDescriptor> {
    let mut matches: Vec<_> = CATALOG
        .iter()
        .filter(|descriptor| descriptor.provides == capability)
        .collect();
    matches.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.kind.to_str().cmp(b.kind.to_str())));
    matches
}

pub(super) fn instantiate(kind: WorkerKind) -> Fallible<Box<dyn Worker>> {
    let mut worker: Box<dyn Worker> = match kind {
        WorkerKind::AnomalyDetector => Box::new(AnomalyDetector::default()),
        WorkerKind::PatternAnalyzer => Box::new(PatternAnalyzer::default()),
        WorkerKind::CorruptionDetector => Box::new(CorruptionDetector::default()),
        WorkerKind::RegionalAnalyst => Box::new(RegionalAnalyst::default()),
        WorkerKind::TextualAnalyzer => Box::new(TextualAnalyzer::default()),
        WorkerKind::Aggregator => Box::new(Aggregator::default()),
        WorkerKind::ReportWriter => Box::new(ReportWriter::default()),
        WorkerKind::Communicator => Box::new(Communicator::default()),
        WorkerKind::OrchestratorMaster => {
            bail!("orchestrator-master is a plan root, not an instantiable worker")
        }
    };

    worker.initialize()?;
    Ok(worker)
}
