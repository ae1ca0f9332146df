use crate::prelude::*;
use crate::router::{Entity, EntityType, Intent};
use crate::workers::{registry, WorkerKind};
use std::collections::HashSet;

string_enum!(pub enum Composition {
    Sequential => "sequential",
    Parallel => "parallel",
    Saga => "saga",
});

/// One worker invocation in the plan. Steps live in a dense arena; `inputs`
/// holds indices of earlier steps, which makes cycles unrepresentable by
/// construction and serialization trivial for replay.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Step {
    pub id: String,
    pub worker_kind: WorkerKind,
    pub inputs: Vec<usize>,
    pub composition: Composition,
    pub timeout_secs: u64,
    pub required: bool,
    /// Action dispatched to already-completed steps when a saga unwinds.
    pub compensation: Option<String>,
}

/// Steps executed together: sequentially within a `Sequential`/`Saga` group,
/// all at once within a `Parallel` one. Groups run in order.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlanGroup {
    pub composition: Composition,
    pub steps: Vec<usize>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Plan {
    pub steps: Vec<Step>,
    pub groups: Vec<PlanGroup>,
}

impl Plan {
    /// Steps that count toward progress.
    pub fn required_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.required).count()
    }

    pub fn validate(&self) -> Fallible<()> {
        let mut roots = 0;
        for (index, step) in self.steps.iter().enumerate() {
            if step.inputs.is_empty() {
                roots += 1;
            }
            for &input in &step.inputs {
                if input >= index {
                    bail!("step {} references a later step {}", step.id, input);
                }
            }
        }
        if roots > 1 {
            bail!("plan has {} roots, expected at most one", roots);
        }

        let mut grouped: HashSet<usize> = HashSet::new();
        for group in &self.groups {
            for &step in &group.steps {
                if step >= self.steps.len() {
                    bail!("group references unknown step {step}");
                }
                if !grouped.insert(step) {
                    bail!("step {step} appears in more than one group");
                }
            }
        }
        if grouped.len() != self.steps.len() {
            bail!("not every step is scheduled in a group");
        }

        Ok(())
    }
}

/// Builds the execution DAG for a worker selection. Deterministic: the same
/// `(intent, entities, workers)` triple always produces the same plan,
/// byte-for-byte when serialized.
pub fn plan(
    _intent: &Intent,
    _entities: &[Entity],
    workers: &[WorkerKind],
    total_budget_secs: u64,
) -> Plan {
    // Unknown kinds are dropped here; the router already falls back to the
    // communicator when nothing remains.
    let descriptors: Vec<_> = workers
        .iter()
        .filter_map(|kind| registry::descriptor(*kind))
        .collect();

    let mut steps: Vec<Step> = Vec::new();
    let mut groups: Vec<PlanGroup> = Vec::new();

    // The orchestrator-master root exists only on multi-worker plans.
    let root = if descriptors.len() > 1 {
        steps.push(Step {
            id: WorkerKind::OrchestratorMaster.to_string(),
            worker_kind: WorkerKind::OrchestratorMaster,
            inputs: Vec::new(),
            composition: Composition::Sequential,
            timeout_secs: 5,
            required: false,
            compensation: None,
        });
        groups.push(PlanGroup {
            composition: Composition::Sequential,
            steps: vec![0],
        });
        Some(0)
    } else {
        None
    };

    // Leaves: no capability dependencies. Read-only workers over pairwise
    // disjoint sources share a parallel group; the rest run sequentially.
    let leaves: Vec<_> = descriptors
        .iter()
        .filter(|d| d.depends_on.is_empty())
        .collect();
    let disjoint = pairwise_disjoint_sources(&leaves);
    let parallel = disjoint && leaves.iter().all(|d| d.read_only) && leaves.len() > 1;

    let leaf_budget = if parallel {
        total_budget_secs / leaves.len().max(1) as u64
    } else {
        total_budget_secs
    };
    let mut leaf_indices = Vec::new();
    let mut group_steps = Vec::new();
    for descriptor in &leaves {
        let index = steps.len();
        steps.push(Step {
            id: descriptor.kind.to_string(),
            worker_kind: descriptor.kind,
            inputs: root.into_iter().collect(),
            composition: if parallel {
                Composition::Parallel
            } else {
                Composition::Sequential
            },
            timeout_secs: descriptor.timeout_secs.min(leaf_budget.max(1)),
            // The communicator alone carries single-worker plans.
            required: descriptors.len() == 1 || descriptor.kind != WorkerKind::RegionalAnalyst,
            compensation: (!descriptor.read_only).then(|| "compensate".to_string()),
        });
        leaf_indices.push(index);
        group_steps.push(index);
    }
    if !group_steps.is_empty() {
        groups.push(PlanGroup {
            composition: if parallel {
                Composition::Parallel
            } else if group_steps.iter().any(|&s| steps[s].compensation.is_some()) {
                Composition::Saga
            } else {
                Composition::Sequential
            },
            steps: group_steps,
        });
    }

    // Downstream consumers, in dependency order: aggregator before the
    // report writer, which is always terminal.
    let mut consumers: Vec<_> = descriptors
        .iter()
        .filter(|d| !d.depends_on.is_empty())
        .collect();
    consumers.sort_by_key(|d| (d.kind == WorkerKind::ReportWriter, d.kind.to_str()));

    let mut produced: Vec<(String, usize)> = leaves
        .iter()
        .zip(&leaf_indices)
        .map(|(d, &i)| (d.provides.to_string(), i))
        .collect();

    for descriptor in consumers {
        let inputs: Vec<usize> = produced
            .iter()
            .filter(|(capability, _)| {
                descriptor.depends_on.contains(&capability.as_str())
                    || descriptor.kind == WorkerKind::ReportWriter
            })
            .map(|(_, index)| *index)
            .collect();

        let index = steps.len();
        steps.push(Step {
            id: descriptor.kind.to_string(),
            worker_kind: descriptor.kind,
            inputs: if inputs.is_empty() {
                root.into_iter().collect()
            } else {
                inputs
            },
            composition: Composition::Sequential,
            timeout_secs: descriptor.timeout_secs.min(total_budget_secs.max(1)),
            required: true,
            compensation: None,
        });
        produced.push((descriptor.provides.to_string(), index));
        groups.push(PlanGroup {
            composition: Composition::Sequential,
            steps: vec![index],
        });
    }

    Plan { steps, groups }
}

fn pairwise_disjoint_sources(descriptors: &[&&'static registry::WorkerDescriptor]) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    for descriptor in descriptors {
        for source in descriptor.data_sources {
            if !seen.insert(source) {
                return false;
            }
        }
    }
    true
}

/// Filter map handed to workers, derived from the extracted entities using
/// Portal da Transparência parameter names.
pub fn filters_from_entities(entities: &[Entity]) -> serde_json::Value {
    let mut filters = serde_json::Map::new();

    for entity in entities {
        match entity.entity_type {
            EntityType::Year => {
                filters.insert("ano".into(), entity.value.clone().into());
            }
            EntityType::State => {
                filters.insert("uf".into(), entity.value.clone().into());
            }
            EntityType::Municipality => {
                filters.insert("municipio".into(), entity.value.clone().into());
            }
            EntityType::Agency => {
                filters.insert("codigoOrgao".into(), entity.value.clone().into());
            }
            EntityType::Amount => {
                filters.insert("valorMinimo".into(), entity.value.clone().into());
            }
            EntityType::DateRange => {
                if let Some((start, end)) = entity.value.split_once("..") {
                    filters.insert("anoInicio".into(), start.into());
                    filters.insert("anoFim".into(), end.into());
                }
            }
            EntityType::DataSource => {
                filters.insert("fonte".into(), entity.value.clone().into());
            }
            EntityType::Identifier => {
                filters.insert("cpfCnpj".into(), entity.value.clone().into());
            }
        }
    }

    serde_json::Value::Object(filters)
}
