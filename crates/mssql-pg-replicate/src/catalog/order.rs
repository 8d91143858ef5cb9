//! Foreign-key dependency ordering.
//!
//! Tables are arranged into stages: referenced tables land in earlier
//! stages than referencing tables, tables inside one stage are independent
//! and may run concurrently, and self-referential tables run in a pass
//! after their level's siblings. Multi-table cycles are fatal unless an
//! explicit override order covers every table in the cycle.

use super::{Catalog, TableDescriptor};
use crate::error::{ReplicateError, Result};
use std::collections::{HashMap, HashSet};

/// The ordered replication plan for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationPlan {
    /// Stages in execution order; tables inside a stage are independent.
    pub stages: Vec<Vec<String>>,
}

impl ReplicationPlan {
    /// Total number of tables in the plan.
    pub fn table_count(&self) -> usize {
        self.stages.iter().map(|s| s.len()).sum()
    }

    /// Flat table order (stage by stage).
    pub fn flat_order(&self) -> Vec<&str> {
        self.stages
            .iter()
            .flat_map(|s| s.iter().map(String::as_str))
            .collect()
    }
}

/// Build the replication plan from the catalog's foreign-key graph.
///
/// `cycle_override` supplies the externally-decided order for tables that
/// form a multi-table cycle; each listed table becomes its own stage, in
/// list order, after all acyclic tables. A cycle not fully covered by the
/// override is a schema-integrity error.
pub fn build_plan(catalog: &Catalog, cycle_override: &[String]) -> Result<ReplicationPlan> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for table in &catalog.tables {
        indegree.entry(table.name.as_str()).or_insert(0);
        for referenced in table.references() {
            dependents
                .entry(referenced)
                .or_default()
                .push(table.name.as_str());
            *indegree.entry(table.name.as_str()).or_insert(0) += 1;
        }
    }

    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(name, _)| *name)
        .collect();
    ready.sort_unstable();

    let mut stages: Vec<Vec<String>> = Vec::new();
    let mut placed: HashSet<&str> = HashSet::new();

    while !ready.is_empty() {
        // Self-referential tables wait for their level's siblings: plain
        // tables form one stage, hierarchies the next.
        let (plain, hierarchies): (Vec<&str>, Vec<&str>) = ready
            .iter()
            .partition(|name| !is_self_referential(catalog, name));

        for group in [plain, hierarchies] {
            if !group.is_empty() {
                stages.push(group.iter().map(|n| n.to_string()).collect());
            }
        }

        let level = std::mem::take(&mut ready);
        for name in level {
            placed.insert(name);
            for &dependent in dependents.get(name).into_iter().flatten() {
                if let Some(deg) = indegree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(dependent);
                    }
                }
            }
        }
        ready.sort_unstable();
    }

    // Anything not placed sits on a multi-table cycle.
    let mut cyclic: Vec<&str> = catalog
        .tables
        .iter()
        .map(|t| t.name.as_str())
        .filter(|name| !placed.contains(name))
        .collect();

    if !cyclic.is_empty() {
        let covered = cyclic
            .iter()
            .all(|name| cycle_override.iter().any(|o| o == name));
        if !covered {
            cyclic.sort_unstable();
            return Err(ReplicateError::Catalog(format!(
                "foreign-key cycle with no override order: {}",
                cyclic.join(", ")
            )));
        }
        for name in cycle_override {
            if cyclic.contains(&name.as_str()) {
                stages.push(vec![name.clone()]);
            }
        }
    }

    Ok(ReplicationPlan { stages })
}

fn is_self_referential(catalog: &Catalog, name: &str) -> bool {
    catalog
        .table(name)
        .map(TableDescriptor::is_self_referential)
        .unwrap_or(false)
}
