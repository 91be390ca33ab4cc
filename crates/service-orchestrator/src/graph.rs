//! # Dependency Graph Resolver
//!
//! Turns a descriptor set into an [`ExecutionPlan`]: an ordered list of
//! [`Stage`]s in which every service appears after all of its dependencies.
//!
//! Resolution runs in four passes and stops at the first error:
//!
//! 1. duplicate ids,
//! 2. self-loops and references to undeclared services,
//! 3. cycle detection (depth-first search with a recursion-stack marker),
//! 4. stage assignment (Kahn's algorithm, one round per stage).
//!
//! The resolver is pure. It never touches a supervisor, so a rejected
//! descriptor set issues zero start operations.

use crate::descriptor::{DependencyCondition, ServiceDescriptor, ServiceId};
use crate::error::ConfigurationError;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::{self, Display};

/// Services that may be started concurrently. Members are sorted for stable
/// output only; there is no ordering among them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage(Vec<ServiceId>);

impl Stage {
    pub fn members(&self) -> &[ServiceId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &ServiceId) -> bool {
        self.0.contains(id)
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(ServiceId::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Startup order for a validated descriptor set. Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    stages: Vec<Stage>,
}

impl ExecutionPlan {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Zero-based stage index of `id`.
    pub fn stage_of(&self, id: &ServiceId) -> Option<usize> {
        self.stages.iter().position(|s| s.contains(id))
    }

    /// All services, stage by stage.
    pub fn start_order(&self) -> impl Iterator<Item = &ServiceId> {
        self.stages.iter().flat_map(|s| s.members().iter())
    }

    /// Stages in the order they are torn down.
    pub fn shutdown_order(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter().rev()
    }

    pub fn service_count(&self) -> usize {
        self.stages.iter().map(Stage::len).sum()
    }
}

impl Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            writeln!(f, "stage {}: {}", i + 1, stage)?;
        }
        Ok(())
    }
}

/// Computes the staged startup order for `descriptors`.
pub fn resolve(descriptors: &[ServiceDescriptor]) -> Result<ExecutionPlan, ConfigurationError> {
    let mut known: HashSet<&ServiceId> = HashSet::with_capacity(descriptors.len());
    for d in descriptors {
        if !known.insert(&d.id) {
            return Err(ConfigurationError::DuplicateService(d.id.clone()));
        }
    }

    // Edges are deduplicated; a service may list the same dependency twice.
    let mut edges: BTreeMap<&ServiceId, BTreeSet<&ServiceId>> = BTreeMap::new();
    for d in descriptors {
        let deps = edges.entry(&d.id).or_default();
        for dep in d.dependency_ids() {
            if dep == &d.id {
                return Err(ConfigurationError::SelfDependency(d.id.clone()));
            }
            if !known.contains(dep) {
                return Err(ConfigurationError::UnknownDependency {
                    service: d.id.clone(),
                    dependency: dep.clone(),
                });
            }
            deps.insert(dep);
        }
    }

    if let Some(cycle) = find_cycle(&edges) {
        return Err(ConfigurationError::CyclicDependency(cycle));
    }

    Ok(ExecutionPlan {
        stages: kahn_stages(&edges),
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

fn find_cycle(edges: &BTreeMap<&ServiceId, BTreeSet<&ServiceId>>) -> Option<Vec<ServiceId>> {
    let mut marks: HashMap<&ServiceId, Mark> =
        edges.keys().map(|id| (*id, Mark::Unvisited)).collect();
    let mut path = Vec::new();

    for id in edges.keys() {
        if marks[id] == Mark::Unvisited {
            if let Some(cycle) = visit(*id, edges, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<'a>(
    id: &'a ServiceId,
    edges: &BTreeMap<&'a ServiceId, BTreeSet<&'a ServiceId>>,
    marks: &mut HashMap<&'a ServiceId, Mark>,
    path: &mut Vec<&'a ServiceId>,
) -> Option<Vec<ServiceId>> {
    marks.insert(id, Mark::OnStack);
    path.push(id);

    if let Some(deps) = edges.get(id) {
        for dep in deps {
            match marks.get(dep).copied().unwrap_or(Mark::Done) {
                Mark::OnStack => {
                    // Back edge: the cycle is the path from `dep` to here.
                    let start = path.iter().position(|p| p == dep).unwrap_or(0);
                    let mut cycle: Vec<ServiceId> =
                        path[start..].iter().map(|p| (*p).clone()).collect();
                    cycle.push((*dep).clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(*dep, edges, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
    }

    path.pop();
    marks.insert(id, Mark::Done);
    None
}

fn kahn_stages(edges: &BTreeMap<&ServiceId, BTreeSet<&ServiceId>>) -> Vec<Stage> {
    let mut remaining: BTreeMap<&ServiceId, usize> =
        edges.iter().map(|(id, deps)| (*id, deps.len())).collect();
    let mut dependents: HashMap<&ServiceId, Vec<&ServiceId>> = HashMap::new();
    for (id, deps) in edges {
        for dep in deps {
            dependents.entry(*dep).or_default().push(*id);
        }
    }

    let mut stages = Vec::new();
    loop {
        let ready: Vec<&ServiceId> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in &ready {
            remaining.remove(id);
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(n) = remaining.get_mut(dependent) {
                    *n -= 1;
                }
            }
        }
        stages.push(Stage(ready.into_iter().cloned().collect()));
    }
    stages
}

/// Forward and reverse adjacency over a descriptor set, used for failure
/// propagation and readiness conditions.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: HashMap<ServiceId, Vec<(ServiceId, DependencyCondition)>>,
    dependents: HashMap<ServiceId, Vec<(ServiceId, DependencyCondition)>>,
}

impl DependencyGraph {
    pub fn new(descriptors: &[ServiceDescriptor]) -> Self {
        let mut graph = Self::default();
        for d in descriptors {
            graph.dependencies.entry(d.id.clone()).or_default();
            graph.dependents.entry(d.id.clone()).or_default();
        }
        for d in descriptors {
            let mut seen = BTreeSet::new();
            for dep in d.dependency_ids() {
                if !seen.insert(dep) {
                    continue;
                }
                let condition = d.condition_for(dep).unwrap_or_default();
                graph
                    .dependencies
                    .entry(d.id.clone())
                    .or_default()
                    .push((dep.clone(), condition));
                graph
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .push((d.id.clone(), condition));
            }
        }
        for list in graph
            .dependencies
            .values_mut()
            .chain(graph.dependents.values_mut())
        {
            list.sort_by(|a, b| a.0.cmp(&b.0));
        }
        graph
    }

    pub fn dependencies_of(&self, id: &ServiceId) -> impl Iterator<Item = &ServiceId> {
        self.dependencies
            .get(id)
            .into_iter()
            .flatten()
            .map(|(dep, _)| dep)
    }

    pub fn dependents_of(&self, id: &ServiceId) -> impl Iterator<Item = &ServiceId> {
        self.dependents
            .get(id)
            .into_iter()
            .flatten()
            .map(|(dep, _)| dep)
    }

    /// Every service that depends on `id`, directly or not, in breadth-first
    /// order.
    pub fn transitive_dependents(&self, id: &ServiceId) -> Vec<ServiceId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<&ServiceId> = self.dependents_of(id).collect();
        while let Some(next) = queue.pop_front() {
            if next == id || !seen.insert(next) {
                continue;
            }
            order.push(next.clone());
            queue.extend(self.dependents_of(next));
        }
        order
    }

    /// What `id` must reach before its stage counts as settled: `Started`
    /// only when every dependent asks for no more than that.
    pub fn required_condition(&self, id: &ServiceId) -> DependencyCondition {
        let mut dependents = self.dependents.get(id).into_iter().flatten().peekable();
        if dependents.peek().is_none() {
            return DependencyCondition::Ready;
        }
        if dependents.all(|(_, c)| *c == DependencyCondition::Started) {
            DependencyCondition::Started
        } else {
            DependencyCondition::Ready
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(id: &str, deps: &[&str]) -> ServiceDescriptor {
        deps.iter()
            .fold(ServiceDescriptor::builder(id).command("true"), |b, d| {
                b.depends_on(*d)
            })
            .build()
    }

    fn ids(stage: &Stage) -> Vec<&str> {
        stage.members().iter().map(ServiceId::as_str).collect()
    }

    #[test]
    fn independent_services_share_a_stage() {
        let plan = resolve(&[svc("c", &[]), svc("a", &[]), svc("b", &[])]).unwrap();
        assert_eq!(plan.stages().len(), 1);
        assert_eq!(ids(&plan.stages()[0]), vec!["a", "b", "c"]);
    }

    #[test]
    fn dependents_land_in_a_later_stage() {
        let plan = resolve(&[svc("c", &["a", "b"]), svc("a", &[]), svc("b", &[])]).unwrap();
        assert_eq!(plan.stages().len(), 2);
        assert_eq!(ids(&plan.stages()[0]), vec!["a", "b"]);
        assert_eq!(ids(&plan.stages()[1]), vec!["c"]);
        assert_eq!(plan.stage_of(&ServiceId::from("c")), Some(1));
    }

    #[test]
    fn diamond_is_three_stages() {
        let plan = resolve(&[
            svc("top", &["left", "right"]),
            svc("left", &["base"]),
            svc("right", &["base"]),
            svc("base", &[]),
        ])
        .unwrap();
        let stages: Vec<Vec<&str>> = plan.stages().iter().map(ids).collect();
        assert_eq!(
            stages,
            vec![vec!["base"], vec!["left", "right"], vec!["top"]]
        );
        let down: Vec<Vec<&str>> = plan.shutdown_order().map(ids).collect();
        assert_eq!(down[0], vec!["top"]);
        assert_eq!(down[2], vec!["base"]);
    }

    #[test]
    fn every_dependency_precedes_its_dependent() {
        let descriptors = vec![
            svc("e", &["d", "a"]),
            svc("d", &["c"]),
            svc("c", &["b"]),
            svc("b", &["a"]),
            svc("a", &[]),
            svc("f", &[]),
        ];
        let plan = resolve(&descriptors).unwrap();
        assert_eq!(plan.service_count(), descriptors.len());
        for d in &descriptors {
            for dep in d.dependency_ids() {
                assert!(plan.stage_of(dep) < plan.stage_of(&d.id));
            }
        }
    }

    #[test]
    fn three_node_cycle_is_reported_with_its_path() {
        let err = resolve(&[svc("a", &["b"]), svc("b", &["c"]), svc("c", &["a"])]).unwrap_err();
        match err {
            ConfigurationError::CyclicDependency(cycle) => {
                assert_eq!(cycle.len(), 4);
                assert_eq!(cycle.first(), cycle.last());
                for id in ["a", "b", "c"] {
                    assert!(cycle.iter().any(|c| c.as_str() == id));
                }
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn integrity_errors() {
        assert_eq!(
            resolve(&[svc("a", &[]), svc("a", &[])]),
            Err(ConfigurationError::DuplicateService("a".into()))
        );
        assert_eq!(
            resolve(&[svc("a", &["a"])]),
            Err(ConfigurationError::SelfDependency("a".into()))
        );
        assert_eq!(
            resolve(&[svc("a", &["ghost"])]),
            Err(ConfigurationError::UnknownDependency {
                service: "a".into(),
                dependency: "ghost".into(),
            })
        );
    }

    #[test]
    fn duplicate_edges_are_tolerated() {
        let plan = resolve(&[svc("a", &[]), svc("b", &["a", "a"])]).unwrap();
        assert_eq!(plan.stages().len(), 2);
    }

    #[test]
    fn graph_walks_dependents() {
        let descriptors = [
            svc("etcd", &[]),
            svc("minio", &[]),
            svc("milvus", &["etcd", "minio"]),
            svc("attu", &["milvus"]),
        ];
        let graph = DependencyGraph::new(&descriptors);
        let etcd = ServiceId::from("etcd");
        assert_eq!(
            graph.transitive_dependents(&etcd),
            vec![ServiceId::from("milvus"), ServiceId::from("attu")]
        );
        assert_eq!(
            graph.dependencies_of(&ServiceId::from("milvus")).count(),
            2
        );
        assert_eq!(graph.required_condition(&etcd), DependencyCondition::Ready);
    }

    #[test]
    fn started_edges_relax_the_required_condition() {
        let descriptors = [
            svc("log", &[]),
            ServiceDescriptor::builder("app")
                .command("true")
                .depends_on_started("log")
                .build(),
        ];
        let graph = DependencyGraph::new(&descriptors);
        assert_eq!(
            graph.required_condition(&ServiceId::from("log")),
            DependencyCondition::Started
        );
        assert_eq!(
            graph.required_condition(&ServiceId::from("app")),
            DependencyCondition::Ready
        );
    }
}
