//! Dependency resolution
//!
//! Orders services so that every service comes after everything it depends
//! on. Among services whose dependencies are already placed, the one declared
//! first in the descriptor goes first, which keeps the order stable across
//! runs.

use super::model::Project;
use crate::error::{ComposeError, Result};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use std::collections::{BTreeSet, HashMap};

/// Dependency graph over service indices in declaration order
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    /// `deps[i]` holds the indices service `i` depends on
    deps: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build a graph from names in declaration order and their dependency lists.
    ///
    /// Dependencies naming unknown services are ignored; the loader rejects
    /// those before a graph is ever built from a project.
    pub fn new<'a, I, D>(services: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a str>,
    {
        let services: Vec<(&str, Vec<&str>)> = services
            .into_iter()
            .map(|(name, deps)| (name, deps.into_iter().collect()))
            .collect();
        let index: HashMap<&str, usize> = services
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (*name, i))
            .collect();

        let names = services.iter().map(|(name, _)| name.to_string()).collect();
        let deps = services
            .iter()
            .map(|(_, deps)| deps.iter().filter_map(|d| index.get(d).copied()).collect())
            .collect();

        Self { names, deps }
    }

    /// Graph of every service in `project`
    pub fn from_project(project: &Project) -> Self {
        Self::new(
            project
                .services
                .iter()
                .map(|s| (s.name.as_str(), s.dependency_names())),
        )
    }

    /// Linear start order: dependencies before dependents, ties by declaration order.
    ///
    /// The next service is always the earliest declared one whose
    /// dependencies are all placed.
    pub fn start_order(&self) -> Result<Vec<String>> {
        let (mut pending, dependents) = self.indegrees();
        let mut ready: BTreeSet<usize> = (0..self.names.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(self.names.len());

        while let Some(i) = ready.pop_first() {
            for &dependent in &dependents[i] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
            order.push(self.names[i].clone());
        }

        if order.len() < self.names.len() {
            return Err(self.cycle_error());
        }
        Ok(order)
    }

    fn indegrees(&self) -> (Vec<usize>, Vec<Vec<usize>>) {
        let pending = self.deps.iter().map(Vec::len).collect();
        let mut dependents = vec![Vec::new(); self.names.len()];
        for (i, deps) in self.deps.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }
        (pending, dependents)
    }

    fn cycle_error(&self) -> ComposeError {
        let members = self.cycle_members();
        tracing::debug!("Dependency cycle among {:?}", members);
        ComposeError::CyclicDependency { members }
    }

    /// Start order grouped into waves.
    ///
    /// Every service in a wave depends only on services of earlier waves, so a
    /// whole wave may be launched at once.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let n = self.names.len();
        let (mut pending, dependents) = self.indegrees();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut levels = Vec::new();
        let mut placed = 0;

        while !ready.is_empty() {
            let wave: Vec<usize> = std::mem::take(&mut ready).into_iter().collect();
            for &i in &wave {
                for &dependent in &dependents[i] {
                    pending[dependent] -= 1;
                    if pending[dependent] == 0 {
                        ready.insert(dependent);
                    }
                }
            }
            placed += wave.len();
            levels.push(wave.into_iter().map(|i| self.names[i].clone()).collect());
        }

        if placed < n {
            return Err(self.cycle_error());
        }

        Ok(levels)
    }

    /// Services that sit on a dependency cycle, in declaration order
    pub fn cycle_members(&self) -> Vec<String> {
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..self.names.len()).map(|i| graph.add_node(i)).collect();
        for (i, deps) in self.deps.iter().enumerate() {
            for &d in deps {
                graph.add_edge(nodes[i], nodes[d], ());
            }
        }

        let mut members: Vec<usize> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.deps[graph[scc[0]]].contains(&graph[scc[0]]))
            .flatten()
            .map(|node| graph[node])
            .collect();
        members.sort_unstable();

        members.into_iter().map(|i| self.names[i].clone()).collect()
    }
}

/// Resolves start and stop order for a project
pub struct DependencyResolver<'a> {
    project: &'a Project,
    graph: DependencyGraph,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(project: &'a Project) -> Self {
        Self {
            project,
            graph: DependencyGraph::from_project(project),
        }
    }

    /// Start order of every service
    pub fn start_order(&self) -> Result<Vec<String>> {
        self.graph.start_order()
    }

    /// Launch waves of every service
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        self.graph.levels()
    }

    /// Start order restricted to `selected` and their transitive dependencies
    pub fn start_order_for(&self, selected: &[String]) -> Result<Vec<String>> {
        let order = self.start_order()?;
        if selected.is_empty() {
            return Ok(order);
        }
        let wanted = self.project.with_dependencies(selected)?;
        Ok(order.into_iter().filter(|s| wanted.contains(s)).collect())
    }

    /// Reverse dependency order: dependents stop before what they depend on
    pub fn stop_order(&self) -> Result<Vec<String>> {
        let mut order = self.start_order()?;
        order.reverse();
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::ComposeParser;
    use proptest::prelude::*;
    use std::path::Path;

    fn graph(edges: &[(&'static str, Vec<&'static str>)]) -> DependencyGraph {
        DependencyGraph::new(edges.iter().map(|(n, d)| (*n, d.iter().copied())))
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|s| s == name).unwrap()
    }

    #[test]
    fn test_get_start_order() {
        let g = graph(&[("web", vec!["api"]), ("api", vec!["db"]), ("db", vec![])]);
        assert_eq!(g.start_order().unwrap(), vec!["db", "api", "web"]);
    }

    #[test]
    fn test_shared_dependencies_come_first() {
        let g = graph(&[
            ("web", vec!["db", "redis"]),
            ("worker", vec!["db", "redis"]),
            ("db", vec![]),
            ("redis", vec![]),
        ]);
        let order = g.start_order().unwrap();

        for dep in ["db", "redis"] {
            assert!(position(&order, dep) < position(&order, "web"));
            assert!(position(&order, dep) < position(&order, "worker"));
        }
        assert_eq!(
            g.levels().unwrap(),
            vec![vec!["db", "redis"], vec!["web", "worker"]]
        );
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let g = graph(&[("c", vec![]), ("a", vec![]), ("b", vec![])]);
        assert_eq!(g.start_order().unwrap(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_earlier_declaration_starts_once_unblocked() {
        let g = graph(&[
            ("web", vec!["db"]),
            ("db", vec![]),
            ("unrelated", vec![]),
        ]);
        assert_eq!(g.start_order().unwrap(), vec!["db", "web", "unrelated"]);
        assert_eq!(g.levels().unwrap(), vec![vec!["db", "unrelated"], vec!["web"]]);
    }

    #[test]
    fn test_circular_dependency_detection() {
        let g = graph(&[("a", vec!["b"]), ("b", vec!["a"])]);
        match g.start_order() {
            Err(ComposeError::CyclicDependency { members }) => assert_eq!(members, vec!["a", "b"]),
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_members_exclude_downstream_services() {
        let g = graph(&[
            ("db", vec![]),
            ("a", vec!["b", "db"]),
            ("b", vec!["c"]),
            ("c", vec!["a"]),
            ("web", vec!["a"]),
        ]);
        match g.start_order() {
            Err(ComposeError::CyclicDependency { members }) => {
                assert_eq!(members, vec!["a", "b", "c"])
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_resolver_on_project() {
        let yaml = r#"
services:
  web:
    image: nginx
    depends_on: [db, redis]
  worker:
    image: worker
    depends_on: [db, redis]
  db:
    image: postgres
  redis:
    image: redis
  unrelated:
    image: busybox
"#;
        let project = ComposeParser::load_str(yaml, "test", Path::new("/tmp"), &Default::default()).unwrap();
        let resolver = DependencyResolver::new(&project);

        assert_eq!(
            resolver.start_order().unwrap(),
            vec!["db", "redis", "web", "worker", "unrelated"]
        );
        assert_eq!(
            resolver.start_order_for(&["web".to_string()]).unwrap(),
            vec!["db", "redis", "web"]
        );
        assert_eq!(
            resolver.stop_order().unwrap(),
            vec!["unrelated", "worker", "web", "redis", "db"]
        );
    }

    /// Random DAG: a shuffled rank per node, edges only from higher to lower rank
    fn arb_dag() -> impl Strategy<Value = (Vec<usize>, Vec<Vec<usize>>)> {
        (1usize..12).prop_flat_map(|n| {
            (
                Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
                proptest::collection::vec(any::<bool>(), n * n),
            )
                .prop_map(move |(rank, flags)| {
                    let deps = (0..n)
                        .map(|i| {
                            (0..n)
                                .filter(|&j| rank[j] < rank[i] && flags[i * n + j])
                                .collect()
                        })
                        .collect();
                    (rank, deps)
                })
        })
    }

    fn named(deps: &[Vec<usize>]) -> DependencyGraph {
        let names: Vec<String> = (0..deps.len()).map(|i| format!("svc{}", i)).collect();
        let lists: Vec<Vec<&str>> = deps
            .iter()
            .map(|d| d.iter().map(|&j| names[j].as_str()).collect())
            .collect();
        DependencyGraph::new(names.iter().map(String::as_str).zip(lists))
    }

    proptest! {
        #[test]
        fn property_dependencies_precede_dependents((_rank, deps) in arb_dag()) {
            let order = named(&deps).start_order().unwrap();
            prop_assert_eq!(order.len(), deps.len());
            for (i, list) in deps.iter().enumerate() {
                for &j in list {
                    let dependent = position(&order, &format!("svc{}", i));
                    let dependency = position(&order, &format!("svc{}", j));
                    prop_assert!(dependency < dependent);
                }
            }
        }

        #[test]
        fn property_cycles_never_yield_an_order(
            (_rank, mut deps) in arb_dag().prop_filter("need two nodes", |(r, _)| r.len() > 1),
            pick in any::<(usize, usize)>(),
        ) {
            let n = deps.len();
            let x = pick.0 % n;
            let y = (x + 1 + pick.1 % (n - 1)) % n;
            deps[x].push(y);
            deps[y].push(x);

            match named(&deps).start_order() {
                Err(ComposeError::CyclicDependency { members }) => {
                    let (first, second) = (format!("svc{}", x), format!("svc{}", y));
                    prop_assert!(members.contains(&first));
                    prop_assert!(members.contains(&second));
                }
                other => prop_assert!(false, "expected a cycle, got {:?}", other),
            }
        }
    }
}
