//! Package dependency graph for the llgo build.
//!
//! Provides [`PkgGraph`] plus [`dependency_order`], the leaf-first
//! topological sort that fixes the order packages are lowered in.

use std::collections::VecDeque;
use std::fmt;

use rustc_hash::FxHashMap;

/// A unique identifier for a package within one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PkgId(pub u32);

/// Metadata about a single package in the dependency graph.
#[derive(Debug)]
pub struct PkgNode {
    pub id: PkgId,
    /// Import path, e.g. `"llgo/runtime"` or `"main"`.
    pub path: String,
    /// Packages this package imports.
    pub deps: Vec<PkgId>,
    /// Whether this is one of the packages named on the command line.
    pub is_initial: bool,
}

/// Error returned when the import graph contains a cycle.
#[derive(Debug, Clone)]
pub struct CycleError {
    /// Import paths forming the cycle, ending with the repeated path.
    pub cycle: Vec<String>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "import cycle not allowed: {}", self.cycle.join(" -> "))
    }
}

/// A directed graph of packages and their imports.
///
/// Packages are stored in insertion order and identified by [`PkgId`];
/// path lookup goes through an internal map.
#[derive(Debug, Default)]
pub struct PkgGraph {
    pub nodes: Vec<PkgNode>,
    path_to_id: FxHashMap<String, PkgId>,
}

impl PkgGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a package and return its id. Adding the same path twice returns
    /// the existing id.
    pub fn add_package(&mut self, path: impl Into<String>, is_initial: bool) -> PkgId {
        let path = path.into();
        if let Some(&id) = self.path_to_id.get(&path) {
            if is_initial {
                self.nodes[id.0 as usize].is_initial = true;
            }
            return id;
        }
        let id = PkgId(self.nodes.len() as u32);
        self.path_to_id.insert(path.clone(), id);
        self.nodes.push(PkgNode {
            id,
            path,
            deps: Vec::new(),
            is_initial,
        });
        id
    }

    pub fn resolve(&self, path: &str) -> Option<PkgId> {
        self.path_to_id.get(path).copied()
    }

    /// Record that `from` imports `to`. Self and duplicate edges are
    /// ignored.
    pub fn add_import(&mut self, from: PkgId, to: PkgId) {
        if from == to {
            return;
        }
        let deps = &mut self.nodes[from.0 as usize].deps;
        if !deps.contains(&to) {
            deps.push(to);
        }
    }

    pub fn get(&self, id: PkgId) -> &PkgNode {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Leaf-first topological order over the import graph (Kahn's algorithm).
///
/// Packages with no imports come first; the `main` package comes last.
/// Ties are broken by import path so the order is fully deterministic.
pub fn dependency_order(graph: &PkgGraph) -> Result<Vec<PkgId>, CycleError> {
    let n = graph.nodes.len();
    let mut remaining: Vec<u32> = graph.nodes.iter().map(|p| p.deps.len() as u32).collect();

    let mut ready: Vec<PkgId> = (0..n)
        .filter(|&i| remaining[i] == 0)
        .map(|i| PkgId(i as u32))
        .collect();
    ready.sort_by(|a, b| graph.get(*a).path.cmp(&graph.get(*b).path));

    let mut queue = VecDeque::from(ready);
    let mut order = Vec::with_capacity(n);

    while let Some(id) = queue.pop_front() {
        order.push(id);
        let mut newly_ready = Vec::new();
        for (i, node) in graph.nodes.iter().enumerate() {
            if remaining[i] > 0 && node.deps.contains(&id) {
                remaining[i] -= 1;
                if remaining[i] == 0 {
                    newly_ready.push(PkgId(i as u32));
                }
            }
        }
        newly_ready.sort_by(|a, b| graph.get(*a).path.cmp(&graph.get(*b).path));
        queue.extend(newly_ready);
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err(CycleError {
            cycle: extract_cycle(graph, &remaining),
        })
    }
}

/// Walk unprocessed nodes (remaining > 0) along import edges until one
/// repeats, yielding the offending cycle path.
fn extract_cycle(graph: &PkgGraph, remaining: &[u32]) -> Vec<String> {
    let start = match (0..graph.nodes.len()).find(|&i| remaining[i] > 0) {
        Some(i) => i,
        None => return Vec::new(),
    };

    let mut path: Vec<String> = Vec::new();
    let mut visited = vec![false; graph.nodes.len()];
    let mut current = start;

    loop {
        if visited[current] {
            let repeat = &graph.nodes[current].path;
            let begin = path.iter().position(|p| p == repeat).unwrap_or(0);
            let mut cycle = path[begin..].to_vec();
            cycle.push(repeat.clone());
            return cycle;
        }
        visited[current] = true;
        path.push(graph.nodes[current].path.clone());

        match graph.nodes[current]
            .deps
            .iter()
            .find(|dep| remaining[dep.0 as usize] > 0)
        {
            Some(dep) => current = dep.0 as usize,
            None => return path,
        }
    }
}
