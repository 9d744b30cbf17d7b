use std::collections::{BTreeMap, BTreeSet};

/// A small dependency sorter used for flows/groups/nodes load ordering and
/// env-to-env references. Cycles do not fail the sort; every vertex is
/// emitted, cycle members in registration order.
#[derive(Clone, Default)]
pub struct TopologicalSorter<N: Clone + Eq + Ord> {
    vertices: Vec<N>,
    deps: BTreeMap<N, BTreeSet<N>>,
}

impl<N: Eq + Ord + Clone> TopologicalSorter<N> {
    pub fn new() -> Self {
        TopologicalSorter { vertices: Vec::new(), deps: BTreeMap::new() }
    }

    pub fn add_vertex(&mut self, item: N) {
        if !self.vertices.contains(&item) {
            self.vertices.push(item);
        }
    }

    pub fn add_dep(&mut self, from: N, to: N) {
        self.add_vertex(from.clone());
        if from != to {
            self.deps.entry(from).or_default().insert(to);
        }
    }

    pub fn add_deps(&mut self, from: N, tos: impl IntoIterator<Item = N>) {
        for to in tos {
            self.add_dep(from.clone(), to);
        }
    }

    /// Dependencies first; dependents after everything they depend on.
    pub fn dependency_sort(&self) -> Vec<N> {
        let mut emitted: BTreeSet<N> = BTreeSet::new();
        let mut result = Vec::with_capacity(self.vertices.len());
        let mut remaining: Vec<N> = self.vertices.clone();

        while !remaining.is_empty() {
            let mut progressed = false;
            let mut next_remaining = Vec::with_capacity(remaining.len());
            for v in remaining.iter() {
                let ready = match self.deps.get(v) {
                    Some(dep_set) => {
                        dep_set.iter().all(|d| emitted.contains(d) || !self.vertices.contains(d))
                    }
                    None => true,
                };
                if ready {
                    emitted.insert(v.clone());
                    result.push(v.clone());
                    progressed = true;
                } else {
                    next_remaining.push(v.clone());
                }
            }
            remaining = next_remaining;
            if !progressed && !remaining.is_empty() {
                // Cycle: force the first remaining vertex out to keep going.
                let v = remaining.remove(0);
                emitted.insert(v.clone());
                result.push(v);
            }
        }
        result
    }

    /// Dependents first. The reverse of [`dependency_sort`](Self::dependency_sort).
    pub fn topological_sort(&self) -> Vec<N> {
        let mut result = self.dependency_sort();
        result.reverse();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_linear_dependency() {
        let mut graph = TopologicalSorter::new();
        graph.add_dep("A", "B");
        graph.add_dep("B", "C");

        let sorted = graph.topological_sort();
        assert_eq!(sorted, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_multiple_sources() {
        let mut graph = TopologicalSorter::new();
        graph.add_dep("A", "C");
        graph.add_dep("B", "C");

        let sorted = graph.topological_sort();
        assert!(sorted == vec!["A", "B", "C"] || sorted == vec!["B", "A", "C"]);
    }

    #[test]
    fn test_complex_dependency() {
        let mut graph = TopologicalSorter::new();
        graph.add_deps("A", ["B", "C"]);
        graph.add_dep("B", "D");
        graph.add_dep("C", "D");
        graph.add_dep("D", "E");

        let sorted = graph.topological_sort();
        let pos = |x: &str| sorted.iter().position(|v| *v == x).unwrap();
        assert_eq!(sorted.len(), 5);
        assert!(pos("A") < pos("B"));
        assert!(pos("A") < pos("C"));
        assert!(pos("B") < pos("D"));
        assert!(pos("C") < pos("D"));
        assert!(pos("D") < pos("E"));
    }

    #[test]
    fn test_dependency_sort_puts_dependencies_first() {
        let mut graph = TopologicalSorter::new();
        graph.add_dep("A", "B");
        graph.add_dep("B", "C");

        let sorted = graph.dependency_sort();
        assert_eq!(sorted, vec!["C", "B", "A"]);
    }

    #[test]
    fn test_cycle_processing() {
        let mut graph = TopologicalSorter::new();
        graph.add_dep("A", "B");
        graph.add_dep("B", "C");
        graph.add_dep("C", "A");

        let sorted = graph.dependency_sort();
        assert_eq!(sorted.len(), 3);
        assert!(sorted.contains(&"A"));
        assert!(sorted.contains(&"B"));
        assert!(sorted.contains(&"C"));
    }

    #[test]
    fn test_missing_dependency_is_ignored() {
        let mut graph = TopologicalSorter::new();
        graph.add_vertex("A");
        graph.add_dep("A", "GHOST");

        let sorted = graph.dependency_sort();
        assert_eq!(sorted, vec!["A"]);
    }

    #[test]
    fn test_self_dependency() {
        let mut graph = TopologicalSorter::new();
        graph.add_dep("A", "A");
        let sorted = graph.topological_sort();
        assert_eq!(sorted, &["A"]);
    }
}
