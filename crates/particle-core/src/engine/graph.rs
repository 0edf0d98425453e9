use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::io;

use crate::core::attributes::AttributeStore;
use crate::core::check::InvariantViolation;
use crate::core::ids::{ContainerId, ParticleIndex, RestraintId, ScoreStateId};

use super::objects::Dependency;

/// A vertex of the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphNode {
    ScoreState(ScoreStateId),
    Restraint(RestraintId),
    Particle(ParticleIndex),
    Container(ContainerId),
}

/// The declared dependencies of one object, gathered before the graph is built.
#[derive(Debug, Clone)]
pub(crate) struct Declaration {
    pub node: GraphNode,
    pub name: String,
    pub inputs: Vec<Dependency>,
    pub outputs: Vec<Dependency>,
}

/// Directed graph of data flow between score states, restraints, particles and containers.
///
/// An edge `a -> b` means `b` reads something `a` produces. Vertex indices follow insertion
/// order, which is what makes the topological order stable.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    labels: Vec<String>,
    index: HashMap<GraphNode, usize>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
    edges: HashSet<(usize, usize)>,
}

impl DependencyGraph {
    /// Builds the graph from the declarations of the active score states and restraints.
    ///
    /// Score state inputs are wired first, then score state outputs, then restraint inputs.
    /// An output edge is skipped when the reverse edge already exists, so an object that reads
    /// and writes the same particle does not depend on itself.
    ///
    /// # Arguments
    ///
    /// * `score_states` - Declarations of the active score states, in insertion order
    /// * `restraints` - Declarations of the active restraints, in scoring order
    /// * `ordering` - Extra `(before, after)` edges between score states
    /// * `store` - Used to label particles and expand containers into their members
    pub(crate) fn build(
        score_states: &[Declaration],
        restraints: &[Declaration],
        ordering: &[(ScoreStateId, ScoreStateId)],
        store: &AttributeStore,
    ) -> Self {
        let mut graph = Self::default();
        for declaration in score_states.iter().chain(restraints) {
            graph.add_node(declaration.node, declaration.name.clone());
        }

        for declaration in score_states {
            let object = graph.index[&declaration.node];
            for dependency in &declaration.inputs {
                let data = graph.data_node(dependency, store);
                graph.add_edge(data, object);
            }
        }
        for declaration in score_states {
            let object = graph.index[&declaration.node];
            for dependency in &declaration.outputs {
                let data = graph.data_node(dependency, store);
                if !graph.edges.contains(&(data, object)) {
                    graph.add_edge(object, data);
                }
            }
        }
        for declaration in restraints {
            let object = graph.index[&declaration.node];
            for dependency in &declaration.inputs {
                let data = graph.data_node(dependency, store);
                graph.add_edge(data, object);
            }
        }

        for &(before, after) in ordering {
            let from = graph.index.get(&GraphNode::ScoreState(before)).copied();
            let to = graph.index.get(&GraphNode::ScoreState(after)).copied();
            if let (Some(from), Some(to)) = (from, to) {
                graph.add_edge(from, to);
            }
        }
        graph
    }

    fn add_node(&mut self, node: GraphNode, label: String) -> usize {
        if let Some(&existing) = self.index.get(&node) {
            return existing;
        }
        let vertex = self.nodes.len();
        self.nodes.push(node);
        self.labels.push(label);
        self.successors.push(Vec::new());
        self.predecessors.push(Vec::new());
        self.index.insert(node, vertex);
        vertex
    }

    fn add_edge(&mut self, from: usize, to: usize) {
        if self.edges.insert((from, to)) {
            self.successors[from].push(to);
            self.predecessors[to].push(from);
        }
    }

    /// The vertex standing for a data dependency, created on first sight.
    ///
    /// A container vertex is fed by its member particles.
    fn data_node(&mut self, dependency: &Dependency, store: &AttributeStore) -> usize {
        match *dependency {
            Dependency::Particle(particle) | Dependency::Attribute { particle, .. } => {
                self.particle_node(particle, store)
            }
            Dependency::Container(container) => {
                let node = GraphNode::Container(container);
                if let Some(&existing) = self.index.get(&node) {
                    return existing;
                }
                let (label, members) = match store.container(container) {
                    Ok(c) => (format!("container '{}'", c.name), c.particles.clone()),
                    Err(_) => (format!("missing container {container:?}"), Vec::new()),
                };
                let vertex = self.add_node(node, label);
                for member in members {
                    let particle = self.particle_node(member, store);
                    self.add_edge(particle, vertex);
                }
                vertex
            }
        }
    }

    fn particle_node(&mut self, particle: ParticleIndex, store: &AttributeStore) -> usize {
        let node = GraphNode::Particle(particle);
        if let Some(&existing) = self.index.get(&node) {
            return existing;
        }
        let label = match store.particle_name(particle) {
            Ok(name) => format!("particle '{name}'"),
            Err(_) => format!("removed particle {particle:?}"),
        };
        self.add_node(node, label)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn label(&self, node: GraphNode) -> Option<&str> {
        self.index.get(&node).map(|&v| self.labels[v].as_str())
    }

    pub fn has_edge(&self, from: GraphNode, to: GraphNode) -> bool {
        match (self.index.get(&from), self.index.get(&to)) {
            (Some(&from), Some(&to)) => self.edges.contains(&(from, to)),
            _ => false,
        }
    }

    pub fn number_of_edges(&self) -> usize {
        self.edges.len()
    }

    /// All vertices such that every edge points forward; ties go to the earliest inserted.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation::DependencyCycle`] naming the vertices of one cycle.
    pub fn topological_order(&self) -> Result<Vec<GraphNode>, InvariantViolation> {
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(vertex, _)| Reverse(vertex))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(vertex)) = ready.pop() {
            order.push(vertex);
            for &next in &self.successors[vertex] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() < self.nodes.len() {
            let mut sorted = vec![false; self.nodes.len()];
            for &vertex in &order {
                sorted[vertex] = true;
            }
            let objects = self
                .find_cycle(&sorted)
                .into_iter()
                .map(|vertex| self.labels[vertex].clone())
                .collect();
            return Err(InvariantViolation::DependencyCycle { objects });
        }
        Ok(order.into_iter().map(|vertex| self.nodes[vertex]).collect())
    }

    /// Walks unsorted predecessors from an unsorted vertex until one repeats.
    ///
    /// Every vertex left over by Kahn's algorithm has an unsorted predecessor, so the walk
    /// always closes a loop. The result lists the loop in edge direction, first vertex
    /// repeated at the end.
    fn find_cycle(&self, sorted: &[bool]) -> Vec<usize> {
        let Some(start) = sorted.iter().position(|done| !done) else {
            return Vec::new();
        };
        let mut position = vec![usize::MAX; self.nodes.len()];
        let mut path = Vec::new();
        let mut vertex = start;
        while position[vertex] == usize::MAX {
            position[vertex] = path.len();
            path.push(vertex);
            match self.predecessors[vertex].iter().find(|&&p| !sorted[p]) {
                Some(&previous) => vertex = previous,
                None => return path,
            }
        }
        let mut cycle = path.split_off(position[vertex]);
        cycle.reverse();
        cycle.push(cycle[0]);
        cycle
    }

    /// Score states in evaluation order.
    pub fn score_state_order(&self) -> Result<Vec<ScoreStateId>, InvariantViolation> {
        Ok(self
            .topological_order()?
            .into_iter()
            .filter_map(|node| match node {
                GraphNode::ScoreState(id) => Some(id),
                _ => None,
            })
            .collect())
    }

    /// Score states that `node` transitively depends on.
    pub fn upstream_score_states(&self, node: GraphNode) -> HashSet<ScoreStateId> {
        self.reachable(node, &self.predecessors, &HashSet::new())
            .into_iter()
            .filter_map(|node| match node {
                GraphNode::ScoreState(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Particles whose values are derived, directly or not, from `particle`.
    ///
    /// Traversal stops at any vertex in `blockers`.
    pub fn dependent_particles(
        &self,
        particle: ParticleIndex,
        blockers: &HashSet<GraphNode>,
    ) -> Vec<ParticleIndex> {
        self.reachable(GraphNode::Particle(particle), &self.successors, blockers)
            .into_iter()
            .filter_map(|node| match node {
                GraphNode::Particle(p) if p != particle => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Restraints whose score depends on `particle`, in discovery order.
    pub fn dependent_restraints(
        &self,
        particle: ParticleIndex,
        blockers: &HashSet<GraphNode>,
    ) -> Vec<RestraintId> {
        self.reachable(GraphNode::Particle(particle), &self.successors, blockers)
            .into_iter()
            .filter_map(|node| match node {
                GraphNode::Restraint(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Score states that must run when `particle` changes.
    pub fn dependent_score_states(
        &self,
        particle: ParticleIndex,
        blockers: &HashSet<GraphNode>,
    ) -> Vec<ScoreStateId> {
        self.reachable(GraphNode::Particle(particle), &self.successors, blockers)
            .into_iter()
            .filter_map(|node| match node {
                GraphNode::ScoreState(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn reachable(
        &self,
        start: GraphNode,
        adjacency: &[Vec<usize>],
        blockers: &HashSet<GraphNode>,
    ) -> Vec<GraphNode> {
        let Some(&start) = self.index.get(&start) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([start]);
        let mut found = Vec::new();
        seen[start] = true;
        while let Some(vertex) = queue.pop_front() {
            for &next in &adjacency[vertex] {
                if seen[next] {
                    continue;
                }
                seen[next] = true;
                found.push(self.nodes[next]);
                if !blockers.contains(&self.nodes[next]) {
                    queue.push_back(next);
                }
            }
        }
        found
    }

    /// Renders the graph in Graphviz DOT format.
    pub fn to_graphviz(&self) -> String {
        let mut dot = String::from("digraph dependencies {\n");
        for (vertex, node) in self.nodes.iter().enumerate() {
            let shape = match node {
                GraphNode::ScoreState(_) => "box",
                GraphNode::Restraint(_) => "ellipse",
                GraphNode::Particle(_) => "plaintext",
                GraphNode::Container(_) => "folder",
            };
            let label = self.labels[vertex].replace('"', "\\\"");
            let _ = writeln!(dot, "  n{vertex} [label=\"{label}\", shape={shape}];");
        }
        for (from, successors) in self.successors.iter().enumerate() {
            for to in successors {
                let _ = writeln!(dot, "  n{from} -> n{to};");
            }
        }
        dot.push_str("}\n");
        dot
    }

    pub fn write_graphviz<W: io::Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(self.to_graphviz().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    struct Fixture {
        store: AttributeStore,
        particles: Vec<ParticleIndex>,
        states: SlotMap<ScoreStateId, ()>,
        restraints: SlotMap<RestraintId, ()>,
    }

    impl Fixture {
        fn new(n: usize) -> Self {
            let mut store = AttributeStore::new();
            let particles = (0..n).map(|i| store.add_particle(format!("p{i}"))).collect();
            Self {
                store,
                particles,
                states: SlotMap::with_key(),
                restraints: SlotMap::with_key(),
            }
        }

        fn state(&mut self, name: &str, inputs: &[usize], outputs: &[usize]) -> Declaration {
            Declaration {
                node: GraphNode::ScoreState(self.states.insert(())),
                name: name.to_string(),
                inputs: inputs.iter().map(|&i| self.particles[i].into()).collect(),
                outputs: outputs.iter().map(|&i| self.particles[i].into()).collect(),
            }
        }

        fn restraint(&mut self, name: &str, inputs: &[usize]) -> Declaration {
            Declaration {
                node: GraphNode::Restraint(self.restraints.insert(())),
                name: name.to_string(),
                inputs: inputs.iter().map(|&i| self.particles[i].into()).collect(),
                outputs: Vec::new(),
            }
        }
    }

    fn state_id(declaration: &Declaration) -> ScoreStateId {
        match declaration.node {
            GraphNode::ScoreState(id) => id,
            _ => unreachable!(),
        }
    }

    #[test]
    fn producer_is_ordered_before_consumer_regardless_of_insertion() {
        let mut f = Fixture::new(3);
        let consumer = f.state("consumer", &[1], &[2]);
        let producer = f.state("producer", &[0], &[1]);
        let graph = DependencyGraph::build(&[consumer.clone(), producer.clone()], &[], &[], &f.store);

        assert_eq!(
            graph.score_state_order().unwrap(),
            vec![state_id(&producer), state_id(&consumer)]
        );
    }

    #[test]
    fn independent_states_keep_insertion_order() {
        let mut f = Fixture::new(4);
        let a = f.state("a", &[0], &[1]);
        let b = f.state("b", &[2], &[3]);
        let graph = DependencyGraph::build(&[a.clone(), b.clone()], &[], &[], &f.store);
        assert_eq!(graph.score_state_order().unwrap(), vec![state_id(&a), state_id(&b)]);
    }

    #[test]
    fn every_edge_points_forward_in_the_order() {
        let mut f = Fixture::new(6);
        let states = vec![
            f.state("s3", &[3], &[4]),
            f.state("s1", &[0], &[1]),
            f.state("s2", &[1], &[2, 3]),
            f.state("s4", &[4, 2], &[5]),
        ];
        let restraints = vec![f.restraint("r", &[5, 0])];
        let graph = DependencyGraph::build(&states, &restraints, &[], &f.store);
        let order = graph.topological_order().unwrap();
        let position: HashMap<GraphNode, usize> =
            order.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        for &from in graph.nodes() {
            for &to in graph.nodes() {
                if graph.has_edge(from, to) {
                    assert!(position[&from] < position[&to], "{from:?} -> {to:?}");
                }
            }
        }
    }

    #[test]
    fn reading_and_writing_the_same_particle_is_not_a_cycle() {
        let mut f = Fixture::new(1);
        let state = f.state("in_place", &[0], &[0]);
        let graph = DependencyGraph::build(&[state.clone()], &[], &[], &f.store);
        assert_eq!(graph.score_state_order().unwrap(), vec![state_id(&state)]);
        assert!(!graph.has_edge(state.node, GraphNode::Particle(f.particles[0])));
    }

    #[test]
    fn genuine_cycle_is_reported_with_its_members() {
        let mut f = Fixture::new(2);
        let a = f.state("a", &[0], &[1]);
        let b = f.state("b", &[1], &[0]);
        let graph = DependencyGraph::build(&[a, b], &[], &[], &f.store);

        let InvariantViolation::DependencyCycle { objects } = graph.topological_order().unwrap_err()
        else {
            panic!("expected a dependency cycle");
        };
        assert_eq!(objects.first(), objects.last());
        assert!(objects.contains(&"a".to_string()));
        assert!(objects.contains(&"b".to_string()));
        assert_eq!(objects.len(), 5);
    }

    #[test]
    fn ordering_constraints_add_edges() {
        let mut f = Fixture::new(2);
        let a = f.state("a", &[0], &[]);
        let b = f.state("b", &[1], &[]);
        let graph = DependencyGraph::build(
            &[a.clone(), b.clone()],
            &[],
            &[(state_id(&b), state_id(&a))],
            &f.store,
        );
        assert_eq!(graph.score_state_order().unwrap(), vec![state_id(&b), state_id(&a)]);
    }

    #[test]
    fn containers_are_fed_by_their_members() {
        let mut f = Fixture::new(3);
        let members = vec![f.particles[1], f.particles[2]];
        let container = f.store.add_container("pair".into(), members).unwrap();
        let writer = f.state("writer", &[0], &[1]);
        let reader = Declaration {
            node: GraphNode::Restraint(f.restraints.insert(())),
            name: "reader".into(),
            inputs: vec![container.into()],
            outputs: Vec::new(),
        };
        let graph = DependencyGraph::build(&[writer.clone()], &[reader.clone()], &[], &f.store);

        assert!(graph.has_edge(GraphNode::Particle(f.particles[1]), GraphNode::Container(container)));
        assert_eq!(
            graph.upstream_score_states(reader.node),
            HashSet::from([state_id(&writer)])
        );
    }

    #[test]
    fn dependency_queries_follow_data_flow() {
        let mut f = Fixture::new(3);
        let state = f.state("s", &[0], &[1]);
        let near = f.restraint("near", &[1]);
        let far = f.restraint("far", &[2]);
        let graph = DependencyGraph::build(&[state.clone()], &[near.clone(), far], &[], &f.store);

        let none = HashSet::new();
        assert_eq!(graph.dependent_particles(f.particles[0], &none), vec![f.particles[1]]);
        let restraints = graph.dependent_restraints(f.particles[0], &none);
        assert_eq!(restraints.len(), 1);
        assert_eq!(GraphNode::Restraint(restraints[0]), near.node);
        assert_eq!(
            graph.dependent_score_states(f.particles[0], &none),
            vec![state_id(&state)]
        );

        let blocked = HashSet::from([state.node]);
        assert!(graph.dependent_restraints(f.particles[0], &blocked).is_empty());
    }

    #[test]
    fn graphviz_output_lists_nodes_and_edges() {
        let mut f = Fixture::new(2);
        let state = f.state("s \"quoted\"", &[0], &[1]);
        let graph = DependencyGraph::build(&[state], &[], &[], &f.store);
        let dot = graph.to_graphviz();
        assert!(dot.starts_with("digraph dependencies {"));
        assert!(dot.contains("label=\"s \\\"quoted\\\"\", shape=box"));
        assert!(dot.contains("n1 -> n0;"));
        assert!(dot.contains("n0 -> n2;"));

        let mut buffer = Vec::new();
        graph.write_graphviz(&mut buffer).unwrap();
        assert_eq!(String::from_utf8(buffer).unwrap(), dot);
    }
}
