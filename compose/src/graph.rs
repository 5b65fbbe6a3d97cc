//! Graph builds the dependency DAG over a composition's members and computes
//! the orderings every consumer relies on.
//!
//! Nodes are ids, never pointers; edges run from a ref-using member to the
//! member it references. Schema references and external targets produce no
//! edges.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use analysis::analyzer::collect_refs;

use crate::{Composition, Error, Result};

/// DependencyGraph is the DAG over member ids.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    /// deps[a] = the set of b with an edge a → b (a depends on b).
    deps: BTreeMap<String, BTreeSet<String>>,
    /// dependents[b] = the set of a with an edge a → b.
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build walks every member's document for references and records edges.
    pub fn build(composition: &Composition) -> Self {
        let known = composition.ids();
        let externals = composition.externals();
        let mut g = Self::default();
        for id in &known {
            g.nodes.insert(id.clone());
        }

        let mut add_edges = |from: &str, refs: Vec<api::reference::ResourceRef>| {
            for r in refs {
                let target = r.resource_id();
                if r.is_schema() {
                    continue;
                }
                if externals.contains(target) {
                    warn!(from, target, "reference to external resource produces no edge");
                    continue;
                }
                if !known.contains(target) {
                    warn!(from, target, "reference to undeclared resource; no edge");
                    continue;
                }
                g.deps
                    .entry(from.to_string())
                    .or_default()
                    .insert(target.to_string());
                g.dependents
                    .entry(target.to_string())
                    .or_default()
                    .insert(from.to_string());
            }
        };

        for r in composition.resources.iter().filter(|r| !r.is_external()) {
            add_edges(r.id(), collect_refs(r.template()));
        }
        for c in &composition.closures {
            add_edges(c.name(), c.refs().to_vec());
        }
        g
    }

    /// Nodes reports the node set.
    pub fn nodes(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    /// Dependencies_of reports what `id` depends on.
    pub fn dependencies_of(&self, id: &str) -> BTreeSet<String> {
        self.deps.get(id).cloned().unwrap_or_default()
    }

    /// Topo_order runs Kahn's algorithm with an id-lexicographic tie-break,
    /// so output is deterministic for identical graphs.
    pub fn topo_order(&self) -> Result<Vec<String>> {
        let mut remaining: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.deps.get(n).map_or(0, BTreeSet::len)))
            .collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(&n) = ready.iter().next() {
            ready.remove(n);
            remaining.remove(n);
            order.push(n.to_string());
            if let Some(users) = self.dependents.get(n) {
                for u in users {
                    if let Some(d) = remaining.get_mut(u.as_str()) {
                        *d = d.saturating_sub(1);
                        if *d == 0 {
                            ready.insert(u.as_str());
                        }
                    }
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(Error::CircularDependency {
                cycle: self.first_cycle(),
            });
        }
        Ok(order)
    }

    /// Levels partitions the nodes into waves whose dependencies are all in
    /// earlier waves; each wave is id-lexicographic.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let mut remaining: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.deps.get(n).map_or(0, BTreeSet::len)))
            .collect();
        let mut levels = Vec::new();
        let mut done = 0usize;
        while !remaining.is_empty() {
            let wave: Vec<&str> = remaining
                .iter()
                .filter(|&(_, &d)| d == 0)
                .map(|(&n, _)| n)
                .collect();
            if wave.is_empty() {
                return Err(Error::CircularDependency {
                    cycle: self.first_cycle(),
                });
            }
            for &n in &wave {
                remaining.remove(n);
                done = done.saturating_add(1);
                if let Some(users) = self.dependents.get(n) {
                    for u in users {
                        if let Some(d) = remaining.get_mut(u.as_str()) {
                            *d = d.saturating_sub(1);
                        }
                    }
                }
            }
            levels.push(wave.into_iter().map(String::from).collect());
        }
        debug_assert_eq!(done, self.nodes.len());
        Ok(levels)
    }

    /// Rollback_order is the reverse of the topological order.
    pub fn rollback_order(&self) -> Result<Vec<String>> {
        let mut order = self.topo_order()?;
        order.reverse();
        Ok(order)
    }

    /// Plan computes the level-parallel deployment plan.
    pub fn plan(&self) -> Result<DeploymentPlan> {
        Ok(DeploymentPlan {
            levels: self.levels()?,
        })
    }

    /// Cycles reports every strongly-connected component of size > 1, plus
    /// self-loops, as concrete id sequences.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        for scc in self.sccs() {
            if scc.len() > 1 {
                out.push(scc);
            } else if let [only] = scc.as_slice() {
                if self
                    .deps
                    .get(only)
                    .is_some_and(|d| d.contains(only.as_str()))
                {
                    out.push(scc);
                }
            }
        }
        out
    }

    fn first_cycle(&self) -> Vec<String> {
        self.cycles().into_iter().next().unwrap_or_default()
    }

    /// Sccs runs Tarjan's algorithm; components come out in a deterministic
    /// order because iteration is over sorted ids.
    fn sccs(&self) -> Vec<Vec<String>> {
        struct State<'g> {
            g: &'g DependencyGraph,
            index: usize,
            indices: BTreeMap<&'g str, usize>,
            lowlink: BTreeMap<&'g str, usize>,
            on_stack: BTreeSet<&'g str>,
            stack: Vec<&'g str>,
            out: Vec<Vec<String>>,
        }

        fn visit<'g>(s: &mut State<'g>, v: &'g str) {
            s.indices.insert(v, s.index);
            s.lowlink.insert(v, s.index);
            s.index = s.index.saturating_add(1);
            s.stack.push(v);
            s.on_stack.insert(v);

            let g = s.g;
            if let Some(deps) = g.deps.get(v) {
                for w in deps {
                    let w = w.as_str();
                    if !s.indices.contains_key(w) {
                        visit(s, w);
                        let wl = s.lowlink[w];
                        let vl = s.lowlink.get_mut(v).expect("visited");
                        *vl = (*vl).min(wl);
                    } else if s.on_stack.contains(w) {
                        let wi = s.indices[w];
                        let vl = s.lowlink.get_mut(v).expect("visited");
                        *vl = (*vl).min(wi);
                    }
                }
            }

            if s.lowlink[v] == s.indices[v] {
                let mut component = Vec::new();
                while let Some(w) = s.stack.pop() {
                    s.on_stack.remove(w);
                    component.push(w.to_string());
                    if w == v {
                        break;
                    }
                }
                component.sort();
                s.out.push(component);
            }
        }

        let mut s = State {
            g: self,
            index: 0,
            indices: BTreeMap::new(),
            lowlink: BTreeMap::new(),
            on_stack: BTreeSet::new(),
            stack: Vec::new(),
            out: Vec::new(),
        };
        for n in &self.nodes {
            if !s.indices.contains_key(n.as_str()) {
                visit(&mut s, n.as_str());
            }
        }
        s.out
    }
}

/// DeploymentPlan is the level-parallel execution plan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeploymentPlan {
    /// Levels of member ids; level `i` only depends on levels `< i`.
    pub levels: Vec<Vec<String>>,
}

impl DeploymentPlan {
    /// Max_parallelism is the widest level.
    pub fn max_parallelism(&self) -> usize {
        self.levels.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Flatten concatenates the levels into one order.
    pub fn flatten(&self) -> Vec<String> {
        self.levels.iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::{resource::Resource, schema::SchemaDefinition};
    use serde_json::{Value, json};

    fn tagged(id: &str, path: &str) -> Value {
        json!({"$kroRef": {"resourceId": id, "fieldPath": path}})
    }

    fn res(id: &str, refs: &[(&str, &str)]) -> Resource {
        let mut env = serde_json::Map::new();
        for (i, (target, path)) in refs.iter().enumerate() {
            env.insert(format!("r{i}"), tagged(target, path));
        }
        Resource::with_id(
            id,
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": id},
                "data": Value::Object(env),
            }),
        )
        .unwrap()
    }

    fn comp(resources: Vec<Resource>) -> Composition {
        Composition {
            name: "t".into(),
            schema: SchemaDefinition::new("x.dev", "X"),
            resources,
            closures: Vec::new(),
            status: Value::Null,
        }
    }

    #[test]
    fn chain_produces_single_file_levels() {
        let c = comp(vec![
            res("db", &[]),
            res("dbSvc", &[("db", "status.x")]),
            res("app", &[("dbSvc", "status.x")]),
            res("appSvc", &[("app", "status.x")]),
            res("ingress", &[("appSvc", "status.x")]),
        ]);
        let plan = c.plan().unwrap();
        assert_eq!(
            plan.levels,
            vec![
                vec!["db".to_string()],
                vec!["dbSvc".to_string()],
                vec!["app".to_string()],
                vec!["appSvc".to_string()],
                vec!["ingress".to_string()],
            ],
        );
        assert_eq!(plan.max_parallelism(), 1);
        let g = c.graph();
        assert_eq!(g.topo_order().unwrap(), plan.flatten());
        assert_eq!(
            g.rollback_order().unwrap(),
            vec!["ingress", "appSvc", "app", "dbSvc", "db"],
        );
    }

    #[test]
    fn two_cycle_is_reported_with_both_ids() {
        let c = comp(vec![
            res("a", &[("b", "status.x")]),
            res("b", &[("a", "status.y")]),
        ]);
        let err = c.plan().unwrap_err();
        match err {
            Error::CircularDependency { cycle } => {
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(c.graph().topo_order().unwrap_err().kind(), "CircularDependencyError");
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let c = comp(vec![res("a", &[("a", "status.x")])]);
        assert_eq!(c.graph().cycles(), vec![vec!["a".to_string()]]);
    }

    #[test]
    fn ties_break_lexicographically() {
        let c = comp(vec![
            res("zeta", &[]),
            res("alpha", &[]),
            res("mid", &[("alpha", "status.x"), ("zeta", "status.x")]),
        ]);
        let plan = c.plan().unwrap();
        assert_eq!(
            plan.levels,
            vec![
                vec!["alpha".to_string(), "zeta".to_string()],
                vec!["mid".to_string()],
            ],
        );
        assert_eq!(plan.max_parallelism(), 2);
        assert_eq!(c.graph().topo_order().unwrap(), vec!["alpha", "zeta", "mid"]);
    }

    #[test]
    fn external_targets_produce_no_edges() {
        let ext = Resource::with_id(
            "shared",
            json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "shared"}}),
        )
        .unwrap()
        .external();
        let c = comp(vec![ext, res("app", &[("shared", "data.token")])]);
        let plan = c.plan().unwrap();
        assert_eq!(plan.levels, vec![vec!["app".to_string()]]);
    }
}
