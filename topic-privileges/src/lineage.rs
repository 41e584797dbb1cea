// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dependency graph of vertices through which privileges are inherited.
use std::collections::{BTreeMap, HashMap};

use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use thiserror::Error;
use tracing::debug;

use crate::aggregate::GrantAggregator;
use crate::coalesce::{InheritedPrivs, coalesce};
use crate::entity::Entity;
use crate::grant::Grant;
use crate::types::{GrantId, RelationId, VertexId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("vertex {0} is not part of the graph")]
    UnknownVertex(VertexId),

    #[error("relation {relation} from {parent} to {child} would introduce a cycle")]
    Cycle {
        parent: VertexId,
        child: VertexId,
        relation: RelationId,
    },
}

#[derive(Debug)]
struct LineageNode {
    id: VertexId,
    grants: BTreeMap<GrantId, Grant>,

    /// One aggregate per inbound relation, `None` for the view without any relation.
    aggregators: HashMap<Option<RelationId>, GrantAggregator>,

    entities: Vec<Entity>,
}

impl LineageNode {
    fn new(id: VertexId) -> Self {
        Self {
            id,
            grants: BTreeMap::new(),
            aggregators: HashMap::from([(None, GrantAggregator::new(None))]),
            entities: Vec::new(),
        }
    }

    fn aggregator(&self, relation: Option<&RelationId>) -> Option<&GrantAggregator> {
        self.aggregators.get(&relation.cloned())
    }
}

/// Vertices holding grants and entities, connected parent to child through inbound relations.
///
/// Privileges flow from parents to children. A vertex reachable through several parents has one
/// effective set of privileges per lineage, each computed by coalescing the vertex's own grants
/// (as seen through the relation of that lineage) with the parent's.
///
/// Nothing is cached between calls, privileges are always pulled from the current grants.
#[derive(Debug, Default)]
pub struct PrivilegeGraph {
    graph: DiGraph<LineageNode, RelationId>,
    index: HashMap<VertexId, NodeIndex>,
}

impl PrivilegeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex. Adding a known vertex does nothing.
    pub fn add_vertex(&mut self, id: VertexId) {
        if self.index.contains_key(&id) {
            return;
        }
        let node = self.graph.add_node(LineageNode::new(id.clone()));
        self.index.insert(id, node);
    }

    pub fn contains(&self, id: &VertexId) -> bool {
        self.index.contains_key(id)
    }

    fn node(&self, id: &VertexId) -> Result<NodeIndex, GraphError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownVertex(id.clone()))
    }

    /// Connect `child` to `parent` through an inbound relation of the child.
    pub fn add_edge(
        &mut self,
        parent: &VertexId,
        child: &VertexId,
        relation: RelationId,
    ) -> Result<(), GraphError> {
        let parent_node = self.node(parent)?;
        let child_node = self.node(child)?;

        if has_path_connecting(&self.graph, child_node, parent_node, None) {
            return Err(GraphError::Cycle {
                parent: parent.clone(),
                child: child.clone(),
                relation,
            });
        }

        let LineageNode {
            grants,
            aggregators,
            ..
        } = &mut self.graph[child_node];
        aggregators
            .entry(Some(relation.clone()))
            .or_insert_with(|| {
                GrantAggregator::from_grants(grants.values().cloned(), Some(relation.clone()))
            });

        self.graph.add_edge(parent_node, child_node, relation);
        Ok(())
    }

    /// Place a grant on a vertex. Archived grants are ignored.
    pub fn add_grant(&mut self, grant: Grant) -> Result<bool, GraphError> {
        let node = self.node(grant.vertex())?;
        if !grant.is_active() {
            debug!(grant = %grant.id(), "ignore archived grant");
            return Ok(false);
        }

        let node = &mut self.graph[node];
        if node.grants.contains_key(grant.id()) {
            return Ok(false);
        }

        for aggregator in node.aggregators.values_mut() {
            aggregator.insert(grant.clone());
        }
        node.grants.insert(grant.id().clone(), grant);
        Ok(true)
    }

    /// Take a grant off its vertex, usually after it was archived.
    pub fn remove_grant(&mut self, grant: &Grant) -> Result<bool, GraphError> {
        let node = self.node(grant.vertex())?;
        let node = &mut self.graph[node];

        if node.grants.remove(grant.id()).is_none() {
            return Ok(false);
        }

        for aggregator in node.aggregators.values_mut() {
            aggregator.remove(grant);
        }
        Ok(true)
    }

    /// Active grants placed on a vertex.
    pub fn grants(&self, vertex: &VertexId) -> Result<Vec<Grant>, GraphError> {
        let node = self.node(vertex)?;
        Ok(self.graph[node]
            .grants
            .values()
            .filter(|grant| grant.is_active())
            .cloned()
            .collect())
    }

    /// Attach a persisted entity to a vertex, its privileges follow the vertex's.
    ///
    /// The entity is not observed before its grants are loaded, see
    /// [`PrivilegeService::attach`](crate::PrivilegeService::attach).
    pub fn attach_entity(&mut self, vertex: &VertexId, entity: Entity) -> Result<(), GraphError> {
        let node = self.node(vertex)?;
        let entities = &mut self.graph[node].entities;
        if !entities.contains(&entity) {
            entities.push(entity);
        }
        Ok(())
    }

    /// Effective privileges at a vertex, one per lineage from a root.
    pub fn coalesced(&self, vertex: &VertexId) -> Result<Vec<InheritedPrivs>, GraphError> {
        let node = self.node(vertex)?;
        let mut memo = HashMap::new();
        Ok(self.coalesce_node(node, &mut memo))
    }

    fn coalesce_node(
        &self,
        node: NodeIndex,
        memo: &mut HashMap<NodeIndex, Vec<InheritedPrivs>>,
    ) -> Vec<InheritedPrivs> {
        if let Some(privs) = memo.get(&node) {
            return privs.clone();
        }

        let vertex = &self.graph[node];
        let mut parents = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .peekable();

        let privs = if parents.peek().is_none() {
            let own = vertex.aggregator(None);
            own.map(|own| vec![coalesce(own, &InheritedPrivs::default())])
                .unwrap_or_default()
        } else {
            let parents: Vec<(NodeIndex, RelationId)> = parents
                .map(|edge| (edge.source(), edge.weight().clone()))
                .collect();

            let mut privs = Vec::new();
            for (parent, relation) in parents {
                let Some(own) = vertex.aggregator(Some(&relation)) else {
                    continue;
                };
                for inherited in self.coalesce_node(parent, memo) {
                    privs.push(coalesce(own, &inherited));
                }
            }
            privs
        };

        memo.insert(node, privs.clone());
        privs
    }

    /// Privileges observed by every entity at `vertex` or below it, one entry per lineage and
    /// entity. Entities whose grants are not loaded yet are skipped.
    pub fn observations(
        &self,
        vertex: &VertexId,
    ) -> Result<Vec<(InheritedPrivs, Entity)>, GraphError> {
        let start = self.node(vertex)?;
        let mut memo = HashMap::new();
        let mut observations = Vec::new();

        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            let entities: Vec<&Entity> = self.graph[node]
                .entities
                .iter()
                .filter(|entity| {
                    let loaded = entity.privileges().is_loaded();
                    if !loaded {
                        debug!(entity = %entity.id(), "skip entity with unloaded grants");
                    }
                    loaded
                })
                .collect();
            if entities.is_empty() {
                continue;
            }

            for privs in self.coalesce_node(node, &mut memo) {
                for entity in &entities {
                    observations.push((privs.clone(), (*entity).clone()));
                }
            }
        }

        debug!(
            vertex = %self.graph[start].id,
            observations = observations.len(),
            "collect privilege observations"
        );
        Ok(observations)
    }
}
