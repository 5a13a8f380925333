//! Architecture graph synthesis.
//!
//! A fresh graph is synthesized from the domain configuration, merged into
//! whatever the user last saved, annotated with requirement links and laid
//! out. Nothing is persisted unless every step succeeds.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::layout;
use crate::{
    ArchitectureBlock, ArchitectureGraph, CrossEdge, DomainConfig, DomainStore, GraphStore, RequirementRef,
    RequirementStore, StoreError,
};

pub const ROOT_BLOCK_ID: &str = "BLK-SYSTEM";
pub const ROOT_BLOCK_NAME: &str = "System";

pub fn block_id(domain_id: &str) -> String {
    format!("BLK-{}", domain_id)
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StructuralError {
    #[error("root block '{0}' is missing from the graph")]
    MissingRoot(String),

    #[error("structural cycle through block '{0}'")]
    Cycle(String),

    #[error("block '{block}' has more than one parent ('{first}', '{second}')")]
    MultipleParents {
        block: String,
        first: String,
        second: String,
    },

    #[error("root block '{root}' is listed as a child of '{parent}'")]
    RootHasParent { root: String, parent: String },

    #[error("block '{parent}' lists unknown child '{child}'")]
    UnknownChild { parent: String, child: String },
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Structural(#[from] StructuralError),
}

/// One root block plus one block per domain; children mirror subdomains.
pub fn synthesize(domains: &[DomainConfig]) -> ArchitectureGraph {
    let known: HashSet<&str> = domains.iter().map(|d| d.id.as_str()).collect();
    let mut root = ArchitectureBlock::new(ROOT_BLOCK_ID, ROOT_BLOCK_NAME);
    let mut blocks = BTreeMap::new();
    let mut claimed: HashMap<&str, &str> = HashMap::new();

    for domain in domains {
        let mut block = ArchitectureBlock::new(block_id(&domain.id), domain.name.clone());
        block.domain = Some(domain.id.clone());
        block.description = domain.description.clone();
        for sub in &domain.subdomain_ids {
            if !known.contains(sub.as_str()) {
                warn!("domain '{}' lists unknown subdomain '{}'", domain.id, sub);
                continue;
            }
            if let Some(owner) = claimed.get(sub.as_str()) {
                if *owner != domain.id {
                    warn!(
                        "subdomain '{}' already belongs to '{}', ignoring claim by '{}'",
                        sub, owner, domain.id
                    );
                }
                continue;
            }
            claimed.insert(sub.as_str(), domain.id.as_str());
            block.children.push(block_id(sub));
        }
        blocks.insert(block.id.clone(), block);
    }

    for domain in domains {
        if !claimed.contains_key(domain.id.as_str()) {
            root.children.push(block_id(&domain.id));
        }
    }
    blocks.insert(root.id.clone(), root);

    ArchitectureGraph {
        root_id: ROOT_BLOCK_ID.to_string(),
        blocks,
        cross_edges: Vec::new(),
        layout: BTreeMap::new(),
    }
}

/// Fold a freshly synthesized graph into the previously persisted one.
///
/// Blocks that still exist keep their persisted name, description and
/// position. User-added blocks (no domain) survive; domain blocks whose
/// domain is gone are dropped. Structural edges are the union of both
/// graphs, with the persisted parent taking precedence when a child was
/// moved. Blocks left without a parent are attached to the root.
pub fn merge(fresh: ArchitectureGraph, persisted: Option<&ArchitectureGraph>) -> ArchitectureGraph {
    let Some(persisted) = persisted else {
        return fresh;
    };

    let root_id = fresh.root_id.clone();
    let mut blocks = fresh.blocks.clone();

    for (id, old) in &persisted.blocks {
        match blocks.get_mut(id) {
            Some(block) => {
                block.name = old.name.clone();
                block.description = old.description.clone();
                block.position = old.position.clone();
            }
            None if old.domain.is_none() && *id != persisted.root_id => {
                let mut kept = old.clone();
                kept.children.clear();
                blocks.insert(id.clone(), kept);
            }
            None => debug!("dropping stale block {}", id),
        }
    }

    // Who owns each child: persisted parent first, then the fresh one.
    let mut owner: HashMap<String, String> = HashMap::new();
    for (parent, block) in persisted.blocks.iter().filter(|(id, _)| blocks.contains_key(*id)) {
        let parent = if *parent == persisted.root_id { &root_id } else { parent };
        for child in &block.children {
            if blocks.contains_key(child) && *child != root_id {
                owner.entry(child.clone()).or_insert_with(|| parent.clone());
            }
        }
    }
    for (parent, block) in &fresh.blocks {
        for child in &block.children {
            owner.entry(child.clone()).or_insert_with(|| parent.clone());
        }
    }

    let ids: Vec<String> = blocks.keys().cloned().collect();
    for id in &ids {
        let persisted_id = if *id == root_id { &persisted.root_id } else { id };
        let old_children = persisted.blocks.get(persisted_id).map(|b| b.children.as_slice()).unwrap_or(&[]);
        let new_children = fresh.blocks.get(id).map(|b| b.children.as_slice()).unwrap_or(&[]);

        let mut children: Vec<String> = Vec::new();
        for child in old_children.iter().chain(new_children) {
            if child != id
                && blocks.contains_key(child)
                && owner.get(child) == Some(id)
                && !children.contains(child)
            {
                children.push(child.clone());
            }
        }
        if let Some(block) = blocks.get_mut(id) {
            block.children = children;
        }
    }

    let parented: HashSet<String> = blocks.values().flat_map(|b| b.children.iter().cloned()).collect();
    let orphans: Vec<String> = blocks
        .keys()
        .filter(|id| **id != root_id && !parented.contains(*id))
        .cloned()
        .collect();
    if let Some(root) = blocks.get_mut(&root_id) {
        for orphan in orphans {
            debug!("attaching orphan block {} to root", orphan);
            root.children.push(orphan);
        }
    }

    ArchitectureGraph {
        root_id,
        blocks,
        cross_edges: Vec::new(),
        layout: BTreeMap::new(),
    }
}

/// Rebuild every block's requirement list from `RequirementRef::linked_blocks`.
pub fn assign_requirements(graph: &mut ArchitectureGraph, requirements: &[RequirementRef]) {
    for block in graph.blocks.values_mut() {
        block.requirements.clear();
    }
    let mut sorted: Vec<&RequirementRef> = requirements.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    for requirement in sorted {
        for block_id in &requirement.linked_blocks {
            match graph.blocks.get_mut(block_id) {
                Some(block) if !block.requirements.contains(&requirement.id) => {
                    block.requirements.push(requirement.id.clone());
                }
                Some(_) => {}
                None => debug!("requirement {} links unknown block {}", requirement.id, block_id),
            }
        }
    }
}

/// Edges between consecutive blocks (in id order) that share a requirement.
pub fn cross_edges(graph: &ArchitectureGraph) -> Vec<CrossEdge> {
    let mut by_requirement: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for block in graph.blocks.values() {
        for requirement in &block.requirements {
            by_requirement
                .entry(requirement.as_str())
                .or_default()
                .insert(block.id.as_str());
        }
    }

    let mut edges = Vec::new();
    for (requirement, blocks) in by_requirement {
        let blocks: Vec<&str> = blocks.into_iter().collect();
        for pair in blocks.windows(2) {
            edges.push(CrossEdge {
                id: format!("{}:{}->{}", requirement, pair[0], pair[1]),
                source: pair[0].to_string(),
                target: pair[1].to_string(),
                requirement_id: requirement.to_string(),
            });
        }
    }
    edges
}

/// Synthesize, merge, link and lay out. Pure: nothing is read or written.
pub fn generate(
    domains: &[DomainConfig],
    requirements: &[RequirementRef],
    persisted: Option<&ArchitectureGraph>,
) -> Result<ArchitectureGraph, StructuralError> {
    let mut graph = merge(synthesize(domains), persisted);
    assign_requirements(&mut graph, requirements);
    layout::apply(&mut graph)?;
    graph.cross_edges = cross_edges(&graph);
    Ok(graph)
}

/// Regenerate the graph from the stores and persist it.
///
/// Load, merge and save happen under the graph store's write lock, so a
/// layout saved concurrently is either merged in or saved after. On a
/// structural error the persisted graph is left untouched.
pub fn regenerate<S>(store: &S) -> Result<ArchitectureGraph, GenerateError>
where
    S: DomainStore + RequirementStore + GraphStore + ?Sized,
{
    let domains = store.load_domains()?;
    let requirements = store.list_requirements()?;

    let mut failure = None;
    let saved = store.update_graph(&mut |persisted| match generate(&domains, &requirements, persisted.as_ref()) {
        Ok(graph) => Some(graph),
        Err(e) => {
            failure = Some(e);
            None
        }
    })?;
    if let Some(e) = failure {
        return Err(e.into());
    }
    let graph = saved.ok_or_else(|| StructuralError::MissingRoot(ROOT_BLOCK_ID.to_string()))?;
    info!(
        "generated architecture: {} blocks, {} cross-edges",
        graph.blocks.len(),
        graph.cross_edges.len()
    );
    Ok(graph)
}

/// Persist a user-edited graph after checking its structure.
pub fn save_layout<S>(store: &S, mut graph: ArchitectureGraph) -> Result<ArchitectureGraph, GenerateError>
where
    S: GraphStore + ?Sized,
{
    layout::apply(&mut graph)?;
    graph.cross_edges = cross_edges(&graph);
    store.save_graph(&graph)?;
    Ok(graph)
}
