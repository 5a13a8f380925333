//! Level-based layout of the structural tree.
//!
//! Depth comes from a breadth-first walk over structural edges. Blocks left
//! without a pinned position are centred around `x = 0` on their row; pinned
//! blocks keep their coordinates and take no part in the spacing.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::architecture::StructuralError;
use crate::{ArchitectureGraph, Position};

pub const HORIZONTAL_SPACING: f64 = 250.0;
pub const ROW_HEIGHT: f64 = 220.0;
pub const TOP_MARGIN: f64 = 100.0;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

fn check_children(graph: &ArchitectureGraph) -> Result<(), StructuralError> {
    for block in graph.blocks.values() {
        for child in &block.children {
            if !graph.blocks.contains_key(child) {
                return Err(StructuralError::UnknownChild {
                    parent: block.id.clone(),
                    child: child.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Iterative three-colour DFS over every block.
fn check_acyclic(graph: &ArchitectureGraph) -> Result<(), StructuralError> {
    let mut marks: HashMap<&str, Mark> = graph.blocks.keys().map(|k| (k.as_str(), Mark::Unvisited)).collect();

    for start in graph.blocks.keys() {
        if marks.get(start.as_str()) != Some(&Mark::Unvisited) {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        marks.insert(start.as_str(), Mark::OnStack);

        while let Some(top) = stack.last_mut() {
            let (id, next) = *top;
            let children = &graph.blocks[id].children;
            if next >= children.len() {
                marks.insert(id, Mark::Done);
                stack.pop();
                continue;
            }
            top.1 += 1;
            let child = children[next].as_str();
            match marks.get(child).copied() {
                Some(Mark::Unvisited) => {
                    marks.insert(child, Mark::OnStack);
                    stack.push((child, 0));
                }
                Some(Mark::OnStack) => return Err(StructuralError::Cycle(child.to_string())),
                _ => {}
            }
        }
    }
    Ok(())
}

/// Block ids grouped by depth below the root, in traversal order.
///
/// Blocks unreachable from the root are placed as if they hung directly off
/// it, starting at depth 1.
pub fn levels(graph: &ArchitectureGraph) -> Result<Vec<Vec<String>>, StructuralError> {
    if !graph.blocks.contains_key(&graph.root_id) {
        return Err(StructuralError::MissingRoot(graph.root_id.clone()));
    }
    check_children(graph)?;
    check_acyclic(graph)?;

    let mut parent: HashMap<&str, &str> = HashMap::new();
    for block in graph.blocks.values() {
        for child in &block.children {
            if *child == graph.root_id {
                return Err(StructuralError::RootHasParent {
                    root: graph.root_id.clone(),
                    parent: block.id.clone(),
                });
            }
            if let Some(first) = parent.insert(child.as_str(), block.id.as_str()) {
                if first != block.id {
                    return Err(StructuralError::MultipleParents {
                        block: child.clone(),
                        first: first.to_string(),
                        second: block.id.clone(),
                    });
                }
            }
        }
    }

    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<(&str, usize)> = VecDeque::new();

    let orphan_roots = graph
        .blocks
        .keys()
        .map(String::as_str)
        .filter(|id| *id != graph.root_id && !parent.contains_key(id));
    let starts = std::iter::once((graph.root_id.as_str(), 0)).chain(orphan_roots.map(|id| (id, 1)));

    for start in starts {
        queue.push_back(start);
        while let Some((id, depth)) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            if levels.len() <= depth {
                levels.resize_with(depth + 1, Vec::new);
            }
            levels[depth].push(id.to_string());
            for child in &graph.blocks[id].children {
                queue.push_back((child.as_str(), depth + 1));
            }
        }
    }
    Ok(levels)
}

/// Recompute `graph.layout` for every block.
pub fn apply(graph: &mut ArchitectureGraph) -> Result<(), StructuralError> {
    let levels = levels(graph)?;
    let mut layout = std::collections::BTreeMap::new();

    for (depth, ids) in levels.iter().enumerate() {
        let y = depth as f64 * ROW_HEIGHT + TOP_MARGIN;
        let free: Vec<&String> = ids
            .iter()
            .filter(|id| graph.blocks[id.as_str()].position.is_none())
            .collect();
        let offset = (free.len() as f64 - 1.0) / 2.0;
        for (i, id) in free.into_iter().enumerate() {
            let x = (i as f64 - offset) * HORIZONTAL_SPACING;
            layout.insert(id.clone(), Position { x, y });
        }
        for id in ids {
            if let Some(pinned) = &graph.blocks[id.as_str()].position {
                layout.insert(id.clone(), pinned.clone());
            }
        }
    }

    graph.layout = layout;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::{synthesize, ROOT_BLOCK_ID};
    use crate::{ArchitectureBlock, DomainConfig};

    fn domain(id: &str, subs: &[&str]) -> DomainConfig {
        DomainConfig {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            subdomain_ids: subs.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn at(graph: &ArchitectureGraph, id: &str) -> (f64, f64) {
        let p = &graph.layout[id];
        (p.x, p.y)
    }

    #[test]
    fn siblings_are_centred_on_their_row() {
        let mut graph = synthesize(&[domain("ui", &[]), domain("motor", &[])]);
        apply(&mut graph).unwrap();
        assert_eq!(at(&graph, ROOT_BLOCK_ID), (0.0, 100.0));
        assert_eq!(at(&graph, "BLK-ui"), (-125.0, 320.0));
        assert_eq!(at(&graph, "BLK-motor"), (125.0, 320.0));
    }

    #[test]
    fn layout_is_deterministic() {
        let domains = [
            domain("ui", &["ui-display", "ui-input"]),
            domain("ui-display", &[]),
            domain("ui-input", &[]),
            domain("motor", &[]),
        ];
        let mut first = synthesize(&domains);
        let mut second = synthesize(&domains);
        apply(&mut first).unwrap();
        apply(&mut second).unwrap();
        assert_eq!(first.layout, second.layout);
        assert_eq!(at(&first, "BLK-ui-display"), (-125.0, 540.0));
    }

    #[test]
    fn pinned_blocks_are_excluded_from_spacing() {
        let mut graph = synthesize(&[domain("a", &[]), domain("b", &[]), domain("c", &[])]);
        graph.blocks.get_mut("BLK-b").unwrap().position = Some(Position { x: 50.0, y: 80.0 });
        apply(&mut graph).unwrap();
        assert_eq!(at(&graph, "BLK-b"), (50.0, 80.0));
        assert_eq!(at(&graph, "BLK-a"), (-125.0, 320.0));
        assert_eq!(at(&graph, "BLK-c"), (125.0, 320.0));
    }

    #[test]
    fn unreachable_blocks_start_at_depth_one() {
        let mut graph = synthesize(&[domain("ui", &[])]);
        let mut stray = ArchitectureBlock::new("BLK-stray", "Stray");
        stray.children.push("BLK-leaf".into());
        graph.blocks.insert(stray.id.clone(), stray);
        graph
            .blocks
            .insert("BLK-leaf".into(), ArchitectureBlock::new("BLK-leaf", "Leaf"));

        let levels = levels(&graph).unwrap();
        assert_eq!(levels[1], vec!["BLK-ui", "BLK-stray"]);
        assert_eq!(levels[2], vec!["BLK-leaf"]);
    }

    #[test]
    fn structural_faults_are_reported() {
        let mut graph = synthesize(&[domain("a", &["b"]), domain("b", &[])]);
        graph.root_id = "BLK-none".into();
        assert!(matches!(levels(&graph), Err(StructuralError::MissingRoot(_))));

        let mut graph = synthesize(&[domain("a", &["b"]), domain("b", &[])]);
        graph
            .blocks
            .get_mut(ROOT_BLOCK_ID)
            .unwrap()
            .children
            .push("BLK-b".into());
        assert!(matches!(levels(&graph), Err(StructuralError::MultipleParents { .. })));

        let mut graph = synthesize(&[domain("a", &[])]);
        graph.blocks.get_mut("BLK-a").unwrap().children.push("BLK-x".into());
        assert!(matches!(levels(&graph), Err(StructuralError::UnknownChild { .. })));

        let mut graph = synthesize(&[domain("a", &[])]);
        graph
            .blocks
            .get_mut("BLK-a")
            .unwrap()
            .children
            .push(ROOT_BLOCK_ID.into());
        assert!(matches!(levels(&graph), Err(StructuralError::Cycle(_))));
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let domains: Vec<DomainConfig> = (0..5000)
            .map(|i| {
                let subs = if i < 4999 { vec![format!("d{}", i + 1)] } else { vec![] };
                DomainConfig {
                    id: format!("d{}", i),
                    name: String::new(),
                    description: String::new(),
                    subdomain_ids: subs,
                }
            })
            .collect();
        let mut graph = synthesize(&domains);
        apply(&mut graph).unwrap();
        assert_eq!(at(&graph, "BLK-d4999"), (0.0, 5000.0 * ROW_HEIGHT + TOP_MARGIN));
    }
}
