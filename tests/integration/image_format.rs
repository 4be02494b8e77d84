//! On-disk image round-trips and validation.

#![allow(missing_docs)]

use proptest::prelude::*;
use skein::graph::{Adjacency, GraphFile, GraphFileBuilder};
use skein::{Result, SkeinError};
use tempfile::tempdir;

fn example_graph() -> Result<GraphFile> {
    // 4 nodes, edges (0->1), (0->2), (1->2), (2->3).
    let mut b = GraphFileBuilder::<()>::new();
    for _ in 0..4 {
        b.add_node();
    }
    b.add_edge(0, 1, ())?;
    b.add_edge(0, 2, ())?;
    b.add_edge(1, 2, ())?;
    b.add_edge(2, 3, ())?;
    b.build()
}

#[test]
fn example_scenario_survives_a_disk_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("example.gr");
    example_graph()?.write(&path)?;

    let loaded = GraphFile::load(&path)?;
    assert_eq!(loaded.node_count(), 4);
    assert_eq!(loaded.edge_count(), 4);
    assert_eq!(loaded.neighbors(0).collect::<Vec<_>>(), vec![1, 2]);
    assert!(Adjacency::has_edge(&loaded, 2, 3));
    assert!(!Adjacency::has_edge(&loaded, 3, 0));
    Ok(())
}

#[test]
fn written_image_is_byte_identical() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("verbatim.gr");
    let original = example_graph()?;
    original.write(&path)?;
    let reloaded = GraphFile::load(&path)?;
    assert_eq!(reloaded.bytes(), original.bytes());

    // And the mapped image writes back identically too.
    let path2 = dir.path().join("verbatim2.gr");
    reloaded.write(&path2)?;
    assert_eq!(std::fs::read(&path2)?, original.bytes());
    Ok(())
}

#[test]
fn offset_invariant_holds_for_loaded_graphs() -> Result<()> {
    let g = example_graph()?;
    let offsets: Vec<u64> = g.edge_offsets().collect();
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(offsets.last(), Some(&(g.edge_count() as u64)));
    g.verify()?;
    Ok(())
}

#[test]
fn payload_survives_the_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("weighted.gr");
    let mut b = GraphFileBuilder::<f64>::new();
    for _ in 0..3 {
        b.add_node();
    }
    b.add_edge(0, 1, 0.5)?;
    b.add_edge(1, 2, -3.25)?;
    b.build()?.write(&path)?;

    let loaded = GraphFile::load(&path)?;
    assert_eq!(loaded.edge_value_len(), 8);
    assert_eq!(loaded.edge_value::<f64>(0), 0.5);
    assert_eq!(loaded.edge_value::<f64>(1), -3.25);
    Ok(())
}

#[test]
fn loading_garbage_fails_with_format_errors() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("garbage.gr");
    std::fs::write(&path, b"not a graph image at all")?;
    assert!(matches!(GraphFile::load(&path), Err(SkeinError::Format(_))));

    let truncated = dir.path().join("truncated.gr");
    let bytes = example_graph()?.bytes().to_vec();
    std::fs::write(&truncated, &bytes[..bytes.len() - 8])?;
    assert!(matches!(
        GraphFile::load(&truncated),
        Err(SkeinError::Format(_))
    ));
    Ok(())
}

#[test]
fn missing_file_fails_with_io() {
    let err = GraphFile::load("/nonexistent/skein/graph.gr").unwrap_err();
    assert!(matches!(err, SkeinError::Io(_)));
}

#[test]
fn owned_and_mapped_images_agree() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("agree.gr");
    let original = example_graph()?;
    original.write(&path)?;
    let mapped = GraphFile::load(&path)?;
    let owned = GraphFile::from_bytes(mapped.bytes())?;
    let cloned = mapped.clone();
    for node in 0..4u32 {
        let want: Vec<u32> = original.neighbors(node).collect();
        assert_eq!(mapped.neighbors(node).collect::<Vec<_>>(), want);
        assert_eq!(owned.neighbors(node).collect::<Vec<_>>(), want);
        assert_eq!(cloned.neighbors(node).collect::<Vec<_>>(), want);
    }
    Ok(())
}

proptest! {
    /// Any graph assembled by the builder reloads from disk with identical
    /// adjacency and payload.
    #[test]
    fn random_graphs_round_trip(
        nodes in 1usize..40,
        edges in prop::collection::vec((0u32..40, 0u32..40, any::<u32>()), 0..120),
    ) {
        let mut b = GraphFileBuilder::<u32>::new();
        for _ in 0..nodes {
            b.add_node();
        }
        let mut accepted = Vec::new();
        for (src, dst, w) in edges {
            if (src as usize) < nodes && (dst as usize) < nodes {
                b.add_edge(src, dst, w).unwrap();
                accepted.push((src, dst, w));
            }
        }
        let built = b.build().unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("prop.gr");
        built.write(&path).unwrap();
        let loaded = GraphFile::load(&path).unwrap();

        prop_assert_eq!(loaded.node_count(), nodes);
        prop_assert_eq!(loaded.edge_count(), accepted.len());
        let mut idx = 0u64;
        for node in 0..nodes as u32 {
            for (src, dst, w) in accepted.iter().filter(|(s, _, _)| *s == node) {
                prop_assert_eq!(*src, node);
                prop_assert_eq!(loaded.edge_dst(idx), *dst);
                prop_assert_eq!(loaded.edge_value::<u32>(idx), *w);
                idx += 1;
            }
        }
        loaded.verify().unwrap();
    }
}
