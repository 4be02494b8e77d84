//! Representation equivalence: all four layouts expose the same topology as
//! the image they were built from.

#![allow(missing_docs)]

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use skein::graph::{
    Adjacency, ChunkedLinearGraph, CsrGraph, CsrInlineGraph, GraphFile, GraphFileBuilder,
    LinearGraph,
};
use skein::mem::AllocPolicy;
use skein::worker::WorkerSet;
use skein::Result;

fn random_graph(seed: u64, nodes: usize, edges: usize) -> Result<GraphFile> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut b = GraphFileBuilder::<u32>::new();
    for _ in 0..nodes {
        b.add_node();
    }
    for _ in 0..edges {
        let src = rng.gen_range(0..nodes as u32);
        let dst = rng.gen_range(0..nodes as u32);
        b.add_edge(src, dst, rng.gen())?;
    }
    b.build()
}

fn assert_matches_image(layout: &dyn Adjacency, file: &GraphFile, name: &str) {
    assert_eq!(layout.node_count(), file.node_count(), "{name}: node count");
    assert_eq!(layout.edge_count(), file.edge_count(), "{name}: edge count");
    for node in 0..file.node_count() as u32 {
        assert_eq!(
            layout.neighbors(node),
            file.neighbors(node).collect::<Vec<u32>>(),
            "{name}: adjacency of node {node}"
        );
        assert_eq!(
            layout.degree(node),
            Adjacency::degree(file, node),
            "{name}: degree of node {node}"
        );
    }
}

#[test]
fn all_layouts_expose_identical_adjacency() -> Result<()> {
    for seed in [1u64, 7, 42] {
        let file = random_graph(seed, 64, 512)?;
        let set = WorkerSet::new(4)?;

        let csr: CsrGraph<u64, u32> = CsrGraph::build(&file, AllocPolicy::Local)?;
        let inline: CsrInlineGraph<u64, u32> = CsrInlineGraph::build(&file, AllocPolicy::Local)?;
        let linear: LinearGraph<u64, u32> = LinearGraph::build(&file, AllocPolicy::Local)?;
        let chunked: ChunkedLinearGraph<u64, u32> =
            ChunkedLinearGraph::build(&file, AllocPolicy::Interleaved, &set)?;

        assert_matches_image(&csr, &file, "csr");
        assert_matches_image(&inline, &file, "csr-inline");
        assert_matches_image(&linear, &file, "linear");
        assert_matches_image(&chunked, &file, "chunked");
    }
    Ok(())
}

#[test]
fn has_edge_agrees_across_layouts() -> Result<()> {
    let file = random_graph(99, 32, 128)?;
    let set = WorkerSet::new(3)?;
    let csr: CsrGraph<(), u32> = CsrGraph::build(&file, AllocPolicy::Local)?;
    let inline: CsrInlineGraph<(), u32> = CsrInlineGraph::build(&file, AllocPolicy::Local)?;
    let linear: LinearGraph<(), u32> = LinearGraph::build(&file, AllocPolicy::Local)?;
    let chunked: ChunkedLinearGraph<(), u32> =
        ChunkedLinearGraph::build(&file, AllocPolicy::Local, &set)?;

    for src in 0..32u32 {
        for dst in 0..32u32 {
            let want = Adjacency::has_edge(&file, src, dst);
            assert_eq!(csr.has_edge(src, dst), want);
            assert_eq!(inline.has_edge(src, dst), want);
            assert_eq!(linear.has_edge(src, dst), want);
            assert_eq!(chunked.has_edge(src, dst), want);
        }
    }
    Ok(())
}

#[test]
fn edge_payload_agrees_across_layouts() -> Result<()> {
    let file = random_graph(5, 24, 96)?;
    let set = WorkerSet::new(2)?;
    let mut csr: CsrGraph<(), u32> = CsrGraph::build(&file, AllocPolicy::Local)?;
    let mut inline: CsrInlineGraph<(), u32> = CsrInlineGraph::build(&file, AllocPolicy::Local)?;
    let mut linear: LinearGraph<(), u32> = LinearGraph::build(&file, AllocPolicy::Local)?;
    let mut chunked: ChunkedLinearGraph<(), u32> =
        ChunkedLinearGraph::build(&file, AllocPolicy::Local, &set)?;

    let mut ctxs = WorkerSet::new(1)?.contexts();
    for node in 0..24u32 {
        let want: Vec<u32> = file.edge_range(node).map(|i| file.edge_value(i)).collect();

        let mut it = skein::runtime::Iteration::begin(&mut ctxs[0]);
        let refs: Vec<_> = csr
            .edges(&mut it, node, skein::runtime::AccessMode::ReadWrite)
            .unwrap()
            .collect();
        drop(it);
        let got: Vec<u32> = refs.iter().map(|&e| *csr.edge_data_mut(e)).collect();
        assert_eq!(got, want, "csr payload of node {node}");
        let got: Vec<u32> = refs.iter().map(|&e| *inline.edge_data_mut(e)).collect();
        assert_eq!(got, want, "inline payload of node {node}");

        let handle = linear.node(node);
        let mut it = skein::runtime::Iteration::begin(&mut ctxs[0]);
        let refs: Vec<_> = linear
            .edges(&mut it, handle, skein::runtime::AccessMode::ReadWrite)
            .unwrap()
            .collect();
        drop(it);
        let got: Vec<u32> = refs.iter().map(|&e| *linear.edge_data_mut(e)).collect();
        assert_eq!(got, want, "linear payload of node {node}");

        let handle = chunked.node(node);
        let mut it = skein::runtime::Iteration::begin(&mut ctxs[0]);
        let refs: Vec<_> = chunked
            .edges(&mut it, handle, skein::runtime::AccessMode::ReadWrite)
            .unwrap()
            .collect();
        drop(it);
        let got: Vec<u32> = refs.iter().map(|&e| *chunked.edge_data_mut(e)).collect();
        assert_eq!(got, want, "chunked payload of node {node}");
    }
    Ok(())
}

#[test]
fn chunked_parity_is_stable_across_worker_counts() -> Result<()> {
    let file = random_graph(1234, 100, 1000)?;
    for workers in [1, 2, 5, 16] {
        let set = WorkerSet::new(workers)?;
        let g: ChunkedLinearGraph<(), u32> =
            ChunkedLinearGraph::build(&file, AllocPolicy::Interleaved, &set)?;
        assert_matches_image(&g, &file, "chunked");
    }
    Ok(())
}
