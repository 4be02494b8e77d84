//! Per-worker-partitioned linear layout built in parallel.
//!
//! The node range is divided into contiguous, weight-balanced segments, one
//! per worker; each worker fills a private arena with its segment's node and
//! edge records. Construction runs in two scoped-thread phases with a full
//! barrier between them (the scope join): node records first, then edge
//! records, whose destinations are re-checked against the completed node-id
//! space and resolved back to handles through the per-chunk offset maps.
//!
//! The balancing rule is a placement heuristic, not a correctness invariant:
//! a sequential scan cuts the node range whenever the accumulated footprint
//! passes the per-worker target, which under skewed degree distributions can
//! leave the last segments light.

#![allow(unsafe_code)]

use std::fmt;
use std::mem::size_of;
use std::ops::Range;
use std::thread;

use tracing::debug;

use crate::error::{ConflictAbort, Result};
use crate::graph::linear::{edges_offset, Chunk, EdgeRec, LinearEdge, LinearEdges, LinearNode, NodeRec};
use crate::graph::{check_stride, Adjacency, EdgeValue, GraphFile};
use crate::mem::AllocPolicy;
use crate::runtime::conflict::{AccessMode, Iteration};
use crate::worker::{WorkerCtx, WorkerSet};

/// Tunable weights for the segment divider.
///
/// The per-node weight is `node_weight + degree * edge_weight`; defaults are
/// the in-memory record sizes, approximating bytes of arena per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    /// Weight of one node record.
    pub node_weight: usize,
    /// Weight of one edge record.
    pub edge_weight: usize,
}

impl Balance {
    /// Weights matching the record sizes of a `(N, E)` layout.
    pub fn records<N, E: EdgeValue>() -> Balance {
        Balance {
            node_weight: size_of::<NodeRec<N>>(),
            edge_weight: size_of::<EdgeRec<E>>(),
        }
    }
}

/// Divides `0..node_count` into one contiguous segment per worker,
/// cut whenever the running weight passes the per-worker target.
fn distribute(file: &GraphFile, workers: usize, balance: Balance) -> Vec<Range<u32>> {
    let n = file.node_count() as u32;
    let total: u64 = file.node_count() as u64 * balance.node_weight as u64
        + file.edge_count() as u64 * balance.edge_weight as u64;
    let target = total.div_ceil(workers as u64).max(1);

    let mut ranges = Vec::with_capacity(workers);
    let mut start = 0u32;
    let mut acc = 0u64;
    for node in 0..n {
        let range = file.edge_range(node);
        acc += balance.node_weight as u64 + (range.end - range.start) * balance.edge_weight as u64;
        if acc >= target && ranges.len() + 1 < workers {
            ranges.push(start..node + 1);
            start = node + 1;
            acc = 0;
        }
    }
    ranges.push(start..n);
    while ranges.len() < workers {
        ranges.push(n..n);
    }
    ranges
}

/// Immutable-topology linear graph in per-worker chunks.
pub struct ChunkedLinearGraph<N, E: EdgeValue> {
    chunks: Vec<Chunk<N, E>>,
    starts: Vec<u32>,
    node_count: usize,
    edge_count: usize,
}

impl<N: Default + Send, E: EdgeValue + Send> ChunkedLinearGraph<N, E> {
    /// Builds the layout with record-size balancing.
    pub fn build(file: &GraphFile, policy: AllocPolicy, set: &WorkerSet) -> Result<Self> {
        Self::build_with(file, policy, set, Balance::records::<N, E>())
    }

    /// Builds the layout, one chunk per worker of `set`, constructed by a
    /// parallel phase per stage.
    pub fn build_with(
        file: &GraphFile,
        policy: AllocPolicy,
        set: &WorkerSet,
        balance: Balance,
    ) -> Result<Self> {
        check_stride::<E>(file)?;
        let ranges = distribute(file, set.count(), balance);
        let starts: Vec<u32> = ranges.iter().map(|r| r.start).collect();

        let mut chunks = thread::scope(|scope| {
            let handles: Vec<_> = ranges
                .iter()
                .cloned()
                .map(|range| scope.spawn(move || Chunk::<N, E>::build_nodes(file, range, policy)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("construction worker panicked"))
                .collect::<Result<Vec<_>>>()
        })?;
        // Scope join is the barrier: every chunk's node records and offset
        // map are visible before any edge record is written.
        thread::scope(|scope| {
            let handles: Vec<_> = chunks
                .iter_mut()
                .map(|chunk| scope.spawn(move || chunk.build_edges(file)))
                .collect();
            handles
                .into_iter()
                .try_for_each(|h| h.join().expect("construction worker panicked"))
        })?;

        debug!(
            nodes = file.node_count(),
            edges = file.edge_count(),
            chunks = chunks.len(),
            "built chunked linear layout"
        );
        Ok(ChunkedLinearGraph {
            chunks,
            starts,
            node_count: file.node_count(),
            edge_count: file.edge_count(),
        })
    }
}

impl<N, E: EdgeValue> ChunkedLinearGraph<N, E> {
    /// Number of nodes.
    pub fn size(&self) -> usize {
        self.node_count
    }

    /// Number of directed edges.
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Number of chunks (= workers of the constructing set).
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Handle for node `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    pub fn node(&self, id: u32) -> LinearNode {
        assert!((id as usize) < self.node_count, "node {id} out of range");
        let chunk = self.starts.partition_point(|&s| s <= id) - 1;
        let local = (id - self.chunks[chunk].first()) as usize;
        LinearNode {
            id,
            chunk: chunk as u32,
            off: self.chunks[chunk].offs()[local],
        }
    }

    /// Node handles in chunk order, which is id order.
    pub fn nodes(&self) -> impl Iterator<Item = LinearNode> + '_ {
        self.chunks.iter().enumerate().flat_map(|(c, chunk)| {
            chunk.offs().iter().enumerate().map(move |(i, &off)| LinearNode {
                id: chunk.first() + i as u32,
                chunk: c as u32,
                off,
            })
        })
    }

    /// Node handles of the chunk the calling worker built, for purely local
    /// scans.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` comes from a larger pool than the constructing set.
    pub fn local_nodes<'a>(&'a self, ctx: &WorkerCtx) -> impl Iterator<Item = LinearNode> + 'a {
        let c = ctx.id().0 as usize;
        assert!(c < self.chunks.len(), "worker {c} has no chunk");
        let chunk = &self.chunks[c];
        chunk.offs().iter().enumerate().map(move |(i, &off)| LinearNode {
            id: chunk.first() + i as u32,
            chunk: c as u32,
            off,
        })
    }

    /// Acquires `node` for `it` and returns its payload.
    pub fn data<'a, 'i>(
        &'a self,
        it: &'i mut Iteration<'a>,
        node: LinearNode,
    ) -> Result<&'i mut N, ConflictAbort> {
        let rec = self.rec(node);
        it.acquire(rec, AccessMode::ReadWrite)?;
        // SAFETY: the mark is held by this iteration; the reference borrows
        // `it` mutably.
        Ok(unsafe { &mut *rec.data.get() })
    }

    /// Node payload access that bypasses the conflict mark.
    ///
    /// # Safety
    ///
    /// The caller must guarantee phase-level exclusivity: for the returned
    /// borrow's lifetime, no other reference to this node's payload may
    /// exist and no other thread may access the node through any path.
    pub unsafe fn data_unguarded(&self, node: LinearNode) -> &mut N {
        &mut *self.rec(node).data.get()
    }

    /// Node payload for quiescent phases.
    pub fn data_mut(&mut self, node: LinearNode) -> &mut N {
        self.validate(node);
        self.chunks[node.chunk as usize].node_mut(node.off).data.get_mut()
    }

    /// Acquires `node` for `it` and returns its edge handles.
    pub fn edges<'a>(
        &'a self,
        it: &mut Iteration<'a>,
        node: LinearNode,
        mode: AccessMode,
    ) -> Result<LinearEdges, ConflictAbort> {
        let rec = self.rec(node);
        it.acquire(rec, mode)?;
        Ok(LinearEdges::new(
            node.id,
            node.chunk,
            node.off + edges_offset::<N, E>(),
            size_of::<EdgeRec<E>>(),
            rec.degree,
        ))
    }

    /// Destination handle of `edge`, resolved through the offset maps.
    pub fn edge_dst(&self, edge: LinearEdge) -> LinearNode {
        self.validate_edge(edge);
        self.node(self.chunks[edge.chunk as usize].edge(edge.off).dst)
    }

    /// Acquires `edge`'s source node for `it` and returns the edge payload.
    pub fn edge_data<'a, 'i>(
        &'a self,
        it: &'i mut Iteration<'a>,
        edge: LinearEdge,
    ) -> Result<&'i mut E, ConflictAbort> {
        self.validate_edge(edge);
        let src = self.node(edge.src);
        it.acquire(
            self.chunks[src.chunk as usize].node(src.off),
            AccessMode::ReadWrite,
        )?;
        // SAFETY: as for `data`; the source's mark covers its edge run.
        Ok(unsafe { &mut *self.chunks[edge.chunk as usize].edge(edge.off).value.get() })
    }

    /// Edge payload access that bypasses the source node's conflict mark.
    ///
    /// # Safety
    ///
    /// As for [`ChunkedLinearGraph::data_unguarded`], applied to the edge's
    /// payload.
    pub unsafe fn edge_data_unguarded(&self, edge: LinearEdge) -> &mut E {
        self.validate_edge(edge);
        &mut *self.chunks[edge.chunk as usize].edge(edge.off).value.get()
    }

    /// Edge payload for quiescent phases.
    pub fn edge_data_mut(&mut self, edge: LinearEdge) -> &mut E {
        self.validate_edge(edge);
        self.chunks[edge.chunk as usize].edge_mut(edge.off).value.get_mut()
    }

    fn rec(&self, node: LinearNode) -> &NodeRec<N> {
        self.validate(node);
        self.chunks[node.chunk as usize].node(node.off)
    }

    fn validate(&self, node: LinearNode) {
        let valid = self.chunks.get(node.chunk as usize).is_some_and(|chunk| {
            node.id
                .checked_sub(chunk.first())
                .and_then(|local| chunk.offs().get(local as usize))
                == Some(&node.off)
        });
        assert!(valid, "stale or foreign node handle {node:?}");
    }

    fn validate_edge(&self, edge: LinearEdge) {
        let src = self.node(edge.src);
        assert_eq!(
            src.chunk, edge.chunk,
            "edge handle {edge:?} points outside its source's chunk"
        );
        let chunk = &self.chunks[src.chunk as usize];
        let run = src.off + edges_offset::<N, E>();
        let degree = chunk.node(src.off).degree as usize;
        let stride = size_of::<EdgeRec<E>>();
        let rel = edge.off.checked_sub(run);
        assert!(
            rel.is_some_and(|rel| rel % stride == 0 && rel / stride < degree),
            "stale or foreign edge handle {edge:?}"
        );
    }
}

impl<N, E: EdgeValue> Adjacency for ChunkedLinearGraph<N, E> {
    fn node_count(&self) -> usize {
        self.node_count
    }

    fn edge_count(&self) -> usize {
        self.edge_count
    }

    fn neighbors(&self, node: u32) -> Vec<u32> {
        let handle = self.node(node);
        let chunk = &self.chunks[handle.chunk as usize];
        let degree = chunk.node(handle.off).degree as usize;
        let run = handle.off + edges_offset::<N, E>();
        (0..degree)
            .map(|k| chunk.edge(run + k * size_of::<EdgeRec<E>>()).dst)
            .collect()
    }

    fn degree(&self, node: u32) -> usize {
        let handle = self.node(node);
        self.chunks[handle.chunk as usize].node(handle.off).degree as usize
    }
}

impl<N, E: EdgeValue> fmt::Debug for ChunkedLinearGraph<N, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedLinearGraph")
            .field("nodes", &self.node_count)
            .field("edges", &self.edge_count)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}
