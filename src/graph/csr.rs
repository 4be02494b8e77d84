//! Compressed-sparse-row layout with separate offset, destination, and
//! payload arrays.
//!
//! The classic four-array layout: node records in one flat slab, a 64-bit
//! offset slab, a 32-bit destination slab, and edge payload in a parallel
//! slab. Offsets and destinations are written once at build time; node and
//! edge payloads stay mutable through the conflict-detection protocol.

#![allow(unsafe_code)]

use std::fmt;
use std::ops::Range;

use tracing::debug;

use crate::error::{ConflictAbort, Result};
use crate::graph::{check_stride, Adjacency, EdgeValue, GraphFile};
use crate::mem::{AllocPolicy, Slab};
use crate::runtime::conflict::{AccessMode, Iteration, Lockable, OwnerMark, RecordCell};

/// Node payload plus its conflict mark.
struct NodeRec<N> {
    mark: OwnerMark,
    data: RecordCell<N>,
}

impl<N> Lockable for NodeRec<N> {
    fn owner_mark(&self) -> &OwnerMark {
        &self.mark
    }
}

/// Handle to one edge of a CSR-family graph: the source node plus the edge's
/// global index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRef {
    pub(crate) src: u32,
    pub(crate) idx: u64,
}

impl EdgeRef {
    /// Source node of the edge.
    pub fn src(&self) -> u32 {
        self.src
    }
}

/// Edge handles of one node, in stored adjacency order.
#[derive(Debug, Clone)]
pub struct Edges {
    src: u32,
    range: Range<u64>,
}

impl Edges {
    pub(crate) fn new(src: u32, range: Range<u64>) -> Edges {
        Edges { src, range }
    }
}

impl Iterator for Edges {
    type Item = EdgeRef;

    fn next(&mut self) -> Option<EdgeRef> {
        let idx = self.range.next()?;
        Some(EdgeRef { src: self.src, idx })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.range.size_hint()
    }
}

/// Immutable-topology CSR graph.
pub struct CsrGraph<N, E: EdgeValue> {
    nodes: Slab<NodeRec<N>>,
    offsets: Slab<u64>,
    dests: Slab<u32>,
    values: Slab<RecordCell<E>>,
}

impl<N: Default, E: EdgeValue> CsrGraph<N, E> {
    /// Builds the layout from a loaded image. Single-construction: topology
    /// is fixed from here on.
    pub fn build(file: &GraphFile, policy: AllocPolicy) -> Result<Self> {
        check_stride::<E>(file)?;
        file.verify()?;
        let n = file.node_count();
        let m = file.edge_count();
        let nodes = Slab::from_fn(n, policy, |_| NodeRec {
            mark: OwnerMark::new(),
            data: RecordCell::new(N::default()),
        })?;
        let offsets = Slab::from_fn(n, policy, |i| file.edge_range(i as u32).end)?;
        let dests = Slab::from_fn(m, policy, |i| file.edge_dst(i as u64))?;
        let values = Slab::from_fn(m, policy, |i| RecordCell::new(file.edge_value::<E>(i as u64)))?;
        debug!(nodes = n, edges = m, "built CSR layout");
        Ok(CsrGraph {
            nodes,
            offsets,
            dests,
            values,
        })
    }
}

impl<N, E: EdgeValue> CsrGraph<N, E> {
    /// Number of nodes.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Number of directed edges.
    pub fn edge_count(&self) -> usize {
        self.dests.len()
    }

    /// Node handles in index order.
    pub fn nodes(&self) -> impl Iterator<Item = u32> {
        0..self.nodes.len() as u32
    }

    /// Global edge-index range of `node`'s out-edges.
    pub fn edge_range(&self, node: u32) -> Range<u64> {
        let idx = node as usize;
        let begin = if idx == 0 { 0 } else { self.offsets[idx - 1] };
        begin..self.offsets[idx]
    }

    /// Acquires `node` for `it` and returns its payload.
    pub fn data<'a, 'i>(
        &'a self,
        it: &'i mut Iteration<'a>,
        node: u32,
    ) -> Result<&'i mut N, ConflictAbort> {
        let rec = &self.nodes[node as usize];
        it.acquire(rec, AccessMode::ReadWrite)?;
        // SAFETY: the mark is held by this iteration, and the reference
        // borrows `it` mutably, so no second payload reference can be minted
        // while this one is live.
        Ok(unsafe { &mut *rec.data.get() })
    }

    /// Node payload access that bypasses the conflict mark.
    ///
    /// # Safety
    ///
    /// The caller must guarantee phase-level exclusivity: for the returned
    /// borrow's lifetime, no other reference to this node's payload may
    /// exist and no other thread may access the node through any path.
    pub unsafe fn data_unguarded(&self, node: u32) -> &mut N {
        &mut *self.nodes[node as usize].data.get()
    }

    /// Node payload for quiescent phases.
    pub fn data_mut(&mut self, node: u32) -> &mut N {
        self.nodes[node as usize].data.get_mut()
    }

    /// Acquires `node` for `it` and returns its edge handles.
    pub fn edges<'a>(
        &'a self,
        it: &mut Iteration<'a>,
        node: u32,
        mode: AccessMode,
    ) -> Result<Edges, ConflictAbort> {
        it.acquire(&self.nodes[node as usize], mode)?;
        Ok(Edges {
            src: node,
            range: self.edge_range(node),
        })
    }

    /// Destination of `edge`.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to an edge of its source node.
    pub fn edge_dst(&self, edge: EdgeRef) -> u32 {
        self.validate(edge);
        self.dests[edge.idx as usize]
    }

    /// Acquires `edge`'s source node for `it` and returns the edge payload.
    pub fn edge_data<'a, 'i>(
        &'a self,
        it: &'i mut Iteration<'a>,
        edge: EdgeRef,
    ) -> Result<&'i mut E, ConflictAbort> {
        self.validate(edge);
        it.acquire(&self.nodes[edge.src as usize], AccessMode::ReadWrite)?;
        // SAFETY: as for `data`; every edge belongs to exactly one source
        // node, so the source's mark covers the payload cell.
        Ok(unsafe { &mut *self.values[edge.idx as usize].get() })
    }

    /// Edge payload access that bypasses the source node's conflict mark.
    ///
    /// # Safety
    ///
    /// As for [`CsrGraph::data_unguarded`], applied to the edge's payload.
    pub unsafe fn edge_data_unguarded(&self, edge: EdgeRef) -> &mut E {
        self.validate(edge);
        &mut *self.values[edge.idx as usize].get()
    }

    /// Edge payload for quiescent phases.
    pub fn edge_data_mut(&mut self, edge: EdgeRef) -> &mut E {
        self.validate(edge);
        self.values[edge.idx as usize].get_mut()
    }

    fn validate(&self, edge: EdgeRef) {
        assert!(
            self.edge_range(edge.src).contains(&edge.idx),
            "edge handle {edge:?} is not within its source's range"
        );
    }
}

impl<N, E: EdgeValue> Adjacency for CsrGraph<N, E> {
    fn node_count(&self) -> usize {
        self.size()
    }

    fn edge_count(&self) -> usize {
        self.dests.len()
    }

    fn neighbors(&self, node: u32) -> Vec<u32> {
        self.edge_range(node)
            .map(|i| self.dests[i as usize])
            .collect()
    }

    fn degree(&self, node: u32) -> usize {
        let range = self.edge_range(node);
        (range.end - range.start) as usize
    }

    fn has_edge(&self, src: u32, dst: u32) -> bool {
        self.edge_range(src).any(|i| self.dests[i as usize] == dst)
    }
}

impl<N, E: EdgeValue> fmt::Debug for CsrGraph<N, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrGraph")
            .field("nodes", &self.size())
            .field("edges", &self.edge_count())
            .finish()
    }
}
