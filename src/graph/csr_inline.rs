//! Compressed-sparse-row layout with destination and payload bundled per
//! edge record.
//!
//! Each node record carries direct bounds into a single edge-record slab, so
//! a scan over one node's edges touches one array instead of two parallel
//! ones. Shares the [`EdgeRef`] handle with the plain CSR layout.

#![allow(unsafe_code)]

use std::fmt;
use std::ops::Range;

use tracing::debug;

use crate::error::{ConflictAbort, Result};
use crate::graph::csr::{EdgeRef, Edges};
use crate::graph::{check_stride, Adjacency, EdgeValue, GraphFile};
use crate::mem::{AllocPolicy, Slab};
use crate::runtime::conflict::{AccessMode, Iteration, Lockable, OwnerMark, RecordCell};

/// Node payload, conflict mark, and bounds into the edge slab.
struct NodeRec<N> {
    mark: OwnerMark,
    data: RecordCell<N>,
    begin: u64,
    end: u64,
}

impl<N> Lockable for NodeRec<N> {
    fn owner_mark(&self) -> &OwnerMark {
        &self.mark
    }
}

/// Destination and payload in one record.
struct EdgeRec<E> {
    dst: u32,
    value: RecordCell<E>,
}

/// Immutable-topology CSR graph with inline edge records.
pub struct CsrInlineGraph<N, E: EdgeValue> {
    nodes: Slab<NodeRec<N>>,
    edges: Slab<EdgeRec<E>>,
}

impl<N: Default, E: EdgeValue> CsrInlineGraph<N, E> {
    /// Builds the layout from a loaded image. Single-construction: topology
    /// is fixed from here on.
    pub fn build(file: &GraphFile, policy: AllocPolicy) -> Result<Self> {
        check_stride::<E>(file)?;
        file.verify()?;
        let n = file.node_count();
        let m = file.edge_count();
        let nodes = Slab::from_fn(n, policy, |i| {
            let range = file.edge_range(i as u32);
            NodeRec {
                mark: OwnerMark::new(),
                data: RecordCell::new(N::default()),
                begin: range.start,
                end: range.end,
            }
        })?;
        let edges = Slab::from_fn(m, policy, |i| EdgeRec {
            dst: file.edge_dst(i as u64),
            value: RecordCell::new(file.edge_value::<E>(i as u64)),
        })?;
        debug!(nodes = n, edges = m, "built inline CSR layout");
        Ok(CsrInlineGraph { nodes, edges })
    }
}

impl<N, E: EdgeValue> CsrInlineGraph<N, E> {
    /// Number of nodes.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Number of directed edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Node handles in index order.
    pub fn nodes(&self) -> impl Iterator<Item = u32> {
        0..self.nodes.len() as u32
    }

    /// Global edge-index range of `node`'s out-edges.
    pub fn edge_range(&self, node: u32) -> Range<u64> {
        let rec = &self.nodes[node as usize];
        rec.begin..rec.end
    }

    /// Acquires `node` for `it` and returns its payload.
    pub fn data<'a, 'i>(
        &'a self,
        it: &'i mut Iteration<'a>,
        node: u32,
    ) -> Result<&'i mut N, ConflictAbort> {
        let rec = &self.nodes[node as usize];
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
        let rec = &self.nodes[node as usize];
        it.acquire(rec, mode)?;
        Ok(Edges::new(node, rec.begin..rec.end))
    }

    /// Destination of `edge`.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to an edge of its source node.
    pub fn edge_dst(&self, edge: EdgeRef) -> u32 {
        self.validate(edge);
        self.edges[edge.idx as usize].dst
    }

    /// Acquires `edge`'s source node for `it` and returns the edge payload.
    pub fn edge_data<'a, 'i>(
        &'a self,
        it: &'i mut Iteration<'a>,
        edge: EdgeRef,
    ) -> Result<&'i mut E, ConflictAbort> {
        self.validate(edge);
        it.acquire(&self.nodes[edge.src as usize], AccessMode::ReadWrite)?;
        // SAFETY: as for `data`; the source's mark covers its edge records.
        Ok(unsafe { &mut *self.edges[edge.idx as usize].value.get() })
    }

    /// Edge payload access that bypasses the source node's conflict mark.
    ///
    /// # Safety
    ///
    /// As for [`CsrInlineGraph::data_unguarded`], applied to the edge's
    /// payload.
    pub unsafe fn edge_data_unguarded(&self, edge: EdgeRef) -> &mut E {
        self.validate(edge);
        &mut *self.edges[edge.idx as usize].value.get()
    }

    /// Edge payload for quiescent phases.
    pub fn edge_data_mut(&mut self, edge: EdgeRef) -> &mut E {
        self.validate(edge);
        self.edges[edge.idx as usize].value.get_mut()
    }

    fn validate(&self, edge: EdgeRef) {
        assert!(
            self.edge_range(edge.src).contains(&edge.idx),
            "edge handle {edge:?} is not within its source's bounds"
        );
    }
}

impl<N, E: EdgeValue> Adjacency for CsrInlineGraph<N, E> {
    fn node_count(&self) -> usize {
        self.size()
    }

    fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn neighbors(&self, node: u32) -> Vec<u32> {
        self.edge_range(node)
            .map(|i| self.edges[i as usize].dst)
            .collect()
    }

    fn degree(&self, node: u32) -> usize {
        let range = self.edge_range(node);
        (range.end - range.start) as usize
    }

    fn has_edge(&self, src: u32, dst: u32) -> bool {
        self.edge_range(src).any(|i| self.edges[i as usize].dst == dst)
    }
}

impl<N, E: EdgeValue> fmt::Debug for CsrInlineGraph<N, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrInlineGraph")
            .field("nodes", &self.size())
            .field("edges", &self.edge_count())
            .finish()
    }
}
