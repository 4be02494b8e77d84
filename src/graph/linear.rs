//! Linear layout: node and edge records back-to-back in one arena.
//!
//! Every node record is followed immediately by its edge records
//! (alignment-rounded), so a full sequential scan touches memory once in
//! allocation order. The plumbing here — record types, stride math, and the
//! arena [`Chunk`] — is shared with the per-worker-partitioned layout in
//! [`crate::graph::chunked`].
//!
//! Handles are validated indexes into the chunk's node-offset map, never raw
//! addresses: a stale or foreign handle panics instead of dereferencing
//! freed memory.

#![allow(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::Range;
use std::ptr;

use tracing::debug;

use crate::error::{ConflictAbort, Result, SkeinError};
use crate::graph::{check_stride, Adjacency, EdgeValue, GraphFile};
use crate::mem::{align_up, AllocPolicy, Region};
use crate::runtime::conflict::{AccessMode, Iteration, Lockable, OwnerMark, RecordCell};

/// Node payload, conflict mark, and out-degree.
pub(crate) struct NodeRec<N> {
    pub(crate) mark: OwnerMark,
    pub(crate) data: RecordCell<N>,
    pub(crate) degree: u32,
}

impl<N> Lockable for NodeRec<N> {
    fn owner_mark(&self) -> &OwnerMark {
        &self.mark
    }
}

/// Destination and payload in one record.
pub(crate) struct EdgeRec<E> {
    pub(crate) dst: u32,
    pub(crate) value: RecordCell<E>,
}

/// Byte offset from a node record to its first edge record.
pub(crate) fn edges_offset<N, E: EdgeValue>() -> usize {
    align_up(size_of::<NodeRec<N>>(), align_of::<EdgeRec<E>>())
}

/// Arena bytes one node and its `degree` edge records occupy, rounded so the
/// next node record lands aligned.
pub(crate) fn node_footprint<N, E: EdgeValue>(degree: usize) -> Option<usize> {
    degree
        .checked_mul(size_of::<EdgeRec<E>>())
        .and_then(|edges| edges_offset::<N, E>().checked_add(edges))
        .map(|total| align_up(total, align_of::<NodeRec<N>>()))
}

/// One self-contained arena of node and edge records covering a contiguous
/// node-id range.
///
/// Built in two phases: [`Chunk::build_nodes`] lays out and constructs node
/// records, [`Chunk::build_edges`] fills the edge runs. `edges_done` tracks
/// how many nodes have complete edge runs so a drop after a failed or
/// partial build releases exactly what was constructed.
pub(crate) struct Chunk<N, E: EdgeValue> {
    arena: Option<Region>,
    offs: Vec<usize>,
    first: u32,
    edges_done: usize,
    _marker: PhantomData<(N, E)>,
}

// SAFETY: a chunk owns its arena; node and edge payloads cross threads only
// as values (Send) and shared access to the records is mediated by the
// conflict marks and `RecordCell`, which is Sync for Send payloads.
unsafe impl<N: Send, E: EdgeValue + Send> Send for Chunk<N, E> {}
// SAFETY: as above.
unsafe impl<N: Send, E: EdgeValue + Send> Sync for Chunk<N, E> {}

impl<N: Default, E: EdgeValue> Chunk<N, E> {
    /// Phase one: allocates the arena for `range` and constructs node
    /// records in place, recording each node's byte offset.
    pub(crate) fn build_nodes(
        file: &GraphFile,
        range: Range<u32>,
        policy: AllocPolicy,
    ) -> Result<Self> {
        let mut total = 0usize;
        for node in range.clone() {
            let footprint = node_footprint::<N, E>(file_degree(file, node))
                .and_then(|f| total.checked_add(f));
            total = footprint
                .ok_or_else(|| SkeinError::Format("chunk footprint overflows".into()))?;
        }
        let arena = if total == 0 {
            None
        } else {
            Some(Region::alloc(total, policy)?)
        };
        let mut chunk = Chunk {
            arena,
            offs: Vec::with_capacity(range.len()),
            first: range.start,
            edges_done: 0,
            _marker: PhantomData,
        };
        let mut cursor = 0usize;
        for node in range {
            let degree = file_degree(file, node);
            let rec = NodeRec {
                mark: OwnerMark::new(),
                data: RecordCell::new(N::default()),
                degree: degree as u32,
            };
            // SAFETY: `cursor` stays under the footprint sum the arena was
            // sized for, the slot is uninitialized, and strides keep every
            // node offset aligned for `NodeRec<N>`.
            unsafe { chunk.base().add(cursor).cast::<NodeRec<N>>().write(rec) };
            chunk.offs.push(cursor);
            cursor += node_footprint::<N, E>(degree).expect("footprint checked above");
        }
        Ok(chunk)
    }

    /// Phase two: constructs edge records, re-checking every destination
    /// against the node-id space while copying.
    pub(crate) fn build_edges(&mut self, file: &GraphFile) -> Result<()> {
        let limit = file.node_count() as u32;
        let run = edges_offset::<N, E>();
        for i in 0..self.offs.len() {
            let off = self.offs[i];
            let node = self.first + i as u32;
            for (k, idx) in file.edge_range(node).enumerate() {
                let dst = file.edge_dst(idx);
                if dst >= limit {
                    return Err(SkeinError::Format(format!(
                        "edge {idx} destination {dst} out of range (nodes: {limit})"
                    )));
                }
                let rec = EdgeRec {
                    dst,
                    value: RecordCell::new(file.edge_value::<E>(idx)),
                };
                // SAFETY: slot `k` of this node's edge run is inside the
                // arena (footprint covered `degree` records) and
                // uninitialized; the run start is aligned for `EdgeRec<E>`.
                unsafe {
                    self.base()
                        .add(off + run + k * size_of::<EdgeRec<E>>())
                        .cast::<EdgeRec<E>>()
                        .write(rec)
                };
            }
            self.edges_done = i + 1;
        }
        Ok(())
    }
}

impl<N, E: EdgeValue> Chunk<N, E> {
    /// Nodes in this chunk.
    pub(crate) fn len(&self) -> usize {
        self.offs.len()
    }

    /// First global node id covered by this chunk.
    pub(crate) fn first(&self) -> u32 {
        self.first
    }

    /// Arena byte offsets per node, in id order.
    pub(crate) fn offs(&self) -> &[usize] {
        &self.offs
    }

    fn base(&self) -> *mut u8 {
        self.arena
            .as_ref()
            .expect("empty chunk holds no records")
            .base()
    }

    fn check(&self, off: usize, size: usize) {
        let len = self.arena.as_ref().map_or(0, Region::len);
        assert!(
            off.checked_add(size).is_some_and(|end| end <= len),
            "record offset {off} out of arena bounds"
        );
    }

    /// Node record at a validated byte offset.
    pub(crate) fn node(&self, off: usize) -> &NodeRec<N> {
        self.check(off, size_of::<NodeRec<N>>());
        // SAFETY: bounds checked; node records stay at their construction
        // offsets for the chunk's lifetime.
        unsafe { &*self.base().add(off).cast() }
    }

    /// Exclusive node record access for quiescent phases.
    pub(crate) fn node_mut(&mut self, off: usize) -> &mut NodeRec<N> {
        self.check(off, size_of::<NodeRec<N>>());
        // SAFETY: as for `node`, plus `&mut self` gives exclusivity.
        unsafe { &mut *self.base().add(off).cast() }
    }

    /// Edge record at a validated byte offset.
    pub(crate) fn edge(&self, off: usize) -> &EdgeRec<E> {
        self.check(off, size_of::<EdgeRec<E>>());
        // SAFETY: as for `node`.
        unsafe { &*self.base().add(off).cast() }
    }

    /// Exclusive edge record access for quiescent phases.
    pub(crate) fn edge_mut(&mut self, off: usize) -> &mut EdgeRec<E> {
        self.check(off, size_of::<EdgeRec<E>>());
        // SAFETY: as for `node_mut`.
        unsafe { &mut *self.base().add(off).cast() }
    }
}

impl<N, E: EdgeValue> Drop for Chunk<N, E> {
    fn drop(&mut self) {
        let run = edges_offset::<N, E>();
        for i in 0..self.offs.len() {
            let off = self.offs[i];
            // SAFETY: node record `i` was constructed by `build_nodes`; its
            // edge run was constructed iff `i < edges_done`. Each record is
            // dropped exactly once, edges before their node.
            unsafe {
                let node: *mut NodeRec<N> = self.base().add(off).cast();
                if i < self.edges_done {
                    let degree = (*node).degree as usize;
                    ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                        self.base().add(off + run).cast::<EdgeRec<E>>(),
                        degree,
                    ));
                }
                ptr::drop_in_place(node);
            }
        }
    }
}

fn file_degree(file: &GraphFile, node: u32) -> usize {
    let range = file.edge_range(node);
    (range.end - range.start) as usize
}

/// Handle to a node of a linear-family graph: the node id plus its chunk and
/// arena offset, validated on every access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinearNode {
    pub(crate) id: u32,
    pub(crate) chunk: u32,
    pub(crate) off: usize,
}

impl LinearNode {
    /// The node's id in image order.
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Handle to one edge of a linear-family graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearEdge {
    pub(crate) src: u32,
    pub(crate) chunk: u32,
    pub(crate) off: usize,
}

impl LinearEdge {
    /// Source node id of the edge.
    pub fn src(&self) -> u32 {
        self.src
    }
}

/// Edge handles of one node, in stored adjacency order.
#[derive(Debug, Clone)]
pub struct LinearEdges {
    src: u32,
    chunk: u32,
    next: usize,
    stride: usize,
    remaining: u32,
}

impl LinearEdges {
    pub(crate) fn new(src: u32, chunk: u32, run: usize, stride: usize, count: u32) -> Self {
        LinearEdges {
            src,
            chunk,
            next: run,
            stride,
            remaining: count,
        }
    }
}

impl Iterator for LinearEdges {
    type Item = LinearEdge;

    fn next(&mut self) -> Option<LinearEdge> {
        if self.remaining == 0 {
            return None;
        }
        let edge = LinearEdge {
            src: self.src,
            chunk: self.chunk,
            off: self.next,
        };
        self.next += self.stride;
        self.remaining -= 1;
        Some(edge)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

/// Immutable-topology graph in one sequential arena.
pub struct LinearGraph<N, E: EdgeValue> {
    chunk: Chunk<N, E>,
    edge_count: usize,
}

impl<N: Default, E: EdgeValue> LinearGraph<N, E> {
    /// Builds the layout from a loaded image. Single-construction: topology
    /// is fixed from here on.
    pub fn build(file: &GraphFile, policy: AllocPolicy) -> Result<Self> {
        check_stride::<E>(file)?;
        let mut chunk = Chunk::build_nodes(file, 0..file.node_count() as u32, policy)?;
        chunk.build_edges(file)?;
        debug!(
            nodes = chunk.len(),
            edges = file.edge_count(),
            "built linear layout"
        );
        Ok(LinearGraph {
            chunk,
            edge_count: file.edge_count(),
        })
    }
}

impl<N, E: EdgeValue> LinearGraph<N, E> {
    /// Number of nodes.
    pub fn size(&self) -> usize {
        self.chunk.len()
    }

    /// Number of directed edges.
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Handle for node `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    pub fn node(&self, id: u32) -> LinearNode {
        LinearNode {
            id,
            chunk: 0,
            off: self.chunk.offs()[id as usize],
        }
    }

    /// Node handles in allocation (= id) order.
    pub fn nodes(&self) -> impl Iterator<Item = LinearNode> + '_ {
        self.chunk.offs().iter().enumerate().map(|(i, &off)| LinearNode {
            id: i as u32,
            chunk: 0,
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
        self.chunk.node_mut(node.off).data.get_mut()
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
            0,
            node.off + edges_offset::<N, E>(),
            size_of::<EdgeRec<E>>(),
            rec.degree,
        ))
    }

    /// Destination handle of `edge`.
    pub fn edge_dst(&self, edge: LinearEdge) -> LinearNode {
        self.validate_edge(edge);
        self.node(self.chunk.edge(edge.off).dst)
    }

    /// Acquires `edge`'s source node for `it` and returns the edge payload.
    pub fn edge_data<'a, 'i>(
        &'a self,
        it: &'i mut Iteration<'a>,
        edge: LinearEdge,
    ) -> Result<&'i mut E, ConflictAbort> {
        self.validate_edge(edge);
        let src_off = self.chunk.offs()[edge.src as usize];
        it.acquire(self.chunk.node(src_off), AccessMode::ReadWrite)?;
        // SAFETY: as for `data`; the source's mark covers its edge run.
        Ok(unsafe { &mut *self.chunk.edge(edge.off).value.get() })
    }

    /// Edge payload access that bypasses the source node's conflict mark.
    ///
    /// # Safety
    ///
    /// As for [`LinearGraph::data_unguarded`], applied to the edge's payload.
    pub unsafe fn edge_data_unguarded(&self, edge: LinearEdge) -> &mut E {
        self.validate_edge(edge);
        &mut *self.chunk.edge(edge.off).value.get()
    }

    /// Edge payload for quiescent phases.
    pub fn edge_data_mut(&mut self, edge: LinearEdge) -> &mut E {
        self.validate_edge(edge);
        self.chunk.edge_mut(edge.off).value.get_mut()
    }

    fn rec(&self, node: LinearNode) -> &NodeRec<N> {
        self.validate(node);
        self.chunk.node(node.off)
    }

    fn validate(&self, node: LinearNode) {
        assert!(
            node.chunk == 0 && self.chunk.offs().get(node.id as usize) == Some(&node.off),
            "stale or foreign node handle {node:?}"
        );
    }

    fn validate_edge(&self, edge: LinearEdge) {
        let src_off = self.chunk.offs()[edge.src as usize];
        let run = src_off + edges_offset::<N, E>();
        let degree = self.chunk.node(src_off).degree as usize;
        let stride = size_of::<EdgeRec<E>>();
        let rel = edge.off.checked_sub(run);
        assert!(
            edge.chunk == 0
                && rel.is_some_and(|rel| rel % stride == 0 && rel / stride < degree),
            "stale or foreign edge handle {edge:?}"
        );
    }
}

impl<N, E: EdgeValue> Adjacency for LinearGraph<N, E> {
    fn node_count(&self) -> usize {
        self.size()
    }

    fn edge_count(&self) -> usize {
        self.edge_count
    }

    fn neighbors(&self, node: u32) -> Vec<u32> {
        let off = self.chunk.offs()[node as usize];
        let degree = self.chunk.node(off).degree as usize;
        let run = off + edges_offset::<N, E>();
        (0..degree)
            .map(|k| self.chunk.edge(run + k * size_of::<EdgeRec<E>>()).dst)
            .collect()
    }

    fn degree(&self, node: u32) -> usize {
        let off = self.chunk.offs()[node as usize];
        self.chunk.node(off).degree as usize
    }
}

impl<N, E: EdgeValue> fmt::Debug for LinearGraph<N, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearGraph")
            .field("nodes", &self.size())
            .field("edges", &self.edge_count)
            .finish()
    }
}
