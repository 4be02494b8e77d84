//! Versioned on-disk graph image and its loader.
//!
//! The image is little-endian throughout:
//!
//! ```text
//! u64 version              (=1)
//! u64 edge_payload_size    (bytes per edge payload element; 0 = none)
//! u64 num_nodes
//! u64 num_edges
//! u64 offset[num_nodes]    (offset[i] = exclusive end of node i's out-edges)
//! u32 dest[num_edges]
//! <pad to 8-byte alignment>
//! u8  edge_payload[num_edges * edge_payload_size]
//! ```
//!
//! Loading validates the header and the offset table but deliberately does
//! not scan the destination table; [`GraphFile::verify`] performs that scan
//! on demand, and layout construction re-checks destinations while copying.

#![allow(unsafe_code)]

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::ops::Range;
use std::path::Path;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::error::{Result, SkeinError};
use crate::graph::{usize_from, Adjacency, EdgeValue};
use crate::mem::align_up;

const VERSION: u64 = 1;
const HEADER_LEN: usize = 32;

/// Backing bytes of an image: a read-only file mapping or an owned buffer.
enum Image {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Image {
    fn bytes(&self) -> &[u8] {
        match self {
            Image::Mapped(map) => map,
            Image::Owned(buf) => buf,
        }
    }
}

/// A parsed, immutable on-disk graph image.
///
/// The image is shareable across threads once loaded; everything it exposes
/// is read-only. For a mapped image the caller must keep the underlying file
/// unmodified for the `GraphFile`'s lifetime.
pub struct GraphFile {
    image: Image,
    nodes: usize,
    edges: usize,
    stride: usize,
    dest_base: usize,
    payload_base: usize,
}

impl GraphFile {
    /// Opens `path` and maps it read-only (zero-copy).
    pub fn load(path: impl AsRef<Path>) -> Result<GraphFile> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only; the documented caller obligation
        // is to leave the file untouched while the image is live.
        let map = unsafe { Mmap::map(&file)? };
        let graph = Self::parse(Image::Mapped(map))?;
        debug!(
            path = %path.display(),
            nodes = graph.nodes,
            edges = graph.edges,
            "mapped graph image"
        );
        Ok(graph)
    }

    /// Parses a copy of `bytes` as an image.
    pub fn from_bytes(bytes: &[u8]) -> Result<GraphFile> {
        Self::from_owned(bytes.to_vec())
    }

    /// Parses `bytes` as an image, taking the buffer as-is.
    pub fn from_owned(bytes: Vec<u8>) -> Result<GraphFile> {
        Self::parse(Image::Owned(bytes))
    }

    fn parse(image: Image) -> Result<GraphFile> {
        let bytes = image.bytes();
        if bytes.len() < HEADER_LEN {
            return Err(SkeinError::Format(format!(
                "image of {} bytes is shorter than the {HEADER_LEN}-byte header",
                bytes.len()
            )));
        }
        let version = read_u64(bytes, 0);
        if version != VERSION {
            return Err(SkeinError::Format(format!(
                "unsupported image version {version} (expected {VERSION})"
            )));
        }
        let stride = usize_from(read_u64(bytes, 8))?;
        let raw_nodes = read_u64(bytes, 16);
        if raw_nodes > u64::from(u32::MAX) {
            return Err(SkeinError::Format(format!(
                "node count {raw_nodes} exceeds the 32-bit id space"
            )));
        }
        let nodes = usize_from(raw_nodes)?;
        let edges = usize_from(read_u64(bytes, 24))?;

        let dest_base = checked_len(HEADER_LEN, nodes, 8)?;
        let dest_end = checked_len(dest_base, edges, 4)?;
        let payload_base = align_up(dest_end, 8);
        let total = checked_len(payload_base, edges, stride)?;
        if bytes.len() < total {
            return Err(SkeinError::Format(format!(
                "image truncated: {} bytes, {total} expected",
                bytes.len()
            )));
        }
        if bytes.len() > total {
            warn!(
                trailing = bytes.len() - total,
                "image carries trailing bytes past the payload table"
            );
        }

        let graph = GraphFile {
            image,
            nodes,
            edges,
            stride,
            dest_base,
            payload_base,
        };
        let mut prev = 0u64;
        for (i, off) in graph.edge_offsets().enumerate() {
            if off < prev {
                return Err(SkeinError::Format(format!(
                    "offset table decreases at node {i}: {off} after {prev}"
                )));
            }
            prev = off;
        }
        if prev != edges as u64 {
            return Err(SkeinError::Format(format!(
                "offset table ends at {prev}, edge count is {edges}"
            )));
        }
        Ok(graph)
    }

    /// Serializes the image verbatim and syncs it to disk.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path.as_ref())?;
        file.write_all(self.bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// The raw image bytes.
    pub fn bytes(&self) -> &[u8] {
        self.image.bytes()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes
    }

    /// Number of directed edges.
    pub fn edge_count(&self) -> usize {
        self.edges
    }

    /// Bytes per edge payload element (0 = no payload).
    pub fn edge_value_len(&self) -> usize {
        self.stride
    }

    /// Global edge-index range of `node`'s out-edges.
    ///
    /// # Panics
    ///
    /// Panics if `node` is out of range.
    pub fn edge_range(&self, node: u32) -> Range<u64> {
        let idx = node as usize;
        assert!(idx < self.nodes, "node {node} out of range");
        let begin = if idx == 0 { 0 } else { self.offset(idx - 1) };
        begin..self.offset(idx)
    }

    /// Destination of edge `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of range.
    pub fn edge_dst(&self, idx: u64) -> u32 {
        assert!(idx < self.edges as u64, "edge {idx} out of range");
        read_u32(self.bytes(), self.dest_base + idx as usize * 4)
    }

    /// Out-neighbors of `node` in stored order.
    pub fn neighbors(&self, node: u32) -> impl Iterator<Item = u32> + '_ {
        self.edge_range(node).map(move |idx| self.edge_dst(idx))
    }

    /// Raw payload bytes of edge `idx` (empty when the image has none).
    pub fn edge_bytes(&self, idx: u64) -> &[u8] {
        assert!(idx < self.edges as u64, "edge {idx} out of range");
        let at = self.payload_base + idx as usize * self.stride;
        &self.bytes()[at..at + self.stride]
    }

    /// Decodes the payload of edge `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `E::STRIDE` is nonzero and differs from the image's payload
    /// element size.
    pub fn edge_value<E: EdgeValue>(&self, idx: u64) -> E {
        if E::STRIDE == 0 {
            return E::decode(&[]);
        }
        assert_eq!(
            E::STRIDE,
            self.stride,
            "payload stride mismatch against the image"
        );
        E::decode(self.edge_bytes(idx))
    }

    /// The raw offset table, one exclusive end per node.
    pub fn edge_offsets(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.nodes).map(move |i| self.offset(i))
    }

    /// Full-image destination scan: every `dest[i] < num_nodes`.
    ///
    /// Load-time validation skips this for performance; call it when the
    /// input is untrusted.
    pub fn verify(&self) -> Result<()> {
        let limit = self.nodes as u32;
        for idx in 0..self.edges as u64 {
            let dst = self.edge_dst(idx);
            if dst >= limit {
                return Err(SkeinError::Format(format!(
                    "edge {idx} destination {dst} out of range (nodes: {limit})"
                )));
            }
        }
        Ok(())
    }

    fn offset(&self, node: usize) -> u64 {
        read_u64(self.bytes(), HEADER_LEN + node * 8)
    }
}

impl Clone for GraphFile {
    /// Clones the image into an owned heap copy; a mapped image detaches
    /// from its file.
    fn clone(&self) -> Self {
        GraphFile {
            image: Image::Owned(self.bytes().to_vec()),
            nodes: self.nodes,
            edges: self.edges,
            stride: self.stride,
            dest_base: self.dest_base,
            payload_base: self.payload_base,
        }
    }
}

impl Adjacency for GraphFile {
    fn node_count(&self) -> usize {
        self.nodes
    }

    fn edge_count(&self) -> usize {
        self.edges
    }

    fn neighbors(&self, node: u32) -> Vec<u32> {
        GraphFile::neighbors(self, node).collect()
    }

    fn degree(&self, node: u32) -> usize {
        let range = self.edge_range(node);
        (range.end - range.start) as usize
    }

    fn has_edge(&self, src: u32, dst: u32) -> bool {
        GraphFile::neighbors(self, src).any(|d| d == dst)
    }
}

impl fmt::Debug for GraphFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphFile")
            .field("nodes", &self.nodes)
            .field("edges", &self.edges)
            .field("stride", &self.stride)
            .field(
                "mapped",
                &matches!(self.image, Image::Mapped(_)),
            )
            .finish()
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().expect("8-byte slice"))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().expect("4-byte slice"))
}

fn checked_len(base: usize, count: usize, elem: usize) -> Result<usize> {
    count
        .checked_mul(elem)
        .and_then(|table| base.checked_add(table))
        .ok_or_else(|| SkeinError::Format("image size arithmetic overflows".into()))
}

/// In-memory image assembly for tests and tooling.
///
/// Nodes are added first, then edges in any order; [`GraphFileBuilder::build`]
/// sorts nothing — edges serialize grouped by source in insertion order,
/// which is the stored adjacency order.
pub struct GraphFileBuilder<E: EdgeValue> {
    adjacency: Vec<Vec<(u32, E)>>,
}

impl<E: EdgeValue> GraphFileBuilder<E> {
    /// An empty builder.
    pub fn new() -> Self {
        GraphFileBuilder {
            adjacency: Vec::new(),
        }
    }

    /// Adds a node and returns its id.
    pub fn add_node(&mut self) -> u32 {
        let id = self.adjacency.len() as u32;
        self.adjacency.push(Vec::new());
        id
    }

    /// Adds a `src -> dst` edge carrying `value`.
    pub fn add_edge(&mut self, src: u32, dst: u32, value: E) -> Result<()> {
        let nodes = self.adjacency.len() as u32;
        if src >= nodes || dst >= nodes {
            return Err(SkeinError::InvalidArgument(format!(
                "edge {src} -> {dst} references a missing node (nodes: {nodes})"
            )));
        }
        self.adjacency[src as usize].push((dst, value));
        Ok(())
    }

    /// Serializes the accumulated graph into an owned image.
    pub fn build(self) -> Result<GraphFile> {
        let nodes = self.adjacency.len();
        let edges: usize = self.adjacency.iter().map(Vec::len).sum();
        let dest_base = checked_len(HEADER_LEN, nodes, 8)?;
        let dest_end = checked_len(dest_base, edges, 4)?;
        let payload_base = align_up(dest_end, 8);
        let total = checked_len(payload_base, edges, E::STRIDE)?;

        let mut bytes = vec![0u8; total];
        bytes[0..8].copy_from_slice(&VERSION.to_le_bytes());
        bytes[8..16].copy_from_slice(&(E::STRIDE as u64).to_le_bytes());
        bytes[16..24].copy_from_slice(&(nodes as u64).to_le_bytes());
        bytes[24..32].copy_from_slice(&(edges as u64).to_le_bytes());

        let mut cursor = 0u64;
        for (i, list) in self.adjacency.iter().enumerate() {
            cursor += list.len() as u64;
            let at = HEADER_LEN + i * 8;
            bytes[at..at + 8].copy_from_slice(&cursor.to_le_bytes());
        }
        let mut edge = 0usize;
        for list in &self.adjacency {
            for (dst, value) in list {
                let at = dest_base + edge * 4;
                bytes[at..at + 4].copy_from_slice(&dst.to_le_bytes());
                if E::STRIDE > 0 {
                    let at = payload_base + edge * E::STRIDE;
                    value.encode(&mut bytes[at..at + E::STRIDE]);
                }
                edge += 1;
            }
        }
        GraphFile::from_owned(bytes)
    }
}

impl<E: EdgeValue> Default for GraphFileBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}
