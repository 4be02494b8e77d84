//! Immutable-topology graph storage: the on-disk image and four in-memory
//! layouts.
//!
//! A graph is loaded (or assembled) as a [`GraphFile`] image and then built
//! into one of four interchangeable layouts: [`CsrGraph`] (separate offset,
//! destination, and payload arrays), [`CsrInlineGraph`] (destination and
//! payload bundled per edge record), [`LinearGraph`] (node and edge records
//! back-to-back in one arena), and [`ChunkedLinearGraph`] (the linear layout
//! partitioned into per-worker chunks built in parallel). Topology is fixed
//! once built; node and edge payloads stay mutable through the
//! conflict-detection protocol.

pub mod chunked;
pub mod csr;
pub mod csr_inline;
pub mod file;
pub mod linear;

pub use chunked::{Balance, ChunkedLinearGraph};
pub use csr::{CsrGraph, EdgeRef};
pub use csr_inline::CsrInlineGraph;
pub use file::{GraphFile, GraphFileBuilder};
pub use linear::{LinearEdge, LinearGraph, LinearNode};

use crate::error::{Result, SkeinError};

/// Fixed-stride little-endian codec for edge payload elements.
///
/// The on-disk image stores edge payload as `num_edges` elements of
/// `edge_payload_size` bytes each; a layout built with payload type `E`
/// requires `E::STRIDE` to match that size. `STRIDE == 0` opts out of
/// payload entirely (the unit type), regardless of what the image carries.
pub trait EdgeValue: Sized {
    /// Encoded size in bytes of one element.
    const STRIDE: usize;

    /// Decodes one element from exactly [`EdgeValue::STRIDE`] bytes.
    fn decode(bytes: &[u8]) -> Self;

    /// Encodes this element into exactly [`EdgeValue::STRIDE`] bytes.
    fn encode(&self, out: &mut [u8]);
}

impl EdgeValue for () {
    const STRIDE: usize = 0;

    fn decode(_bytes: &[u8]) -> Self {}

    fn encode(&self, _out: &mut [u8]) {}
}

macro_rules! edge_value_primitive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl EdgeValue for $ty {
                const STRIDE: usize = std::mem::size_of::<$ty>();

                fn decode(bytes: &[u8]) -> Self {
                    <$ty>::from_le_bytes(bytes.try_into().expect("stride-sized slice"))
                }

                fn encode(&self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

edge_value_primitive!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Structure-inspection seam shared by the image and every layout.
///
/// Intentionally allocation-friendly: this is the surface validation and
/// tests compare layouts through, not the traversal hot path.
pub trait Adjacency {
    /// Number of nodes.
    fn node_count(&self) -> usize;

    /// Number of directed edges.
    fn edge_count(&self) -> usize;

    /// Out-neighbors of `node` in stored order.
    fn neighbors(&self, node: u32) -> Vec<u32>;

    /// Out-degree of `node`.
    fn degree(&self, node: u32) -> usize {
        self.neighbors(node).len()
    }

    /// Whether a `src -> dst` edge exists. Linear scan of `src`'s adjacency.
    fn has_edge(&self, src: u32, dst: u32) -> bool {
        self.neighbors(src).contains(&dst)
    }
}

/// Converts an image-sourced count to `usize`, failing on narrow platforms.
pub(crate) fn usize_from(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| SkeinError::Format(format!("count {value} exceeds the address space")))
}

/// Checks a layout's payload type against the image's element size.
///
/// `STRIDE == 0` opts out of payload and matches any image.
pub(crate) fn check_stride<E: EdgeValue>(file: &GraphFile) -> Result<()> {
    if E::STRIDE != 0 && E::STRIDE != file.edge_value_len() {
        return Err(SkeinError::Format(format!(
            "payload stride {} does not match the image's element size {}",
            E::STRIDE,
            file.edge_value_len()
        )));
    }
    Ok(())
}
