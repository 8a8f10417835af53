//! In-memory octree for traversal.
//!
//! On load every record is re-packed into eight u32 slots whose upper four
//! bits carry one nibble of the node color, leaving 28 bits per child
//! index. The tracer reads color and children straight out of this layout
//! regardless of the on-disk format.

use std::io::Read;

use flate2::read::ZlibDecoder;
use image::Rgba;
use octavox::format::{self, OctreeHeader};
use octavox::geom::Color;
use octavox::{Error, Result};

pub const MAX_UINT28: u32 = (1 << 28) - 1;

/// One packed node: child indices with stolen color nibbles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OctreeNode([u32; 8]);

impl OctreeNode {
    pub fn pack(color: Color, children: &[u32; 8]) -> Result<Self> {
        let bytes = color.to_rgba8();
        let mut slots = [0u32; 8];
        for (i, &child) in children.iter().enumerate() {
            if child > MAX_UINT28 {
                return Err(Error::OctreeOverflow);
            }
            let nibble = if i % 2 == 0 {
                ((bytes[i / 2] & 0xf0) as u32) << 24
            } else {
                ((bytes[i / 2] & 0x0f) as u32) << 28
            };
            slots[i] = nibble | child;
        }
        Ok(OctreeNode(slots))
    }

    pub fn child(&self, slot: usize) -> u32 {
        self.0[slot] & MAX_UINT28
    }

    /// The node color as an opaque render pixel.
    pub fn color(&self) -> Rgba<u8> {
        let byte = |even: usize| {
            (((self.0[even] >> 24) & 0xf0) | ((self.0[even + 1] >> 28) & 0x0f)) as u8
        };
        Rgba([byte(0), byte(2), byte(4), 255])
    }
}

/// A read-only tree shared by the render workers.
pub struct Octree {
    nodes: Vec<OctreeNode>,
    voxels_per_axis: u32,
}

impl Octree {
    /// Decode a container into traversal form. Compressed containers are
    /// decompressed transparently.
    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let header = format::decode_header(reader)?;
        if header.compressed() {
            let mut decoder = ZlibDecoder::new(reader);
            Self::load_nodes(&mut decoder, &header)
        } else {
            Self::load_nodes(reader, &header)
        }
    }

    fn load_nodes<R: Read>(reader: &mut R, header: &OctreeHeader) -> Result<Self> {
        let mut nodes = Vec::with_capacity(header.num_nodes as usize);
        let mut color = Color::TRANSPARENT;
        let mut children = [0u32; 8];
        for _ in 0..header.num_nodes {
            format::decode_node_with(
                reader,
                header.format,
                header.big_endian(),
                &mut color,
                &mut children,
            )?;
            nodes.push(OctreeNode::pack(color, &children)?);
        }
        log::debug!(
            "loaded octree: {} nodes, {} voxels per axis",
            nodes.len(),
            header.voxels_per_axis
        );
        Ok(Octree {
            nodes,
            voxels_per_axis: header.voxels_per_axis,
        })
    }

    /// Build a tree directly from decoded records. Record 0 is the root.
    pub fn from_records(records: &[(Color, [u32; 8])], voxels_per_axis: u32) -> Result<Self> {
        let nodes = records
            .iter()
            .map(|(color, children)| OctreeNode::pack(*color, children))
            .collect::<Result<_>>()?;
        Ok(Octree {
            nodes,
            voxels_per_axis,
        })
    }

    pub fn node(&self, index: u32) -> &OctreeNode {
        &self.nodes[index as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn voxels_per_axis(&self) -> u32 {
        self.voxels_per_axis
    }

    /// Recursion cap for traversal: `ceil(log2(voxels_per_axis)) + 1`.
    pub fn max_depth(&self) -> u32 {
        width_to_depth(self.voxels_per_axis)
    }
}

/// Number of octree levels needed for `width` voxels per axis.
pub fn width_to_depth(width: u32) -> u32 {
    32 - width.leading_zeros()
}
