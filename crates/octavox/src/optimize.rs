//! Bottom-up tree optimization.
//!
//! Walks a built container from the root, collapsing every subtree whose
//! children all exist, are leaf-only and sit within a color threshold of
//! their parent. Survivors are rewritten level by level into per-level
//! temporary files, then concatenated with child indices relinked to their
//! global record positions.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::format::{
    self, OctreeFormat, OctreeHeader, FLAG_BIG_ENDIAN, FLAG_OPTIMIZED, HEADER_SIZE,
};
use crate::geom::Color;

/// Children per node a mergeable child may itself have. Zero: only
/// leaf-only subtrees collapse.
const LEAF_THRESHOLD: usize = 0;

/// Spill format for the per-level temporary files.
const TEMP_FORMAT: OctreeFormat = OctreeFormat::R8G8B8A8UnpackUI32;

/// In-memory marker for an absent child; written to disk as 0.
const ABSENT: u32 = u32::MAX;

/// Result of an optimization pass.
#[derive(Clone, Debug, Default)]
pub struct OptStatus {
    /// Number of subtrees collapsed into leaves.
    pub num_merged: u32,
    /// Byte offset of each tree level in the final file. Consumers can
    /// stream a prefix of the container down to a chosen level.
    pub mem_map: Vec<u64>,
}

struct OptPass<'a, R> {
    reader: &'a mut R,
    levels: Vec<File>,
    in_format: OctreeFormat,
    big_endian: bool,
    node_size: u64,
    color_threshold: f32,
    color_filter: bool,
    num_nodes: u64,
    num_leafs: u64,
    num_merged: u32,
}

/// Rewrite `reader` (a seekable, non-compressed container) into `writer`
/// in `output_format`, merging sub-trees whose colors sit within
/// `color_threshold`. With `color_filter`, leaves inherit their parent's
/// color, propagating flat regions.
pub fn optimize_tree<R, W>(
    reader: &mut R,
    writer: &mut W,
    output_format: OctreeFormat,
    color_threshold: f32,
    color_filter: bool,
) -> Result<OptStatus>
where
    R: Read + Seek,
    W: Write,
{
    let header = format::decode_header(reader)?;
    if header.compressed() {
        return Err(Error::InputIsCompressed);
    }

    let mut num_levels = 0;
    let mut width = 1u64;
    while width <= header.voxels_per_axis as u64 {
        num_levels += 1;
        width *= 2;
    }

    let mut pass = OptPass {
        reader,
        levels: (0..num_levels)
            .map(|_| tempfile::tempfile().map_err(Error::from))
            .collect::<Result<_>>()?,
        in_format: header.format,
        big_endian: header.big_endian(),
        node_size: header.format.node_size() as u64,
        color_threshold,
        color_filter,
        num_nodes: 0,
        num_leafs: 0,
        num_merged: 0,
    };

    if header.num_nodes > 0 {
        pass.opt_node(0, 0, Color::TRANSPARENT)?;
    }

    let mut out_header = OctreeHeader::new(output_format, header.voxels_per_axis);
    out_header.flags = (header.flags & !FLAG_BIG_ENDIAN) | FLAG_OPTIMIZED;
    out_header.num_nodes = pass.num_nodes;
    out_header.num_leafs = pass.num_leafs;
    format::encode_header(writer, &out_header)?;

    let mut status = OptStatus {
        num_merged: pass.num_merged,
        mem_map: vec![0; num_levels],
    };
    merge_levels(writer, pass.levels, output_format, &mut status)?;

    log::debug!(
        "optimize complete: {} nodes, {} leafs, {} merged",
        pass.num_nodes,
        pass.num_leafs,
        pass.num_merged
    );
    Ok(status)
}

impl<R: Read + Seek> OptPass<'_, R> {
    fn read_node(&mut self, index: u32) -> Result<(Color, [u32; 8])> {
        self.reader.seek(SeekFrom::Start(
            HEADER_SIZE as u64 + index as u64 * self.node_size,
        ))?;
        let mut color = Color::TRANSPARENT;
        let mut children = [0u32; 8];
        format::decode_node_with(
            self.reader,
            self.in_format,
            self.big_endian,
            &mut color,
            &mut children,
        )?;
        Ok((color, children))
    }

    /// Process the node at `index`, emit it into its level's spill file and
    /// return its within-level record index.
    fn opt_node(&mut self, index: u32, level: usize, parent_color: Color) -> Result<u32> {
        if level >= self.levels.len() {
            return Err(Error::InvalidFile);
        }

        let (color, mut children) = self.read_node(index)?;

        let mut merge = true;
        for slot in 0..8 {
            let child = children[slot];
            if child == 0 {
                merge = false;
                break;
            }
            let (child_color, grand_children) = self.read_node(child)?;
            if color.dist(child_color) > self.color_threshold {
                merge = false;
                break;
            }
            let occupied = grand_children.iter().filter(|&&gc| gc > 0).count();
            if occupied > LEAF_THRESHOLD {
                merge = false;
                break;
            }
        }

        let mut num_children = 0;
        if merge {
            self.num_merged += 1;
            children = [ABSENT; 8];
        } else {
            for slot in 0..8 {
                if children[slot] > 0 {
                    children[slot] = self.opt_node(children[slot], level + 1, color)?;
                    num_children += 1;
                } else {
                    children[slot] = ABSENT;
                }
            }
        }

        self.num_nodes += 1;
        let mut new_color = color;
        if num_children == 0 {
            self.num_leafs += 1;
            if self.color_filter {
                new_color = parent_color;
            }
        }

        let spill = &mut self.levels[level];
        let pos = spill.stream_position()?;
        format::encode_node(spill, TEMP_FORMAT, new_color, &children)?;
        Ok((pos / TEMP_FORMAT.node_size() as u64) as u32)
    }
}

/// Concatenate the per-level spill files into the output, converting
/// within-level child indices into global record indices. Children always
/// live on the next level, so a level's references are its successor's
/// global base plus the within-level index.
fn merge_levels<W: Write>(
    writer: &mut W,
    levels: Vec<File>,
    output_format: OctreeFormat,
    status: &mut OptStatus,
) -> Result<()> {
    let out_node_size = output_format.node_size() as u64;
    let temp_node_size = TEMP_FORMAT.node_size() as u64;
    let mut nodes_so_far = 0u64;

    for (level, mut spill) in levels.into_iter().enumerate() {
        let end = spill.seek(SeekFrom::End(0))?;
        spill.seek(SeekFrom::Start(0))?;
        let nodes_in_level = end / temp_node_size;
        let next_level_start = nodes_so_far + nodes_in_level;

        let mut color = Color::TRANSPARENT;
        let mut children = [0u32; 8];
        for _ in 0..nodes_in_level {
            format::decode_node(&mut spill, TEMP_FORMAT, &mut color, &mut children)?;
            for child in children.iter_mut() {
                if *child == ABSENT {
                    *child = 0;
                } else {
                    let global = next_level_start + *child as u64;
                    if global > output_format.max_index() as u64 {
                        return Err(Error::OctreeOverflow);
                    }
                    *child = global as u32;
                }
            }
            format::encode_node(writer, output_format, color, &children)?;
        }

        status.mem_map[level] = nodes_so_far * out_node_size + HEADER_SIZE as u64;
        nodes_so_far += nodes_in_level;
    }
    Ok(())
}
