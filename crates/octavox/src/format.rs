//! On-disk node formats: header I/O, per-format node encode/decode, child
//! slot patching, transcoding and stream compression.
//!
//! A container is a 28-byte header followed by `num_nodes` fixed-width node
//! records. Child indices stored in a record are node-record indices into
//! that array, never byte offsets; 0 means "absent" and record 0 is always
//! the root. Payload is little-endian unless the big-endian header flag is
//! set; writers always emit little-endian.

use std::io::{self, Read, Seek, SeekFrom, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::geom::Color;

/// Container signature: an escape byte followed by "oct".
pub const SIGNATURE: [u8; 4] = [0x1b, b'o', b'c', b't'];
pub const VERSION: u8 = 0;
pub const HEADER_SIZE: usize = 28;

pub const FLAG_BIG_ENDIAN: u8 = 0x1;
pub const FLAG_COMPRESSED: u8 = 0x2;
pub const FLAG_OPTIMIZED: u8 = 0x4;

const MAX_UINT28: u32 = (1 << 28) - 1;
const MAX_UINT30: u32 = (1 << 30) - 1;
const MAX_UINT31: u32 = (1u32 << 31) - 1;

/// The supported node packings. The `Unpack` variants store the color ahead
/// of eight plain child indices; the `Pack` variants steal the top bits of
/// eight u32 child slots for the color.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OctreeFormat {
    R8G8B8A8UnpackUI32,
    R8G8B8A8UnpackUI16,
    R4G4B4A4UnpackUI16,
    R5G6B5UnpackUI16,
    R8G8B8A8PackUI28,
    R4G4B4A4PackUI30,
    R5G6B5PackUI30,
    R3G3B2PackUI31,
    /// Build-time accumulation format: per-channel u64 sums plus a sample
    /// count. Never a valid target for `encode_node`.
    R64G64B64A64S64UnpackUI32,
}

impl OctreeFormat {
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => OctreeFormat::R8G8B8A8UnpackUI32,
            1 => OctreeFormat::R8G8B8A8UnpackUI16,
            2 => OctreeFormat::R4G4B4A4UnpackUI16,
            3 => OctreeFormat::R5G6B5UnpackUI16,
            4 => OctreeFormat::R8G8B8A8PackUI28,
            5 => OctreeFormat::R4G4B4A4PackUI30,
            6 => OctreeFormat::R5G6B5PackUI30,
            7 => OctreeFormat::R3G3B2PackUI31,
            8 => OctreeFormat::R64G64B64A64S64UnpackUI32,
            _ => return Err(Error::UnsupportedFormat),
        })
    }

    pub fn code(self) -> u8 {
        match self {
            OctreeFormat::R8G8B8A8UnpackUI32 => 0,
            OctreeFormat::R8G8B8A8UnpackUI16 => 1,
            OctreeFormat::R4G4B4A4UnpackUI16 => 2,
            OctreeFormat::R5G6B5UnpackUI16 => 3,
            OctreeFormat::R8G8B8A8PackUI28 => 4,
            OctreeFormat::R4G4B4A4PackUI30 => 5,
            OctreeFormat::R5G6B5PackUI30 => 6,
            OctreeFormat::R3G3B2PackUI31 => 7,
            OctreeFormat::R64G64B64A64S64UnpackUI32 => 8,
        }
    }

    /// Bytes of color stored ahead of the child slots. Zero for the packed
    /// formats, which steal bits from the slots instead.
    pub fn color_size(self) -> usize {
        match self {
            OctreeFormat::R8G8B8A8UnpackUI32 | OctreeFormat::R8G8B8A8UnpackUI16 => 4,
            OctreeFormat::R4G4B4A4UnpackUI16 | OctreeFormat::R5G6B5UnpackUI16 => 2,
            OctreeFormat::R8G8B8A8PackUI28
            | OctreeFormat::R4G4B4A4PackUI30
            | OctreeFormat::R5G6B5PackUI30
            | OctreeFormat::R3G3B2PackUI31 => 0,
            OctreeFormat::R64G64B64A64S64UnpackUI32 => 40,
        }
    }

    /// Bytes per child slot.
    pub fn index_size(self) -> usize {
        match self {
            OctreeFormat::R8G8B8A8UnpackUI16
            | OctreeFormat::R4G4B4A4UnpackUI16
            | OctreeFormat::R5G6B5UnpackUI16 => 2,
            _ => 4,
        }
    }

    pub fn node_size(self) -> usize {
        self.color_size() + self.index_size() * 8
    }

    /// Largest child index the format can carry.
    pub fn max_index(self) -> u32 {
        match self {
            OctreeFormat::R8G8B8A8UnpackUI32 | OctreeFormat::R64G64B64A64S64UnpackUI32 => u32::MAX,
            OctreeFormat::R8G8B8A8UnpackUI16
            | OctreeFormat::R4G4B4A4UnpackUI16
            | OctreeFormat::R5G6B5UnpackUI16 => u16::MAX as u32,
            OctreeFormat::R8G8B8A8PackUI28 => MAX_UINT28,
            OctreeFormat::R4G4B4A4PackUI30 | OctreeFormat::R5G6B5PackUI30 => MAX_UINT30,
            OctreeFormat::R3G3B2PackUI31 => MAX_UINT31,
        }
    }

    /// Bit mask of the color bits stolen from each u32 child slot.
    fn color_mask(self) -> u32 {
        match self {
            OctreeFormat::R8G8B8A8PackUI28 => 0xf000_0000,
            OctreeFormat::R4G4B4A4PackUI30 | OctreeFormat::R5G6B5PackUI30 => 0xc000_0000,
            OctreeFormat::R3G3B2PackUI31 => 0x8000_0000,
            _ => 0,
        }
    }
}

/// Fixed-size container header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OctreeHeader {
    pub format: OctreeFormat,
    pub flags: u8,
    pub num_nodes: u64,
    pub num_leafs: u64,
    pub voxels_per_axis: u32,
}

impl OctreeHeader {
    pub fn new(format: OctreeFormat, voxels_per_axis: u32) -> Self {
        OctreeHeader {
            format,
            flags: 0,
            num_nodes: 0,
            num_leafs: 0,
            voxels_per_axis,
        }
    }

    pub fn big_endian(&self) -> bool {
        self.flags & FLAG_BIG_ENDIAN != 0
    }

    pub fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn optimized(&self) -> bool {
        self.flags & FLAG_OPTIMIZED != 0
    }
}

pub fn encode_header<W: Write>(writer: &mut W, header: &OctreeHeader) -> Result<()> {
    writer.write_all(&SIGNATURE)?;
    writer.write_all(&[VERSION, header.format.code(), header.flags, 0])?;
    writer.write_all(&header.num_nodes.to_le_bytes())?;
    writer.write_all(&header.num_leafs.to_le_bytes())?;
    writer.write_all(&header.voxels_per_axis.to_le_bytes())?;
    Ok(())
}

pub fn decode_header<R: Read>(reader: &mut R) -> Result<OctreeHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut buf)?;

    if buf[0..4] != SIGNATURE || buf[4] != VERSION || buf[7] != 0 {
        return Err(Error::InvalidFile);
    }

    let format = OctreeFormat::from_code(buf[5])?;
    let flags = buf[6];
    let be = flags & FLAG_BIG_ENDIAN != 0;

    let u64_at = |off: usize| {
        let bytes: [u8; 8] = buf[off..off + 8].try_into().unwrap();
        if be {
            u64::from_be_bytes(bytes)
        } else {
            u64::from_le_bytes(bytes)
        }
    };
    let bytes: [u8; 4] = buf[24..28].try_into().unwrap();
    let voxels_per_axis = if be {
        u32::from_be_bytes(bytes)
    } else {
        u32::from_le_bytes(bytes)
    };

    if voxels_per_axis == 0 || !voxels_per_axis.is_power_of_two() {
        return Err(Error::InvalidFile);
    }

    Ok(OctreeHeader {
        format,
        flags,
        num_nodes: u64_at(8),
        num_leafs: u64_at(16),
        voxels_per_axis,
    })
}

fn read_u16<R: Read>(reader: &mut R, be: bool) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(if be {
        u16::from_be_bytes(buf)
    } else {
        u16::from_le_bytes(buf)
    })
}

fn read_u32<R: Read>(reader: &mut R, be: bool) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(if be {
        u32::from_be_bytes(buf)
    } else {
        u32::from_le_bytes(buf)
    })
}

fn read_u64<R: Read>(reader: &mut R, be: bool) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(if be {
        u64::from_be_bytes(buf)
    } else {
        u64::from_le_bytes(buf)
    })
}

/// Decode one node record in little-endian byte order.
pub fn decode_node<R: Read>(
    reader: &mut R,
    format: OctreeFormat,
    color: &mut Color,
    children: &mut [u32; 8],
) -> Result<()> {
    decode_node_with(reader, format, false, color, children)
}

/// Decode one node record, honoring the container's byte-order flag.
pub fn decode_node_with<R: Read>(
    reader: &mut R,
    format: OctreeFormat,
    big_endian: bool,
    color: &mut Color,
    children: &mut [u32; 8],
) -> Result<()> {
    match format {
        OctreeFormat::R8G8B8A8UnpackUI32 => {
            let mut col = [0u8; 4];
            reader.read_exact(&mut col)?;
            *color = Color::from_rgba8(col);
            for child in children.iter_mut() {
                *child = read_u32(reader, big_endian)?;
            }
        }
        OctreeFormat::R8G8B8A8UnpackUI16 => {
            let mut col = [0u8; 4];
            reader.read_exact(&mut col)?;
            *color = Color::from_rgba8(col);
            for child in children.iter_mut() {
                *child = read_u16(reader, big_endian)? as u32;
            }
        }
        OctreeFormat::R4G4B4A4UnpackUI16 => {
            let col = read_u16(reader, big_endian)?;
            color.r = ((col & 0xf000) >> 12) as f32 / 15.0;
            color.g = ((col & 0x0f00) >> 8) as f32 / 15.0;
            color.b = ((col & 0x00f0) >> 4) as f32 / 15.0;
            color.a = (col & 0x000f) as f32 / 15.0;
            for child in children.iter_mut() {
                *child = read_u16(reader, big_endian)? as u32;
            }
        }
        OctreeFormat::R5G6B5UnpackUI16 => {
            let col = read_u16(reader, big_endian)?;
            color.r = ((col & 0xf800) >> 11) as f32 / 31.0;
            color.g = ((col & 0x07e0) >> 5) as f32 / 63.0;
            color.b = (col & 0x001f) as f32 / 31.0;
            color.a = 1.0;
            for child in children.iter_mut() {
                *child = read_u16(reader, big_endian)? as u32;
            }
        }
        OctreeFormat::R64G64B64A64S64UnpackUI32 => {
            let mut sums = [0u64; 5];
            for sum in sums.iter_mut() {
                *sum = read_u64(reader, big_endian)?;
            }
            let count = sums[4];
            if count == 0 {
                *color = Color::TRANSPARENT;
            } else {
                for i in 0..4 {
                    color.set_component(i, (sums[i] as f64 / count as f64 / 255.0) as f32);
                }
            }
            for child in children.iter_mut() {
                *child = read_u32(reader, big_endian)?;
            }
        }
        OctreeFormat::R8G8B8A8PackUI28 => {
            // Child i's slot carries one nibble of color byte i/2: the high
            // nibble in bits 28..31 for even i, the low nibble for odd i.
            let mut byte = 0u8;
            for (i, child) in children.iter_mut().enumerate() {
                let component = read_u32(reader, big_endian)?;
                if i % 2 == 0 {
                    byte = ((component >> 24) & 0xf0) as u8;
                } else {
                    byte |= ((component >> 28) & 0x0f) as u8;
                    color.set_component(i / 2, byte as f32 / 255.0);
                }
                *child = component & 0x0fff_ffff;
            }
        }
        OctreeFormat::R4G4B4A4PackUI30 | OctreeFormat::R5G6B5PackUI30 => {
            // Slot i's top two bits hold bits (14 - 2i)..(15 - 2i) of a
            // 16-bit packed color.
            let mut packed = 0u16;
            for (i, child) in children.iter_mut().enumerate() {
                let component = read_u32(reader, big_endian)?;
                packed |= ((component & 0xc000_0000) >> (16 + 2 * i)) as u16;
                *child = component & 0x3fff_ffff;
            }
            if format == OctreeFormat::R4G4B4A4PackUI30 {
                color.r = ((packed & 0xf000) >> 12) as f32 / 15.0;
                color.g = ((packed & 0x0f00) >> 8) as f32 / 15.0;
                color.b = ((packed & 0x00f0) >> 4) as f32 / 15.0;
                color.a = (packed & 0x000f) as f32 / 15.0;
            } else {
                color.r = ((packed & 0xf800) >> 11) as f32 / 31.0;
                color.g = ((packed & 0x07e0) >> 5) as f32 / 63.0;
                color.b = (packed & 0x001f) as f32 / 31.0;
                color.a = 1.0;
            }
        }
        OctreeFormat::R3G3B2PackUI31 => {
            // Slot i's top bit holds bit (7 - i) of an RGB332 byte.
            let mut packed = 0u8;
            for (i, child) in children.iter_mut().enumerate() {
                let component = read_u32(reader, big_endian)?;
                packed |= ((component & 0x8000_0000) >> (24 + i)) as u8;
                *child = component & 0x7fff_ffff;
            }
            color.r = ((packed & 0xe0) >> 5) as f32 / 7.0;
            color.g = ((packed & 0x1c) >> 2) as f32 / 7.0;
            color.b = (packed & 0x03) as f32 / 3.0;
            color.a = 1.0;
        }
    }
    Ok(())
}

fn write_packed_color_u16<W: Write>(writer: &mut W, format: OctreeFormat, color: Color) -> Result<()> {
    let packed = match format {
        OctreeFormat::R4G4B4A4UnpackUI16 => pack_rgba4444(color),
        OctreeFormat::R5G6B5UnpackUI16 => pack_rgb565(color),
        _ => return Err(Error::UnsupportedFormat),
    };
    writer.write_all(&packed.to_le_bytes())?;
    Ok(())
}

fn pack_rgba4444(color: Color) -> u16 {
    let q = |v: f32| (v.clamp(0.0, 1.0) * 15.0).round() as u16;
    (q(color.r) << 12) | (q(color.g) << 8) | (q(color.b) << 4) | q(color.a)
}

fn pack_rgb565(color: Color) -> u16 {
    let r = (color.r.clamp(0.0, 1.0) * 31.0).round() as u16;
    let g = (color.g.clamp(0.0, 1.0) * 63.0).round() as u16;
    let b = (color.b.clamp(0.0, 1.0) * 31.0).round() as u16;
    (r << 11) | (g << 5) | b
}

fn pack_rgb332(color: Color) -> u8 {
    let r = (color.r.clamp(0.0, 1.0) * 7.0).round() as u8;
    let g = (color.g.clamp(0.0, 1.0) * 7.0).round() as u8;
    let b = (color.b.clamp(0.0, 1.0) * 3.0).round() as u8;
    (r << 5) | (g << 2) | b
}

/// Encode one node record in little-endian byte order. Fails with
/// [`Error::OctreeOverflow`] if any child index exceeds the format's payload
/// width. The internal accumulation format is not a valid target.
pub fn encode_node<W: Write>(
    writer: &mut W,
    format: OctreeFormat,
    color: Color,
    children: &[u32; 8],
) -> Result<()> {
    match format {
        OctreeFormat::R8G8B8A8UnpackUI32 => {
            writer.write_all(&color.to_rgba8())?;
            for &child in children {
                writer.write_all(&child.to_le_bytes())?;
            }
        }
        OctreeFormat::R8G8B8A8UnpackUI16
        | OctreeFormat::R4G4B4A4UnpackUI16
        | OctreeFormat::R5G6B5UnpackUI16 => {
            if format == OctreeFormat::R8G8B8A8UnpackUI16 {
                writer.write_all(&color.to_rgba8())?;
            } else {
                write_packed_color_u16(writer, format, color)?;
            }
            for &child in children {
                if child > u16::MAX as u32 {
                    return Err(Error::OctreeOverflow);
                }
                writer.write_all(&(child as u16).to_le_bytes())?;
            }
        }
        OctreeFormat::R8G8B8A8PackUI28 => {
            let bytes = color.to_rgba8();
            for (i, &child) in children.iter().enumerate() {
                if child > MAX_UINT28 {
                    return Err(Error::OctreeOverflow);
                }
                let nibble = if i % 2 == 0 {
                    ((bytes[i / 2] & 0xf0) as u32) << 24
                } else {
                    ((bytes[i / 2] & 0x0f) as u32) << 28
                };
                writer.write_all(&(nibble | child).to_le_bytes())?;
            }
        }
        OctreeFormat::R4G4B4A4PackUI30 | OctreeFormat::R5G6B5PackUI30 => {
            let packed = if format == OctreeFormat::R4G4B4A4PackUI30 {
                pack_rgba4444(color)
            } else {
                pack_rgb565(color)
            };
            for (i, &child) in children.iter().enumerate() {
                if child > MAX_UINT30 {
                    return Err(Error::OctreeOverflow);
                }
                let bits = ((packed as u32) << (16 + 2 * i)) & 0xc000_0000;
                writer.write_all(&(bits | child).to_le_bytes())?;
            }
        }
        OctreeFormat::R3G3B2PackUI31 => {
            let packed = pack_rgb332(color);
            for (i, &child) in children.iter().enumerate() {
                if child > MAX_UINT31 {
                    return Err(Error::OctreeOverflow);
                }
                let bits = ((packed as u32) << (24 + i)) & 0x8000_0000;
                writer.write_all(&(bits | child).to_le_bytes())?;
            }
        }
        OctreeFormat::R64G64B64A64S64UnpackUI32 => return Err(Error::UnsupportedFormat),
    }
    Ok(())
}

/// Install a child's record index into one slot of an already-written parent
/// record, preserving any color bits the format stores in that slot. The
/// writer position is restored afterwards.
pub fn patch_child_slot<W: Read + Write + Seek>(
    writer: &mut W,
    format: OctreeFormat,
    parent_offset: u64,
    slot: usize,
    index: u32,
) -> Result<()> {
    debug_assert!(slot < 8);
    if index > format.max_index() {
        return Err(Error::OctreeOverflow);
    }

    let pos = parent_offset + format.color_size() as u64 + (slot * format.index_size()) as u64;
    let restore = writer.stream_position()?;
    writer.seek(SeekFrom::Start(pos))?;

    if format.index_size() == 2 {
        writer.write_all(&(index as u16).to_le_bytes())?;
    } else if format.color_mask() != 0 {
        let mut buf = [0u8; 4];
        writer.read_exact(&mut buf)?;
        let slot_bits = u32::from_le_bytes(buf) & format.color_mask();
        writer.seek(SeekFrom::Start(pos))?;
        writer.write_all(&(slot_bits | index).to_le_bytes())?;
    } else {
        writer.write_all(&index.to_le_bytes())?;
    }

    writer.seek(SeekFrom::Start(restore))?;
    Ok(())
}

fn copy_nodes<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    in_format: OctreeFormat,
    big_endian: bool,
    out_format: OctreeFormat,
    num_nodes: u64,
) -> Result<()> {
    let mut color = Color::TRANSPARENT;
    let mut children = [0u32; 8];
    for _ in 0..num_nodes {
        decode_node_with(reader, in_format, big_endian, &mut color, &mut children)?;
        encode_node(writer, out_format, color, &children)?;
    }
    Ok(())
}

/// Re-encode every node of a container into `format`, decompressing the
/// input and recompressing the output transparently when the header carries
/// the compressed flag.
pub fn transcode_tree<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    format: OctreeFormat,
) -> Result<()> {
    let mut header = decode_header(reader)?;
    let in_format = header.format;
    let big_endian = header.big_endian();

    header.format = format;
    header.flags &= !FLAG_BIG_ENDIAN;
    encode_header(writer, &header)?;

    if header.compressed() {
        let mut src = ZlibDecoder::new(reader);
        let mut dst = ZlibEncoder::new(writer, Compression::default());
        copy_nodes(&mut src, &mut dst, in_format, big_endian, format, header.num_nodes)?;
        dst.finish()?;
    } else {
        copy_nodes(reader, writer, in_format, big_endian, format, header.num_nodes)?;
    }
    Ok(())
}

/// Copy a container, compressing the node records. The header stays in
/// plaintext with the compressed flag set.
pub fn compress_tree<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> Result<()> {
    let mut header = decode_header(reader)?;
    if header.compressed() {
        return Err(Error::InputIsCompressed);
    }
    let in_format = header.format;
    let big_endian = header.big_endian();

    header.flags = (header.flags & !FLAG_BIG_ENDIAN) | FLAG_COMPRESSED;
    encode_header(writer, &header)?;

    let mut dst = ZlibEncoder::new(writer, Compression::default());
    copy_nodes(reader, &mut dst, in_format, big_endian, in_format, header.num_nodes)?;
    dst.finish()?;
    Ok(())
}

/// Inverse of [`compress_tree`]. Fails with [`Error::InvalidFile`] if the
/// input is not compressed.
pub fn decompress_tree<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> Result<()> {
    let mut header = decode_header(reader)?;
    if !header.compressed() {
        return Err(Error::InvalidFile);
    }
    let in_format = header.format;
    let big_endian = header.big_endian();

    header.flags &= !(FLAG_COMPRESSED | FLAG_BIG_ENDIAN);
    encode_header(writer, &header)?;

    let mut src = ZlibDecoder::new(reader);
    copy_nodes(&mut src, writer, in_format, big_endian, in_format, header.num_nodes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;

    const ALL_FORMATS: [OctreeFormat; 8] = [
        OctreeFormat::R8G8B8A8UnpackUI32,
        OctreeFormat::R8G8B8A8UnpackUI16,
        OctreeFormat::R4G4B4A4UnpackUI16,
        OctreeFormat::R5G6B5UnpackUI16,
        OctreeFormat::R8G8B8A8PackUI28,
        OctreeFormat::R4G4B4A4PackUI30,
        OctreeFormat::R5G6B5PackUI30,
        OctreeFormat::R3G3B2PackUI31,
    ];

    fn color_epsilon(format: OctreeFormat) -> f32 {
        match format {
            OctreeFormat::R8G8B8A8UnpackUI32
            | OctreeFormat::R8G8B8A8UnpackUI16
            | OctreeFormat::R8G8B8A8PackUI28 => 0.01,
            _ => 0.1,
        }
    }

    /// Worst-case bound for arbitrary inputs; the 2-bit blue channel of
    /// RGB332 alone can land 1/6 away.
    fn quantization_epsilon(format: OctreeFormat) -> f32 {
        match format {
            OctreeFormat::R3G3B2PackUI31 => 0.2,
            other => color_epsilon(other),
        }
    }

    /// 5-bit formats have no alpha; compare only what the format stores.
    fn stored_color(format: OctreeFormat, mut color: Color) -> Color {
        match format {
            OctreeFormat::R5G6B5UnpackUI16
            | OctreeFormat::R5G6B5PackUI30
            | OctreeFormat::R3G3B2PackUI31 => {
                color.a = 1.0;
                color
            }
            _ => color,
        }
    }

    fn round_trip(format: OctreeFormat, color: Color, children: [u32; 8]) -> (Color, [u32; 8]) {
        let mut buf = Vec::new();
        encode_node(&mut buf, format, color, &children).unwrap();
        assert_eq!(buf.len(), format.node_size());

        let mut out_color = Color::TRANSPARENT;
        let mut out_children = [0u32; 8];
        decode_node(&mut Cursor::new(buf), format, &mut out_color, &mut out_children).unwrap();
        (out_color, out_children)
    }

    #[test]
    fn node_round_trip_preserves_children_exactly() {
        let color = Color::new(0.5, 0.3, 0.7, 1.0);
        let children = [0, 90, 180, 270, 360, 450, 540, 630];

        for format in ALL_FORMATS {
            let (out_color, out_children) = round_trip(format, color, children);
            assert_eq!(out_children, children, "{format:?}");
            let want = stored_color(format, color);
            assert!(
                want.dist(out_color) <= color_epsilon(format),
                "{format:?}: {want:?} vs {out_color:?}"
            );
        }
    }

    #[test]
    fn node_round_trip_randomized() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x0c7a_70b5);
        for format in ALL_FORMATS {
            let epsilon = quantization_epsilon(format);
            for _ in 0..200 {
                let color = Color::new(rng.gen(), rng.gen(), rng.gen(), rng.gen());
                let mut children = [0u32; 8];
                for child in children.iter_mut() {
                    *child = rng.gen_range(0..=format.max_index());
                }

                let (out_color, out_children) = round_trip(format, color, children);
                assert_eq!(out_children, children, "{format:?}");
                let want = stored_color(format, color);
                assert!(
                    want.dist(out_color) <= epsilon,
                    "{format:?}: {want:?} vs {out_color:?}"
                );
            }
        }
    }

    #[test]
    fn encode_rejects_oversized_child_indices() {
        let color = Color::new(0.2, 0.4, 0.6, 0.8);
        for format in ALL_FORMATS {
            if format.max_index() == u32::MAX {
                continue;
            }
            let mut children = [0u32; 8];
            children[3] = format.max_index() + 1;
            let mut buf = Vec::new();
            assert!(matches!(
                encode_node(&mut buf, format, color, &children),
                Err(Error::OctreeOverflow)
            ));
        }
    }

    #[test]
    fn accumulation_format_decodes_averaged_color() {
        let mut buf = Vec::new();
        // Sums correspond to four samples of (255, 0, 127, 255).
        for sum in [4u64 * 255, 0, 4 * 127, 4 * 255, 4] {
            buf.extend_from_slice(&sum.to_le_bytes());
        }
        for child in [1u32, 2, 3, 4, 5, 6, 7, 8] {
            buf.extend_from_slice(&child.to_le_bytes());
        }
        assert_eq!(buf.len(), OctreeFormat::R64G64B64A64S64UnpackUI32.node_size());

        let mut color = Color::TRANSPARENT;
        let mut children = [0u32; 8];
        decode_node(
            &mut Cursor::new(buf),
            OctreeFormat::R64G64B64A64S64UnpackUI32,
            &mut color,
            &mut children,
        )
        .unwrap();
        assert_eq!(children, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert!((color.r - 1.0).abs() < 1e-6);
        assert_eq!(color.g, 0.0);
        assert!((color.b - 127.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn accumulation_format_is_not_an_encode_target() {
        let mut buf = Vec::new();
        assert!(matches!(
            encode_node(
                &mut buf,
                OctreeFormat::R64G64B64A64S64UnpackUI32,
                Color::TRANSPARENT,
                &[0; 8]
            ),
            Err(Error::UnsupportedFormat)
        ));
    }

    #[test]
    fn header_round_trip() {
        let mut header = OctreeHeader::new(OctreeFormat::R8G8B8A8PackUI28, 64);
        header.flags = FLAG_OPTIMIZED;
        header.num_nodes = 12345;
        header.num_leafs = 6789;

        let mut buf = Vec::new();
        encode_header(&mut buf, &header).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = decode_header(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_rejects_bad_signature_and_version() {
        let mut buf = Vec::new();
        encode_header(&mut buf, &OctreeHeader::new(OctreeFormat::R8G8B8A8UnpackUI32, 8)).unwrap();

        let mut bad_sign = buf.clone();
        bad_sign[0] = b'x';
        assert!(matches!(
            decode_header(&mut Cursor::new(bad_sign)),
            Err(Error::InvalidFile)
        ));

        let mut bad_version = buf.clone();
        bad_version[4] = 9;
        assert!(matches!(
            decode_header(&mut Cursor::new(bad_version)),
            Err(Error::InvalidFile)
        ));

        let mut bad_vpa = buf;
        bad_vpa[24..28].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(
            decode_header(&mut Cursor::new(bad_vpa)),
            Err(Error::InvalidFile)
        ));
    }

    fn sample_tree(format: OctreeFormat) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut header = OctreeHeader::new(format, 2);
        header.num_nodes = 3;
        header.num_leafs = 2;
        encode_header(&mut buf, &header).unwrap();
        encode_node(&mut buf, format, Color::new(0.5, 0.25, 0.75, 1.0), &[1, 0, 0, 0, 0, 0, 0, 2]).unwrap();
        encode_node(&mut buf, format, Color::new(1.0, 0.0, 0.0, 1.0), &[0; 8]).unwrap();
        encode_node(&mut buf, format, Color::new(0.0, 0.0, 1.0, 1.0), &[0; 8]).unwrap();
        buf
    }

    fn decode_all(bytes: &[u8]) -> (OctreeHeader, Vec<(Color, [u32; 8])>) {
        let mut cursor = Cursor::new(bytes);
        let header = decode_header(&mut cursor).unwrap();
        let mut nodes = Vec::new();
        if header.compressed() {
            let mut dec = ZlibDecoder::new(cursor);
            for _ in 0..header.num_nodes {
                let mut color = Color::TRANSPARENT;
                let mut children = [0u32; 8];
                decode_node(&mut dec, header.format, &mut color, &mut children).unwrap();
                nodes.push((color, children));
            }
        } else {
            for _ in 0..header.num_nodes {
                let mut color = Color::TRANSPARENT;
                let mut children = [0u32; 8];
                decode_node(&mut cursor, header.format, &mut color, &mut children).unwrap();
                nodes.push((color, children));
            }
        }
        (header, nodes)
    }

    #[test]
    fn compress_then_decompress_round_trips() {
        let plain = sample_tree(OctreeFormat::R8G8B8A8UnpackUI32);

        let mut compressed = Vec::new();
        compress_tree(&mut Cursor::new(&plain), &mut compressed).unwrap();
        let header = decode_header(&mut Cursor::new(&compressed)).unwrap();
        assert!(header.compressed());

        // Compressing again must be refused.
        let mut twice = Vec::new();
        assert!(matches!(
            compress_tree(&mut Cursor::new(&compressed), &mut twice),
            Err(Error::InputIsCompressed)
        ));

        let mut restored = Vec::new();
        decompress_tree(&mut Cursor::new(&compressed), &mut restored).unwrap();
        assert_eq!(restored, plain);
    }

    #[test]
    fn transcode_preserves_children_across_formats() {
        let plain = sample_tree(OctreeFormat::R8G8B8A8UnpackUI32);
        let (_, want) = decode_all(&plain);

        for format in ALL_FORMATS {
            let mut out = Vec::new();
            transcode_tree(&mut Cursor::new(&plain), &mut out, format).unwrap();
            let (header, nodes) = decode_all(&out);
            assert_eq!(header.format, format);
            assert_eq!(header.num_nodes, 3);
            for ((color, children), (want_color, want_children)) in nodes.iter().zip(&want) {
                assert_eq!(children, want_children, "{format:?}");
                let reference = stored_color(format, *want_color);
                assert!(
                    reference.dist(*color) <= quantization_epsilon(format),
                    "{format:?}"
                );
            }
        }
    }

    #[test]
    fn transcode_decompresses_compressed_input() {
        let plain = sample_tree(OctreeFormat::R8G8B8A8UnpackUI32);
        let mut compressed = Vec::new();
        compress_tree(&mut Cursor::new(&plain), &mut compressed).unwrap();

        let mut out = Vec::new();
        transcode_tree(
            &mut Cursor::new(&compressed),
            &mut out,
            OctreeFormat::R8G8B8A8UnpackUI16,
        )
        .unwrap();

        let (header, nodes) = decode_all(&out);
        assert!(header.compressed());
        assert_eq!(header.format, OctreeFormat::R8G8B8A8UnpackUI16);
        assert_eq!(nodes[0].1, [1, 0, 0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn patching_preserves_stolen_color_bits() {
        for format in ALL_FORMATS {
            let mut buf = Cursor::new(Vec::new());
            let color = Color::new(0.8, 0.4, 0.2, 1.0);
            encode_node(&mut buf, format, color, &[0; 8]).unwrap();

            patch_child_slot(&mut buf, format, 0, 0, 7).unwrap();
            patch_child_slot(&mut buf, format, 0, 7, 42).unwrap();

            buf.set_position(0);
            let mut out_color = Color::TRANSPARENT;
            let mut children = [0u32; 8];
            decode_node(&mut buf, format, &mut out_color, &mut children).unwrap();

            assert_eq!(children, [7, 0, 0, 0, 0, 0, 0, 42], "{format:?}");
            let want = stored_color(format, color);
            assert!(
                want.dist(out_color) <= quantization_epsilon(format),
                "{format:?}"
            );
        }
    }

    #[test]
    fn patching_rejects_oversized_index() {
        let mut buf = Cursor::new(Vec::new());
        encode_node(
            &mut buf,
            OctreeFormat::R8G8B8A8UnpackUI16,
            Color::TRANSPARENT,
            &[0; 8],
        )
        .unwrap();
        assert!(matches!(
            patch_child_slot(&mut buf, OctreeFormat::R8G8B8A8UnpackUI16, 0, 0, 0x1_0000),
            Err(Error::OctreeOverflow)
        ));
    }

    #[test]
    fn big_endian_containers_decode() {
        // Hand-build a big-endian container: flag set, all integers
        // byte-swapped.
        let mut buf = Vec::new();
        buf.extend_from_slice(&SIGNATURE);
        buf.extend_from_slice(&[VERSION, 0, FLAG_BIG_ENDIAN, 0]);
        buf.extend_from_slice(&1u64.to_be_bytes());
        buf.extend_from_slice(&1u64.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&[255, 128, 0, 255]);
        for child in [0u32, 9, 0, 0, 0, 0, 0, 0] {
            buf.extend_from_slice(&child.to_be_bytes());
        }

        let mut cursor = Cursor::new(buf);
        let header = decode_header(&mut cursor).unwrap();
        assert!(header.big_endian());
        assert_eq!(header.num_nodes, 1);

        let mut color = Color::TRANSPARENT;
        let mut children = [0u32; 8];
        decode_node_with(&mut cursor, header.format, true, &mut color, &mut children).unwrap();
        assert_eq!(children[1], 9);
        assert!((color.r - 1.0).abs() < 1e-6);
    }
}
