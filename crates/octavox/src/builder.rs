//! Concurrent octree construction.
//!
//! Worker threads pull pending cells from the node cache, collect the
//! samples intersecting each cell from their producer, average the colors
//! and serialize one node record per non-empty cell. Children are submitted
//! back to the cache after their parent's record exists, so parents always
//! precede children in the file; a child installs its own record index into
//! the parent's slot once its offset is known.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;

use crate::cache::NodeCache;
use crate::error::{Error, Result};
use crate::format::{self, OctreeFormat, OctreeHeader, HEADER_SIZE};
use crate::geom::{Bounds, Color, Sample};
use crate::optimize::{optimize_tree, OptStatus};

/// Pushes samples for one octree cell. The producer owns the data source;
/// the builder owns the accumulation.
pub trait SampleProducer: Send {
    fn produce(&mut self, bounds: Bounds, sink: &mut SampleSink<'_>) -> Result<()>;
}

impl<P: SampleProducer + ?Sized> SampleProducer for Box<P> {
    fn produce(&mut self, bounds: Bounds, sink: &mut SampleSink<'_>) -> Result<()> {
        (**self).produce(bounds, sink)
    }
}

/// Adapter turning a closure into a [`SampleProducer`].
pub struct FnProducer<F>(pub F);

impl<F> SampleProducer for FnProducer<F>
where
    F: FnMut(Bounds, &mut SampleSink<'_>) -> Result<()> + Send,
{
    fn produce(&mut self, bounds: Bounds, sink: &mut SampleSink<'_>) -> Result<()> {
        (self.0)(bounds, sink)
    }
}

/// Receives the samples a producer emits for one cell. Positions outside
/// the cell bounds are skipped before accumulation.
pub struct SampleSink<'a> {
    bounds: Bounds,
    acc: &'a mut ColorAccum,
}

impl SampleSink<'_> {
    pub fn push(&mut self, sample: Sample) {
        if self.bounds.contains(sample.position) {
            self.acc.add(sample.color);
        }
    }
}

/// Kahan-compensated running mean over the four color channels:
/// `sum ← sum + (c − sum) · (1/n)` with per-channel error compensation.
#[derive(Default)]
struct ColorAccum {
    mean: [f32; 4],
    compensation: [f32; 4],
    count: u64,
}

impl ColorAccum {
    fn add(&mut self, color: Color) {
        self.count += 1;
        let inv = 1.0 / self.count as f32;
        for (i, channel) in [color.r, color.g, color.b, color.a].into_iter().enumerate() {
            let delta = (channel - self.mean[i]) * inv;
            let y = delta - self.compensation[i];
            let t = self.mean[i] + y;
            self.compensation[i] = (t - self.mean[i]) - y;
            self.mean[i] = t;
        }
    }

    fn color(&self) -> Color {
        Color::new(self.mean[0], self.mean[1], self.mean[2], self.mean[3])
    }
}

/// One pending octant during the build. Parent linkage is carried as a file
/// offset plus slot index so no worker ever dereferences another worker's
/// node.
struct TreeNode {
    bounds: Bounds,
    voxels_per_axis: u32,
    parent_offset: Option<u64>,
    child_slot: usize,
}

/// Build parameters. `optimize` runs the bottom-up merge pass over the
/// finished tree before it reaches the output writer; `color_filter` widens
/// sample collection by half a voxel and lets the optimizer propagate flat
/// parent colors into leaves.
#[derive(Clone, Copy, Debug)]
pub struct BuildConfig {
    pub bounds: Bounds,
    pub voxels_per_axis: u32,
    pub format: OctreeFormat,
    pub optimize: bool,
    pub color_filter: bool,
    pub color_threshold: f32,
}

impl BuildConfig {
    pub fn new(bounds: Bounds, voxels_per_axis: u32, format: OctreeFormat) -> Self {
        BuildConfig {
            bounds,
            voxels_per_axis,
            format,
            optimize: false,
            color_filter: false,
            color_threshold: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct BuildStatus {
    /// Records emitted by the build itself, before any optimization.
    pub num_nodes: u64,
    pub num_leafs: u64,
    /// Merge statistics when `optimize` was requested; the output header
    /// carries the post-merge counts.
    pub optimized: Option<OptStatus>,
}

/// Build an octree from `workers` sample producers into `writer`.
///
/// Every worker serves the same point cloud; each request is scoped to one
/// cell's bounds. The tree lands in `cfg.format`; with `cfg.optimize` it is
/// staged in a temporary file and merged into `writer` afterwards.
pub fn build_tree<W, P>(workers: Vec<P>, writer: &mut W, cfg: &BuildConfig) -> Result<BuildStatus>
where
    W: Read + Write + Seek + Send,
    P: SampleProducer,
{
    if cfg.voxels_per_axis == 0 || !cfg.voxels_per_axis.is_power_of_two() {
        return Err(Error::VoxelsNotPowerOfTwo);
    }
    assert!(!workers.is_empty(), "build_tree needs at least one worker");

    if cfg.optimize {
        let mut staging = tempfile::tempfile()?;
        let (num_nodes, num_leafs) = build_into(workers, &mut staging, cfg)?;
        staging.seek(SeekFrom::Start(0))?;
        let status = optimize_tree(
            &mut staging,
            writer,
            cfg.format,
            cfg.color_threshold,
            cfg.color_filter,
        )?;
        Ok(BuildStatus {
            num_nodes,
            num_leafs,
            optimized: Some(status),
        })
    } else {
        let (num_nodes, num_leafs) = build_into(workers, writer, cfg)?;
        Ok(BuildStatus {
            num_nodes,
            num_leafs,
            optimized: None,
        })
    }
}

fn build_into<W, P>(workers: Vec<P>, writer: &mut W, cfg: &BuildConfig) -> Result<(u64, u64)>
where
    W: Read + Write + Seek + Send,
    P: SampleProducer,
{
    let vpa = cfg.voxels_per_axis as u64;
    let total_volume = vpa * vpa * vpa;

    writer.seek(SeekFrom::Start(0))?;
    format::encode_header(writer, &OctreeHeader::new(cfg.format, cfg.voxels_per_axis))?;

    let cache = NodeCache::new(workers.len());
    cache.submit(TreeNode {
        bounds: cfg.bounds,
        voxels_per_axis: cfg.voxels_per_axis,
        parent_offset: None,
        child_slot: 0,
    });

    let writer = Mutex::new(writer);
    let volume_traversed = AtomicU64::new(0);
    let num_nodes = AtomicU64::new(0);
    let num_leafs = AtomicU64::new(0);

    let first_error = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers.len());
        for mut producer in workers {
            let cache = &cache;
            let writer = &writer;
            let volume_traversed = &volume_traversed;
            let num_nodes = &num_nodes;
            let num_leafs = &num_leafs;

            handles.push(scope.spawn(move || -> Result<()> {
                while let Some(node) = cache.take() {
                    let mut acc = ColorAccum::default();
                    let collect_bounds = if cfg.color_filter {
                        let voxel = node.bounds.size / node.voxels_per_axis as f64;
                        node.bounds.dilated(voxel * 0.5)
                    } else {
                        node.bounds
                    };
                    let mut sink = SampleSink {
                        bounds: collect_bounds,
                        acc: &mut acc,
                    };

                    if let Err(err) = producer.produce(collect_bounds, &mut sink) {
                        // Count the whole subtree as traversed so the
                        // shutdown condition stays reachable.
                        finish_volume(volume_traversed, &node, total_volume, cache);
                        return Err(err);
                    }

                    if acc.count == 0 {
                        finish_volume(volume_traversed, &node, total_volume, cache);
                        continue;
                    }

                    num_nodes.fetch_add(1, Ordering::Relaxed);
                    match serialize_node(&node, acc.color(), writer, cfg.format, cache) {
                        Err(err) => {
                            finish_volume(volume_traversed, &node, total_volume, cache);
                            return Err(err);
                        }
                        Ok(true) => {}
                        Ok(false) => {
                            num_leafs.fetch_add(1, Ordering::Relaxed);
                            finish_volume(volume_traversed, &node, total_volume, cache);
                        }
                    }
                }
                Ok(())
            }));
        }

        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => first_error = first_error.or(Some(err)),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        first_error
    });

    cache.shutdown();
    if let Some(err) = first_error {
        return Err(err);
    }

    let num_nodes = num_nodes.load(Ordering::Relaxed);
    let num_leafs = num_leafs.load(Ordering::Relaxed);

    let mut header = OctreeHeader::new(cfg.format, cfg.voxels_per_axis);
    header.num_nodes = num_nodes;
    header.num_leafs = num_leafs;

    let writer = writer.into_inner().expect("writer mutex poisoned");
    writer.seek(SeekFrom::Start(0))?;
    format::encode_header(writer, &header)?;
    writer.seek(SeekFrom::End(0))?;

    log::debug!("octree build complete: {num_nodes} nodes, {num_leafs} leafs");
    Ok((num_nodes, num_leafs))
}

/// Mark a fully-resolved subtree's voxel volume as traversed and shut the
/// cache down once the whole volume is covered.
fn finish_volume(
    counter: &AtomicU64,
    node: &TreeNode,
    total_volume: u64,
    cache: &NodeCache<TreeNode>,
) {
    let volume = (node.voxels_per_axis as u64).pow(3);
    let traversed = counter.fetch_add(volume, Ordering::Relaxed) + volume;
    if traversed >= total_volume {
        cache.shutdown();
    }
}

/// Reserve a record at the end of the file, write the node with zeroed
/// child slots, enqueue its children and patch this node's index into the
/// parent. The writer mutex is held only for the seek/write pairs, never
/// during sample collection.
fn serialize_node<W>(
    node: &TreeNode,
    color: Color,
    writer: &Mutex<&mut W>,
    format: OctreeFormat,
    cache: &NodeCache<TreeNode>,
) -> Result<bool>
where
    W: Read + Write + Seek,
{
    let offset = {
        let mut guard = writer.lock().expect("writer mutex poisoned");
        let offset = guard.seek(SeekFrom::End(0))?;
        format::encode_node(&mut **guard, format, color, &[0; 8])?;
        offset
    };

    let has_children = node.voxels_per_axis > 1;
    if has_children {
        for slot in 0..8 {
            cache.submit(TreeNode {
                bounds: node.bounds.child(slot),
                voxels_per_axis: node.voxels_per_axis / 2,
                parent_offset: Some(offset),
                child_slot: slot,
            });
        }
    }

    if let Some(parent_offset) = node.parent_offset {
        let record_index = (offset - HEADER_SIZE as u64) / format.node_size() as u64;
        if record_index > format.max_index() as u64 {
            return Err(Error::OctreeOverflow);
        }
        let mut guard = writer.lock().expect("writer mutex poisoned");
        format::patch_child_slot(
            &mut **guard,
            format,
            parent_offset,
            node.child_slot,
            record_index as u32,
        )?;
    }

    Ok(has_children)
}
