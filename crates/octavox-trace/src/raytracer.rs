//! Multi-threaded CPU ray traversal.
//!
//! A fixed pool of worker threads consumes scan-line band jobs from a
//! bounded channel. Two ping-pong frames (color plus optional 16-bit
//! depth) absorb the results; in jittered mode each frame holds half the
//! horizontal resolution and frame parity selects which ray columns are
//! sampled. Band completion is tracked per frame by a count/condvar gate,
//! so `trace` returns as soon as the jobs are enqueued.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use glam::Vec3;
use image::{ImageBuffer, Luma, Rgba, RgbaImage};

use crate::camera::Camera;
use crate::octree::{Octree, OctreeNode};

pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Render configuration, fixed for the lifetime of a [`Raytracer`].
///
/// `width`/`height` size the internal frames; in jittered mode `width` is
/// the half-resolution width and rays are generated for `2 * width`
/// columns.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Horizontal field of view in radians.
    pub field_of_view: f32,
    /// World-space edge length of the root cell.
    pub tree_scale: f32,
    /// World-space position of the root cell's low corner.
    pub tree_position: Vec3,
    /// Far limit for all rays; also the depth-buffer scale.
    pub view_dist: f32,
    /// Initial frame counter, selects the first ping-pong slot.
    pub frame_seed: u32,
    pub jitter: bool,
    pub depth_test: bool,
    pub multi_threaded: bool,
    pub width: u32,
    pub height: u32,
}

impl Config {
    pub fn new(width: u32, height: u32) -> Self {
        Config {
            field_of_view: std::f32::consts::FRAC_PI_2,
            tree_scale: 1.0,
            tree_position: Vec3::ZERO,
            view_dist: 100.0,
            frame_seed: 0,
            jitter: false,
            depth_test: false,
            multi_threaded: true,
            width,
            height,
        }
    }
}

/// Fixed-size slice with interior mutability per element.
///
/// Render workers write disjoint pixel ranges of the same frame, so no
/// synchronization is needed; the per-element cells keep those writes from
/// aliasing. Snapshots and fills must only run while no worker touches the
/// frame, which the frame gate guarantees.
struct SyncSlice<T>(Box<[UnsafeCell<T>]>);

unsafe impl<T: Send> Sync for SyncSlice<T> {}

impl<T: Copy> SyncSlice<T> {
    fn new(len: usize, fill: T) -> Self {
        SyncSlice((0..len).map(|_| UnsafeCell::new(fill)).collect())
    }

    /// Safety: no concurrent access to the same element.
    unsafe fn set(&self, index: usize, value: T) {
        *self.0[index].get() = value;
    }

    /// Safety: no concurrent write to the same element.
    unsafe fn get(&self, index: usize) -> T {
        *self.0[index].get()
    }

    /// Safety: no concurrent access to any element.
    unsafe fn fill(&self, value: T) {
        for cell in self.0.iter() {
            *cell.get() = value;
        }
    }

    /// Safety: no concurrent write to any element.
    unsafe fn snapshot(&self) -> Vec<T> {
        self.0.iter().map(|cell| *cell.get()).collect()
    }
}

struct FrameStore {
    width: u32,
    height: u32,
    pixels: [SyncSlice<[u8; 4]>; 2],
    depth: [SyncSlice<u16>; 2],
}

impl FrameStore {
    fn new(width: u32, height: u32) -> Self {
        let len = (width * height) as usize;
        FrameStore {
            width,
            height,
            pixels: [
                SyncSlice::new(len, [0; 4]),
                SyncSlice::new(len, [0; 4]),
            ],
            depth: [
                SyncSlice::new(len, u16::MAX),
                SyncSlice::new(len, u16::MAX),
            ],
        }
    }

    fn index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }
}

/// Outstanding-band counter per ping-pong slot.
struct FrameGate {
    counts: Mutex<[usize; 2]>,
    done: Condvar,
}

impl FrameGate {
    fn new() -> Self {
        FrameGate {
            counts: Mutex::new([0; 2]),
            done: Condvar::new(),
        }
    }

    fn add(&self, frame: usize, n: usize) {
        self.counts.lock().expect("gate poisoned")[frame] += n;
    }

    fn finish(&self, frame: usize) {
        let mut counts = self.counts.lock().expect("gate poisoned");
        counts[frame] -= 1;
        if counts[frame] == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self, frame: usize) {
        let mut counts = self.counts.lock().expect("gate poisoned");
        while counts[frame] != 0 {
            counts = self.done.wait(counts).expect("gate poisoned");
        }
    }
}

#[derive(Clone, Copy)]
struct TraceParams {
    field_of_view: f32,
    view_dist: f32,
    tree_scale: f32,
    tree_position: Vec3,
    jitter: bool,
    depth_test: bool,
    width: u32,
    height: u32,
}

struct Job {
    eye: Vec3,
    look_at: Vec3,
    up: Vec3,
    tree: Arc<Octree>,
    max_depth: f32,
    from: u32,
    to: u32,
    frame: usize,
    clear: Rgba<u8>,
}

pub struct Raytracer {
    frame: AtomicU32,
    clear: Rgba<u8>,
    num_threads: usize,
    jitter: bool,
    height: u32,
    store: Arc<FrameStore>,
    gate: Arc<FrameGate>,
    work: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl Raytracer {
    pub fn new(cfg: Config) -> Self {
        assert!(cfg.width > 0 && cfg.height > 0, "zero-sized frame");

        let mut num_threads = if cfg.multi_threaded {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(cfg.height as usize)
        } else {
            1
        };
        // Bands are uniform; shrink the pool until it divides the height.
        while cfg.height as usize % num_threads != 0 {
            num_threads -= 1;
        }

        let store = Arc::new(FrameStore::new(cfg.width, cfg.height));
        let gate = Arc::new(FrameGate::new());
        let (work_tx, work_rx) = bounded::<Job>(num_threads * 2);

        let params = TraceParams {
            field_of_view: cfg.field_of_view,
            view_dist: cfg.view_dist,
            tree_scale: cfg.tree_scale,
            tree_position: cfg.tree_position,
            jitter: cfg.jitter,
            depth_test: cfg.depth_test,
            width: cfg.width,
            height: cfg.height,
        };

        let threads = (0..num_threads)
            .map(|_| {
                let work_rx: Receiver<Job> = work_rx.clone();
                let store = store.clone();
                let gate = gate.clone();
                thread::spawn(move || {
                    while let Ok(job) = work_rx.recv() {
                        trace_scan_lines(&params, &store, &job);
                        gate.finish(job.frame);
                    }
                })
            })
            .collect();

        Raytracer {
            frame: AtomicU32::new(cfg.frame_seed),
            clear: Rgba([0, 0, 0, 255]),
            num_threads,
            jitter: cfg.jitter,
            height: cfg.height,
            store,
            gate,
            work: Some(work_tx),
            threads,
        }
    }

    /// Dispatch one frame of scan-line bands and return the ping-pong slot
    /// they render into. Returns as soon as the jobs are enqueued; pair
    /// with [`wait`](Self::wait) or [`image`](Self::image).
    pub fn trace(&mut self, camera: &dyn Camera, tree: &Arc<Octree>, max_depth: u32) -> usize {
        let frame = (self.frame.load(Ordering::Relaxed) % 2) as usize;
        self.gate.wait(frame);

        if self.jitter {
            self.frame.fetch_add(1, Ordering::Relaxed);
        }

        let batch = self.height / self.num_threads as u32;
        self.gate.add(frame, self.num_threads);

        let work = self.work.as_ref().expect("worker pool closed");
        for band in 0..self.num_threads as u32 {
            let job = Job {
                eye: camera.position(),
                look_at: camera.look_at(),
                up: camera.up(),
                tree: tree.clone(),
                max_depth: max_depth as f32,
                from: band * batch,
                to: (band + 1) * batch,
                frame,
                clear: self.clear,
            };
            work.send(job).expect("worker pool closed");
        }
        frame
    }

    /// Block until the given frame has no outstanding bands.
    pub fn wait(&self, frame: usize) {
        self.gate.wait(frame);
    }

    /// Current ping-pong slot.
    pub fn frame(&self) -> usize {
        (self.frame.load(Ordering::Relaxed) % 2) as usize
    }

    pub fn set_clear_color(&mut self, color: Rgba<u8>) {
        self.clear = color;
    }

    /// Snapshot a completed frame.
    pub fn image(&self, frame: usize) -> RgbaImage {
        self.gate.wait(frame);
        let pixels = unsafe { self.store.pixels[frame].snapshot() };
        let flat = pixels.into_iter().flatten().collect();
        RgbaImage::from_raw(self.store.width, self.store.height, flat)
            .expect("frame buffer size mismatch")
    }

    /// Snapshot a completed frame's depth buffer.
    pub fn depth(&self, frame: usize) -> DepthImage {
        self.gate.wait(frame);
        let depth = unsafe { self.store.depth[frame].snapshot() };
        DepthImage::from_raw(self.store.width, self.store.height, depth)
            .expect("depth buffer size mismatch")
    }

    /// Reset a frame's depth buffer to the far plane.
    pub fn clear_depth(&self, frame: usize) {
        self.gate.wait(frame);
        unsafe { self.store.depth[frame].fill(u16::MAX) };
    }
}

impl Drop for Raytracer {
    fn drop(&mut self) {
        self.work.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

struct Ray {
    origin: Vec3,
    dir: Vec3,
}

/// Per-pixel increment vectors across the view plane and its bottom-left
/// corner, for a `width` by `height` grid of primary rays.
fn calc_inc_vectors(
    eye: Vec3,
    look_at: Vec3,
    up: Vec3,
    field_of_view: f32,
    width: f32,
    height: f32,
) -> (Vec3, Vec3, Vec3) {
    let view_dir = look_at - eye;
    let u = view_dir.cross(up).normalize();
    let v = u.cross(view_dir).normalize();

    let half_width = (field_of_view / 2.0).tan();
    let half_height = (height / width) * half_width;

    let bottom_left = look_at - v * half_height - u * half_width;
    let x_inc = u * (2.0 * half_width) / width;
    let y_inc = v * (2.0 * half_height) / height;
    (x_inc, y_inc, bottom_left)
}

/// Slab intersection. Returns the entry distance when the ray hits the box
/// closer than `length`, otherwise `length`.
fn intersect_box(ray: &Ray, length: f32, box_min: Vec3, box_max: Vec3) -> f32 {
    let o_min = (box_min - ray.origin) / ray.dir;
    let o_max = (box_max - ray.origin) / ray.dir;

    let slab_max = o_max.max(o_min);
    let slab_min = o_max.min(o_min);

    let exit = slab_max.x.min(slab_max.y).min(slab_max.z);
    let entry = slab_min.x.max(0.0).max(slab_min.y).max(slab_min.z);

    let dist = exit.min(entry);
    if exit > entry && dist < length {
        dist
    } else {
        length
    }
}

const CHILD_POSITIONS: [Vec3; 8] = [
    Vec3::new(0.0, 0.0, 0.0),
    Vec3::new(1.0, 0.0, 0.0),
    Vec3::new(0.0, 1.0, 0.0),
    Vec3::new(1.0, 1.0, 0.0),
    Vec3::new(0.0, 0.0, 1.0),
    Vec3::new(1.0, 0.0, 1.0),
    Vec3::new(0.0, 1.0, 1.0),
    Vec3::new(1.0, 1.0, 1.0),
];

/// Recursive front-to-back intersection.
///
/// `length` carries the closest hit so far; every child hit tightens it, so
/// distant siblings prune to a single box test. Recursion stops early at a
/// depth that shrinks with distance, returning the node's own color as a
/// coarse far-field sample.
#[allow(clippy::too_many_arguments)]
fn intersect_tree(
    tree: &Octree,
    ray: &Ray,
    node_pos: Vec3,
    node_scale: f32,
    mut length: f32,
    max_depth: f32,
    node_index: u32,
    tree_depth: u32,
    clear: Rgba<u8>,
    view_dist: f32,
) -> (f32, Rgba<u8>) {
    let node: &OctreeNode = tree.node(node_index);

    let box_dist = intersect_box(ray, length, node_pos, node_pos + Vec3::splat(node_scale));
    if box_dist == length {
        return (length, clear);
    }

    let d = box_dist / view_dist;
    if tree_depth as f32 > max_depth * (1.0 - d * d) {
        return (box_dist, node.color());
    }

    let mut color = clear;
    let mut num_children = 0;
    let child_scale = node_scale * 0.5;
    let child_depth = tree_depth + 1;

    for slot in 0..8 {
        let child = node.child(slot);
        if child != 0 {
            num_children += 1;
            let pos = node_pos + CHILD_POSITIONS[slot] * child_scale;
            let (hit, hit_color) = intersect_tree(
                tree,
                ray,
                pos,
                child_scale,
                length,
                max_depth,
                child,
                child_depth,
                clear,
                view_dist,
            );
            if hit < length {
                length = hit;
                color = hit_color;
            }
        }
    }

    if num_children == 0 {
        return (box_dist, node.color());
    }
    (length, color)
}

fn trace_scan_lines(params: &TraceParams, store: &FrameStore, job: &Job) {
    let (jitter, step) = if params.jitter { (1u32, 2u32) } else { (0, 1) };
    let ray_width = params.width * if params.jitter { 2 } else { 1 };

    let (x_inc, y_inc, bottom_left) = calc_inc_vectors(
        job.eye,
        job.look_at,
        job.up,
        params.field_of_view,
        ray_width as f32,
        params.height as f32,
    );

    // An empty container has no root record to intersect.
    if job.tree.is_empty() {
        for row in job.from..job.to {
            let mut w = ((row + job.frame as u32) % 2) * jitter;
            while w < ray_width {
                let index = store.index(w / step, params.height - 1 - row);
                unsafe { store.pixels[job.frame].set(index, job.clear.0) };
                w += step;
            }
        }
        return;
    }

    for row in job.from..job.to {
        let start = ((row + job.frame as u32) % 2) * jitter;
        let mut w = start;
        while w < ray_width {
            let plane_point = bottom_left + x_inc * w as f32 + y_inc * row as f32;
            let ray = Ray {
                origin: job.eye,
                dir: (plane_point - job.eye).normalize(),
            };

            let dx = w / step;
            let dy = params.height - 1 - row;
            let index = store.index(dx, dy);

            // Disjoint per band: rows `from..to` map to unique `dy`.
            unsafe {
                if params.depth_test {
                    let seeded = store.depth[job.frame].get(index) as f32;
                    let limit = seeded / u16::MAX as f32 * params.view_dist;
                    let (dist, color) = intersect_tree(
                        &job.tree,
                        &ray,
                        params.tree_position,
                        params.tree_scale,
                        limit,
                        job.max_depth,
                        0,
                        0,
                        job.clear,
                        params.view_dist,
                    );
                    let quantized = (u16::MAX as f32 * (dist / params.view_dist)) as u16;
                    store.depth[job.frame].set(index, quantized);
                    store.pixels[job.frame].set(index, color.0);
                } else {
                    let (_, color) = intersect_tree(
                        &job.tree,
                        &ray,
                        params.tree_position,
                        params.tree_scale,
                        params.view_dist,
                        job.max_depth,
                        0,
                        0,
                        job.clear,
                        params.view_dist,
                    );
                    store.pixels[job.frame].set(index, color.0);
                }
            }

            w += step;
        }
    }
}
