//! CPU ray traversal over packed sparse voxel octrees.
//!
//! Loads a container produced by the `octavox` packer into a compact
//! in-memory form and renders it with a pool of scan-line workers:
//! front-to-back recursive box intersection, distance-scaled LOD cutoff,
//! optional 16-bit depth seeding and a jittered half-resolution mode whose
//! two frames reconstruct into one full-width image.

pub mod camera;
pub mod octree;
pub mod raytracer;
pub mod reconstruct;

pub use camera::{Camera, FreeFlightCamera, LookAtCamera};
pub use octree::{width_to_depth, Octree, OctreeNode};
pub use raytracer::{Config, DepthImage, Raytracer};
pub use reconstruct::reconstruct;
