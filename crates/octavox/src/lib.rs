//! Sparse voxel octree packing.
//!
//! Turns an unbounded stream of colored point samples into a compact,
//! addressable octree stored in a self-describing binary container. The
//! tree is built concurrently by worker threads, optionally merged
//! bottom-up where colors are flat, and can be transcoded between several
//! packed node formats or stream-compressed.

pub mod builder;
pub mod cache;
pub mod error;
pub mod filter;
pub mod format;
pub mod geom;
pub mod optimize;

pub use builder::{build_tree, BuildConfig, BuildStatus, FnProducer, SampleProducer, SampleSink};
pub use error::{Error, Result};
pub use format::{OctreeFormat, OctreeHeader};
pub use geom::{Bounds, Color, Point, Sample};
pub use optimize::{optimize_tree, OptStatus};
