use std::fmt;
use std::io;

/// Errors shared by the build, codec and optimizer paths.
#[derive(Debug)]
pub enum Error {
    /// Underlying read/write/seek failure.
    Io(io::Error),
    /// Format code unknown to this build or operation.
    UnsupportedFormat,
    /// Header signature or version mismatch, or internal invariants broken.
    InvalidFile,
    /// A child index exceeds the chosen format's payload width.
    OctreeOverflow,
    /// `voxels_per_axis` is not a power of two.
    VoxelsNotPowerOfTwo,
    /// `compress` or `optimize` was handed an already-compressed stream.
    InputIsCompressed,
    /// Reconstruction was given mismatched image dimensions.
    InvalidSize,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "i/o error: {err}"),
            Error::UnsupportedFormat => write!(f, "unsupported octree-format"),
            Error::InvalidFile => write!(f, "invalid file"),
            Error::OctreeOverflow => write!(f, "octree-format overflow"),
            Error::VoxelsNotPowerOfTwo => write!(f, "voxels must be a power of two"),
            Error::InputIsCompressed => write!(f, "input is compressed"),
            Error::InvalidSize => write!(f, "invalid size"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
