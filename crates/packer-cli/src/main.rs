//! Point-cloud packer: parses `.xyz` text clouds into octree containers.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;

use clap::Parser;
use glam::{DMat4, DQuat, DVec3, EulerRot};
use tempfile::NamedTempFile;

use octavox::filter::{filter_input, SharedCloud, UnsortedProducer};
use octavox::format::compress_tree;
use octavox::{build_tree, Bounds, BuildConfig, Color, OctreeFormat, Point, Sample, SampleProducer};

/// Staged clouds up to this size are cached in memory and shared across
/// the build workers instead of re-read from disk.
const SHARED_CLOUD_LIMIT: u64 = 256 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "packer", about = "Pack a point cloud into an octree container")]
struct Args {
    /// Octree packing format
    #[arg(long, default_value = "R8G8B8A8PackUI28")]
    format: String,

    /// Octree bounding cube X,Y,Z,SIZE
    #[arg(long, default_value = "0,0,0,1")]
    bounds: String,

    /// Input point cloud (x y z [ref] r g b per line)
    #[arg(long, default_value = "cloud.xyz")]
    input: PathBuf,

    /// Output container
    #[arg(long, default_value = "tree.oct")]
    output: PathBuf,

    /// Cloud rotation YAW,PITCH,ROLL in radians
    #[arg(long, default_value = "0,0,0")]
    rotate: String,

    /// Cloud translation X,Y,Z
    #[arg(long, default_value = "0,0,0")]
    translate: String,

    /// Voxels per axis (power of two)
    #[arg(long, default_value_t = 64)]
    vpa: u32,

    /// Color-filter merge threshold
    #[arg(long, default_value_t = 0.25)]
    threshold: f32,

    /// Compress the finished container
    #[arg(long)]
    compress: bool,

    /// Merge flat sub-trees bottom-up
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    optimize: bool,

    /// Apply the color filter during build and merge
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    filter: bool,

    /// Input lines carry a reflection component in the 4th column
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    reflect: bool,

    /// Parse and transform the cloud without writing anything
    #[arg(long)]
    dry: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("packer: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let format = parse_format(&args.format).ok_or("unknown octree format")?;
    let bounds = parse_bounds(&args.bounds).ok_or("invalid bounds, expected X,Y,Z,SIZE")?;
    let [yaw, pitch, roll] = parse_triplet(&args.rotate).ok_or("invalid rotation")?;
    let translate = parse_triplet(&args.translate).ok_or("invalid translation")?;

    let transform = DMat4::from_rotation_translation(
        DQuat::from_euler(EulerRot::YXZ, yaw, pitch, roll),
        DVec3::from_array(translate),
    );

    let input = File::open(&args.input)?;
    let total_bytes = input.metadata()?.len();
    let mut reader = BufReader::new(input);

    // The parsed cloud is staged as fixed binary records so every build
    // worker can replay it independently.
    let mut staging = NamedTempFile::new()?;
    let cloud_bounds = if args.dry {
        parse_cloud(&mut reader, total_bytes, args.reflect, &transform, &mut io::sink())?
    } else {
        let mut writer = BufWriter::new(staging.as_file_mut());
        let bounds = parse_cloud(&mut reader, total_bytes, args.reflect, &transform, &mut writer)?;
        writer.flush()?;
        bounds
    };
    println!("cloud bounds: {cloud_bounds:?}");

    if args.dry {
        return Ok(());
    }

    let num_workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let staged_bytes = staging.as_file().metadata()?.len();
    let mut workers: Vec<Box<dyn SampleProducer>> = Vec::with_capacity(num_workers);
    if staged_bytes <= SHARED_CLOUD_LIMIT {
        log::info!("caching staged cloud in memory ({staged_bytes} bytes)");
        let cloud = SharedCloud::load(&mut File::open(staging.path())?)?;
        for _ in 0..num_workers {
            workers.push(Box::new(cloud.unsorted_producer()));
        }
    } else {
        for _ in 0..num_workers {
            let handle = File::open(staging.path())?;
            workers.push(Box::new(UnsortedProducer::new(BufReader::new(handle))));
        }
    }

    let mut out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.output)?;

    let cfg = BuildConfig {
        bounds,
        voxels_per_axis: args.vpa,
        format,
        optimize: args.optimize,
        color_filter: args.filter,
        color_threshold: args.threshold,
    };
    let status = build_tree(workers, &mut out, &cfg)?;
    println!(
        "built {} nodes ({} leafs{})",
        status.num_nodes,
        status.num_leafs,
        match &status.optimized {
            Some(opt) => format!(", {} merged", opt.num_merged),
            None => String::new(),
        }
    );

    if args.compress {
        log::info!("compressing {}", args.output.display());
        compress_output(&mut out, &args.output)?;
    }

    Ok(())
}

/// Parse the text cloud into binary sample records, returning the cube that
/// encloses the transformed points.
fn parse_cloud<R: BufRead, W: Write>(
    reader: &mut R,
    total_bytes: u64,
    reflect: bool,
    transform: &DMat4,
    writer: &mut W,
) -> Result<Bounds, Box<dyn std::error::Error>> {
    let mut line = String::new();
    let mut consumed = 0u64;
    let mut last_progress = u64::MAX;
    let mut parse_error: Option<String> = None;

    let samples = std::iter::from_fn(|| loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return None,
            Ok(n) => {
                consumed += n as u64;
                if total_bytes > 0 {
                    let progress = consumed * 100 / total_bytes;
                    if progress / 10 != last_progress {
                        last_progress = progress / 10;
                        log::info!("progress: {progress}%");
                    }
                }
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                match parse_line(text, reflect) {
                    Ok(mut sample) => {
                        let p = transform.transform_point3(DVec3::new(
                            sample.position.x,
                            sample.position.y,
                            sample.position.z,
                        ));
                        sample.position = Point::new(p.x, p.y, p.z);
                        return Some(sample);
                    }
                    Err(err) => {
                        parse_error = Some(err);
                        return None;
                    }
                }
            }
            Err(err) => {
                parse_error = Some(err.to_string());
                return None;
            }
        }
    });

    let bounds = filter_input(samples, writer)?;
    match parse_error {
        Some(err) => Err(err.into()),
        None => Ok(bounds),
    }
}

fn parse_line(text: &str, reflect: bool) -> Result<Sample, String> {
    let mut fields = text.split_whitespace();
    let mut next_f64 = |name: &str| -> Result<f64, String> {
        fields
            .next()
            .ok_or_else(|| format!("missing {name} in {text:?}"))?
            .parse::<f64>()
            .map_err(|err| format!("bad {name} in {text:?}: {err}"))
    };

    let x = next_f64("x")?;
    let y = next_f64("y")?;
    let z = next_f64("z")?;
    if reflect {
        next_f64("reflection")?;
    }
    let r = next_f64("r")?;
    let g = next_f64("g")?;
    let b = next_f64("b")?;

    Ok(Sample {
        position: Point::new(x, y, z),
        color: Color::new(
            (r / 255.0) as f32,
            (g / 255.0) as f32,
            (b / 255.0) as f32,
            1.0,
        ),
    })
}

fn compress_output(out: &mut File, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut compressed = match dir {
        Some(dir) => NamedTempFile::new_in(dir)?,
        None => NamedTempFile::new_in(".")?,
    };

    out.seek(SeekFrom::Start(0))?;
    {
        let mut writer = BufWriter::new(compressed.as_file_mut());
        compress_tree(&mut BufReader::new(&mut *out), &mut writer)?;
        writer.flush()?;
    }
    compressed.persist(path)?;
    Ok(())
}

fn parse_format(name: &str) -> Option<OctreeFormat> {
    Some(match name {
        "R8G8B8A8UnpackUI32" => OctreeFormat::R8G8B8A8UnpackUI32,
        "R8G8B8A8UnpackUI16" => OctreeFormat::R8G8B8A8UnpackUI16,
        "R4G4B4A4UnpackUI16" => OctreeFormat::R4G4B4A4UnpackUI16,
        "R5G6B5UnpackUI16" => OctreeFormat::R5G6B5UnpackUI16,
        "R8G8B8A8PackUI28" => OctreeFormat::R8G8B8A8PackUI28,
        "R4G4B4A4PackUI30" => OctreeFormat::R4G4B4A4PackUI30,
        "R5G6B5PackUI30" => OctreeFormat::R5G6B5PackUI30,
        "R3G3B2PackUI31" => OctreeFormat::R3G3B2PackUI31,
        _ => return None,
    })
}

fn parse_triplet(text: &str) -> Option<[f64; 3]> {
    let mut values = text.split(',').map(|v| v.trim().parse::<f64>().ok());
    let out = [values.next()??, values.next()??, values.next()??];
    values.next().is_none().then_some(out)
}

fn parse_bounds(text: &str) -> Option<Bounds> {
    let values: Vec<f64> = text
        .split(',')
        .map(|v| v.trim().parse::<f64>().ok())
        .collect::<Option<_>>()?;
    if values.len() != 4 {
        return None;
    }
    Some(Bounds::new(
        Point::new(values[0], values[1], values[2]),
        values[3],
    ))
}
