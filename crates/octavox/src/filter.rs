//! Binary sample streams: the staging format between input parsing and the
//! tree build.
//!
//! Parsed clouds are flattened into fixed 28-byte records so that any
//! number of build workers can replay them independently. An external merge
//! sort on X lets a producer binary-search its slice of the cloud instead
//! of scanning everything.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::builder::{SampleProducer, SampleSink};
use crate::error::Result;
use crate::geom::{Bounds, Color, Point, Sample};

/// Bytes per staged record: three f64 coordinates plus four color bytes.
pub const FILTER_SAMPLE_SIZE: u64 = 28;

/// One staged sample record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterSample {
    pub position: Point,
    pub color: [u8; 4],
}

impl FilterSample {
    pub fn from_sample(sample: &Sample) -> Self {
        FilterSample {
            position: sample.position,
            color: sample.color.to_rgba8(),
        }
    }

    pub fn sample(&self) -> Sample {
        Sample {
            position: self.position,
            color: Color::from_rgba8(self.color),
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.position.x.to_le_bytes())?;
        writer.write_all(&self.position.y.to_le_bytes())?;
        writer.write_all(&self.position.z.to_le_bytes())?;
        writer.write_all(&self.color)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; FILTER_SAMPLE_SIZE as usize];
        reader.read_exact(&mut buf)?;
        Ok(Self::decode(&buf))
    }

    /// Like [`read_from`](Self::read_from) but a clean end of stream yields
    /// `None` instead of an error.
    pub fn read_opt<R: Read>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut buf = [0u8; FILTER_SAMPLE_SIZE as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated sample record",
                    ))
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(Some(Self::decode(&buf)))
    }

    fn decode(buf: &[u8; FILTER_SAMPLE_SIZE as usize]) -> Self {
        let f64_at = |off: usize| f64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        FilterSample {
            position: Point::new(f64_at(0), f64_at(8), f64_at(16)),
            color: [buf[24], buf[25], buf[26], buf[27]],
        }
    }
}

/// Drain `samples` into a binary record stream, tracking the cube that
/// encloses the cloud. An empty input yields a zero-sized cube.
pub fn filter_input<I, W>(samples: I, writer: &mut W) -> Result<Bounds>
where
    I: IntoIterator<Item = Sample>,
    W: Write,
{
    let mut min = Point::new(f64::MAX, f64::MAX, f64::MAX);
    let mut max = Point::new(f64::MIN, f64::MIN, f64::MIN);
    let mut any = false;

    for sample in samples {
        let p = sample.position;
        min = Point::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z));
        max = Point::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z));
        any = true;
        FilterSample::from_sample(&sample).write_to(writer)?;
    }

    if !any {
        return Ok(Bounds::default());
    }
    let size = (max.x - min.x).max(max.y - min.y).max(max.z - min.z);
    Ok(Bounds::new(min, size))
}

/// External merge sort of a record stream on the X coordinate. The stream
/// is cut into `num_slices` pieces (grown until they divide the record
/// count), each sorted in memory and spilled, then k-way merged.
pub fn sort_samples<R, W>(reader: &mut R, writer: &mut W, num_slices: usize) -> Result<()>
where
    R: Read + Seek,
    W: Write,
{
    let size = reader.seek(SeekFrom::End(0))?;
    let num_records = size / FILTER_SAMPLE_SIZE;
    if num_records == 0 {
        return Ok(());
    }

    let mut slices = num_slices.max(1) as u64;
    while num_records % slices != 0 {
        slices += 1;
    }
    let per_slice = num_records / slices;

    reader.seek(SeekFrom::Start(0))?;
    let mut spills = Vec::with_capacity(slices as usize);
    for _ in 0..slices {
        let mut batch = Vec::with_capacity(per_slice as usize);
        for _ in 0..per_slice {
            batch.push(FilterSample::read_from(reader)?);
        }
        batch.sort_unstable_by(|a, b| a.position.x.total_cmp(&b.position.x));

        let mut spill = tempfile::tempfile()?;
        for record in &batch {
            record.write_to(&mut spill)?;
        }
        spill.seek(SeekFrom::Start(0))?;
        spills.push(spill);
    }

    let mut heads: Vec<Option<FilterSample>> = Vec::with_capacity(spills.len());
    for spill in spills.iter_mut() {
        heads.push(FilterSample::read_opt(spill)?);
    }

    loop {
        let mut winner: Option<usize> = None;
        for (i, head) in heads.iter().enumerate() {
            if let Some(record) = head {
                let better = match winner {
                    None => true,
                    Some(w) => record.position.x < heads[w].as_ref().unwrap().position.x,
                };
                if better {
                    winner = Some(i);
                }
            }
        }
        let Some(winner) = winner else { break };
        heads[winner].take().unwrap().write_to(writer)?;
        heads[winner] = FilterSample::read_opt(&mut spills[winner])?;
    }
    Ok(())
}

/// A staged cloud held in memory once and shared by any number of build
/// workers, each reading through its own cursor. Worth it for clouds small
/// enough to cache; larger ones stay on per-worker file handles.
#[derive(Clone)]
pub struct SharedCloud {
    data: Arc<[u8]>,
}

impl SharedCloud {
    pub fn load<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(SharedCloud { data: data.into() })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn unsorted_producer(&self) -> UnsortedProducer<Cursor<Arc<[u8]>>> {
        UnsortedProducer::new(Cursor::new(self.data.clone()))
    }

    /// Producer assuming the records are X-sorted (see [`sort_samples`]).
    pub fn sorted_producer(&self) -> Result<SortedProducer<Cursor<Arc<[u8]>>>> {
        SortedProducer::new(Cursor::new(self.data.clone()))
    }
}

/// Replays an unsorted record stream in full for every request.
pub struct UnsortedProducer<R> {
    reader: R,
}

impl<R: Read + Seek> UnsortedProducer<R> {
    pub fn new(reader: R) -> Self {
        UnsortedProducer { reader }
    }
}

impl<R: Read + Seek + Send> SampleProducer for UnsortedProducer<R> {
    fn produce(&mut self, bounds: Bounds, sink: &mut SampleSink<'_>) -> Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        while let Some(record) = FilterSample::read_opt(&mut self.reader)? {
            let sample = record.sample();
            if bounds.contains(sample.position) {
                sink.push(sample);
            }
        }
        Ok(())
    }
}

/// Serves an X-sorted record stream: binary-searches the first candidate
/// record and stops once records pass the right face of the request.
pub struct SortedProducer<R> {
    reader: R,
    num_records: u64,
}

impl<R: Read + Seek> SortedProducer<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let size = reader.seek(SeekFrom::End(0))?;
        Ok(SortedProducer {
            reader,
            num_records: size / FILTER_SAMPLE_SIZE,
        })
    }

    fn record_at(&mut self, index: u64) -> Result<FilterSample> {
        self.reader
            .seek(SeekFrom::Start(index * FILTER_SAMPLE_SIZE))?;
        Ok(FilterSample::read_from(&mut self.reader)?)
    }
}

impl<R: Read + Seek + Send> SampleProducer for SortedProducer<R> {
    fn produce(&mut self, bounds: Bounds, sink: &mut SampleSink<'_>) -> Result<()> {
        let mut lo = 0u64;
        let mut hi = self.num_records;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.record_at(mid)?.position.x >= bounds.pos.x {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }

        self.reader.seek(SeekFrom::Start(lo * FILTER_SAMPLE_SIZE))?;
        let right_face = bounds.pos.x + bounds.size;
        while let Some(record) = FilterSample::read_opt(&mut self.reader)? {
            let sample = record.sample();
            if bounds.contains(sample.position) {
                sink.push(sample);
            } else if sample.position.x > right_face {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_tree, BuildConfig};
    use crate::format::{decode_header, OctreeFormat};
    use std::io::Cursor;

    fn cloud() -> Vec<Sample> {
        let mut samples = Vec::new();
        for i in 0..20 {
            // Scatter across x in a deliberately unsorted order.
            let x = ((i * 7) % 20) as f64 / 20.0 + 0.01;
            samples.push(Sample {
                position: Point::new(x, 0.25, 0.25),
                color: Color::new(i as f32 / 20.0, 0.5, 0.25, 1.0),
            });
        }
        samples
    }

    #[test]
    fn record_round_trip() {
        let sample = Sample {
            position: Point::new(1.5, -2.25, 3.125),
            color: Color::new(1.0, 0.5, 0.0, 1.0),
        };
        let record = FilterSample::from_sample(&sample);

        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, FILTER_SAMPLE_SIZE);

        let back = FilterSample::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.sample().position, sample.position);
    }

    #[test]
    fn read_opt_distinguishes_eof_from_truncation() {
        let mut empty = Cursor::new(Vec::new());
        assert!(FilterSample::read_opt(&mut empty).unwrap().is_none());

        let mut truncated = Cursor::new(vec![0u8; 10]);
        assert!(FilterSample::read_opt(&mut truncated).is_err());
    }

    #[test]
    fn filter_input_tracks_the_bounding_cube() {
        let samples = vec![
            Sample {
                position: Point::new(-1.0, 0.0, 2.0),
                color: Color::new(1.0, 1.0, 1.0, 1.0),
            },
            Sample {
                position: Point::new(3.0, 1.0, 0.0),
                color: Color::new(0.0, 0.0, 0.0, 1.0),
            },
        ];

        let mut buf = Vec::new();
        let bounds = filter_input(samples, &mut buf).unwrap();
        assert_eq!(buf.len() as u64, 2 * FILTER_SAMPLE_SIZE);
        assert_eq!(bounds.pos, Point::new(-1.0, 0.0, 0.0));
        assert_eq!(bounds.size, 4.0);
    }

    #[test]
    fn sort_orders_records_by_x() {
        let mut staged = Cursor::new(Vec::new());
        filter_input(cloud(), &mut staged).unwrap();

        let mut sorted = Cursor::new(Vec::new());
        sort_samples(&mut staged, &mut sorted, 4).unwrap();

        sorted.set_position(0);
        let mut last = f64::MIN;
        let mut count = 0;
        while let Some(record) = FilterSample::read_opt(&mut sorted).unwrap() {
            assert!(record.position.x >= last);
            last = record.position.x;
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn sorted_and_unsorted_producers_agree() {
        let mut staged = Cursor::new(Vec::new());
        filter_input(cloud(), &mut staged).unwrap();
        let mut sorted = Cursor::new(Vec::new());
        sort_samples(&mut staged, &mut sorted, 3).unwrap();

        let bounds = Bounds::new(Point::new(0.0, 0.0, 0.0), 0.5);
        staged.set_position(0);
        sorted.set_position(0);

        fn build_with<P: SampleProducer>(producer: P, bounds: Bounds) -> (u64, Vec<u8>) {
            let mut out = Cursor::new(Vec::new());
            let cfg = BuildConfig::new(bounds, 1, OctreeFormat::R8G8B8A8UnpackUI32);
            build_tree(vec![producer], &mut out, &cfg).unwrap();
            let bytes = out.into_inner();
            let header = decode_header(&mut Cursor::new(&bytes)).unwrap();
            (header.num_nodes, bytes)
        }

        let (unsorted_nodes, unsorted_bytes) =
            build_with(UnsortedProducer::new(staged.clone()), bounds);
        let (sorted_nodes, sorted_bytes) =
            build_with(SortedProducer::new(sorted.clone()).unwrap(), bounds);

        assert_eq!(unsorted_nodes, sorted_nodes);
        assert_eq!(unsorted_bytes, sorted_bytes);
    }

    #[test]
    fn shared_cloud_matches_stream_producers() {
        let mut staged = Cursor::new(Vec::new());
        filter_input(cloud(), &mut staged).unwrap();
        staged.set_position(0);

        let shared = SharedCloud::load(&mut staged).unwrap();
        assert_eq!(shared.len() as u64, 20 * FILTER_SAMPLE_SIZE);

        let bounds = Bounds::new(Point::new(0.0, 0.0, 0.0), 0.5);
        let mut reference = Cursor::new(Vec::new());
        let cfg = BuildConfig::new(bounds, 1, OctreeFormat::R8G8B8A8UnpackUI32);
        build_tree(
            vec![UnsortedProducer::new(staged.clone())],
            &mut reference,
            &cfg,
        )
        .unwrap();

        // Two workers sharing one in-memory copy produce the same tree.
        let mut shared_out = Cursor::new(Vec::new());
        let workers = vec![shared.unsorted_producer(), shared.unsorted_producer()];
        build_tree(workers, &mut shared_out, &cfg).unwrap();

        assert_eq!(shared_out.into_inner(), reference.into_inner());
    }
}
