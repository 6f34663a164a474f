use std::mem;
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use log::debug;

use crate::worker::{FrameTransform, Job, TransformStep};

/// Pixel-block mosaic: every `scale_factor`-sized square takes its average colour.
///
/// Kinds mentioning "Gray" average luma instead of colour.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockMosaic;

impl FrameTransform for BlockMosaic {
    fn steps<'a>(&'a self, job: &'a Job) -> Box<dyn Iterator<Item = Result<TransformStep>> + 'a> {
        Box::new(MosaicSteps { job, state: MosaicState::Start })
    }
}

enum MosaicState {
    Start,
    Rows {
        image: RgbImage,
        block: u32,
        cols: u32,
        rows: u32,
        row: u32,
        gray: bool,
    },
    Finished,
}

struct MosaicSteps<'a> {
    job: &'a Job,
    state: MosaicState,
}

impl MosaicSteps<'_> {
    fn open(&self) -> Result<MosaicState> {
        let image = image::open(&self.job.source)
            .with_context(|| format!("failed decoding {}", self.job.source.display()))?
            .to_rgb8();
        let block = self.job.scale_factor.max(1);
        let cols = image.width().div_ceil(block);
        let rows = image.height().div_ceil(block);
        let gray = self.job.transform_kind.contains("Gray") || self.job.transform_kind.contains("Grey");
        debug!(
            "Frame {}: {}x{} px, {} blocks of {}px ({})",
            self.job.index,
            image.width(),
            image.height(),
            cols * rows,
            block,
            self.job.transform_kind
        );
        Ok(MosaicState::Rows { image, block, cols, rows, row: 0, gray })
    }
}

impl Iterator for MosaicSteps<'_> {
    type Item = Result<TransformStep>;

    fn next(&mut self) -> Option<Self::Item> {
        match mem::replace(&mut self.state, MosaicState::Finished) {
            MosaicState::Start => match self.open() {
                Ok(state) => {
                    let total = match &state {
                        MosaicState::Rows { cols, rows, .. } => u64::from(*cols) * u64::from(*rows),
                        _ => 0,
                    };
                    self.state = state;
                    Some(Ok(TransformStep::Total(total)))
                }
                Err(e) => Some(Err(e)),
            },
            MosaicState::Rows { mut image, block, cols, rows, row, gray } => {
                if row < rows {
                    for col in 0..cols {
                        fill_block(&mut image, col * block, row * block, block, gray);
                    }
                    let done = u64::from(row + 1) * u64::from(cols);
                    self.state = MosaicState::Rows { image, block, cols, rows, row: row + 1, gray };
                    Some(Ok(TransformStep::Progress(done)))
                } else {
                    let destination = &self.job.destination;
                    Some(
                        image
                            .save(destination)
                            .with_context(|| format!("failed writing {}", destination.display()))
                            .map(|_| TransformStep::Output(destination.clone())),
                    )
                }
            }
            MosaicState::Finished => None,
        }
    }
}

fn fill_block(image: &mut RgbImage, x0: u32, y0: u32, block: u32, gray: bool) {
    let x1 = (x0 + block).min(image.width());
    let y1 = (y0 + block).min(image.height());
    let mut sum = [0u64; 3];
    let mut count = 0u64;

    for y in y0..y1 {
        for x in x0..x1 {
            let Rgb(px) = *image.get_pixel(x, y);
            for (acc, channel) in sum.iter_mut().zip(px) {
                *acc += u64::from(channel);
            }
            count += 1;
        }
    }
    if count == 0 {
        return;
    }

    let mut avg = sum.map(|c| (c / count) as u8);
    if gray {
        // Rec. 601 luma
        let luma = (0.299 * f64::from(avg[0]) + 0.587 * f64::from(avg[1]) + 0.114 * f64::from(avg[2])).round() as u8;
        avg = [luma; 3];
    }

    for y in y0..y1 {
        for x in x0..x1 {
            image.put_pixel(x, y, Rgb(avg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunOptions;
    use std::path::Path;

    fn job(dir: &Path, kind: &str, scale: u32) -> Job {
        Job {
            index: 1,
            source: dir.join("file000001.png"),
            destination: dir.join("000001.png"),
            transform_kind: kind.to_string(),
            scale_factor: scale,
            options: RunOptions { process_count: 1, frame_rate: 30.0, quality: true },
        }
    }

    fn write_checker(path: &Path, width: u32, height: u32) {
        let img = RgbImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 { Rgb([200, 0, 0]) } else { Rgb([0, 0, 100]) }
        });
        img.save(path).unwrap();
    }

    #[test]
    fn test_mosaic_yields_total_rows_then_output() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), "Blocks Image", 4);
        write_checker(&job.source, 10, 6);

        let steps: Vec<TransformStep> = BlockMosaic.steps(&job).map(|s| s.unwrap()).collect();

        // 3 columns x 2 rows of 4px blocks (edges are partial)
        assert_eq!(steps.first(), Some(&TransformStep::Total(6)));
        assert_eq!(&steps[1..3], &[TransformStep::Progress(3), TransformStep::Progress(6)]);
        assert_eq!(steps.last(), Some(&TransformStep::Output(job.destination.clone())));

        let out = image::open(&job.destination).unwrap().to_rgb8();
        assert_eq!(out.dimensions(), (10, 6));
        // a full block averages the checkerboard evenly
        assert_eq!(out.get_pixel(0, 0), &Rgb([100, 0, 50]));
        assert_eq!(out.get_pixel(0, 0), out.get_pixel(3, 3));
    }

    #[test]
    fn test_gray_kind_averages_luma() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), "Gray Blocks Image", 2);
        write_checker(&job.source, 4, 4);

        assert!(BlockMosaic.steps(&job).all(|s| s.is_ok()));
        let px = *image::open(&job.destination).unwrap().to_rgb8().get_pixel(1, 1);
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
    }

    #[test]
    fn test_unreadable_source_fails_first_step() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), "Blocks Image", 4);
        std::fs::write(&job.source, b"not an image").unwrap();

        let mut steps = BlockMosaic.steps(&job);
        let first = steps.next().unwrap();
        assert!(first.unwrap_err().to_string().contains("failed decoding"));
        assert!(steps.next().is_none());
    }
}
