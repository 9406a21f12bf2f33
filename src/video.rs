//! Video files decoded with OpenCV.

use crate::{
    error::Error,
    sampler::{Raster, VideoSource},
};
use num_traits::ToPrimitive;
use opencv::{
    core::{Mat, Size, Vec3b},
    imgproc::{cvt_color, resize, COLOR_BGR2RGB, INTER_LINEAR},
    prelude::*,
    videoio::{VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_POS_MSEC},
};
use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tracing::{debug, info};

pub struct OpenCvSource {
    path: PathBuf,
    capture: VideoCapture,
    duration: f64,
    position: f64,
    frame: Mat,
    resized: Mat,
    rgb: Mat,
}

impl OpenCvSource {
    pub fn open<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_owned();
        let capture = VideoCapture::from_file(&path.to_string_lossy(), CAP_ANY)
            .map_err(|e| Error::OpenVideo(e, path.clone()))?;
        if !capture
            .is_opened()
            .map_err(|e| Error::OpenVideo(e, path.clone()))?
        {
            return Err(Error::VideoNotOpened(path));
        }

        let frames = capture
            .get(CAP_PROP_FRAME_COUNT)
            .map_err(Error::GetVideoProperty)?;
        let fps = capture.get(CAP_PROP_FPS).map_err(Error::GetVideoProperty)?;
        let duration = if fps > 0.0 && frames.is_finite() {
            frames.max(0.0) / fps
        } else {
            0.0
        };
        info!(?path, frames, fps, duration, "opened video");

        Ok(Self {
            path,
            capture,
            duration,
            position: 0.0,
            frame: Mat::default(),
            resized: Mat::default(),
            rgb: Mat::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VideoSource for OpenCvSource {
    fn duration(&self) -> f64 {
        self.duration
    }

    fn seek(&mut self, timestamp: f64, timeout: Duration) -> Result<(), Error> {
        let start = Instant::now();
        let settled = self
            .capture
            .set(CAP_PROP_POS_MSEC, timestamp * 1000.0)
            .map_err(Error::Seek)?;
        let elapsed = start.elapsed();
        if !settled || elapsed > timeout {
            debug!(timestamp, ?elapsed, settled, "seek did not settle");
            return Err(Error::SeekTimeout {
                timestamp,
                timeout_ms: timeout.as_millis(),
            });
        }
        self.position = timestamp;
        Ok(())
    }

    fn capture(&mut self, width: u32, height: u32) -> Result<Raster, Error> {
        if !self
            .capture
            .read(&mut self.frame)
            .map_err(Error::CaptureFrame)?
        {
            return Err(Error::FrameUnavailable(self.position));
        }

        let size = Size::new(
            width.to_i32().unwrap_or(i32::MAX),
            height.to_i32().unwrap_or(i32::MAX),
        );
        resize(&self.frame, &mut self.resized, size, 0.0, 0.0, INTER_LINEAR)
            .map_err(Error::ResizeFrame)?;
        cvt_color(&self.resized, &mut self.rgb, COLOR_BGR2RGB, 0).map_err(Error::CaptureFrame)?;

        let bytes = self
            .rgb
            .data_typed::<Vec3b>()
            .map_err(Error::CaptureFrame)?
            .iter()
            .flat_map(|pixel| pixel.0)
            .collect::<Vec<_>>();
        let shape = (
            height.to_usize().unwrap_or(0),
            width.to_usize().unwrap_or(0),
            3,
        );
        Raster::from_shape_vec(shape, bytes).map_err(Error::ConvertFrame)
    }
}
