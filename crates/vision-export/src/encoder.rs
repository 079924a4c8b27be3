//! Multi-plane TIFF artifacts
//!
//! One capture produces colour pages (RGBA8), a depth page (f32) and a stencil
//! page (u8). They are written either as pages of a single TIFF or as three
//! files (`<name>.tiff`, `<name>-depth.tiff`, `<name>-stencil.tiff`).
//!
//! Plane sizes are validated before anything touches the disk. Each file is
//! written to a `.part` sibling and renamed into place, so a failed encode
//! never leaves a partial artifact behind.
//!
//! Encoding runs on the blocking pool. [`ImageEncoder`] keeps at most one
//! encode in flight: submitting the next capture first waits for the previous
//! one.

use bytes::Bytes;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tiff::encoder::{colortype, compression::Lzw, TiffEncoder};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::inflight::InFlight;
use crate::world::CaptureBuffers;

const COLOR_BYTES_PER_PIXEL: usize = 4;
const DEPTH_BYTES_PER_PIXEL: usize = 4;
const STENCIL_BYTES_PER_PIXEL: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Color(usize),
    Depth,
    Stencil,
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plane::Color(i) => write!(f, "color[{i}]"),
            Plane::Depth => f.write_str("depth"),
            Plane::Stencil => f.write_str("stencil"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("{plane} plane has {actual} bytes, expected {expected} for {width}x{height}")]
    PlaneSize {
        plane: Plane,
        actual: usize,
        expected: usize,
        width: u32,
        height: u32,
    },
    #[error("capture has no color planes")]
    NoColorPlanes,
    #[error("capture has zero size ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("tiff encoding failed: {0}")]
    Tiff(#[from] tiff::TiffError),
    #[error("artifact io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode task ended without a result")]
    Abandoned,
}

/// How planes are split across files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArtifactLayout {
    /// Color pages, depth and stencil in one file
    #[default]
    SingleFile,
    /// Color stack plus separate depth and stencil files
    SplitFiles,
}

/// One capture's planes and where to write them.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    /// Artifact path without extension
    pub base_path: PathBuf,
    pub layout: ArtifactLayout,
    pub buffers: CaptureBuffers,
}

impl EncodeRequest {
    pub fn new(base_path: impl Into<PathBuf>, layout: ArtifactLayout, buffers: CaptureBuffers) -> Self {
        Self {
            base_path: base_path.into(),
            layout,
            buffers,
        }
    }

    /// Check every plane against the declared dimensions.
    pub fn validate(&self) -> Result<(), EncodeError> {
        let CaptureBuffers { width, height, .. } = self.buffers;
        if width == 0 || height == 0 {
            return Err(EncodeError::EmptyImage { width, height });
        }
        if self.buffers.colors.is_empty() {
            return Err(EncodeError::NoColorPlanes);
        }
        let pixels = width as usize * height as usize;
        let check = |plane: Plane, data: &Bytes, bytes_per_pixel: usize| {
            let expected = pixels * bytes_per_pixel;
            if data.len() == expected {
                Ok(())
            } else {
                Err(EncodeError::PlaneSize {
                    plane,
                    actual: data.len(),
                    expected,
                    width,
                    height,
                })
            }
        };
        for (i, color) in self.buffers.colors.iter().enumerate() {
            check(Plane::Color(i), color, COLOR_BYTES_PER_PIXEL)?;
        }
        check(Plane::Depth, &self.buffers.depth, DEPTH_BYTES_PER_PIXEL)?;
        check(Plane::Stencil, &self.buffers.stencil, STENCIL_BYTES_PER_PIXEL)?;
        Ok(())
    }

    /// Files this request produces.
    pub fn artifact_paths(&self) -> Vec<PathBuf> {
        match self.layout {
            ArtifactLayout::SingleFile => vec![suffixed(&self.base_path, "")],
            ArtifactLayout::SplitFiles => vec![
                suffixed(&self.base_path, ""),
                suffixed(&self.base_path, "-depth"),
                suffixed(&self.base_path, "-stencil"),
            ],
        }
    }
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    name.push(".tiff");
    base.with_file_name(name)
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Validate and write a request synchronously. Returns the final paths.
pub fn write_artifacts(request: &EncodeRequest) -> Result<Vec<PathBuf>, EncodeError> {
    request.validate()?;
    let paths = request.artifact_paths();
    let parts: Vec<PathBuf> = paths.iter().map(|p| part_path(p)).collect();

    let written = write_parts(request, &parts);
    if let Err(e) = written {
        for part in &parts {
            let _ = fs::remove_file(part);
        }
        return Err(e);
    }

    for (part, path) in parts.iter().zip(&paths) {
        if let Err(e) = fs::rename(part, path) {
            for part in &parts {
                let _ = fs::remove_file(part);
            }
            return Err(e.into());
        }
    }
    debug!(files = paths.len(), base = %request.base_path.display(), "artifacts written");
    Ok(paths)
}

fn write_parts(request: &EncodeRequest, parts: &[PathBuf]) -> Result<(), EncodeError> {
    let buffers = &request.buffers;
    match request.layout {
        ArtifactLayout::SingleFile => {
            let mut out = BufWriter::new(File::create(&parts[0])?);
            {
                let mut tiff = TiffEncoder::new(&mut out)?;
                write_color_pages(&mut tiff, buffers)?;
                write_depth_page(&mut tiff, buffers)?;
                write_stencil_page(&mut tiff, buffers)?;
            }
            out.flush()?;
        }
        ArtifactLayout::SplitFiles => {
            let writers: [PageWriter; 3] = [write_color_pages, write_depth_page, write_stencil_page];
            for (part, write) in parts.iter().zip(writers) {
                let mut out = BufWriter::new(File::create(part)?);
                {
                    let mut tiff = TiffEncoder::new(&mut out)?;
                    write(&mut tiff, buffers)?;
                }
                out.flush()?;
            }
        }
    }
    Ok(())
}

type PageTiff<'a> = TiffEncoder<&'a mut BufWriter<File>>;
type PageWriter = fn(&mut PageTiff<'_>, &CaptureBuffers) -> Result<(), EncodeError>;

fn write_color_pages(
    tiff: &mut PageTiff<'_>,
    buffers: &CaptureBuffers,
) -> Result<(), EncodeError> {
    for color in &buffers.colors {
        tiff.write_image_with_compression::<colortype::RGBA8, _>(
            buffers.width,
            buffers.height,
            Lzw,
            color,
        )?;
    }
    Ok(())
}

fn write_depth_page(
    tiff: &mut PageTiff<'_>,
    buffers: &CaptureBuffers,
) -> Result<(), EncodeError> {
    let depth: Vec<f32> = buffers
        .depth
        .chunks_exact(DEPTH_BYTES_PER_PIXEL)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    tiff.write_image_with_compression::<colortype::Gray32Float, _>(
        buffers.width,
        buffers.height,
        Lzw,
        &depth,
    )?;
    Ok(())
}

fn write_stencil_page(
    tiff: &mut PageTiff<'_>,
    buffers: &CaptureBuffers,
) -> Result<(), EncodeError> {
    tiff.write_image_with_compression::<colortype::Gray8, _>(
        buffers.width,
        buffers.height,
        Lzw,
        &buffers.stencil,
    )?;
    Ok(())
}

/// Result of an encode that is running in the background.
#[derive(Debug)]
pub struct PendingArtifact {
    rx: oneshot::Receiver<Result<Vec<PathBuf>, EncodeError>>,
}

impl PendingArtifact {
    /// Wait for the encode to finish.
    pub async fn written(self) -> Result<Vec<PathBuf>, EncodeError> {
        self.rx.await.unwrap_or(Err(EncodeError::Abandoned))
    }

    /// An artifact that already has its outcome.
    pub fn ready(result: Result<Vec<PathBuf>, EncodeError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

/// Background encoder with a single in-flight slot.
pub struct ImageEncoder {
    runtime: Handle,
    in_flight: InFlight<()>,
}

impl ImageEncoder {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            in_flight: InFlight::new("encode"),
        }
    }

    /// Validate on the caller's thread, then encode in the background.
    ///
    /// Blocks until the previously submitted encode has finished.
    pub fn submit(&mut self, request: EncodeRequest) -> Result<PendingArtifact, EncodeError> {
        request.validate()?;
        self.wait_idle();

        let (tx, rx) = oneshot::channel();
        let handle = self.runtime.spawn_blocking(move || {
            let result = write_artifacts(&request);
            if let Err(e) = &result {
                warn!(base = %request.base_path.display(), error = %e, "artifact encode failed");
            }
            let _ = tx.send(result);
        });
        self.in_flight.start(handle);
        Ok(PendingArtifact { rx })
    }

    /// Block until no encode is outstanding.
    pub fn wait_idle(&mut self) {
        if let Some(Err(e)) = self.in_flight.join(&self.runtime) {
            warn!(error = %e, "encode task panicked");
        }
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_idle()
    }
}
