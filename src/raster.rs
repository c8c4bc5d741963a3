//! Turn a PDF into a single cleaned-up page image, ready for OCR.
//!
//! We only look at the first page. Our inputs are one-page business forms,
//! and anything after page one is ignored.

use std::{collections::BTreeMap, sync::Arc};

use image::{GrayImage, ImageFormat};
use imageproc::{
    filter::median_filter,
    morphology::{Mask, grayscale_erode},
};
use tokio::process::Command;

use crate::{
    artifacts::{artifact_path, write_artifact},
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    errors::ItemError,
    prelude::*,
};

/// Resolution used to rasterize PDF pages.
pub const RASTER_DPI: u32 = 300;

/// Radius of the median filter. A radius of 1 is a 3x3 kernel.
const MEDIAN_RADIUS: u32 = 1;

/// Radius of the square erosion mask. A radius of 1 is a 3x3 square.
const EROSION_RADIUS: u8 = 1;

/// A single-channel page image.
#[derive(Clone, Debug)]
pub struct PageRaster {
    image: GrayImage,
}

impl PageRaster {
    /// Wrap a grayscale image.
    pub fn new(image: GrayImage) -> Self {
        Self { image }
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Raw pixel bytes, one byte per pixel, row-major.
    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Encode as PNG.
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut png = std::io::Cursor::new(vec![]);
        self.image
            .write_to(&mut png, ImageFormat::Png)
            .context("failed to encode page as PNG")?;
        Ok(png.into_inner())
    }
}

/// Renders the first page of a document as a grayscale image.
#[async_trait]
pub trait PageRenderer: Send + Sync + 'static {
    /// Render the first page of `path` at `dpi`.
    async fn render_first_page(&self, path: &Path, dpi: u32) -> Result<GrayImage, ItemError>;
}

/// A [`PageRenderer`] using Poppler's `pdfinfo` and `pdftocairo` tools.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct PopplerRenderer {}

impl PopplerRenderer {
    /// Create a new Poppler renderer.
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl PageRenderer for PopplerRenderer {
    #[instrument(level = "debug", skip_all, fields(path = %path.display(), dpi))]
    async fn render_first_page(&self, path: &Path, dpi: u32) -> Result<GrayImage, ItemError> {
        let load_err = |err: anyhow::Error| ItemError::document_load(path, format!("{err:#}"));

        // Catch obviously wrong inputs before we spawn anything.
        let mime_type = get_mime_type(path).map_err(load_err)?;
        if mime_type != "application/pdf" {
            return Err(ItemError::document_load(
                path,
                format!("expected a PDF, found {mime_type}"),
            ));
        }
        let page_count = get_pdf_page_count(path).await.map_err(load_err)?;
        if page_count == 0 {
            return Err(ItemError::document_load(path, "document has no pages"));
        }

        // Render page 1 only, straight to grayscale.
        let tmpdir = tempfile::TempDir::with_prefix("raster")
            .context("failed to create temporary directory")
            .map_err(load_err)?;
        let out_base = tmpdir.path().join("page");
        let output = Command::new("pdftocairo")
            .arg("-png")
            .arg("-gray")
            .arg("-singlefile")
            .args(["-f", "1", "-l", "1"])
            .arg("-r")
            .arg(dpi.to_string())
            .arg(path)
            .arg(&out_base)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run pdftocairo on {:?}", path.display()))
            .map_err(load_err)?;
        check_for_command_failure("pdftocairo", &output, None).map_err(load_err)?;

        let png_path = out_base.with_extension("png");
        let image = spawn_blocking_propagating_panics(move || -> Result<GrayImage> {
            let image = image::open(&png_path)
                .with_context(|| format!("failed to read rendered page {:?}", png_path))?;
            Ok(image.to_luma8())
        })
        .await
        .and_then(|image| image)
        .map_err(load_err)?;
        debug!(width = image.width(), height = image.height(), "Rendered page");
        Ok(image)
    }
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    // Run pdfinfo to get the number of pages.
    let output = Command::new("pdfinfo")
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    // Parse the output of pdfinfo into properties.
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_page_count(&output).with_context(|| {
        format!("failed to get page count for {:?}", path.display())
    })
}

/// Extract the `Pages:` value from `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key, value);
    }
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("no page count in pdfinfo output"))?;
    page_count_str
        .parse::<usize>()
        .with_context(|| format!("bad page count {:?}", page_count_str))
}

/// Get the MIME type of a file.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}

/// Clean up a scanned page: a 3x3 median blur to remove speckle, then a 3x3
/// erosion to firm up glyph strokes.
///
/// Erosion takes the grayscale local minimum, so dark text on a light
/// background gets slightly bolder and grey levels are kept.
pub fn preprocess(image: &GrayImage) -> GrayImage {
    let blurred = median_filter(image, MEDIAN_RADIUS, MEDIAN_RADIUS);
    grayscale_erode(&blurred, &Mask::square(EROSION_RADIUS))
}

/// Renders and preprocesses documents, optionally saving the cleaned raster.
pub struct Rasterizer {
    /// How we render pages.
    renderer: Arc<dyn PageRenderer>,

    /// Where to save cleaned rasters, if anywhere.
    image_dir: Option<PathBuf>,
}

impl Rasterizer {
    /// Create a new rasterizer.
    pub fn new(renderer: Arc<dyn PageRenderer>, image_dir: Option<PathBuf>) -> Self {
        Self {
            renderer,
            image_dir,
        }
    }

    /// Render and clean the first page of `path`.
    ///
    /// If we can't save the debug image, we push a message onto `warnings` and
    /// carry on.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn rasterize(
        &self,
        path: &Path,
        warnings: &mut Vec<String>,
    ) -> Result<PageRaster, ItemError> {
        let image = self.renderer.render_first_page(path, RASTER_DPI).await?;
        let cleaned = spawn_blocking_propagating_panics(move || preprocess(&image))
            .await
            .map_err(|err| ItemError::document_load(path, format!("{err:#}")))?;
        let raster = PageRaster::new(cleaned);
        trace!(
            width = raster.width(),
            height = raster.height(),
            bytes = raster.as_bytes().len(),
            "Cleaned page"
        );

        if let Some(image_dir) = &self.image_dir
            && let Err(err) = save_raster(image_dir, path, &raster).await
        {
            warnings.push(format!("could not save cleaned page image: {err:#}"));
        }
        Ok(raster)
    }
}

/// Save a raster as `<image_dir>/<basename>.png`.
async fn save_raster(image_dir: &Path, source: &Path, raster: &PageRaster) -> Result<()> {
    let path = artifact_path(image_dir, source, "png")?;
    let png = raster.to_png()?;
    write_artifact(&path, &png).await?;
    Ok(())
}
