//! Turns uploaded reference images into a kohya_ss-style dataset.
//!
//! The trainer reads `train_data_dir` as a parent of concept folders named
//! `<repeats>_<concept>`, each holding images with `.txt` caption sidecars.

use crate::command::CAPTION_EXTENSION;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::path_component;
use crate::progress::{LogSink, ProgressEvent};
use image::imageops::{self, FilterType};
use image::{ImageFormat, ImageReader, RgbImage};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_CONCEPT: &str = "concept";
pub const CONCEPT_REPEATS: u32 = 1;

/// One uploaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInput {
    pub source: PathBuf,
    /// Name the client uploaded it under, when known.
    pub original_name: Option<String>,
}

impl DatasetInput {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self { source: source.into(), original_name: None }
    }

    fn display_name(&self) -> String {
        self.original_name.clone().unwrap_or_else(|| self.source.display().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct DatasetRequest {
    pub inputs: Vec<DatasetInput>,
    /// Parent of the concept folder (the job's `dataset/images`).
    pub images_dir: PathBuf,
    pub resolution: u32,
    pub trigger: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDataset {
    /// Directory to hand the trainer as `--train_data_dir`.
    pub images_dir: PathBuf,
    pub concept_dir: PathBuf,
    pub image_count: usize,
}

/// `<repeats>_<concept>` folder name for a character name.
///
/// The name is reduced to a single path component, so the folder always sits
/// directly under the dataset's images directory.
pub fn concept_folder_name(name: &str) -> String {
    let concept = path_component(name).unwrap_or_else(|| DEFAULT_CONCEPT.to_string());
    format!("{CONCEPT_REPEATS}_{concept}")
}

/// Letterbox, resize and caption every input, in order.
///
/// Output files are `NNN.png` with `NNN.txt` alongside, numbered from zero.
/// Any unreadable input fails the whole dataset.
///
/// # Arguments
/// * `request` - Inputs, target directory, resolution, trigger and name
/// * `sink` - Receives the preparing and prepared milestones
///
/// # Returns
/// Where the dataset landed and how many images it holds
///
/// # Errors
/// Returns `Dataset` for a zero resolution or an unreadable image, and `Io`
/// if the dataset cannot be written
pub fn prepare_dataset(request: &DatasetRequest, sink: &dyn LogSink) -> TrainingResult<PreparedDataset> {
    if request.resolution == 0 {
        return Err(TrainingError::Dataset("resolution must be positive".to_string()));
    }

    let concept_dir = request.images_dir.join(concept_folder_name(&request.name));
    std::fs::create_dir_all(&concept_dir)?;
    sink.event(ProgressEvent::PreparingDataset);

    let caption = format!("{} {}", request.trigger, request.name);
    for (idx, input) in request.inputs.iter().enumerate() {
        let image = load_rgb(input)?;
        let square = letterbox(&image, request.resolution);

        let image_path = concept_dir.join(format!("{idx:03}.png"));
        square.save_with_format(&image_path, ImageFormat::Png)?;
        std::fs::write(concept_dir.join(format!("{idx:03}{CAPTION_EXTENSION}")), &caption)?;
        debug!(source = %input.source.display(), dest = %image_path.display(), "Prepared dataset image");
    }

    sink.event(ProgressEvent::DatasetReady);
    Ok(PreparedDataset {
        images_dir: request.images_dir.clone(),
        concept_dir,
        image_count: request.inputs.len(),
    })
}

fn load_rgb(input: &DatasetInput) -> TrainingResult<RgbImage> {
    let unreadable = |e: &dyn std::fmt::Display| {
        TrainingError::Dataset(format!("cannot read image {}: {e}", input.display_name()))
    };
    let image = ImageReader::open(&input.source)
        .and_then(ImageReader::with_guessed_format)
        .map_err(|e| unreadable(&e))?
        .decode()
        .map_err(|e| unreadable(&e))?;
    Ok(image.to_rgb8())
}

/// Center `image` on a black square canvas, then resize it to `resolution²`.
pub fn letterbox(image: &RgbImage, resolution: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let side = width.max(height);
    let mut canvas = RgbImage::new(side, side);
    imageops::overlay(&mut canvas, image, i64::from((side - width) / 2), i64::from((side - height) / 2));
    imageops::resize(&canvas, resolution, resolution, FilterType::Lanczos3)
}

/// Sorted regular files of `dir`, as dataset inputs.
pub fn inputs_from_dir(dir: &Path) -> TrainingResult<Vec<DatasetInput>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files
        .into_iter()
        .map(|path| DatasetInput {
            original_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            source: path,
        })
        .collect())
}
