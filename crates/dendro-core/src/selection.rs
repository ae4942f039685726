use std::ops::Range;

use dendro_nwb::{AxisSelection, HierarchicalFile, Hyperslab};
use ndarray::{Array3, ArrayView3, Axis, Ix3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProcessorError, SelectionError};
use crate::series::ImagingSeries;

/// Pixels removed from each edge of a frame, serialized as `[top, bottom, left, right]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct CropEdges {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl CropEdges {
    pub fn new(top: usize, bottom: usize, left: usize, right: usize) -> Self {
        Self {
            top,
            bottom,
            left,
            right,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl TryFrom<Vec<usize>> for CropEdges {
    type Error = SelectionError;

    fn try_from(values: Vec<usize>) -> Result<Self, Self::Error> {
        match values.as_slice() {
            &[top, bottom, left, right] => Ok(Self::new(top, bottom, left, right)),
            other => Err(SelectionError::CropLength(other.len())),
        }
    }
}

impl From<CropEdges> for Vec<usize> {
    fn from(crop: CropEdges) -> Self {
        vec![crop.top, crop.bottom, crop.left, crop.right]
    }
}

/// Which frames and which part of each frame to hand to the estimator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSelection {
    pub frames: Vec<usize>,
    pub crop: CropEdges,
    /// Swap the spatial axes so the result is (time, y, x).
    pub transpose: bool,
}

impl FrameSelection {
    /// Missing frame indices mean every frame in order; a missing crop means none.
    pub fn resolve(
        total_frames: usize,
        frames: Option<&[usize]>,
        crop: Option<CropEdges>,
        transpose: bool,
    ) -> Self {
        Self {
            frames: frames
                .map(<[usize]>::to_vec)
                .unwrap_or_else(|| (0..total_frames).collect()),
            crop: crop.unwrap_or_default(),
            transpose,
        }
    }

    /// Checks the selection against a stored `(time, x, y)` shape.
    pub fn plan(&self, shape: [usize; 3]) -> Result<SelectionPlan, SelectionError> {
        let [total, width, height] = shape;
        if self.frames.is_empty() {
            return Err(SelectionError::NoFrames);
        }
        if let Some(&index) = self.frames.iter().find(|&&index| index >= total) {
            return Err(SelectionError::FrameOutOfRange { index, total });
        }

        let x = kept_range("x", width, self.crop.left, self.crop.right)?;
        let y = kept_range("y", height, self.crop.top, self.crop.bottom)?;

        Ok(SelectionPlan {
            frames: self.frames.clone(),
            x,
            y,
            transpose: self.transpose,
        })
    }
}

/// A selection validated against a concrete series shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionPlan {
    pub frames: Vec<usize>,
    pub x: Range<usize>,
    pub y: Range<usize>,
    pub transpose: bool,
}

impl SelectionPlan {
    pub fn hyperslab(&self) -> Hyperslab {
        Hyperslab::new(vec![
            AxisSelection::Indices(self.frames.clone()),
            AxisSelection::Range(self.x.clone()),
            AxisSelection::Range(self.y.clone()),
        ])
    }

    pub fn output_shape(&self) -> [usize; 3] {
        let frames = self.frames.len();
        if self.transpose {
            [frames, self.y.len(), self.x.len()]
        } else {
            [frames, self.x.len(), self.y.len()]
        }
    }

    fn orient(&self, movie: Array3<f64>) -> Array3<f64> {
        if self.transpose {
            movie.permuted_axes([0, 2, 1]).as_standard_layout().into_owned()
        } else {
            movie
        }
    }
}

/// Zero crop keeps the full extent, so the end of the range is never `extent - 0 - 1`.
fn kept_range(
    axis: &'static str,
    extent: usize,
    start_crop: usize,
    end_crop: usize,
) -> Result<Range<usize>, SelectionError> {
    let crop = start_crop.saturating_add(end_crop);
    if crop >= extent {
        return Err(SelectionError::CropTooLarge { axis, crop, extent });
    }
    Ok(start_crop..extent - end_crop)
}

/// Reads the selected sub-volume of `series` from `file`.
pub fn extract_movie(
    file: &dyn HierarchicalFile,
    series: &ImagingSeries,
    plan: &SelectionPlan,
) -> Result<Array3<f64>, ProcessorError> {
    let raw = file.read(&series.data_path, &plan.hyperslab())?;
    let movie = raw
        .into_dimensionality::<Ix3>()
        .map_err(|_| SelectionError::Rank(series.shape.to_vec()))?;
    let movie = plan.orient(movie);
    debug!(
        series = %series.path,
        shape = ?movie.shape(),
        "extracted movie"
    );
    Ok(movie)
}

/// Applies a selection to a volume already in memory.
pub fn select_volume(
    volume: ArrayView3<'_, f64>,
    selection: &FrameSelection,
) -> Result<Array3<f64>, SelectionError> {
    let (total, width, height) = volume.dim();
    let plan = selection.plan([total, width, height])?;
    let frames = volume.select(Axis(0), &plan.frames);
    let cropped = frames
        .slice(ndarray::s![.., plan.x.clone(), plan.y.clone()])
        .to_owned();
    Ok(plan.orient(cropped))
}
