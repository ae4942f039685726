use ndarray::{s, Array2, Array3, ArrayView3, Axis};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::EstimationError;
use crate::estimator::{
    array_to_json, ensure_finite_movie, json_f64, Calibration, Estimate, SensitivityResult,
};

pub const STATS_KEY: &str = "photon_flux_stats";
pub const MEAN_IMAGE_KEY: &str = "photon_flux_mean_image";
pub const CV_MATRIX_KEY: &str = "coefficient_of_variation_matrix";

/// Percentile used to normalize the coefficient-of-variation image.
pub const CV_NORMALIZATION_PERCENTILE: f64 = 99.99;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FluxSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl FluxSummary {
    pub fn to_json(self) -> Value {
        json!({
            "mean": json_f64(self.mean),
            "min": json_f64(self.min),
            "max": json_f64(self.max),
        })
    }
}

pub fn summarize_flux(flux: ArrayView3<'_, f64>) -> FluxSummary {
    let (min, max) = flux
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    FluxSummary {
        mean: flux.mean().unwrap_or(f64::NAN),
        min,
        max,
    }
}

/// Time-averaged image of a (time, y, x) volume.
pub fn mean_image(flux: ArrayView3<'_, f64>) -> Array2<f64> {
    let (_, height, width) = flux.dim();
    flux.mean_axis(Axis(0))
        .unwrap_or_else(|| Array2::from_elem((height, width), f64::NAN))
}

/// Half the mean squared difference between consecutive frames, per pixel.
pub fn temporal_noise(movie: ArrayView3<'_, f64>) -> Result<Array2<f64>, EstimationError> {
    let frames = movie.len_of(Axis(0));
    if frames < 2 {
        return Err(EstimationError::TooFewFrames(frames));
    }
    let diffs = &movie.slice(s![1.., .., ..]) - &movie.slice(s![..-1, .., ..]);
    let squared_mean = diffs
        .mapv(|d| d * d)
        .mean_axis(Axis(0))
        .ok_or(EstimationError::TooFewFrames(frames))?;
    Ok(squared_mean / 2.0)
}

/// Linear-interpolation percentile of the finite `values`, `p` in [0, 100].
///
/// The rank is `p / 100 * (n - 1)` over the sorted values, interpolated between
/// its two neighbours. NaN and infinities are skipped; returns `None` when no
/// finite value remains.
pub fn percentile(values: impl IntoIterator<Item = f64>, p: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);

    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Per-pixel coefficient-of-variation image of the raw (time, y, x) movie,
/// shaped (y, x, 3) with every value in [0, 1]. Non-finite pixels are an error.
pub fn coefficient_of_variation(
    movie: ArrayView3<'_, f64>,
    calibration: Calibration,
) -> Result<Array3<f64>, EstimationError> {
    ensure_finite_movie(movie)?;
    let noise = temporal_noise(movie)?;
    let mean = mean_image(movie);
    let Calibration {
        sensitivity: q,
        zero_level: b,
    } = calibration;

    let (height, width) = mean.dim();
    let mut image = Array3::<f64>::zeros((height, width, 3));
    for ((row, col), &m) in mean.indexed_iter() {
        let level = (m - b) / q;
        image[[row, col, 0]] = level;
        image[[row, col, 1]] = level;
        image[[row, col, 2]] = noise[[row, col]] / (q * q);
    }

    match percentile(image.iter().copied(), CV_NORMALIZATION_PERCENTILE) {
        Some(norm) if norm.is_finite() && norm > 0.0 => image /= norm,
        norm => warn!(?norm, "coefficient of variation image left unnormalized"),
    }

    image.mapv_inplace(|x| ((x.max(0.0) + 0.01).sqrt() - 0.1).min(1.0));
    Ok(image)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesStatistics {
    pub flux: FluxSummary,
    pub mean_image: Array2<f64>,
    pub coefficient_of_variation: Array3<f64>,
}

impl SeriesStatistics {
    pub fn compute(movie: ArrayView3<'_, f64>, estimate: &Estimate) -> Result<Self, EstimationError> {
        let flux = estimate.photon_flux.view();
        Ok(Self {
            flux: summarize_flux(flux),
            mean_image: mean_image(flux),
            coefficient_of_variation: coefficient_of_variation(movie, estimate.calibration)?,
        })
    }

    pub fn attach(self, result: &mut SensitivityResult) {
        result.insert(STATS_KEY, self.flux.to_json());
        result.insert(MEAN_IMAGE_KEY, array_to_json(self.mean_image.into_dyn().view()));
        result.insert(
            CV_MATRIX_KEY,
            array_to_json(self.coefficient_of_variation.into_dyn().view()),
        );
    }
}

/// Builds the per-series result record: the normalized sensitivity output
/// with the flux statistics merged in.
pub fn aggregate(movie: ArrayView3<'_, f64>, estimate: Estimate) -> Result<SensitivityResult, EstimationError> {
    let statistics = SeriesStatistics::compute(movie, &estimate)?;
    let mut result = estimate.sensitivity;
    statistics.attach(&mut result);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates_between_neighbours() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(percentile(values, 0.0), Some(1.0));
        assert_eq!(percentile(values, 100.0), Some(4.0));
        assert_eq!(percentile(values, 50.0), Some(2.5));
        let p = percentile((0..=100).map(f64::from), 99.99).expect("non-empty");
        assert!((p - 99.99).abs() < 1e-9);
        assert_eq!(percentile(Vec::new(), 50.0), None);
        assert_eq!(percentile([f64::NAN, 1.0, 3.0, f64::INFINITY], 100.0), Some(3.0));
        assert_eq!(percentile([f64::NAN], 50.0), None);
    }

    #[test]
    fn temporal_noise_halves_mean_squared_difference() {
        let movie = Array3::from_shape_vec((3, 1, 1), vec![0.0, 2.0, 6.0]).expect("shape");
        let noise = temporal_noise(movie.view()).expect("enough frames");
        // ((2^2 + 4^2) / 2) / 2
        assert_eq!(noise[[0, 0]], 5.0);

        let single = Array3::<f64>::zeros((1, 2, 2));
        assert_eq!(
            temporal_noise(single.view()),
            Err(EstimationError::TooFewFrames(1))
        );
    }
}
