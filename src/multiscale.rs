//! One dimensional multiscale transforms used to detrend spectra before flagging.
//!
//! All transforms use reflecting boundaries (`d c b a | a b c d | d c b a`) and return the
//! detail scales followed by the final approximation, so for the first generation starlet and
//! the multiscale median transforms the returned arrays sum back to the input.

use ndarray::{Array1, ArrayView1};
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::constants::MAD_SCALE;

/// The B3 spline scaling function.
pub const B3_SPLINE: [f64; 5] = [1.0 / 16.0, 1.0 / 4.0, 3.0 / 8.0, 1.0 / 4.0, 1.0 / 16.0];

/// Default threshold of the median-wavelet transform, in units of the MAD.
pub const DEFAULT_TAU: f64 = 5.0;

/// Half width of the median window at the first scale.
const FIRST_MEDIAN_SCALE: usize = 2;

fn reflect_index(idx: isize, len: usize) -> usize {
    let period = 2 * len as isize;
    let idx = idx.rem_euclid(period);
    if idx >= len as isize {
        (period - 1 - idx) as usize
    } else {
        idx as usize
    }
}

/// Convolve with `phi`, whose taps are `step` samples apart.
fn convolve(a: ArrayView1<f64>, phi: &[f64], step: usize) -> Array1<f64> {
    let len = a.len();
    let half = (phi.len() / 2) as isize;
    Array1::from_shape_fn(len, |i| {
        phi.iter()
            .enumerate()
            .map(|(k, &w)| w * a[reflect_index(i as isize + (k as isize - half) * step as isize, len)])
            .sum()
    })
}

/// The median of `values`, averaging the middle two for an even count. `NaN` if empty.
pub fn median(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut values: Vec<f64> = values.into_iter().collect();
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Median absolute deviation, scaled to a gaussian sigma.
pub fn mad(a: ArrayView1<f64>) -> f64 {
    let centre = median(a.iter().copied());
    median(a.iter().map(|v| (v - centre).abs())) / MAD_SCALE
}

/// Running median over a centred window of `size` samples.
pub fn median_filter(a: ArrayView1<f64>, size: usize) -> Array1<f64> {
    let len = a.len();
    let half = (size / 2) as isize;
    Array1::from_shape_fn(len, |i| {
        median((-half..=half).map(|k| a[reflect_index(i as isize + k, len)]))
    })
}

/// The starlet (undecimated isotropic wavelet) transform over `level` scales.
///
/// With `gen2`, details are `c_j - h * c_{j+1}` rather than `c_j - c_{j+1}`.
pub fn starlet_transform(a: ArrayView1<f64>, level: usize, gen2: bool) -> Vec<Array1<f64>> {
    let mut scales = Vec::with_capacity(level + 1);
    let mut current = a.to_owned();
    for j in 0..level {
        let step = 1 << j;
        let approx = convolve(current.view(), &B3_SPLINE, step);
        scales.push(if gen2 {
            &current - &convolve(approx.view(), &B3_SPLINE, step)
        } else {
            &current - &approx
        });
        current = approx;
    }
    scales.push(current);
    scales
}

/// The starlet approximation after `level` scales.
pub fn starlet_smooth(a: ArrayView1<f64>, level: usize) -> Array1<f64> {
    let mut current = a.to_owned();
    for j in 0..level {
        current = convolve(current.view(), &B3_SPLINE, 1 << j);
    }
    current
}

/// The multiscale median transform over `level` scales. The window at scale `j` is
/// `2 * 2^(j + 1) + 1` samples.
pub fn multiscale_median_transform(a: ArrayView1<f64>, level: usize) -> Vec<Array1<f64>> {
    let mut scales = Vec::with_capacity(level + 1);
    let mut current = a.to_owned();
    let mut scale = FIRST_MEDIAN_SCALE;
    for _ in 0..level {
        let approx = median_filter(current.view(), 2 * scale + 1);
        scales.push(&current - &approx);
        current = approx;
        scale *= 2;
    }
    scales.push(current);
    scales
}

/// The median-wavelet transform over `level` scales.
///
/// At each scale the median-filtered approximation gets back the details within `tau` MADs,
/// and is then starlet smoothed. Outliers never reach the approximation.
pub fn median_wavelet_transform(a: ArrayView1<f64>, level: usize, tau: f64) -> Vec<Array1<f64>> {
    let mut scales = Vec::with_capacity(level + 1);
    let mut current = a.to_owned();
    let mut scale = FIRST_MEDIAN_SCALE;
    for j in 0..level {
        let mut approx = median_filter(current.view(), 2 * scale + 1);
        let detail = &current - &approx;
        let threshold = tau * mad(detail.view());
        approx.zip_mut_with(&detail, |c, &w| {
            if w.abs() <= threshold {
                *c += w;
            }
        });
        let approx = starlet_smooth(approx.view(), j + 1);
        scales.push(&current - &approx);
        current = approx;
        scale *= 2;
    }
    scales.push(current);
    scales
}

/// Which smooth component to remove from a spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum DetrendKind {
    /// [`starlet_smooth`]
    Starlet,
    /// [`multiscale_median_transform`]
    MultiscaleMedian,
    /// [`median_wavelet_transform`] with [`DEFAULT_TAU`]
    MedianWavelet,
}

/// A detrending method and the number of scales it removes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detrend {
    /// The transform
    pub kind: DetrendKind,
    /// The number of scales
    pub level: usize,
}

impl Detrend {
    /// The smooth component of `a`.
    pub fn smooth(&self, a: ArrayView1<f64>) -> Array1<f64> {
        if a.is_empty() {
            return a.to_owned();
        }
        let last = |mut scales: Vec<Array1<f64>>| scales.pop().unwrap_or_default();
        match self.kind {
            DetrendKind::Starlet => starlet_smooth(a, self.level),
            DetrendKind::MultiscaleMedian => last(multiscale_median_transform(a, self.level)),
            DetrendKind::MedianWavelet => {
                last(median_wavelet_transform(a, self.level, DEFAULT_TAU))
            }
        }
    }

    /// `a` with its smooth component removed.
    pub fn detrend(&self, a: ArrayView1<f64>) -> Array1<f64> {
        &a - &self.smooth(a)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};

    use super::*;

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(5, 4), 2);
        assert_eq!(reflect_index(9, 4), 1);
    }

    #[test]
    fn test_median_and_mad() {
        assert_abs_diff_eq!(median([3.0, 1.0, 2.0]), 2.0);
        assert_abs_diff_eq!(median([4.0, 1.0, 2.0, 3.0]), 2.5);
        assert!(median([]).is_nan());
        let a = array![1.0, 2.0, 3.0, 4.0, 100.0];
        // deviations 2, 1, 0, 1, 97
        assert_abs_diff_eq!(mad(a.view()), 1.0 / MAD_SCALE, epsilon = 1e-12);
    }

    #[test]
    fn test_starlet_preserves_constant() {
        let a = Array1::from_elem(12, 3.5);
        let scales = starlet_transform(a.view(), 3, false);
        assert_eq!(scales.len(), 4);
        for detail in &scales[..3] {
            assert_abs_diff_eq!(detail, &Array1::zeros(12), epsilon = 1e-12);
        }
        assert_abs_diff_eq!(scales[3], a, epsilon = 1e-12);
    }

    #[test]
    fn test_transforms_sum_to_input() {
        let a = Array1::from_shape_fn(20, |i| (i as f64 * 0.7).sin() + 0.1 * i as f64);
        for scales in [
            starlet_transform(a.view(), 3, false),
            multiscale_median_transform(a.view(), 2),
            median_wavelet_transform(a.view(), 2, DEFAULT_TAU),
        ] {
            let total = scales.iter().fold(Array1::<f64>::zeros(20), |acc, s| acc + s);
            assert_abs_diff_eq!(total, a, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_median_smooth_ignores_spike() {
        let mut a = Array1::from_elem(16, 1.0);
        a[8] = 50.0;
        let detrend = Detrend {
            kind: DetrendKind::MultiscaleMedian,
            level: 1,
        };
        let smooth = detrend.smooth(a.view());
        assert_abs_diff_eq!(smooth, Array1::from_elem(16, 1.0), epsilon = 1e-12);
        assert_abs_diff_eq!(detrend.detrend(a.view())[8], 49.0, epsilon = 1e-12);
    }

    #[test]
    fn test_median_wavelet_smooth_ignores_spike() {
        let mut a = Array1::from_shape_fn(32, |i| 2.0 + 0.01 * i as f64);
        a[10] = 40.0;
        let smooth = Detrend {
            kind: DetrendKind::MedianWavelet,
            level: 2,
        }
        .smooth(a.view());
        assert!(smooth[10] < 3.0);
    }

    #[test]
    fn test_detrend_kind_parses() {
        use std::str::FromStr;
        assert_eq!(
            DetrendKind::from_str("median-wavelet").unwrap(),
            DetrendKind::MedianWavelet
        );
        assert_eq!(DetrendKind::Starlet.to_string(), "starlet");
    }
}
