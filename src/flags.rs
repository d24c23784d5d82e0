//! Methods for flagging outliers along the frequency axis.
//!
//! Every (time, baseline) column of a raw timestream, or (time, polarization, baseline) column of
//! a timestream, is flagged independently: samples whose magnitude lies more than `sigma`
//! standard deviations from the column mean are masked. Only the mask changes, and only ever
//! from `false` to `true`.

use std::fmt::Display;

use derive_builder::Builder;
use itertools::izip;
use log::{info, trace, warn};
use ndarray::{Array1, ArrayView1, ArrayViewMut1, Axis as NdAxis, Zip};
use num_complex::Complex;
use rayon::prelude::*;

use crate::{
    axes::Axis,
    constants::{DEFAULT_FREQ_POINTS, DEFAULT_SIGMA},
    container::Container,
    multiscale::Detrend,
    progress_bar, TodError,
};

/// Options for flagging.
#[derive(Builder, Debug, Clone, PartialEq)]
pub struct FlagContext {
    /// Samples further than this many standard deviations from the mean are flagged
    #[builder(default = "DEFAULT_SIGMA")]
    pub sigma: f64,
    /// The minimum number of valid frequency points needed to flag a column
    #[builder(default = "DEFAULT_FREQ_POINTS")]
    pub freq_points: usize,
    /// Smooth component removed from each column's magnitudes before clipping
    #[builder(default)]
    pub detrend: Option<Detrend>,
    /// Whether to draw progress bars
    #[builder(default = "true")]
    pub draw_progress: bool,
}

impl Default for FlagContext {
    fn default() -> Self {
        Self {
            sigma: DEFAULT_SIGMA,
            freq_points: DEFAULT_FREQ_POINTS,
            detrend: None,
            draw_progress: true,
        }
    }
}

impl Display for FlagContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Will flag samples beyond {} sigma in columns of at least {} valid channels.",
            self.sigma, self.freq_points
        )?;
        match &self.detrend {
            Some(detrend) => writeln!(
                f,
                "Will remove the {} smooth component over {} scales first.",
                detrend.kind, detrend.level
            ),
            None => writeln!(f, "Will not detrend."),
        }
    }
}

/// What a flagging pass did.
#[derive(Debug)]
pub enum FlagOutcome {
    /// The pass ran, masking this many samples across all workers.
    Flagged {
        /// Samples that were valid before and are masked now
        newly_flagged: usize,
    },
    /// The pass was skipped with this warning, leaving the mask untouched.
    Skipped(TodError),
}

impl FlagContext {
    /// Flag one frequency column in place, returning how many samples were newly masked.
    ///
    /// Columns with fewer than `freq_points` valid samples are left alone. Statistics use the
    /// valid samples only, with the population standard deviation.
    pub fn flag_column(
        &self,
        vis: ArrayView1<Complex<f32>>,
        mut mask: ArrayViewMut1<bool>,
    ) -> usize {
        let (valid_idxs, magnitudes): (Vec<usize>, Vec<f64>) = izip!(vis.iter(), mask.iter())
            .enumerate()
            .filter(|(_, (_, &masked))| !masked)
            .map(|(idx, (v, _))| (idx, v.norm() as f64))
            .unzip();
        if valid_idxs.len() < self.freq_points || valid_idxs.is_empty() {
            return 0;
        }
        let mut magnitudes = Array1::from(magnitudes);
        if let Some(detrend) = &self.detrend {
            magnitudes = detrend.detrend(magnitudes.view());
        }
        let mean = magnitudes.mean().unwrap_or_default();
        let std = magnitudes.std(0.0);
        let mut newly_flagged = 0;
        for (&idx, &magnitude) in izip!(&valid_idxs, &magnitudes) {
            if (magnitude - mean).abs() > self.sigma * std {
                mask[idx] = true;
                newly_flagged += 1;
            }
        }
        newly_flagged
    }

    /// Flag every frequency column of a container. Collective.
    ///
    /// The container ends up distributed along time. If the global frequency axis is shorter
    /// than `freq_points` nothing happens and [`FlagOutcome::Skipped`] carries
    /// [`TodError::InsufficientData`], which is also logged as a warning.
    ///
    /// # Errors
    ///
    /// Communication errors, or [`TodError::UnknownDataset`] without a main data and mask.
    pub fn flag_container(&self, container: &mut Container) -> Result<FlagOutcome, TodError> {
        let nfreq = container.global_len(Axis::Frequency)?;
        if nfreq < self.freq_points {
            let warning = TodError::InsufficientData {
                nfreq,
                freq_points: self.freq_points,
            };
            warn!("{}", warning);
            return Ok(FlagOutcome::Skipped(warning));
        }
        container.redistribute(Axis::Time)?;
        let freq_dim = container.main_dim(Axis::Frequency)?;
        let draw_progress = self.draw_progress && container.comm().is_root();
        let (vis, mask) = container.main_arrays_mut()?;

        let num_columns = if nfreq == 0 { 0 } else { vis.len() / nfreq };
        trace!("flagging {} local columns of {} channels", num_columns, nfreq);
        let flag_progress = progress_bar(num_columns as u64, "flagging columns", draw_progress);
        let local_flagged: usize = Zip::from(vis.lanes(NdAxis(freq_dim)))
            .and(mask.lanes_mut(NdAxis(freq_dim)))
            .into_par_iter()
            .map(|(vis_column, mask_column)| {
                let newly_flagged = self.flag_column(vis_column, mask_column);
                flag_progress.inc(1);
                newly_flagged
            })
            .sum();
        flag_progress.finish();

        let newly_flagged = container.comm().sum_usize(local_flagged)?;
        if container.comm().is_root() {
            info!(
                "flagged {} samples beyond {} sigma",
                newly_flagged, self.sigma
            );
        }
        Ok(FlagOutcome::Flagged { newly_flagged })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array1;

    use super::*;
    use crate::{
        comm::{run_workers, Comm},
        constants::{MAIN_DATA, MAIN_MASK},
        multiscale::DetrendKind,
        test_common::{synthetic_raw, synthetic_timestream},
    };

    fn quiet() -> FlagContext {
        FlagContextBuilder::default()
            .draw_progress(false)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let ctx = FlagContextBuilder::default().build().unwrap();
        assert_eq!(ctx, FlagContext::default());
        assert_eq!(ctx.sigma, 3.0);
        assert_eq!(ctx.freq_points, 10);
    }

    #[test]
    fn test_flag_column_spike() {
        let mut vis = Array1::from_elem(12, Complex::new(1.0_f32, 0.0));
        vis[5] = Complex::new(0.0, 100.0);
        let mut mask = Array1::from_elem(12, false);
        assert_eq!(quiet().flag_column(vis.view(), mask.view_mut()), 1);
        assert!(mask[5]);
        assert_eq!(mask.iter().filter(|&&m| m).count(), 1);
        // nothing left beyond the threshold
        assert_eq!(quiet().flag_column(vis.view(), mask.view_mut()), 0);
    }

    #[test]
    fn test_flag_column_too_few_valid() {
        let vis = Array1::from_shape_fn(12, |i| Complex::new(i as f32 * i as f32, 0.0));
        let mut mask = Array1::from_elem(12, false);
        mask.slice_mut(ndarray::s![..3]).fill(true);
        let before = mask.clone();
        assert_eq!(quiet().flag_column(vis.view(), mask.view_mut()), 0);
        assert_eq!(mask, before);
    }

    #[test]
    fn test_flag_column_detrended() {
        // a spike on a steep ramp only stands out once the ramp is removed
        let mut vis = Array1::from_shape_fn(32, |i| Complex::new(10.0 * i as f32, 0.0));
        vis[16] = Complex::new(360.0, 0.0);
        let ctx = FlagContext {
            detrend: Some(Detrend {
                kind: DetrendKind::MultiscaleMedian,
                level: 1,
            }),
            draw_progress: false,
            ..FlagContext::default()
        };
        let mut mask = Array1::from_elem(32, false);
        assert_eq!(ctx.flag_column(vis.view(), mask.view_mut()), 1);
        assert!(mask[16]);
        let plain = FlagContext { detrend: None, ..ctx };
        let mut mask = Array1::from_elem(32, false);
        assert_eq!(plain.flag_column(vis.view(), mask.view_mut()), 0);
    }

    #[test]
    fn test_skipped_with_few_channels() {
        let mut raw = synthetic_raw(Comm::solo(), 3, 5, &[1, 2]);
        let before = raw.main_mask().unwrap().clone();
        let outcome = quiet().flag_container(&mut raw).unwrap();
        assert!(matches!(
            outcome,
            FlagOutcome::Skipped(TodError::InsufficientData {
                nfreq: 5,
                freq_points: 10
            })
        ));
        assert_eq!(raw.main_mask().unwrap(), &before);
    }

    #[test]
    fn test_flag_container_only_sets_mask() {
        for size in 1..=3 {
            let results = run_workers(size, |comm| {
                let mut raw = synthetic_raw(comm, 4, 12, &[1, 2]);
                raw.redistribute(Axis::Frequency).unwrap();
                raw.redistribute(Axis::Time).unwrap();
                {
                    let (vis, _) = raw.main_arrays_mut().unwrap();
                    vis.fill(Complex::new(2.0, 0.0));
                    vis.index_axis_mut(NdAxis(1), 7).fill(Complex::new(-90.0, 0.0));
                }
                let vis_before = raw.main_data().unwrap().clone();
                let outcome = quiet().flag_container(&mut raw).unwrap();
                assert_eq!(raw.main_data().unwrap(), &vis_before);
                let mask = raw.main_mask().unwrap().data.as_bool(MAIN_MASK).unwrap();
                assert!(mask.index_axis(NdAxis(1), 7).iter().all(|&m| m));
                assert_eq!(mask.iter().filter(|&&m| m).count(), mask.len() / 12);
                match outcome {
                    FlagOutcome::Flagged { newly_flagged } => newly_flagged,
                    FlagOutcome::Skipped(e) => panic!("{e}"),
                }
            });
            for newly_flagged in results {
                assert_eq!(newly_flagged, 4 * 10);
            }
        }
    }

    #[test]
    fn test_flag_timestream_columns() {
        let mut ts = synthetic_timestream(Comm::solo(), 2, 16, &[1, 2]);
        {
            let (vis, _) = ts.main_arrays_mut().unwrap();
            vis.fill(Complex::new(1.0, 1.0));
            vis[[1, 3, 2, 0]] = Complex::new(300.0, 0.0);
        }
        let outcome = quiet().flag_container(&mut ts).unwrap();
        assert!(matches!(outcome, FlagOutcome::Flagged { newly_flagged: 1 }));
        let mask = ts.main_mask().unwrap().data.as_bool(MAIN_MASK).unwrap();
        assert!(mask[[1, 3, 2, 0]]);
        assert!(ts.main_data().unwrap().data.as_complex(MAIN_DATA).is_ok());
    }
}
