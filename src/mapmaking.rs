//! Averaging a timestream onto a periodic phase grid, combining redundant baselines, and
//! handing the result to a map-synthesis backend.
//!
//! The steps are:
//!
//! 1. mask the daytime part of each day (only the mask changes)
//! 2. average the time axis onto `phi_size` phase bins, skipping masked samples
//! 3. reduce the polarization axis to the requested product
//! 4. reorder baselines into the geometry's redundancy-group order and average each group
//! 5. write the reduced stream and the geometry tables, then call the [`BeamSynthesis`] backend
//!
//! The array geometry and the beam synthesis are collaborators behind the [`ArrayGeometry`] and
//! [`BeamSynthesis`] traits. [`RedundantArray`] is a plain geometry that groups feed pairs by
//! separation.

use std::{
    collections::BTreeMap,
    f64::consts::PI,
    fmt::Display,
    path::{Path, PathBuf},
};

use derive_builder::Builder;
use itertools::Itertools;
use log::{debug, info, trace};
use marlu::{constants::VEL_C, XyzGeodetic};
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis as NdAxis};
use num_complex::Complex;
use rayon::prelude::*;
use strum_macros::{Display as StrumDisplay, EnumIter, EnumString, IntoStaticStr};

use crate::{
    axes::Axis,
    comm::{partition, Comm},
    constants::{
        BLORDER, CYLINDER_APERTURE_FRACTION, DEFAULT_DAYTIME_RANGE, DEFAULT_TSYS, FEEDNO,
        FEEDPOS, FREQ, LOCAL_HOUR, MAIN_DATA, MAIN_MASK, POL, SEC1970,
    },
    container::Timestream,
    dataset::{AttrValue, Attrs, DataArray, DistArray},
    io::fits::write_hdus,
    progress_bar,
    selection::{pairs_from_array, Orientation, PairLookup},
    TodError,
};

/// Separations are grouped after rounding to this many metres.
const SEPARATION_TOLERANCE: f64 = 0.01;

/// Which polarization product to map.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, StrumDisplay, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
pub enum PolChoice {
    /// `xx` only
    #[default]
    #[strum(serialize = "xx")]
    Xx,
    /// `yy` only
    #[strum(serialize = "yy")]
    Yy,
    /// Stokes I, `(xx + yy) / 2`
    #[strum(serialize = "I")]
    I,
    /// The sum over every polarization
    #[strum(serialize = "all")]
    All,
}

/// How a redundancy group's sum is normalised.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, StrumDisplay, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum RedundancyWeighting {
    /// Divide by the number of baselines in the group, whether or not they hold valid data
    #[default]
    Count,
    /// Average only the baselines whose phase bin holds at least one valid sample
    Valid,
}

/// Options for the map-making stage.
#[derive(Builder, Debug, Clone, PartialEq)]
pub struct MapMakingContext {
    /// Whether to mask the daytime window
    #[builder(default = "true")]
    pub mask_daytime: bool,
    /// Local hours `(start, end)` treated as daytime, inclusive. Wraps past midnight when
    /// `start > end`.
    #[builder(default = "DEFAULT_DAYTIME_RANGE")]
    pub mask_time_range: (f64, f64),
    /// The polarization product to map
    #[builder(default)]
    pub pol: PolChoice,
    /// System temperature in Kelvin, passed to the beam synthesis
    #[builder(default = "DEFAULT_TSYS")]
    pub tsys: f64,
    /// Resolution boost for the synthesis
    #[builder(default = "1.0")]
    pub accuracy_boost: f64,
    /// Multiplier on the maximum multipole
    #[builder(default = "1.0")]
    pub l_boost: f64,
    /// Whether feeds are paired with themselves
    #[builder(default = "false")]
    pub auto_correlations: bool,
    /// How redundancy groups are normalised
    #[builder(default)]
    pub weighting: RedundancyWeighting,
    /// Where the reduced stream is written
    #[builder(default)]
    pub output_path: Option<PathBuf>,
    /// Whether to draw progress bars
    #[builder(default = "true")]
    pub draw_progress: bool,
}

impl Default for MapMakingContext {
    fn default() -> Self {
        Self {
            mask_daytime: true,
            mask_time_range: DEFAULT_DAYTIME_RANGE,
            pol: PolChoice::default(),
            tsys: DEFAULT_TSYS,
            accuracy_boost: 1.0,
            l_boost: 1.0,
            auto_correlations: false,
            weighting: RedundancyWeighting::default(),
            output_path: None,
            draw_progress: true,
        }
    }
}

impl Display for MapMakingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.mask_daytime {
            writeln!(
                f,
                "Will mask local hours {} to {}.",
                self.mask_time_range.0, self.mask_time_range.1
            )?;
        } else {
            writeln!(f, "Will not mask daytime.")?;
        }
        writeln!(
            f,
            "Will map pol {} with {} redundancy weighting, tsys={}K.",
            self.pol, self.weighting, self.tsys
        )?;
        match &self.output_path {
            Some(path) => writeln!(f, "Will write the reduced stream to {}.", path.display()),
            None => writeln!(f, "Will not write the reduced stream."),
        }
    }
}

/// The layout of a redundant array, as needed to reduce a timestream for map synthesis.
pub trait ArrayGeometry {
    /// The number of phase bins per sidereal cycle.
    fn phi_size(&self) -> usize;
    /// Every feed pair (positions in the feed list) used, grouped by redundancy.
    fn allpairs(&self) -> &[(usize, usize)];
    /// The size of each redundancy group, in the order of [`ArrayGeometry::allpairs`].
    fn redundancy(&self) -> &[usize];
    /// `(nfeed, nfeed)` redundancy group of each feed pair, `-1` if unused.
    fn feedmap(&self) -> &Array2<i64>;
    /// `(nfeed, nfeed)` whether each pair is the conjugate of its group's orientation.
    fn feedconj(&self) -> &Array2<bool>;
    /// `(nfeed, nfeed)` whether each pair is used.
    fn feedmask(&self) -> &Array2<bool>;
    /// `(ngroup, 2)` a representative feed pair of each group.
    fn uniquepairs(&self) -> &Array2<i64>;
    /// `(ngroup, 2)` the east and north separation of each group in metres.
    fn baselines(&self) -> &Array2<f64>;
    /// The maximum spherical harmonic degree.
    fn lmax(&self) -> usize;
}

/// The backend that turns a reduced stream into a sky map.
pub trait BeamSynthesis {
    /// Compute the beam transfer matrices of the array.
    ///
    /// # Errors
    ///
    /// Whatever the backend raises.
    fn generate_beam_transfers(
        &mut self,
        geometry: &dyn ArrayGeometry,
        tsys: f64,
    ) -> Result<(), TodError>;

    /// Transform the stream written at `stream_path` into m-modes.
    ///
    /// # Errors
    ///
    /// Whatever the backend raises.
    fn generate_mmodes(&mut self, stream_path: Option<&Path>) -> Result<(), TodError>;

    /// Synthesise a map at HEALPix resolution `nside`.
    ///
    /// # Errors
    ///
    /// Whatever the backend raises.
    fn mapmake(&mut self, nside: usize) -> Result<(), TodError>;
}

/// A synthesis backend that only reports what it was asked to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoggingSynthesis {
    /// Every call, in order
    pub calls: Vec<String>,
}

impl BeamSynthesis for LoggingSynthesis {
    fn generate_beam_transfers(
        &mut self,
        geometry: &dyn ArrayGeometry,
        tsys: f64,
    ) -> Result<(), TodError> {
        let call = format!(
            "beam transfers for {} groups, lmax {}, tsys {}K",
            geometry.redundancy().len(),
            geometry.lmax(),
            tsys
        );
        info!("{}", call);
        self.calls.push(call);
        Ok(())
    }

    fn generate_mmodes(&mut self, stream_path: Option<&Path>) -> Result<(), TodError> {
        let call = match stream_path {
            Some(path) => format!("m-modes of {}", path.display()),
            None => "m-modes of the in-memory stream".to_string(),
        };
        info!("{}", call);
        self.calls.push(call);
        Ok(())
    }

    fn mapmake(&mut self, nside: usize) -> Result<(), TodError> {
        let call = format!("map at nside {nside}");
        info!("{}", call);
        self.calls.push(call);
        Ok(())
    }
}

/// An array whose baselines are grouped by the separation of their feeds.
#[derive(Debug, Clone, PartialEq)]
pub struct RedundantArray {
    phi_size: usize,
    lmax: usize,
    allpairs: Vec<(usize, usize)>,
    redundancy: Vec<usize>,
    feedmap: Array2<i64>,
    feedconj: Array2<bool>,
    feedmask: Array2<bool>,
    uniquepairs: Array2<i64>,
    baselines: Array2<f64>,
}

impl RedundantArray {
    /// Group the feed pairs of an array of feeds at `positions`.
    ///
    /// Pairs are oriented so the separation points east (or north when due north-south);
    /// a pair stored the other way round is marked in [`ArrayGeometry::feedconj`]. The maximum
    /// multipole follows from the longest separation plus the aperture `width` at the highest
    /// frequency in `freqs_mhz`, and `phi_size` is `2 * lmax + 1`.
    pub fn new(
        positions: &[XyzGeodetic],
        freqs_mhz: &[f64],
        width: f64,
        auto_correlations: bool,
        l_boost: f64,
    ) -> Self {
        let nfeed = positions.len();
        let mut groups: BTreeMap<(i64, i64), Vec<(usize, usize)>> = BTreeMap::new();
        let mut oriented = Vec::new();
        for i in 0..nfeed {
            for j in i..nfeed {
                if i == j && !auto_correlations {
                    continue;
                }
                let key = separation_key(&positions[i], &positions[j]);
                let (key, pair, conj) = if key < (0, 0) {
                    ((-key.0, -key.1), (j, i), true)
                } else {
                    (key, (i, j), false)
                };
                groups.entry(key).or_default().push(pair);
                oriented.push(((i, j), key, conj));
            }
        }

        let group_idx: BTreeMap<(i64, i64), usize> =
            groups.keys().enumerate().map(|(idx, &key)| (key, idx)).collect();
        let mut feedmap = Array2::from_elem((nfeed, nfeed), -1_i64);
        let mut feedconj = Array2::from_elem((nfeed, nfeed), false);
        let mut feedmask = Array2::from_elem((nfeed, nfeed), false);
        for ((i, j), key, conj) in oriented {
            let group = group_idx.get(&key).copied().unwrap_or_default() as i64;
            feedmap[[i, j]] = group;
            feedmap[[j, i]] = group;
            feedconj[[i, j]] = conj;
            feedconj[[j, i]] = !conj && i != j;
            feedmask[[i, j]] = true;
            feedmask[[j, i]] = true;
        }

        let ngroup = groups.len();
        let mut uniquepairs = Array2::zeros((ngroup, 2));
        let mut baselines = Array2::zeros((ngroup, 2));
        for (idx, (key, pairs)) in groups.iter().enumerate() {
            if let Some(&(a, b)) = pairs.first() {
                uniquepairs[[idx, 0]] = a as i64;
                uniquepairs[[idx, 1]] = b as i64;
            }
            baselines[[idx, 0]] = key.0 as f64 * SEPARATION_TOLERANCE;
            baselines[[idx, 1]] = key.1 as f64 * SEPARATION_TOLERANCE;
        }
        let redundancy = groups.values().map(Vec::len).collect();
        let allpairs = groups.into_values().flatten().collect();

        let max_separation = baselines
            .outer_iter()
            .map(|row| row[0].hypot(row[1]))
            .fold(0.0, f64::max);
        let max_freq_hz = freqs_mhz.iter().copied().fold(0.0, f64::max) * 1e6;
        let lmax = (2.0 * PI * (max_separation + width) * max_freq_hz / VEL_C * l_boost).ceil()
            as usize;
        trace!(
            "{} feeds in {} redundancy groups, longest separation {}m, lmax {}",
            nfeed,
            ngroup,
            max_separation,
            lmax
        );

        Self {
            phi_size: 2 * lmax + 1,
            lmax,
            allpairs,
            redundancy,
            feedmap,
            feedconj,
            feedmask,
            uniquepairs,
            baselines,
        }
    }

    /// Build the geometry of a timestream's array from its attributes and feed positions.
    ///
    /// The `telescope` attribute picks the aperture: a name containing `Dish` uses the
    /// `dishdiam` attribute, one containing `Cylinder` uses the effective fraction of `cywid`.
    ///
    /// # Errors
    ///
    /// - [`TodError::UnknownArrayGeometry`] for any other telescope
    /// - [`TodError::MissingAttribute`] without a `telescope` or aperture attribute
    /// - [`TodError::UnknownDataset`] without `feedpos` or `freq`, or communication errors
    pub fn from_timestream(ts: &Timestream, ctx: &MapMakingContext) -> Result<Self, TodError> {
        let telescope = attr_str(&ts.attrs, "telescope")?;
        let width = if telescope.contains("Dish") {
            attr_f64(&ts.attrs, "dishdiam")?
        } else if telescope.contains("Cylinder") {
            CYLINDER_APERTURE_FRACTION * attr_f64(&ts.attrs, "cywid")?
        } else {
            return Err(TodError::UnknownArrayGeometry {
                telescope: telescope.into(),
            });
        };
        let feedpos = ts.global_dataset(FEEDPOS)?;
        let feedpos = feedpos.as_float(FEEDPOS)?;
        if feedpos.ndim() != 2 || feedpos.shape()[1] != 3 {
            return Err(TodError::BadArrayShape {
                argument: FEEDPOS.into(),
                function: "RedundantArray::from_timestream".into(),
                expected: "(nfeed, 3)".into(),
                received: format!("{:?}", feedpos.shape()),
            });
        }
        let positions = feed_positions(feedpos.view().into_dimensionality()?);
        let freqs = ts.global_dataset(FREQ)?;
        let freqs = freqs.as_float(FREQ)?.iter().copied().collect_vec();
        debug!("{} array with aperture width {}m", telescope, width);
        Ok(Self::new(
            &positions,
            &freqs,
            width,
            ctx.auto_correlations,
            ctx.l_boost,
        ))
    }
}

fn separation_key(a: &XyzGeodetic, b: &XyzGeodetic) -> (i64, i64) {
    (
        ((b.x - a.x) / SEPARATION_TOLERANCE).round() as i64,
        ((b.y - a.y) / SEPARATION_TOLERANCE).round() as i64,
    )
}

impl ArrayGeometry for RedundantArray {
    fn phi_size(&self) -> usize {
        self.phi_size
    }

    fn allpairs(&self) -> &[(usize, usize)] {
        &self.allpairs
    }

    fn redundancy(&self) -> &[usize] {
        &self.redundancy
    }

    fn feedmap(&self) -> &Array2<i64> {
        &self.feedmap
    }

    fn feedconj(&self) -> &Array2<bool> {
        &self.feedconj
    }

    fn feedmask(&self) -> &Array2<bool> {
        &self.feedmask
    }

    fn uniquepairs(&self) -> &Array2<i64> {
        &self.uniquepairs
    }

    fn baselines(&self) -> &Array2<f64> {
        &self.baselines
    }

    fn lmax(&self) -> usize {
        self.lmax
    }
}

fn attr_str<'a>(attrs: &'a Attrs, name: &str) -> Result<&'a str, TodError> {
    attrs
        .get(name)
        .and_then(AttrValue::as_str)
        .ok_or_else(|| TodError::MissingAttribute {
            name: name.into(),
            expected: "a string".into(),
        })
}

fn attr_f64(attrs: &Attrs, name: &str) -> Result<f64, TodError> {
    attrs
        .get(name)
        .and_then(AttrValue::as_f64)
        .ok_or_else(|| TodError::MissingAttribute {
            name: name.into(),
            expected: "a number".into(),
        })
}

/// Parse a timezone attribute such as `UTC+08`, `+8` or `-3.5` into hours east of UTC.
fn timezone_hours(value: &AttrValue) -> Option<f64> {
    if let Some(hours) = value.as_f64() {
        return Some(hours);
    }
    let text = value.as_str()?.trim();
    let text = text
        .strip_prefix("UTC")
        .or_else(|| text.strip_prefix("GMT"))
        .unwrap_or(text);
    if text.is_empty() {
        return Some(0.0);
    }
    text.parse().ok()
}

/// Whether `hour` falls in the inclusive window `range`, which wraps past midnight when
/// `range.0 > range.1`.
pub fn in_daytime(hour: f64, range: (f64, f64)) -> bool {
    let (start, end) = range;
    if start <= end {
        hour >= start && hour <= end
    } else {
        hour >= start || hour <= end
    }
}

/// The smallest power of two HEALPix `nside` whose resolution covers `lmax`, scaled by
/// `accuracy_boost`.
pub fn nside_for_lmax(lmax: usize, accuracy_boost: f64) -> usize {
    let target = (accuracy_boost * lmax as f64 / 3.0).ceil().max(1.0) as usize;
    target.next_power_of_two()
}

/// The reduced stream handed to the synthesis backend.
#[derive(Debug, Clone, PartialEq)]
pub struct MapStream {
    /// `(phi, freq, group)` visibilities, distributed along phase
    pub timestream: DistArray,
    /// Phase of each bin in radians
    pub phi: Array1<f64>,
    /// See [`ArrayGeometry::feedmap`]
    pub feedmap: Array2<i64>,
    /// See [`ArrayGeometry::feedconj`]
    pub feedconj: Array2<bool>,
    /// See [`ArrayGeometry::feedmask`]
    pub feedmask: Array2<bool>,
    /// See [`ArrayGeometry::uniquepairs`]
    pub uniquepairs: Array2<i64>,
    /// See [`ArrayGeometry::baselines`]
    pub baselines: Array2<f64>,
    /// Frequencies in MHz
    pub frequencies: Array1<f64>,
    /// The number of phase bins
    pub ntime: usize,
}

impl MapStream {
    /// Write the stream to one file on worker 0. Collective.
    ///
    /// # Errors
    ///
    /// IO errors on worker 0, [`crate::io::error::IOError::RemoteWriteFailed`] on the
    /// others if worker 0 failed, or communication errors.
    pub fn write(&self, path: &Path, comm: &Comm) -> Result<(), TodError> {
        let timestream = self.timestream.gather_all(comm)?;
        let result = if comm.is_root() {
            let mut attrs = Attrs::new();
            attrs.insert("ntime".into(), AttrValue::Int(self.ntime as i64));
            let entries: Vec<(&str, DataArray)> = vec![
                ("timestream", timestream),
                ("phi", self.phi.clone().into()),
                ("feedmap", self.feedmap.clone().into()),
                ("feedconj", self.feedconj.clone().into()),
                ("feedmask", self.feedmask.clone().into()),
                ("uniquepairs", self.uniquepairs.clone().into()),
                ("baselines", self.baselines.clone().into()),
                ("frequencies", self.frequencies.clone().into()),
            ];
            write_hdus(path, &entries, &attrs)
        } else {
            Ok(())
        };
        if comm.all_ok(result.is_ok())? {
            return Ok(());
        }
        result?;
        Err(crate::io::error::IOError::RemoteWriteFailed {
            path: path.display().to_string(),
        }
        .into())
    }
}

/// The phase bins each time sample contributes to.
///
/// The time axis is repeated `phi_size` times and cut into `phi_size` near-even runs; a bin's
/// weight for a sample is how many of its run's entries are that sample.
pub fn phase_bins(nt: usize, phi_size: usize) -> Vec<Vec<(usize, usize)>> {
    (0..phi_size)
        .map(|bin| {
            partition(nt * phi_size, phi_size, bin)
                .map(|pos| pos / phi_size)
                .dedup_with_count()
                .map(|(count, t)| (t, count))
                .collect()
        })
        .collect()
}

impl MapMakingContext {
    /// Mask the samples whose local hour falls in the daytime window. Collective.
    ///
    /// Local hours come from `local_hour`, or from `sec1970` and the `timezone` attribute.
    /// Returns the number of time samples in the window.
    ///
    /// # Errors
    ///
    /// [`TodError::MissingAttribute`] without `local_hour` or a `timezone`,
    /// [`TodError::UnknownDataset`], or communication errors.
    pub fn mask_daytime_samples(&self, ts: &mut Timestream) -> Result<usize, TodError> {
        let hours: Vec<f64> = if ts.contains(LOCAL_HOUR) {
            let hours = ts.global_dataset(LOCAL_HOUR)?;
            hours.as_float(LOCAL_HOUR)?.iter().copied().collect()
        } else {
            let offset = ts
                .attrs
                .get("timezone")
                .and_then(timezone_hours)
                .ok_or_else(|| TodError::MissingAttribute {
                    name: "timezone".into(),
                    expected: "hours east of UTC, e.g. UTC+08".into(),
                })?;
            let secs = ts.global_dataset(SEC1970)?;
            secs.as_float(SEC1970)?
                .iter()
                .map(|sec| (sec / 3600.0 + offset).rem_euclid(24.0))
                .collect()
        };
        let day_idxs = hours
            .iter()
            .positions(|&hour| in_daytime(hour, self.mask_time_range))
            .collect_vec();

        let local = ts.local_range(Axis::Time)?;
        let time_dim = ts.main_dim(Axis::Time)?;
        let (_, mask) = ts.main_arrays_mut()?;
        for &idx in &day_idxs {
            if local.contains(&idx) {
                mask.index_axis_mut(NdAxis(time_dim), idx - local.start)
                    .fill(true);
            }
        }
        if ts.comm().is_root() {
            info!(
                "masked {} of {} time samples in local hours {:?}",
                day_idxs.len(),
                hours.len(),
                self.mask_time_range
            );
        }
        Ok(day_idxs.len())
    }

    fn pol_weights(&self, labels: &[String]) -> Result<Vec<(usize, f32)>, TodError> {
        let find = |label: &str| {
            labels
                .iter()
                .position(|l| l.eq_ignore_ascii_case(label))
                .ok_or_else(|| TodError::BadSelection {
                    option: "pol".into(),
                    reason: format!("{} needs polarization {label}, found {labels:?}", self.pol),
                })
        };
        Ok(match self.pol {
            PolChoice::Xx => vec![(find("xx")?, 1.0)],
            PolChoice::Yy => vec![(find("yy")?, 1.0)],
            PolChoice::I => vec![(find("xx")?, 0.5), (find("yy")?, 0.5)],
            PolChoice::All => (0..labels.len()).map(|p| (p, 1.0)).collect(),
        })
    }

    /// Reduce a timestream to a [`MapStream`]. Collective.
    ///
    /// The timestream is redistributed along baseline and, if configured, daytime masked;
    /// its visibilities are not changed.
    ///
    /// # Errors
    ///
    /// [`TodError::PairNotFound`] if a pair the geometry uses is missing in both orientations,
    /// [`TodError::BadSelection`] if the polarization product can't be formed, missing
    /// datasets or attributes, or communication errors.
    pub fn make_stream(
        &self,
        ts: &mut Timestream,
        geometry: &dyn ArrayGeometry,
    ) -> Result<MapStream, TodError> {
        ts.redistribute(Axis::Baseline)?;
        if self.mask_daytime {
            self.mask_daytime_samples(ts)?;
        }

        let nt = ts.global_len(Axis::Time)?;
        let phi_size = geometry.phi_size();
        let roll_len = (0.5 * nt as f64 / phi_size as f64).round() as usize;
        let bins = phase_bins(nt, phi_size);
        let labels = ts.global_dataset(POL)?;
        let labels = labels.as_str(POL)?.iter().cloned().collect_vec();
        let pol_weights = self.pol_weights(&labels)?;
        let full_pol_weight: f32 = pol_weights.iter().map(|&(_, w)| w).sum();
        trace!(
            "averaging {} samples onto {} bins, rolled by {}",
            nt,
            phi_size,
            roll_len
        );

        let (binned, weights) = {
            let vis = ts.main_data()?.data.as_complex(MAIN_DATA)?;
            let mask = ts.main_mask()?.data.as_bool(MAIN_MASK)?;
            let (nf, nbl_local) = (vis.shape()[1], vis.shape()[3]);
            let draw_progress = self.draw_progress && ts.comm().is_root();
            let bin_progress = progress_bar(nbl_local as u64, "phase binning", draw_progress);
            // (bl, phi, freq)
            let columns: Vec<(Array2<Complex<f32>>, Array2<f64>)> = (0..nbl_local)
                .into_par_iter()
                .map(|b| {
                    let mut column = Array2::zeros((phi_size, nf));
                    let mut column_weight = Array2::zeros((phi_size, nf));
                    for (bin, samples) in bins.iter().enumerate() {
                        for f in 0..nf {
                            let mut total = Complex::new(0.0_f32, 0.0);
                            let mut total_weight = 0.0;
                            let mut used_pol_weight = 0.0_f32;
                            for &(p, pol_weight) in &pol_weights {
                                let mut sum = Complex::new(0.0_f64, 0.0);
                                let mut weight = 0.0;
                                for &(t, count) in samples {
                                    let t = (t + nt - roll_len % nt.max(1)) % nt;
                                    if !mask[[t, f, p, b]] {
                                        let v = vis[[t, f, p, b]];
                                        sum += Complex::new(v.re as f64, v.im as f64)
                                            * count as f64;
                                        weight += count as f64;
                                    }
                                }
                                if weight > 0.0 {
                                    let mean = sum / weight;
                                    total += Complex::new(mean.re as f32, mean.im as f32)
                                        * pol_weight;
                                    total_weight += weight;
                                    used_pol_weight += pol_weight;
                                }
                            }
                            // a fully masked product leaves the rest to stand for the whole
                            if used_pol_weight > 0.0 && used_pol_weight < full_pol_weight {
                                total *= full_pol_weight / used_pol_weight;
                            }
                            column[[bin, f]] = total;
                            column_weight[[bin, f]] = total_weight;
                        }
                    }
                    bin_progress.inc(1);
                    (column, column_weight)
                })
                .collect();
            bin_progress.finish();
            let binned = Array3::from_shape_fn((phi_size, nf, nbl_local), |(i, f, b)| {
                columns[b].0[[i, f]]
            });
            let weights = Array3::from_shape_fn((phi_size, nf, nbl_local), |(i, f, b)| {
                columns[b].1[[i, f]]
            });
            (binned, weights)
        };

        // from baselines to phase bins
        let comm = ts.comm().clone();
        let binned = DistArray::wrap(binned.into(), 2, &comm)?.redistribute(0, &comm)?;
        let weights = DistArray::wrap(weights.into(), 2, &comm)?.redistribute(0, &comm)?;
        let binned = binned.local.as_complex(MAIN_DATA)?;
        let weights = weights.local.as_float(MAIN_DATA)?;

        let feedno = ts.global_dataset(FEEDNO)?;
        let feedno = feedno.as_int(FEEDNO)?.iter().copied().collect_vec();
        let blorder = ts.global_dataset(BLORDER)?;
        let lookup = PairLookup::new(&pairs_from_array(blorder.as_int(BLORDER)?, BLORDER)?);
        let mut sources = Vec::with_capacity(geometry.allpairs().len());
        for &(a1, a2) in geometry.allpairs() {
            let (Some(&f1), Some(&f2)) = (feedno.get(a1), feedno.get(a2)) else {
                return Err(TodError::BadArrayShape {
                    argument: "allpairs".into(),
                    function: "MapMakingContext::make_stream".into(),
                    expected: format!("feed positions below {}", feedno.len()),
                    received: format!("({a1}, {a2})"),
                });
            };
            sources.push(lookup.locate((f1, f2))?);
        }

        let stream = self.average_redundant(
            binned.view().into_dimensionality()?,
            weights.view().into_dimensionality()?,
            &sources,
            geometry.redundancy(),
        );
        let local_phi = stream.shape()[0];
        let freqs = ts.global_dataset(FREQ)?;
        let frequencies = Array1::from_iter(freqs.as_float(FREQ)?.iter().copied());
        if ts.comm().is_root() {
            info!(
                "reduced {} baselines to {} redundancy groups over {} phase bins",
                lookup_len(&sources),
                geometry.redundancy().len(),
                phi_size
            );
        }
        trace!("{} local phase bins", local_phi);

        Ok(MapStream {
            timestream: DistArray {
                local: stream.into(),
                dim: 0,
                global_len: phi_size,
            },
            phi: Array1::from_shape_fn(phi_size, |i| 2.0 * PI * i as f64 / phi_size as f64),
            feedmap: geometry.feedmap().clone(),
            feedconj: geometry.feedconj().clone(),
            feedmask: geometry.feedmask().clone(),
            uniquepairs: geometry.uniquepairs().clone(),
            baselines: geometry.baselines().clone(),
            frequencies,
            ntime: phi_size,
        })
    }

    /// Average `(phi, freq, baseline)` data over each redundancy group. `sources` gives, for
    /// each pair in group order, the baseline holding it and whether it must be conjugated.
    pub fn average_redundant(
        &self,
        binned: ndarray::ArrayView3<Complex<f32>>,
        weights: ndarray::ArrayView3<f64>,
        sources: &[(usize, Orientation)],
        redundancy: &[usize],
    ) -> Array3<Complex<f32>> {
        let (nphi, nf, _) = binned.dim();
        let mut stream = Array3::zeros((nphi, nf, redundancy.len()));
        let mut start = 0;
        for (group, &size) in redundancy.iter().enumerate() {
            let members = &sources[start..(start + size).min(sources.len())];
            start += size;
            for i in 0..nphi {
                for f in 0..nf {
                    let mut sum = Complex::new(0.0_f32, 0.0);
                    let mut valid = 0_usize;
                    for &(b, orientation) in members {
                        let v = binned[[i, f, b]];
                        let v = match orientation {
                            Orientation::Forward => v,
                            Orientation::Reversed => v.conj(),
                        };
                        if weights[[i, f, b]] > 0.0 {
                            valid += 1;
                        }
                        sum += v;
                    }
                    let denominator = match self.weighting {
                        RedundancyWeighting::Count => size,
                        RedundancyWeighting::Valid => valid,
                    };
                    if denominator > 0 {
                        stream[[i, f, group]] = sum / denominator as f32;
                    }
                }
            }
        }
        stream
    }

    /// Reduce a timestream, write the stream if an output path is set, and run the synthesis
    /// backend on it. Collective.
    ///
    /// # Errors
    ///
    /// See [`MapMakingContext::make_stream`] and [`RedundantArray::from_timestream`], plus
    /// write and backend errors.
    pub fn run(
        &self,
        ts: &mut Timestream,
        synthesis: &mut dyn BeamSynthesis,
    ) -> Result<MapStream, TodError> {
        let geometry = RedundantArray::from_timestream(ts, self)?;
        let stream = self.make_stream(ts, &geometry)?;
        if let Some(path) = &self.output_path {
            stream.write(path, ts.comm())?;
        }
        if ts.comm().is_root() {
            synthesis.generate_beam_transfers(&geometry, self.tsys)?;
            synthesis.generate_mmodes(self.output_path.as_deref())?;
            synthesis.mapmake(nside_for_lmax(geometry.lmax(), self.accuracy_boost))?;
        }
        ts.comm().barrier()?;
        Ok(stream)
    }
}

fn lookup_len(sources: &[(usize, Orientation)]) -> usize {
    sources.iter().map(|(b, _)| b).unique().count()
}

/// Feed positions as geodetic coordinates.
pub fn feed_positions(feedpos: ArrayView2<f64>) -> Vec<XyzGeodetic> {
    feedpos
        .outer_iter()
        .map(|row| XyzGeodetic {
            x: row[0],
            y: row[1],
            z: row[2],
        })
        .collect()
}
