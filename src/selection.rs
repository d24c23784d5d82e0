//! Selecting a subset of a timestream's time, frequency, polarization and feed axes.
//!
//! Selections are resolved to concrete global index sets relative to whatever is currently
//! loaded, so they compose: selecting on the files before loading ([`PendingSelection`], see
//! [`crate::io::TodReader`]) and selecting in memory afterwards (the `subset_*` methods on
//! [`Container`]) give identical data for identical final index sets.
//!
//! Feed selection turns a set of feeds and a correlation type into baseline indices. Each
//! logical pair is looked up in the baseline order; a pair that only exists the other way round
//! is taken from its reverse and conjugated, which [`PairLookup`] reports explicitly.
//!
//! # Examples
//!
//! ```rust
//! use todpipe::selection::{Corr, FeedSel, resolve_feed_selection};
//!
//! let feedno = [1, 2, 3];
//! let channo = [(0, 1), (2, 3), (4, 5)];
//! let blorder = [(0, 0), (0, 2), (0, 3), (2, 1), (1, 3), (2, 2)];
//!
//! let picked = resolve_feed_selection(
//!     &feedno,
//!     Some(&channo),
//!     &blorder,
//!     &FeedSel::Numbers(vec![1, 2]),
//!     Corr::Cross,
//! )
//! .unwrap();
//!
//! assert_eq!(picked.baseline_idxs, vec![1, 2, 3, 4]);
//! assert_eq!(picked.conjugate, vec![false, false, true, false]);
//! assert_eq!(picked.pairs, vec![(0, 2), (0, 3), (1, 2), (1, 3)]);
//! ```

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use log::{debug, trace, warn};
use ndarray::ArrayD;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    axes::{Axis, ContainerKind},
    constants::{BLORDER, CHANNO, FEEDNO, FREQ, POL},
    container::{Container, Timestream},
    TodError,
};

/// A selection of indices along one axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSel {
    /// Like a Python slice: negative bounds count from the end, out of range bounds clamp.
    Range {
        /// First index, defaults to the start
        start: Option<i64>,
        /// One past the last index, defaults to the end
        stop: Option<i64>,
        /// Must be positive
        step: i64,
    },
    /// Explicit indices. Anything out of range is dropped, the rest sorted and deduplicated.
    List(Vec<usize>),
}

impl IndexSel {
    /// `start..stop` with a step of one.
    pub fn range(start: i64, stop: i64) -> Self {
        IndexSel::Range {
            start: Some(start),
            stop: Some(stop),
            step: 1,
        }
    }

    /// Resolve to sorted indices into an axis of length `len`.
    ///
    /// # Errors
    ///
    /// [`TodError::BadSelection`] for a non-positive step.
    pub fn resolve(&self, len: usize, option: &str) -> Result<Vec<usize>, TodError> {
        match self {
            IndexSel::Range { start, stop, step } => {
                if *step <= 0 {
                    return Err(TodError::BadSelection {
                        option: option.into(),
                        reason: format!("step must be positive, not {step}"),
                    });
                }
                let clamp = |bound: i64| -> usize {
                    let bound = if bound < 0 { bound + len as i64 } else { bound };
                    bound.clamp(0, len as i64) as usize
                };
                let start = start.map_or(0, clamp);
                let stop = stop.map_or(len, clamp);
                Ok((start..stop.max(start)).step_by(*step as usize).collect())
            }
            IndexSel::List(idxs) => {
                let resolved: Vec<usize> = idxs
                    .iter()
                    .copied()
                    .filter(|&idx| idx < len)
                    .sorted()
                    .dedup()
                    .collect();
                if resolved.len() != idxs.len() {
                    debug!(
                        "{} selection: kept {} of {} requested indices",
                        option,
                        resolved.len(),
                        idxs.len()
                    );
                }
                Ok(resolved)
            }
        }
    }
}

/// A frequency selection.
#[derive(Debug, Clone, PartialEq)]
pub enum FreqSel {
    /// By channel index
    Index(IndexSel),
    /// Every channel from the one nearest `start` to the one nearest `stop` (MHz), inclusive.
    Mhz {
        /// Lower bound in MHz
        start: f64,
        /// Upper bound in MHz
        stop: f64,
    },
}

impl FreqSel {
    /// Resolve against the currently loaded channel frequencies.
    ///
    /// # Errors
    ///
    /// [`TodError::BadSelection`] for a bad index range or when there are no channels.
    pub fn resolve(&self, freqs: &[f64]) -> Result<Vec<usize>, TodError> {
        match self {
            FreqSel::Index(sel) => sel.resolve(freqs.len(), "frequency"),
            FreqSel::Mhz { start, stop } => {
                let (Some(first), Some(last)) = (nearest_index(freqs, *start), nearest_index(freqs, *stop)) else {
                    return Err(TodError::BadSelection {
                        option: "frequency".into(),
                        reason: "there are no frequency channels".into(),
                    });
                };
                let (first, last) = if first <= last { (first, last) } else { (last, first) };
                Ok((first..=last).collect())
            }
        }
    }
}

/// Index of the coordinate nearest to `value`. Ties go to the lower index.
pub fn nearest_index(coords: &[f64], value: f64) -> Option<usize> {
    coords
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - value).abs().total_cmp(&(*b - value).abs()))
        .map(|(idx, _)| idx)
}

/// A polarization selection, for separated timestreams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolSel {
    /// By polarization index
    Index(IndexSel),
    /// By label, e.g. `xx`
    Labels(Vec<String>),
}

impl PolSel {
    /// Resolve against the currently loaded polarization labels.
    ///
    /// # Errors
    ///
    /// [`TodError::BadSelection`] for an unknown label or a bad index range.
    pub fn resolve(&self, labels: &[String]) -> Result<Vec<usize>, TodError> {
        match self {
            PolSel::Index(sel) => sel.resolve(labels.len(), "polarization"),
            PolSel::Labels(wanted) => wanted
                .iter()
                .map(|label| {
                    labels
                        .iter()
                        .position(|have| have.eq_ignore_ascii_case(label))
                        .ok_or_else(|| TodError::BadSelection {
                            option: "polarization".into(),
                            reason: format!("no polarization {label}, have {labels:?}"),
                        })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(|idxs| idxs.into_iter().sorted().dedup().collect()),
        }
    }
}

/// A feed selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSel {
    /// Feed numbers. Numbers that aren't loaded are ignored.
    Numbers(Vec<i64>),
    /// Positions in the loaded feed list.
    Index(IndexSel),
}

/// Which baselines between the selected feeds to keep.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Corr {
    /// A feed with itself
    Auto,
    /// Distinct feeds
    Cross,
    /// Both
    #[default]
    All,
}

/// Which way round a pair was found in the baseline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// As requested
    Forward,
    /// Only the reverse exists, so the data must be conjugated
    Reversed,
}

/// Finds pairs in a baseline order.
#[derive(Debug, Clone)]
pub struct PairLookup {
    positions: HashMap<(i64, i64), usize>,
}

impl PairLookup {
    /// Index a baseline order. The first occurrence of a repeated pair wins.
    pub fn new(pairs: &[(i64, i64)]) -> Self {
        let mut positions = HashMap::with_capacity(pairs.len());
        for (idx, &pair) in pairs.iter().enumerate() {
            positions.entry(pair).or_insert(idx);
        }
        Self { positions }
    }

    /// Find `pair`, falling back to its reverse.
    ///
    /// When a pair of distinct channels exists both ways round, the forward entry is used and a
    /// warning logged, since Hermitian data shouldn't be stored twice.
    ///
    /// # Errors
    ///
    /// [`TodError::PairNotFound`] if neither orientation exists.
    pub fn locate(&self, pair: (i64, i64)) -> Result<(usize, Orientation), TodError> {
        let forward = self.positions.get(&pair).copied();
        let reverse = self.positions.get(&(pair.1, pair.0)).copied();
        match (forward, reverse) {
            (Some(idx), Some(ridx)) => {
                if idx != ridx {
                    warn!(
                        "pair {:?} is stored in both orientations (baselines {} and {}), using {}",
                        pair, idx, ridx, idx
                    );
                }
                Ok((idx, Orientation::Forward))
            }
            (Some(idx), None) => Ok((idx, Orientation::Forward)),
            (None, Some(ridx)) => {
                debug!(
                    "pair {:?} found reversed at baseline {}, conjugating",
                    pair, ridx
                );
                Ok((ridx, Orientation::Reversed))
            }
            (None, None) => Err(TodError::PairNotFound { pair }),
        }
    }
}

/// Read an `(n, 2)` integer array as a list of pairs.
///
/// # Errors
///
/// [`TodError::BadArrayShape`] for any other shape.
pub fn pairs_from_array(array: &ArrayD<i64>, name: &str) -> Result<Vec<(i64, i64)>, TodError> {
    if array.ndim() != 2 || array.shape()[1] != 2 {
        return Err(TodError::BadArrayShape {
            argument: name.into(),
            function: "pairs_from_array".into(),
            expected: "(n, 2)".into(),
            received: format!("{:?}", array.shape()),
        });
    }
    Ok(array
        .outer_iter()
        .map(|row| (row[0], row[1]))
        .collect())
}

/// The baselines a feed selection resolved to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedSelection {
    /// Positions of the selected feeds in the feed list, ascending
    pub feed_idxs: Vec<usize>,
    /// Baseline indices to keep, ascending
    pub baseline_idxs: Vec<usize>,
    /// Whether each kept baseline was found reversed and must be conjugated
    pub conjugate: Vec<bool>,
    /// The pair each kept baseline represents, in the requested orientation
    pub pairs: Vec<(i64, i64)>,
}

/// The logical pairs `corr` asks for between `feeds`.
///
/// With `channels` (a raw timestream) each feed contributes its `(x, y)` channel pair and the
/// result is channel pairs; without, the result is feed-number pairs.
pub fn requested_pairs(
    feeds: &[i64],
    channels: Option<&[(i64, i64)]>,
    corr: Corr,
) -> Vec<(i64, i64)> {
    let autos = || (0..feeds.len()).map(|i| (i, i));
    let crosses = || (0..feeds.len()).tuple_combinations();
    let feed_pairs: Vec<(usize, usize)> = match corr {
        Corr::Auto => autos().collect(),
        Corr::Cross => crosses().collect(),
        Corr::All => autos().chain(crosses()).collect(),
    };
    match channels {
        None => feed_pairs
            .into_iter()
            .map(|(i, j)| (feeds[i], feeds[j]))
            .collect(),
        Some(channels) => feed_pairs
            .into_iter()
            .flat_map(|(i, j)| {
                let ((xi, yi), (xj, yj)) = (channels[i], channels[j]);
                if i == j {
                    // the self products and the cross term between the feed's own channels
                    vec![(xi, xi), (yi, yi), (xi, yi)]
                } else {
                    vec![(xi, xj), (xi, yj), (yi, xj), (yi, yj)]
                }
            })
            .collect(),
    }
}

/// Resolve a feed selection against the loaded feed list and baseline order.
///
/// `channo` holds each feed's `(x, y)` correlator channels for a raw timestream; for a separated
/// timestream it is `None` and `blorder` holds feed pairs.
///
/// # Errors
///
/// - [`TodError::BadSelection`] if no feeds are selected, or `channo` doesn't match `feedno`
/// - [`TodError::PairNotFound`] if a requested pair is missing from `blorder`
pub fn resolve_feed_selection(
    feedno: &[i64],
    channo: Option<&[(i64, i64)]>,
    blorder: &[(i64, i64)],
    sel: &FeedSel,
    corr: Corr,
) -> Result<FeedSelection, TodError> {
    if let Some(channo) = channo {
        if channo.len() != feedno.len() {
            return Err(TodError::BadSelection {
                option: "feed".into(),
                reason: format!(
                    "{} channel pairs for {} feeds",
                    channo.len(),
                    feedno.len()
                ),
            });
        }
    }
    let feed_idxs: Vec<usize> = match sel {
        FeedSel::Numbers(numbers) => feedno
            .iter()
            .enumerate()
            .filter(|(_, feed)| numbers.contains(feed))
            .map(|(idx, _)| idx)
            .collect(),
        FeedSel::Index(sel) => sel.resolve(feedno.len(), "feed")?,
    };
    if feed_idxs.is_empty() {
        return Err(TodError::BadSelection {
            option: "feed".into(),
            reason: format!("{sel:?} matches none of the feeds {feedno:?}"),
        });
    }
    // pairs are built in ascending feed-number order
    let ordered: Vec<usize> = feed_idxs
        .iter()
        .copied()
        .sorted_by_key(|&idx| feedno[idx])
        .collect();
    let feeds: Vec<i64> = ordered.iter().map(|&idx| feedno[idx]).collect();
    let channels: Option<Vec<(i64, i64)>> =
        channo.map(|channo| ordered.iter().map(|&idx| channo[idx]).collect());

    let lookup = PairLookup::new(blorder);
    let mut picked: BTreeMap<usize, (bool, (i64, i64))> = BTreeMap::new();
    for pair in requested_pairs(&feeds, channels.as_deref(), corr) {
        let (idx, orientation) = lookup.locate(pair)?;
        picked
            .entry(idx)
            .or_insert((orientation == Orientation::Reversed, pair));
    }
    trace!("feed selection {:?} {} -> {:?}", feeds, corr, picked);

    let mut result = FeedSelection {
        feed_idxs,
        ..FeedSelection::default()
    };
    for (idx, (conjugate, pair)) in picked {
        result.baseline_idxs.push(idx);
        result.conjugate.push(conjugate);
        result.pairs.push(pair);
    }
    Ok(result)
}

/// The baselines picked by a feed selection, relative to the file's baseline order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaselinePick {
    /// Baseline indices in the file
    pub idxs: Vec<usize>,
    /// Whether each must be conjugated
    pub conjugate: Vec<bool>,
    /// The pair each represents after conjugation
    pub pairs: Vec<(i64, i64)>,
}

/// A selection recorded before loading, in the file's own index space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSelection {
    /// Global time indices across all files
    pub time: Option<Vec<usize>>,
    /// Frequency indices
    pub freq: Option<Vec<usize>>,
    /// Polarization indices
    pub pol: Option<Vec<usize>>,
    /// Feed positions
    pub feeds: Option<Vec<usize>>,
    /// Baselines with orientation
    pub baselines: Option<BaselinePick>,
}

/// Narrow `current` (all of `0..len` when unset) to the positions `relative` within it.
pub fn compose(current: &Option<Vec<usize>>, len: usize, relative: &[usize]) -> Vec<usize> {
    match current {
        Some(current) => relative.iter().map(|&idx| current[idx]).collect(),
        None => relative.iter().copied().filter(|&idx| idx < len).collect(),
    }
}

impl PendingSelection {
    /// The indices along `axis` that will be loaded, out of `len` in the file.
    pub fn indices(&self, axis: Axis, len: usize) -> Vec<usize> {
        let current = match axis {
            Axis::Time => &self.time,
            Axis::Frequency => &self.freq,
            Axis::Polarization => &self.pol,
            Axis::Baseline => return match &self.baselines {
                Some(pick) => pick.idxs.clone(),
                None => (0..len).collect(),
            },
        };
        current.clone().unwrap_or_else(|| (0..len).collect())
    }

    /// Narrow the selection along a main axis other than baseline.
    pub fn narrow(&mut self, axis: Axis, len: usize, relative: &[usize]) {
        let current = match axis {
            Axis::Time => &mut self.time,
            Axis::Frequency => &mut self.freq,
            Axis::Polarization => &mut self.pol,
            Axis::Baseline => {
                let pick = self.baselines.take().unwrap_or_else(|| BaselinePick {
                    idxs: (0..len).collect(),
                    conjugate: vec![false; len],
                    pairs: vec![],
                });
                self.baselines = Some(BaselinePick {
                    idxs: relative.iter().map(|&idx| pick.idxs[idx]).collect(),
                    conjugate: relative.iter().map(|&idx| pick.conjugate[idx]).collect(),
                    pairs: relative
                        .iter()
                        .filter_map(|&idx| pick.pairs.get(idx).copied())
                        .collect(),
                });
                return;
            }
        };
        *current = Some(compose(current, len, relative));
    }

    /// Narrow by a feed selection resolved against the currently selected view.
    pub fn narrow_feeds(&mut self, nfeed: usize, nbl: usize, picked: &FeedSelection) {
        self.feeds = Some(compose(&self.feeds, nfeed, &picked.feed_idxs));
        let current = self.baselines.take().unwrap_or_else(|| BaselinePick {
            idxs: (0..nbl).collect(),
            conjugate: vec![false; nbl],
            pairs: vec![],
        });
        self.baselines = Some(BaselinePick {
            idxs: picked
                .baseline_idxs
                .iter()
                .map(|&idx| current.idxs[idx])
                .collect(),
            conjugate: picked
                .baseline_idxs
                .iter()
                .zip_eq(&picked.conjugate)
                .map(|(&idx, &flip)| current.conjugate[idx] ^ flip)
                .collect(),
            pairs: picked.pairs.clone(),
        });
    }
}

impl Container {
    fn int_dataset(&self, name: &str) -> Result<ArrayD<i64>, TodError> {
        Ok(self.global_dataset(name)?.as_int(name)?.clone())
    }

    /// Keep only the selected time samples. Collective.
    ///
    /// # Errors
    ///
    /// [`TodError::BadSelection`] or communication errors.
    pub fn subset_time_select(&mut self, sel: &IndexSel) -> Result<(), TodError> {
        let idxs = sel.resolve(self.global_len(Axis::Time)?, "time")?;
        self.select_axis(Axis::Time, &idxs)
    }

    /// Keep only the selected frequency channels. Collective.
    ///
    /// # Errors
    ///
    /// [`TodError::BadSelection`], [`TodError::UnknownDataset`] if selecting by MHz without a
    /// `freq` dataset, or communication errors.
    pub fn subset_frequency_select(&mut self, sel: &FreqSel) -> Result<(), TodError> {
        let idxs = match sel {
            FreqSel::Index(sel) => sel.resolve(self.global_len(Axis::Frequency)?, "frequency")?,
            FreqSel::Mhz { .. } => {
                let freqs = self.global_dataset(FREQ)?;
                let freqs = freqs.as_float(FREQ)?;
                sel.resolve(&freqs.iter().copied().collect::<Vec<_>>())?
            }
        };
        self.select_axis(Axis::Frequency, &idxs)
    }

    /// Keep only the baselines between the selected feeds that match `corr`, conjugating any
    /// found reversed, and record the selected pairs. Collective.
    ///
    /// # Errors
    ///
    /// [`TodError::BadSelection`], [`TodError::PairNotFound`], [`TodError::UnknownDataset`]
    /// when `feedno`, `blorder` (or `channo` for a raw timestream) are missing, or
    /// communication errors.
    pub fn subset_feed_select(&mut self, sel: &FeedSel, corr: Corr) -> Result<(), TodError> {
        let feedno: Vec<i64> = self.int_dataset(FEEDNO)?.iter().copied().collect();
        let blorder = pairs_from_array(&self.int_dataset(BLORDER)?, BLORDER)?;
        let channo = match self.kind() {
            ContainerKind::Raw => Some(pairs_from_array(&self.int_dataset(CHANNO)?, CHANNO)?),
            ContainerKind::Timestream => None,
        };
        let picked = resolve_feed_selection(&feedno, channo.as_deref(), &blorder, sel, corr)?;
        debug!(
            "feed selection keeps {} feeds and {} of {} baselines",
            picked.feed_idxs.len(),
            picked.baseline_idxs.len(),
            blorder.len()
        );
        self.select_feeds(&picked.feed_idxs);
        self.select_axis(Axis::Baseline, &picked.baseline_idxs)?;
        self.orient_baselines(&picked.conjugate, &picked.pairs)?;
        self.set_selected_channel_pairs(Some(picked.pairs));
        Ok(())
    }
}

impl Timestream {
    /// Keep only the selected polarizations. Collective.
    ///
    /// # Errors
    ///
    /// [`TodError::BadSelection`], [`TodError::UnknownDataset`] without a `pol` dataset, or
    /// communication errors.
    pub fn subset_polarization_select(&mut self, sel: &PolSel) -> Result<(), TodError> {
        let labels = self.global_dataset(POL)?;
        let labels: Vec<String> = labels.as_str(POL)?.iter().cloned().collect();
        let idxs = sel.resolve(&labels)?;
        self.select_axis(Axis::Polarization, &idxs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::{
        comm::{run_workers, Comm},
        constants::MAIN_DATA,
        test_common::{blorder_for_channels, scenario_blorder, synthetic_raw, vis_value},
    };

    #[test]
    fn test_index_sel_python_slice_semantics() {
        let sel = IndexSel::Range {
            start: Some(-3),
            stop: None,
            step: 1,
        };
        assert_eq!(sel.resolve(10, "time").unwrap(), vec![7, 8, 9]);
        let sel = IndexSel::Range {
            start: Some(1),
            stop: Some(100),
            step: 3,
        };
        assert_eq!(sel.resolve(10, "time").unwrap(), vec![1, 4, 7]);
        assert_eq!(IndexSel::range(5, 2).resolve(10, "time").unwrap(), Vec::<usize>::new());
        assert!(matches!(
            IndexSel::Range {
                start: None,
                stop: None,
                step: 0
            }
            .resolve(10, "time"),
            Err(TodError::BadSelection { .. })
        ));
        assert_eq!(
            IndexSel::List(vec![9, 2, 2, 11]).resolve(10, "time").unwrap(),
            vec![2, 9]
        );
    }

    #[test]
    fn test_freq_sel_nearest_coordinate() {
        let freqs = [700.0, 700.25, 700.5, 700.75, 701.0];
        let sel = FreqSel::Mhz {
            start: 700.3,
            stop: 700.8,
        };
        assert_eq!(sel.resolve(&freqs).unwrap(), vec![1, 2, 3]);
        assert_eq!(nearest_index(&freqs, 10.0), Some(0));
        assert!(FreqSel::Mhz {
            start: 1.0,
            stop: 2.0
        }
        .resolve(&[])
        .is_err());
    }

    #[test]
    fn test_pol_sel_labels() {
        let labels: Vec<String> = ["xx", "yy", "xy", "yx"].iter().map(|s| s.to_string()).collect();
        let sel = PolSel::Labels(vec!["yy".into(), "XX".into()]);
        assert_eq!(sel.resolve(&labels).unwrap(), vec![0, 1]);
        assert!(matches!(
            PolSel::Labels(vec!["I".into()]).resolve(&labels),
            Err(TodError::BadSelection { .. })
        ));
    }

    #[test]
    fn test_cross_scenario_resolves_channel_pairs() {
        let feedno = [1, 2, 3];
        let channo = [(0, 1), (2, 3), (4, 5)];
        let blorder = scenario_blorder();
        let picked = resolve_feed_selection(
            &feedno,
            Some(&channo),
            &blorder,
            &FeedSel::Numbers(vec![1, 2]),
            Corr::Cross,
        )
        .unwrap();
        let pairs: BTreeSet<_> = picked.pairs.iter().copied().collect();
        assert_eq!(
            pairs,
            [(0, 2), (0, 3), (1, 2), (1, 3)].into_iter().collect::<BTreeSet<_>>()
        );
        for ((&idx, &conj), &pair) in picked
            .baseline_idxs
            .iter()
            .zip(&picked.conjugate)
            .zip(&picked.pairs)
        {
            if conj {
                assert_eq!(blorder[idx], (pair.1, pair.0));
            } else {
                assert_eq!(blorder[idx], pair);
            }
        }
        // (1, 2) is only stored as (2, 1)
        let pos = picked.pairs.iter().position(|&p| p == (1, 2)).unwrap();
        assert!(picked.conjugate[pos]);
        assert_eq!(picked.feed_idxs, vec![0, 1]);
    }

    #[test]
    fn test_pair_not_found() {
        let result = resolve_feed_selection(
            &[1, 2],
            Some(&[(0, 1), (2, 3)]),
            &[(0, 0), (1, 1), (0, 1)],
            &FeedSel::Numbers(vec![1, 2]),
            Corr::Cross,
        );
        assert!(matches!(result, Err(TodError::PairNotFound { .. })));
    }

    #[test]
    fn test_all_is_auto_union_cross() {
        let feedno = [1, 2, 3];
        let channo = [(0, 1), (2, 3), (4, 5)];
        let blorder = scenario_blorder();
        let sel = FeedSel::Numbers(vec![1, 2, 3]);
        let resolve = |corr| {
            resolve_feed_selection(&feedno, Some(&channo), &blorder, &sel, corr)
                .unwrap()
                .baseline_idxs
        };
        let auto: BTreeSet<usize> = resolve(Corr::Auto).into_iter().collect();
        let cross: BTreeSet<usize> = resolve(Corr::Cross).into_iter().collect();
        let all = resolve(Corr::All);
        assert!(auto.is_disjoint(&cross));
        assert_eq!(all.len(), auto.len() + cross.len());
        assert_eq!(
            all.into_iter().collect::<BTreeSet<_>>(),
            auto.union(&cross).copied().collect()
        );
        assert_eq!(auto.len(), 9);
        assert_eq!(cross.len(), 12);
    }

    #[test]
    fn test_all_ignores_duplicated_self_cross() {
        let feedno = [1, 2];
        let channo = [(0, 1), (2, 3)];
        let mut blorder = blorder_for_channels(4);
        // the (0, 1) cross term stored a second time, reversed
        blorder.push((1, 0));
        let sel = FeedSel::Numbers(vec![1, 2]);
        let resolve = |corr| {
            resolve_feed_selection(&feedno, Some(&channo), &blorder, &sel, corr)
                .unwrap()
                .baseline_idxs
        };
        let mut union = resolve(Corr::Auto);
        union.extend(resolve(Corr::Cross));
        union.sort_unstable();
        let all = resolve(Corr::All);
        assert_eq!(all, union);
        assert!(!all.contains(&(blorder.len() - 1)));
    }

    #[test]
    fn test_feed_selection_order_independent() {
        run_workers(2, |comm| {
            let mut stepwise = synthetic_raw(comm.clone(), 4, 3, &[1, 2, 3, 4]);
            let mut direct = stepwise.copy();
            stepwise
                .subset_feed_select(&FeedSel::Numbers(vec![1, 2, 4]), Corr::All)
                .unwrap();
            stepwise
                .subset_feed_select(&FeedSel::Numbers(vec![2, 4]), Corr::All)
                .unwrap();
            direct
                .subset_feed_select(&FeedSel::Numbers(vec![2, 4]), Corr::All)
                .unwrap();
            for (name, ds) in direct.datasets() {
                assert_eq!(stepwise.dataset(name).unwrap(), ds, "{name}");
            }
            assert_eq!(
                stepwise.selected_channel_pairs(),
                direct.selected_channel_pairs()
            );
        });
    }

    #[test]
    fn test_subset_feed_select_conjugates_reversed() {
        let mut raw = synthetic_raw(Comm::solo(), 2, 2, &[1, 2]);
        let blorder = pairs_from_array(
            raw.dataset(BLORDER).unwrap().data.as_int(BLORDER).unwrap(),
            BLORDER,
        )
        .unwrap();
        raw.subset_feed_select(&FeedSel::Numbers(vec![1, 2]), Corr::Cross)
            .unwrap();
        let pairs = raw.selected_channel_pairs().unwrap().to_vec();
        let new_blorder = pairs_from_array(
            raw.dataset(BLORDER).unwrap().data.as_int(BLORDER).unwrap(),
            BLORDER,
        )
        .unwrap();
        assert_eq!(new_blorder, pairs);
        let vis = raw.main_data().unwrap().data.as_complex(MAIN_DATA).unwrap();
        for (col, &pair) in pairs.iter().enumerate() {
            let stored = blorder.iter().position(|&p| p == pair);
            let expected = match stored {
                Some(orig) => vis_value(1, 1, orig),
                None => {
                    let orig = blorder.iter().position(|&p| p == (pair.1, pair.0)).unwrap();
                    vis_value(1, 1, orig).conj()
                }
            };
            assert_eq!(vis[[1, 1, col]], expected);
        }
    }

    #[test]
    fn test_subset_select_along_time_and_freq() {
        run_workers(3, |comm| {
            let mut raw = synthetic_raw(comm, 9, 6, &[1, 2]);
            raw.subset_time_select(&IndexSel::Range {
                start: Some(1),
                stop: Some(-1),
                step: 2,
            })
            .unwrap();
            raw.subset_frequency_select(&FreqSel::Mhz {
                start: 700.5,
                stop: 701.0,
            })
            .unwrap();
            assert_eq!(raw.global_len(Axis::Time).unwrap(), 4);
            assert_eq!(raw.global_len(Axis::Frequency).unwrap(), 3);
            let vis = raw.global_dataset(MAIN_DATA).unwrap();
            let vis = vis.as_complex(MAIN_DATA).unwrap();
            assert_eq!(vis[[0, 0, 0]], vis_value(1, 2, 0));
            assert_eq!(vis[[3, 2, 5]], vis_value(7, 4, 5));
        });
    }

    #[test]
    fn test_pending_selection_composes() {
        let mut pending = PendingSelection::default();
        pending.narrow(Axis::Time, 10, &[2, 3, 4, 5]);
        pending.narrow(Axis::Time, 10, &[1, 3]);
        assert_eq!(pending.indices(Axis::Time, 10), vec![3, 5]);
        assert_eq!(pending.indices(Axis::Frequency, 3), vec![0, 1, 2]);
    }
}
