//! Separating a raw timestream's mixed-polarization baselines into polarization and feed-pair
//! axes.
//!
//! Every feed has an `x` and a `y` correlator channel, so the baseline between feeds `i ≤ j`
//! of a raw timestream is spread over four channel pairs. [`RawTimestream::separate_pol_and_bl`]
//! gathers them into a timestream with a `pol` axis of `xx, yy, xy, yx` and one baseline per
//! feed pair, in ascending order of feed number.

use itertools::Itertools;
use log::{debug, info};
use ndarray::{ArrayD, Axis as NdAxis, Zip};

use crate::{
    axes::{Axis, ContainerKind},
    constants::{BLORDER, CHANNO, FEEDNO, LINEAR_POLS, MAIN_DATA, MAIN_MASK, POL},
    container::{Container, RawTimestream, Timestream},
    dataset::{allocate, DataArray, Dataset, DistArray, Layout, Payload},
    selection::{pairs_from_array, Orientation, PairLookup},
    TodError,
};

/// Where each polarization of each feed pair lives in the raw baseline order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeparationPlan {
    /// Feed positions in ascending order of feed number
    pub feed_order: Vec<usize>,
    /// The feed-number pairs of the separated baseline axis
    pub feed_pairs: Vec<(i64, i64)>,
    /// Raw baseline index of each feed pair, per polarization in [`LINEAR_POLS`] order
    pub idxs: [Vec<usize>; 4],
    /// Whether each was found reversed, per polarization
    pub conjugate: [Vec<bool>; 4],
}

impl SeparationPlan {
    /// Look up the four channel pairs of every feed pair `i ≤ j`.
    ///
    /// # Errors
    ///
    /// - [`TodError::BadArrayShape`] if `channo` doesn't have one row per feed
    /// - [`TodError::PairNotFound`] if a channel pair is missing in both orientations
    pub fn new(
        feedno: &[i64],
        channo: &[(i64, i64)],
        blorder: &[(i64, i64)],
    ) -> Result<Self, TodError> {
        if channo.len() != feedno.len() {
            return Err(TodError::BadArrayShape {
                argument: CHANNO.into(),
                function: "SeparationPlan::new".into(),
                expected: format!("({}, 2)", feedno.len()),
                received: format!("({}, 2)", channo.len()),
            });
        }
        let feed_order: Vec<usize> = (0..feedno.len()).sorted_by_key(|&k| feedno[k]).collect();
        let lookup = PairLookup::new(blorder);
        let mut plan = Self {
            feed_order,
            feed_pairs: vec![],
            idxs: Default::default(),
            conjugate: Default::default(),
        };
        for pair in plan.feed_order.iter().combinations_with_replacement(2) {
            let (&fi, &fj) = (pair[0], pair[1]);
            let ((xi, yi), (xj, yj)) = (channo[fi], channo[fj]);
            plan.feed_pairs.push((feedno[fi], feedno[fj]));
            // xx, yy, xy, yx
            for (p, channels) in [(xi, xj), (yi, yj), (xi, yj), (yi, xj)].into_iter().enumerate() {
                let (idx, orientation) = lookup.locate(channels)?;
                plan.idxs[p].push(idx);
                plan.conjugate[p].push(orientation == Orientation::Reversed);
            }
        }
        Ok(plan)
    }

    /// Gather `(…, nbl_raw)` into `(…, 4, npair)`, applying `orient` to values that were found
    /// reversed.
    ///
    /// # Errors
    ///
    /// [`TodError::InsufficientMemory`] if the result can't be allocated.
    pub fn gather<T: Clone>(
        &self,
        raw: &ArrayD<T>,
        fill: T,
        orient: impl Fn(&T) -> T,
    ) -> Result<ArrayD<T>, TodError> {
        let bl_dim = raw.ndim() - 1;
        let mut shape = raw.shape()[..bl_dim].to_vec();
        shape.extend([LINEAR_POLS.len(), self.feed_pairs.len()]);
        let mut separated = allocate(&shape, fill)?;
        for (b, mut column) in separated
            .axis_iter_mut(NdAxis(bl_dim + 1))
            .enumerate()
        {
            for (p, mut target) in column.axis_iter_mut(NdAxis(bl_dim)).enumerate() {
                let source = raw.index_axis(NdAxis(bl_dim), self.idxs[p][b]);
                if self.conjugate[p][b] {
                    Zip::from(&mut target)
                        .and(&source)
                        .for_each(|t, s| *t = orient(s));
                } else {
                    target.assign(&source);
                }
            }
        }
        Ok(separated)
    }
}

/// Re-wrap a dataset's local data with its layout, ready for another container.
fn payload_of(ds: &Dataset, data: DataArray) -> Payload {
    match ds.layout {
        Layout::Common => Payload::Common(data),
        Layout::Distributed { dim, global_len } => Payload::Distributed(DistArray {
            local: data,
            dim,
            global_len,
        }),
    }
}

impl RawTimestream {
    /// Separate polarizations from baselines, producing a new [`Timestream`]. Collective.
    ///
    /// A raw timestream distributed along baseline is redistributed along time first. The
    /// timestream stays distributed along the axis the source had at that point; with
    /// `keep_dist_axis` the source is moved back to its original axis before returning.
    ///
    /// Datasets aligned with time or frequency are copied by role, feed-ordered datasets are
    /// reordered by ascending feed number, `channo` is dropped, and `blorder` becomes the feed
    /// pairs.
    ///
    /// # Errors
    ///
    /// - [`TodError::UnexpectedAuxiliaryDataset`] if a dataset other than the main data, its
    ///   mask and `blorder` follows the baseline axis
    /// - [`TodError::UnknownDataset`] without `feedno`, `channo` or `blorder`
    /// - [`TodError::PairNotFound`] if a channel pair is missing
    /// - communication errors
    pub fn separate_pol_and_bl(&mut self, keep_dist_axis: bool) -> Result<Timestream, TodError> {
        let unexpected: Vec<String> = self
            .datasets()
            .filter(|(name, ds)| {
                ![MAIN_DATA, MAIN_MASK, BLORDER].contains(name)
                    && ds.role.aligns_with(Axis::Baseline)
            })
            .map(|(name, _)| name.to_string())
            .collect();
        if !unexpected.is_empty() {
            return Err(TodError::UnexpectedAuxiliaryDataset { names: unexpected });
        }

        let original_axis = self.dist_axis();
        if original_axis == Axis::Baseline {
            debug!("separation needs whole baselines, redistributing along time");
            self.redistribute(Axis::Time)?;
        }

        let feedno: Vec<i64> = self
            .global_dataset(FEEDNO)?
            .as_int(FEEDNO)?
            .iter()
            .copied()
            .collect();
        let channo = pairs_from_array(self.global_dataset(CHANNO)?.as_int(CHANNO)?, CHANNO)?;
        let blorder = pairs_from_array(self.global_dataset(BLORDER)?.as_int(BLORDER)?, BLORDER)?;
        let plan = SeparationPlan::new(&feedno, &channo, &blorder)?;

        let mut ts = Container::new(ContainerKind::Timestream, self.dist_axis(), self.comm().clone())?;

        let vis = self.main_data()?;
        let separated = plan.gather(vis.data.as_complex(MAIN_DATA)?, Default::default(), |v| {
            v.conj()
        })?;
        ts.create_known_dataset(MAIN_DATA, payload_of(vis, DataArray::from(separated)))?;
        let mask = self.main_mask()?;
        let separated = plan.gather(mask.data.as_bool(MAIN_MASK)?, false, |m| *m)?;
        ts.create_known_dataset(MAIN_MASK, payload_of(mask, DataArray::from(separated)))?;

        for (name, ds) in self.datasets() {
            if [MAIN_DATA, MAIN_MASK, BLORDER, CHANNO].contains(&name) {
                continue;
            }
            let data = match ds.role.feed_dim() {
                Some(dim) => ds.data.select(dim, &plan.feed_order),
                None => ds.data.clone(),
            };
            ts.create_dataset(name, payload_of(ds, data), ds.role.clone())?;
            ts.dataset_mut(name)?.attrs = ds.attrs.clone();
        }
        ts.create_known_dataset(
            POL,
            DataArray::from(ndarray::Array1::from_iter(
                LINEAR_POLS.iter().map(|pol| pol.to_string()),
            )),
        )?;
        ts.create_known_dataset(
            BLORDER,
            DataArray::from(ndarray::Array2::from_shape_fn(
                (plan.feed_pairs.len(), 2),
                |(b, k)| {
                    let (i, j) = plan.feed_pairs[b];
                    if k == 0 {
                        i
                    } else {
                        j
                    }
                },
            )),
        )?;

        ts.copy_attrs_from(&self.attrs);
        ts.attrs
            .insert("dimname".into(), ContainerKind::Timestream.dimname().into());

        if keep_dist_axis && self.dist_axis() != original_axis {
            self.redistribute(original_axis)?;
        }
        if ts.comm().is_root() {
            info!(
                "separated {} raw baselines into {} feed pairs x {} polarizations",
                blorder.len(),
                plan.feed_pairs.len(),
                LINEAR_POLS.len()
            );
        }
        Timestream::new(ts)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array1;

    use super::*;
    use crate::{
        axes::Role,
        comm::{run_workers, Comm},
        test_common::{synthetic_raw, vis_value},
    };

    #[test]
    fn test_plan_for_scenario() {
        let feedno = [1, 2];
        let channo = [(0, 1), (2, 3)];
        let blorder = crate::test_common::blorder_for_channels(4);
        let plan = SeparationPlan::new(&feedno, &channo, &blorder).unwrap();
        assert_eq!(plan.feed_pairs, vec![(1, 1), (1, 2), (2, 2)]);
        // the yx product of feed pair (1, 2) is channel pair (1, 2), stored as (2, 1)
        assert_eq!(blorder[plan.idxs[3][1]], (2, 1));
        assert!(!plan.conjugate[3][1]);
        // the xy product of (1, 2) is (0, 3), stored as (3, 0)
        assert_eq!(blorder[plan.idxs[2][1]], (3, 0));
        assert!(plan.conjugate[2][1]);
    }

    #[test]
    fn test_separation_reconstructs_raw_entries() {
        for size in 1..=3 {
            run_workers(size, |comm| {
                let mut raw = synthetic_raw(comm, 5, 3, &[3, 1, 2]);
                let feedno: Vec<i64> = vec![3, 1, 2];
                let channo: Vec<(i64, i64)> = vec![(0, 1), (2, 3), (4, 5)];
                let blorder = crate::test_common::blorder_for_channels(6);
                let ts = raw.separate_pol_and_bl(false).unwrap();

                assert_eq!(ts.global_len(Axis::Polarization).unwrap(), 4);
                assert_eq!(ts.global_len(Axis::Baseline).unwrap(), 6);
                let feeds = ts.global_dataset(FEEDNO).unwrap();
                assert_eq!(feeds.as_int(FEEDNO).unwrap().as_slice().unwrap(), &[1, 2, 3]);
                assert!(!ts.contains(CHANNO));

                let vis = ts.global_dataset(MAIN_DATA).unwrap();
                let vis = vis.as_complex(MAIN_DATA).unwrap();
                let pairs = pairs_from_array(
                    ts.global_dataset(BLORDER).unwrap().as_int(BLORDER).unwrap(),
                    BLORDER,
                )
                .unwrap();
                assert_eq!(pairs[0], (1, 1));
                assert_eq!(pairs[5], (3, 3));
                let chan = |feed: i64| channo[feedno.iter().position(|&f| f == feed).unwrap()];
                for (b, &(fi, fj)) in pairs.iter().enumerate() {
                    let ((xi, yi), (xj, yj)) = (chan(fi), chan(fj));
                    for (p, want) in [(xi, xj), (yi, yj), (xi, yj), (yi, xj)].iter().enumerate() {
                        let (expected, conj) = match blorder.iter().position(|bl| bl == want) {
                            Some(idx) => (idx, false),
                            None => (
                                blorder.iter().position(|&bl| bl == (want.1, want.0)).unwrap(),
                                true,
                            ),
                        };
                        for t in 0..5 {
                            for f in 0..3 {
                                let raw_value = vis_value(t, f, expected);
                                let raw_value = if conj { raw_value.conj() } else { raw_value };
                                assert_eq!(vis[[t, f, p, b]], raw_value);
                            }
                        }
                    }
                }
            });
        }
    }

    #[test]
    fn test_separation_from_baseline_distribution() {
        run_workers(2, |comm| {
            let mut raw = synthetic_raw(comm, 4, 2, &[1, 2]);
            raw.redistribute(Axis::Baseline).unwrap();
            let ts = raw.separate_pol_and_bl(true).unwrap();
            assert_eq!(ts.dist_axis(), Axis::Time);
            assert_eq!(raw.dist_axis(), Axis::Baseline);
            let mask = ts.global_dataset(MAIN_MASK).unwrap();
            assert_eq!(mask.shape(), &[4, 2, 4, 3]);
            assert!(!ts.attrs.contains_key("obstime"));
            assert!(ts.attrs.contains_key("telescope"));
            assert!(ts.contains("sec1970"));
        });
    }

    #[test]
    fn test_separation_rejects_baseline_metadata() {
        let mut raw = synthetic_raw(Comm::solo(), 2, 2, &[1, 2]);
        raw.create_dataset(
            "bl_gain",
            DataArray::from(Array1::<f64>::zeros(10)),
            Role::MainAxes(vec![Some(Axis::Baseline)]),
        )
        .unwrap();
        assert!(matches!(
            raw.separate_pol_and_bl(false),
            Err(TodError::UnexpectedAuxiliaryDataset { names }) if names == vec!["bl_gain".to_string()]
        ));
    }

    #[test]
    fn test_separation_missing_pair() {
        let mut raw = synthetic_raw(Comm::solo(), 2, 2, &[1, 2]);
        raw.select_axis(Axis::Baseline, &[0, 1, 2, 3]).unwrap();
        assert!(matches!(
            raw.separate_pol_and_bl(false),
            Err(TodError::PairNotFound { .. })
        ));
    }
}
