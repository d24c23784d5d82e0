//! Synthetic containers shared by unit tests.

use itertools::Itertools;
use ndarray::{Array1, Array2, Array3, Array4};
use num_complex::Complex;

use crate::{
    axes::{Axis, ContainerKind},
    comm::Comm,
    constants::{
        BLORDER, CHANNO, FEEDNO, FEEDPOS, FREQ, LINEAR_POLS, MAIN_DATA, MAIN_MASK, POL, SEC1970,
    },
    container::{Container, RawTimestream, Timestream},
    dataset::DataArray,
};

/// The visibility stored at `(t, f, b)` in a synthetic container. The imaginary part is never
/// zero so conjugation is always visible.
pub(crate) fn vis_value(t: usize, f: usize, b: usize) -> Complex<f32> {
    Complex::new((t * 10000 + f * 100 + b) as f32, b as f32 + 0.5)
}

/// Every pair of `nchan` channels with replacement, with the pairs whose channel sum is a
/// multiple of three stored reversed.
pub(crate) fn blorder_for_channels(nchan: i64) -> Vec<(i64, i64)> {
    (0..nchan)
        .combinations_with_replacement(2)
        .map(|pair| {
            let (a, b) = (pair[0], pair[1]);
            if a != b && (a + b) % 3 == 0 {
                (b, a)
            } else {
                (a, b)
            }
        })
        .collect()
}

/// The baseline order of three feeds on channels `(0, 1)`, `(2, 3)` and `(4, 5)`, where
/// `(1, 2)` is only stored as `(2, 1)`.
pub(crate) fn scenario_blorder() -> Vec<(i64, i64)> {
    blorder_for_channels(6)
}

pub(crate) fn pairs_to_array(pairs: &[(i64, i64)]) -> Array2<i64> {
    Array2::from_shape_fn((pairs.len(), 2), |(i, j)| if j == 0 { pairs[i].0 } else { pairs[i].1 })
}

fn feed_positions(nfeed: usize) -> Array2<f64> {
    // feeds along a north-south line, 0.4m apart
    Array2::from_shape_fn((nfeed, 3), |(i, j)| if j == 1 { 0.4 * i as f64 } else { 0.0 })
}

fn add_common_metadata(container: &mut Container, nt: usize, nf: usize, feeds: &[i64]) {
    container
        .create_known_dataset(
            SEC1970,
            DataArray::from(Array1::from_shape_fn(nt, |t| 1.0e9 + t as f64)),
        )
        .unwrap();
    container
        .create_known_dataset(
            FREQ,
            DataArray::from(Array1::from_shape_fn(nf, |f| 700.0 + 0.25 * f as f64)),
        )
        .unwrap();
    container
        .create_known_dataset(FEEDNO, DataArray::from(Array1::from(feeds.to_vec())))
        .unwrap();
    container
        .create_known_dataset(FEEDPOS, DataArray::from(feed_positions(feeds.len())))
        .unwrap();
    container.attrs.insert("telescope".into(), "Tianlai-Cylinder".into());
    container.attrs.insert("cywid".into(), 15.0.into());
    container.attrs.insert("obstime".into(), "2016/01/03 22:06:59.00".into());
    container.attrs.insert("sec1970".into(), 1.0e9.into());
}

/// A raw timestream of `nt` times and `nf` channels, distributed along time.
///
/// Feed `k` (by position) owns channels `(2k, 2k + 1)`, and the baseline order holds every
/// channel pair with replacement as laid out by [`blorder_for_channels`].
pub(crate) fn synthetic_raw(comm: Comm, nt: usize, nf: usize, feeds: &[i64]) -> RawTimestream {
    let nchan = 2 * feeds.len() as i64;
    let blorder = blorder_for_channels(nchan);
    let nbl = blorder.len();
    let mut container = Container::new(ContainerKind::Raw, Axis::Time, comm).unwrap();
    container
        .create_known_dataset(
            MAIN_DATA,
            DataArray::from(Array3::from_shape_fn((nt, nf, nbl), |(t, f, b)| {
                vis_value(t, f, b)
            })),
        )
        .unwrap();
    container
        .create_known_dataset(MAIN_MASK, DataArray::from(Array3::<bool>::default((nt, nf, nbl))))
        .unwrap();
    container
        .create_known_dataset(BLORDER, DataArray::from(pairs_to_array(&blorder)))
        .unwrap();
    let channo: Vec<(i64, i64)> = (0..feeds.len() as i64).map(|k| (2 * k, 2 * k + 1)).collect();
    container
        .create_known_dataset(CHANNO, DataArray::from(pairs_to_array(&channo)))
        .unwrap();
    add_common_metadata(&mut container, nt, nf, feeds);
    RawTimestream::new(container).unwrap()
}

/// A separated timestream of `nt` times and `nf` channels over every feed pair with
/// replacement, distributed along time. Polarization `p` of baseline `b` holds
/// `vis_value(t, f, 4 * b + p)`.
pub(crate) fn synthetic_timestream(
    comm: Comm,
    nt: usize,
    nf: usize,
    feeds: &[i64],
) -> Timestream {
    let pairs: Vec<(i64, i64)> = feeds
        .iter()
        .copied()
        .combinations_with_replacement(2)
        .map(|pair| (pair[0], pair[1]))
        .collect();
    let nbl = pairs.len();
    let mut container = Container::new(ContainerKind::Timestream, Axis::Time, comm).unwrap();
    container
        .create_known_dataset(
            MAIN_DATA,
            DataArray::from(Array4::from_shape_fn((nt, nf, 4, nbl), |(t, f, p, b)| {
                vis_value(t, f, 4 * b + p)
            })),
        )
        .unwrap();
    container
        .create_known_dataset(
            MAIN_MASK,
            DataArray::from(Array4::<bool>::default((nt, nf, 4, nbl))),
        )
        .unwrap();
    container
        .create_known_dataset(
            POL,
            DataArray::from(Array1::from_iter(LINEAR_POLS.iter().map(|p| p.to_string()))),
        )
        .unwrap();
    container
        .create_known_dataset(BLORDER, DataArray::from(pairs_to_array(&pairs)))
        .unwrap();
    add_common_metadata(&mut container, nt, nf, feeds);
    Timestream::new(container).unwrap()
}
