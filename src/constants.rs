// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Useful constants.
//!
//! Dataset and attribute names follow the on-disk layout written by the
//! observatory's acquisition system.

/// Name of the main visibility dataset.
pub const MAIN_DATA: &str = "vis";
/// Name of the mask dataset that travels with [`MAIN_DATA`].
pub const MAIN_MASK: &str = "vis_mask";

/// Baseline order. Channel pairs in a raw timestream, feed pairs once separated.
pub const BLORDER: &str = "blorder";
/// Feed numbers.
pub const FEEDNO: &str = "feedno";
/// Correlator channel pair of each feed, shape `(nfeed, 2)`.
pub const CHANNO: &str = "channo";
/// Feed positions in metres, shape `(nfeed, 3)`.
pub const FEEDPOS: &str = "feedpos";
/// Frequencies in MHz.
pub const FREQ: &str = "freq";
/// Polarization labels of a separated timestream.
pub const POL: &str = "pol";
/// Unix time of each time sample.
pub const SEC1970: &str = "sec1970";
/// Local hour of day of each time sample.
pub const LOCAL_HOUR: &str = "local_hour";
/// Right ascension and declination of the pointing, per time sample.
pub const RA_DEC: &str = "ra_dec";
/// Azimuth and altitude of the pointing, per time sample.
pub const AZ_ALT: &str = "az_alt";

/// Attributes that describe a single time segment and are dropped by structural transforms.
pub const TIME_ORDERED_ATTRS: [&str; 2] = ["obstime", "sec1970"];

/// The polarization labels of a separated timestream, in axis order.
pub const LINEAR_POLS: [&str; 4] = ["xx", "yy", "xy", "yx"];

/// Default number of standard deviations beyond which a sample is flagged.
pub const DEFAULT_SIGMA: f64 = 3.0;
/// Default minimum number of valid frequency points needed to flag a column.
pub const DEFAULT_FREQ_POINTS: usize = 10;

/// Default system temperature in Kelvin.
pub const DEFAULT_TSYS: f64 = 50.0;
/// Default local-time window (hours) treated as daytime.
pub const DEFAULT_DAYTIME_RANGE: (f64, f64) = (6.0, 22.0);

/// Consistency constant relating the median absolute deviation to a gaussian sigma.
pub const MAD_SCALE: f64 = 0.6745;
/// Effective aperture fraction of a cylinder's width.
pub const CYLINDER_APERTURE_FRACTION: f64 = 0.79;
