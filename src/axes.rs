//! Logical axes, container kinds, and the role each dataset plays in a container.
//!
//! Every dataset carries a single [`Role`] assigned when it is created. The role says which of
//! its dimensions line up with which logical [`Axis`] of the main data, so selections and
//! redistributions never have to infer alignment from a dataset's name.

use std::fmt::Display;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strum_macros::{EnumIter, EnumString, IntoStaticStr};

use crate::constants::{
    AZ_ALT, BLORDER, CHANNO, FEEDNO, FEEDPOS, FREQ, LOCAL_HOUR, MAIN_DATA, MAIN_MASK, POL,
    RA_DEC, SEC1970,
};

/// A named logical axis of the main data.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Time samples
    #[strum(to_string = "time", serialize = "t")]
    Time,
    /// Frequency channels
    #[strum(to_string = "frequency", serialize = "freq", serialize = "f")]
    Frequency,
    /// Polarization products, separated timestreams only
    #[strum(to_string = "polarization", serialize = "pol", serialize = "p")]
    Polarization,
    /// Baselines
    #[strum(to_string = "baseline", serialize = "bl", serialize = "b")]
    Baseline,
}

impl Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name: &'static str = self.into();
        write!(f, "{name}")
    }
}

/// Which of the two timestream layouts a container holds.
///
/// Resolved once, from the rank of the main data, when a container is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    /// Baseline axis mixes correlator channel pairs of both polarizations.
    Raw,
    /// Separate polarization and feed-pair baseline axes.
    Timestream,
}

impl ContainerKind {
    /// The logical axes of the main data, in dimension order.
    pub fn main_axes(&self) -> &'static [Axis] {
        match self {
            ContainerKind::Raw => &[Axis::Time, Axis::Frequency, Axis::Baseline],
            ContainerKind::Timestream => &[
                Axis::Time,
                Axis::Frequency,
                Axis::Polarization,
                Axis::Baseline,
            ],
        }
    }

    /// Resolve the kind from the rank of the main data.
    pub fn from_main_ndim(ndim: usize) -> Option<Self> {
        match ndim {
            3 => Some(ContainerKind::Raw),
            4 => Some(ContainerKind::Timestream),
            _ => None,
        }
    }

    /// A comma separated description of the main axes, stored as the `dimname` attribute.
    pub fn dimname(&self) -> String {
        self.main_axes()
            .iter()
            .map(|axis| {
                let name = axis.to_string();
                let mut chars = name.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => name,
                }
            })
            .join(", ")
    }
}

impl Display for ContainerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerKind::Raw => write!(f, "raw timestream"),
            ContainerKind::Timestream => write!(f, "timestream"),
        }
    }
}

/// The role of a dataset within a container.
///
/// Datasets ordered only along the polarization or baseline axis (e.g. `pol`, `blorder`) are
/// [`Role::MainAxes`] with a single aligned dimension; use [`Role::dim_of`] to ask whether a
/// dataset follows a given axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Each dimension is either co-indexed with a main-data axis, or free (`None`).
    MainAxes(Vec<Option<Axis>>),
    /// Sampled in time on its own clock, along the given dimension.
    Time(usize),
    /// Indexed by feed along the given dimension.
    Feed(usize),
    /// Replicated on every worker, never selected.
    Common,
    /// Carried as-is through every transform.
    Opaque,
}

impl Role {
    /// The dimension that follows `axis`, if any.
    pub fn dim_of(&self, axis: Axis) -> Option<usize> {
        match self {
            Role::MainAxes(axes) => axes.iter().position(|&a| a == Some(axis)),
            _ => None,
        }
    }

    /// Whether any dimension follows `axis`.
    pub fn aligns_with(&self, axis: Axis) -> bool {
        self.dim_of(axis).is_some()
    }

    /// The dimension indexed by feed, if any.
    pub fn feed_dim(&self) -> Option<usize> {
        match self {
            Role::Feed(dim) => Some(*dim),
            _ => None,
        }
    }

    /// A short description for summaries.
    pub fn describe(&self) -> String {
        match self {
            Role::MainAxes(axes) => format!(
                "main({})",
                axes.iter()
                    .map(|axis| match axis {
                        Some(axis) => axis.to_string(),
                        None => "-".into(),
                    })
                    .join(",")
            ),
            Role::Time(dim) => format!("time[{dim}]"),
            Role::Feed(dim) => format!("feed[{dim}]"),
            Role::Common => "common".into(),
            Role::Opaque => "opaque".into(),
        }
    }
}

/// The role of a well-known dataset in a container of the given kind.
///
/// Returns `None` for names this table doesn't know about.
pub fn known_role(kind: ContainerKind, name: &str) -> Option<Role> {
    use Axis::*;
    let role = match name {
        MAIN_DATA | MAIN_MASK => Role::MainAxes(kind.main_axes().iter().map(|&a| Some(a)).collect()),
        SEC1970 | "jul_date" | LOCAL_HOUR => Role::MainAxes(vec![Some(Time)]),
        RA_DEC | AZ_ALT => Role::MainAxes(vec![Some(Time), None]),
        FREQ => Role::MainAxes(vec![Some(Frequency)]),
        BLORDER => Role::MainAxes(vec![Some(Baseline), None]),
        POL if kind == ContainerKind::Timestream => Role::MainAxes(vec![Some(Polarization)]),
        "weather" => Role::Time(0),
        FEEDNO | CHANNO | FEEDPOS | "polerr" => Role::Feed(0),
        "antpointing" => Role::Feed(1),
        _ => return None,
    };
    Some(role)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_axis_parses_aliases() {
        assert_eq!(Axis::from_str("time").unwrap(), Axis::Time);
        assert_eq!(Axis::from_str("freq").unwrap(), Axis::Frequency);
        assert_eq!(Axis::from_str("bl").unwrap(), Axis::Baseline);
        assert_eq!(Axis::from_str("pol").unwrap(), Axis::Polarization);
        assert!(Axis::from_str("feed").is_err());
        assert_eq!(Axis::Frequency.to_string(), "frequency");
    }

    #[test]
    fn test_kind_from_ndim() {
        assert_eq!(ContainerKind::from_main_ndim(3), Some(ContainerKind::Raw));
        assert_eq!(
            ContainerKind::from_main_ndim(4),
            Some(ContainerKind::Timestream)
        );
        assert_eq!(ContainerKind::from_main_ndim(2), None);
        assert_eq!(
            ContainerKind::Timestream.dimname(),
            "Time, Frequency, Polarization, Baseline"
        );
    }

    #[test]
    fn test_known_roles() {
        let raw = ContainerKind::Raw;
        assert_eq!(
            known_role(raw, MAIN_DATA).unwrap().dim_of(Axis::Baseline),
            Some(2)
        );
        assert_eq!(
            known_role(ContainerKind::Timestream, MAIN_MASK)
                .unwrap()
                .dim_of(Axis::Baseline),
            Some(3)
        );
        assert_eq!(known_role(raw, BLORDER).unwrap().dim_of(Axis::Baseline), Some(0));
        assert_eq!(known_role(raw, "antpointing").unwrap().feed_dim(), Some(1));
        assert_eq!(known_role(raw, POL), None);
        assert_eq!(known_role(raw, "something_else"), None);
    }
}
