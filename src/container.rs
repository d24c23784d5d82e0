//! The distributed time-ordered-data container.
//!
//! A [`Container`] holds the main visibility dataset, its mask, and every auxiliary dataset,
//! each tagged with a [`Role`]. Exactly one logical axis of the main data is the distribution
//! axis; every dataset aligned with that axis is sharded identically across workers and all
//! other datasets are common.
//!
//! [`Tod`] is the closed set of container kinds a pipeline stage can receive.

use std::{
    fmt::Display,
    ops::{Deref, DerefMut, Range},
};

use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, info, trace};
use ndarray::Axis as NdAxis;

use crate::{
    axes::{known_role, Axis, ContainerKind, Role},
    comm::{partition, Comm},
    constants::{BLORDER, FEEDNO, MAIN_DATA, MAIN_MASK, TIME_ORDERED_ATTRS},
    dataset::{AttrValue, Attrs, DataArray, Dataset, DistArray, Layout, Payload},
    TodError,
};

/// The distributed container.
#[derive(Debug, Clone)]
pub struct Container {
    kind: ContainerKind,
    datasets: IndexMap<String, Dataset>,
    /// Container attributes
    pub attrs: Attrs,
    dist_axis: Axis,
    comm: Comm,
    channel_pairs: Option<Vec<(i64, i64)>>,
}

impl Container {
    /// An empty container of the given kind, to be distributed along `dist_axis`.
    ///
    /// # Errors
    ///
    /// [`TodError::InvalidAxis`] if `dist_axis` is not an axis of this kind's main data.
    pub fn new(kind: ContainerKind, dist_axis: Axis, comm: Comm) -> Result<Self, TodError> {
        check_axis(kind, dist_axis, "Container::new")?;
        Ok(Self {
            kind,
            datasets: IndexMap::new(),
            attrs: Attrs::new(),
            dist_axis,
            comm,
            channel_pairs: None,
        })
    }

    /// Which kind of timestream this is.
    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    /// This worker's endpoint.
    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    /// The logical axis the main data is currently distributed along.
    pub fn dist_axis(&self) -> Axis {
        self.dist_axis
    }

    /// The logical axes of the main data.
    pub fn main_axes(&self) -> &'static [Axis] {
        self.kind.main_axes()
    }

    /// The dimension of the main data that corresponds to `axis`.
    ///
    /// # Errors
    ///
    /// [`TodError::InvalidAxis`] if the main data doesn't have `axis`.
    pub fn main_dim(&self, axis: Axis) -> Result<usize, TodError> {
        check_axis(self.kind, axis, "Container::main_dim")
    }

    /// The dataset names, in creation order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// Every dataset, in creation order.
    pub fn datasets(&self) -> impl Iterator<Item = (&str, &Dataset)> {
        self.datasets.iter().map(|(name, ds)| (name.as_str(), ds))
    }

    /// Whether a dataset named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.datasets.contains_key(name)
    }

    /// Borrow a dataset.
    ///
    /// # Errors
    ///
    /// [`TodError::UnknownDataset`] if there is none named `name`.
    pub fn dataset(&self, name: &str) -> Result<&Dataset, TodError> {
        self.datasets
            .get(name)
            .ok_or_else(|| TodError::UnknownDataset { name: name.into() })
    }

    /// Mutably borrow a dataset. Changing its shape or layout breaks the container's invariants.
    ///
    /// # Errors
    ///
    /// [`TodError::UnknownDataset`] if there is none named `name`.
    pub fn dataset_mut(&mut self, name: &str) -> Result<&mut Dataset, TodError> {
        self.datasets
            .get_mut(name)
            .ok_or_else(|| TodError::UnknownDataset { name: name.into() })
    }

    /// Borrow the main visibility dataset.
    ///
    /// # Errors
    ///
    /// [`TodError::UnknownDataset`] if the main data hasn't been created.
    pub fn main_data(&self) -> Result<&Dataset, TodError> {
        self.dataset(MAIN_DATA)
    }

    /// Borrow the main mask dataset.
    ///
    /// # Errors
    ///
    /// [`TodError::UnknownDataset`] if the mask hasn't been created.
    pub fn main_mask(&self) -> Result<&Dataset, TodError> {
        self.dataset(MAIN_MASK)
    }

    /// Mutably borrow the local shards of the main data and its mask together.
    ///
    /// # Errors
    ///
    /// [`TodError::UnknownDataset`] or [`TodError::DataTypeMismatch`] if either is missing or
    /// has the wrong element type.
    pub fn main_arrays_mut(
        &mut self,
    ) -> Result<
        (
            &mut ndarray::ArrayD<num_complex::Complex<f32>>,
            &mut ndarray::ArrayD<bool>,
        ),
        TodError,
    > {
        let (mut vis, mut mask) = (None, None);
        for (name, ds) in self.datasets.iter_mut() {
            match name.as_str() {
                MAIN_DATA => vis = Some(ds),
                MAIN_MASK => mask = Some(ds),
                _ => {}
            }
        }
        match (vis, mask) {
            (Some(vis), Some(mask)) => Ok((
                vis.data.as_complex_mut(MAIN_DATA)?,
                mask.data.as_bool_mut(MAIN_MASK)?,
            )),
            _ => Err(TodError::UnknownDataset {
                name: format!("{MAIN_DATA} and {MAIN_MASK}"),
            }),
        }
    }

    /// The global length of the main data along `axis`.
    ///
    /// # Errors
    ///
    /// [`TodError::InvalidAxis`] or [`TodError::UnknownDataset`].
    pub fn global_len(&self, axis: Axis) -> Result<usize, TodError> {
        let dim = self.main_dim(axis)?;
        Ok(self.main_data()?.global_shape()[dim])
    }

    /// The global indices along `axis` that this worker holds.
    ///
    /// # Errors
    ///
    /// [`TodError::InvalidAxis`] or [`TodError::UnknownDataset`].
    pub fn local_range(&self, axis: Axis) -> Result<Range<usize>, TodError> {
        let len = self.global_len(axis)?;
        Ok(if axis == self.dist_axis {
            partition(len, self.comm.size(), self.comm.rank())
        } else {
            0..len
        })
    }

    /// The channel pairs recorded by the most recent feed selection, in baseline order.
    pub fn selected_channel_pairs(&self) -> Option<&[(i64, i64)]> {
        self.channel_pairs.as_deref()
    }

    pub(crate) fn set_selected_channel_pairs(&mut self, pairs: Option<Vec<(i64, i64)>>) {
        self.channel_pairs = pairs;
    }

    /// Register a dataset using the role table for well-known names, or [`Role::Opaque`].
    ///
    /// # Errors
    ///
    /// See [`Container::create_dataset`].
    pub fn create_known_dataset(
        &mut self,
        name: &str,
        data: impl Into<Payload>,
    ) -> Result<(), TodError> {
        let role = known_role(self.kind, name).unwrap_or(Role::Opaque);
        self.create_dataset(name, data, role)
    }

    /// Register a new dataset. Collective when data needs to move between workers.
    ///
    /// Whether the dataset is common or distributed follows from its role: datasets aligned with
    /// the distribution axis are sharded along it, everything else except opaque datasets is
    /// common. The payload is moved into place whichever way it arrives.
    ///
    /// # Errors
    ///
    /// - [`TodError::DuplicateDataset`] if the name is taken
    /// - [`TodError::BadArrayShape`] if the role doesn't match the data's rank
    /// - [`TodError::InvalidAxis`] if the role names an axis the main data doesn't have
    /// - [`TodError::UnknownDataset`] if an aligned dataset is created before the main data
    /// - [`TodError::ShapeMismatch`] if an aligned dimension disagrees with the main data
    ///   or a feed-ordered dimension disagrees with the feeds already registered
    pub fn create_dataset(
        &mut self,
        name: &str,
        data: impl Into<Payload>,
        role: Role,
    ) -> Result<(), TodError> {
        if self.contains(name) {
            return Err(TodError::DuplicateDataset { name: name.into() });
        }
        let payload = data.into();
        let (ndim, global_shape) = match &payload {
            Payload::Common(data) => (data.ndim(), data.shape().to_vec()),
            Payload::Distributed(dist) => (dist.local.ndim(), dist.global_shape()),
        };

        let target_dim = match &role {
            Role::MainAxes(axes) => {
                if axes.len() != ndim {
                    return Err(TodError::BadArrayShape {
                        argument: name.into(),
                        function: "Container::create_dataset".into(),
                        expected: format!("{} dimensions for role {}", axes.len(), role.describe()),
                        received: format!("{global_shape:?}"),
                    });
                }
                for (dim, axis) in axes.iter().enumerate() {
                    let Some(axis) = axis else { continue };
                    let main_dim = self.main_dim(*axis)?;
                    let expected = if name == MAIN_DATA {
                        global_shape[dim]
                    } else {
                        self.main_data()?.global_shape()[main_dim]
                    };
                    if global_shape[dim] != expected {
                        return Err(TodError::ShapeMismatch {
                            name: name.into(),
                            axis: axis.to_string(),
                            expected,
                            received: global_shape[dim],
                        });
                    }
                }
                role.dim_of(self.dist_axis)
            }
            Role::Opaque => {
                // kept exactly as given
                let layout = match &payload {
                    Payload::Common(_) => Layout::Common,
                    Payload::Distributed(dist) => Layout::Distributed {
                        dim: dist.dim,
                        global_len: dist.global_len,
                    },
                };
                let data = match payload {
                    Payload::Common(data) => data,
                    Payload::Distributed(dist) => dist.local,
                };
                return self.insert(name, data, layout, role);
            }
            Role::Time(dim) | Role::Feed(dim) => {
                if *dim >= ndim {
                    return Err(TodError::BadArrayShape {
                        argument: name.into(),
                        function: "Container::create_dataset".into(),
                        expected: format!("more than {dim} dimensions for role {}", role.describe()),
                        received: format!("{global_shape:?}"),
                    });
                }
                if let Role::Feed(dim) = &role {
                    self.check_feed_count(name, global_shape[*dim])?;
                }
                None
            }
            Role::Common => None,
        };

        let (data, layout) = match (payload, target_dim) {
            (Payload::Common(data), None) => (data, Layout::Common),
            (Payload::Common(data), Some(dim)) => {
                let dist = DistArray::from_global(&data, dim, &self.comm);
                (dist.local, Layout::Distributed {
                    dim,
                    global_len: dist.global_len,
                })
            }
            (Payload::Distributed(dist), None) => (dist.gather_all(&self.comm)?, Layout::Common),
            (Payload::Distributed(dist), Some(dim)) => {
                let dist = dist.redistribute(dim, &self.comm)?;
                (dist.local, Layout::Distributed {
                    dim,
                    global_len: dist.global_len,
                })
            }
        };
        self.insert(name, data, layout, role)
    }

    /// Every feed-ordered dataset must cover the same feeds.
    fn check_feed_count(&self, name: &str, nfeed: usize) -> Result<(), TodError> {
        let existing = self
            .datasets
            .iter()
            .filter_map(|(other, ds)| Some((other, ds.data.shape()[ds.role.feed_dim()?])))
            .sorted_by_key(|(other, _)| other.as_str() != FEEDNO)
            .next();
        match existing {
            Some((_, expected)) if expected != nfeed => Err(TodError::ShapeMismatch {
                name: name.into(),
                axis: "feed".into(),
                expected,
                received: nfeed,
            }),
            _ => Ok(()),
        }
    }

    fn insert(
        &mut self,
        name: &str,
        data: DataArray,
        layout: Layout,
        role: Role,
    ) -> Result<(), TodError> {
        trace!(
            "create dataset {} {:?} {} {:?}",
            name,
            data.shape(),
            role.describe(),
            layout
        );
        self.datasets.insert(
            name.into(),
            Dataset {
                data,
                layout,
                role,
                attrs: Attrs::new(),
            },
        );
        Ok(())
    }

    /// Remove a dataset, returning it.
    pub fn remove_dataset(&mut self, name: &str) -> Option<Dataset> {
        self.datasets.shift_remove(name)
    }

    /// Repartition every distributed dataset so the main data is distributed along `axis`.
    /// Collective.
    ///
    /// A dataset aligned with both the old and new axis is exchanged all-to-all; one aligned
    /// only with the old axis becomes common, and one aligned only with the new axis is sharded
    /// locally. No-op if already distributed along `axis`.
    ///
    /// # Errors
    ///
    /// [`TodError::InvalidAxis`] if `axis` is not an axis of the main data, or communication
    /// errors.
    pub fn redistribute(&mut self, axis: Axis) -> Result<(), TodError> {
        check_axis(self.kind, axis, "Container::redistribute")?;
        if axis == self.dist_axis {
            trace!("already distributed along {}", axis);
            return Ok(());
        }
        debug!("redistribute from {} to {}", self.dist_axis, axis);
        let old_axis = self.dist_axis;
        for (name, ds) in self.datasets.iter_mut() {
            let Role::MainAxes(_) = ds.role else { continue };
            let (old_dim, new_dim) = (ds.role.dim_of(old_axis), ds.role.dim_of(axis));
            match (ds.layout, new_dim) {
                (Layout::Distributed { dim, global_len }, Some(new_dim)) => {
                    let moved = DistArray {
                        local: ds.data.take(),
                        dim,
                        global_len,
                    }
                    .redistribute(new_dim, &self.comm)?;
                    ds.layout = Layout::Distributed {
                        dim: new_dim,
                        global_len: moved.global_len,
                    };
                    ds.data = moved.local;
                }
                (Layout::Distributed { .. }, None) => {
                    ds.data = ds.gather_all(&self.comm)?;
                    ds.layout = Layout::Common;
                }
                (Layout::Common, Some(new_dim)) => {
                    let dist = DistArray::from_global(&ds.data, new_dim, &self.comm);
                    ds.layout = Layout::Distributed {
                        dim: new_dim,
                        global_len: dist.global_len,
                    };
                    ds.data = dist.local;
                }
                (Layout::Common, None) => {}
            }
            trace!(
                "{}: {:?} -> {:?}, local shape {:?}",
                name,
                old_dim,
                new_dim,
                ds.data.shape()
            );
        }
        self.dist_axis = axis;
        Ok(())
    }

    /// Keep only the global indices `idxs` along `axis` in every dataset aligned with it.
    /// Collective when `axis` is the distribution axis.
    ///
    /// # Errors
    ///
    /// [`TodError::InvalidAxis`], [`TodError::BadSelection`] for out of range indices, or
    /// communication errors.
    pub fn select_axis(&mut self, axis: Axis, idxs: &[usize]) -> Result<(), TodError> {
        let len = self.global_len(axis)?;
        if let Some(bad) = idxs.iter().find(|&&idx| idx >= len) {
            return Err(TodError::BadSelection {
                option: axis.to_string(),
                reason: format!("index {bad} is out of range for length {len}"),
            });
        }
        if axis == self.dist_axis {
            // move the data off the axis we are about to cut
            let original = self.dist_axis;
            let other = self
                .main_axes()
                .iter()
                .copied()
                .find(|&a| a != axis)
                .unwrap_or(axis);
            self.redistribute(other)?;
            self.select_local(axis, idxs);
            return self.redistribute(original);
        }
        self.select_local(axis, idxs);
        Ok(())
    }

    fn select_local(&mut self, axis: Axis, idxs: &[usize]) {
        for ds in self.datasets.values_mut() {
            if let Some(dim) = ds.role.dim_of(axis) {
                ds.data = ds.data.select(dim, idxs);
            }
        }
        if axis == Axis::Baseline {
            self.channel_pairs = self.channel_pairs.take().and_then(|pairs| {
                idxs.iter()
                    .map(|&idx| pairs.get(idx).copied())
                    .collect::<Option<Vec<_>>>()
            });
        }
    }

    /// Keep only the feeds at positions `idxs` in every feed-ordered dataset.
    pub fn select_feeds(&mut self, idxs: &[usize]) {
        for ds in self.datasets.values_mut() {
            if let Some(dim) = ds.role.feed_dim() {
                ds.data = ds.data.select(dim, idxs);
            }
        }
    }

    /// Conjugate the main data at the global baseline positions where `flags` is set, and
    /// rewrite those `blorder` rows to `pairs`.
    ///
    /// # Errors
    ///
    /// [`TodError::BadArrayShape`] if `flags` or `pairs` doesn't cover the baseline axis.
    pub(crate) fn orient_baselines(
        &mut self,
        flags: &[bool],
        pairs: &[(i64, i64)],
    ) -> Result<(), TodError> {
        let nbl = self.global_len(Axis::Baseline)?;
        if flags.len() != nbl || pairs.len() != nbl {
            return Err(TodError::BadArrayShape {
                argument: "flags".into(),
                function: "Container::orient_baselines".into(),
                expected: format!("{nbl} baselines"),
                received: format!("{} flags, {} pairs", flags.len(), pairs.len()),
            });
        }
        let local = self.local_range(Axis::Baseline)?;
        let bl_dim = self.main_dim(Axis::Baseline)?;
        let vis = self.dataset_mut(MAIN_DATA)?.data.as_complex_mut(MAIN_DATA)?;
        for (local_idx, mut column) in vis.axis_iter_mut(NdAxis(bl_dim)).enumerate() {
            if flags[local.start + local_idx] {
                column.mapv_inplace(|v| v.conj());
            }
        }
        if let Ok(blorder) = self.dataset_mut(BLORDER) {
            let blorder = blorder.data.as_int_mut(BLORDER)?;
            for (local_idx, mut row) in blorder.axis_iter_mut(NdAxis(0)).enumerate() {
                let (a, b) = pairs[local.start + local_idx];
                row[0] = a;
                row[1] = b;
            }
        }
        Ok(())
    }

    /// The whole of a dataset on every worker. Collective for distributed datasets.
    ///
    /// # Errors
    ///
    /// [`TodError::UnknownDataset`] or communication errors.
    pub fn global_dataset(&self, name: &str) -> Result<DataArray, TodError> {
        self.dataset(name)?.gather_all(&self.comm)
    }

    /// A deep copy. Mutating the copy never affects the original.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Copy `attrs` into this container, skipping per-time-segment attributes.
    pub fn copy_attrs_from(&mut self, attrs: &Attrs) {
        for (key, value) in attrs {
            if TIME_ORDERED_ATTRS.contains(&key.as_str()) {
                trace!("not copying time-ordered attribute {}", key);
                continue;
            }
            self.attrs.insert(key.clone(), value.clone());
        }
    }

    /// Append a line to the `history` attribute.
    pub fn add_history(&mut self, line: &str) {
        let history = match self.attrs.get("history") {
            Some(AttrValue::Str(previous)) if !previous.is_empty() => {
                format!("{previous}\n{line}")
            }
            _ => line.to_string(),
        };
        self.attrs.insert("history".into(), AttrValue::Str(history));
    }

    /// Log a summary of the container from worker 0.
    pub fn info(&self) {
        if self.comm.is_root() {
            info!("{}", self);
        }
    }
}

impl Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} distributed along {} over {} worker(s)",
            self.kind,
            self.dist_axis,
            self.comm.size()
        )?;
        writeln!(
            f,
            "{:<16} {:<10} {:<24} {:<28} {}",
            "dataset", "dtype", "role", "global shape", "layout"
        )?;
        for (name, ds) in &self.datasets {
            writeln!(
                f,
                "{:<16} {:<10} {:<24} {:<28} {}",
                name,
                ds.data.dtype().to_string(),
                ds.role.describe(),
                format!("{:?}", ds.global_shape()),
                match ds.layout {
                    Layout::Common => "common".to_string(),
                    Layout::Distributed { dim, .. } => format!("distributed[{dim}]"),
                }
            )?;
        }
        if !self.attrs.is_empty() {
            writeln!(
                f,
                "attrs: {}",
                self.attrs
                    .iter()
                    .filter(|(key, _)| key.as_str() != "history")
                    .map(|(key, value)| format!("{key}={value}"))
                    .join(", ")
            )?;
        }
        Ok(())
    }
}

fn check_axis(kind: ContainerKind, axis: Axis, function: &str) -> Result<usize, TodError> {
    kind.main_axes()
        .iter()
        .position(|&a| a == axis)
        .ok_or_else(|| TodError::InvalidAxis {
            axis: axis.to_string(),
            function: function.into(),
            available: kind.main_axes().iter().join(", "),
        })
}

/// A container whose baseline axis mixes the channel pairs of both polarizations.
#[derive(Debug, Clone)]
pub struct RawTimestream(Container);

/// A container with separate polarization and feed-pair baseline axes.
#[derive(Debug, Clone)]
pub struct Timestream(Container);

macro_rules! impl_timestream_newtype {
    ($name:ident, $kind:expr) => {
        impl $name {
            /// Wrap a container of the matching kind.
            ///
            /// # Errors
            ///
            /// [`TodError::WrongContainerKind`] for the other kind.
            pub fn new(container: Container) -> Result<Self, TodError> {
                if container.kind() != $kind {
                    return Err(TodError::WrongContainerKind {
                        function: concat!(stringify!($name), "::new").into(),
                        expected: $kind.to_string(),
                        found: container.kind().to_string(),
                    });
                }
                Ok(Self(container))
            }

            /// Unwrap the container.
            pub fn into_inner(self) -> Container {
                self.0
            }
        }

        impl Deref for $name {
            type Target = Container;

            fn deref(&self) -> &Container {
                &self.0
            }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Container {
                &mut self.0
            }
        }
    };
}

impl_timestream_newtype!(RawTimestream, ContainerKind::Raw);
impl_timestream_newtype!(Timestream, ContainerKind::Timestream);

/// Either kind of timestream container, as passed between pipeline stages.
#[derive(Debug, Clone)]
pub enum Tod {
    /// Baseline axis mixes polarizations
    Raw(RawTimestream),
    /// Separate polarization axis
    Separated(Timestream),
}

impl Tod {
    /// Wrap a container according to its kind.
    pub fn from_container(container: Container) -> Self {
        match container.kind() {
            ContainerKind::Raw => Tod::Raw(RawTimestream(container)),
            ContainerKind::Timestream => Tod::Separated(Timestream(container)),
        }
    }

    /// The container kind.
    pub fn kind(&self) -> ContainerKind {
        self.container().kind()
    }

    /// Borrow the container.
    pub fn container(&self) -> &Container {
        match self {
            Tod::Raw(raw) => raw,
            Tod::Separated(ts) => ts,
        }
    }

    /// Mutably borrow the container.
    pub fn container_mut(&mut self) -> &mut Container {
        match self {
            Tod::Raw(raw) => raw,
            Tod::Separated(ts) => ts,
        }
    }

    /// Unwrap the container.
    pub fn into_container(self) -> Container {
        match self {
            Tod::Raw(raw) => raw.into_inner(),
            Tod::Separated(ts) => ts.into_inner(),
        }
    }

    /// See [`Container::redistribute`].
    ///
    /// # Errors
    ///
    /// See [`Container::redistribute`].
    pub fn redistribute(&mut self, axis: Axis) -> Result<(), TodError> {
        self.container_mut().redistribute(axis)
    }

    /// The raw timestream, if this is one.
    ///
    /// # Errors
    ///
    /// [`TodError::WrongContainerKind`] for a separated timestream.
    pub fn into_raw(self, function: &str) -> Result<RawTimestream, TodError> {
        match self {
            Tod::Raw(raw) => Ok(raw),
            Tod::Separated(_) => Err(TodError::WrongContainerKind {
                function: function.into(),
                expected: ContainerKind::Raw.to_string(),
                found: ContainerKind::Timestream.to_string(),
            }),
        }
    }

    /// The separated timestream, if this is one.
    ///
    /// # Errors
    ///
    /// [`TodError::WrongContainerKind`] for a raw timestream.
    pub fn into_timestream(self, function: &str) -> Result<Timestream, TodError> {
        match self {
            Tod::Separated(ts) => Ok(ts),
            Tod::Raw(_) => Err(TodError::WrongContainerKind {
                function: function.into(),
                expected: ContainerKind::Timestream.to_string(),
                found: ContainerKind::Raw.to_string(),
            }),
        }
    }
}

impl From<RawTimestream> for Tod {
    fn from(raw: RawTimestream) -> Self {
        Tod::Raw(raw)
    }
}

impl From<Timestream> for Tod {
    fn from(ts: Timestream) -> Self {
        Tod::Separated(ts)
    }
}
