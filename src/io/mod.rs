//! Reading and writing containers as sets of FITS files.
//!
//! A container is stored as one or more files, each a contiguous segment of the time axis. A
//! [`TodReader`] opens the files, records selections against them without loading any data, and
//! then loads only what was selected. [`Container::to_files`] is the inverse.

pub mod error;
pub mod fits;

use std::path::{Path, PathBuf};

use itertools::Itertools;
use lazy_static::lazy_static;
use log::{debug, trace, warn};
use regex::Regex;

use self::{
    error::IOError,
    fits::{DatasetEntry, FileHeader, FitsReader, FitsWriter, Manifest},
};
use crate::{
    axes::{Axis, ContainerKind, Role},
    comm::{partition, split_m, Comm},
    constants::{BLORDER, CHANNO, FEEDNO, FREQ, MAIN_DATA, MAIN_MASK, POL, SEC1970},
    container::{Container, RawTimestream, Timestream, Tod},
    dataset::{allocate, Attrs, DataArray, Dataset, Layout},
    selection::{
        pairs_from_array, resolve_feed_selection, Corr, FeedSel, FreqSel, IndexSel,
        PendingSelection, PolSel,
    },
    TodError,
};

lazy_static! {
    static ref RE_PERCENTS: Regex = Regex::new("%+").unwrap();
}

/// A set of files holding contiguous time segments of one container.
///
/// Selections narrow what [`TodReader::load_all`] will load. Each one is resolved against what
/// is already selected, so `time_select` twice behaves like selecting twice in memory.
#[derive(Debug, Clone)]
pub struct TodReader {
    paths: Vec<PathBuf>,
    manifests: Vec<Manifest>,
    file_ntimes: Vec<usize>,
    kind: ContainerKind,
    selection: PendingSelection,
}

impl TodReader {
    /// Read the manifest of every file and resolve the container kind.
    ///
    /// # Errors
    ///
    /// - [`IOError::NoInputFiles`] for an empty list
    /// - [`IOError::MissingHdu`] if a file has no main data
    /// - [`TodError::UnrecognisedContainerShape`] if the main data is neither 3 nor 4 dimensional
    /// - [`IOError::InconsistentFiles`] if the files disagree on anything but the time length
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self, TodError> {
        if paths.is_empty() {
            return Err(IOError::NoInputFiles.into());
        }
        let mut manifests = Vec::with_capacity(paths.len());
        let mut main_entries = Vec::with_capacity(paths.len());
        for path in paths {
            let mut reader = FitsReader::open(path.as_ref())?;
            let manifest = reader.read_manifest()?;
            let main = manifest
                .entry(MAIN_DATA)
                .cloned()
                .ok_or_else(|| IOError::MissingHdu {
                    fits_filename: reader.filename().to_string(),
                    hdu_name: MAIN_DATA.into(),
                })?;
            main_entries.push((reader.filename().to_string(), main));
            manifests.push(manifest);
        }

        let first = &main_entries[0].1;
        let ndim = first.shape.len();
        let kind =
            ContainerKind::from_main_ndim(ndim).ok_or(TodError::UnrecognisedContainerShape { ndim })?;
        let time_dim = time_dim(kind);
        let without_time = |shape: &[usize]| -> Vec<usize> {
            shape
                .iter()
                .enumerate()
                .filter(|&(dim, _)| dim != time_dim)
                .map(|(_, &len)| len)
                .collect()
        };
        let expected = without_time(&first.shape);
        let mut file_ntimes = Vec::with_capacity(paths.len());
        for (filename, main) in &main_entries {
            if main.shape.len() != ndim || without_time(&main.shape) != expected {
                return Err(IOError::InconsistentFiles {
                    fits_filename: filename.clone(),
                    expected: format!("{MAIN_DATA} shape {:?} beyond time", expected),
                    found: format!("{:?}", main.shape),
                }
                .into());
            }
            file_ntimes.push(main.shape[time_dim]);
        }
        debug!(
            "opened {} {} files with {:?} time samples",
            paths.len(),
            kind,
            file_ntimes
        );

        Ok(Self {
            paths: paths.iter().map(|path| path.as_ref().to_path_buf()).collect(),
            manifests,
            file_ntimes,
            kind,
            selection: PendingSelection::default(),
        })
    }

    /// The container kind, resolved from the main data's rank.
    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    /// What has been selected so far.
    pub fn selection(&self) -> &PendingSelection {
        &self.selection
    }

    /// The files, in time order.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// The number of time samples in each file.
    pub fn file_ntimes(&self) -> &[usize] {
        &self.file_ntimes
    }

    /// The attributes of the first file.
    pub fn attrs(&self) -> &Attrs {
        &self.manifests[0].header.attrs
    }

    fn main_entry(&self) -> Result<&DatasetEntry, TodError> {
        self.manifests[0]
            .entry(MAIN_DATA)
            .ok_or_else(|| TodError::UnknownDataset {
                name: MAIN_DATA.into(),
            })
    }

    /// The length of `axis` over all files, before selection.
    ///
    /// # Errors
    ///
    /// [`TodError::InvalidAxis`] if the main data has no such axis.
    pub fn file_len(&self, axis: Axis) -> Result<usize, TodError> {
        let dim = self
            .kind
            .main_axes()
            .iter()
            .position(|&a| a == axis)
            .ok_or_else(|| TodError::InvalidAxis {
                axis: axis.to_string(),
                function: "TodReader::file_len".into(),
                available: self.kind.dimname(),
            })?;
        Ok(if axis == Axis::Time {
            self.file_ntimes.iter().sum()
        } else {
            self.main_entry()?.shape[dim]
        })
    }

    /// The length of `axis` that will be loaded.
    ///
    /// # Errors
    ///
    /// [`TodError::InvalidAxis`] if the main data has no such axis.
    pub fn selected_len(&self, axis: Axis) -> Result<usize, TodError> {
        Ok(self.selection.indices(axis, self.file_len(axis)?).len())
    }

    fn read_first(&self, name: &str) -> Result<DataArray, TodError> {
        let entry = self.manifests[0]
            .entry(name)
            .ok_or_else(|| TodError::UnknownDataset { name: name.into() })?;
        let mut reader = FitsReader::open(&self.paths[0])?;
        Ok(reader.read_array(entry)?)
    }

    fn read_pairs(&self, name: &str) -> Result<Vec<(i64, i64)>, TodError> {
        let data = self.read_first(name)?;
        pairs_from_array(data.as_int(name)?, name)
    }

    /// Narrow the time samples to load.
    ///
    /// # Errors
    ///
    /// [`TodError::BadSelection`].
    pub fn time_select(&mut self, sel: &IndexSel) -> Result<(), TodError> {
        let relative = sel.resolve(self.selected_len(Axis::Time)?, "time")?;
        self.selection
            .narrow(Axis::Time, self.file_len(Axis::Time)?, &relative);
        Ok(())
    }

    /// Narrow the frequency channels to load. Selecting by MHz reads `freq` from the first file.
    ///
    /// # Errors
    ///
    /// [`TodError::BadSelection`], or [`TodError::UnknownDataset`] when selecting by MHz
    /// without a `freq` dataset.
    pub fn frequency_select(&mut self, sel: &FreqSel) -> Result<(), TodError> {
        let nfreq = self.file_len(Axis::Frequency)?;
        let relative = match sel {
            FreqSel::Index(sel) => sel.resolve(self.selected_len(Axis::Frequency)?, "frequency")?,
            FreqSel::Mhz { .. } => {
                let freqs = self.read_first(FREQ)?;
                let freqs: Vec<f64> = freqs.as_float(FREQ)?.iter().copied().collect();
                let current: Vec<f64> = self
                    .selection
                    .indices(Axis::Frequency, nfreq)
                    .into_iter()
                    .map(|idx| freqs[idx])
                    .collect();
                sel.resolve(&current)?
            }
        };
        self.selection.narrow(Axis::Frequency, nfreq, &relative);
        Ok(())
    }

    /// Narrow the polarizations to load.
    ///
    /// # Errors
    ///
    /// [`TodError::WrongContainerKind`] for raw files, [`TodError::BadSelection`], or
    /// [`TodError::UnknownDataset`] when selecting by label without a `pol` dataset.
    pub fn polarization_select(&mut self, sel: &PolSel) -> Result<(), TodError> {
        if self.kind != ContainerKind::Timestream {
            return Err(TodError::WrongContainerKind {
                function: "TodReader::polarization_select".into(),
                expected: ContainerKind::Timestream.to_string(),
                found: self.kind.to_string(),
            });
        }
        let npol = self.file_len(Axis::Polarization)?;
        let relative = match sel {
            PolSel::Index(sel) => sel.resolve(self.selected_len(Axis::Polarization)?, "polarization")?,
            PolSel::Labels(_) => {
                let labels = self.read_first(POL)?;
                let labels: Vec<String> = labels.as_str(POL)?.iter().cloned().collect();
                let current: Vec<String> = self
                    .selection
                    .indices(Axis::Polarization, npol)
                    .into_iter()
                    .map(|idx| labels[idx].clone())
                    .collect();
                sel.resolve(&current)?
            }
        };
        self.selection.narrow(Axis::Polarization, npol, &relative);
        Ok(())
    }

    /// Narrow the feeds and baselines to load.
    ///
    /// The feed list and baseline order are read from the first file and viewed through the
    /// current selection, including the orientation of baselines already picked.
    ///
    /// # Errors
    ///
    /// [`TodError::BadSelection`], [`TodError::PairNotFound`], or
    /// [`TodError::UnknownDataset`] without `feedno`, `blorder` (or `channo` for raw files).
    pub fn feed_select(&mut self, sel: &FeedSel, corr: Corr) -> Result<(), TodError> {
        let feedno = self.read_first(FEEDNO)?;
        let feedno: Vec<i64> = feedno.as_int(FEEDNO)?.iter().copied().collect();
        let nfeed = feedno.len();
        let feed_view = self
            .selection
            .feeds
            .clone()
            .unwrap_or_else(|| (0..nfeed).collect());
        let feedno_view: Vec<i64> = feed_view.iter().map(|&idx| feedno[idx]).collect();
        let channo_view = match self.kind {
            ContainerKind::Raw => {
                let channo = self.read_pairs(CHANNO)?;
                Some(feed_view.iter().map(|&idx| channo[idx]).collect_vec())
            }
            ContainerKind::Timestream => None,
        };

        let blorder = self.read_pairs(BLORDER)?;
        let nbl = blorder.len();
        let blorder_view: Vec<(i64, i64)> = match &self.selection.baselines {
            Some(pick) => pick
                .idxs
                .iter()
                .zip_eq(&pick.conjugate)
                .map(|(&idx, &conjugate)| {
                    let (a, b) = blorder[idx];
                    if conjugate {
                        (b, a)
                    } else {
                        (a, b)
                    }
                })
                .collect(),
            None => blorder,
        };

        let picked = resolve_feed_selection(
            &feedno_view,
            channo_view.as_deref(),
            &blorder_view,
            sel,
            corr,
        )?;
        debug!(
            "file feed selection keeps {} feeds and {} of {} baselines",
            picked.feed_idxs.len(),
            picked.baseline_idxs.len(),
            blorder_view.len()
        );
        self.selection.narrow_feeds(nfeed, nbl, &picked);
        Ok(())
    }

    /// Load every dataset, applying the selections, into a container distributed along
    /// `dist_axis`. Collective.
    ///
    /// The main data comes first, then the mask (all valid if the files have none), then the
    /// rest in file order. Baselines the feed selection found reversed are conjugated.
    ///
    /// # Errors
    ///
    /// IO errors, [`TodError::InvalidAxis`] for a bad `dist_axis`, or the errors of
    /// [`Container::create_dataset`].
    pub fn load_all(&self, comm: Comm, dist_axis: Axis) -> Result<Tod, TodError> {
        let mut container = Container::new(self.kind, dist_axis, comm)?;
        let mut readers = self
            .paths
            .iter()
            .map(|path| FitsReader::open(path))
            .collect::<Result<Vec<_>, _>>()?;
        let time_idxs = self
            .selection
            .indices(Axis::Time, self.file_len(Axis::Time)?);

        let first = &self.manifests[0];
        let entries = first
            .entry(MAIN_DATA)
            .into_iter()
            .chain(first.entry(MAIN_MASK))
            .chain(
                first
                    .datasets
                    .iter()
                    .filter(|entry| entry.name != MAIN_DATA && entry.name != MAIN_MASK),
            );
        for entry in entries {
            let data = self.read_selected(&mut readers, entry, &time_idxs)?;
            trace!("loaded {} {:?}", entry.name, data.shape());
            container.create_dataset(&entry.name, data, entry.role.clone())?;
            container.dataset_mut(&entry.name)?.attrs = entry.attrs.clone();
        }
        if !container.contains(MAIN_MASK) {
            let shape = container.main_data()?.global_shape();
            container.create_known_dataset(MAIN_MASK, DataArray::Bool(allocate(&shape, false)?))?;
        }
        container.attrs = first.header.attrs.clone();

        if let Some(pick) = &self.selection.baselines {
            if !pick.pairs.is_empty() {
                container.orient_baselines(&pick.conjugate, &pick.pairs)?;
                container.set_selected_channel_pairs(Some(pick.pairs.clone()));
            }
        }
        Ok(match self.kind {
            ContainerKind::Raw => RawTimestream::new(container)?.into(),
            ContainerKind::Timestream => Timestream::new(container)?.into(),
        })
    }

    /// Read one dataset from the files, with every selection that applies to it.
    fn read_selected(
        &self,
        readers: &mut [FitsReader],
        entry: &DatasetEntry,
        time_idxs: &[usize],
    ) -> Result<DataArray, TodError> {
        let name = entry.name.as_str();
        let mut data = if let Some(dim) = entry.role.dim_of(Axis::Time) {
            let mut parts = Vec::with_capacity(readers.len());
            let mut offset = 0;
            let nreaders = readers.len();
            for (file_idx, reader) in readers.iter_mut().enumerate() {
                let ntime = self.file_ntimes[file_idx];
                let local: Vec<usize> = time_idxs
                    .iter()
                    .filter(|&&idx| idx >= offset && idx < offset + ntime)
                    .map(|&idx| idx - offset)
                    .collect();
                offset += ntime;
                if local.is_empty() && !(parts.is_empty() && file_idx + 1 == nreaders) {
                    continue;
                }
                let file_entry = self.file_entry(file_idx, reader, name)?;
                parts.push(reader.read_array(file_entry)?.select(dim, &local));
            }
            DataArray::concatenate(dim, &parts)?
        } else if let Role::Time(dim) = entry.role {
            let mut parts = Vec::with_capacity(readers.len());
            for (file_idx, reader) in readers.iter_mut().enumerate() {
                let file_entry = self.file_entry(file_idx, reader, name)?;
                parts.push(reader.read_array(file_entry)?);
            }
            DataArray::concatenate(dim, &parts)?
        } else {
            readers[0].read_array(entry)?
        };

        if let Role::MainAxes(axes) = &entry.role {
            for (dim, axis) in axes.iter().enumerate() {
                let axis = match axis {
                    Some(Axis::Time) | None => continue,
                    Some(axis) => *axis,
                };
                let len = data.len_of(dim);
                let idxs = self.selection.indices(axis, len);
                if idxs.len() != len || idxs.iter().enumerate().any(|(pos, &idx)| pos != idx) {
                    data = data.select(dim, &idxs);
                }
            }
        }
        if let (Some(dim), Some(feeds)) = (entry.role.feed_dim(), &self.selection.feeds) {
            data = data.select(dim, feeds);
        }
        Ok(data)
    }

    fn file_entry<'a>(
        &'a self,
        file_idx: usize,
        reader: &FitsReader,
        name: &str,
    ) -> Result<&'a DatasetEntry, TodError> {
        self.manifests[file_idx]
            .entry(name)
            .ok_or_else(|| {
                IOError::MissingHdu {
                    fits_filename: reader.filename().to_string(),
                    hdu_name: name.into(),
                }
                .into()
            })
    }
}

fn time_dim(kind: ContainerKind) -> usize {
    kind.main_axes()
        .iter()
        .position(|&axis| axis == Axis::Time)
        .unwrap_or(0)
}

impl Container {
    /// Write the container to `paths`, splitting the time axis near-evenly over them.
    /// Collective.
    ///
    /// Datasets named in `exclude` are left out, except the main data which is always written.
    /// Worker 0 writes every file. Each file's `sec1970` attribute is set to the first
    /// `sec1970` sample of its segment.
    ///
    /// # Errors
    ///
    /// - [`IOError::NoOutputFiles`] for an empty list
    /// - the writer's error on worker 0, [`IOError::RemoteWriteFailed`] on the others
    pub fn to_files<P: AsRef<Path>>(&self, paths: &[P], exclude: &[String]) -> Result<(), TodError> {
        if paths.is_empty() {
            return Err(IOError::NoOutputFiles.into());
        }
        let comm = self.comm();
        let mut gathered = Vec::new();
        for (name, ds) in self.datasets() {
            if exclude.iter().any(|excluded| excluded == name) {
                if name == MAIN_DATA {
                    warn!("{} is always written, ignoring its exclusion", MAIN_DATA);
                } else {
                    debug!("not writing {}", name);
                    continue;
                }
            }
            let whole = match ds.layout {
                Layout::Common => comm.is_root().then(|| Ok(ds.data.clone())),
                Layout::Distributed { dim, .. } => comm
                    .gather(ds.data.clone(), 0)?
                    .map(|parts| DataArray::concatenate(dim, &parts)),
            };
            if let Some(whole) = whole {
                gathered.push((name, ds, whole));
            }
        }

        let outcome = if comm.is_root() {
            gathered
                .into_iter()
                .map(|(name, ds, whole)| whole.map(|whole| (name, ds, whole)))
                .collect::<Result<Vec<_>, _>>()
                .and_then(|gathered| self.write_segments(paths, &gathered))
        } else {
            Ok(())
        };
        let all_ok = comm.all_ok(outcome.is_ok())?;
        outcome?;
        if !all_ok {
            return Err(IOError::RemoteWriteFailed {
                path: paths
                    .iter()
                    .map(|path| path.as_ref().display().to_string())
                    .join(", "),
            }
            .into());
        }
        Ok(())
    }

    fn write_segments<P: AsRef<Path>>(
        &self,
        paths: &[P],
        gathered: &[(&str, &Dataset, DataArray)],
    ) -> Result<(), TodError> {
        let ntime = self.global_len(Axis::Time)?;
        let mut start = 0;
        for (file_idx, (path, count)) in paths
            .iter()
            .zip(split_m(ntime, paths.len()))
            .enumerate()
        {
            let segment = start..start + count;
            start += count;
            let mut writer = FitsWriter::create(path.as_ref())?;
            let mut attrs = self.attrs.clone();
            let mut datasets = Vec::with_capacity(gathered.len());
            for (name, ds, whole) in gathered {
                let data = if let Some(dim) = ds.role.dim_of(Axis::Time) {
                    whole.slice_dim(dim, segment.clone())
                } else if let Role::Time(dim) = ds.role {
                    whole.slice_dim(dim, partition(whole.len_of(dim), paths.len(), file_idx))
                } else {
                    whole.clone()
                };
                if *name == SEC1970 {
                    if let Some(&first) = data.as_float(SEC1970)?.iter().next() {
                        attrs.insert(SEC1970.into(), first.into());
                    }
                }
                writer.write_array(name, &data)?;
                datasets.push(DatasetEntry {
                    name: name.to_string(),
                    dtype: data.dtype(),
                    shape: data.shape().to_vec(),
                    role: ds.role.clone(),
                    distributed: ds.dist_dim().is_some(),
                    attrs: ds.attrs.clone(),
                });
            }
            writer.write_manifest(&Manifest {
                header: FileHeader {
                    kind: Some(self.kind()),
                    dist_axis: Some(self.dist_axis()),
                    attrs,
                },
                datasets,
            })?;
            debug!(
                "wrote time samples {:?} to {}",
                segment,
                path.as_ref().display()
            );
        }
        Ok(())
    }
}

/// Turns a path into the path for one pipeline iteration.
pub trait IterationTagger {
    /// The path for `iteration`.
    ///
    /// # Errors
    ///
    /// [`IOError::InvalidIterationTemplate`] if `path` can't be tagged.
    fn tag(&self, path: &Path, iteration: usize) -> Result<PathBuf, IOError>;

    /// Tag every path.
    ///
    /// # Errors
    ///
    /// See [`IterationTagger::tag`].
    fn tag_all(&self, paths: &[PathBuf], iteration: usize) -> Result<Vec<PathBuf>, IOError> {
        paths.iter().map(|path| self.tag(path, iteration)).collect()
    }
}

/// Replaces a run of `%` characters with the iteration, zero padded to the run's width, or
/// appends `_iter{n}` before the extension when there is no run.
#[derive(Debug, Clone, Copy, Default)]
pub struct PercentTagger;

impl IterationTagger for PercentTagger {
    fn tag(&self, path: &Path, iteration: usize) -> Result<PathBuf, IOError> {
        let template = path.to_string_lossy();
        match RE_PERCENTS.find_iter(&template).collect_vec().as_slice() {
            [] => {
                let mut name = format!(
                    "{}_iter{}",
                    path.file_stem()
                        .map(|stem| stem.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    iteration
                );
                if let Some(extension) = path.extension() {
                    name.push('.');
                    name.push_str(&extension.to_string_lossy());
                }
                Ok(path.with_file_name(name))
            }
            [run] => {
                let tag = format!("{:0width$}", iteration, width = run.as_str().len());
                Ok(PathBuf::from(
                    RE_PERCENTS.replace(&template, tag.as_str()).into_owned(),
                ))
            }
            _ => Err(IOError::InvalidIterationTemplate {
                source_file: file!(),
                source_line: line!(),
                template: template.into_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Axis as NdAxis;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        comm::run_workers,
        constants::FEEDPOS,
        dataset::AttrValue,
        test_common::{synthetic_raw, synthetic_timestream},
    };

    fn file_paths(dir: &Path, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|idx| dir.join(format!("segment_{idx}.fits")))
            .collect()
    }

    #[test]
    fn test_round_trip_over_files_and_workers() {
        let dir = tempdir().unwrap();
        for size in 1..=3 {
            for nfiles in 1..=3 {
                let paths = file_paths(dir.path(), nfiles);
                run_workers(size, |comm| {
                    let mut raw = synthetic_raw(comm.clone(), 7, 3, &[1, 2]);
                    {
                        let (_, mask) = raw.main_arrays_mut().unwrap();
                        mask.index_axis_mut(NdAxis(1), 1).fill(true);
                    }
                    raw.to_files(&paths, &[]).unwrap();
                    let expected_vis = raw.global_dataset(MAIN_DATA).unwrap();
                    let expected_mask = raw.global_dataset(MAIN_MASK).unwrap();

                    let reader = TodReader::open(&paths).unwrap();
                    assert_eq!(reader.kind(), ContainerKind::Raw);
                    assert_eq!(reader.file_len(Axis::Time).unwrap(), 7);
                    let tod = reader.load_all(comm, Axis::Frequency).unwrap();
                    let loaded = tod.container();
                    assert_eq!(loaded.dist_axis(), Axis::Frequency);
                    assert_eq!(loaded.global_dataset(MAIN_DATA).unwrap(), expected_vis);
                    assert_eq!(loaded.global_dataset(MAIN_MASK).unwrap(), expected_mask);
                    assert_eq!(
                        loaded.global_dataset(SEC1970).unwrap(),
                        raw.global_dataset(SEC1970).unwrap()
                    );
                    assert_eq!(
                        loaded.global_dataset(BLORDER).unwrap(),
                        raw.global_dataset(BLORDER).unwrap()
                    );
                    assert_eq!(loaded.attrs.get("telescope"), raw.attrs.get("telescope"));
                });
            }
        }
    }

    #[test]
    fn test_file_selection_matches_subset_selection() {
        let dir = tempdir().unwrap();
        let paths = file_paths(dir.path(), 2);
        let mut raw = synthetic_raw(Comm::solo(), 6, 5, &[1, 2, 3]);
        raw.to_files(&paths, &[]).unwrap();

        let time_sel = IndexSel::range(1, 5);
        let freq_sel = FreqSel::Index(IndexSel::List(vec![0, 2, 4]));
        let feed_sel = FeedSel::Numbers(vec![1, 2]);

        let mut reader = TodReader::open(&paths).unwrap();
        reader.time_select(&time_sel).unwrap();
        reader.frequency_select(&freq_sel).unwrap();
        reader.feed_select(&feed_sel, Corr::Cross).unwrap();
        assert_eq!(reader.selected_len(Axis::Time).unwrap(), 4);
        assert_eq!(reader.selected_len(Axis::Frequency).unwrap(), 3);
        let loaded = reader.load_all(Comm::solo(), Axis::Time).unwrap();

        raw.subset_time_select(&time_sel).unwrap();
        raw.subset_frequency_select(&freq_sel).unwrap();
        raw.subset_feed_select(&feed_sel, Corr::Cross).unwrap();

        let loaded = loaded.container();
        for name in [MAIN_DATA, MAIN_MASK, BLORDER, FEEDNO, CHANNO, FEEDPOS, FREQ, SEC1970] {
            assert_eq!(
                loaded.global_dataset(name).unwrap(),
                raw.global_dataset(name).unwrap(),
                "{name}"
            );
        }
        assert_eq!(loaded.selected_channel_pairs(), raw.selected_channel_pairs());
        assert_eq!(
            loaded.selected_channel_pairs().unwrap(),
            &[(0, 2), (0, 3), (1, 2), (1, 3)]
        );
    }

    #[test]
    fn test_selections_compose_on_files() {
        let dir = tempdir().unwrap();
        let paths = file_paths(dir.path(), 3);
        let ts = synthetic_timestream(Comm::solo(), 9, 8, &[1, 2, 3]);
        ts.to_files(&paths, &[]).unwrap();

        let mut reader = TodReader::open(&paths).unwrap();
        reader.time_select(&IndexSel::range(2, 8)).unwrap();
        reader.time_select(&IndexSel::List(vec![0, 5])).unwrap();
        reader
            .frequency_select(&FreqSel::Mhz {
                start: 700.4,
                stop: 701.1,
            })
            .unwrap();
        reader
            .polarization_select(&PolSel::Labels(vec!["yy".into(), "xx".into()]))
            .unwrap();
        reader
            .feed_select(&FeedSel::Numbers(vec![2, 3]), Corr::All)
            .unwrap();
        reader
            .feed_select(&FeedSel::Numbers(vec![3]), Corr::Auto)
            .unwrap();
        assert_eq!(reader.selection().time, Some(vec![2, 7]));
        assert_eq!(reader.selection().freq, Some(vec![2, 3, 4]));
        assert_eq!(reader.selection().pol, Some(vec![0, 1]));

        let loaded = reader.load_all(Comm::solo(), Axis::Time).unwrap();
        let vis = loaded.container().global_dataset(MAIN_DATA).unwrap();
        assert_eq!(vis.shape(), &[2, 3, 2, 1]);
        let vis = vis.as_complex(MAIN_DATA).unwrap();
        // the (3, 3) baseline is the last of six
        assert_eq!(
            vis[[1, 0, 1, 0]],
            crate::test_common::vis_value(7, 2, 4 * 5 + 1)
        );
        assert_eq!(
            loaded
                .container()
                .global_dataset(FEEDNO)
                .unwrap()
                .as_int(FEEDNO)
                .unwrap()
                .iter()
                .copied()
                .collect_vec(),
            vec![3]
        );
    }

    #[test]
    fn test_exclude_and_segment_attrs() {
        let dir = tempdir().unwrap();
        let paths = file_paths(dir.path(), 2);
        let raw = synthetic_raw(Comm::solo(), 6, 2, &[1]);
        raw.to_files(&paths, &[FEEDPOS.to_string(), MAIN_DATA.to_string()])
            .unwrap();

        let mut second = FitsReader::open(&paths[1]).unwrap();
        let manifest = second.read_manifest().unwrap();
        assert!(manifest.entry(FEEDPOS).is_none());
        assert!(manifest.entry(MAIN_DATA).is_some());
        assert_eq!(manifest.entry(MAIN_DATA).unwrap().shape, vec![3, 2, 3]);
        assert_eq!(manifest.header.kind, Some(ContainerKind::Raw));
        assert_eq!(
            manifest.header.attrs.get(SEC1970),
            Some(&AttrValue::Float(1.0e9 + 3.0))
        );
    }

    #[test]
    fn test_missing_mask_loads_as_valid() {
        let dir = tempdir().unwrap();
        let paths = file_paths(dir.path(), 1);
        let raw = synthetic_raw(Comm::solo(), 2, 2, &[1]);
        raw.to_files(&paths, &[MAIN_MASK.to_string()]).unwrap();
        let loaded = TodReader::open(&paths)
            .unwrap()
            .load_all(Comm::solo(), Axis::Time)
            .unwrap();
        let mask = loaded.container().global_dataset(MAIN_MASK).unwrap();
        assert!(mask.as_bool(MAIN_MASK).unwrap().iter().all(|&m| !m));
    }

    #[test]
    fn test_open_errors() {
        let no_paths: [PathBuf; 0] = [];
        assert!(matches!(
            TodReader::open(&no_paths),
            Err(TodError::IOError(IOError::NoInputFiles))
        ));

        let dir = tempdir().unwrap();
        let first = dir.path().join("first.fits");
        let second = dir.path().join("second.fits");
        synthetic_raw(Comm::solo(), 2, 3, &[1])
            .to_files(&[&first], &[])
            .unwrap();
        synthetic_raw(Comm::solo(), 2, 4, &[1])
            .to_files(&[&second], &[])
            .unwrap();
        assert!(matches!(
            TodReader::open(&[&first, &second]),
            Err(TodError::IOError(IOError::InconsistentFiles { .. }))
        ));

        let mut reader = TodReader::open(&[&first]).unwrap();
        assert!(matches!(
            reader.polarization_select(&PolSel::Labels(vec!["xx".into()])),
            Err(TodError::WrongContainerKind { .. })
        ));
        let no_outputs: [PathBuf; 0] = [];
        assert!(matches!(
            synthetic_raw(Comm::solo(), 2, 3, &[1]).to_files(&no_outputs, &[]),
            Err(TodError::IOError(IOError::NoOutputFiles))
        ));
    }

    #[test]
    fn test_percent_tagger() {
        let tagger = PercentTagger;
        assert_eq!(
            tagger.tag(Path::new("/tmp/out_%%%.fits"), 7).unwrap(),
            PathBuf::from("/tmp/out_007.fits")
        );
        assert_eq!(
            tagger.tag(Path::new("/tmp/out.fits"), 3).unwrap(),
            PathBuf::from("/tmp/out_iter3.fits")
        );
        assert_eq!(
            tagger.tag(Path::new("out"), 12).unwrap(),
            PathBuf::from("out_iter12")
        );
        assert!(matches!(
            tagger.tag(Path::new("a%_b%%.fits"), 1),
            Err(IOError::InvalidIterationTemplate { .. })
        ));
        assert_eq!(
            tagger
                .tag_all(&[PathBuf::from("x_%.fits"), PathBuf::from("y_%.fits")], 4)
                .unwrap(),
            vec![PathBuf::from("x_4.fits"), PathBuf::from("y_4.fits")]
        );
    }
}
