//! Pipeline stages over timestreams.
//!
//! Every stage is a [`TodTask`] and runs the same cycle in each iteration. It reads its input
//! files, or takes the container the previous stage handed over. Then it selects, processes,
//! records history, and writes. The container kind is resolved once per cycle from what was
//! read and handed to [`TodTask::process`] in an immutable [`TaskRun`].

use std::{collections::HashMap, fmt::Display, path::PathBuf, time::Duration};

use derive_builder::Builder;
use itertools::Itertools;
use log::{debug, info, warn};

use crate::{
    axes::{Axis, ContainerKind},
    comm::Comm,
    container::Tod,
    flags::{FlagContext, FlagOutcome},
    io::{IterationTagger, PercentTagger, TodReader},
    mapmaking::{BeamSynthesis, MapMakingContext},
    selection::{Corr, FeedSel, FreqSel, IndexSel, PolSel},
    with_increment_duration, TodError,
};

/// The options every stage shares.
#[derive(Builder, Debug, Clone, PartialEq)]
pub struct TaskParams {
    /// Files to read when no container is handed over, contiguous in time
    #[builder(default)]
    pub input_files: Vec<PathBuf>,
    /// Files to write the result to, contiguous in time
    #[builder(default)]
    pub output_files: Vec<PathBuf>,
    /// How many times the pipeline runs
    #[builder(default = "1")]
    pub iterations: usize,
    /// The distribution axis on load
    #[builder(default = "Axis::Time")]
    pub dist_axis: Axis,
    /// Datasets left out when writing
    #[builder(default)]
    pub exclude: Vec<String>,
    /// Time samples to keep
    #[builder(default)]
    pub time_select: Option<IndexSel>,
    /// Frequency channels to keep
    #[builder(default)]
    pub freq_select: Option<FreqSel>,
    /// Polarizations to keep, separated timestreams only
    #[builder(default)]
    pub pol_select: Option<PolSel>,
    /// Feeds to keep
    #[builder(default)]
    pub feed_select: Option<FeedSel>,
    /// Which correlations between the kept feeds to keep
    #[builder(default)]
    pub corr: Corr,
    /// Whether to log a summary of the container after processing
    #[builder(default = "false")]
    pub show_info: bool,
    /// Whether input paths are tagged with the iteration when iterating
    #[builder(default = "true")]
    pub tag_input_iter: bool,
    /// Whether output paths are tagged with the iteration when iterating
    #[builder(default = "true")]
    pub tag_output_iter: bool,
    /// Whether to write the output files
    #[builder(default = "true")]
    pub write_output: bool,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            input_files: vec![],
            output_files: vec![],
            iterations: 1,
            dist_axis: Axis::Time,
            exclude: vec![],
            time_select: None,
            freq_select: None,
            pol_select: None,
            feed_select: None,
            corr: Corr::default(),
            show_info: false,
            tag_input_iter: true,
            tag_output_iter: true,
            write_output: true,
        }
    }
}

impl Display for TaskParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let paths = |paths: &[PathBuf]| paths.iter().map(|path| path.display()).join(", ");
        if !self.input_files.is_empty() {
            writeln!(f, "Will read {}.", paths(&self.input_files))?;
        }
        writeln!(f, "Will distribute along {}.", self.dist_axis)?;
        for (option, value) in [
            ("time", self.time_select.as_ref().map(|sel| format!("{sel:?}"))),
            ("frequency", self.freq_select.as_ref().map(|sel| format!("{sel:?}"))),
            ("polarization", self.pol_select.as_ref().map(|sel| format!("{sel:?}"))),
            ("feed", self.feed_select.as_ref().map(|sel| format!("{sel:?}"))),
        ] {
            if let Some(value) = value {
                writeln!(f, "Will select {option} {value}.")?;
            }
        }
        if self.corr != Corr::All {
            writeln!(f, "Will keep {} correlations only.", self.corr)?;
        }
        if self.write_output && !self.output_files.is_empty() {
            writeln!(f, "Will write {}.", paths(&self.output_files))?;
            if !self.exclude.is_empty() {
                writeln!(f, "Will not write {}.", self.exclude.join(", "))?;
            }
        }
        Ok(())
    }
}

/// What a stage knows about the cycle it is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRun {
    /// The kind of the container being processed
    pub kind: ContainerKind,
    /// Zero-based iteration
    pub iteration: usize,
    /// Whether the pipeline runs more than once
    pub iterable: bool,
}

/// How one cycle of a stage ended.
#[derive(Debug)]
pub enum IterationOutcome {
    /// There was nothing to read and nothing handed over.
    Exhausted,
    /// The stage ran, and handed on this container if it kept one.
    Ran(Option<Tod>),
}

/// A pipeline stage.
pub trait TodTask {
    /// A short name for logs and history.
    fn name(&self) -> &'static str;

    /// The shared options.
    fn params(&self) -> &TaskParams;

    /// The stage's own work. Returning `None` ends the chain for this iteration.
    ///
    /// # Errors
    ///
    /// Whatever the stage raises.
    fn process(&mut self, tod: Tod, run: &TaskRun) -> Result<Option<Tod>, TodError>;

    /// The line appended to the container's history.
    fn history(&self) -> String {
        format!(
            "Execute {} with todpipe {}.",
            self.name(),
            env!("CARGO_PKG_VERSION")
        )
    }

    /// How paths are tagged with the iteration.
    fn tagger(&self) -> &dyn IterationTagger {
        &PercentTagger
    }

    /// The input files of `iteration`.
    ///
    /// # Errors
    ///
    /// [`crate::io::error::IOError::InvalidIterationTemplate`].
    fn input_paths(&self, iteration: usize) -> Result<Vec<PathBuf>, TodError> {
        let params = self.params();
        if params.iterations > 1 && params.tag_input_iter {
            Ok(self.tagger().tag_all(&params.input_files, iteration)?)
        } else {
            Ok(params.input_files.clone())
        }
    }

    /// The output files of `iteration`.
    ///
    /// # Errors
    ///
    /// [`crate::io::error::IOError::InvalidIterationTemplate`].
    fn output_paths(&self, iteration: usize) -> Result<Vec<PathBuf>, TodError> {
        let params = self.params();
        if params.iterations > 1 && params.tag_output_iter {
            Ok(self.tagger().tag_all(&params.output_files, iteration)?)
        } else {
            Ok(params.output_files.clone())
        }
    }

    /// Read the input files of `iteration`, with the selections applied before loading.
    /// Collective. `None` if there are no input files.
    ///
    /// # Errors
    ///
    /// See [`TodReader`].
    fn read_input(&self, comm: &Comm, iteration: usize) -> Result<Option<Tod>, TodError> {
        let paths = self.input_paths(iteration)?;
        if paths.is_empty() {
            return Ok(None);
        }
        let mut reader = TodReader::open(&paths)?;
        self.data_select(&mut reader)?;
        Ok(Some(reader.load_all(comm.clone(), self.params().dist_axis)?))
    }

    /// Apply the selections to files before loading.
    ///
    /// A polarization selection on raw files is ignored with a warning. The correlation type
    /// alone selects among all feeds.
    ///
    /// # Errors
    ///
    /// See the selection methods of [`TodReader`].
    fn data_select(&self, reader: &mut TodReader) -> Result<(), TodError> {
        let params = self.params();
        if let Some(sel) = &params.time_select {
            reader.time_select(sel)?;
        }
        if let Some(sel) = &params.freq_select {
            reader.frequency_select(sel)?;
        }
        if let Some(sel) = &params.pol_select {
            match reader.kind() {
                ContainerKind::Timestream => reader.polarization_select(sel)?,
                kind => warn!("{}: no polarization selection on a {}", self.name(), kind),
            }
        }
        if let Some(sel) = feed_selection(params) {
            reader.feed_select(&sel, params.corr)?;
        }
        Ok(())
    }

    /// Apply the selections to a container handed over by the previous stage. Collective.
    ///
    /// # Errors
    ///
    /// See the `subset_*` methods of [`crate::Container`].
    fn subset_select(&self, tod: &mut Tod) -> Result<(), TodError> {
        let params = self.params();
        if let Some(sel) = &params.time_select {
            tod.container_mut().subset_time_select(sel)?;
        }
        if let Some(sel) = &params.freq_select {
            tod.container_mut().subset_frequency_select(sel)?;
        }
        if let Some(sel) = &params.pol_select {
            match tod {
                Tod::Separated(ts) => ts.subset_polarization_select(sel)?,
                Tod::Raw(_) => warn!(
                    "{}: no polarization selection on a {}",
                    self.name(),
                    ContainerKind::Raw
                ),
            }
        }
        if let Some(sel) = feed_selection(params) {
            tod.container_mut().subset_feed_select(&sel, params.corr)?;
        }
        Ok(())
    }

    /// Write the container to the output files of `iteration`. Collective.
    ///
    /// # Errors
    ///
    /// See [`crate::Container::to_files`].
    fn write_output(&self, tod: &Tod, iteration: usize) -> Result<(), TodError> {
        let paths = self.output_paths(iteration)?;
        tod.container().to_files(&paths, &self.params().exclude)
    }

    /// One read, select, process, write cycle. Collective.
    ///
    /// `input` is the container handed over by the previous stage, if any. Without one and
    /// without input files the cycle stops at once.
    ///
    /// # Errors
    ///
    /// Any error of the steps.
    fn run_iteration(
        &mut self,
        input: Option<Tod>,
        comm: &Comm,
        iteration: usize,
        durations: &mut HashMap<String, Duration>,
    ) -> Result<IterationOutcome, TodError> {
        let tod = match input {
            Some(mut tod) => {
                with_increment_duration!(durations, "select", self.subset_select(&mut tod)?);
                tod
            }
            None => match with_increment_duration!(durations, "read", self.read_input(comm, iteration)?) {
                Some(tod) => tod,
                None => {
                    if comm.is_root() {
                        info!("{}: no file to read from, stopping", self.name());
                    }
                    return Ok(IterationOutcome::Exhausted);
                }
            },
        };
        let run = TaskRun {
            kind: tod.kind(),
            iteration,
            iterable: self.params().iterations > 1,
        };
        debug!("{} iteration {} on a {}", self.name(), iteration, run.kind);

        let name = self.name();
        let mut output = with_increment_duration!(durations, name, self.process(tod, &run)?);
        if let Some(tod) = &mut output {
            tod.container_mut().add_history(&self.history());
            if self.params().show_info {
                tod.container().info();
            }
            let params = self.params();
            if params.write_output && !params.output_files.is_empty() {
                with_increment_duration!(durations, "write", self.write_output(tod, iteration)?);
            }
        }
        Ok(IterationOutcome::Ran(output))
    }
}

/// The feed selection to apply, if any. A correlation type other than `all` applies to every
/// feed on its own.
fn feed_selection(params: &TaskParams) -> Option<FeedSel> {
    match (&params.feed_select, params.corr) {
        (Some(sel), _) => Some(sel.clone()),
        (None, Corr::All) => None,
        (None, _) => Some(FeedSel::Index(IndexSel::Range {
            start: None,
            stop: None,
            step: 1,
        })),
    }
}

/// A chain of stages, each handing its container to the next.
#[derive(Default)]
pub struct Pipeline {
    tasks: Vec<Box<dyn TodTask>>,
}

impl Pipeline {
    /// A pipeline running `tasks` in order.
    pub fn new(tasks: Vec<Box<dyn TodTask>>) -> Self {
        Self { tasks }
    }

    /// Append a stage.
    pub fn push(&mut self, task: Box<dyn TodTask>) {
        self.tasks.push(task);
    }

    /// The stage names, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|task| task.name()).collect()
    }

    /// The largest iteration count of any stage.
    pub fn iterations(&self) -> usize {
        self.tasks
            .iter()
            .map(|task| task.params().iterations)
            .max()
            .unwrap_or(1)
    }

    /// Run every iteration, returning how long each step took. Collective.
    ///
    /// The run stops early when a stage has nothing to read and nothing handed over.
    ///
    /// # Errors
    ///
    /// The first error of any stage.
    pub fn run(&mut self, comm: &Comm) -> Result<HashMap<String, Duration>, TodError> {
        let mut durations = HashMap::<String, Duration>::new();
        'iterations: for iteration in 0..self.iterations() {
            let mut tod: Option<Tod> = None;
            for task in self.tasks.iter_mut() {
                match task.run_iteration(tod.take(), comm, iteration, &mut durations)? {
                    IterationOutcome::Exhausted => break 'iterations,
                    IterationOutcome::Ran(output) => tod = output,
                }
            }
        }
        Ok(durations)
    }
}

/// Flags outliers along frequency.
#[derive(Debug)]
pub struct FreqFlagTask {
    /// Shared options
    pub params: TaskParams,
    /// Flagging options
    pub flagging: FlagContext,
    /// The outcome of every iteration so far
    pub outcomes: Vec<FlagOutcome>,
}

impl FreqFlagTask {
    /// A flagging stage.
    pub fn new(params: TaskParams, flagging: FlagContext) -> Self {
        Self {
            params,
            flagging,
            outcomes: vec![],
        }
    }
}

impl TodTask for FreqFlagTask {
    fn name(&self) -> &'static str {
        "freq_flag"
    }

    fn params(&self) -> &TaskParams {
        &self.params
    }

    fn process(&mut self, mut tod: Tod, _run: &TaskRun) -> Result<Option<Tod>, TodError> {
        let outcome = self.flagging.flag_container(tod.container_mut())?;
        if let FlagOutcome::Skipped(warning) = &outcome {
            tod.container_mut()
                .add_history(&format!("{} skipped: {}", self.name(), warning));
        }
        self.outcomes.push(outcome);
        Ok(Some(tod))
    }
}

/// Separates a raw timestream into polarizations and feed pairs.
#[derive(Debug, Clone)]
pub struct SeparateTask {
    /// Shared options
    pub params: TaskParams,
    /// Keep the incoming distribution axis rather than distributing along time
    pub keep_dist_axis: bool,
}

impl TodTask for SeparateTask {
    fn name(&self) -> &'static str {
        "rt2ts"
    }

    fn params(&self) -> &TaskParams {
        &self.params
    }

    fn process(&mut self, tod: Tod, _run: &TaskRun) -> Result<Option<Tod>, TodError> {
        let mut raw = tod.into_raw(self.name())?;
        Ok(Some(raw.separate_pol_and_bl(self.keep_dist_axis)?.into()))
    }
}

/// Reduces a separated timestream and hands it to a synthesis backend.
#[derive(Debug)]
pub struct MapMakingTask<S: BeamSynthesis> {
    /// Shared options
    pub params: TaskParams,
    /// Map-making options
    pub mapmaking: MapMakingContext,
    /// The synthesis backend
    pub synthesis: S,
}

impl<S: BeamSynthesis> TodTask for MapMakingTask<S> {
    fn name(&self) -> &'static str {
        "map_making"
    }

    fn params(&self) -> &TaskParams {
        &self.params
    }

    fn process(&mut self, tod: Tod, run: &TaskRun) -> Result<Option<Tod>, TodError> {
        let mut ts = tod.into_timestream(self.name())?;
        let mut ctx = self.mapmaking.clone();
        if run.iterable && self.params.tag_output_iter {
            if let Some(path) = &ctx.output_path {
                ctx.output_path = Some(self.tagger().tag(path, run.iteration)?);
            }
        }
        let stream = ctx.run(&mut ts, &mut self.synthesis)?;
        if ts.comm().is_root() {
            info!(
                "reduced to {} phase bins, {} channels and {} redundancy groups",
                stream.ntime,
                stream.frequencies.len(),
                stream.uniquepairs.nrows()
            );
        }
        Ok(Some(ts.into()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use ndarray::Axis as NdAxis;
    use num_complex::Complex;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        comm::run_workers,
        constants::{MAIN_DATA, MAIN_MASK},
        dataset::AttrValue,
        flags::FlagContextBuilder,
        mapmaking::{LoggingSynthesis, MapMakingContextBuilder},
        test_common::{synthetic_raw, synthetic_timestream},
    };

    fn quiet_flagging() -> FlagContext {
        FlagContextBuilder::default()
            .draw_progress(false)
            .build()
            .unwrap()
    }

    /// Write a raw timestream of 6 times, 12 channels and feeds 1 and 2, with channel 4
    /// standing out everywhere.
    fn write_spiky_raw(paths: &[PathBuf]) {
        let mut raw = synthetic_raw(Comm::solo(), 6, 12, &[1, 2]);
        {
            let (vis, _) = raw.main_arrays_mut().unwrap();
            vis.fill(Complex::new(1.0, 1.0));
            vis.index_axis_mut(NdAxis(1), 4).fill(Complex::new(200.0, 0.0));
        }
        raw.to_files(paths, &[]).unwrap();
    }

    fn history(tod: &Tod) -> String {
        match tod.container().attrs.get("history") {
            Some(AttrValue::Str(history)) => history.clone(),
            _ => String::new(),
        }
    }

    #[test]
    fn test_params_builder_defaults() {
        let params = TaskParamsBuilder::default().build().unwrap();
        assert_eq!(params, TaskParams::default());
        assert_eq!(params.iterations, 1);
        assert_eq!(params.corr, Corr::All);
        assert!(params.write_output);
        assert!(feed_selection(&params).is_none());
        let params = TaskParams {
            corr: Corr::Auto,
            ..TaskParams::default()
        };
        assert!(matches!(feed_selection(&params), Some(FeedSel::Index(_))));
    }

    #[test]
    fn test_flag_then_separate() {
        let dir = tempdir().unwrap();
        let inputs = vec![dir.path().join("in_0.fits"), dir.path().join("in_1.fits")];
        let outputs = vec![dir.path().join("out.fits")];
        write_spiky_raw(&inputs);

        for size in 1..=3 {
            run_workers(size, |comm| {
                let mut pipeline = Pipeline::new(vec![
                    Box::new(FreqFlagTask::new(
                        TaskParams {
                            input_files: inputs.clone(),
                            ..TaskParams::default()
                        },
                        quiet_flagging(),
                    )),
                    Box::new(SeparateTask {
                        params: TaskParams {
                            output_files: outputs.clone(),
                            ..TaskParams::default()
                        },
                        keep_dist_axis: false,
                    }),
                ]);
                assert_eq!(pipeline.names(), vec!["freq_flag", "rt2ts"]);
                let durations = pipeline.run(&comm).unwrap();
                assert!(durations.contains_key("read"));
                assert!(durations.contains_key("write"));
                assert!(durations.contains_key("freq_flag"));
            });

            let loaded = TodReader::open(&outputs)
                .unwrap()
                .load_all(Comm::solo(), Axis::Time)
                .unwrap();
            assert_eq!(loaded.kind(), ContainerKind::Timestream);
            let mask = loaded.container().global_dataset(MAIN_MASK).unwrap();
            let mask = mask.as_bool(MAIN_MASK).unwrap();
            assert!(mask.index_axis(NdAxis(1), 4).iter().all(|&m| m));
            assert_eq!(mask.iter().filter(|&&m| m).count(), mask.len() / 12);
            let history = history(&loaded);
            assert!(history.contains("freq_flag"));
            assert!(history.contains("rt2ts"));
        }
    }

    #[test]
    fn test_upstream_container_is_subset_selected() {
        let dir = tempdir().unwrap();
        let inputs = vec![dir.path().join("in.fits")];
        write_spiky_raw(&inputs);

        let mut first = FreqFlagTask::new(
            TaskParams {
                input_files: inputs,
                ..TaskParams::default()
            },
            quiet_flagging(),
        );
        let mut second = SeparateTask {
            params: TaskParams {
                time_select: Some(IndexSel::range(0, 2)),
                feed_select: Some(FeedSel::Numbers(vec![2])),
                ..TaskParams::default()
            },
            keep_dist_axis: false,
        };
        let comm = Comm::solo();
        let mut durations = HashMap::new();
        let IterationOutcome::Ran(tod) = first.run_iteration(None, &comm, 0, &mut durations).unwrap() else {
            panic!("nothing was read");
        };
        let IterationOutcome::Ran(Some(ts)) = second.run_iteration(tod, &comm, 0, &mut durations).unwrap() else {
            panic!("nothing was separated");
        };
        let vis = ts.container().global_dataset(MAIN_DATA).unwrap();
        // feed 2 with itself, all four polarizations
        assert_eq!(vis.shape(), &[2, 12, 4, 1]);
        assert!(matches!(
            first.outcomes.as_slice(),
            [FlagOutcome::Flagged { newly_flagged: 60 }]
        ));
    }

    #[test]
    fn test_exhausted_without_inputs() {
        let mut task = SeparateTask {
            params: TaskParams::default(),
            keep_dist_axis: true,
        };
        let mut durations = HashMap::new();
        assert!(matches!(
            task.run_iteration(None, &Comm::solo(), 0, &mut durations),
            Ok(IterationOutcome::Exhausted)
        ));
        let mut pipeline = Pipeline::default();
        pipeline.push(Box::new(task));
        assert!(pipeline.run(&Comm::solo()).unwrap().is_empty());
    }

    #[test]
    fn test_iterations_tag_paths() {
        let dir = tempdir().unwrap();
        let template = |name: &str| dir.path().join(name);
        for iteration in 0..2 {
            write_spiky_raw(&[template(&format!("in_{iteration}.fits"))]);
        }
        let mut pipeline = Pipeline::new(vec![Box::new(FreqFlagTask::new(
            TaskParams {
                input_files: vec![template("in_%.fits")],
                output_files: vec![template("flagged.fits")],
                iterations: 2,
                ..TaskParams::default()
            },
            quiet_flagging(),
        ))]);
        assert_eq!(pipeline.iterations(), 2);
        pipeline.run(&Comm::solo()).unwrap();
        assert!(Path::new(&template("flagged_iter0.fits")).exists());
        assert!(Path::new(&template("flagged_iter1.fits")).exists());
    }

    #[test]
    fn test_separate_rejects_timestream() {
        let ts = synthetic_timestream(Comm::solo(), 2, 2, &[1]);
        let mut task = SeparateTask {
            params: TaskParams::default(),
            keep_dist_axis: false,
        };
        let run = TaskRun {
            kind: ContainerKind::Timestream,
            iteration: 0,
            iterable: false,
        };
        assert!(matches!(
            task.process(ts.into(), &run),
            Err(TodError::WrongContainerKind { .. })
        ));
    }

    #[test]
    fn test_mapmaking_task_tags_stream() {
        let dir = tempdir().unwrap();
        let mut task = MapMakingTask {
            params: TaskParams {
                iterations: 2,
                ..TaskParams::default()
            },
            mapmaking: MapMakingContextBuilder::default()
                .mask_daytime(false)
                .draw_progress(false)
                .output_path(Some(dir.path().join("stream_%%.fits")))
                .build()
                .unwrap(),
            synthesis: LoggingSynthesis::default(),
        };
        let ts = synthetic_timestream(Comm::solo(), 4, 2, &[1, 2, 3]);
        let run = TaskRun {
            kind: ContainerKind::Timestream,
            iteration: 1,
            iterable: true,
        };
        let output = task.process(ts.into(), &run).unwrap();
        assert!(output.is_some());
        assert!(dir.path().join("stream_01.fits").exists());
        assert_eq!(task.synthesis.calls.len(), 3);
        assert!(task.synthesis.calls[1].contains("stream_01.fits"));
    }
}
