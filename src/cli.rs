//! Command Line Interface helpers for todpipe

use std::{
    collections::HashMap,
    ffi::OsString,
    fmt::{Debug, Display},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{
    arg, command,
    ErrorKind::{ArgumentNotFound, DisplayHelp, DisplayVersion},
    ValueHint::FilePath,
};
use itertools::Itertools;
use log::{debug, info, trace};
use prettytable::{format as prettyformat, row, table};
use strum::IntoEnumIterator;
use strum_macros::{Display as StrumDisplay, EnumIter, EnumString, IntoStaticStr};

use crate::{
    axes::Axis,
    comm::run_workers,
    error::{CLIError::InvalidCommandLineArgument, TodError, TodError::DryRun},
    flags::FlagContext,
    io::{IterationTagger, PercentTagger, TodReader},
    mapmaking::{LoggingSynthesis, MapMakingContext, PolChoice, RedundancyWeighting},
    multiscale::{Detrend, DetrendKind},
    pipeline::{FreqFlagTask, MapMakingTask, Pipeline, SeparateTask, TaskParams, TodTask},
    selection::{Corr, FeedSel, FreqSel, IndexSel, PolSel},
    Complex,
};

/// A stage that can be chained on the command line. Stages run in this order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    StrumDisplay,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    /// Sigma-clip outliers along frequency
    Flag,
    /// Split a raw timestream into polarizations and feed pairs
    Separate,
    /// Reduce a separated timestream for map synthesis
    MapMaking,
}

/// Everything needed to run a pipeline from the command line.
pub struct TodpipeContext {
    /// The stages, in order
    pub stages: Vec<Stage>,
    /// Options shared by the stages. The first stage reads and selects, the last one writes.
    pub params: TaskParams,
    /// Flagging parameters
    pub flag_ctx: FlagContext,
    /// Whether separation keeps the incoming distribution axis
    pub keep_dist_axis: bool,
    /// Map-making parameters
    pub mapmaking_ctx: MapMakingContext,
    /// The number of workers
    pub workers: usize,
    /// The input files of the first iteration, with the selections applied
    pub input: TodReader,
}

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

/// Write many info-level log lines of how this executable was compiled.
///
/// # Errors
///
/// propagates writeln! fails
pub fn fmt_build_info(f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match GIT_HEAD_REF {
        Some(hr) => {
            let dirty = GIT_DIRTY.unwrap_or(false);
            writeln!(
                f,
                "Compiled on git commit hash: {}{}",
                GIT_COMMIT_HASH.unwrap_or("<unknown>"),
                if dirty { " (dirty)" } else { "" }
            )?;
            writeln!(f, "            git head ref: {}", hr)?;
        }
        None => writeln!(f, "Compiled on git commit hash: <no git info>")?,
    }
    writeln!(f, "            {}", BUILT_TIME_UTC)?;
    writeln!(f, "         with compiler {}", RUSTC_VERSION)?;
    writeln!(f)?;
    Ok(())
}

impl Display for TodpipeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} version {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        )?;

        fmt_build_info(f)?;

        writeln!(f, "Stages:               {}", self.stages.iter().join(" -> "))?;
        writeln!(
            f,
            "Workers:              {} distributed along {}",
            self.workers, self.params.dist_axis
        )?;
        writeln!(f, "Iterations:           {}", self.params.iterations)?;
        writeln!(f, "Input kind:           {}", self.input.kind())?;

        let total_ntime: usize = self.input.file_ntimes().iter().sum();
        let selected_times = self.input.selection().indices(Axis::Time, total_ntime);
        let mut file_table = table!(["", "file", "times", "selected"]);
        file_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
        let mut offset = 0;
        for (file_idx, (path, &ntime)) in self
            .input
            .paths()
            .iter()
            .zip(self.input.file_ntimes())
            .enumerate()
        {
            let selected = selected_times
                .iter()
                .filter(|&&t| (offset..offset + ntime).contains(&t))
                .count();
            file_table.add_row(row![r =>
                format!("file{}:", file_idx),
                path.display(),
                ntime,
                selected
            ]);
            offset += ntime;
        }
        writeln!(
            f,
            "File details (files={}, times={}, select={}):\n{}",
            self.input.paths().len(),
            total_ntime,
            selected_times.len(),
            file_table
        )?;

        let mut axis_table = table!(["axis", "in files", "selected"]);
        axis_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
        let mut num_selected = 1;
        for &axis in self.input.kind().main_axes() {
            let (file_len, selected_len) =
                match (self.input.file_len(axis), self.input.selected_len(axis)) {
                    (Ok(file_len), Ok(selected_len)) => (file_len, selected_len),
                    _ => continue,
                };
            num_selected *= selected_len;
            axis_table.add_row(row![r => axis, file_len, selected_len]);
        }
        writeln!(f, "Axis details:\n{}", axis_table)?;

        let bytes_per_sample = std::mem::size_of::<Complex<f32>>() + std::mem::size_of::<bool>();
        writeln!(
            f,
            "Estimated memory selected = {:9} samples * ({}<c32> + {}<bool>) = {:7.02} GiB over {} worker(s)",
            num_selected,
            std::mem::size_of::<Complex<f32>>(),
            std::mem::size_of::<bool>(),
            (num_selected * bytes_per_sample) as f64 / 1024.0_f64.powi(3),
            self.workers,
        )?;

        write!(f, "{}", self.params)?;
        for stage in &self.stages {
            match stage {
                Stage::Flag => write!(f, "{}", self.flag_ctx)?,
                Stage::Separate => writeln!(
                    f,
                    "Will separate polarizations{}.",
                    if self.keep_dist_axis {
                        ", keeping the distribution axis"
                    } else {
                        ""
                    }
                )?,
                Stage::MapMaking => write!(f, "{}", self.mapmaking_ctx)?,
            }
        }

        Ok(())
    }
}

/// `Ok(None)` if the argument is absent, otherwise whatever clap parsed.
fn optional<T>(result: Result<T, clap::Error>) -> Result<Option<T>, TodError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) => match err.kind() {
            ArgumentNotFound { .. } => Ok(None),
            _ => Err(err.into()),
        },
    }
}

/// A `START STOP [STEP]` argument as an index range.
fn parse_index_range(
    matches: &clap::ArgMatches,
    option: &str,
) -> Result<Option<IndexSel>, TodError> {
    let values = match optional(matches.values_of_t::<i64>(option))? {
        Some(values) => values,
        None => return Ok(None),
    };
    let (start, stop, step) = match values.as_slice() {
        &[start, stop] => (start, stop, 1),
        &[start, stop, step] => (start, stop, step),
        _ => {
            return Err(InvalidCommandLineArgument {
                option: format!("--{option} <START> <STOP> [STEP]"),
                expected: "two or three indices".into(),
                received: format!("{values:?}"),
            }
            .into())
        }
    };
    if step <= 0 {
        return Err(InvalidCommandLineArgument {
            option: format!("--{option} <START> <STOP> [STEP]"),
            expected: "a positive step".into(),
            received: format!("step={step}"),
        }
        .into());
    }
    Ok(Some(IndexSel::Range {
        start: Some(start),
        stop: Some(stop),
        step,
    }))
}

impl TodpipeContext {
    #[allow(clippy::cognitive_complexity)]
    fn get_matches<I, T>(args: I) -> Result<clap::ArgMatches, TodError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        let stage_names: Vec<&'static str> = Stage::iter().map(Into::into).collect();
        let corr_names: Vec<&'static str> = Corr::iter().map(Into::into).collect();
        let pol_names: Vec<&'static str> = PolChoice::iter().map(Into::into).collect();
        let weighting_names: Vec<&'static str> =
            RedundancyWeighting::iter().map(Into::into).collect();
        let axis_names: Vec<&'static str> = Axis::iter().map(Into::into).collect();
        let mut app = command!()
            .arg_required_else_help(true)
            .next_line_help(false)
            .about("Flag, separate and reduce time-ordered interferometer visibilities \
                    across a group of workers.")
            .args(&[
                // input options
                arg!(inputs: <INPUTS>... "Files holding contiguous time segments of one timestream")
                    .help_heading("INPUT")
                    .value_hint(FilePath)
                    .required(true),
                arg!(--stages <STAGE>... "Stages to run, in order")
                    .help_heading("INPUT")
                    .multiple_values(true)
                    .possible_values(stage_names)
                    .required(true),
                arg!(--iterations <COUNT> "Run the pipeline <COUNT> times. Paths are tagged \
                        with the iteration: a run of % is replaced by the zero-prefixed \
                        iteration, otherwise _iter<N> is added before the extension.")
                    .help_heading("INPUT")
                    .default_value("1")
                    .required(false),
                arg!(--"no-tag-input-iter" "Read the same inputs in every iteration")
                    .help_heading("INPUT"),

                // selection options
                arg!(--"sel-time" <INDEX> "Time sample range START STOP [STEP], negative \
                        indices count from the end")
                    .help_heading("SELECTION")
                    .min_values(2)
                    .max_values(3)
                    .allow_hyphen_values(true)
                    .required(false),
                arg!(--"sel-freq" <INDEX> "Channel range START STOP [STEP]")
                    .help_heading("SELECTION")
                    .min_values(2)
                    .max_values(3)
                    .allow_hyphen_values(true)
                    .required(false),
                arg!(--"sel-freq-mhz" "Channels nearest START to nearest STOP MHz, inclusive")
                    .help_heading("SELECTION")
                    .value_names(&["START", "STOP"])
                    .conflicts_with("sel-freq")
                    .required(false),
                arg!(--"sel-pol" <POLS>... "Polarization labels to keep, e.g. xx yy")
                    .help_heading("SELECTION")
                    .multiple_values(true)
                    .required(false),
                arg!(--"sel-feeds" <FEEDS>... "Feed numbers to keep")
                    .help_heading("SELECTION")
                    .multiple_values(true)
                    .required(false),
                arg!(--corr <CORR> "Correlations between the kept feeds to keep")
                    .help_heading("SELECTION")
                    .possible_values(corr_names)
                    .default_value("all")
                    .required(false),

                // flagging options
                arg!(--sigma <SIGMA> "Flag samples beyond <SIGMA> standard deviations")
                    .help_heading("FLAGGING")
                    .required(false),
                arg!(--"freq-points" <COUNT> "Skip columns with fewer than <COUNT> valid channels")
                    .help_heading("FLAGGING")
                    .required(false),
                arg!(--detrend "Remove the smooth component over LEVEL scales before clipping")
                    .help_heading("FLAGGING")
                    .value_names(&["KIND", "LEVEL"])
                    .required(false),

                // separation options
                arg!(--"keep-dist-axis" "Keep the incoming distribution axis after separation")
                    .help_heading("SEPARATION"),

                // map-making options
                arg!(--"mm-no-mask-daytime" "Do not mask daytime samples")
                    .help_heading("MAP-MAKING"),
                arg!(--"mm-daytime" "Local hours START END treated as daytime, inclusive")
                    .help_heading("MAP-MAKING")
                    .value_names(&["START", "END"])
                    .conflicts_with("mm-no-mask-daytime")
                    .required(false),
                arg!(--"mm-pol" <POL> "Polarization product to map")
                    .help_heading("MAP-MAKING")
                    .possible_values(pol_names)
                    .ignore_case(true)
                    .required(false),
                arg!(--"mm-tsys" <KELVIN> "System temperature")
                    .help_heading("MAP-MAKING")
                    .required(false),
                arg!(--"mm-accuracy-boost" <FACTOR> "Resolution boost for the synthesis")
                    .help_heading("MAP-MAKING")
                    .required(false),
                arg!(--"mm-l-boost" <FACTOR> "Multiplier on the maximum multipole")
                    .help_heading("MAP-MAKING")
                    .required(false),
                arg!(--"mm-auto-correlations" "Pair feeds with themselves")
                    .help_heading("MAP-MAKING"),
                arg!(--"mm-weighting" <WEIGHTING> "How redundancy groups are normalised")
                    .help_heading("MAP-MAKING")
                    .possible_values(weighting_names)
                    .required(false),
                arg!(--"mm-stream-out" <PATH> "Path for the reduced stream")
                    .help_heading("MAP-MAKING")
                    .value_hint(FilePath)
                    .required(false),

                // output options
                arg!(-o --output <PATHS>... "Files to write the last stage's result to")
                    .help_heading("OUTPUT")
                    .value_hint(FilePath)
                    .multiple_values(true)
                    .required(false),
                arg!(--exclude <DATASETS>... "Datasets not to write")
                    .help_heading("OUTPUT")
                    .multiple_values(true)
                    .required(false),
                arg!(--"no-tag-output-iter" "Write the same outputs in every iteration")
                    .help_heading("OUTPUT"),
                arg!(--"show-info" "Log a summary of the result")
                    .help_heading("OUTPUT"),

                // resource options
                arg!(--workers <COUNT> "The number of workers")
                    .help_heading("RESOURCE")
                    .default_value("1")
                    .required(false),
                arg!(--"dist-axis" <AXIS> "The axis to distribute along when reading")
                    .help_heading("RESOURCE")
                    .possible_values(axis_names)
                    .default_value("time")
                    .required(false),

                arg!(--"dry-run" "Just print the summary and exit"),
                arg!(--"no-draw-progress" "do not show progress bars"),
            ]);
        let matches = app.try_get_matches_from_mut(args)?;
        Ok(matches)
    }

    fn parse_stage_matches(matches: &clap::ArgMatches) -> Result<Vec<Stage>, TodError> {
        let stages: Vec<Stage> = matches.values_of_t("stages")?;
        if !stages.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(InvalidCommandLineArgument {
                option: "--stages <STAGE>...".into(),
                expected: format!(
                    "each stage at most once, in the order {}",
                    Stage::iter().join(", ")
                ),
                received: stages.iter().join(" "),
            }
            .into());
        }
        Ok(stages)
    }

    fn parse_params_matches(matches: &clap::ArgMatches) -> Result<TaskParams, TodError> {
        let iterations: usize = matches.value_of_t("iterations")?;
        if iterations == 0 {
            return Err(InvalidCommandLineArgument {
                option: "--iterations <COUNT>".into(),
                expected: "at least one iteration".into(),
                received: "0".into(),
            }
            .into());
        }
        let freq_select = match (
            parse_index_range(matches, "sel-freq")?,
            optional(matches.values_of_t::<f64>("sel-freq-mhz"))?,
        ) {
            (Some(sel), _) => Some(FreqSel::Index(sel)),
            (None, Some(mhz)) => Some(FreqSel::Mhz {
                start: mhz[0],
                stop: mhz[1],
            }),
            (None, None) => None,
        };
        Ok(TaskParams {
            input_files: matches
                .values_of("inputs")
                .map(|paths| paths.map(PathBuf::from).collect())
                .unwrap_or_default(),
            output_files: matches
                .values_of("output")
                .map(|paths| paths.map(PathBuf::from).collect())
                .unwrap_or_default(),
            iterations,
            dist_axis: matches.value_of_t("dist-axis")?,
            exclude: optional(matches.values_of_t("exclude"))?.unwrap_or_default(),
            time_select: parse_index_range(matches, "sel-time")?,
            freq_select,
            pol_select: optional(matches.values_of_t("sel-pol"))?.map(PolSel::Labels),
            feed_select: optional(matches.values_of_t("sel-feeds"))?.map(FeedSel::Numbers),
            corr: matches.value_of_t("corr")?,
            show_info: matches.is_present("show-info"),
            tag_input_iter: !matches.is_present("no-tag-input-iter"),
            tag_output_iter: !matches.is_present("no-tag-output-iter"),
            write_output: true,
        })
    }

    fn parse_flag_matches(matches: &clap::ArgMatches) -> Result<FlagContext, TodError> {
        let mut flag_ctx = FlagContext::default();
        if let Some(sigma) = optional(matches.value_of_t::<f64>("sigma"))? {
            if sigma.is_nan() || sigma <= 0.0 {
                return Err(InvalidCommandLineArgument {
                    option: "--sigma <SIGMA>".into(),
                    expected: "a positive number".into(),
                    received: format!("{sigma}"),
                }
                .into());
            }
            flag_ctx.sigma = sigma;
        }
        if let Some(freq_points) = optional(matches.value_of_t("freq-points"))? {
            flag_ctx.freq_points = freq_points;
        }
        if let Some(values) = matches.values_of("detrend") {
            let values: Vec<&str> = values.collect();
            let bad_detrend = || InvalidCommandLineArgument {
                option: "--detrend <KIND> <LEVEL>".into(),
                expected: format!(
                    "KIND one of {} and a positive LEVEL",
                    DetrendKind::iter().join(", ")
                ),
                received: values.join(" "),
            };
            let (kind, level) = match values.as_slice() {
                [kind, level] => (
                    DetrendKind::from_str(kind).map_err(|_| bad_detrend())?,
                    level.parse::<usize>().map_err(|_| bad_detrend())?,
                ),
                _ => return Err(bad_detrend().into()),
            };
            if level == 0 {
                return Err(bad_detrend().into());
            }
            flag_ctx.detrend = Some(Detrend { kind, level });
        }
        flag_ctx.draw_progress = !matches.is_present("no-draw-progress");
        Ok(flag_ctx)
    }

    fn parse_mapmaking_matches(matches: &clap::ArgMatches) -> Result<MapMakingContext, TodError> {
        let mut mapmaking_ctx = MapMakingContext {
            mask_daytime: !matches.is_present("mm-no-mask-daytime"),
            auto_correlations: matches.is_present("mm-auto-correlations"),
            output_path: matches.value_of("mm-stream-out").map(PathBuf::from),
            draw_progress: !matches.is_present("no-draw-progress"),
            ..MapMakingContext::default()
        };
        if let Some(hours) = optional(matches.values_of_t::<f64>("mm-daytime"))? {
            if !hours.iter().all(|hour| (0.0..=24.0).contains(hour)) {
                return Err(InvalidCommandLineArgument {
                    option: "--mm-daytime <START> <END>".into(),
                    expected: "hours between 0 and 24".into(),
                    received: format!("{hours:?}"),
                }
                .into());
            }
            mapmaking_ctx.mask_time_range = (hours[0], hours[1]);
        }
        if let Some(pol) = optional(matches.value_of_t("mm-pol"))? {
            mapmaking_ctx.pol = pol;
        }
        if let Some(tsys) = optional(matches.value_of_t("mm-tsys"))? {
            mapmaking_ctx.tsys = tsys;
        }
        if let Some(boost) = optional(matches.value_of_t("mm-accuracy-boost"))? {
            mapmaking_ctx.accuracy_boost = boost;
        }
        if let Some(boost) = optional(matches.value_of_t("mm-l-boost"))? {
            mapmaking_ctx.l_boost = boost;
        }
        if let Some(weighting) = optional(matches.value_of_t("mm-weighting"))? {
            mapmaking_ctx.weighting = weighting;
        }
        Ok(mapmaking_ctx)
    }

    /// Parse an iterator of arguments, `args` into a `TodpipeContext`.
    ///
    /// The input files of the first iteration are opened and the selections resolved against
    /// them, so bad inputs are caught before any work starts.
    ///
    /// # Errors
    ///
    /// Can raise:
    /// - `clap::Error` if clap cannot parse `args`
    /// - `TodError::IOError` if the input files can't be opened.
    /// - `TodError::CLIError` if the arguments are invalid.
    /// - `TodError::BadSelection` if a selection doesn't fit the input files.
    /// - `TodError::DryRun` after printing the summary, if `--dry-run` was given.
    pub fn from_args<I, T>(args: I) -> Result<Self, TodError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        debug!("args:\n{:?}", &args);

        let matches = Self::get_matches(args)?;
        trace!("arg matches:\n{:?}", &matches);

        let workers: usize = matches.value_of_t("workers")?;
        if workers == 0 {
            return Err(InvalidCommandLineArgument {
                option: "--workers <COUNT>".into(),
                expected: "at least one worker".into(),
                received: "0".into(),
            }
            .into());
        }
        let stages = Self::parse_stage_matches(&matches)?;
        let params = Self::parse_params_matches(&matches)?;
        let flag_ctx = Self::parse_flag_matches(&matches)?;
        let mapmaking_ctx = Self::parse_mapmaking_matches(&matches)?;
        let keep_dist_axis = matches.is_present("keep-dist-axis");

        let first_inputs = if params.iterations > 1 && params.tag_input_iter {
            PercentTagger.tag_all(&params.input_files, 0)?
        } else {
            params.input_files.clone()
        };
        let mut input = TodReader::open(&first_inputs)?;

        let mut result = Self {
            stages,
            params,
            flag_ctx,
            keep_dist_axis,
            mapmaking_ctx,
            workers,
            input: input.clone(),
        };
        if let Some(&stage) = result.stages.first() {
            result.task(0, stage).data_select(&mut input)?;
        }
        result.input = input;

        info!("{}", &result);

        if matches.is_present("dry-run") {
            return Err(DryRun {});
        }

        Ok(result)
    }

    /// The shared options as seen by the stage at `position`. Only the first stage reads and
    /// selects, only the last one writes.
    pub fn stage_params(&self, position: usize) -> TaskParams {
        let mut params = self.params.clone();
        if position > 0 {
            params.input_files.clear();
            params.time_select = None;
            params.freq_select = None;
            params.pol_select = None;
            params.feed_select = None;
            params.corr = Corr::All;
        }
        if position + 1 < self.stages.len() {
            params.output_files.clear();
            params.exclude.clear();
            params.show_info = false;
        }
        params
    }

    fn task(&self, position: usize, stage: Stage) -> Box<dyn TodTask> {
        let params = self.stage_params(position);
        match stage {
            Stage::Flag => Box::new(FreqFlagTask::new(params, self.flag_ctx.clone())),
            Stage::Separate => Box::new(SeparateTask {
                params,
                keep_dist_axis: self.keep_dist_axis,
            }),
            Stage::MapMaking => Box::new(MapMakingTask {
                params,
                mapmaking: self.mapmaking_ctx.clone(),
                synthesis: LoggingSynthesis::default(),
            }),
        }
    }

    /// A fresh pipeline of the selected stages.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.stages
                .iter()
                .enumerate()
                .map(|(position, &stage)| self.task(position, stage))
                .collect(),
        )
    }

    /// Run the pipeline on every worker, returning the longest time any worker spent on each
    /// step.
    ///
    /// # Errors
    ///
    /// The first error of any worker, in rank order.
    pub fn run(self) -> Result<HashMap<String, Duration>, TodError> {
        let results = run_workers(self.workers, |comm| self.pipeline().run(&comm));

        // used to time large operations
        let mut durations = HashMap::<String, Duration>::new();
        for worker_durations in results {
            for (name, duration) in worker_durations? {
                let longest = durations.entry(name).or_default();
                *longest = (*longest).max(duration);
            }
        }
        Ok(durations)
    }
}

/// Parse `args`, run the pipeline and log the timings. Returns the process exit code.
pub fn main_with_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T> + Debug,
    T: Into<OsString> + Clone,
{
    let todpipe_ctx = match TodpipeContext::from_args(args) {
        Ok(todpipe_ctx) => todpipe_ctx,
        Err(DryRun {}) => {
            info!("Dry run. No files will be written.");
            return 0;
        }
        Err(TodError::ClapError(inner)) => {
            // Swallow broken pipe errors
            trace!("clap error: {:?}", inner.kind());
            let _ = inner.print();
            match inner.kind() {
                DisplayHelp | DisplayVersion => return 0,
                _ => return 1,
            }
        }
        Err(e) => {
            eprintln!("error parsing args: {e}");
            return 1;
        }
    };

    match todpipe_ctx.run() {
        Ok(durations) => {
            info!(
                "total duration: {:?}",
                durations.into_iter().sorted().fold(
                    Duration::ZERO,
                    |duration_sum, (name, duration)| {
                        info!("{} duration: {:?}", name, duration);
                        duration_sum + duration
                    }
                )
            );
            0
        }
        Err(e) => {
            eprintln!("pipeline error: {e}");
            1
        }
    }
}
