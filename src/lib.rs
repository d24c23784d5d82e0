#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_errors_doc)]

//! Todpipe is a library for processing the time-ordered visibilities of a radio interferometer
//! across a group of cooperating workers.
//!
//! Data lives in a distributed [`Container`]: every worker holds a contiguous shard of the main
//! visibilities along one axis, alongside the mask and every auxiliary dataset. Stages
//! redistribute, select, flag, separate polarizations and reduce the data for map-making, and
//! a [`pipeline::Pipeline`] chains them together.
//!
//! # Examples
//!
//! Flag a raw timestream that has been written to disk, using two workers.
//!
//! ```rust,no_run
//! use todpipe::{
//!     comm::run_workers,
//!     flags::{FlagContext, FlagOutcome},
//!     io::TodReader,
//!     Axis,
//! };
//!
//! let paths = ["obs_0.fits", "obs_1.fits"];
//! let flagged = run_workers(2, |comm| {
//!     let reader = TodReader::open(&paths).unwrap();
//!     let mut tod = reader.load_all(comm, Axis::Time).unwrap();
//!     match FlagContext::default().flag_container(tod.container_mut()).unwrap() {
//!         FlagOutcome::Flagged { newly_flagged } => newly_flagged,
//!         FlagOutcome::Skipped(_) => 0,
//!     }
//! });
//! assert_eq!(flagged[0], flagged[1]);
//! ```

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

pub mod axes;
pub mod comm;
pub mod constants;
pub mod container;
pub mod dataset;
pub mod error;
pub mod flags;
pub mod io;
pub mod mapmaking;
pub mod multiscale;
pub mod pipeline;
pub mod selection;
pub mod separate;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "cli")]
pub use cli::main_with_args;

pub use axes::{Axis, ContainerKind, Role};
pub use container::{Container, RawTimestream, Timestream, Tod};
pub use dataset::{AttrValue, Attrs, DataArray};
pub use error::TodError;
pub use flags::{FlagContext, FlagOutcome};
pub use mapmaking::MapMakingContext;
pub use pipeline::{Pipeline, TaskParams, TodTask};
pub use selection::{Corr, FeedSel, FreqSel, IndexSel, PolSel};

pub use marlu;
pub use ndarray;
pub use num_complex::Complex;

#[cfg(test)]
mod test_common;

#[macro_export]
/// Time a statement and increment the timer given by the key in the hashmap of durations.
macro_rules! with_increment_duration {
    ($durs:expr, $name:expr, $($s:stmt);+ $(;)?) => {
        {
            let _now = std::time::Instant::now();
            let _res = {
                $(
                    $s
                );*
            };
            *$durs.entry($name.into()).or_insert(std::time::Duration::default()) +=
                _now.elapsed();
            _res
        }
    };
}

/// A progress bar in the house style, drawn on stderr only if `draw_progress`.
pub(crate) fn progress_bar(len: u64, message: &'static str, draw_progress: bool) -> ProgressBar {
    let draw_target = if draw_progress {
        ProgressDrawTarget::stderr()
    } else {
        ProgressDrawTarget::hidden()
    };
    let style = ProgressStyle::default_bar()
        .template("{msg:16}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:3}% ({eta:5})")
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    ProgressBar::with_draw_target(Some(len), draw_target)
        .with_style(style)
        .with_position(0)
        .with_message(message)
}
