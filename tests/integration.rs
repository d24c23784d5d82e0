use itertools::Itertools;
use ndarray::{Array1, Array2, Array3, Axis as NdAxis};
use std::path::{Path, PathBuf};
use tempfile::tempdir;
use todpipe::{
    comm::Comm,
    constants::{BLORDER, CHANNO, FEEDNO, FEEDPOS, FREQ, MAIN_DATA, MAIN_MASK, SEC1970},
    io::{fits::read_hdus, TodReader},
    main_with_args, AttrValue, Axis, Complex, Container, ContainerKind, DataArray, RawTimestream,
};

const NTIME: usize = 8;
const NFREQ: usize = 16;
const FEEDS: [i64; 3] = [1, 2, 3];
const SPIKE_CHAN: usize = 9;

fn pairs_to_array(pairs: &[(i64, i64)]) -> Array2<i64> {
    Array2::from_shape_fn((pairs.len(), 2), |(i, j)| {
        if j == 0 {
            pairs[i].0
        } else {
            pairs[i].1
        }
    })
}

/// Write a raw timestream of three cylinder feeds over `paths`, with one channel standing out.
fn write_raw(paths: &[PathBuf]) {
    let nchan = 2 * FEEDS.len() as i64;
    let blorder: Vec<(i64, i64)> = (0..nchan)
        .combinations_with_replacement(2)
        .map(|pair| (pair[0], pair[1]))
        .collect();
    let channo: Vec<(i64, i64)> = (0..FEEDS.len() as i64).map(|k| (2 * k, 2 * k + 1)).collect();
    let vis = Array3::from_shape_fn((NTIME, NFREQ, blorder.len()), |(t, f, b)| {
        if f == SPIKE_CHAN {
            Complex::new(500.0, 0.0)
        } else {
            Complex::new(1.0 + 0.01 * t as f32, 0.5 + 0.01 * b as f32)
        }
    });

    let mut container = Container::new(ContainerKind::Raw, Axis::Time, Comm::solo()).unwrap();
    #[rustfmt::skip]
    let datasets: Vec<(&str, DataArray)> = vec![
        (MAIN_DATA, vis.into()),
        (MAIN_MASK, Array3::<bool>::default((NTIME, NFREQ, blorder.len())).into()),
        (BLORDER, pairs_to_array(&blorder).into()),
        (CHANNO, pairs_to_array(&channo).into()),
        (SEC1970, Array1::from_shape_fn(NTIME, |t| 1.45e9 + 4.0 * t as f64).into()),
        (FREQ, Array1::from_shape_fn(NFREQ, |f| 685.0 + 0.25 * f as f64).into()),
        (FEEDNO, Array1::from(FEEDS.to_vec()).into()),
        (FEEDPOS, Array2::from_shape_fn((FEEDS.len(), 3), |(i, j)| {
            if j == 1 { 0.4 * i as f64 } else { 0.0 }
        }).into()),
    ];
    for (name, data) in datasets {
        container.create_known_dataset(name, data).unwrap();
    }
    container.attrs.insert("telescope".into(), "Tianlai-Cylinder".into());
    container.attrs.insert("cywid".into(), 15.0.into());
    container.attrs.insert("timezone".into(), "UTC+08".into());
    container.attrs.insert("sec1970".into(), 1.45e9.into());
    RawTimestream::new(container)
        .unwrap()
        .to_files(paths, &[])
        .unwrap();
}

fn path_args(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|path| path.display().to_string()).collect()
}

fn load(paths: &[PathBuf]) -> todpipe::Tod {
    TodReader::open(paths)
        .unwrap()
        .load_all(Comm::solo(), Axis::Time)
        .unwrap()
}

#[test]
fn test_flag_separate_over_workers() {
    let tmp_dir = tempdir().unwrap();
    let inputs = vec![
        tmp_dir.path().join("raw_0.fits"),
        tmp_dir.path().join("raw_1.fits"),
    ];
    let outputs = vec![
        tmp_dir.path().join("ts_0.fits"),
        tmp_dir.path().join("ts_1.fits"),
        tmp_dir.path().join("ts_2.fits"),
    ];
    write_raw(&inputs);

    let input_args = path_args(&inputs);
    let output_args = path_args(&outputs);
    let mut args = vec!["todpipe"];
    args.extend(input_args.iter().map(String::as_str));
    #[rustfmt::skip]
    args.extend_from_slice(&[
        "--stages", "flag", "separate",
        "--workers", "3",
        "--no-draw-progress",
        "--exclude", FEEDPOS,
        "-o",
    ]);
    args.extend(output_args.iter().map(String::as_str));

    assert_eq!(main_with_args(&args), 0);

    let tod = load(&outputs);
    assert_eq!(tod.kind(), ContainerKind::Timestream);
    assert!(!tod.container().contains(FEEDPOS));
    let vis = tod.container().global_dataset(MAIN_DATA).unwrap();
    assert_eq!(vis.shape(), &[NTIME, NFREQ, 4, 6]);
    let mask = tod.container().global_dataset(MAIN_MASK).unwrap();
    let mask = mask.as_bool(MAIN_MASK).unwrap();
    assert!(mask.index_axis(NdAxis(1), SPIKE_CHAN).iter().all(|&m| m));
    assert_eq!(mask.iter().filter(|&&m| m).count(), mask.len() / NFREQ);

    // each output file holds its own segment of time
    let (attrs, arrays) = read_hdus(&outputs[1]).unwrap();
    assert_eq!(arrays[MAIN_DATA].shape()[0], 3);
    assert_eq!(attrs["sec1970"], AttrValue::Float(1.45e9 + 12.0));
}

#[test]
fn test_selection_on_files() {
    let tmp_dir = tempdir().unwrap();
    let inputs = vec![tmp_dir.path().join("raw.fits")];
    let outputs = vec![tmp_dir.path().join("selected.fits")];
    write_raw(&inputs);

    let input_args = path_args(&inputs);
    let output = outputs[0].display().to_string();
    let mut args = vec!["todpipe"];
    args.extend(input_args.iter().map(String::as_str));
    #[rustfmt::skip]
    args.extend_from_slice(&[
        "--stages", "separate",
        "--sel-time", "2", "8", "2",
        "--sel-freq-mhz", "685.5", "686.0",
        "--sel-feeds", "1", "3",
        "--corr", "cross",
        "--workers", "2",
        "-o", output.as_str(),
    ]);

    assert_eq!(main_with_args(&args), 0);

    let tod = load(&outputs);
    let vis = tod.container().global_dataset(MAIN_DATA).unwrap();
    // times 2, 4 and 6; channels 2 to 4; the single pair (1, 3)
    assert_eq!(vis.shape(), &[3, 3, 4, 1]);
    let freq = tod.container().global_dataset(FREQ).unwrap();
    let freq = freq.as_float(FREQ).unwrap();
    assert_eq!(freq.iter().copied().collect_vec(), vec![685.5, 685.75, 686.0]);
}

#[test]
fn test_mapmaking_writes_stream() {
    let tmp_dir = tempdir().unwrap();
    let inputs = vec![tmp_dir.path().join("raw.fits")];
    let stream = tmp_dir.path().join("stream.fits");
    write_raw(&inputs);

    let input_args = path_args(&inputs);
    let stream_arg = stream.display().to_string();
    let mut args = vec!["todpipe"];
    args.extend(input_args.iter().map(String::as_str));
    #[rustfmt::skip]
    args.extend_from_slice(&[
        "--stages", "flag", "separate", "mapmaking",
        "--mm-no-mask-daytime",
        "--mm-pol", "I",
        "--mm-stream-out", stream_arg.as_str(),
        "--workers", "2",
        "--no-draw-progress",
    ]);

    assert_eq!(main_with_args(&args), 0);
    assert!(Path::new(&stream).exists());
    let (_, arrays) = read_hdus(&stream).unwrap();
    assert!(arrays.contains_key("feedmap"));
    assert!(arrays.contains_key("uniquepairs"));
}

#[test]
fn test_dry_run_writes_nothing() {
    let tmp_dir = tempdir().unwrap();
    let inputs = vec![tmp_dir.path().join("raw.fits")];
    let output = tmp_dir.path().join("never.fits");
    write_raw(&inputs);

    let input_args = path_args(&inputs);
    let output_arg = output.display().to_string();
    let mut args = vec!["todpipe"];
    args.extend(input_args.iter().map(String::as_str));
    args.extend_from_slice(&["--stages", "flag", "--dry-run", "-o", output_arg.as_str()]);

    assert_eq!(main_with_args(&args), 0);
    assert!(!output.exists());
}

#[test]
fn test_missing_input_returns_1() {
    let tmp_dir = tempdir().unwrap();
    let input = tmp_dir.path().join("absent.fits").display().to_string();
    assert_eq!(main_with_args(["todpipe", input.as_str(), "--stages", "flag"]), 1);
}

#[test]
fn test_wrong_container_kind_returns_1() {
    let tmp_dir = tempdir().unwrap();
    let inputs = vec![tmp_dir.path().join("raw.fits")];
    write_raw(&inputs);
    let input = inputs[0].display().to_string();
    // map-making needs a separated timestream
    assert_eq!(
        main_with_args([
            "todpipe",
            input.as_str(),
            "--stages",
            "mapmaking",
            "--mm-no-mask-daytime",
            "--no-draw-progress"
        ]),
        1
    );
}
