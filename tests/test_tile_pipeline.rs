use approx::assert_abs_diff_eq;
use chrono::NaiveDate;
use ndarray::{s, Array3, Array4, Axis};
use nbarsmooth::core::composite::ProcessingWindow;
use nbarsmooth::core::kernels::KernelModel;
use nbarsmooth::core::multiband::MultiBandSmoother;
use nbarsmooth::core::regularise::{EdgeMode, EdgePreservingSolver, StepDirection};
use nbarsmooth::{PipelineConfig, Sensor, TileInputs, TilePipeline, ViewGeometry};

const N_DAYS: usize = 90;
const ROWS: usize = 2;
const COLS: usize = 3;

// OLCI band order: blue, green, red, NIR
const ISO: [f64; 4] = [0.05, 0.07, 0.06, 0.30];
const VOL: [f64; 4] = [0.02, 0.03, 0.03, 0.10];
const GEO: [f64; 4] = [0.005, 0.01, 0.01, 0.03];

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn window() -> ProcessingWindow {
    ProcessingWindow::new(NaiveDate::from_ymd_opt(2019, 6, 1).unwrap(), N_DAYS).unwrap()
}

fn synthetic_tile() -> TileInputs {
    let shape = (N_DAYS, ROWS, COLS);
    let vza = Array3::from_shape_fn(shape, |(t, r, c)| {
        55.0 * (0.37 * t as f64 + 0.1 * r as f64 + 0.2 * c as f64).sin().abs()
    });
    let sza = Array3::from_shape_fn(shape, |(t, _, _)| 25.0 + 30.0 * t as f64 / N_DAYS as f64);
    let raa = Array3::from_shape_fn(shape, |(t, _, _)| {
        (if t % 2 == 0 { 20.0 } else { 160.0 }) + t as f64
    });
    let geometry = ViewGeometry { vza, sza, raa };

    let model = KernelModel::new();
    let mut reflectance = Array4::zeros((N_DAYS, 4, ROWS, COLS));
    for ((t, b, r, c), v) in reflectance.indexed_iter_mut() {
        let k = model.evaluate(
            geometry.vza[[t, r, c]],
            geometry.sza[[t, r, c]],
            geometry.raa[[t, r, c]],
        );
        *v = ISO[b] * k.isotropic + VOL[b] * k.volumetric + GEO[b] * k.geometric;
    }

    // snow-like sample: NIR below red
    reflectance[[11, 3, 0, 0]] = 0.5 * reflectance[[11, 2, 0, 0]];

    let mut qa = Array3::from_shape_fn(shape, |(t, _, _)| t % 7 != 3);
    // pixel with two usable days only
    qa.slice_mut(s![2.., 1, 2]).fill(false);

    TileInputs { reflectance, qa, geometry }
}

#[test]
fn test_tile_recovers_isotropic_reflectance() {
    init_logging();
    let mut config = PipelineConfig::new(Sensor::Olci, window());
    config.block_size = 2;
    let pipeline = TilePipeline::new(config).expect("invalid configuration");
    let inputs = synthetic_tile();

    let out = pipeline.process(&inputs).expect("tile processing failed");

    assert_eq!(out.stats.total(), 4 * ROWS * COLS);
    assert_eq!(out.stats.degenerate, 4);
    assert_eq!(out.stats.constrained, 0);

    for r in 0..ROWS {
        for c in 0..COLS {
            let degenerate = (r, c) == (1, 2);
            for b in 0..4 {
                assert_abs_diff_eq!(out.rmse[[b, r, c]], 0.0, epsilon = 1e-9);
                for t in 0..N_DAYS {
                    let usable = t % 7 != 3 && !((r, c) == (0, 0) && t == 11);
                    let iso = out.iso[[t, b, r, c]];
                    if degenerate || !usable {
                        assert_eq!(iso, 0.0, "iso at day {} band {} pixel ({}, {})", t, b, r, c);
                    } else {
                        assert_abs_diff_eq!(iso, ISO[b], epsilon = 1e-9);
                    }

                    let smoothed = out.smoothed[[t, b, r, c]];
                    let expected = if degenerate { 0.0 } else { ISO[b] };
                    assert_abs_diff_eq!(smoothed, expected, epsilon = 1e-8);
                }
            }
        }
    }

    assert!(out.converged.iter().all(|&c| c));

    let unc = out.uncertainty.as_ref().expect("uncertainty requested");
    let variance = Sensor::Olci.config().obs_variance;
    for b in 0..4 {
        assert!(unc[[44, b, 0, 1]] > 0.0);
        assert!(unc[[44, b, 0, 1]] <= variance[b]);
        assert_eq!(unc[[5, b, 0, 1]], 0.0);
        assert_eq!(unc[[44, b, 1, 2]], 0.0);
    }
}

#[test]
fn test_block_size_does_not_change_constant_series() {
    init_logging();
    let inputs = synthetic_tile();

    let mut small = PipelineConfig::new(Sensor::Olci, window());
    small.block_size = 1;
    small.with_uncertainty = false;
    let mut large = small.clone();
    large.block_size = 64;

    let a = TilePipeline::new(small).unwrap().process(&inputs).unwrap();
    let b = TilePipeline::new(large).unwrap().process(&inputs).unwrap();
    assert!(a.uncertainty.is_none());
    assert_eq!(a.stats, b.stats);
    for (x, y) in a.smoothed.iter().zip(b.smoothed.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-9);
    }
}

#[test]
fn test_block_size_does_not_change_uneven_tile() {
    init_logging();
    let mut inputs = synthetic_tile();
    // one pixel darkens halfway, another is only seen every 15th day
    inputs.reflectance.slice_mut(s![45.., .., 0, 0]).mapv_inplace(|v| 0.3 * v);
    for t in 0..N_DAYS {
        inputs.qa[[t, 1, 1]] = t % 15 == 0;
    }

    let mut small = PipelineConfig::new(Sensor::Olci, window());
    small.block_size = 1;
    let mut large = small.clone();
    large.block_size = 64;

    let a = TilePipeline::new(small).unwrap().process(&inputs).unwrap();
    let b = TilePipeline::new(large).unwrap().process(&inputs).unwrap();
    assert_eq!(a.stats, b.stats);
    assert_eq!(a.step_score, b.step_score);
    assert_eq!(a.converged, b.converged);
    for (x, y) in a.smoothed.iter().zip(b.smoothed.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
    }
    for (x, y) in a.weights.iter().zip(b.weights.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
    }
    let (ua, ub) = (a.uncertainty.unwrap(), b.uncertainty.unwrap());
    for (x, y) in ua.iter().zip(ub.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
    }

    // blocks see the alpha of the whole tile
    let whole = MultiBandSmoother::new(Sensor::Olci.config())
        .unwrap()
        .smooth(a.iso.view(), false)
        .unwrap();
    for (x, y) in a.smoothed.iter().zip(whole.solution.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
    }
    let n_usable = a.iso.index_axis(Axis(1), 3).iter().filter(|&&v| v > 0.0).count();
    let expected_alpha = (n_usable as f64 / (ROWS * COLS) as f64).clamp(20.0, 250.0);
    assert_abs_diff_eq!(whole.references[0].1.alpha, expected_alpha, epsilon = 1e-12);
}

#[test]
fn test_mismatched_inputs_fail_fast() {
    let pipeline = TilePipeline::new(PipelineConfig::new(Sensor::Olci, window())).unwrap();
    let mut inputs = synthetic_tile();
    inputs.qa = Array3::from_elem((N_DAYS - 1, ROWS, COLS), true);
    assert!(pipeline.process(&inputs).is_err());

    let modis = TilePipeline::new(PipelineConfig::new(Sensor::Modis, window())).unwrap();
    assert!(modis.process(&synthetic_tile()).is_err());
}

#[test]
fn test_config_round_trips_through_json() {
    let mut config = PipelineConfig::new(Sensor::Viirs, ProcessingWindow::calendar_year(2020).unwrap());
    config.block_size = 128;
    config.regularisation.direction = StepDirection::Both;
    config.edges.half_window = 12;

    let json = serde_json::to_string_pretty(&config).expect("serialize failed");
    let back: PipelineConfig = serde_json::from_str(&json).expect("deserialize failed");
    assert_eq!(back.sensor, Sensor::Viirs);
    assert_eq!(back.window, config.window);
    assert_eq!(back.window.n_days, 366);
    assert_eq!(back.block_size, 128);
    assert_eq!(back.regularisation.direction, StepDirection::Both);
    assert_eq!(back.edges.half_window, 12);
}

#[test]
fn test_daily_composite_feeds_pipeline_window() {
    let pipeline = TilePipeline::new(PipelineConfig::new(Sensor::Olci, window())).unwrap();
    let day = |d: u32| NaiveDate::from_ymd_opt(2019, 6, d).unwrap();
    let dates = vec![day(1), day(1), day(3), NaiveDate::from_ymd_opt(2019, 12, 1).unwrap()];
    let values = ndarray::array![
        [0.04, 0.06, 0.05, 0.3],
        [0.06, 0.08, 0.07, 0.3],
        [0.05, 0.07, 0.06, 0.2],
        [0.05, 0.07, 0.06, 0.2]
    ];

    let daily = pipeline.compositor().composite(&dates, values.view()).unwrap();
    assert_eq!(daily.dim(), (N_DAYS, 4));
    assert_abs_diff_eq!(daily[[0, 0]], 0.05, epsilon = 1e-12);
    assert_abs_diff_eq!(daily[[2, 3]], 0.2, epsilon = 1e-12);
    assert_eq!(daily.index_axis(Axis(0), 1).sum(), 0.0);
}

#[test]
fn test_shared_weights_are_monotone() {
    init_logging();
    let n_t = 90;
    let (rows, cols) = (1, 3);
    let mut iso = Array4::from_elem((n_t, 7, rows, cols), 0.2);
    // pixel 0: drop in band 1 only; pixel 1: drop in band 4 only; pixel 2: flat
    for t in 45..n_t {
        iso[[t, 1, 0, 0]] = 0.05;
        iso[[t, 4, 0, 1]] = 0.05;
    }

    let smoother = MultiBandSmoother::new(Sensor::Modis.config()).unwrap();
    let out = smoother.smooth(iso.view(), true).expect("smoothing failed");
    let (_, first) = &out.references[0];
    let (_, second) = &out.references[1];

    assert_eq!(out.selected[[0, 0]], 0);
    assert_eq!(out.selected[[0, 1]], 1);
    assert_eq!(out.selected[[0, 2]], 0);

    for c in 0..cols {
        let adopted = if out.selected[[0, c]] == 0 { first } else { second };
        for t in 0..n_t {
            let shared = out.weights[[t, 0, c]];
            assert_eq!(shared, adopted.weights[[t, 0, c]].min(1.0));
            if shared < 1.0 {
                assert!(first.weights[[t, 0, c]] < 1.0 || second.weights[[t, 0, c]] < 1.0);
            }
        }
    }
    assert_eq!(out.weights[[44, 0, 0]], 0.01);
    assert_eq!(out.weights[[44, 0, 1]], 0.01);

    // every band is re-solved with the shared field
    let solver = EdgePreservingSolver::new();
    for band in [0, 1, 4] {
        let fixed = solver
            .solve_band(iso.index_axis(Axis(1), band), EdgeMode::Fixed(out.weights.view()), false)
            .unwrap();
        assert_eq!(fixed.smoothed, out.solution.index_axis(Axis(1), band));
    }

    // uncertainty comes from the band-4 solve scaled by each band's variance
    let unc = out.uncertainty.as_ref().unwrap();
    let inv = second.inverse_diagonal.as_ref().unwrap();
    let variance = Sensor::Modis.config().obs_variance;
    for b in 0..7 {
        assert_abs_diff_eq!(unc[[50, b, 0, 2]], inv[[50, 0, 2]] * variance[b], epsilon = 1e-15);
    }
}
