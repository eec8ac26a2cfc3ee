//! Closure tests for the budget pipeline.
//!
//! The synthetic case has analytic fields whose budgets are known exactly, so the total
//! tendency must equal the sum of all forcings up to rounding errors.

use approx::assert_abs_diff_eq;
use fluxbudget_core::config::RunConfig;
use fluxbudget_core::diagnostics::{max_error_scaled, nse};
use fluxbudget_core::field::{Field, GridAxis};
use fluxbudget_core::output::{OutputKind, VariableOutput};
use fluxbudget_core::prepare::prepare;
use fluxbudget_core::store::MemoryStore;
use fluxbudget_core::synthetic::SyntheticCase;
use fluxbudget_core::tendency::calc_tendencies;
use fluxbudget_core::variables::Variable;

fn run(case: &SyntheticCase, variable: Variable, config: RunConfig) -> VariableOutput {
    let (mean, inst) = case.build().unwrap();
    let store = MemoryStore::new();
    let config = RunConfig {
        variables: vec![variable],
        ..config
    };
    let mut out = calc_tendencies(&mean, &inst, &case.attributes(), &config, &store).unwrap();
    out.remove(&variable).unwrap()
}

fn methods(methods: &[&str]) -> RunConfig {
    RunConfig {
        budget_methods: methods.iter().map(|m| m.to_string()).collect(),
        ..RunConfig::default()
    }
}

fn member<'a>(out: &'a VariableOutput, kind: OutputKind, name: &str) -> &'a Field {
    out[&kind].data.require(name).unwrap()
}

fn max_abs_diff(a: &Field, b: &Field) -> f64 {
    a.sub(b).unwrap().max_abs().unwrap_or(0.0)
}

mod momentum {
    use super::*;

    /// An accelerating, sheared wind without perturbations: the turbulent tendency
    /// vanishes and the tendency equals the pressure-gradient forcing.
    #[test]
    fn test_cartesian_closure_without_turbulence() {
        let case = SyntheticCase::default();
        let out = run(&case, Variable::U, methods(&["cartesian"]));

        let tend = member(&out, OutputKind::Tend, "cartesian/tendency");
        let forcing = member(&out, OutputKind::Tend, "cartesian/forcing");
        for v in tend.values().iter() {
            assert_abs_diff_eq!(*v, case.u_trend, epsilon = 1e-10);
        }
        assert!(max_abs_diff(tend, forcing) < 1e-10);

        let trb = member(&out, OutputKind::Adv, "cartesian/trb_r/sum");
        assert!(trb.max_abs().unwrap() < 1e-10);
        // flat terrain: no corrections
        let corr = &out[&OutputKind::Corr].data;
        for (name, field) in corr.iter() {
            assert!(field.max_abs().unwrap_or(0.0) < 1e-12, "{}", name);
        }
    }

    #[test]
    fn test_native_closure() {
        let case = SyntheticCase::default();
        let out = run(&case, Variable::U, methods(&[""]));
        let tend = member(&out, OutputKind::Tend, "native/tendency");
        let forcing = member(&out, OutputKind::Tend, "native/forcing");
        assert!(max_abs_diff(tend, forcing) < 1e-10);
        assert!(!out.contains_key(&OutputKind::Corr));
    }
}

mod temperature {
    use super::*;

    /// The ramp in x is advected by the sheared wind, so the tendency varies in y and
    /// time and the skill scores are meaningful.
    #[test]
    fn test_closure_all_methods() {
        let case = SyntheticCase::default();
        let labels = ["", "cartesian", "cartesian dz_out_x", "cartesian dz_out_z"];
        let out = run(&case, Variable::T, methods(&labels));

        for label in ["native", "cartesian", "cartesian dz_out_x", "cartesian dz_out_z"] {
            let tend = member(&out, OutputKind::Tend, &format!("{}/tendency", label));
            let forcing = member(&out, OutputKind::Tend, &format!("{}/forcing", label));
            let err = max_error_scaled(forcing, tend).unwrap();
            assert!(err < 1e-10, "{}: scaled error {}", label, err);
            assert!(nse(forcing, tend).unwrap() > 0.999999, "{}", label);
        }
    }

    #[test]
    fn test_tendency_is_advection_of_ramp() {
        let case = SyntheticCase::default();
        let out = run(&case, Variable::T, methods(&["cartesian"]));
        let tend = member(&out, OutputKind::Tend, "cartesian/tendency");
        let adv = member(&out, OutputKind::Adv, "cartesian/adv_r/X");
        assert!(max_abs_diff(tend, adv) < 1e-10);

        // mean wind over the last interval at the first y-row
        let t = case.times()[case.n_mean];
        let y = 0.5 * case.dy;
        let u_mean = case.u(y, t - 0.5 * case.interval);
        let last = tend.values()[[case.n_mean - 1, 0, 0, 0]];
        assert_abs_diff_eq!(last, -case.theta_gradient * u_mean, epsilon = 1e-12);
    }
}

mod turbulent_component {
    use super::*;

    fn averaged_case() -> (SyntheticCase, RunConfig) {
        // output at every model step so that turbulent fluxes can be computed explicitly
        let case = SyntheticCase {
            interval: 10.0,
            dt: 10.0,
            n_mean: 4,
            ..SyntheticCase::default()
        };
        let config = RunConfig {
            t_avg_interval: Some(2),
            avg_dims: Some(vec![GridAxis::Y]),
            ..methods(&["cartesian"])
        };
        (case, config)
    }

    #[test]
    fn test_residual_along_averaging_axes() {
        let (case, config) = averaged_case();
        let out = run(&case, Variable::U, config);
        for kind in [OutputKind::Flux, OutputKind::Adv] {
            let total = member(&out, kind, "cartesian/adv_r/Y");
            let mean = member(&out, kind, "cartesian/mean/Y");
            let trb = member(&out, kind, "cartesian/trb_r/Y");
            assert_eq!(mean.max_abs().unwrap(), 0.0);
            let residual = total.sub(mean).unwrap();
            assert_eq!(max_abs_diff(trb, &residual), 0.0);
        }
    }

    #[test]
    fn test_explicit_fluxes_along_other_axes() {
        let (case, config) = averaged_case();
        let (mean, inst) = case.build().unwrap();
        let prepared = prepare(
            &mean,
            &inst,
            &case.attributes(),
            case.periodicity(),
            &[Variable::U],
            config.t_avg_interval,
            config.avg_axes(),
        )
        .unwrap();
        let explicit = prepared.mean.require("FUU_TRB_MEAN").unwrap();

        let out = run(&case, Variable::U, config);
        let trb = member(&out, OutputKind::Flux, "cartesian/trb_r/X");
        assert_eq!(trb.dims(), explicit.dims());
        assert_eq!(max_abs_diff(trb, explicit), 0.0);
    }
}

mod sloped_terrain {
    use super::*;

    /// Terrain rising in x with a stratified atmosphere: the coordinate surfaces cut
    /// through the stratification, so all correction terms are active.
    fn sloped() -> SyntheticCase {
        SyntheticCase {
            terrain_slope: 0.1,
            theta_lapse: 3e-3,
            periodic_x: false,
            ..SyntheticCase::default()
        }
    }

    fn assert_closure(out: &VariableOutput, label: &str) {
        let tend = member(out, OutputKind::Tend, &format!("{}/tendency", label));
        let forcing = member(out, OutputKind::Tend, &format!("{}/forcing", label));
        let err = max_error_scaled(forcing, tend).unwrap();
        assert!(err < 1e-10, "{}: scaled error {}", label, err);
        assert!(nse(forcing, tend).unwrap() > 0.999999, "{}", label);
    }

    #[test]
    fn test_closure_all_methods() {
        let case = sloped();
        let labels = ["", "cartesian", "cartesian dz_out_x", "cartesian dz_out_z"];
        let out = run(&case, Variable::T, methods(&labels));

        let native = member(&out, OutputKind::Adv, "native/adv_r/X");
        for label in ["native", "cartesian", "cartesian dz_out_x", "cartesian dz_out_z"] {
            assert_closure(&out, label);
        }
        for label in ["cartesian", "cartesian dz_out_x", "cartesian dz_out_z"] {
            let dcorr = member(&out, OutputKind::Corr, &format!("{}/adv_r/X", label));
            assert!(dcorr.max_abs().unwrap() > 1e-6, "{}", label);
            let x = member(&out, OutputKind::Adv, &format!("{}/adv_r/X", label));
            assert!(max_abs_diff(x, native) > 1e-6, "{}", label);
        }
        // both variants of the height-derivative correction agree
        let dz_out_x = member(&out, OutputKind::Adv, "cartesian dz_out_x/adv_r/X");
        let dz_out_z = member(&out, OutputKind::Adv, "cartesian dz_out_z/adv_r/X");
        assert!(max_abs_diff(dz_out_x, dz_out_z) < 1e-12);
    }

    /// Along the terrain the wind is decelerated by the convergence of the column, which
    /// the corrections cancel: the Cartesian x-advection of the uniform wind vanishes.
    #[test]
    fn test_momentum_closure() {
        let case = sloped();
        let out = run(&case, Variable::U, methods(&["", "cartesian", "cartesian dz_out_x"]));
        for label in ["native", "cartesian", "cartesian dz_out_x"] {
            let tend = member(&out, OutputKind::Tend, &format!("{}/tendency", label));
            let forcing = member(&out, OutputKind::Tend, &format!("{}/forcing", label));
            assert!(max_abs_diff(tend, forcing) < 1e-10, "{}", label);
        }
        let native = member(&out, OutputKind::Adv, "native/adv_r/X");
        assert!(native.max_abs().unwrap() > 1e-3);
        let cartesian = member(&out, OutputKind::Adv, "cartesian/adv_r/X");
        assert!(cartesian.max_abs().unwrap() < 1e-10);
    }

    /// The model top rises, so the coordinate surfaces move and the total tendency gets
    /// a time correction.
    #[test]
    fn test_moving_grid_closure() {
        let case = SyntheticCase {
            lift_rate: 0.05,
            ..sloped()
        };
        let out = run(&case, Variable::T, methods(&["", "cartesian"]));
        assert_closure(&out, "native");
        assert_closure(&out, "cartesian");

        let dcorr = member(&out, OutputKind::Corr, "cartesian/adv_r/T");
        assert!(dcorr.max_abs().unwrap() > 1e-6);
        let native = member(&out, OutputKind::Tend, "native/tendency");
        let cartesian = member(&out, OutputKind::Tend, "cartesian/tendency");
        assert!(max_abs_diff(native, cartesian) > 1e-6);
    }

    /// Second-order fluxes with mean fluxes built from the full potential temperature
    #[test]
    fn test_second_order_closure() {
        let case = SyntheticCase {
            u_trend: 0.0,
            ..sloped()
        };
        let out = run(&case, Variable::T, methods(&["2nd", "cartesian 2nd", "cartesian"]));
        assert_closure(&out, "2nd");
        assert_closure(&out, "cartesian 2nd");

        // the reference temperature is removed before building the mean flux
        for dir in ["X", "Z"] {
            let second = member(&out, OutputKind::Flux, &format!("cartesian 2nd/mean/{}", dir));
            let regular = member(&out, OutputKind::Flux, &format!("cartesian/mean/{}", dir));
            assert!(max_abs_diff(second, regular) < 1e-10, "{}", dir);
        }
        let second = member(&out, OutputKind::Flux, "cartesian 2nd/mean/X");
        assert!(second.max_abs().unwrap() > 1.0);
    }
}
