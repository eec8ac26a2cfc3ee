//! Cartesian corrections
//!
//! On the terrain-following grid, the horizontal advective tendencies differ from their
//! Cartesian counterparts by the vertical derivative of a correction flux: the
//! horizontal flux times the slope of the coordinate surfaces. The time derivative of
//! the total tendency has a similar correction from the moving coordinate surfaces.
//!
//! The correction fluxes are decomposed like the advective fluxes. Their vertical
//! derivatives are added to the horizontal advective tendencies and subtracted from
//! the total tendency.

use crate::advection::{vertical_divergence, Advection};
use crate::averaging::avg_xy;
use crate::budget::{Component, Decomposition, CORRECTION_DIRS, XY};
use crate::config::BudgetSettings;
use crate::errors::BudgetResult;
use crate::field::{Field, GridAxis};
use crate::grid::{VariableGrid, G};
use crate::variables::Variable;
use log::info;

/// Outcome of applying the Cartesian corrections
#[derive(Clone, Debug, PartialEq)]
pub struct CartesianBudget {
    /// Advective tendencies with the corrections included
    pub adv: Decomposition,
    /// Total tendency with the time correction included
    pub tend: Field,
    /// Vertical derivative of the decomposed correction fluxes
    pub dcorr_dz: Decomposition,
}

/// Decompose the correction fluxes of `advection` and apply them.
///
/// `rhodm` is the time-averaged density `RHOD_MEAN`; `grid` the (possibly averaged)
/// variable grid.
#[allow(clippy::too_many_arguments)]
pub fn cartesian_corrections(
    variable: Variable,
    advection: &Advection,
    rhodm: &Field,
    grid: &VariableGrid,
    adv: &Decomposition,
    tend: &Field,
    settings: BudgetSettings,
    avg_axes: &[GridAxis],
) -> BudgetResult<CartesianBudget> {
    info!("Compute Cartesian corrections");
    let ctx = &grid.base.stagger;
    let dz_out = settings.dz_out();

    let (corr_total, rhodm) = if avg_axes.is_empty() {
        (advection.corr.clone(), rhodm.clone())
    } else {
        (
            avg_xy(&advection.corr, avg_axes, None, ctx)?,
            avg_xy(rhodm, avg_axes, None, ctx)?,
        )
    };

    let mut corr = Decomposition::new();
    corr.insert_component(Component::Total, &CORRECTION_DIRS, &corr_total)?;

    // mean component
    let var_z = advection.var_stag.require(GridAxis::Z.label())?;
    let rho_stag = ctx.like(&rhodm, var_z)?;
    for dir in XY {
        let mean = if avg_axes.contains(&dir) {
            corr_total.require(dir.label())?.map(|_| 0.0)
        } else {
            let slope = if dz_out {
                ctx.like(advection.vmean.require(dir.label())?, var_z)?
            } else {
                ctx.like(grid.dzdt(dir), var_z)?.neg()
            };
            slope.mul(&rho_stag)?.mul(var_z)?
        };
        corr.insert(Component::Mean, dir, mean);
    }
    let dzdt = ctx.like(grid.dzdd(GridAxis::Time)?, var_z)?;
    corr.insert(
        Component::Mean,
        GridAxis::Time,
        rho_stag.mul(&dzdt)?.mul(var_z)?,
    );

    corr.fill_residual(&CORRECTION_DIRS)?;

    // correction flux to tendency
    let mut dcorr_dz = corr.try_map(|_, _, c| {
        vertical_divergence(c, variable, grid)?
            .scale(-G)
            .div(&grid.mu_stag_mean)
    })?;
    if dz_out {
        dcorr_dz = dcorr_dz.try_map(|_, dir, d| d.mul(&ctx.like(grid.dzdd(dir)?, d)?))?;
    }

    let mut adv = adv.clone();
    for comp in Component::ALL {
        for dir in XY {
            if let Some(a) = adv.get(comp, dir) {
                let corrected = a.add(dcorr_dz.require(comp, dir)?)?;
                adv.insert(comp, dir, corrected);
            }
        }
    }
    let tend = tend.sub(dcorr_dz.require(Component::Total, GridAxis::Time)?)?;

    Ok(CartesianBudget {
        adv,
        tend,
        dcorr_dz,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advection::adv_tend;
    use crate::dataset::Dataset;
    use crate::field::Dim;
    use crate::grid::VariableContext;
    use crate::prepare::prepare;
    use crate::synthetic::SyntheticCase;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn setup(case: &SyntheticCase, variable: Variable) -> (Dataset, VariableContext) {
        let (mean, inst) = case.build().unwrap();
        let data = prepare(
            &mean,
            &inst,
            &case.attributes(),
            case.periodicity(),
            &[variable],
            None,
            &[],
        )
        .unwrap();
        let vc = VariableContext::derive(&data.grid, variable, &data.mean, &data.inst, &[])
            .unwrap();
        (data.mean, vc)
    }

    fn apply(
        case: &SyntheticCase,
        variable: Variable,
        mean: &Dataset,
        vc: &VariableContext,
        method: &str,
    ) -> (Advection, CartesianBudget) {
        let settings = BudgetSettings::parse(method).unwrap();
        let out = adv_tend(mean, vc, &vc.grid, &case.attributes(), settings, &[]).unwrap();
        let tend = out.adv.sum_dirs(Component::Total).unwrap();
        let res = cartesian_corrections(
            variable,
            &out,
            mean.require("RHOD_MEAN").unwrap(),
            &vc.grid,
            &out.adv,
            &tend,
            settings,
            &[],
        )
        .unwrap();
        (out, res)
    }

    fn sloped() -> SyntheticCase {
        SyntheticCase {
            terrain_slope: 0.1,
            theta_lapse: 3e-3,
            u_trend: 0.0,
            periodic_x: false,
            ..SyntheticCase::default()
        }
    }

    #[test]
    fn test_flat_terrain_leaves_tendencies_unchanged() {
        let case = SyntheticCase::default();
        let (mean, vc) = setup(&case, Variable::T);
        let (out, res) = apply(&case, Variable::T, &mean, &vc, "cartesian");
        let tend = out.adv.sum_dirs(Component::Total).unwrap();
        assert_eq!(res.adv, out.adv);
        assert_eq!(res.tend, tend);
        for (_, _, d) in res.dcorr_dz.iter() {
            assert_eq!(d.max_abs(), Some(0.0));
        }
    }

    /// On a static slope the corrected x-advection is the advection of the ramp along
    /// constant height, without the stratification crossed along the coordinate surface.
    #[test]
    fn test_slope_correction_recovers_advection_at_constant_height() {
        let case = sloped();
        let (mean, vc) = setup(&case, Variable::T);
        let (out, res) = apply(&case, Variable::T, &mean, &vc, "cartesian");

        let before = out.adv.require(Component::Total, GridAxis::X).unwrap();
        let after = res.adv.require(Component::Total, GridAxis::X).unwrap();
        let dcorr = res.dcorr_dz.require(Component::Total, GridAxis::X).unwrap();
        assert!(dcorr.max_abs().unwrap() > 1e-6);
        let (nt, nz) = (case.n_mean, case.nz);
        for t in 0..nt {
            for k in 0..nz {
                for j in 0..case.ny {
                    let u = case.u(vc.grid.base.coord(Dim::Y).unwrap()[j], 0.0);
                    // columns next to the open boundaries have no x-derivative
                    for i in 1..case.nx - 1 {
                        let v = after.values()[[t, k, j, i]];
                        assert_abs_diff_eq!(v, -case.theta_gradient * u, epsilon = 1e-12);
                        assert!((before.values()[[t, k, j, i]] - v).abs() > 1e-7);
                    }
                }
            }
        }
        // steady wind: the correction flux is carried by the mean slope velocity
        let total = res.dcorr_dz.require(Component::Mean, GridAxis::X).unwrap();
        let trb = res.dcorr_dz.require(Component::Turbulent, GridAxis::X).unwrap();
        assert!(trb.max_abs().unwrap() < 1e-9 * total.max_abs().unwrap());
        // no motion of the coordinate surfaces
        let time = res.dcorr_dz.require(Component::Total, GridAxis::Time).unwrap();
        assert!(time.max_abs().unwrap() < 1e-15);
    }

    #[test]
    fn test_w_correction_reflected_at_top() {
        let case = SyntheticCase::default();
        let (mut mean, vc) = setup(&case, Variable::W);
        let c = mean.require("FWX_CORR").unwrap().offset(0.2);
        mean.insert("FWX_CORR", c);
        let settings = BudgetSettings::parse("cartesian").unwrap();
        let out = adv_tend(&mean, &vc, &vc.grid, &case.attributes(), settings, &[]).unwrap();
        let res = cartesian_corrections(
            Variable::W,
            &out,
            mean.require("RHOD_MEAN").unwrap(),
            &vc.grid,
            &out.adv,
            &Field::scalar(0.0),
            settings,
            &[],
        )
        .unwrap();

        let dcorr = res.dcorr_dz.require(Component::Total, GridAxis::X).unwrap();
        let dn = -1.0 / case.nz as f64;
        let expected = 2.0 * 0.2 * G / (dn * case.column_mass(0.0));
        for v in dcorr.isel(Dim::Z_STAG, -1).unwrap().values().iter() {
            assert_relative_eq!(*v, expected, max_relative = 1e-12);
        }
        assert_eq!(dcorr.isel(Dim::Z_STAG, 0).unwrap().max_abs(), Some(0.0));

        // the whole correction is turbulent: the mean slope is zero
        let trb = res.dcorr_dz.require(Component::Turbulent, GridAxis::X).unwrap();
        assert_eq!(trb, dcorr);
        let before = out.adv.require(Component::Total, GridAxis::X).unwrap();
        let after = res.adv.require(Component::Total, GridAxis::X).unwrap();
        assert_eq!(after, &before.add(dcorr).unwrap());
    }

    /// Rising model top over a slope: the vertical wind and its correction flux are
    /// nonzero up to the lid, where the flux is reflected.
    #[test]
    fn test_w_correction_reflected_at_top_over_slope() {
        let case = SyntheticCase {
            lift_rate: 0.05,
            ..sloped()
        };
        let (mean, vc) = setup(&case, Variable::W);
        let (out, res) = apply(&case, Variable::W, &mean, &vc, "cartesian");

        let corr = out.corr.require("X").unwrap().isel(Dim::Z, -1).unwrap();
        assert!(corr.max_abs().unwrap() > 1e-4);
        let dn = -1.0 / case.nz as f64;
        let dcorr = res.dcorr_dz.require(Component::Total, GridAxis::X).unwrap();
        let top = dcorr.isel(Dim::Z_STAG, -1).unwrap();
        let xs = vc.grid.base.coord(Dim::X).unwrap();
        for t in 0..case.n_mean {
            for j in 0..case.ny {
                for (i, x) in xs.iter().enumerate() {
                    let c = corr.values()[[t, j, i]];
                    let expected = 2.0 * c * G / (dn * case.column_mass(*x));
                    assert_relative_eq!(top.values()[[t, j, i]], expected, max_relative = 1e-12);
                }
            }
        }
        assert_eq!(dcorr.isel(Dim::Z_STAG, 0).unwrap().max_abs(), Some(0.0));

        // the moving lid also corrects the total tendency
        let time = res.dcorr_dz.require(Component::Total, GridAxis::Time).unwrap();
        assert!(time.max_abs().unwrap() > 0.0);
        let tend = out.adv.sum_dirs(Component::Total).unwrap();
        let expected = tend.sub(time).unwrap();
        assert_eq!(res.tend.sub(&expected).unwrap().max_abs(), Some(0.0));
    }
}
