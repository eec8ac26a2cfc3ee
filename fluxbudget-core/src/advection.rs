//! Advective tendencies
//!
//! The resolved advective fluxes written by the model are converted to tendencies by
//! taking their divergence, and split into a mean and a resolved turbulent component.
//!
//! The mean flux in direction `d` is the variable staggered onto the flux grid times
//! the mean velocity staggered onto the same grid. The turbulent component is either
//! taken from explicitly computed fluxes ([`TurbulentFlux::Direct`]) or recovered as the
//! residual `Total - Mean`. With horizontal averaging, the mean and turbulent fluxes
//! along the averaging axes vanish by definition; the whole resolved flux along those
//! axes is then attributed to the turbulent component.
//!
//! Horizontal divergences are normalised by the dry-air mass, or by the density when
//! the height derivatives are taken out of the correction terms (`dz_out`). The
//! vertical divergence uses the level spacing of the vertical coordinate; for `w` the
//! tendency is zero at the surface and reflected at the model top.
//!
//! The correction fluxes needed for Cartesian tendencies are returned but not applied;
//! see [`crate::cartesian`].

use crate::averaging::avg_xy;
use crate::budget::{Component, Decomposition, TurbulentFlux, CORRECTION_DIRS, XY, XYZ};
use crate::config::{BudgetSettings, ModelAttributes};
use crate::dataset::Dataset;
use crate::errors::{BudgetError, BudgetResult};
use crate::field::{Dim, Field, GridAxis};
use crate::grid::{VariableContext, VariableGrid, G, THETA_REF};
use crate::variables::Variable;
use log::info;

/// Advective fluxes and tendencies of one variable under one budget method
#[derive(Clone, Debug, PartialEq)]
pub struct Advection {
    pub flux: Decomposition,
    pub adv: Decomposition,
    /// Mean velocities, keyed by direction
    pub vmean: Dataset,
    /// Mean variable on the grid of each flux, keyed by direction
    pub var_stag: Dataset,
    /// Correction fluxes for the directions `X`, `Y` and `T`, not yet applied
    pub corr: Dataset,
}

/// Last valid level spacing between half levels, used for the top closure of `w`
pub(crate) fn dn_top(grid: &VariableGrid) -> BudgetResult<f64> {
    let n = grid.base.dn.values().len();
    if n < 2 {
        return Err(BudgetError::InvalidField("DN needs at least two levels".into()));
    }
    Ok(grid.base.dn.values()[n - 2])
}

/// Vertical derivative of the flux `fz` onto the vertical grid of `variable`.
///
/// For `w` the surface value is zero and the flux is reflected at the model top,
/// giving `-2 fz / DN` there.
pub(crate) fn vertical_divergence(
    fz: &Field,
    variable: Variable,
    grid: &VariableGrid,
) -> BudgetResult<Field> {
    let base = &grid.base;
    let ctx = &base.stagger;
    if variable == Variable::W {
        let mut out = ctx.diff(fz, Dim::Z, base.coord(Dim::Z_STAG)?)?.div(&base.dn)?;
        out.fill_index(Dim::Z_STAG, 0, 0.0)?;
        let top = fz.isel(Dim::Z, -1)?.scale(-2.0 / dn_top(grid)?);
        out.assign_index(Dim::Z_STAG, -1, &top)?;
        Ok(out)
    } else {
        ctx.diff(fz, Dim::Z_STAG, base.coord(Dim::Z)?)?.div(&base.dnw)
    }
}

/// Advective fluxes and tendencies, decomposed into mean and resolved turbulent parts.
///
/// `grid` is the (possibly horizontally averaged) grid of the variable; the map-scale
/// factors are taken from `vc`.
pub fn adv_tend(
    mean: &Dataset,
    vc: &VariableContext,
    grid: &VariableGrid,
    attrs: &ModelAttributes,
    settings: BudgetSettings,
    avg_axes: &[GridAxis],
) -> BudgetResult<Advection> {
    info!("Compute resolved tendencies");
    let variable = vc.variable;
    let base = &grid.base;
    let ctx = &base.stagger;
    let hor_avg = !avg_axes.is_empty();
    let second_order = settings.force_2nd_adv;
    let dz_out = settings.dz_out();
    let rhod = mean.require("RHOD_MEAN")?;

    let mut tot_flux = Dataset::new();
    for dir in XYZ {
        let name = variable.adv_flux_name(dir, second_order);
        tot_flux.insert(dir.label(), mean.require(&name)?.clone());
    }

    // variable on the flux grids
    let mut var_stag = Dataset::new();
    if second_order {
        if variable == Variable::T && attrs.moist_theta() {
            return Err(BudgetError::config(
                "Averaged moist potential temperature not available to build mean \
                 2nd-order fluxes (use_theta_m=1 and output_dry_theta_fluxes=0)",
            ));
        }
        let var_mean = mean.require(&variable.mean_name())?;
        for (dir, flux) in tot_flux.iter() {
            let mut v = ctx.like(var_mean, flux)?;
            if variable == Variable::T {
                v = v.offset(-THETA_REF);
            }
            var_stag.insert(dir, v);
        }
    } else {
        for dir in XYZ {
            var_stag.insert(
                dir.label(),
                mean.require(&variable.staggered_mean_name(dir))?.clone(),
            );
        }
    }

    let w = if settings.cartesian {
        mean.require("WD_MEAN")?
    } else {
        mean.require("OMZN_MEAN")?
    };
    let mut vmean = Dataset::new()
        .with("X", mean.require("U_MEAN")?.clone())
        .with("Y", mean.require("V_MEAN")?.clone())
        .with("Z", w.clone());

    if hor_avg {
        var_stag = avg_xy(&var_stag, avg_axes, Some(rhod), ctx)?;
        vmean = avg_xy(&vmean, avg_axes, Some(rhod), ctx)?;
    }

    let rhod8z = ctx.like(rhod, tot_flux.require("Z")?)?;

    // standard Cartesian corrections
    let mut corr = Dataset::new();
    for (dir, name) in CORRECTION_DIRS
        .iter()
        .zip(variable.correction_names(second_order))
    {
        corr.insert(dir.label(), mean.require(&name)?.clone());
    }

    if !settings.cartesian {
        // the vertical flux includes the corrections: remove them
        let total_corr = corr.sum()?.div(&rhod8z)?;
        let fz = tot_flux.require("Z")?.sub(&total_corr)?;
        tot_flux.insert("Z", fz);
    }

    if dz_out {
        for dir in XY {
            let c = if settings.dz_out_z {
                mean.require(&variable.dz_out_correction_name(dir))?.clone()
            } else {
                rhod8z.mul(&ctx.like(tot_flux.require(dir.label())?, &rhod8z)?)?
            };
            corr.insert(dir.label(), c);
        }
        let corr_t = rhod8z.mul(&ctx.like(mean.require(&variable.mean_name())?, &rhod8z)?)?;
        corr.insert(GridAxis::Time.label(), corr_t);
    }

    // mean advective fluxes
    let mut mean_flux = Dataset::new();
    for dir in XYZ {
        if avg_axes.contains(&dir) {
            mean_flux.insert(dir.label(), Field::scalar(0.0));
            continue;
        }
        let vs = var_stag.require(dir.label())?;
        let mut vel_stag = ctx.like(vmean.require(dir.label())?, vs)?;
        if variable == Variable::W && dir.is_horizontal() {
            vel_stag.fill_index(Dim::Z_STAG, 0, 0.0)?;
        }
        mean_flux.insert(dir.label(), vs.mul(&vel_stag)?);
    }

    let turbulent = TurbulentFlux::detect(mean, variable, settings.cartesian);
    let mut fluxes = vec![(Component::Total, tot_flux), (Component::Mean, mean_flux)];
    if let TurbulentFlux::Direct(trb) = &turbulent {
        fluxes.push((Component::Turbulent, trb.clone()));
    }

    let mut flux = Decomposition::new();
    let mut adv = Decomposition::new();
    for (comp, comp_flux) in &fluxes {
        // mean and turbulent parts live on the averaged grid
        let reduced = hor_avg && *comp != Component::Total;
        let mf = if reduced {
            vc.mapfac.averaged(avg_axes, ctx)?
        } else {
            vc.mapfac.clone()
        };
        let rhod8z_m = if reduced {
            avg_xy(&rhod8z, avg_axes, None, ctx)?
        } else {
            rhod8z.clone()
        };

        let mut tend = Dataset::new();
        for dir in XY {
            if reduced && avg_axes.contains(&dir) {
                tend.insert(dir.label(), Field::scalar(0.0));
                continue;
            }
            let f = comp_flux.require(dir.label())?;
            let dim = Dim::new(dir, false);
            let (flux_dim, var_dim) = if f.has_dim(dim) {
                (dim, dim.to_staggered())
            } else {
                (dim.to_staggered(), dim)
            };

            let mut mf_flx = vc.mapfac.flux(dir).clone();
            let mut fac = if dz_out {
                rhod.clone()
            } else {
                mean.require("MUT_MEAN")?.clone()
            };
            if reduced {
                mf_flx = avg_xy(&mf_flx, avg_axes, None, ctx)?;
                fac = avg_xy(&fac, avg_axes, None, ctx)?;
            }
            if !dz_out {
                fac = base.mu(&fac, f.has_dim(Dim::Z_STAG))?;
            }
            let fac = ctx.like(&fac, f)?;

            let d = ctx
                .diff(&fac.mul(f)?.div(&mf_flx)?, flux_dim, base.coord(var_dim)?)?
                .mul(&mf.x)?
                .mul(&mf.y)?
                .scale(-1.0 / base.spacing(dir)?);
            tend.insert(dir.label(), d);
        }

        let fz = rhod8z_m.mul(comp_flux.require("Z")?)?;
        let tend_z = vertical_divergence(&fz, variable, grid)?.neg();
        // multiply with g so that all tendencies can be divided by the dry-air mass
        tend.insert("Z", tend_z.scale(-G));

        for dir in XYZ {
            let t = tend.require(dir.label())?;
            let t = if dz_out && dir != GridAxis::Z {
                t.div(&grid.rhod_stag_mean)?
            } else {
                t.div(&grid.mu_stag_mean)?
            };
            adv.insert(*comp, dir, t);
        }
        flux.insert_component(*comp, &XYZ, comp_flux)?;
    }

    if hor_avg {
        for dir in XYZ {
            let a = avg_xy(adv.require(Component::Total, dir)?, avg_axes, None, ctx)?;
            adv.insert(Component::Total, dir, a);
            let f = avg_xy(flux.require(Component::Total, dir)?, avg_axes, None, ctx)?;
            flux.insert(Component::Total, dir, f);
        }
    }

    // resolved turbulent part as residual
    match turbulent {
        TurbulentFlux::Residual => {
            flux.fill_residual(&XYZ)?;
            adv.fill_residual(&XYZ)?;
        }
        TurbulentFlux::Direct(_) if hor_avg => {
            flux.fill_residual(avg_axes)?;
            adv.fill_residual(avg_axes)?;
        }
        TurbulentFlux::Direct(_) => {}
    }

    Ok(Advection {
        flux,
        adv,
        vmean,
        var_stag,
        corr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::BaseGrid;
    use crate::synthetic::SyntheticCase;
    use approx::assert_abs_diff_eq;

    fn setup(case: &SyntheticCase, variable: Variable) -> (Dataset, VariableContext) {
        let (mean, inst) = case.build().unwrap();
        let base = BaseGrid::from_datasets(&mean, &inst, case.dx, case.dy, case.periodicity())
            .unwrap();
        let mean = base.assign_vertical_coords(&mean).unwrap();
        let inst = base.assign_vertical_coords(&inst).unwrap();
        let vc = VariableContext::derive(&base, variable, &mean, &inst, &[]).unwrap();
        (mean, vc)
    }

    fn cartesian() -> BudgetSettings {
        BudgetSettings::parse("cartesian").unwrap()
    }

    #[test]
    fn test_residual_decomposition() {
        let case = SyntheticCase::default();
        let (mean, vc) = setup(&case, Variable::T);
        let out = adv_tend(&mean, &vc, &vc.grid, &case.attributes(), cartesian(), &[]).unwrap();
        for dir in XYZ {
            let total = out.adv.require(Component::Total, dir).unwrap();
            let m = out.adv.require(Component::Mean, dir).unwrap();
            let trb = out.adv.require(Component::Turbulent, dir).unwrap();
            assert_eq!(trb, &total.sub(m).unwrap());
        }
        // x-advection of the temperature ramp by the mean wind
        let x = out.adv.require(Component::Total, GridAxis::X).unwrap();
        assert!(x.max_abs().unwrap() > 0.0);
        let trb = out.adv.require(Component::Turbulent, GridAxis::X).unwrap();
        assert!(trb.max_abs().unwrap() < 1e-9 * x.max_abs().unwrap());
    }

    #[test]
    fn test_missing_second_order_fluxes() {
        let case = SyntheticCase::default();
        let (mut mean, vc) = setup(&case, Variable::U);
        mean.remove("FUY_ADV_MEAN_2ND");
        let settings = BudgetSettings::parse("cartesian 2nd").unwrap();
        let err = adv_tend(&mean, &vc, &vc.grid, &case.attributes(), settings, &[]).unwrap_err();
        match err {
            BudgetError::MissingInput { name } => assert_eq!(name, "FUY_ADV_MEAN_2ND"),
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn test_second_order_moist_theta_rejected() {
        let case = SyntheticCase::default();
        let (mean, vc) = setup(&case, Variable::T);
        let attrs = ModelAttributes {
            use_theta_m: true,
            ..case.attributes()
        };
        let settings = BudgetSettings::parse("cartesian 2nd").unwrap();
        assert!(matches!(
            adv_tend(&mean, &vc, &vc.grid, &attrs, settings, &[]),
            Err(BudgetError::Config(_))
        ));
    }

    #[test]
    fn test_w_vertical_closure() {
        let case = SyntheticCase::default();
        let (mut mean, vc) = setup(&case, Variable::W);
        let fz = mean.require("FWZ_ADV_MEAN").unwrap().offset(0.5);
        mean.insert("FWZ_ADV_MEAN", fz);
        let out = adv_tend(&mean, &vc, &vc.grid, &case.attributes(), cartesian(), &[]).unwrap();
        let z = out.adv.require(Component::Total, GridAxis::Z).unwrap();
        let surface = z.isel(Dim::Z_STAG, 0).unwrap();
        assert!(surface.values().iter().all(|v| *v == 0.0));
        // reflected flux at the lid
        let top = z.isel(Dim::Z_STAG, -1).unwrap();
        let mu = case.column_mass(0.0);
        let dn = -1.0 / case.nz as f64;
        let expected = -G * 2.0 * case.rho * 0.5 / dn / mu;
        for v in top.values().iter() {
            assert_abs_diff_eq!(*v, expected, epsilon = 1e-12);
        }
        let interior = z.isel(Dim::Z_STAG, 1).unwrap();
        assert!(interior.max_abs().unwrap() < 1e-12);
    }

    #[test]
    fn test_explicit_turbulent_fluxes_with_averaging() {
        let case = SyntheticCase::default();
        let (mut mean, vc) = setup(&case, Variable::T);
        let axes = [GridAxis::Y];
        let ctx = &vc.grid.base.stagger;
        for (dir, vel) in XYZ.iter().zip(TurbulentFlux::velocities(true)) {
            let like = mean.require(&Variable::T.adv_flux_name(*dir, false)).unwrap();
            let flux = avg_xy(like, &axes, None, ctx).unwrap().map(|_| 0.25);
            mean.insert(Variable::T.trb_flux_name(vel), flux);
        }
        let grid = vc.grid.averaged(&axes).unwrap();
        let out = adv_tend(&mean, &vc, &grid, &case.attributes(), cartesian(), &axes).unwrap();
        // explicit flux kept in x, residual along the averaging axis
        let fx = out.flux.require(Component::Turbulent, GridAxis::X).unwrap();
        assert!(fx.values().iter().all(|v| *v == 0.25));
        let total = out.flux.require(Component::Total, GridAxis::Y).unwrap();
        let fy = out.flux.require(Component::Turbulent, GridAxis::Y).unwrap();
        assert_eq!(fy, total);
        let ay = out.adv.require(Component::Turbulent, GridAxis::Y).unwrap();
        assert_eq!(ay, out.adv.require(Component::Total, GridAxis::Y).unwrap());
        assert!(!out.adv.require(Component::Total, GridAxis::X).unwrap().has_dim(Dim::Y));
    }
}
