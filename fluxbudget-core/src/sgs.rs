//! SGS and source tendencies
//!
//! The sub-grid-scale (SGS) fluxes are converted to tendencies by taking the
//! density-weighted flux divergence. In the horizontal directions a correction term is
//! added that accounts for the tilt of the terrain-following coordinate: the vertical
//! derivative of the horizontal flux multiplied by the slope of the coordinate surfaces.
//!
//! The remaining non-advective sources depend on the variable:
//!
//! | variable | sources                                        |
//! |----------|------------------------------------------------|
//! | `t`      | microphysics, longwave and shortwave radiation |
//! | `q`      | microphysics                                   |
//! | `u, v, w`| pressure gradient, Coriolis and curvature      |

use crate::averaging::avg_xy;
use crate::budget::{XY, XYZ};
use crate::config::ModelAttributes;
use crate::dataset::Dataset;
use crate::errors::BudgetResult;
use crate::field::{Dim, Field, GridAxis};
use crate::grid::{MapFactors, VariableContext, VariableGrid, G, RV_OVER_RD};
use crate::stagger::{destagger, stagger};
use crate::variables::Variable;
use log::info;

/// SGS and source tendencies of one variable
#[derive(Clone, Debug, PartialEq)]
pub struct SourceTerms {
    /// SGS tendency per direction (`X`, `Y`, `Z`)
    pub sgs: Dataset,
    /// SGS flux per direction
    pub sgsflux: Dataset,
    /// Non-advective tendencies per source kind
    pub sources: Dataset,
    /// Sum of all sources and all SGS tendencies
    pub sources_sum: Field,
}

/// Tendencies from the SGS fluxes in all three directions.
///
/// Returns the tendencies and the fluxes, both keyed by direction. For `w`, the
/// tendency vanishes at the surface and at the model top.
pub fn sgs_tendency(
    mean: &Dataset,
    variable: Variable,
    grid: &VariableGrid,
    mapfac: &MapFactors,
) -> BudgetResult<(Dataset, Dataset)> {
    let base = &grid.base;
    let ctx = &base.stagger;
    let is_w = variable == Variable::W;
    // vertical dimension of the flux and of the variable
    let (flux_z, var_z, dn) = if is_w {
        (Dim::Z, Dim::Z_STAG, &base.dn)
    } else {
        (Dim::Z_STAG, Dim::Z, &base.dnw)
    };
    let rhod = mean.require("RHOD_MEAN")?;

    let mut sgs = Dataset::new();
    let mut sgsflux = Dataset::new();

    let fz = mean.require(&variable.sgs_flux_name(GridAxis::Z))?;
    let rhoz = ctx.like(rhod, fz)?;
    let tend_z = ctx
        .diff(&fz.mul(&rhoz)?, flux_z, base.coord(var_z)?)?
        .div(dn)?
        .div(&grid.mu_stag_mean)?
        .scale(G);

    for dir in XY {
        let fd = mean.require(&variable.sgs_flux_name(dir))?;
        sgsflux.insert(dir.label(), fd.clone());
        let fd = fd.mul(&ctx.like(rhod, fd)?)?;

        // (de)stagger the flux horizontally onto the variable grid
        let dim = Dim::new(dir, false);
        let (flux_dim, var_dim) = if fd.has_dim(dim) {
            (dim, dim.to_staggered())
        } else {
            (dim.to_staggered(), dim)
        };
        let flux8v = if flux_dim.staggered {
            destagger(&fd, flux_dim, base.coord(var_dim)?)?
        } else {
            ctx.stagger(&fd, flux_dim, base.coord(var_dim)?)?
        };

        // and vertically onto the grid of the vertical flux
        let flux8z = if is_w {
            destagger(&flux8v, Dim::Z_STAG, base.coord(Dim::Z)?)?
        } else {
            let mut f = stagger(
                &flux8v,
                Dim::Z,
                base.coord(Dim::Z_STAG)?,
                false,
                &ctx.vertical,
            )?;
            f.fill_index(Dim::Z_STAG, 0, 0.0)?;
            f.fill_index(Dim::Z_STAG, -1, 0.0)?;
            f
        };
        let corr = ctx
            .diff(&flux8z, flux_z, base.coord(var_z)?)?
            .div(dn)?;
        let corr = corr.mul(&ctx.like(grid.dzdd(dir)?, &corr)?)?;

        let m = mapfac.along(dir);
        let horizontal = ctx
            .diff(&fd, flux_dim, base.coord(var_dim)?)?
            .mul(m)?
            .scale(-1.0 / base.spacing(dir)?);
        let m_corr = if is_w { &mapfac.y } else { m };
        let tend = horizontal
            .div(&grid.rhod_stag_mean)?
            .add(&corr.mul(m_corr)?.div(&grid.mu_stag_mean)?.scale(-G))?;
        sgs.insert(dir.label(), tend);
    }
    sgs.insert(GridAxis::Z.label(), tend_z);
    sgsflux.insert(GridAxis::Z.label(), fz.clone());

    if is_w {
        for dir in XYZ {
            if let Some(f) = sgs.get_mut(dir.label()) {
                f.fill_index(Dim::Z_STAG, 0, 0.0)?;
                f.fill_index(Dim::Z_STAG, -1, 0.0)?;
            }
        }
    }
    Ok((sgs, sgsflux))
}

/// Non-advective source tendencies of `variable`, keyed by source kind
pub fn source_terms(
    mean: &Dataset,
    variable: Variable,
    attrs: &ModelAttributes,
) -> BudgetResult<Dataset> {
    let mut sources = Dataset::new();
    match variable {
        Variable::T => {
            let kinds = [
                ("mp", "T_TEND_MP_MEAN"),
                ("rad_lw", "T_TEND_RADLW_MEAN"),
                ("rad_sw", "T_TEND_RADSW_MEAN"),
            ];
            for (kind, name) in kinds {
                sources.insert(kind, mean.require(name)?.clone());
            }
            if attrs.moist_theta() {
                // dry to moist potential temperature
                let factor = mean.require("Q_MEAN")?.scale(RV_OVER_RD).offset(1.0);
                let mut moist = Dataset::new();
                for (kind, f) in sources.iter() {
                    moist.insert(kind, f.mul(&factor)?);
                }
                let coupling = mean
                    .require("Q_TEND_MP_MEAN")?
                    .mul(mean.require("T_MEAN")?)?
                    .scale(RV_OVER_RD);
                let mp = moist.require("mp")?.add(&coupling)?;
                moist.insert("mp", mp);
                sources = moist;
            }
        }
        Variable::Q => {
            sources.insert("mp", mean.require("Q_TEND_MP_MEAN")?.clone());
        }
        momentum => {
            let v = momentum.upper();
            sources.insert("pg", mean.require(&format!("{}_TEND_PG_MEAN", v))?.clone());
            sources.insert(
                "cor_curv",
                mean.require(&format!("{}_TEND_COR_CURV_MEAN", v))?.clone(),
            );
        }
    }
    Ok(sources)
}

/// SGS tendencies, source terms and their sum, averaged horizontally over `avg_axes`
pub fn calc_tend_sources(
    mean: &Dataset,
    vc: &VariableContext,
    attrs: &ModelAttributes,
    avg_axes: &[GridAxis],
) -> BudgetResult<SourceTerms> {
    info!("Compute SGS and additional tendencies");
    let mut sources = source_terms(mean, vc.variable, attrs)?;
    let (mut sgs, mut sgsflux) = sgs_tendency(mean, vc.variable, &vc.grid, &vc.mapfac)?;

    if !avg_axes.is_empty() {
        let ctx = &vc.grid.base.stagger;
        sources = avg_xy(&sources, avg_axes, None, ctx)?;
        sgs = avg_xy(&sgs, avg_axes, None, ctx)?;
        sgsflux = avg_xy(&sgsflux, avg_axes, None, ctx)?;
    }
    let sources_sum = sources.sum()?.add(&sgs.sum()?)?;

    Ok(SourceTerms {
        sgs,
        sgsflux,
        sources,
        sources_sum,
    })
}
