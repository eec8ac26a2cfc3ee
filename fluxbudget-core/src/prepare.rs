//! Run preparation
//!
//! Turns the two upstream datasets (time-averaged and instantaneous model output) into
//! the aligned inputs of the budget computation:
//!
//! - the first averaged time is removed, since the instantaneous data must start one
//!   output step earlier than the averaged data
//! - the static [`BaseGrid`] is extracted and the vertical coordinates are assigned
//! - the vertical coordinate velocity `OMZN_MEAN` is derived
//! - optionally, the averaged data is re-averaged in time; if the averaged output was
//!   written at every model time step, the resolved turbulent fluxes are then computed
//!   explicitly ([`trb_fluxes`])
//! - the instantaneous data is restricted to the first time plus the averaged times

use crate::averaging::{avg_xy, coarsen_dataset, coarsen_time, expand_blocks};
use crate::config::ModelAttributes;
use crate::dataset::{Dataset, Labeled};
use crate::errors::{BudgetError, BudgetResult};
use crate::field::{Dim, GridAxis};
use crate::grid::{BaseGrid, G};
use crate::stagger::{Periodicity, StaggerContext};
use crate::variables::Variable;
use log::info;

/// Velocities of the explicitly computed turbulent fluxes and their flux directions
pub const TRB_VELOCITIES: [(GridAxis, &str); 4] = [
    (GridAxis::X, "U"),
    (GridAxis::Y, "V"),
    (GridAxis::Z, "W"),
    (GridAxis::Z, "OMZN"),
];

/// Aligned inputs of the budget computation
#[derive(Clone, Debug)]
pub struct PreparedData {
    pub mean: Dataset,
    pub inst: Dataset,
    pub grid: BaseGrid,
}

fn time_coord(data: &Dataset) -> BudgetResult<ndarray::Array1<f64>> {
    data.dim_coords()
        .remove(&Dim::TIME)
        .ok_or(BudgetError::MissingDimension { dim: Dim::TIME })
}

fn check_not_empty(data: &Dataset, name: &str) -> BudgetResult<()> {
    if let Some((dim, _)) = data.dim_coords().iter().find(|(_, c)| c.is_empty()) {
        return Err(BudgetError::config(format!(
            "Dimension {} of the {} data is empty after indexing",
            dim, name
        )));
    }
    Ok(())
}

/// Prepare the upstream datasets for the budget computation
pub fn prepare(
    mean: &Dataset,
    inst: &Dataset,
    attrs: &ModelAttributes,
    periodicity: Periodicity,
    variables: &[Variable],
    t_avg_interval: Option<usize>,
    avg_axes: &[GridAxis],
) -> BudgetResult<PreparedData> {
    info!("Prepare data");
    check_not_empty(mean, "time-averaged")?;
    check_not_empty(inst, "instantaneous")?;

    // the instantaneous data is one output step longer
    if time_coord(mean)?.len() < 2 {
        return Err(BudgetError::config(
            "Time-averaged data is empty after removing the first time step; \
             it needs at least two time steps initially",
        ));
    }
    let mean = mean.try_map_fields(|f| match f.len_of(Dim::TIME) {
        Some(n) => f.slice(Dim::TIME, 1, n),
        None => Ok(f.clone()),
    })?;

    let grid = BaseGrid::from_datasets(&mean, inst, attrs.dx, attrs.dy, periodicity)?;
    let mut mean = grid.assign_vertical_coords(&mean)?;
    let inst = grid.assign_vertical_coords(inst)?;

    if mean.contains("ZWIND_MEAN") && !mean.contains("W_MEAN") {
        mean.rename("ZWIND_MEAN", "W_MEAN")?;
    }
    let rho_w = grid
        .stagger
        .stagger(mean.require("RHOD_MEAN")?, Dim::Z, grid.coord(Dim::Z_STAG)?)?;
    let omzn = mean.require("WW_MEAN")?.div(&rho_w.scale(-G))?;
    mean.insert("OMZN_MEAN", omzn);

    if let Some(interval) = t_avg_interval {
        let series = mean.clone();
        info!("Average time-averaged data over {} output steps", interval);
        mean = coarsen_dataset(&series, interval, series.require("RHOD_MEAN")?, &grid.stagger)?;

        let times = time_coord(&series)?;
        if times.len() >= 2 && ((times[1] - times[0]).round() - attrs.dt).abs() < 1e-9 {
            info!("Compute turbulent fluxes explicitly");
            let fluxes = trb_fluxes(&mean, &series, variables, interval, &grid.stagger, avg_axes)?;
            mean.extend(fluxes);
        }
    }

    let mut keep = vec![time_coord(&inst)?[0]];
    keep.extend(time_coord(&mean)?.iter().copied());
    let inst = inst.try_map_fields(|f| f.select_times(&keep))?;

    Ok(PreparedData { mean, inst, grid })
}

/// Resolved turbulent fluxes from the complete output series.
///
/// For every variable and velocity, the perturbations of the variable and the velocity
/// about their block means are multiplied with the density, block-averaged and divided
/// by the block-mean density. The fluxes are named `F<VAR><VEL>_TRB_MEAN`.
pub fn trb_fluxes(
    blocks: &Dataset,
    series: &Dataset,
    variables: &[Variable],
    interval: usize,
    ctx: &StaggerContext,
    avg_axes: &[GridAxis],
) -> BudgetResult<Dataset> {
    let times = time_coord(series)?;
    let mut names = vec!["RHOD_MEAN".to_string(), "OMZN_MEAN".to_string()];
    for var in variables {
        for (dir, vel) in [(GridAxis::X, "U"), (GridAxis::Y, "V"), (GridAxis::Z, "W")] {
            names.push(var.staggered_mean_name(dir));
            names.push(format!("{}_MEAN", vel));
        }
    }
    let mut means = Dataset::new();
    for name in &names {
        means.insert(name.as_str(), expand_blocks(blocks.require(name)?, &times)?);
    }
    if !avg_axes.is_empty() {
        let rho = means.require("RHOD_MEAN")?.clone();
        means = avg_xy(&means, avg_axes, Some(&rho), ctx)?;
    }

    let rho_series = series.require("RHOD_MEAN")?;
    let rho_blocks = blocks.require("RHOD_MEAN")?;
    let mut out = Dataset::new();
    for var in variables {
        for (dir, vel) in TRB_VELOCITIES {
            let var_d = var.staggered_mean_name(dir);
            let vel_m = format!("{}_MEAN", vel);
            let var_pert = series.require(&var_d)?.sub(means.require(&var_d)?)?;
            let vel_pert = ctx.like(
                &series.require(&vel_m)?.sub(means.require(&vel_m)?)?,
                &var_pert,
            )?;
            let rho_stag = ctx.like(rho_series, &var_pert)?;
            let rho_stag_mean = ctx.like(rho_blocks, &var_pert)?;

            let product = rho_stag.mul(&vel_pert)?.mul(&var_pert)?;
            let mut flux = coarsen_time(&product, interval)?.div(&rho_stag_mean)?;
            if !avg_axes.is_empty() {
                flux = avg_xy(&flux, avg_axes, None, ctx)?;
            }
            out.insert(var.trb_flux_name(vel), flux);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticCase;
    use approx::assert_relative_eq;

    #[test]
    fn test_prepare_aligns_times() {
        let case = SyntheticCase::default();
        let (mean, inst) = case.build().unwrap();
        let prepared = prepare(
            &mean,
            &inst,
            &case.attributes(),
            case.periodicity(),
            &[Variable::U],
            None,
            &[],
        )
        .unwrap();
        let mean_times = time_coord(&prepared.mean).unwrap();
        let inst_times = time_coord(&prepared.inst).unwrap();
        assert_eq!(mean_times.len(), case.n_mean);
        assert_eq!(inst_times.len(), case.n_mean + 1);
        assert_relative_eq!(inst_times[1], mean_times[0]);
        assert!(prepared.mean.contains("W_MEAN"));
        assert!(!prepared.mean.contains("ZWIND_MEAN"));
        // no vertical motion
        let omzn = prepared.mean.require("OMZN_MEAN").unwrap();
        assert!(omzn.values().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_prepare_needs_two_mean_times() {
        let case = SyntheticCase::default();
        let (mean, inst) = case.build().unwrap();
        let first = mean
            .try_map_fields(|f| match f.len_of(Dim::TIME) {
                Some(_) => f.slice(Dim::TIME, 0, 1),
                None => Ok(f.clone()),
            })
            .unwrap();
        let err = prepare(
            &first,
            &inst,
            &case.attributes(),
            case.periodicity(),
            &[Variable::T],
            None,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, BudgetError::Config(_)));
    }

    #[test]
    fn test_time_averaging_with_explicit_fluxes() {
        // averaged output at every model step
        let case = SyntheticCase {
            n_mean: 4,
            interval: 10.0,
            dt: 10.0,
            ..Default::default()
        };
        let (mean, inst) = case.build().unwrap();
        let prepared = prepare(
            &mean,
            &inst,
            &case.attributes(),
            case.periodicity(),
            &[Variable::U],
            Some(2),
            &[],
        )
        .unwrap();
        let times = time_coord(&prepared.mean).unwrap();
        assert_eq!(times.len(), 2);
        assert_eq!(time_coord(&prepared.inst).unwrap().len(), 3);
        for (_, vel) in TRB_VELOCITIES {
            let flux = prepared.mean.require(&Variable::U.trb_flux_name(vel)).unwrap();
            assert_eq!(flux.coord(Dim::TIME).unwrap().len(), 2);
        }
        // v and w are zero, so their turbulent fluxes vanish
        let fv = prepared.mean.require("FUV_TRB_MEAN").unwrap();
        assert!(fv.values().iter().all(|v| v.abs() < 1e-12));
    }
}
