//! Total tendencies and the budget pipeline
//!
//! [`calc_tendencies`] drives a complete run: it checks which outputs already exist,
//! prepares the input data, computes the budget of every variable under every budget
//! method and writes the packaged results into an [`OutputStore`]. With chunking
//! configured, the domain is split into tiles that are processed by parallel workers
//! and merged into full-domain containers.
//!
//! For each variable the budget closes as
//!
//! ```text
//! tendency = sum over X, Y, Z of adv_r + sum of SGS tendencies + sum of sources
//! ```
//!
//! and both sides are stored in the `tend` container as `<method>/tendency` and
//! `<method>/forcing`.

use crate::advection::adv_tend;
use crate::averaging::avg_xy;
use crate::budget::Component;
use crate::cartesian::cartesian_corrections;
use crate::config::{BudgetMethod, BudgetSettings, ModelAttributes, RunConfig};
use crate::dataset::Dataset;
use crate::errors::{BudgetError, BudgetResult};
use crate::field::{Field, GridAxis};
use crate::grid::{inst_time_step, VariableContext, VariableGrid, RV_OVER_RD, THETA_REF};
use crate::output::{package, OutputKind, VariableBudget, VariableOutput};
use crate::prepare::{prepare, PreparedData};
use crate::scheduler::run_tiles;
use crate::sgs::calc_tend_sources;
use crate::stagger::Periodicity;
use crate::store::{OutputKey, OutputStore};
use crate::tiles::{create_tiles, merge_tile, Tile};
use crate::variables::Variable;
use log::info;
use std::collections::BTreeMap;

/// Instantaneous values of the prognostic variable
fn prognostic(inst: &Dataset, variable: Variable, attrs: &ModelAttributes) -> BudgetResult<Field> {
    match variable {
        Variable::T if attrs.moist_theta() => match inst.get("THM") {
            Some(thm) => Ok(thm.clone()),
            None => {
                let qv = inst.require("QVAPOR")?;
                inst.require("T")?
                    .offset(THETA_REF)
                    .mul(&qv.scale(RV_OVER_RD).offset(1.0))
                    .map(|f| f.offset(-THETA_REF))
            }
        },
        Variable::T => Ok(inst.require("T")?.clone()),
        Variable::Q => Ok(inst.require("QVAPOR")?.clone()),
        _ => Ok(inst.require(variable.upper())?.clone()),
    }
}

/// Time derivative of the density-coupled variable over each output interval.
///
/// The variable is coupled to the dry-air mass, or to the density with `dz_out`, and
/// normalised by the time mean of the same factor taken from `grid`.
pub fn total_tendency(
    inst: &Dataset,
    vc: &VariableContext,
    grid: &VariableGrid,
    attrs: &ModelAttributes,
    settings: BudgetSettings,
    avg_axes: &[GridAxis],
) -> BudgetResult<Field> {
    let var = prognostic(inst, vc.variable, attrs)?;
    let (coupling, norm) = if settings.dz_out() {
        (&vc.inst.rhod_stag, &grid.rhod_stag_mean)
    } else {
        (&vc.inst.mu_stag, &grid.mu_stag_mean)
    };
    let dt = inst_time_step(inst)?;
    let mut tend = var.mul(coupling)?.diff_time()?.scale(1.0 / dt);
    if !avg_axes.is_empty() {
        tend = avg_xy(&tend, avg_axes, None, &grid.base.stagger)?;
    }
    tend.div(norm)
}

/// Budget of one variable under all `methods`
pub fn variable_budget(
    data: &PreparedData,
    variable: Variable,
    attrs: &ModelAttributes,
    methods: &[BudgetMethod],
    avg_axes: &[GridAxis],
) -> BudgetResult<VariableBudget> {
    info!("Process variable {}", variable.upper());
    let vc = VariableContext::derive(&data.grid, variable, &data.mean, &data.inst, avg_axes)?;
    let sources = calc_tend_sources(&data.mean, &vc, attrs, avg_axes)?;
    let grid = if avg_axes.is_empty() {
        vc.grid.clone()
    } else {
        vc.grid.averaged(avg_axes)?
    };

    let mut adv_out = Dataset::new();
    let mut flux_out = Dataset::new();
    let mut tend_out = Dataset::new();
    let mut corr_out = Dataset::new();
    for method in methods {
        info!("Budget method: {}", method);
        let settings = method.settings;
        settings.validate()?;

        let mut tend = total_tendency(&data.inst, &vc, &grid, attrs, settings, avg_axes)?;
        let advection = adv_tend(&data.mean, &vc, &grid, attrs, settings, avg_axes)?;
        let mut adv = advection.adv.clone();
        if settings.cartesian {
            let corrected = cartesian_corrections(
                variable,
                &advection,
                data.mean.require("RHOD_MEAN")?,
                &grid,
                &adv,
                &tend,
                settings,
                avg_axes,
            )?;
            adv = corrected.adv;
            tend = corrected.tend;
            corr_out.extend(corrected.dcorr_dz.to_dataset(&method.label));
        }
        let forcing = adv.sum_dirs(Component::Total)?.add(&sources.sources_sum)?;

        adv_out.extend(adv.to_dataset(&method.label));
        for comp in Component::ALL {
            if !adv.dirs(comp).is_empty() {
                adv_out.insert(format!("{}/{}/sum", method.label, comp), adv.sum_dirs(comp)?);
            }
        }
        flux_out.extend(advection.flux.to_dataset(&method.label));
        tend_out.insert(format!("{}/tendency", method.label), tend);
        tend_out.insert(format!("{}/forcing", method.label), forcing);
    }

    let any_cartesian = methods.iter().any(|m| m.settings.cartesian);
    Ok(VariableBudget {
        variable,
        grid,
        adv: adv_out,
        flux: flux_out,
        tend: tend_out,
        sources: sources.sources,
        sgs: sources.sgs,
        sgsflux: sources.sgsflux,
        corr: any_cartesian.then_some(corr_out),
    })
}

/// Prepare the data of one domain (or tile) and package the budget of every variable
fn process_domain(
    mean: &Dataset,
    inst: &Dataset,
    attrs: &ModelAttributes,
    periodicity: Periodicity,
    config: &RunConfig,
    variables: &[Variable],
) -> BudgetResult<Vec<(Variable, VariableOutput)>> {
    let methods = config.methods()?;
    let data = prepare(
        mean,
        inst,
        attrs,
        periodicity,
        variables,
        config.t_avg_interval,
        config.avg_axes(),
    )?;
    variables
        .iter()
        .map(|&variable| {
            let budget = variable_budget(&data, variable, attrs, &methods, config.avg_axes())?;
            Ok((variable, package(budget, attrs)?))
        })
        .collect()
}

fn output_keys(config: &RunConfig, variable: Variable) -> Vec<OutputKey> {
    let suffix = config.output_suffix();
    OutputKind::produced(config.any_cartesian())
        .into_iter()
        .map(|kind| OutputKey::new(variable, kind, suffix.clone()))
        .collect()
}

/// Variables whose output is incomplete. Without `skip_exist`, existing output of all
/// variables is removed first.
fn pending_variables(config: &RunConfig, store: &dyn OutputStore) -> BudgetResult<Vec<Variable>> {
    let mut pending = Vec::new();
    for &variable in &config.variables {
        let mut complete = true;
        for key in output_keys(config, variable) {
            if !store.exists(&key)? {
                complete = false;
            } else if !config.skip_exist {
                store.remove(&key)?;
            }
        }
        if !complete || !config.skip_exist {
            pending.push(variable);
        } else {
            info!("Output of {} already available", variable.upper());
        }
    }
    Ok(pending)
}

/// Load all containers of `variable` from the store
pub fn load_output(
    config: &RunConfig,
    variable: Variable,
    store: &dyn OutputStore,
) -> BudgetResult<VariableOutput> {
    output_keys(config, variable)
        .into_iter()
        .map(|key| {
            let container = store
                .get(&key)?
                .ok_or_else(|| BudgetError::missing(key.relative_path().display().to_string()))?;
            Ok((key.kind, container))
        })
        .collect()
}

fn process_tile(
    tile: &Tile,
    mean: &Dataset,
    inst: &Dataset,
    attrs: &ModelAttributes,
    config: &RunConfig,
    variables: &[Variable],
    store: &dyn OutputStore,
) -> BudgetResult<()> {
    let full_coords = mean.dim_coords();
    let periodicity = tile.periodicity(attrs.periodicity());
    let mean_tile = tile.select(mean)?;
    let inst_tile = tile.select(inst)?;
    let outputs = process_domain(&mean_tile, &inst_tile, attrs, periodicity, config, variables)?;

    info!("Save tile {}", tile.task);
    let suffix = config.output_suffix();
    for (variable, output) in outputs {
        for (kind, container) in output {
            let part = container.try_map_fields(|f| tile.trim(f))?;
            let key = OutputKey::new(variable, kind, suffix.clone());
            store.update(key, &mut |full| merge_tile(full, &part, tile, &full_coords))?;
        }
    }
    Ok(())
}

/// Compute, store and return the budgets of all configured variables.
///
/// `mean` and `inst` are the time-averaged and instantaneous model output; `inst` must
/// start one output step before `mean`. Variables with complete output in `store` are
/// not recomputed if `config.skip_exist` is set.
pub fn calc_tendencies(
    mean: &Dataset,
    inst: &Dataset,
    attrs: &ModelAttributes,
    config: &RunConfig,
    store: &dyn OutputStore,
) -> BudgetResult<BTreeMap<Variable, VariableOutput>> {
    config.validate()?;
    let pending = pending_variables(config, store)?;

    if pending.is_empty() {
        info!("Postprocessed output already available");
    } else {
        let chunks = config.chunk_axes()?;
        let tiles = if chunks.is_empty() {
            vec![]
        } else {
            create_tiles(&mean.dim_coords(), &chunks, attrs.periodicity())?
        };

        if tiles.is_empty() {
            let outputs =
                process_domain(mean, inst, attrs, attrs.periodicity(), config, &pending)?;
            info!("Save data");
            let suffix = config.output_suffix();
            for (variable, output) in outputs {
                for (kind, container) in output {
                    store.put(OutputKey::new(variable, kind, suffix.clone()), container)?;
                }
            }
            store.flush()?;
        } else {
            info!("Process {} tiles with {} workers", tiles.len(), config.workers);
            run_tiles(&tiles, config.workers, store, |tile| {
                process_tile(tile, mean, inst, attrs, config, &pending, store)
            })?;
        }
    }

    info!("Load entire postprocessed output");
    config
        .variables
        .iter()
        .map(|&variable| Ok((variable, load_output(config, variable, store)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::synthetic::SyntheticCase;
    use approx::assert_abs_diff_eq;

    fn run_config(variables: Vec<Variable>, methods: &[&str]) -> RunConfig {
        RunConfig {
            variables,
            budget_methods: methods.iter().map(|m| m.to_string()).collect(),
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_total_tendency_of_accelerating_wind() {
        let case = SyntheticCase::default();
        let (mean, inst) = case.build().unwrap();
        let attrs = case.attributes();
        let data = prepare(&mean, &inst, &attrs, case.periodicity(), &[Variable::U], None, &[])
            .unwrap();
        let vc = VariableContext::derive(&data.grid, Variable::U, &data.mean, &data.inst, &[])
            .unwrap();
        let tend = total_tendency(
            &data.inst,
            &vc,
            &vc.grid,
            &attrs,
            BudgetSettings::default(),
            &[],
        )
        .unwrap();
        assert_eq!(tend.len_of(crate::field::Dim::TIME), Some(case.n_mean));
        for v in tend.values().iter() {
            assert_abs_diff_eq!(*v, case.u_trend, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_budget_containers() {
        let case = SyntheticCase::default();
        let (mean, inst) = case.build().unwrap();
        let config = run_config(vec![Variable::T], &["", "cartesian"]);
        let store = MemoryStore::new();
        let out = calc_tendencies(&mean, &inst, &case.attributes(), &config, &store).unwrap();
        let t = &out[&Variable::T];
        assert_eq!(t.len(), 8);

        let tend = &t[&OutputKind::Tend].data;
        assert_eq!(
            tend.names().collect::<Vec<_>>(),
            vec!["native/tendency", "native/forcing", "cartesian/tendency", "cartesian/forcing"]
        );
        let adv = &t[&OutputKind::Adv].data;
        assert!(adv.contains("cartesian/adv_r/sum"));
        assert!(adv.contains("native/trb_r/Z"));
        // only Cartesian methods have corrections
        let corr = &t[&OutputKind::Corr].data;
        assert!(corr.names().all(|n| n.starts_with("cartesian/")));
        assert!(t[&OutputKind::Flux].coords.contains("zfx"));
        assert!(t[&OutputKind::Sources].coords.contains("z"));
    }

    #[test]
    fn test_existing_output_is_skipped() {
        let case = SyntheticCase::default();
        let (mean, inst) = case.build().unwrap();
        let attrs = case.attributes();
        let config = run_config(vec![Variable::Q], &[""]);
        let store = MemoryStore::new();
        let first = calc_tendencies(&mean, &inst, &attrs, &config, &store).unwrap();

        // inputs are not touched when everything exists
        let empty = Dataset::new();
        let second = calc_tendencies(&empty, &empty, &attrs, &config, &store).unwrap();
        let kinds = |out: &BTreeMap<Variable, VariableOutput>| -> Vec<OutputKind> {
            out[&Variable::Q].keys().copied().collect()
        };
        assert_eq!(kinds(&first), kinds(&second));
        assert_eq!(
            first[&Variable::Q][&OutputKind::Tend].description,
            second[&Variable::Q][&OutputKind::Tend].description
        );

        let recompute = RunConfig {
            skip_exist: false,
            ..config
        };
        let err = calc_tendencies(&empty, &empty, &attrs, &recompute, &store).unwrap_err();
        assert!(!matches!(err, BudgetError::Worker { .. }));
        // forced recomputation removed the old output
        assert!(store.keys().unwrap().is_empty());
    }
}
