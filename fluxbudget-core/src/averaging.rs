//! Horizontal and temporal averaging
//!
//! [`avg_xy`] averages over horizontal axes regardless of whether a field carries the
//! staggered or unstaggered variant of the axis. [`coarsen_time`] re-averages a time
//! series over blocks of consecutive steps. Both optionally weight by density.

use crate::dataset::{Dataset, Labeled};
use crate::errors::{BudgetError, BudgetResult};
use crate::field::{coords_equal, Dim, Field, GridAxis};
use crate::stagger::StaggerContext;
use ndarray::Array1;

/// Both variants of every axis in `axes` that `field` carries
fn present_dims(field: &Field, axes: &[GridAxis]) -> Vec<Dim> {
    field
        .dims()
        .iter()
        .copied()
        .filter(|d| axes.contains(&d.axis))
        .collect()
}

/// Drop the boundary points that must not enter a horizontal average.
///
/// Bounded axes lose their first and last point in both variants. Periodic axes only
/// lose the duplicated last face of the staggered variant.
fn cut_boundaries(field: &Field, axes: &[GridAxis], ctx: &StaggerContext) -> BudgetResult<Field> {
    let mut out = field.clone();
    for &axis in axes {
        let periodic = ctx.periodicity.is_periodic(axis);
        for dim in [Dim::new(axis, false), Dim::new(axis, true)] {
            let n = match out.len_of(dim) {
                Some(n) => n,
                None => continue,
            };
            if !periodic {
                let (start, stop) = if n >= 2 { (1, n - 1) } else { (0, 0) };
                out = out.slice(dim, start, stop)?;
            } else if dim.staggered && n >= 1 {
                out = out.slice(dim, 0, n - 1)?;
            }
        }
    }
    Ok(out)
}

fn avg_field(
    data: &Field,
    axes: &[GridAxis],
    rho: Option<&Field>,
    ctx: &StaggerContext,
) -> BudgetResult<Field> {
    match rho {
        None => {
            let cut = cut_boundaries(data, axes, ctx)?;
            let dims = present_dims(&cut, axes);
            Ok(cut.nanmean(&dims))
        }
        Some(rho) => {
            let rho_s = weights_like(rho, data, ctx)?;
            let rho_mean = avg_field(&rho_s, axes, None, ctx)?;
            let weighted = cut_boundaries(&rho_s, axes, ctx)?
                .mul(&cut_boundaries(data, axes, ctx)?)?;
            let dims = present_dims(&weighted, axes);
            weighted.nanmean(&dims).div(&rho_mean)
        }
    }
}

/// Density staggered onto the grid of `data`.
///
/// Missing boundary values along newly staggered bounded horizontal axes are filled
/// from their nearest neighbour.
fn weights_like(rho: &Field, data: &Field, ctx: &StaggerContext) -> BudgetResult<Field> {
    let mut rho_s = ctx.like(rho, data)?;
    let new_dims: Vec<Dim> = rho_s
        .dims()
        .iter()
        .copied()
        .filter(|d| !rho.has_dim(*d) && d.axis.is_horizontal())
        .filter(|d| !ctx.periodicity.is_periodic(d.axis))
        .collect();
    for d in new_dims {
        rho_s = rho_s.ffill(d)?.bfill(d)?;
    }
    Ok(rho_s)
}

/// Average over the horizontal `axes`, covering both variants of each axis.
///
/// With `rho`, the average is density-weighted: `mean(rho * f) / mean(rho)` with the
/// density staggered onto the grid of each field. Missing values are skipped.
pub fn avg_xy<L: Labeled>(
    data: &L,
    axes: &[GridAxis],
    rho: Option<&Field>,
    ctx: &StaggerContext,
) -> BudgetResult<L> {
    if let Some(bad) = axes.iter().find(|a| !a.is_horizontal()) {
        return Err(BudgetError::config(format!(
            "cannot average horizontally over {}",
            bad
        )));
    }
    data.try_map_fields(|f| avg_field(f, axes, rho, ctx))
}

/// Non-weighted block mean over `interval` consecutive time steps.
///
/// Each block is labelled with its last time; an incomplete trailing block is dropped.
/// Fields without a time dimension are returned unchanged.
pub fn coarsen_time(field: &Field, interval: usize) -> BudgetResult<Field> {
    if interval == 0 {
        return Err(BudgetError::config("averaging interval must be positive"));
    }
    let times = match field.coord(Dim::TIME) {
        Some(t) => t.clone(),
        None => return Ok(field.clone()),
    };
    let blocks = times.len() / interval;
    if blocks == 0 {
        return Err(BudgetError::config(format!(
            "averaging interval {} is longer than the {} available time steps",
            interval,
            times.len()
        )));
    }
    let coord: Array1<f64> = (0..blocks).map(|b| times[(b + 1) * interval - 1]).collect();
    field.map_lanes(Dim::TIME, Dim::TIME, coord, |d, mut out| {
        for b in 0..blocks {
            let block = (b * interval..(b + 1) * interval).map(|i| d[i]).filter(|v| !v.is_nan());
            let (sum, count) = block.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
            out[b] = if count > 0 { sum / count as f64 } else { f64::NAN };
        }
    })
}

/// Spread block means back onto the time steps they were averaged from.
///
/// Each time in `times` takes the value of the first block labelled at or after it;
/// times after the last block are missing.
pub fn expand_blocks(blocks: &Field, times: &Array1<f64>) -> BudgetResult<Field> {
    let labels = match blocks.coord(Dim::TIME) {
        Some(l) => l.clone(),
        None => return Ok(blocks.clone()),
    };
    let index: Vec<Option<usize>> = times
        .iter()
        .map(|t| {
            labels
                .iter()
                .position(|l| *l >= *t || coords_equal(*l, *t))
        })
        .collect();
    blocks.map_lanes(Dim::TIME, Dim::TIME, times.clone(), |d, mut out| {
        for (i, j) in index.iter().enumerate() {
            if let Some(j) = j {
                out[i] = d[*j];
            }
        }
    })
}

/// Whether a time-averaged variable is density-weighted when re-averaged in time
pub fn is_density_weighted(name: &str) -> bool {
    const EXCLUDE: [&str; 6] = ["CORR", "TEND", "RHOD_MEAN", "MUT_MEAN", "WW_MEAN", "_VAR"];
    name.contains("_MEAN") && name != "Z_MEAN" && EXCLUDE.iter().all(|e| !name.contains(e))
}

/// Re-average every member of `data` over blocks of `interval` time steps.
///
/// Members selected by [`is_density_weighted`] are weighted with `rho` staggered
/// onto their grid.
pub fn coarsen_dataset(
    data: &Dataset,
    interval: usize,
    rho: &Field,
    ctx: &StaggerContext,
) -> BudgetResult<Dataset> {
    let mut out = Dataset::new();
    for (name, field) in data.iter() {
        let averaged = if is_density_weighted(name) {
            let rho_s = ctx.like(rho, field)?;
            let rho_mean = coarsen_time(&rho_s, interval)?;
            coarsen_time(&rho_s.mul(field)?, interval)?.div(&rho_mean)?
        } else {
            coarsen_time(field, interval)?
        };
        out.insert(name, averaged);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stagger::{Periodicity, VerticalStagger};
    use approx::assert_relative_eq;
    use is_close::is_close;
    use ndarray::{array, Array};

    fn centres(n: usize) -> Array1<f64> {
        Array::range(0.5, n as f64, 1.0)
    }

    fn faces(n: usize) -> Array1<f64> {
        Array::range(0.0, n as f64 + 0.5, 1.0)
    }

    fn ctx(periodic: bool) -> StaggerContext {
        StaggerContext::new(Periodicity::new(periodic, periodic), VerticalStagger::midpoint())
    }

    #[test]
    fn test_bounded_average_cuts_both_boundaries() {
        let f = Field::from_fn(vec![(Dim::X, centres(5))], |p| p.get(Dim::X)).unwrap();
        let m = avg_xy(&f, &[GridAxis::X], None, &ctx(false)).unwrap();
        // points 1.5, 2.5, 3.5
        assert_eq!(m.scalar_value(), Some(2.5));
    }

    #[test]
    fn test_periodic_average_cuts_last_face() {
        let f = Field::from_fn(vec![(Dim::X_STAG, faces(4))], |p| p.get(Dim::X_STAG)).unwrap();
        let m = avg_xy(&f, &[GridAxis::X], None, &ctx(true)).unwrap();
        // faces 0..3, the duplicate face 4 is dropped
        assert_eq!(m.scalar_value(), Some(1.5));

        let c = Field::from_fn(vec![(Dim::X, centres(4))], |p| p.get(Dim::X)).unwrap();
        let mc = avg_xy(&c, &[GridAxis::X], None, &ctx(true)).unwrap();
        assert_eq!(mc.scalar_value(), Some(2.0));
    }

    #[test]
    fn test_average_keeps_other_axes() {
        let f = Field::from_fn(vec![(Dim::Z, centres(2)), (Dim::Y, centres(3))], |p| {
            p.get(Dim::Z) * 10.0 + p.get(Dim::Y)
        })
        .unwrap();
        let m = avg_xy(&f, &[GridAxis::X, GridAxis::Y], None, &ctx(true)).unwrap();
        assert_eq!(m.dims(), &[Dim::Z]);
        assert_relative_eq!(m.values()[1], 16.5);
    }

    #[test]
    fn test_density_weighted_average() {
        let rho = Field::new(vec![Dim::X], vec![centres(2)], array![1.0, 3.0].into_dyn()).unwrap();
        let f = Field::new(vec![Dim::X], vec![centres(2)], array![2.0, 4.0].into_dyn()).unwrap();
        let m = avg_xy(&f, &[GridAxis::X], Some(&rho), &ctx(true)).unwrap();
        let v = m.scalar_value().unwrap();
        assert!(is_close!(v, (2.0 + 12.0) / 4.0), "Expected 3.5, got {}", v);

        // constant field is unaffected by the weighting, also on a staggered grid
        let g = Field::full(vec![(Dim::X_STAG, faces(2))], 7.0).unwrap();
        let mg = avg_xy(&g, &[GridAxis::X], Some(&rho), &ctx(false)).unwrap();
        assert_relative_eq!(mg.scalar_value().unwrap(), 7.0);
    }

    #[test]
    fn test_vertical_axis_rejected() {
        let f = Field::full(vec![(Dim::Z, centres(2))], 1.0).unwrap();
        assert!(matches!(
            avg_xy(&f, &[GridAxis::Z], None, &ctx(true)),
            Err(BudgetError::Config(_))
        ));
    }

    #[test]
    fn test_coarsen_labels_blocks_with_last_time() {
        let t = Array::range(0.0, 7.0, 1.0);
        let f = Field::from_fn(vec![(Dim::TIME, t)], |p| p.get(Dim::TIME)).unwrap();
        let c = coarsen_time(&f, 3).unwrap();
        assert_eq!(c.coord(Dim::TIME).unwrap().to_vec(), vec![2.0, 5.0]);
        assert_eq!(c.values().as_slice().unwrap(), &[1.0, 4.0]);
        assert!(coarsen_time(&f, 8).is_err());
    }

    #[test]
    fn test_expand_blocks_back_fills() {
        let t = Array::range(1.0, 7.0, 1.0);
        let f = Field::from_fn(vec![(Dim::TIME, t.clone())], |p| p.get(Dim::TIME)).unwrap();
        let blocks = coarsen_time(&f, 2).unwrap();
        let e = expand_blocks(&blocks, &t).unwrap();
        assert_eq!(e.values().as_slice().unwrap(), &[1.5, 1.5, 3.5, 3.5, 5.5, 5.5]);

        let short = blocks.slice(Dim::TIME, 0, 2).unwrap();
        let e = expand_blocks(&short, &t).unwrap();
        assert!(e.values()[4].is_nan());
    }

    #[test]
    fn test_density_weighting_selection() {
        assert!(is_density_weighted("U_MEAN"));
        assert!(is_density_weighted("FTX_ADV_MEAN"));
        assert!(!is_density_weighted("Z_MEAN"));
        assert!(!is_density_weighted("RHOD_MEAN"));
        assert!(!is_density_weighted("T_TEND_MP_MEAN"));
        assert!(!is_density_weighted("FTX_CORR"));
        assert!(!is_density_weighted("U"));
    }
}
