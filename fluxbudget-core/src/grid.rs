//! Grid context
//!
//! The grid is built in two stages, each a pure function returning a new value:
//!
//! 1. [`BaseGrid::from_datasets`] extracts the static, time-independent description of the
//!    model grid: vertical coordinates on half and full levels, level spacings, the
//!    hybrid-coordinate coefficients, vertical staggering weights and extrapolation
//!    constants, horizontal grid spacings and the coordinates of every dimension.
//! 2. [`VariableContext::derive`] adds everything that depends on the variable being
//!    processed: dry-air mass and density staggered onto the variable's grid, the
//!    derivatives of height with respect to x, y and t, heights on the variable grid,
//!    map-scale factors, and the instantaneous density couplings used for the total
//!    tendency.
//!
//! With horizontal averaging, [`VariableGrid::averaged`] returns the averaged copy of
//! the derived grid.

use crate::averaging::avg_xy;
use crate::dataset::Dataset;
use crate::errors::{BudgetError, BudgetResult};
use crate::field::{Dim, Field, GridAxis};
use crate::stagger::{Extrapolation, Periodicity, StaggerContext, VerticalStagger};
use crate::variables::Variable;
use ndarray::{Array1, ArrayD, IxDyn};
use std::collections::BTreeMap;

/// Gravitational acceleration (m s-2)
pub const G: f64 = 9.81;
/// Ratio of the gas constants of water vapour and dry air
pub const RV_OVER_RD: f64 = 461.6 / 287.04;
/// Reference potential temperature subtracted from the prognostic temperature (K)
pub const THETA_REF: f64 = 300.0;

/// Field without its time dimension (first time step), as used for static grid data
pub fn static_field(data: &Dataset, name: &str) -> BudgetResult<Field> {
    let field = data.require(name)?;
    if field.has_dim(Dim::TIME) {
        field.isel(Dim::TIME, 0)
    } else {
        Ok(field.clone())
    }
}

fn static_profile(data: &Dataset, name: &str) -> BudgetResult<Array1<f64>> {
    let field = static_field(data, name)?;
    if field.ndim() != 1 {
        return Err(BudgetError::InvalidField(format!(
            "{} must be a vertical profile, got dimensions {:?}",
            name,
            field.dims()
        )));
    }
    Ok(field.values().iter().copied().collect())
}

fn static_scalar(data: &Dataset, name: &str) -> BudgetResult<f64> {
    static_field(data, name)?
        .scalar_value()
        .ok_or_else(|| BudgetError::InvalidField(format!("{} must be a scalar", name)))
}

fn profile(dim: Dim, coord: &Array1<f64>, values: Array1<f64>) -> BudgetResult<Field> {
    Field::new(vec![dim], vec![coord.clone()], values.into_dyn())
}

/// Time-independent description of the model grid
#[derive(Clone, Debug, PartialEq)]
pub struct BaseGrid {
    /// Level spacing between full levels, on half levels
    pub dnw: Field,
    /// Level spacing between half levels, on full levels (last value missing)
    pub dn: Field,
    pub c1h: Field,
    pub c2h: Field,
    pub c1f: Field,
    pub c2f: Field,
    pub dx: f64,
    pub dy: f64,
    /// Boundary policy and vertical weights for every staggering operation
    pub stagger: StaggerContext,
    coords: BTreeMap<Dim, Array1<f64>>,
}

impl BaseGrid {
    /// Build the grid from the instantaneous output.
    ///
    /// Horizontal coordinates are taken from both datasets; the vertical coordinates
    /// become the half-level (`ZNU`) and full-level (`ZNW`) values.
    pub fn from_datasets(
        mean: &Dataset,
        inst: &Dataset,
        dx: f64,
        dy: f64,
        periodicity: Periodicity,
    ) -> BudgetResult<Self> {
        let znu = static_profile(inst, "ZNU")?;
        let znw = static_profile(inst, "ZNW")?;
        let nz = znu.len();
        if znw.len() != nz + 1 {
            return Err(BudgetError::ShapeMismatch {
                dim: Dim::Z_STAG,
                left: nz + 1,
                right: znw.len(),
            });
        }

        let half = |name: &str| -> BudgetResult<Field> {
            profile(Dim::Z, &znu, static_profile(inst, name)?)
        };
        let full = |name: &str| -> BudgetResult<Field> {
            profile(Dim::Z_STAG, &znw, static_profile(inst, name)?)
        };

        // DN is written on half levels but belongs between them
        let dn_half = static_profile(inst, "DN")?;
        let dn: Array1<f64> = dn_half
            .iter()
            .copied()
            .chain(std::iter::once(f64::NAN))
            .collect();

        let vertical = VerticalStagger {
            fnm: Some(static_profile(inst, "FNM")?),
            fnp: Some(static_profile(inst, "FNP")?),
            extrapolation: Some(Extrapolation {
                cf1: static_scalar(inst, "CF1")?,
                cf2: static_scalar(inst, "CF2")?,
                cf3: static_scalar(inst, "CF3")?,
                cfn: static_scalar(inst, "CFN")?,
                cfn1: static_scalar(inst, "CFN1")?,
            }),
        };

        let mut coords = mean.dim_coords();
        for (d, c) in inst.dim_coords() {
            coords.entry(d).or_insert(c);
        }
        coords.remove(&Dim::TIME);
        coords.insert(Dim::Z, znu.clone());
        coords.insert(Dim::Z_STAG, znw.clone());

        Ok(Self {
            dnw: half("DNW")?,
            dn: profile(Dim::Z_STAG, &znw, dn)?,
            c1h: half("C1H")?,
            c2h: half("C2H")?,
            c1f: full("C1F")?,
            c2f: full("C2F")?,
            dx,
            dy,
            stagger: StaggerContext::new(periodicity, vertical),
            coords,
        })
    }

    /// Coordinate of `dim` over the whole processed domain
    pub fn coord(&self, dim: Dim) -> BudgetResult<&Array1<f64>> {
        self.coords
            .get(&dim)
            .ok_or(BudgetError::MissingDimension { dim })
    }

    pub fn periodicity(&self) -> Periodicity {
        self.stagger.periodicity
    }

    /// Horizontal grid spacing along `axis`
    pub fn spacing(&self, axis: GridAxis) -> BudgetResult<f64> {
        match axis {
            GridAxis::X => Ok(self.dx),
            GridAxis::Y => Ok(self.dy),
            other => Err(BudgetError::InvalidField(format!(
                "no horizontal grid spacing along {}",
                other
            ))),
        }
    }

    /// Dry-air mass on half or full levels from the column dry-air mass
    pub fn mu(&self, column_mass: &Field, full_levels: bool) -> BudgetResult<Field> {
        if full_levels {
            self.c1f.mul(column_mass)?.add(&self.c2f)
        } else {
            self.c1h.mul(column_mass)?.add(&self.c2h)
        }
    }

    /// Replace the vertical coordinates of every member by the grid's level values
    pub fn assign_vertical_coords(&self, data: &Dataset) -> BudgetResult<Dataset> {
        let mut out = Dataset::new();
        for (name, field) in data.iter() {
            let mut f = field.clone();
            for dim in [Dim::Z, Dim::Z_STAG] {
                if f.has_dim(dim) {
                    f = f.with_coord(dim, self.coord(dim)?.clone())?;
                }
            }
            out.insert(name, f);
        }
        Ok(out)
    }

    /// Static members for the `grid` output container
    pub fn to_dataset(&self) -> BudgetResult<Dataset> {
        let scalar = |v: f64| Field::new(vec![], vec![], ArrayD::from_elem(IxDyn(&[]), v));
        Ok(Dataset::new()
            .with("DNW", self.dnw.clone())
            .with("DN", self.dn.clone())
            .with("C1H", self.c1h.clone())
            .with("C2H", self.c2h.clone())
            .with("C1F", self.c1f.clone())
            .with("C2F", self.c2f.clone())
            .with("DX", scalar(self.dx)?)
            .with("DY", scalar(self.dy)?))
    }
}

/// Map-scale factors of a variable's grid and of its horizontal fluxes
#[derive(Clone, Debug, PartialEq)]
pub struct MapFactors {
    pub x: Field,
    pub y: Field,
    /// On the grid of the x-flux
    pub flux_x: Field,
    /// On the grid of the y-flux
    pub flux_y: Field,
}

impl MapFactors {
    pub fn along(&self, axis: GridAxis) -> &Field {
        match axis {
            GridAxis::Y => &self.y,
            _ => &self.x,
        }
    }

    pub fn flux(&self, axis: GridAxis) -> &Field {
        match axis {
            GridAxis::Y => &self.flux_y,
            _ => &self.flux_x,
        }
    }

    pub fn averaged(&self, axes: &[GridAxis], ctx: &StaggerContext) -> BudgetResult<Self> {
        Ok(Self {
            x: avg_xy(&self.x, axes, None, ctx)?,
            y: avg_xy(&self.y, axes, None, ctx)?,
            flux_x: avg_xy(&self.flux_x, axes, None, ctx)?,
            flux_y: avg_xy(&self.flux_y, axes, None, ctx)?,
        })
    }
}

/// Grid quantities derived for one variable
#[derive(Clone, Debug, PartialEq)]
pub struct VariableGrid {
    pub base: BaseGrid,
    /// Time-averaged dry-air mass on the variable grid
    pub mu_stag_mean: Field,
    /// Time-averaged density on the variable grid
    pub rhod_stag_mean: Field,
    /// Derivative of height with respect to x, y and t; members `X`, `Y`, `T`
    pub dzdd: Dataset,
    /// Height tendency from the x-advection of geopotential
    pub dzdt_x: Field,
    pub dzdt_y: Field,
    /// Height of the full levels
    pub zw: Field,
    /// Height on the variable grid
    pub z_stag: Field,
}

impl VariableGrid {
    /// Height derivative along `dir` (`X`, `Y` or `Time`)
    pub fn dzdd(&self, dir: GridAxis) -> BudgetResult<&Field> {
        self.dzdd.require(dir.label())
    }

    pub fn dzdt(&self, axis: GridAxis) -> &Field {
        match axis {
            GridAxis::Y => &self.dzdt_y,
            _ => &self.dzdt_x,
        }
    }

    /// Horizontally averaged copy of every derived quantity
    pub fn averaged(&self, axes: &[GridAxis]) -> BudgetResult<Self> {
        let ctx = &self.base.stagger;
        Ok(Self {
            base: self.base.clone(),
            mu_stag_mean: avg_xy(&self.mu_stag_mean, axes, None, ctx)?,
            rhod_stag_mean: avg_xy(&self.rhod_stag_mean, axes, None, ctx)?,
            dzdd: avg_xy(&self.dzdd, axes, None, ctx)?,
            dzdt_x: avg_xy(&self.dzdt_x, axes, None, ctx)?,
            dzdt_y: avg_xy(&self.dzdt_y, axes, None, ctx)?,
            zw: avg_xy(&self.zw, axes, None, ctx)?,
            z_stag: avg_xy(&self.z_stag, axes, None, ctx)?,
        })
    }

    /// Members of the `grid` output container
    pub fn to_dataset(&self) -> BudgetResult<Dataset> {
        let mut ds = self.base.to_dataset()?;
        ds.insert("MU_STAG_MEAN", self.mu_stag_mean.clone());
        ds.insert("RHOD_STAG_MEAN", self.rhod_stag_mean.clone());
        for (dir, f) in self.dzdd.iter() {
            ds.insert(format!("dzdd/{}", dir), f.clone());
        }
        ds.insert("dzdt_x", self.dzdt_x.clone());
        ds.insert("dzdt_y", self.dzdt_y.clone());
        ds.insert("ZW", self.zw.clone());
        ds.insert("Z_STAG", self.z_stag.clone());
        Ok(ds)
    }
}

/// Instantaneous density couplings on the variable grid
#[derive(Clone, Debug, PartialEq)]
pub struct InstantCoupling {
    pub mu_stag: Field,
    pub rhod_stag: Field,
}

/// Everything derived from the grid and the data for one variable
#[derive(Clone, Debug, PartialEq)]
pub struct VariableContext {
    pub variable: Variable,
    pub grid: VariableGrid,
    pub mapfac: MapFactors,
    pub inst: InstantCoupling,
}

/// Time step between the first two instantaneous outputs (s)
pub fn inst_time_step(inst: &Dataset) -> BudgetResult<f64> {
    let coords = inst.dim_coords();
    let times = coords
        .get(&Dim::TIME)
        .ok_or(BudgetError::MissingDimension { dim: Dim::TIME })?;
    if times.len() < 2 {
        return Err(BudgetError::config(
            "instantaneous data needs at least two time steps",
        ));
    }
    Ok(times[1] - times[0])
}

impl VariableContext {
    /// Derive the grid quantities of `variable` from the prepared datasets
    pub fn derive(
        base: &BaseGrid,
        variable: Variable,
        mean: &Dataset,
        inst: &Dataset,
        avg_axes: &[GridAxis],
    ) -> BudgetResult<Self> {
        let ctx = &base.stagger;

        let mtype = variable.mapfac_type();
        let mapfac = MapFactors {
            x: static_field(inst, &format!("MAPFAC_{}X", mtype))?,
            y: static_field(inst, &format!("MAPFAC_{}Y", mtype))?,
            flux_x: ctx.like(
                &static_field(inst, "MAPFAC_UY")?,
                mean.require(&variable.adv_flux_name(GridAxis::X, false))?,
            )?,
            flux_y: ctx.like(
                &static_field(inst, "MAPFAC_VX")?,
                mean.require(&variable.adv_flux_name(GridAxis::Y, false))?,
            )?,
        };

        // dry-air mass
        let column_mass = inst.require("MU")?.add(inst.require("MUB")?)?;
        let mut_mean = mean.require("MUT_MEAN")?;
        let mu_half = base.mu(&column_mass, false)?;
        let rhod_mean = mean.require("RHOD_MEAN")?;
        let (mu_inst, mu_mean, rhodm) = match variable.staggered_axis() {
            None => (mu_half.clone(), base.mu(mut_mean, false)?, rhod_mean.clone()),
            Some(GridAxis::Z) => (
                base.mu(&column_mass, true)?,
                base.mu(mut_mean, true)?,
                ctx.stagger(rhod_mean, Dim::Z, base.coord(Dim::Z_STAG)?)?,
            ),
            Some(axis) => {
                let dim = Dim::new(axis, false);
                let coord = base.coord(dim.to_staggered())?;
                (
                    ctx.stagger(&mu_half, dim, coord)?,
                    ctx.stagger(&base.mu(mut_mean, false)?, dim, coord)?,
                    ctx.stagger(rhod_mean, dim, coord)?,
                )
            }
        };
        let reference = rhodm.clone();
        let rhod_stag_mean = if avg_axes.is_empty() {
            rhodm
        } else {
            avg_xy(&rhodm, avg_axes, None, ctx)?
        };

        // derivatives of height with respect to x, y and t
        let z_mean = mean.require("Z_MEAN")?;
        let mut dzdd = Dataset::new();
        for axis in [GridAxis::X, GridAxis::Y] {
            let dim = Dim::new(axis, false);
            let d = ctx
                .diff(z_mean, dim, base.coord(dim.to_staggered())?)?
                .scale(1.0 / base.spacing(axis)?);
            dzdd.insert(axis.label(), ctx.like_ignoring(&d, &reference, &[Dim::Z_STAG])?);
        }
        let zw_inst = inst.require("PH")?.add(inst.require("PHB")?)?.scale(1.0 / G);
        let dt = inst_time_step(inst)?;
        let dzdt = zw_inst.diff_time()?.scale(1.0 / dt);
        dzdd.insert(
            GridAxis::Time.label(),
            ctx.like_ignoring(&dzdt, &reference, &[Dim::Z_STAG])?,
        );
        let dzdt_x = ctx.like_ignoring(
            &mean.require("DPH_X_MEAN")?.scale(1.0 / G),
            &reference,
            &[Dim::Z_STAG],
        )?;
        let dzdt_y = ctx.like_ignoring(
            &mean.require("DPH_Y_MEAN")?.scale(1.0 / G),
            &reference,
            &[Dim::Z_STAG],
        )?;

        // instantaneous density from the hydrostatic relation
        let dphi = ctx.diff(&zw_inst.scale(G), Dim::Z_STAG, base.coord(Dim::Z)?)?;
        let rhod = dphi
            .map(|v| -1.0 / v)
            .mul(&base.dnw)?
            .mul(&mu_half)?;
        let rhod_stag = ctx.like(&rhod, &reference)?;

        let grid = VariableGrid {
            base: base.clone(),
            mu_stag_mean: mu_mean,
            rhod_stag_mean,
            dzdd,
            dzdt_x,
            dzdt_y,
            zw: z_mean.clone(),
            z_stag: ctx.like(z_mean, &reference)?,
        };
        log::debug!("Derived grid quantities for {}", variable);

        Ok(Self {
            variable,
            grid,
            mapfac,
            inst: InstantCoupling {
                mu_stag: mu_inst,
                rhod_stag,
            },
        })
    }
}
