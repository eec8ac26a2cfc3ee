//! Synthetic model output with a known budget
//!
//! [`SyntheticCase`] generates a matching pair of time-averaged and instantaneous
//! datasets on a uniformly spaced grid. The flow is a sheared, accelerating wind in x:
//!
//! ```text
//! u = u0 + u_shear * y + u_trend * t,    v = 0
//! ```
//!
//! driven by a constant pressure-gradient source `u_trend`. The potential temperature
//! perturbation is a ramp in x that is advected by this wind, plus a stable
//! stratification attached to the coordinate surfaces,
//!
//! ```text
//! theta = a * (x - u0 * t - u_shear * y * t - u_trend * t^2 / 2) + lapse * z0(eta, x)
//! ```
//!
//! where `z0` is the initial height of the coordinate surface. The averaged output
//! `T_MEAN` holds the full potential temperature, offset by [`THETA_REF`]. The moisture
//! is constant.
//!
//! By default the terrain is flat and the model top fixed, so all Cartesian corrections
//! vanish. A `terrain_slope` tilts the surface in x and a `lift_rate` raises the model
//! top, stretching the column:
//!
//! ```text
//! z = top(t) - eta * (top(t) - slope * x),    top(t) = nz * dz + lift * t
//! ```
//!
//! The dry-air mass stays constant in time, so the coordinate velocity follows from
//! continuity, `mu * deta/dt = rho * g * slope * u * eta`, and the density drops as the
//! column is stretched. The vertical wind and the correction fluxes written to the mean
//! dataset are the matching Cartesian quantities. With a sloped surface the x-axis
//! should be bounded.
//!
//! Time averages are taken with Simpson's rule, which is exact for the polynomials
//! involved, so the budgets close to rounding error.
//!
//! ```rust
//! use fluxbudget_core::synthetic::SyntheticCase;
//!
//! let case = SyntheticCase::default();
//! let (mean, inst) = case.build().unwrap();
//! assert!(mean.contains("FTX_ADV_MEAN"));
//! assert!(inst.contains("PHB"));
//! ```

use crate::budget::CORRECTION_DIRS;
use crate::config::ModelAttributes;
use crate::dataset::Dataset;
use crate::errors::BudgetResult;
use crate::field::{Dim, Field, GridAxis, Point};
use crate::grid::{G, THETA_REF};
use crate::stagger::Periodicity;
use crate::variables::Variable;
use ndarray::{Array, Array1};

/// Parameters of the synthetic case
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticCase {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub dx: f64,
    pub dy: f64,
    /// Layer depth (m)
    pub dz: f64,
    /// Number of averaging intervals after the first output
    pub n_mean: usize,
    /// Output interval (s)
    pub interval: f64,
    /// Model time step (s)
    pub dt: f64,
    /// Dry-air density (kg m-3)
    pub rho: f64,
    pub u0: f64,
    pub u_shear: f64,
    pub u_trend: f64,
    /// Potential temperature gradient in x (K m-1)
    pub theta_gradient: f64,
    /// Vertical potential temperature gradient (K m-1)
    pub theta_lapse: f64,
    pub q0: f64,
    /// Surface height gradient in x
    pub terrain_slope: f64,
    /// Rise of the model top (m s-1)
    pub lift_rate: f64,
    pub periodic_x: bool,
    pub periodic_y: bool,
}

impl Default for SyntheticCase {
    fn default() -> Self {
        Self {
            nx: 6,
            ny: 5,
            nz: 4,
            dx: 100.0,
            dy: 100.0,
            dz: 50.0,
            n_mean: 3,
            interval: 60.0,
            dt: 10.0,
            rho: 1.1,
            u0: 5.0,
            u_shear: 1e-3,
            u_trend: 1e-4,
            theta_gradient: 1e-3,
            theta_lapse: 0.0,
            q0: 1e-3,
            terrain_slope: 0.0,
            lift_rate: 0.0,
            periodic_x: true,
            periodic_y: true,
        }
    }
}

/// Dimensions of the grid of `variable`
pub fn variable_dims(variable: Variable) -> [Dim; 3] {
    match variable.staggered_axis() {
        Some(GridAxis::X) => [Dim::Z, Dim::Y, Dim::X_STAG],
        Some(GridAxis::Y) => [Dim::Z, Dim::Y_STAG, Dim::X],
        Some(GridAxis::Z) => [Dim::Z_STAG, Dim::Y, Dim::X],
        _ => [Dim::Z, Dim::Y, Dim::X],
    }
}

/// Dimensions of the grid of the flux of `variable` in direction `dir`
pub fn flux_dims(variable: Variable, dir: GridAxis) -> [Dim; 3] {
    variable_dims(variable).map(|d| if d.axis == dir { d.counterpart() } else { d })
}

impl SyntheticCase {
    pub fn attributes(&self) -> ModelAttributes {
        ModelAttributes {
            dx: self.dx,
            dy: self.dy,
            dt: self.dt,
            use_theta_m: false,
            output_dry_theta_fluxes: false,
            periodic_x: self.periodic_x,
            periodic_y: self.periodic_y,
            extra: Default::default(),
        }
    }

    pub fn periodicity(&self) -> Periodicity {
        Periodicity::new(self.periodic_x, self.periodic_y)
    }

    /// Column dry-air mass at `x` (Pa)
    pub fn column_mass(&self, x: f64) -> f64 {
        self.rho * G * self.depth(x, 0.0)
    }

    fn coord(&self, dim: Dim) -> Array1<f64> {
        let nz = self.nz as f64;
        match (dim.axis, dim.staggered) {
            (GridAxis::X, false) => Array::from_shape_fn(self.nx, |i| (i as f64 + 0.5) * self.dx),
            (GridAxis::X, true) => Array::from_shape_fn(self.nx + 1, |i| i as f64 * self.dx),
            (GridAxis::Y, false) => Array::from_shape_fn(self.ny, |i| (i as f64 + 0.5) * self.dy),
            (GridAxis::Y, true) => Array::from_shape_fn(self.ny + 1, |i| i as f64 * self.dy),
            (GridAxis::Z, true) => Array::from_shape_fn(self.nz + 1, |k| 1.0 - k as f64 / nz),
            (GridAxis::Z, false) => {
                Array::from_shape_fn(self.nz, |k| 1.0 - (k as f64 + 0.5) / nz)
            }
            (GridAxis::Time, _) => self.times(),
        }
    }

    /// Output times of both datasets
    pub fn times(&self) -> Array1<f64> {
        Array::from_shape_fn(self.n_mean + 1, |j| j as f64 * self.interval)
    }

    /// Height of the model top
    pub fn top(&self, t: f64) -> f64 {
        self.nz as f64 * self.dz + self.lift_rate * t
    }

    /// Surface height
    pub fn surface(&self, x: f64) -> f64 {
        self.terrain_slope * x
    }

    /// Depth of the model column
    pub fn depth(&self, x: f64, t: f64) -> f64 {
        self.top(t) - self.surface(x)
    }

    /// Height of the coordinate surface `eta`
    pub fn height(&self, eta: f64, x: f64, t: f64) -> f64 {
        self.top(t) - eta * self.depth(x, t)
    }

    /// Dry-air density, from the hydrostatic relation
    pub fn density(&self, x: f64, t: f64) -> f64 {
        self.column_mass(x) / (G * self.depth(x, t))
    }

    pub fn u(&self, y: f64, t: f64) -> f64 {
        self.u0 + self.u_shear * y + self.u_trend * t
    }

    /// Potential temperature perturbation
    pub fn theta(&self, eta: f64, x: f64, y: f64, t: f64) -> f64 {
        self.theta_gradient
            * (x - self.u0 * t - self.u_shear * y * t - 0.5 * self.u_trend * t * t)
            + self.theta_lapse * self.height(eta, x, 0.0)
    }

    /// Mass-coupled coordinate velocity `mu * deta/dt`
    fn eta_mass_flux(&self, p: &Point, t: f64) -> f64 {
        let eta = p.along(GridAxis::Z);
        self.rho * G * self.terrain_slope * self.u(p.along(GridAxis::Y), t) * eta
    }

    /// Cartesian vertical velocity
    pub fn w(&self, eta: f64, x: f64, y: f64, t: f64) -> f64 {
        let omega = self.rho * G * self.terrain_slope * self.u(y, t) * eta / self.column_mass(x);
        self.lift_rate * (1.0 - eta) + self.u(y, t) * eta * self.terrain_slope
            - omega * self.depth(x, t)
    }

    fn value(&self, variable: Variable, p: &Point, t: f64) -> f64 {
        let (eta, x, y) = (p.along(GridAxis::Z), p.along(GridAxis::X), p.along(GridAxis::Y));
        match variable {
            Variable::T => self.theta(eta, x, y, t),
            Variable::Q => self.q0,
            Variable::U => self.u(y, t),
            Variable::V => 0.0,
            Variable::W => self.w(eta, x, y, t),
        }
    }

    fn velocity(&self, dir: GridAxis, p: &Point, t: f64) -> f64 {
        match dir {
            GridAxis::X => self.u(p.along(GridAxis::Y), t),
            GridAxis::Z => self.w_at(p, t),
            _ => 0.0,
        }
    }

    fn w_at(&self, p: &Point, t: f64) -> f64 {
        let (eta, x, y) = (p.along(GridAxis::Z), p.along(GridAxis::X), p.along(GridAxis::Y));
        self.w(eta, x, y, t)
    }

    fn rho_at(&self, p: &Point, t: f64) -> f64 {
        self.density(p.along(GridAxis::X), t)
    }

    /// Slope correction velocities `dz/dt` of the moving grid and `u dz/dx`
    fn slope_velocity(&self, dir: GridAxis, p: &Point, t: f64) -> f64 {
        let eta = p.along(GridAxis::Z);
        match dir {
            GridAxis::X => self.u(p.along(GridAxis::Y), t) * eta * self.terrain_slope,
            GridAxis::Time => self.lift_rate * (1.0 - eta),
            _ => 0.0,
        }
    }

    fn axes(&self, dims: &[Dim], time: bool) -> Vec<(Dim, Array1<f64>)> {
        let mut axes: Vec<(Dim, Array1<f64>)> = dims.iter().map(|d| (*d, self.coord(*d))).collect();
        if time {
            axes.push((Dim::TIME, self.times()));
        }
        axes
    }

    fn constant(&self, dims: &[Dim], time: bool, value: f64) -> BudgetResult<Field> {
        Field::full(self.axes(dims, time), value)
    }

    /// Instantaneous field
    fn inst_field<F>(&self, dims: &[Dim], f: F) -> BudgetResult<Field>
    where
        F: Fn(&Point, f64) -> f64,
    {
        Field::from_fn(self.axes(dims, true), |p| f(p, p.get(Dim::TIME)))
    }

    /// Average over the output interval ending at each output time
    fn mean_field<F>(&self, dims: &[Dim], f: F) -> BudgetResult<Field>
    where
        F: Fn(&Point, f64) -> f64,
    {
        let h = self.interval;
        Field::from_fn(self.axes(dims, true), |p| {
            let t = p.get(Dim::TIME);
            (f(p, t - h) + 4.0 * f(p, t - 0.5 * h) + f(p, t)) / 6.0
        })
    }

    fn static_fields(&self) -> BudgetResult<Dataset> {
        let nz = self.nz as f64;
        let scalar = Field::scalar;
        let mut ds = Dataset::new()
            .with("ZNU", Field::from_fn(self.axes(&[Dim::Z], false), |p| p.get(Dim::Z))?)
            .with(
                "ZNW",
                Field::from_fn(self.axes(&[Dim::Z_STAG], false), |p| p.get(Dim::Z_STAG))?,
            )
            .with("DNW", self.constant(&[Dim::Z], false, -1.0 / nz)?)
            .with("DN", self.constant(&[Dim::Z], false, -1.0 / nz)?)
            .with("C1H", self.constant(&[Dim::Z], false, 1.0)?)
            .with("C2H", self.constant(&[Dim::Z], false, 0.0)?)
            .with("C1F", self.constant(&[Dim::Z_STAG], false, 1.0)?)
            .with("C2F", self.constant(&[Dim::Z_STAG], false, 0.0)?)
            .with("FNM", self.constant(&[Dim::Z], false, 0.5)?)
            .with("FNP", self.constant(&[Dim::Z], false, 0.5)?)
            .with("CF1", scalar(1.5))
            .with("CF2", scalar(-0.5))
            .with("CF3", scalar(0.0))
            .with("CFN", scalar(1.5))
            .with("CFN1", scalar(-0.5));
        let mapfac_grids = [
            ("M", [Dim::Y, Dim::X]),
            ("U", [Dim::Y, Dim::X_STAG]),
            ("V", [Dim::Y_STAG, Dim::X]),
        ];
        for (kind, dims) in mapfac_grids {
            for dir in ["X", "Y"] {
                ds.insert(
                    format!("MAPFAC_{}{}", kind, dir),
                    self.constant(&dims, false, 1.0)?,
                );
            }
        }
        Ok(ds)
    }

    fn inst_fields(&self) -> BudgetResult<Dataset> {
        let levels = [Dim::Z_STAG, Dim::Y, Dim::X];
        let mut ds = self.static_fields()?;
        ds.insert("MU", self.constant(&[Dim::Y, Dim::X], true, 0.0)?);
        ds.insert(
            "MUB",
            Field::from_fn(self.axes(&[Dim::Y, Dim::X], false), |p| {
                self.column_mass(p.get(Dim::X))
            })?,
        );
        ds.insert(
            "PH",
            self.inst_field(&levels, |p, t| {
                let (eta, x) = (p.get(Dim::Z_STAG), p.get(Dim::X));
                G * (self.height(eta, x, t) - self.height(eta, x, 0.0))
            })?,
        );
        ds.insert(
            "PHB",
            Field::from_fn(self.axes(&levels, false), |p| {
                G * self.height(p.get(Dim::Z_STAG), p.get(Dim::X), 0.0)
            })?,
        );
        for var in [Variable::U, Variable::V, Variable::W, Variable::T] {
            ds.insert(
                var.upper(),
                self.inst_field(&variable_dims(var), |p, t| self.value(var, p, t))?,
            );
        }
        ds.insert(
            "QVAPOR",
            self.inst_field(&variable_dims(Variable::Q), |p, t| self.value(Variable::Q, p, t))?,
        );
        Ok(ds)
    }

    fn mean_fields(&self) -> BudgetResult<Dataset> {
        let mass = [Dim::Z, Dim::Y, Dim::X];
        let levels = [Dim::Z_STAG, Dim::Y, Dim::X];
        let mut ds = Dataset::new()
            .with("RHOD_MEAN", self.mean_field(&mass, |p, t| self.rho_at(p, t))?)
            .with(
                "MUT_MEAN",
                self.mean_field(&[Dim::Y, Dim::X], |p, _| self.column_mass(p.get(Dim::X)))?,
            )
            .with("WW_MEAN", self.mean_field(&levels, |p, t| self.eta_mass_flux(p, t))?)
            .with("WD_MEAN", self.mean_field(&levels, |p, t| self.w_at(p, t))?)
            .with("ZWIND_MEAN", self.mean_field(&levels, |p, t| self.w_at(p, t))?)
            .with(
                "DPH_X_MEAN",
                self.mean_field(&levels, |p, t| -G * self.slope_velocity(GridAxis::X, p, t))?,
            )
            .with("DPH_Y_MEAN", self.constant(&levels, true, 0.0)?)
            .with(
                "Z_MEAN",
                self.mean_field(&levels, |p, t| {
                    self.height(p.get(Dim::Z_STAG), p.get(Dim::X), t)
                })?,
            );
        ds.insert(
            "U_MEAN",
            self.mean_field(&variable_dims(Variable::U), |p, t| self.value(Variable::U, p, t))?,
        );
        ds.insert(
            "V_MEAN",
            self.mean_field(&variable_dims(Variable::V), |p, t| self.value(Variable::V, p, t))?,
        );
        ds.insert(
            Variable::T.mean_name(),
            self.mean_field(&variable_dims(Variable::T), |p, t| {
                self.value(Variable::T, p, t) + THETA_REF
            })?,
        );
        ds.insert(
            Variable::Q.mean_name(),
            self.mean_field(&variable_dims(Variable::Q), |p, t| self.value(Variable::Q, p, t))?,
        );

        for var in Variable::ALL {
            for dir in [GridAxis::X, GridAxis::Y] {
                let dims = flux_dims(var, dir);
                let flux = self.mean_field(&dims, |p, t| {
                    self.value(var, p, t) * self.velocity(dir, p, t)
                })?;
                ds.insert(var.adv_flux_name(dir, true), flux.clone());
                ds.insert(var.adv_flux_name(dir, false), flux);
            }
            // vertical flux of the density-weighted variable, divided by the mean density
            let vertical = flux_dims(var, GridAxis::Z);
            let mass_flux = self.mean_field(&vertical, |p, t| {
                self.rho_at(p, t) * self.w_at(p, t) * self.value(var, p, t)
            })?;
            let flux = mass_flux.div(&self.mean_field(&vertical, |p, t| self.rho_at(p, t))?)?;
            ds.insert(var.adv_flux_name(GridAxis::Z, true), flux.clone());
            ds.insert(var.adv_flux_name(GridAxis::Z, false), flux);

            for dir in [GridAxis::X, GridAxis::Y, GridAxis::Z] {
                let dims = flux_dims(var, dir);
                ds.insert(
                    var.staggered_mean_name(dir),
                    self.mean_field(&dims, |p, t| self.value(var, p, t))?,
                );
                ds.insert(var.sgs_flux_name(dir), self.constant(&dims, true, 0.0)?);
            }

            // correction fluxes live on the grid of the vertical flux
            for second_order in [false, true] {
                for (dir, name) in CORRECTION_DIRS
                    .iter()
                    .zip(var.correction_names(second_order))
                {
                    let corr = self.mean_field(&vertical, |p, t| {
                        self.rho_at(p, t) * self.slope_velocity(*dir, p, t) * self.value(var, p, t)
                    })?;
                    ds.insert(name, corr);
                }
            }
            for dir in [GridAxis::X, GridAxis::Y] {
                let corr = self.mean_field(&vertical, |p, t| {
                    self.rho_at(p, t) * self.velocity(dir, p, t) * self.value(var, p, t)
                })?;
                ds.insert(var.dz_out_correction_name(dir), corr);
            }
        }

        let sources = [
            ("T_TEND_MP_MEAN", Variable::T, 0.0),
            ("T_TEND_RADLW_MEAN", Variable::T, 0.0),
            ("T_TEND_RADSW_MEAN", Variable::T, 0.0),
            ("Q_TEND_MP_MEAN", Variable::Q, 0.0),
            ("U_TEND_PG_MEAN", Variable::U, self.u_trend),
            ("V_TEND_PG_MEAN", Variable::V, 0.0),
            ("W_TEND_PG_MEAN", Variable::W, 0.0),
            ("U_TEND_COR_CURV_MEAN", Variable::U, 0.0),
            ("V_TEND_COR_CURV_MEAN", Variable::V, 0.0),
            ("W_TEND_COR_CURV_MEAN", Variable::W, 0.0),
        ];
        for (name, var, value) in sources {
            ds.insert(name, self.constant(&variable_dims(var), true, value)?);
        }
        Ok(ds)
    }

    /// Time-averaged and instantaneous datasets
    pub fn build(&self) -> BudgetResult<(Dataset, Dataset)> {
        Ok((self.mean_fields()?, self.inst_fields()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_flux_grids() {
        assert_eq!(flux_dims(Variable::T, GridAxis::X), [Dim::Z, Dim::Y, Dim::X_STAG]);
        assert_eq!(flux_dims(Variable::U, GridAxis::X), [Dim::Z, Dim::Y, Dim::X]);
        assert_eq!(flux_dims(Variable::W, GridAxis::Z), [Dim::Z, Dim::Y, Dim::X]);
        assert_eq!(flux_dims(Variable::V, GridAxis::X), [Dim::Z, Dim::Y_STAG, Dim::X_STAG]);
    }

    #[test]
    fn test_simpson_mean_of_advected_ramp() {
        let case = SyntheticCase::default();
        let (mean, _) = case.build().unwrap();
        let t_mean = mean.require("T_MEAN").unwrap();
        let t = case.times()[2];
        let (x, y) = (0.5 * case.dx, 0.5 * case.dy);
        // exact average of the quadratic time dependence
        let h = case.interval;
        let a = case.theta_gradient;
        let b = case.u0 + case.u_shear * y;
        let integral = |s: f64| a * (x * s - 0.5 * b * s * s - case.u_trend * s * s * s / 6.0);
        let expected = (integral(t) - integral(t - h)) / h;
        let value = t_mean.values()[[2, 0, 0, 0]] - THETA_REF;
        assert_relative_eq!(value, expected, max_relative = 1e-9);
    }

    fn sloped() -> SyntheticCase {
        SyntheticCase {
            terrain_slope: 0.1,
            theta_lapse: 3e-3,
            periodic_x: false,
            ..SyntheticCase::default()
        }
    }

    #[test]
    fn test_static_slope_keeps_flow_horizontal() {
        let case = sloped();
        let (mean, inst) = case.build().unwrap();
        assert!(mean.require("WD_MEAN").unwrap().max_abs().unwrap() < 1e-12);
        assert!(mean.require("FTZ_ADV_MEAN").unwrap().max_abs().unwrap() < 1e-12);
        assert_eq!(inst.require("PH").unwrap().max_abs(), Some(0.0));

        // the coordinate surfaces are crossed at the rate u dz/dx
        let x = 0.5 * case.dx;
        let mub = inst.require("MUB").unwrap();
        assert_relative_eq!(mub.values()[[0, 0]], case.column_mass(x), max_relative = 1e-12);
        assert_relative_eq!(case.density(x, 100.0), case.rho, max_relative = 1e-12);
        let dph = mean.require("DPH_X_MEAN").unwrap();
        let corr = mean.require("FTX_CORR").unwrap();
        let eta = 0.5;
        let u_mean = case.u(0.5 * case.dy, case.times()[1] - 0.5 * case.interval);
        let (k, t) = (case.nz / 2, 1);
        assert_relative_eq!(
            dph.values()[[t, k, 0, 0]],
            -G * u_mean * eta * case.terrain_slope,
            max_relative = 1e-12
        );
        assert!(corr.values()[[t, k, 0, 0]].abs() > 1e-3);
        let corr_t = mean.require("CORR_DTDT").unwrap();
        assert_eq!(corr_t.max_abs(), Some(0.0));
    }

    #[test]
    fn test_lifted_top_stretches_column() {
        let case = SyntheticCase {
            lift_rate: 0.05,
            ..sloped()
        };
        let (mean, inst) = case.build().unwrap();
        let t = case.times()[case.n_mean];
        let x = 1.5 * case.dx;
        assert_relative_eq!(
            case.height(0.0, x, t) - case.height(0.0, x, 0.0),
            case.lift_rate * t,
            max_relative = 1e-12
        );
        assert_relative_eq!(case.height(1.0, x, t), case.surface(x), max_relative = 1e-12);
        assert!(case.density(x, t) < case.rho);

        // the surface does not move
        let ph = inst.require("PH").unwrap();
        assert!(ph.isel(Dim::Z_STAG, 0).unwrap().max_abs().unwrap() < 1e-9);
        assert!(ph.isel(Dim::Z_STAG, -1).unwrap().max_abs().unwrap() > 1.0);
        assert!(mean.require("CORR_DTDT").unwrap().max_abs().unwrap() > 0.0);
        assert!(mean.require("ZWIND_MEAN").unwrap().max_abs().unwrap() > 0.0);
    }
}
