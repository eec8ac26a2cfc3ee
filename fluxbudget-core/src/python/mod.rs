//! Python bindings for the staggering operators and budget-method parsing.
//!
//! Arrays are passed as numpy arrays together with their dimension names
//! (`x`, `x_stag`, `y`, `y_stag`, `z`, `z_stag`, `time`) and one coordinate array per
//! dimension. Results come back as `(values, dims)` in canonical dimension order.

use crate::config::BudgetMethod;
use crate::errors::BudgetError;
use crate::field::{Dim, Field};
use crate::stagger::{self, VerticalStagger};
use numpy::{IntoPyArray, PyArrayDyn, PyReadonlyArray1, PyReadonlyArrayDyn};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

impl From<BudgetError> for PyErr {
    fn from(e: BudgetError) -> PyErr {
        PyValueError::new_err(e.to_string())
    }
}

fn parse_dim(name: &str) -> PyResult<Dim> {
    Dim::parse(name).ok_or_else(|| PyValueError::new_err(format!("Unknown dimension '{}'", name)))
}

fn to_field(
    values: PyReadonlyArrayDyn<f64>,
    dims: Vec<String>,
    coords: Vec<PyReadonlyArray1<f64>>,
) -> PyResult<Field> {
    let dims = dims.iter().map(|d| parse_dim(d)).collect::<PyResult<Vec<_>>>()?;
    let coords = coords.iter().map(|c| c.as_array().to_owned()).collect();
    Ok(Field::new(dims, coords, values.as_array().to_owned())?)
}

fn from_field(py: Python<'_>, field: Field) -> (Bound<'_, PyArrayDyn<f64>>, Vec<String>) {
    let dims = field.dims().iter().map(|d| d.name()).collect();
    (field.into_values().into_pyarray_bound(py), dims)
}

/// Stagger along `dim` onto `new_coord`
#[pyfunction]
#[pyo3(signature = (values, dims, coords, dim, new_coord, periodic=false))]
fn stagger<'py>(
    py: Python<'py>,
    values: PyReadonlyArrayDyn<f64>,
    dims: Vec<String>,
    coords: Vec<PyReadonlyArray1<f64>>,
    dim: &str,
    new_coord: PyReadonlyArray1<f64>,
    periodic: bool,
) -> PyResult<(Bound<'py, PyArrayDyn<f64>>, Vec<String>)> {
    let field = to_field(values, dims, coords)?;
    let out = stagger::stagger(
        &field,
        parse_dim(dim)?,
        &new_coord.as_array().to_owned(),
        periodic,
        &VerticalStagger::midpoint(),
    )?;
    Ok(from_field(py, out))
}

/// Average a staggered dimension back onto the cell centres
#[pyfunction]
fn destagger<'py>(
    py: Python<'py>,
    values: PyReadonlyArrayDyn<f64>,
    dims: Vec<String>,
    coords: Vec<PyReadonlyArray1<f64>>,
    dim: &str,
    new_coord: PyReadonlyArray1<f64>,
) -> PyResult<(Bound<'py, PyArrayDyn<f64>>, Vec<String>)> {
    let field = to_field(values, dims, coords)?;
    let out = stagger::destagger(&field, parse_dim(dim)?, &new_coord.as_array().to_owned())?;
    Ok(from_field(py, out))
}

/// First-order difference along `dim`
#[pyfunction]
#[pyo3(signature = (values, dims, coords, dim, new_coord, periodic=false))]
fn diff<'py>(
    py: Python<'py>,
    values: PyReadonlyArrayDyn<f64>,
    dims: Vec<String>,
    coords: Vec<PyReadonlyArray1<f64>>,
    dim: &str,
    new_coord: PyReadonlyArray1<f64>,
    periodic: bool,
) -> PyResult<(Bound<'py, PyArrayDyn<f64>>, Vec<String>)> {
    let field = to_field(values, dims, coords)?;
    let out = stagger::diff(
        &field,
        parse_dim(dim)?,
        &new_coord.as_array().to_owned(),
        periodic,
    )?;
    Ok(from_field(py, out))
}

/// Parse a budget-method string into its label and options
#[pyfunction]
fn parse_budget_method<'py>(py: Python<'py>, method: &str) -> PyResult<Bound<'py, PyDict>> {
    let method = BudgetMethod::parse(method)?;
    method.settings.validate()?;
    let dict = PyDict::new_bound(py);
    dict.set_item("label", method.label)?;
    dict.set_item("cartesian", method.settings.cartesian)?;
    dict.set_item("dz_out_x", method.settings.dz_out_x)?;
    dict.set_item("dz_out_z", method.settings.dz_out_z)?;
    dict.set_item("force_2nd_adv", method.settings.force_2nd_adv)?;
    Ok(dict)
}

#[pymodule]
pub fn core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(stagger, m)?)?;
    m.add_function(wrap_pyfunction!(destagger, m)?)?;
    m.add_function(wrap_pyfunction!(diff, m)?)?;
    m.add_function(wrap_pyfunction!(parse_budget_method, m)?)?;
    Ok(())
}
