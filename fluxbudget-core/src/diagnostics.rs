//! Skill scores for comparing budget terms
//!
//! Used to check the closure of a budget: the total tendency should match the sum of
//! all forcings. Missing values in either field are skipped pairwise.

use crate::errors::{BudgetError, BudgetResult};
use crate::field::Field;

/// Pairs of non-missing values of `dat` and `reference`, broadcast by dimension name
fn valid_pairs(dat: &Field, reference: &Field) -> BudgetResult<Vec<(f64, f64)>> {
    // broadcast both to the joint shape
    let zero = dat.sub(dat)?.add(&reference.sub(reference)?)?;
    let d = dat.add(&zero)?;
    let r = reference.add(&zero)?;
    let pairs: Vec<(f64, f64)> = d
        .values()
        .iter()
        .zip(r.values().iter())
        .filter(|(a, b)| !a.is_nan() && !b.is_nan())
        .map(|(a, b)| (*a, *b))
        .collect();
    if pairs.is_empty() {
        return Err(BudgetError::InvalidField(
            "no valid values to compare".into(),
        ));
    }
    Ok(pairs)
}

/// Maximum squared error of `dat` scaled by the variance of `reference`
pub fn max_error_scaled(dat: &Field, reference: &Field) -> BudgetResult<f64> {
    let pairs = valid_pairs(dat, reference)?;
    let n = pairs.len() as f64;
    let mean = pairs.iter().map(|(_, r)| r).sum::<f64>() / n;
    let var = pairs.iter().map(|(_, r)| (r - mean).powi(2)).sum::<f64>() / n;
    let max = pairs
        .iter()
        .map(|(d, r)| (d - r).powi(2))
        .fold(0.0, f64::max);
    Ok(max / var)
}

/// Nash-Sutcliffe efficiency of `dat` with respect to `reference`.
///
/// One for a perfect match, zero if `dat` is no better than the mean of `reference`.
pub fn nse(dat: &Field, reference: &Field) -> BudgetResult<f64> {
    let pairs = valid_pairs(dat, reference)?;
    let n = pairs.len() as f64;
    let mean = pairs.iter().map(|(_, r)| r).sum::<f64>() / n;
    let err: f64 = pairs.iter().map(|(d, r)| (d - r).powi(2)).sum();
    let spread: f64 = pairs.iter().map(|(_, r)| (r - mean).powi(2)).sum();
    Ok(1.0 - err / spread)
}
