pub use fluxbudget_core::*;

#[cfg(feature = "python")]
mod python {
    use fluxbudget_core::python::core;
    use pyo3::prelude::*;
    use pyo3::wrap_pymodule;

    #[pymodule]
    #[pyo3(name = "_lib")]
    fn fluxbudget(m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add("__version__", env!("CARGO_PKG_VERSION"))?;
        m.add_wrapped(wrap_pymodule!(core))?;
        set_path(m, "fluxbudget._lib.core", "core")?;
        Ok(())
    }

    fn set_path(m: &Bound<'_, PyModule>, path: &str, module: &str) -> PyResult<()> {
        let code = format!(
            "\
import sys
sys.modules['{path}'] = {module}
    "
        );
        m.py().run_bound(&code, None, Some(&m.dict()))
    }
}
