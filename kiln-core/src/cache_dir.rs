//! Resolution of the directory where downloaded weights are cached.
//!
//! Order: explicit `model_cache_dir` attribute, then `KILN_CACHE_DIR`, then the
//! hf-hub default (`$HF_HOME/hub`). Resolution happens once, when attributes are
//! deserialized; loaders only ever see the resolved path.

use std::ffi::OsString;
use std::path::PathBuf;

pub const CACHE_DIR_ENV: &str = "KILN_CACHE_DIR";

/// Cache directory used when the attributes do not name one.
pub fn default_cache_dir() -> PathBuf {
    resolve_cache_dir(None)
}

pub fn resolve_cache_dir(explicit: Option<PathBuf>) -> PathBuf {
    resolve_with(explicit, |key| std::env::var_os(key))
}

fn resolve_with(explicit: Option<PathBuf>, lookup: impl Fn(&str) -> Option<OsString>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Some(value) = lookup(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(value);
    }
    hf_hub::Cache::from_env().path().clone()
}
