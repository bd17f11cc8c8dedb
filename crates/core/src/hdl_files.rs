//! HDL source selection.

/// Extensions picked up when a job does not list its sources explicitly.
pub const HDL_EXTENSIONS: &[&str] = &["v", "sv", "vh"];

pub fn is_hdl_source(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && HDL_EXTENSIONS.contains(&ext))
}

/// Pick the input file set for a job.
///
/// An explicit list wins when it is non-empty; otherwise every path with an
/// HDL extension is taken, sorted for a stable command line. The result may
/// be empty, which callers treat as an input error.
pub fn resolve_sources(explicit: &[String], available: &[String]) -> Vec<String> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    let mut detected: Vec<String> = available
        .iter()
        .filter(|p| is_hdl_source(p))
        .cloned()
        .collect();
    detected.sort();
    detected.dedup();
    detected
}

/// Reject absolute paths and any `..` component.
///
/// Project file paths come from user input and are joined onto the job
/// workspace.
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.starts_with('\\')
        && !path.contains(':')
        && path
            .split(['/', '\\'])
            .all(|part| !part.is_empty() && part != "..")
}
