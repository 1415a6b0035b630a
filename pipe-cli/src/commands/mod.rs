pub mod cache;
pub mod init;
pub mod inspect;
pub mod list;
pub mod run;
pub mod validate;

use std::path::Path;

use color_eyre::Result;
use pipe_core::{load_pipeline, load_pipeline_from_path, Paths, Pipeline};

/// Resolve a run argument: an existing `.yaml`/`.yml` path is loaded
/// directly (named after its file stem); anything else is a pipeline name
/// under the files directory.
pub(crate) fn resolve_pipeline(paths: &Paths, name: &str) -> Result<Pipeline> {
    let path = Path::new(name);
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "yaml" || e == "yml");

    if is_yaml && path.exists() {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("pipeline");
        Ok(load_pipeline_from_path(path, stem)?)
    } else {
        Ok(load_pipeline(paths, name)?)
    }
}
