//! DataSink interface - copy results into an output tree.
//!
//! Every connected port names a destination folder. Dots nest folders and
//! segments starting with `@` add none, so `contrasts.@T` lands in
//! `<base_directory>/<container>/contrasts/`. Instances inside a sweep add
//! their parameter directories below the folder.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::types::{InputField, Interface, InterfaceResult, RunContext};
use crate::error::{Error, Result};

/// Output port listing every copied path.
pub const SINK_OUTPUT: &str = "out_file";

/// DataSink interface implementation.
pub struct DataSinkInterface;

impl DataSinkInterface {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DataSinkInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SinkConfig {
    base_directory: PathBuf,
    #[serde(default)]
    container: Option<String>,
    /// Nest results under the instance's parameter directories
    #[serde(default = "default_true")]
    parameterization: bool,
    /// `[from, to]` pairs applied to destination paths below the base
    #[serde(default)]
    substitutions: Vec<(String, String)>,
}

fn default_true() -> bool {
    true
}

fn parse_config(config: &Value) -> Result<SinkConfig> {
    serde_json::from_value(config.clone())
        .map_err(|e| Error::Node(format!("Invalid datasink config: {}", e)))
}

/// Folders a port name maps to: `contrasts.@T` -> `[contrasts]`.
pub fn port_folders(port: &str) -> Vec<&str> {
    port.split('.')
        .filter(|segment| !segment.is_empty() && !segment.starts_with('@'))
        .collect()
}

fn collect_files<'a>(node_id: &str, port: &str, value: &'a Value, out: &mut Vec<&'a str>) -> Result<()> {
    match value {
        Value::Null => Ok(()),
        Value::String(path) => {
            out.push(path);
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| collect_files(node_id, port, item, out)),
        other => Err(Error::Validation(format!(
            "Node '{}': datasink input '{}' must be paths, got {}",
            node_id, port, other
        ))),
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::Node(format!("Cannot read {}: {}", src.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl Interface for DataSinkInterface {
    fn name(&self) -> &str {
        "datasink"
    }

    fn description(&self) -> &str {
        "Copy results into a structured output directory"
    }

    /// Any port is accepted; the config is still checked up front.
    fn input_spec(&self, config: &Value) -> Result<Option<Vec<InputField>>> {
        parse_config(config)?;
        Ok(None)
    }

    fn output_names(&self, _config: &Value) -> Result<Option<Vec<String>>> {
        Ok(Some(vec![SINK_OUTPUT.to_string()]))
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn run(&self, config: &Value, ctx: &RunContext) -> Result<InterfaceResult> {
        let config = parse_config(config)?;
        let base = if config.base_directory.is_absolute() {
            config.base_directory.clone()
        } else {
            std::env::current_dir()?.join(&config.base_directory)
        };

        let mut copied = Vec::new();
        for (port, value) in &ctx.inputs {
            let mut files = Vec::new();
            collect_files(&ctx.node_id, port, value, &mut files)?;

            let mut folder = PathBuf::new();
            if let Some(container) = &config.container {
                folder.push(container);
            }
            for segment in port_folders(port) {
                folder.push(segment);
            }
            if config.parameterization {
                for dir in &ctx.param_dirs {
                    folder.push(dir);
                }
            }

            for file in files {
                let src = Path::new(file);
                let name = src.file_name().ok_or_else(|| {
                    Error::Validation(format!(
                        "Node '{}': datasink input '{}' has no file name: {}",
                        ctx.node_id, port, file
                    ))
                })?;
                let mut relative = folder.join(name).to_string_lossy().into_owned();
                for (from, to) in &config.substitutions {
                    relative = relative.replace(from.as_str(), to);
                }
                let dest = base.join(&relative);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }

                if src.is_dir() {
                    let (src, dest) = (src.to_path_buf(), dest.clone());
                    tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
                        .await
                        .map_err(|e| Error::Internal(format!("Copy task failed: {}", e)))??;
                } else {
                    tokio::fs::copy(src, &dest).await.map_err(|e| {
                        Error::Node(format!("Cannot copy {} to {}: {}", file, dest.display(), e))
                    })?;
                }
                debug!(node_id = %ctx.node_id, src = %file, dest = %dest.display(), "Sunk file");
                copied.push(Value::String(dest.to_string_lossy().into_owned()));
            }
        }

        let count = copied.len();
        let out = if count == 1 {
            copied.remove(0)
        } else {
            Value::Array(copied)
        };
        let mut outputs = BTreeMap::new();
        outputs.insert(SINK_OUTPUT.to_string(), out);
        Ok(InterfaceResult::new(outputs).with_runtime(json!({
            "base_directory": base,
            "copied": count,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_folders() {
        assert_eq!(port_folders("contrasts.@T"), vec!["contrasts"]);
        assert_eq!(port_folders("model.stats.@beta"), vec!["model", "stats"]);
        assert!(port_folders("@T").is_empty());
        assert_eq!(port_folders("smoothed"), vec!["smoothed"]);
    }

    #[tokio::test]
    async fn test_copies_into_port_folders() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let spm_t = src.path().join("spmT_0001.img");
        let beta = src.path().join("beta_0001.img");
        std::fs::write(&spm_t, b"t-map").unwrap();
        std::fs::write(&beta, b"beta").unwrap();

        let config = json!({
            "base_directory": out.path(),
            "container": "s1",
            "substitutions": [["_0001", ""]],
        });
        let ctx = RunContext::new("datasink", src.path().to_path_buf())
            .with_inputs(BTreeMap::from([
                ("contrasts.@T".to_string(), json!([spm_t.to_string_lossy()])),
                ("@beta".to_string(), json!(beta.to_string_lossy())),
            ]))
            .with_param_dirs(vec!["_fwhm_4".to_string()]);

        let result = DataSinkInterface::new().run(&config, &ctx).await.unwrap();
        assert_eq!(result.outputs[SINK_OUTPUT].as_array().unwrap().len(), 2);

        let t_dest = out.path().join("s1/contrasts/_fwhm_4/spmT.img");
        assert_eq!(std::fs::read(t_dest).unwrap(), b"t-map");
        assert!(out.path().join("s1/_fwhm_4/beta.img").exists());
    }

    #[tokio::test]
    async fn test_copies_directories_without_parameterization() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let surf = src.path().join("surf");
        std::fs::create_dir_all(surf.join("lh")).unwrap();
        std::fs::write(surf.join("lh/white"), b"mesh").unwrap();

        let config = json!({ "base_directory": out.path(), "parameterization": false });
        let ctx = RunContext::new("datasink", src.path().to_path_buf())
            .with_inputs(BTreeMap::from([("recon".to_string(), json!(surf.to_string_lossy()))]))
            .with_param_dirs(vec!["_subject_s1".to_string()]);

        let result = DataSinkInterface::new().run(&config, &ctx).await.unwrap();
        assert!(result.outputs[SINK_OUTPUT].as_str().unwrap().ends_with("recon/surf"));
        assert_eq!(std::fs::read(out.path().join("recon/surf/lh/white")).unwrap(), b"mesh");
    }

    #[test]
    fn test_config_checked_at_validation() {
        let iface = DataSinkInterface::new();
        assert!(iface.input_spec(&Value::Null).is_err());
        assert!(iface
            .input_spec(&json!({ "base_directory": "out" }))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rejects_non_path_values() {
        let out = tempfile::tempdir().unwrap();
        let config = json!({ "base_directory": out.path() });
        let ctx = RunContext::new("datasink", PathBuf::from("/tmp"))
            .with_inputs(BTreeMap::from([("stats".to_string(), json!(4.5))]));
        let err = DataSinkInterface::new().run(&config, &ctx).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
