//! Recursive export of a finished shard tree.
//!
//! The build phase writes under `<model_out_path>faiss/`. Once every worker has
//! finished, the whole tree is copied to
//! `<model_export_path><experiment_name>.ptm.msd/faiss/`. Local trees are
//! copied with the filesystem; as soon as either side is an object-store URL
//! the copy is delegated to `aws s3 cp --recursive`.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{GlaiveError, Result};
use crate::storage::url::{ensure_dir, endpoint_from_env, is_object_store_url, use_s3};

/// Tool used to copy an exported tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyTool {
    /// Plain recursive filesystem copy.
    Local,
    /// `aws s3 cp --recursive`.
    AwsCli,
}

impl CopyTool {
    /// Select the copy tool for a source/destination pair.
    pub fn select(src: &str, dst: &str) -> Self {
        if is_object_store_url(src) || is_object_store_url(dst) {
            CopyTool::AwsCli
        } else {
            CopyTool::Local
        }
    }
}

/// A resolved source/destination pair for exporting the shard tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPlan {
    pub src: String,
    pub dst: String,
    pub tool: CopyTool,
}

impl ExportPlan {
    /// Plan the copy of `<model_out_path>faiss/` to the experiment's export location.
    pub fn new(model_out_path: &str, model_export_path: &str, experiment_name: &str) -> Self {
        let src = use_s3(&format!("{}faiss/", ensure_dir(model_out_path)));
        let dst = use_s3(&format!(
            "{}{}.ptm.msd/faiss/",
            ensure_dir(model_export_path),
            experiment_name
        ));
        let tool = CopyTool::select(&src, &dst);
        ExportPlan { src, dst, tool }
    }

    /// Command line used by [`CopyTool::AwsCli`].
    pub fn aws_args(&self) -> Vec<String> {
        let mut args = vec!["s3".to_string(), "cp".to_string()];
        if let Some(endpoint) = endpoint_from_env() {
            args.push("--endpoint-url".to_string());
            args.push(endpoint);
        }
        args.push("--recursive".to_string());
        args.push(self.src.clone());
        args.push(self.dst.clone());
        args
    }

    /// Execute the copy. Any failure is fatal and not retried.
    pub async fn execute(&self) -> Result<()> {
        info!(src = %self.src, dst = %self.dst, tool = ?self.tool, "exporting shard tree");
        match self.tool {
            CopyTool::Local => {
                let src = PathBuf::from(&self.src);
                let dst = PathBuf::from(&self.dst);
                tokio::task::spawn_blocking(move || copy_dir_recursive(&src, &dst))
                    .await
                    .map_err(|e| GlaiveError::other(format!("export task failed: {e}")))?
            }
            CopyTool::AwsCli => {
                let args = self.aws_args();
                debug!(?args, "running aws cli");
                let status = Command::new("aws").args(&args).status().await?;
                if status.success() {
                    Ok(())
                } else {
                    Err(GlaiveError::storage(format!(
                        "copy {} -> {} failed with {status}",
                        self.src, self.dst
                    )))
                }
            }
        }
    }
}

/// Copy the contents of `src` into `dst`, creating `dst` when missing.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(GlaiveError::storage(format!(
            "export source is not a directory: {}",
            src.display()
        )));
    }

    std::fs::create_dir_all(dst)
        .map_err(|e| GlaiveError::storage(format!("{}: {e}", dst.display())))?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| {
                GlaiveError::storage(format!("{} -> {}: {e}", entry.path().display(), target.display()))
            })?;
        }
    }
    Ok(())
}
