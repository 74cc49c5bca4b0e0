use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Job-scoped temporary directory holding staged inputs and produced outputs.
///
/// Layout: `<temp_dir>/geojob_<jobId>_<random>/{input,output}`. The whole
/// tree is removed by [`cleanup`](Self::cleanup), or on drop as a fallback.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    root: PathBuf,
}

impl Workspace {
    pub fn create(temp_dir: &Path, job_id: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("geojob_{}_", sanitize_component(job_id)))
            .tempdir_in(temp_dir)?;
        let root = dir.path().to_path_buf();

        std::fs::create_dir(root.join("input"))?;
        std::fs::create_dir(root.join("output"))?;

        tracing::debug!(job_id, path = %root.display(), "Created workspace");
        Ok(Self {
            dir: Some(dir),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Remove the workspace and everything in it. Calling it again is a no-op.
    pub fn cleanup(&mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => {
                dir.close()?;
                tracing::debug!(path = %self.root.display(), "Removed workspace");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.dir.is_none()
    }
}

/// Keep a job id usable as part of a directory name.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
