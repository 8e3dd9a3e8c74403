//! On-disk pipeline trees for tests.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Step script that discards its input and emits one resource with three
/// rows `{"v":1}`, `{"v":2}`, `{"v":3}`.
pub const EMIT_ROWS: &str = r#"cat > /dev/null
printf '%s\n' '{"name":"_","resources":[{"name":"numbers"}]}'
printf '\n'
printf '%s\n' '{"v":1}' '{"v":2}' '{"v":3}'
printf '\n'
printf '%s\n' '{"emitted":3}'
"#;

/// Step script that drops the `{"v":2}` row and passes everything else.
pub const DROP_SECOND_ROW: &str = r#"grep -v '"v":2'"#;

/// Step script that passes its input through unchanged.
pub const PASS_THROUGH: &str = "cat";

/// Step script that blocks until killed.
pub const HANG: &str = "exec sleep 30";

/// Step script that prints an error marker and exits with status 3 without
/// reading its input.
pub const FAIL_WITH_ERROR: &str = r#"echo "processing" >&2
echo "ERROR something broke" >&2
echo "  detail line" >&2
exit 3
"#;

/// A temporary directory laid out as a pipeline root.
#[derive(Debug)]
pub struct PipelineTree {
    dir: TempDir,
}

impl Default for PipelineTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineTree {
    /// Creates an empty tree.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        #[allow(clippy::expect_used)]
        let dir = TempDir::new().expect("create temporary pipeline root");
        Self { dir }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `contents` to `rel`, creating parent directories.
    ///
    /// # Panics
    ///
    /// Panics on filesystem errors.
    #[allow(clippy::expect_used)]
    pub fn file(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create fixture directory");
        }
        fs::write(&path, contents).expect("write fixture file");
        path
    }

    /// Writes a `pipeline-spec.yaml` into `dir` (relative, `""` for the root).
    pub fn pipelines(&self, dir: &str, yaml: &str) -> PathBuf {
        self.file(&join(dir, "pipeline-spec.yaml"), yaml)
    }

    /// Writes an executable shell step named `name` into `dir`.
    #[allow(clippy::expect_used)]
    pub fn step(&self, dir: &str, name: &str, body: &str) -> PathBuf {
        let path = self.file(&join(dir, name), &format!("#!/bin/sh\n{body}\n"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .expect("make fixture step executable");
        }
        path
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_writes_files() {
        let tree = PipelineTree::new();
        let spec = tree.pipelines("sub", "p: {pipeline: []}");
        let step = tree.step("sub", "load.sh", PASS_THROUGH);

        assert_eq!(spec, tree.root().join("sub/pipeline-spec.yaml"));
        assert!(fs::read_to_string(step).unwrap().starts_with("#!/bin/sh\ncat"));
    }
}
