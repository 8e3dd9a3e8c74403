//! Finding and reading definition files.

use super::generator::GeneratorRegistry;
use crate::errors::SpecError;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File holding plain pipeline definitions.
pub const PIPELINE_SPEC_FILE: &str = "pipeline-spec.yaml";

/// Suffix of templated source documents.
pub const SOURCE_SPEC_SUFFIX: &str = ".source-spec.yaml";

/// A definition file found under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecFile {
    /// A `pipeline-spec.yaml`.
    Pipelines(PathBuf),
    /// A `<kind>.source-spec.yaml`.
    Source {
        /// Generator kind.
        kind: String,
        /// File path.
        path: PathBuf,
    },
}

/// A pipeline definition before validation and hashing.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawSpec {
    pub pipeline_id: String,
    pub path: PathBuf,
    pub details: Value,
    pub source_details: Value,
    pub errors: Vec<SpecError>,
}

/// Lists definition files under `root`, skipping hidden directories.
///
/// Entries are visited in name order so repeated scans agree.
pub fn find_spec_files(root: &Path) -> io::Result<Vec<SpecFile>> {
    let mut found = Vec::new();
    walk(root, &mut found)?;
    Ok(found)
}

fn walk(dir: &Path, found: &mut Vec<SpecFile>) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);

    let mut subdirs = Vec::new();
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if !name.starts_with('.') {
                subdirs.push(path);
            }
        } else if file_type.is_symlink() && path.is_dir() {
            tracing::debug!(path = %path.display(), "Not following directory symlink");
        } else if name == PIPELINE_SPEC_FILE {
            found.push(SpecFile::Pipelines(path));
        } else if let Some(kind) = name.strip_suffix(SOURCE_SPEC_SUFFIX) {
            if !kind.is_empty() {
                found.push(SpecFile::Source {
                    kind: kind.to_string(),
                    path,
                });
            }
        }
    }
    for subdir in subdirs {
        walk(&subdir, found)?;
    }
    Ok(())
}

/// Pipeline id for `name` defined in `dir`: `./<dir relative to root>/<name>`.
#[must_use]
pub fn pipeline_id(root: &Path, dir: &Path, name: &str) -> String {
    let rel = dir.strip_prefix(root).unwrap_or(dir);
    let mut parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .filter(|c| c != ".")
        .collect();
    parts.push(name.to_string());
    format!("./{}", parts.join("/"))
}

/// Reads one definition file into raw specs.
pub(crate) fn parse_spec_file(
    file: &SpecFile,
    root: &Path,
    generators: &GeneratorRegistry,
) -> Vec<RawSpec> {
    match file {
        SpecFile::Pipelines(path) => parse_pipelines(path, root),
        SpecFile::Source { kind, path } => {
            let dir = parent_dir(path);
            match read_yaml(path) {
                Ok(source) => expand_source(kind, &source, &dir, root, generators),
                Err(e) => vec![file_error(root, &dir, kind, SpecError::invalid_spec_file(e))],
            }
        }
    }
}

fn parse_pipelines(path: &Path, root: &Path) -> Vec<RawSpec> {
    let dir = parent_dir(path);
    let document = match read_yaml(path) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return vec![file_error(
                root,
                &dir,
                "",
                SpecError::invalid_spec_file(format!(
                    "{} must be a mapping of pipeline names to definitions",
                    path.display()
                )),
            )]
        }
        Err(e) => return vec![file_error(root, &dir, "", SpecError::invalid_spec_file(e))],
    };

    document
        .into_iter()
        .map(|(name, details)| RawSpec {
            pipeline_id: pipeline_id(root, &dir, &name),
            path: dir.clone(),
            details,
            source_details: Value::Null,
            errors: Vec::new(),
        })
        .collect()
}

fn expand_source(
    kind: &str,
    source: &Value,
    dir: &Path,
    root: &Path,
    generators: &GeneratorRegistry,
) -> Vec<RawSpec> {
    let Some(generator) = generators.get(kind) else {
        return vec![file_error(
            root,
            dir,
            kind,
            SpecError::new("Unknown source kind", format!("No generator registered for {kind:?}")),
        )];
    };
    if !generator.validate(source) {
        return vec![file_error(
            root,
            dir,
            kind,
            SpecError::new("Invalid Source", format!("Source rejected by the {kind} generator")),
        )];
    }
    let generated = match generator.generate(source, dir) {
        Ok(generated) => generated,
        Err(e) => {
            return vec![file_error(
                root,
                dir,
                kind,
                SpecError::new("Error converting source", e.to_string()),
            )]
        }
    };

    let mut specs = Vec::new();
    for (name, mut details) in generated {
        if let Some(nested) = name.strip_prefix(':').and_then(|n| n.strip_suffix(':')) {
            specs.extend(expand_source(nested, &details, dir, root, generators));
            continue;
        }
        rewrite_dependencies(&mut details, root, dir);
        specs.push(RawSpec {
            pipeline_id: pipeline_id(root, dir, &name),
            path: dir.to_path_buf(),
            details,
            source_details: source.clone(),
            errors: Vec::new(),
        });
    }
    specs
}

/// Makes generated pipeline dependencies relative to the source's directory.
fn rewrite_dependencies(details: &mut Value, root: &Path, dir: &Path) {
    let Some(deps) = details.get_mut("dependencies").and_then(Value::as_array_mut) else {
        return;
    };
    for dep in deps {
        if let Some(Value::String(id)) = dep.get_mut("pipeline") {
            if !id.starts_with("./") {
                *id = pipeline_id(root, dir, id);
            }
        }
    }
}

fn file_error(root: &Path, dir: &Path, name: &str, error: SpecError) -> RawSpec {
    let id = if name.is_empty() {
        pipeline_id(root, dir, "").trim_end_matches('/').to_string()
    } else {
        pipeline_id(root, dir, name)
    };
    RawSpec {
        pipeline_id: id,
        path: dir.to_path_buf(),
        details: Value::Null,
        source_details: Value::Null,
        errors: vec![error],
    }
}

fn read_yaml(path: &Path) -> Result<Value, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    serde_yaml::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::generator::{Generated, GeneratorError, SourceGenerator};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fanout;

    impl SourceGenerator for Fanout {
        fn validate(&self, source: &Value) -> bool {
            source.get("names").is_some()
        }

        fn generate(&self, source: &Value, _base: &Path) -> Result<Generated, GeneratorError> {
            let names = source["names"].as_array().ok_or("names must be a list")?;
            Ok(names
                .iter()
                .filter_map(Value::as_str)
                .map(|n| {
                    (
                        n.to_string(),
                        json!({"pipeline": [{"run": "load"}], "dependencies": [{"pipeline": "base"}]}),
                    )
                })
                .collect())
        }
    }

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    #[test]
    fn test_pipeline_ids() {
        let root = Path::new("/data");
        assert_eq!(pipeline_id(root, Path::new("/data"), "p"), "./p");
        assert_eq!(pipeline_id(root, Path::new("/data/a/b"), "p"), "./a/b/p");
    }

    #[test]
    fn test_find_skips_hidden_directories() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "pipeline-spec.yaml", "p: {pipeline: []}");
        write(dir.path(), "sub/pipeline-spec.yaml", "q: {pipeline: []}");
        write(dir.path(), ".hidden/pipeline-spec.yaml", "h: {pipeline: []}");
        write(dir.path(), "sub/fanout.source-spec.yaml", "names: []");

        let files = find_spec_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![
                SpecFile::Pipelines(dir.path().join("pipeline-spec.yaml")),
                SpecFile::Source {
                    kind: "fanout".to_string(),
                    path: dir.path().join("sub/fanout.source-spec.yaml"),
                },
                SpecFile::Pipelines(dir.path().join("sub/pipeline-spec.yaml")),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_find_does_not_follow_directory_symlinks() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "sub/pipeline-spec.yaml", "q: {pipeline: []}");
        std::os::unix::fs::symlink(dir.path(), dir.path().join("sub/loop")).unwrap();

        let files = find_spec_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![SpecFile::Pipelines(dir.path().join("sub/pipeline-spec.yaml"))]
        );
    }

    #[test]
    fn test_parse_pipeline_file() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "sub/pipeline-spec.yaml",
            "first:\n  pipeline:\n    - run: load\nsecond:\n  pipeline: []\n",
        );
        let specs = parse_spec_file(
            &SpecFile::Pipelines(dir.path().join("sub/pipeline-spec.yaml")),
            dir.path(),
            &GeneratorRegistry::new(),
        );
        let ids: Vec<&str> = specs.iter().map(|s| s.pipeline_id.as_str()).collect();
        assert_eq!(ids, vec!["./sub/first", "./sub/second"]);
        assert_eq!(specs[0].details["pipeline"][0]["run"], "load");
        assert!(specs.iter().all(|s| s.errors.is_empty()));
    }

    #[test]
    fn test_broken_yaml_is_one_invalid_spec() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "pipeline-spec.yaml", "p: [unclosed");
        let specs = parse_spec_file(
            &SpecFile::Pipelines(dir.path().join("pipeline-spec.yaml")),
            dir.path(),
            &GeneratorRegistry::new(),
        );
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].errors[0].short, "Invalid Pipeline Spec");
    }

    #[test]
    fn test_source_spec_expansion() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/fanout.source-spec.yaml", "names: [x, y]");
        let registry = GeneratorRegistry::new();
        registry.register("fanout", Arc::new(Fanout));

        let specs = parse_spec_file(
            &SpecFile::Source {
                kind: "fanout".to_string(),
                path: dir.path().join("src/fanout.source-spec.yaml"),
            },
            dir.path(),
            &registry,
        );
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].pipeline_id, "./src/x");
        assert_eq!(specs[0].details["dependencies"][0]["pipeline"], "./src/base");
        assert_eq!(specs[0].source_details, json!({"names": ["x", "y"]}));
    }

    #[test]
    fn test_source_spec_errors() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.source-spec.yaml", "names: [x]");
        write(dir.path(), "fanout.source-spec.yaml", "other: 1");
        let registry = GeneratorRegistry::new();
        registry.register("fanout", Arc::new(Fanout));

        let unknown = parse_spec_file(
            &SpecFile::Source {
                kind: "a".to_string(),
                path: dir.path().join("a.source-spec.yaml"),
            },
            dir.path(),
            &registry,
        );
        assert_eq!(unknown[0].pipeline_id, "./a");
        assert_eq!(unknown[0].errors[0].short, "Unknown source kind");

        let invalid = parse_spec_file(
            &SpecFile::Source {
                kind: "fanout".to_string(),
                path: dir.path().join("fanout.source-spec.yaml"),
            },
            dir.path(),
            &registry,
        );
        assert_eq!(invalid[0].errors[0].short, "Invalid Source");
    }
}
