//! Build context preparation.
//!
//! The build definition is rendered from a template into a fresh temporary
//! directory together with any supporting files. The directory belongs to
//! the [`BuildContext`] and is removed when it is dropped.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use manifold_common::paths::MANIFOLD_TMPDIR;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::error::{PipelineError, PipelineResult};

/// File name of the rendered build definition.
pub const DEFINITION_FILE: &str = "Containerfile";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("static regex")
});

/// Render `{{ .Key }}` placeholders from `params`.
///
/// # Errors
///
/// Returns a preparation error naming every placeholder without a value.
pub fn render(template: &str, params: &BTreeMap<String, String>) -> PipelineResult<String> {
    let mut missing = Vec::new();
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        let key = &caps[1];
        params.get(key).cloned().unwrap_or_else(|| {
            missing.push(key.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(PipelineError::preparation(format!(
            "template references undefined parameter(s): {}",
            missing.join(", ")
        )));
    }
    Ok(rendered.into_owned())
}

/// A rendered build definition in a scoped temporary directory.
#[derive(Debug)]
pub struct BuildContext {
    dir: TempDir,
    definition: PathBuf,
}

impl BuildContext {
    /// Prepare a context under the standard scratch directory.
    ///
    /// # Errors
    ///
    /// Returns a preparation error if rendering fails or the directory
    /// cannot be created or written.
    pub fn prepare(
        template: &str,
        params: &BTreeMap<String, String>,
        files: &[PathBuf],
    ) -> PipelineResult<Self> {
        Self::prepare_in(&MANIFOLD_TMPDIR, template, params, files)
    }

    /// Prepare a context under `parent`.
    ///
    /// # Errors
    ///
    /// Returns a preparation error if rendering fails or the directory
    /// cannot be created or written.
    pub fn prepare_in(
        parent: &Path,
        template: &str,
        params: &BTreeMap<String, String>,
        files: &[PathBuf],
    ) -> PipelineResult<Self> {
        let contents = render(template, params)?;

        fs::create_dir_all(parent).map_err(|e| io_error("create", parent, &e))?;
        let dir = tempfile::Builder::new()
            .prefix("manifold-context-")
            .tempdir_in(parent)
            .map_err(|e| io_error("create", parent, &e))?;

        let definition = dir.path().join(DEFINITION_FILE);
        fs::write(&definition, contents).map_err(|e| io_error("write", &definition, &e))?;

        for file in files {
            copy_into(file, dir.path())?;
        }

        tracing::debug!(
            dir = %dir.path().display(),
            files = files.len(),
            "Build context prepared"
        );

        Ok(Self { dir, definition })
    }

    /// Context directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Rendered build definition.
    #[must_use]
    pub fn definition(&self) -> &Path {
        &self.definition
    }

    /// Remove the context now, reporting failures.
    ///
    /// # Errors
    ///
    /// Returns a preparation error if the directory cannot be removed.
    pub fn close(self) -> PipelineResult<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|e| io_error("remove", &path, &e))
    }
}

/// Copy a file or directory tree into `dest`, keeping its final name.
fn copy_into(source: &Path, dest: &Path) -> PipelineResult<()> {
    let name = source.file_name().ok_or_else(|| {
        PipelineError::preparation(format!("invalid context file {}", source.display()))
    })?;

    if source.is_file() {
        let target = dest.join(name);
        fs::copy(source, &target).map_err(|e| io_error("copy", source, &e))?;
        return Ok(());
    }

    if !source.is_dir() {
        return Err(PipelineError::preparation(format!(
            "context file {} does not exist",
            source.display()
        )));
    }

    let root = dest.join(name);
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| {
            PipelineError::preparation(format!("Failed to walk {}: {e}", source.display()))
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| PipelineError::preparation(e.to_string()))?;
        let target = root.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| io_error("create", &target, &e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| io_error("copy", entry.path(), &e))?;
        }
    }
    Ok(())
}

fn io_error(action: &str, path: &Path, err: &std::io::Error) -> PipelineError {
    PipelineError::preparation(format!("Failed to {action} {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TEMPLATE;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn render_default_template() {
        let rendered = render(
            DEFAULT_TEMPLATE,
            &params(&[("Catalog", "registry.example.com/catalog:v1")]),
        )
        .unwrap();

        insta::assert_snapshot!(rendered.trim(), @r"
        FROM registry.example.com/catalog:v1 AS builder
        USER root
        RUN rm -fr /configs
        COPY ./configs /configs
        USER 1001
        RUN rm -fr /tmp/cache/*
        RUN /bin/opm serve /configs --cache-only --cache-dir=/tmp/cache

        FROM registry.example.com/catalog:v1
        USER root
        RUN rm -fr /configs
        COPY ./configs /configs
        USER 1001
        RUN rm -fr /tmp/cache/*
        COPY --from=builder /tmp/cache /tmp/cache
        ");
    }

    #[test]
    fn render_tolerates_whitespace() {
        let out = render("FROM {{.Base}}:{{   .Tag }}", &params(&[("Base", "alpine"), ("Tag", "3")]))
            .unwrap();
        assert_eq!(out, "FROM alpine:3");
    }

    #[test]
    fn render_rejects_unknown_parameters() {
        let err = render("FROM {{ .Base }} {{ .Missing }}", &params(&[("Base", "alpine")]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Preparation { .. }));
        assert!(err.to_string().contains("Missing"));
    }

    #[test]
    fn context_is_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let configs = src.path().join("configs");
        fs::create_dir_all(configs.join("pkg")).unwrap();
        fs::write(configs.join("pkg/catalog.json"), "{}").unwrap();
        fs::write(src.path().join("extra.txt"), "x").unwrap();

        let context = BuildContext::prepare_in(
            parent.path(),
            "FROM {{ .Base }}",
            &params(&[("Base", "alpine")]),
            &[configs, src.path().join("extra.txt")],
        )
        .unwrap();

        let dir = context.dir().to_path_buf();
        assert_eq!(
            fs::read_to_string(context.definition()).unwrap(),
            "FROM alpine"
        );
        assert!(dir.join("configs/pkg/catalog.json").is_file());
        assert!(dir.join("extra.txt").is_file());

        drop(context);
        assert!(!dir.exists());
    }

    #[test]
    fn concurrent_contexts_do_not_collide() {
        let parent = tempfile::tempdir().unwrap();
        let a = BuildContext::prepare_in(parent.path(), "A", &BTreeMap::new(), &[]).unwrap();
        let b = BuildContext::prepare_in(parent.path(), "B", &BTreeMap::new(), &[]).unwrap();
        assert_ne!(a.dir(), b.dir());
        a.close().unwrap();
        assert_eq!(fs::read_to_string(b.definition()).unwrap(), "B");
    }

    #[test]
    fn missing_context_file_is_a_preparation_error() {
        let parent = tempfile::tempdir().unwrap();
        let err = BuildContext::prepare_in(
            parent.path(),
            "FROM x",
            &BTreeMap::new(),
            &[parent.path().join("nope")],
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Preparation { .. }));
    }
}
