//! Wires a submission into the assignment: links shared files into its
//! evaluation directory and publishes rendered output into the as-rendered,
//! graded and de-anonymized trees.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use agh_core::fs::{
    absolute_path, ensure_dir, full_suffix, relative_path, remove_file_if_exists, sha256_bytes,
    sha256_file, symlink,
};
use agh_core::{AghError, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::assignment::Assignment;
use crate::submission::{
    output_info_key, Submission, META_COMPLETED_OUTPUT, META_GRADED, META_GRADED_DIGEST,
    META_NON_ANON,
};

/// What to do when a link destination already exists and does not point at
/// the expected source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPolicy {
    RaiseError,
    Ignore,
    Overwrite,
}

/// Receives human-readable warnings raised while post-processing.
pub type WarningSink<'a> = &'a mut dyn FnMut(String);

/// Whether the file's birth time still equals its modification time. Where
/// the filesystem does not report a birth time, the status-change time
/// stands in for it.
fn birth_matches_modified(meta: &fs::Metadata) -> Result<bool> {
    match meta.created() {
        Ok(created) => Ok(created == meta.modified()?),
        Err(e) if e.kind() == io::ErrorKind::Unsupported => Ok(status_change_matches(meta)),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn status_change_matches(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    meta.ctime() == meta.mtime() && meta.ctime_nsec() == meta.mtime_nsec()
}

#[cfg(not(unix))]
fn status_change_matches(_meta: &fs::Metadata) -> bool {
    true
}

/// True while the graded copy is still what the pipeline wrote. When a digest
/// was recorded at copy time the content decides, which also catches saves
/// that replace the file through a rename. Older submissions without a digest
/// fall back to comparing birth and modification times.
fn looks_unedited(path: &Path, recorded_digest: Option<&str>) -> Result<bool> {
    match recorded_digest {
        Some(digest) => Ok(sha256_file(path)? == digest),
        None => birth_matches_modified(&fs::metadata(path)?),
    }
}

fn resolve_link_source(source: &Path) -> Result<PathBuf> {
    let meta = fs::symlink_metadata(source)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(source)?;
        let target = if target.is_absolute() {
            target
        } else {
            source.parent().unwrap_or_else(|| Path::new("")).join(target)
        };
        return absolute_path(&target);
    }
    absolute_path(source)
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|s| s.to_string_lossy().into_owned())
}

impl Assignment {
    /// Sources to link into a submission's evaluation directory, in order:
    /// the tests directory, every template entry, then optional files that
    /// should be present but are not.
    fn link_sources(&self, submission: &Submission) -> Result<Vec<PathBuf>> {
        let layout = self.layout();
        let mut sources = vec![layout.tests.clone()];
        if layout.template.is_dir() {
            let mut entries = Vec::new();
            for entry in fs::read_dir(&layout.template)? {
                entries.push(entry?.path());
            }
            entries.sort();
            sources.extend(entries);
        }
        for file in self.data.optional_files.values() {
            if !file.copy_to_sub_if_missing {
                continue;
            }
            let name = file.file_name();
            if name.is_empty() || submission.evaluation_directory().join(&name).exists() {
                continue;
            }
            let source = if file.path.is_absolute() {
                file.path.clone()
            } else {
                self.root().join(&file.path)
            };
            if sources.iter().any(|s| file_name_of(s).as_deref() == Some(name.as_str())) {
                continue;
            }
            sources.push(source);
        }
        Ok(sources)
    }

    /// Links shared files into the submission, then runs
    /// [`Assignment::post_process_render`].
    pub fn post_process_submission(
        &self,
        submission: &mut Submission,
        policy: LinkPolicy,
        warn_sink: WarningSink<'_>,
    ) -> Result<()> {
        for source in self.link_sources(submission)? {
            if fs::symlink_metadata(&source).is_err() {
                debug!(source = %source.display(), "link source does not exist; skipping");
                continue;
            }
            let name = match file_name_of(&source) {
                Some(name) => name,
                None => continue,
            };
            let dest = submission.evaluation_directory().join(&name);
            let target = resolve_link_source(&source)?;

            if let Ok(meta) = fs::symlink_metadata(&dest) {
                if meta.file_type().is_symlink() && fs::read_link(&dest)? == target {
                    continue;
                }
                match policy {
                    LinkPolicy::RaiseError => return Err(AghError::Conflict(dest)),
                    LinkPolicy::Ignore => {
                        debug!(dest = %dest.display(), "link destination exists; leaving it");
                        continue;
                    }
                    LinkPolicy::Overwrite => {
                        if meta.is_dir() {
                            fs::remove_dir_all(&dest)?;
                        } else {
                            fs::remove_file(&dest)?;
                        }
                    }
                }
            }
            debug!(link = %dest.display(), target = %target.display(), "linking");
            symlink(&target, &dest)?;
        }
        self.post_process_render(submission, warn_sink)
    }

    /// Publishes each configured output file that exists in the evaluation
    /// directory, then saves the submission.
    ///
    /// The graded copy is only (re)written while it looks unedited; otherwise
    /// `warn_sink` is told and the copy is kept.
    pub fn post_process_render(
        &self,
        submission: &mut Submission,
        warn_sink: WarningSink<'_>,
    ) -> Result<()> {
        let layout = self.layout();
        for output_name in self.options().output_files() {
            let rendered = submission.evaluation_directory().join(&output_name);
            if !rendered.is_file() {
                debug!(file = %rendered.display(), "rendered output not present");
                continue;
            }
            let suffix = full_suffix(&output_name).to_string();
            let complete = layout
                .as_rendered
                .join(format!("{}{}", submission.name(), suffix));
            let graded = layout.graded.join(
                complete
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(&output_name)),
            );
            let non_anon = layout
                .de_anonymized
                .join(format!("{}{}", submission.original_name(), suffix));

            let md = submission.metadata_mut();
            md.set(
                &output_info_key(META_COMPLETED_OUTPUT)?,
                Value::String(complete.display().to_string()),
            );
            md.set(
                &output_info_key(META_GRADED)?,
                Value::String(graded.display().to_string()),
            );
            md.set(
                &output_info_key(META_NON_ANON)?,
                Value::String(non_anon.display().to_string()),
            );

            let digest_key = output_info_key(META_GRADED_DIGEST)?;
            let recorded = submission
                .metadata()
                .get(&digest_key)
                .and_then(Value::as_str)
                .map(str::to_string);
            ensure_dir(&layout.graded)?;
            if !graded.exists() || looks_unedited(&graded, recorded.as_deref())? {
                let bytes = fs::read(&rendered)?;
                remove_file_if_exists(&graded)?;
                fs::write(&graded, &bytes)?;
                submission
                    .metadata_mut()
                    .set(&digest_key, Value::String(sha256_bytes(&bytes)));
                info!(graded = %graded.display(), "copied rendered output");
            } else {
                let message = format!(
                    "The graded output file \"{}\" already exists and appears modified. {} will not be overwritten.",
                    graded.display(),
                    graded.display()
                );
                warn!("{}", message);
                warn_sink(message);
            }

            for (link, target) in [(&complete, &rendered), (&non_anon, &graded)] {
                let parent = link.parent().unwrap_or_else(|| Path::new(""));
                ensure_dir(parent)?;
                remove_file_if_exists(link)?;
                symlink(&relative_path(target, parent)?, link)?;
            }
        }
        submission.save()
    }

    /// Creates, saves and links a new submission.
    pub fn add_submission(
        &self,
        file: &Path,
        override_anon: Option<bool>,
        warn_sink: WarningSink<'_>,
    ) -> Result<Submission> {
        let mut submission = Submission::create(self, file, override_anon)?;
        submission.save()?;
        self.post_process_submission(&mut submission, LinkPolicy::RaiseError, warn_sink)?;
        Ok(submission)
    }
}
