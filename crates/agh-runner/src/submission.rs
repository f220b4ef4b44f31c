use std::fs;
use std::path::{Path, PathBuf};

use agh_core::anonymizer::{anonymize, parse_submission_name};
use agh_core::codec::{self, Field, Record};
use agh_core::fs::{absolute_path, ensure_dir, find_file_in_parents, remove_file_if_exists, set_mode};
use agh_core::{AghError, KeyPath, Metadata, Result};
use serde_json::Value;
use tracing::{debug, info};

use crate::archive;
use crate::assignment::Assignment;

pub const SUBMISSION_FILE_NAME: &str = "submission.json";
pub const AS_SUBMITTED_DIR_NAME: &str = "as_submitted";

pub(crate) const META_INTERNAL: &str = "AGH_INTERNAL";
pub(crate) const META_SUBMISSION: &str = "SUBMISSION";
pub(crate) const META_OUTPUT_INFO: &str = "OUTPUT_INFO";
pub(crate) const META_COMPLETED_OUTPUT: &str = "COMPLETED_OUTPUT";
pub(crate) const META_GRADED: &str = "GRADED";
pub(crate) const META_NON_ANON: &str = "NON_ANON";
pub(crate) const META_GRADED_DIGEST: &str = "GRADED_SHA256";

pub(crate) fn output_info_key(leaf: &str) -> Result<KeyPath> {
    KeyPath::new([META_INTERNAL, META_SUBMISSION, META_OUTPUT_INFO, leaf])
}

fn notice_key(list: &str, key: &str) -> Result<KeyPath> {
    KeyPath::new([META_INTERNAL, META_SUBMISSION, list, key])
}

fn notice_list_key(list: &str) -> Result<KeyPath> {
    KeyPath::new([META_INTERNAL, META_SUBMISSION, list])
}

/// Persisted part of a submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionData {
    pub submission_file: PathBuf,
    pub evaluation_directory: PathBuf,
    pub anon_name: String,
    pub original_name: String,
    pub initial_missing_files: Option<Vec<String>>,
    pub section: Option<String>,
    pub metadata: Metadata,
}

impl Record for SubmissionData {
    const NAME: &'static str = "Submission";

    fn fields() -> Vec<Field<Self>> {
        vec![
            Field::<Self>::path("submission_file", |r| &r.submission_file, |r| &mut r.submission_file),
            Field::<Self>::path(
                "evaluation_directory",
                |r| &r.evaluation_directory,
                |r| &mut r.evaluation_directory,
            ),
            Field::<Self>::scalar("anon_name", |r| &r.anon_name, |r| &mut r.anon_name),
            Field::<Self>::scalar("original_name", |r| &r.original_name, |r| &mut r.original_name),
            Field::<Self>::scalar(
                "initial_missing_files",
                |r| &r.initial_missing_files,
                |r| &mut r.initial_missing_files,
            )
            .optional(),
            Field::<Self>::scalar("section", |r| &r.section, |r| &mut r.section).optional(),
            Field::<Self>::plain("metadata", |r| &r.metadata, |r| &mut r.metadata).optional(),
        ]
    }
}

/// Paths of a submission's main output, in pipeline order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MainOutputFiles {
    /// Last configured output present in the evaluation directory.
    pub rendered: Option<PathBuf>,
    pub complete: Option<PathBuf>,
    pub graded: Option<PathBuf>,
    pub non_anonymous: Option<PathBuf>,
}

/// A validated submission: its file and evaluation directory exist.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    data: SubmissionData,
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)?;
    Ok(())
}

/// Copies `from` over `to`, replacing links and read-only files.
fn copy_into(from: &Path, to: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(to) {
        if meta.file_type().is_symlink() {
            remove_file_if_exists(to)?;
        } else if meta.is_file() {
            set_mode(to, 0o644)?;
        }
    }
    fs::copy(from, to)?;
    set_mode(to, 0o644)
}

impl Submission {
    pub fn new(data: SubmissionData) -> Result<Self> {
        if !data.submission_file.is_file() {
            return Err(AghError::Validation(format!(
                "submission file '{}' does not exist or is not a file",
                data.submission_file.display()
            )));
        }
        if !data.evaluation_directory.is_dir() {
            return Err(AghError::Validation(format!(
                "evaluation directory '{}' does not exist or is not a directory",
                data.evaluation_directory.display()
            )));
        }
        Ok(Submission { data })
    }

    /// Moves `file` into a new evaluation directory and prepares it.
    ///
    /// `override_anon` forces (`Some(true)`) or suppresses (`Some(false)`)
    /// anonymization regardless of the assignment setting.
    pub fn create(assignment: &Assignment, file: &Path, override_anon: Option<bool>) -> Result<Self> {
        if !file.is_file() {
            return Err(AghError::NotFound(file.display().to_string()));
        }
        let file = absolute_path(file)?;
        let original_name = file
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| AghError::Validation(format!("{} has no file name", file.display())))?;

        let parsed = parse_submission_name(&original_name);
        let make_anon = override_anon.unwrap_or_else(|| assignment.options().anonymize_names());
        let anon_name = if make_anon {
            assignment.with_identity(|id| anonymize(&original_name, id))?
        } else {
            parsed.identity.clone()
        };

        let evaluation_directory = assignment.layout().evaluations.join(&anon_name);
        let as_submitted = evaluation_directory.join(AS_SUBMITTED_DIR_NAME);
        ensure_dir(&as_submitted)?;

        let stored_name = parsed.base_file_name.clone().unwrap_or_else(|| original_name.clone());
        let submission_file = as_submitted.join(&stored_name);
        move_file(&file, &submission_file)?;
        info!(
            submission = %anon_name,
            file = %submission_file.display(),
            "created submission"
        );

        let mut submission = Submission::new(SubmissionData {
            submission_file,
            evaluation_directory,
            anon_name,
            original_name,
            ..SubmissionData::default()
        })?;
        submission.post_process_new(assignment, parsed.base_file_name.as_deref())?;
        Ok(submission)
    }

    /// Loads from `submission.json` in `path` or its nearest ancestor, or from
    /// `path` itself when it names a file.
    pub fn load(path: &Path) -> Result<Self> {
        let path = absolute_path(path)?;
        let file = if path.is_dir() {
            find_file_in_parents(&path, SUBMISSION_FILE_NAME).ok_or_else(|| {
                AghError::NotFound(format!(
                    "{} in {} or any parent directory",
                    SUBMISSION_FILE_NAME,
                    path.display()
                ))
            })?
        } else if path.is_file() {
            path
        } else {
            return Err(AghError::NotFound(path.display().to_string()));
        };
        Submission::new(codec::load(&file)?)
    }

    pub fn save(&self) -> Result<()> {
        codec::save(&self.data, &self.file())
    }

    pub fn file(&self) -> PathBuf {
        self.data.evaluation_directory.join(SUBMISSION_FILE_NAME)
    }

    pub fn data(&self) -> &SubmissionData {
        &self.data
    }

    pub fn name(&self) -> &str {
        &self.data.anon_name
    }

    pub fn original_name(&self) -> &str {
        &self.data.original_name
    }

    pub fn submission_file(&self) -> &Path {
        &self.data.submission_file
    }

    pub fn evaluation_directory(&self) -> &Path {
        &self.data.evaluation_directory
    }

    pub fn as_submitted_dir(&self) -> PathBuf {
        self.data.evaluation_directory.join(AS_SUBMITTED_DIR_NAME)
    }

    pub fn initial_missing_files(&self) -> Option<&[String]> {
        self.data.initial_missing_files.as_deref()
    }

    pub fn section(&self) -> Option<&str> {
        self.data.section.as_deref()
    }

    pub fn set_section(&mut self, section: Option<String>) {
        self.data.section = section;
    }

    pub fn metadata(&self) -> &Metadata {
        &self.data.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.data.metadata
    }

    /// Re-runs unpacking and copying; files already copied are overwritten.
    pub fn fix(&mut self, assignment: &Assignment) -> Result<()> {
        self.post_process_new(assignment, None)
    }

    fn post_process_new(&mut self, assignment: &Assignment, base_file_name: Option<&str>) -> Result<()> {
        let as_submitted = self.as_submitted_dir();
        ensure_dir(&as_submitted)?;
        archive::unlock_files(&as_submitted)?;

        let unpacked = archive::unpack(&self.data.submission_file, &as_submitted)?;
        if unpacked.is_none() {
            if let Some(base) = base_file_name {
                copy_into(&self.data.submission_file, &self.data.evaluation_directory.join(base))?;
            }
        }

        if self.data.initial_missing_files.is_none() {
            self.data.initial_missing_files = Some(self.check_missing_files(assignment)?);
        }

        for name in archive::file_names(&as_submitted)? {
            let src = as_submitted.join(&name);
            if src.is_file() && assignment.is_registered_file_name(&name) {
                debug!(file = %name, "copying registered file into evaluation directory");
                copy_into(&src, &self.data.evaluation_directory.join(&name))?;
            }
        }
        archive::lock_files(&as_submitted)
    }

    /// Required file names absent from `as_submitted`.
    pub fn check_missing_files(&self, assignment: &Assignment) -> Result<Vec<String>> {
        let as_submitted = self.as_submitted_dir();
        let present = if as_submitted.is_dir() {
            archive::file_names(&as_submitted)?
        } else {
            Vec::new()
        };
        Ok(assignment
            .required_file_names()
            .into_iter()
            .filter(|name| !present.contains(name))
            .collect())
    }

    fn notices(&self, list: &str) -> Result<Vec<String>> {
        let key = notice_list_key(list)?;
        Ok(self
            .data
            .metadata
            .get_map(&key)
            .map(|m| {
                m.values()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Stored errors only.
    pub fn stored_errors(&self) -> Result<Vec<String>> {
        self.notices("errors")
    }

    /// Stored errors plus conditions checked on every call: a missing
    /// evaluation or `as_submitted` directory and missing required files.
    /// The live conditions are never persisted.
    pub fn errors(&self, assignment: &Assignment) -> Result<Vec<String>> {
        let mut errors = self.stored_errors()?;
        if !self.data.evaluation_directory.is_dir() {
            errors.push(format!(
                "Evaluation directory '{}' does not exist.",
                self.data.evaluation_directory.display()
            ));
        }
        let as_submitted = self.as_submitted_dir();
        if !as_submitted.is_dir() {
            errors.push(format!(
                "Submission directory '{}' does not exist.",
                as_submitted.display()
            ));
            return Ok(errors);
        }
        let missing = self.check_missing_files(assignment)?;
        if !missing.is_empty() {
            errors.push(format!(
                "Missing required file{}: {}",
                if missing.len() > 1 { "s" } else { "" },
                missing.join(", ")
            ));
        }
        Ok(errors)
    }

    pub fn warnings(&self) -> Result<Vec<String>> {
        self.notices("warnings")
    }

    pub fn add_error(&mut self, key: &str, message: &str) -> Result<&mut Self> {
        let k = notice_key("errors", key)?;
        self.data.metadata.set(&k, Value::String(message.to_string()));
        Ok(self)
    }

    pub fn del_error(&mut self, key: &str) -> Result<&mut Self> {
        let k = notice_key("errors", key)?;
        self.data.metadata.remove(&k);
        Ok(self)
    }

    pub fn add_warning(&mut self, key: &str, message: &str) -> Result<&mut Self> {
        let k = notice_key("warnings", key)?;
        self.data.metadata.set(&k, Value::String(message.to_string()));
        Ok(self)
    }

    pub fn del_warning(&mut self, key: &str) -> Result<&mut Self> {
        let k = notice_key("warnings", key)?;
        self.data.metadata.remove(&k);
        Ok(self)
    }

    pub fn main_output_files(&self, assignment: &Assignment) -> Result<MainOutputFiles> {
        let rendered = assignment
            .options()
            .output_files()
            .iter()
            .map(|name| self.data.evaluation_directory.join(name))
            .filter(|p| p.exists())
            .last();
        let recorded = |leaf: &str| -> Result<Option<PathBuf>> {
            Ok(self
                .data
                .metadata
                .get(&output_info_key(leaf)?)
                .and_then(Value::as_str)
                .map(PathBuf::from))
        };
        Ok(MainOutputFiles {
            rendered,
            complete: recorded(META_COMPLETED_OUTPUT)?,
            graded: recorded(META_GRADED)?,
            non_anonymous: recorded(META_NON_ANON)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SubmissionFileData;
    use crate::test_support::temp_assignment;

    #[cfg(unix)]
    fn mode_of(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).expect("metadata").permissions().mode() & 0o777
    }

    #[test]
    fn adding_a_misnamed_file_reports_it_missing() {
        let (_dir, mut assignment) = temp_assignment();
        assignment.add_required_file(SubmissionFileData::new("main.c").with_kind("c"));
        assignment.create_missing_directories().expect("dirs");
        let raw = assignment.layout().unprocessed.join("alice-420.c");
        fs::write(&raw, "int main() { return 0; }\n").expect("write");

        let sub = Submission::create(&assignment, &raw, None).expect("create");
        sub.save().expect("save");

        let eval = sub.evaluation_directory().to_path_buf();
        assert_eq!(eval.parent(), Some(assignment.layout().evaluations.as_path()));
        assert_eq!(eval.file_name().and_then(|s| s.to_str()), Some(sub.name()));
        assert_eq!(sub.name().split('-').count(), 4);
        let stored = eval.join(AS_SUBMITTED_DIR_NAME).join("alice-420.c");
        assert!(stored.is_file());
        assert!(!raw.exists());
        #[cfg(unix)]
        assert_eq!(mode_of(&stored), 0o400);
        assert!(!eval.join("main.c").exists());

        let loaded = Submission::load(&eval).expect("load");
        assert_eq!(loaded.check_missing_files(&assignment).expect("check"), vec!["main.c"]);
        assert_eq!(loaded.initial_missing_files(), Some(&["main.c".to_string()][..]));
        assert_eq!(loaded.original_name(), "alice-420.c");
    }

    #[test]
    fn live_errors_clear_while_initial_missing_is_kept() {
        let (_dir, mut assignment) = temp_assignment();
        assignment
            .add_required_file(SubmissionFileData::new("a.c"))
            .add_required_file(SubmissionFileData::new("b.h"));
        assignment.create_missing_directories().expect("dirs");
        let raw = assignment.layout().unprocessed.join("a.c");
        fs::write(&raw, "int a;").expect("write");

        let mut sub = Submission::create(&assignment, &raw, Some(true)).expect("create");
        assert_eq!(sub.check_missing_files(&assignment).expect("check"), vec!["b.h"]);
        let errors = sub.errors(&assignment).expect("errors");
        assert_eq!(errors, vec!["Missing required file: b.h".to_string()]);
        assert!(sub.evaluation_directory().join("a.c").is_file());

        fs::write(sub.as_submitted_dir().join("b.h"), "#pragma once").expect("write");
        assert!(sub.check_missing_files(&assignment).expect("check").is_empty());
        assert!(sub.errors(&assignment).expect("errors").is_empty());
        sub.fix(&assignment).expect("fix");
        assert_eq!(sub.initial_missing_files(), Some(&["b.h".to_string()][..]));
        assert!(sub.evaluation_directory().join("b.h").is_file());

        sub.save().expect("save");
        let reloaded = Submission::load(&sub.file()).expect("reload");
        assert!(reloaded.stored_errors().expect("stored").is_empty());
    }

    #[test]
    fn missing_file_error_lists_plain_names() {
        let (_dir, mut assignment) = temp_assignment();
        assignment
            .add_required_file(SubmissionFileData::new("a.c"))
            .add_required_file(SubmissionFileData::new("b.h"));
        assignment.create_missing_directories().expect("dirs");
        let raw = assignment.layout().unprocessed.join("notes.txt");
        fs::write(&raw, "nothing useful").expect("write");

        let sub = Submission::create(&assignment, &raw, Some(true)).expect("create");
        let errors = sub.errors(&assignment).expect("errors");
        assert_eq!(errors, vec!["Missing required files: a.c, b.h".to_string()]);
    }

    #[test]
    fn fix_overwrites_previous_copies() {
        let (_dir, mut assignment) = temp_assignment();
        assignment.add_required_file(SubmissionFileData::new("main.c"));
        assignment.create_missing_directories().expect("dirs");
        let raw = assignment.layout().unprocessed.join("main.c");
        fs::write(&raw, "original").expect("write");
        let mut sub = Submission::create(&assignment, &raw, Some(false)).expect("create");
        assert_eq!(sub.name(), "main");

        let working = sub.evaluation_directory().join("main.c");
        fs::write(&working, "edited by grader").expect("edit");
        sub.fix(&assignment).expect("fix");
        assert_eq!(fs::read_to_string(&working).expect("read"), "original");
        sub.fix(&assignment).expect("fix twice");
    }

    #[test]
    fn decorated_name_is_parsed_when_not_anonymous() {
        let (_dir, mut assignment) = temp_assignment();
        assignment.add_required_file(SubmissionFileData::new("p2sol.c"));
        assignment.create_missing_directories().expect("dirs");
        let raw = assignment
            .layout()
            .unprocessed
            .join("341751-430460 - Alice Jones - Sep 18, 2025 1156 PM - p2sol.c");
        fs::write(&raw, "int x;").expect("write");

        let sub = Submission::create(&assignment, &raw, Some(false)).expect("create");
        assert_eq!(sub.name(), "Alice Jones");
        assert!(sub.as_submitted_dir().join("p2sol.c").is_file());
        assert!(sub.evaluation_directory().join("p2sol.c").is_file());
        assert!(sub.check_missing_files(&assignment).expect("check").is_empty());
    }

    #[test]
    fn create_missing_file_is_not_found() {
        let (_dir, assignment) = temp_assignment();
        let err = Submission::create(&assignment, &assignment.root().join("nope.c"), None)
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[test]
    fn construction_validates_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.c");
        fs::write(&file, "x").expect("write");
        let bad_file = SubmissionData {
            submission_file: dir.path().join("missing.c"),
            evaluation_directory: dir.path().to_path_buf(),
            ..SubmissionData::default()
        };
        assert!(matches!(Submission::new(bad_file), Err(AghError::Validation(_))));
        let bad_dir = SubmissionData {
            submission_file: file.clone(),
            evaluation_directory: file.clone(),
            ..SubmissionData::default()
        };
        assert!(matches!(Submission::new(bad_dir), Err(AghError::Validation(_))));
    }

    #[test]
    fn errors_and_warnings_are_keyed() {
        let (_dir, assignment) = temp_assignment();
        assignment.create_missing_directories().expect("dirs");
        let raw = assignment.layout().unprocessed.join("x.txt");
        fs::write(&raw, "x").expect("write");
        let mut sub = Submission::create(&assignment, &raw, None).expect("create");

        sub.add_error("render error", "boom").expect("add");
        sub.add_error("render error", "boom again").expect("upsert");
        sub.add_warning("render warning", "careful").expect("add");
        sub.add_warning("main.c", "dotted key").expect("add");
        assert_eq!(sub.stored_errors().expect("errors"), vec!["boom again"]);
        assert_eq!(sub.warnings().expect("warnings").len(), 2);

        sub.del_warning("render warning").expect("del");
        sub.del_warning("never added").expect("del missing");
        assert_eq!(sub.warnings().expect("warnings"), vec!["dotted key"]);
        assert!(sub.add_error("", "empty key").is_err());

        sub.save().expect("save");
        let reloaded = Submission::load(sub.evaluation_directory()).expect("load");
        assert_eq!(reloaded.stored_errors().expect("errors"), vec!["boom again"]);
        assert_eq!(reloaded, sub);
    }

    #[test]
    fn archive_submission_is_unpacked() {
        use std::io::Write;
        let (_dir, mut assignment) = temp_assignment();
        assignment
            .add_required_file(SubmissionFileData::new("main.c"))
            .add_optional_file(SubmissionFileData::new("README.md"));
        assignment.create_missing_directories().expect("dirs");
        let raw = assignment.layout().unprocessed.join("bob.zip");
        {
            let mut zip = zip::ZipWriter::new(fs::File::create(&raw).expect("create"));
            for (name, body) in [("main.c", "int main;"), ("README.md", "# hi"), ("notes.txt", "n")] {
                zip.start_file(name, zip::write::FileOptions::default()).expect("start");
                zip.write_all(body.as_bytes()).expect("write");
            }
            zip.finish().expect("finish");
        }

        let mut sub = Submission::create(&assignment, &raw, None).expect("create");
        let eval = sub.evaluation_directory().to_path_buf();
        assert!(eval.join("main.c").is_file());
        assert!(eval.join("README.md").is_file());
        assert!(!eval.join("notes.txt").exists());
        assert_eq!(sub.initial_missing_files(), Some(&[][..]));
        sub.fix(&assignment).expect("fix re-extracts");
        assert!(sub.as_submitted_dir().join("notes.txt").is_file());
    }
}
