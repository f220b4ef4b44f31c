use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use agh_core::anonymizer::AssignmentIdentity;
use agh_core::codec::{self, Field, Record};
use agh_core::fs::{absolute_path, ensure_dir, find_file_in_parents};
use agh_core::{AghError, Metadata, Result};
use chrono::{Datelike, Local};
use tracing::{debug, info};

use crate::options::{GraderOptions, ResolvedOptions, UserDefaults};
use crate::output::SubmissionFileData;
use crate::submission::{Submission, SUBMISSION_FILE_NAME};

pub const ASSIGNMENT_FILE_NAME: &str = "assignment.json";
pub const DEFAULT_ASSIGNMENT_NAME: &str = "assignment";
pub const DEFAULT_COURSE: &str = "CSCI-340";

/// Term label inferred from a calendar month (1-12).
pub fn grade_period_for_month(month: u32) -> &'static str {
    match month {
        1..=3 => "Spring",
        4 | 5 => "Maymester",
        6 => "SummerI",
        7 => "SummerII",
        11 | 12 => "Winter",
        _ => "Fall",
    }
}

/// Persisted part of an assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentData {
    pub name: String,
    pub year: i32,
    pub grade_period: String,
    pub course: String,
    /// Keyed by the registered file's path string.
    pub required_files: BTreeMap<String, SubmissionFileData>,
    pub optional_files: BTreeMap<String, SubmissionFileData>,
    pub options: GraderOptions,
    pub metadata: Metadata,
}

impl Default for AssignmentData {
    fn default() -> Self {
        let now = Local::now();
        AssignmentData {
            name: DEFAULT_ASSIGNMENT_NAME.to_string(),
            year: now.year(),
            grade_period: grade_period_for_month(now.month()).to_string(),
            course: DEFAULT_COURSE.to_string(),
            required_files: BTreeMap::new(),
            optional_files: BTreeMap::new(),
            options: GraderOptions::default(),
            metadata: Metadata::default(),
        }
    }
}

impl Record for AssignmentData {
    const NAME: &'static str = "Assignment";

    fn fields() -> Vec<Field<Self>> {
        vec![
            Field::<Self>::scalar("name", |r| &r.name, |r| &mut r.name).optional(),
            Field::<Self>::scalar("year", |r| &r.year, |r| &mut r.year).optional(),
            Field::<Self>::scalar("grade_period", |r| &r.grade_period, |r| &mut r.grade_period).optional(),
            Field::<Self>::scalar("course", |r| &r.course, |r| &mut r.course).optional(),
            Field::<Self>::record_map("required_files", |r| &r.required_files, |r| &mut r.required_files)
                .optional(),
            Field::<Self>::record_map("optional_files", |r| &r.optional_files, |r| &mut r.optional_files)
                .optional(),
            Field::<Self>::record("options", |r| &r.options, |r| &mut r.options).optional(),
            Field::<Self>::plain("metadata", |r| &r.metadata, |r| &mut r.metadata).optional(),
        ]
    }
}

/// Fixed directory layout under an assignment root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentLayout {
    pub root: PathBuf,
    pub archive: PathBuf,
    pub unprocessed: PathBuf,
    pub evaluations: PathBuf,
    pub as_rendered: PathBuf,
    pub graded: PathBuf,
    pub de_anonymized: PathBuf,
    pub template: PathBuf,
    pub description: PathBuf,
    pub tests: PathBuf,
}

impl AssignmentLayout {
    pub fn new(root: &Path) -> Self {
        let submissions = root.join("submissions");
        let output = root.join("output");
        let assignment = root.join("assignment");
        AssignmentLayout {
            root: root.to_path_buf(),
            archive: submissions.join("archive"),
            unprocessed: submissions.join("unprocessed"),
            evaluations: submissions.join("evaluations"),
            as_rendered: output.join("as_rendered"),
            graded: output.join("graded"),
            de_anonymized: output.join("de-anonymized"),
            template: assignment.join("template"),
            description: assignment.join("description"),
            tests: assignment.join("tests"),
        }
    }

    pub fn directories(&self) -> [&Path; 9] {
        [
            &self.archive,
            &self.unprocessed,
            &self.evaluations,
            &self.as_rendered,
            &self.graded,
            &self.de_anonymized,
            &self.template,
            &self.description,
            &self.tests,
        ]
    }
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub data: AssignmentData,
    layout: AssignmentLayout,
    defaults: UserDefaults,
}

impl Assignment {
    /// A fresh assignment rooted at an existing directory.
    pub fn new(root: &Path, data: AssignmentData, defaults: UserDefaults) -> Result<Self> {
        if !root.exists() {
            return Err(AghError::NotFound(root.display().to_string()));
        }
        if !root.is_dir() {
            return Err(AghError::Validation(format!(
                "assignment root {} is not a directory",
                root.display()
            )));
        }
        let root = absolute_path(root)?;
        Ok(Assignment {
            data,
            layout: AssignmentLayout::new(&root),
            defaults,
        })
    }

    /// Loads from `assignment.json` in `path` or its nearest ancestor, or from
    /// `path` itself when it names a file.
    pub fn load(path: &Path, defaults: UserDefaults) -> Result<Self> {
        let path = absolute_path(path)?;
        let file = if path.is_dir() {
            find_file_in_parents(&path, ASSIGNMENT_FILE_NAME).ok_or_else(|| {
                AghError::NotFound(format!(
                    "{} in {} or any parent directory",
                    ASSIGNMENT_FILE_NAME,
                    path.display()
                ))
            })?
        } else if path.is_file() {
            path
        } else {
            return Err(AghError::NotFound(path.display().to_string()));
        };
        debug!(file = %file.display(), "loading assignment");
        let data: AssignmentData = codec::load(&file)?;
        let root = file.parent().unwrap_or_else(|| Path::new("/")).to_path_buf();
        Ok(Assignment {
            data,
            layout: AssignmentLayout::new(&root),
            defaults,
        })
    }

    pub fn save(&self) -> Result<()> {
        codec::save(&self.data, &self.file())
    }

    pub fn file(&self) -> PathBuf {
        self.layout.root.join(ASSIGNMENT_FILE_NAME)
    }

    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    pub fn layout(&self) -> &AssignmentLayout {
        &self.layout
    }

    pub fn defaults(&self) -> &UserDefaults {
        &self.defaults
    }

    pub fn options(&self) -> ResolvedOptions<'_> {
        ResolvedOptions::new(&self.data.options, &self.defaults)
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    /// Runs `f` with the identity tuple used to derive pseudonyms.
    pub fn with_identity<T>(&self, f: impl FnOnce(AssignmentIdentity<'_>) -> T) -> T {
        let year = self.data.year.to_string();
        f(AssignmentIdentity {
            name: &self.data.name,
            year: &year,
            term: &self.data.grade_period,
            course: &self.data.course,
        })
    }

    pub fn add_required_file(&mut self, file: SubmissionFileData) -> &mut Self {
        self.data.required_files.insert(file.key(), file);
        self
    }

    pub fn add_optional_file(&mut self, file: SubmissionFileData) -> &mut Self {
        self.data.optional_files.insert(file.key(), file);
        self
    }

    /// File names (last path segment) of every required file.
    pub fn required_file_names(&self) -> Vec<String> {
        self.data
            .required_files
            .values()
            .map(SubmissionFileData::file_name)
            .collect()
    }

    /// Whether `name` is the file name of a required or optional file.
    pub fn is_registered_file_name(&self, name: &str) -> bool {
        self.data
            .required_files
            .values()
            .chain(self.data.optional_files.values())
            .any(|f| f.file_name() == name)
    }

    pub fn missing_directories(&self) -> Vec<PathBuf> {
        self.layout
            .directories()
            .iter()
            .filter(|d| !d.is_dir())
            .map(|d| d.to_path_buf())
            .collect()
    }

    /// Creates any missing layout directories and returns the ones created.
    pub fn create_missing_directories(&self) -> Result<Vec<PathBuf>> {
        let missing = self.missing_directories();
        for dir in &missing {
            ensure_dir(dir)?;
        }
        if !missing.is_empty() {
            info!(count = missing.len(), root = %self.root().display(), "created assignment directories");
        }
        Ok(missing)
    }

    /// Every submission below the root, ordered by path.
    pub fn submissions(&self) -> Result<Vec<Submission>> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(self.root()).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() && entry.file_name() == SUBMISSION_FILE_NAME {
                out.push(Submission::load(entry.path())?);
            }
        }
        Ok(out)
    }

    /// Resolves a submission given either a path inside it or its name.
    pub fn find_submission(&self, name_or_path: &str) -> Result<Submission> {
        let as_path = Path::new(name_or_path);
        if as_path.exists() {
            return Submission::load(as_path);
        }
        let by_name = self.layout.evaluations.join(name_or_path);
        if by_name.is_dir() {
            return Submission::load(&by_name);
        }
        Err(AghError::NotFound(format!("submission {}", name_or_path)))
    }
}
