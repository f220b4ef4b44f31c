//! Output composition tree: file references and sections that render to a
//! Quarto markdown document.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use agh_core::codec::{Field, Record};
use agh_core::Result;

/// Files larger than this are inlined truncated instead of included.
pub const DEFAULT_MAX_OUT_FILE_SIZE: u64 = 20 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionFileData {
    pub path: PathBuf,
    pub title: String,
    /// Code-fence language tag.
    pub kind: String,
    pub include_in_output: bool,
    pub description: String,
    pub unlisted: bool,
    pub copy_to_sub_if_missing: bool,
}

impl Default for SubmissionFileData {
    fn default() -> Self {
        SubmissionFileData {
            path: PathBuf::new(),
            title: String::new(),
            kind: "default".to_string(),
            include_in_output: true,
            description: String::new(),
            unlisted: false,
            copy_to_sub_if_missing: true,
        }
    }
}

fn file_name_title(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl Record for SubmissionFileData {
    const NAME: &'static str = "SubmissionFileData";

    fn fields() -> Vec<Field<Self>> {
        vec![
            Field::<Self>::path("path", |r| &r.path, |r| &mut r.path),
            Field::<Self>::scalar("title", |r| &r.title, |r| &mut r.title).optional(),
            Field::<Self>::scalar("type", |r| &r.kind, |r| &mut r.kind).optional(),
            Field::<Self>::scalar("include_in_output", |r| &r.include_in_output, |r| &mut r.include_in_output)
                .optional(),
            Field::<Self>::scalar("description", |r| &r.description, |r| &mut r.description).optional(),
            Field::<Self>::scalar("unlisted", |r| &r.unlisted, |r| &mut r.unlisted).optional(),
            Field::<Self>::scalar(
                "copy_to_sub_if_missing",
                |r| &r.copy_to_sub_if_missing,
                |r| &mut r.copy_to_sub_if_missing,
            )
            .optional(),
        ]
    }

    fn after_unmarshal(&mut self) -> Result<()> {
        if self.title.is_empty() {
            self.title = file_name_title(&self.path);
        }
        Ok(())
    }
}

impl SubmissionFileData {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        SubmissionFileData {
            title: file_name_title(&path),
            path,
            ..SubmissionFileData::default()
        }
    }

    /// Sets the title; an empty title falls back to the file name.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        if self.title.is_empty() {
            self.title = file_name_title(&self.path);
        }
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_include_in_output(mut self, include: bool) -> Self {
        self.include_in_output = include;
        self
    }

    pub fn with_copy_to_sub_if_missing(mut self, copy: bool) -> Self {
        self.copy_to_sub_if_missing = copy;
        self
    }

    pub fn unlisted(mut self, unlisted: bool) -> Self {
        self.unlisted = unlisted;
        self
    }

    /// Key under which this file is registered on an assignment.
    pub fn key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn file_name(&self) -> String {
        file_name_title(&self.path)
    }

    fn section_attr(&self) -> &'static str {
        if self.unlisted {
            " {.unlisted .unnumbered}"
        } else {
            ""
        }
    }

    /// Non-empty file on disk, with relative paths resolved against `base`.
    fn has_content_in(&self, base: &Path) -> bool {
        fs::metadata(base.join(&self.path))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    /// Renders the file as a heading plus either an include directive or a
    /// truncated literal dump when the file is larger than `max_size`.
    pub fn render(&self, heading_level: usize, max_size: u64, base: &Path) -> Result<String> {
        if !self.include_in_output {
            return Ok(String::new());
        }
        let mut out = format!(
            "\n\n{} {}{}\n\n{}\n\n",
            "#".repeat(heading_level),
            self.title,
            self.section_attr(),
            self.description
        );
        let on_disk = base.join(&self.path);
        let oversized = fs::metadata(&on_disk)
            .map(|m| m.is_file() && m.len() > max_size)
            .unwrap_or(false);
        if oversized {
            let mut buf = Vec::new();
            fs::File::open(&on_disk)?
                .take(max_size)
                .read_to_end(&mut buf)?;
            out.push_str(&format!(
                "**[File too large! Contents truncated to {} bytes.]{{.mark}}**\n\n```{{.{}}}\n{}\n```\n\n",
                max_size,
                self.kind,
                String::from_utf8_lossy(&buf)
            ));
            return Ok(out);
        }
        out.push_str(&format!(
            "```{{.{}}}\n{{{{< include {} >}}}}\n```\n\n",
            self.kind,
            self.path.display()
        ));
        Ok(out)
    }
}

/// A titled message shown in a section's errors or warnings callout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Notice {
    pub title: String,
    pub message: String,
}

impl Record for Notice {
    const NAME: &'static str = "Notice";

    fn fields() -> Vec<Field<Self>> {
        vec![
            Field::<Self>::scalar("title", |r| &r.title, |r| &mut r.title),
            Field::<Self>::scalar("message", |r| &r.message, |r| &mut r.message),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSectionData {
    pub file: SubmissionFileData,
    pub text: String,
    pub instructor_only: bool,
    pub heading_level: usize,
    pub included_files: Vec<SubmissionFileData>,
    pub children: Vec<OutputSectionData>,
    pub only_output_if_data: bool,
    pub post_script: String,
    pub errors: Vec<Notice>,
    pub warnings: Vec<Notice>,
}

impl Default for OutputSectionData {
    fn default() -> Self {
        OutputSectionData {
            file: SubmissionFileData::default(),
            text: String::new(),
            instructor_only: false,
            heading_level: 2,
            included_files: Vec::new(),
            children: Vec::new(),
            only_output_if_data: false,
            post_script: String::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl Record for OutputSectionData {
    const NAME: &'static str = "OutputSectionData";

    fn fields() -> Vec<Field<Self>> {
        vec![
            Field::<Self>::path("path", |r| &r.file.path, |r| &mut r.file.path),
            Field::<Self>::scalar("title", |r| &r.file.title, |r| &mut r.file.title).optional(),
            Field::<Self>::scalar("type", |r| &r.file.kind, |r| &mut r.file.kind).optional(),
            Field::<Self>::scalar(
                "include_in_output",
                |r| &r.file.include_in_output,
                |r| &mut r.file.include_in_output,
            )
            .optional(),
            Field::<Self>::scalar("description", |r| &r.file.description, |r| &mut r.file.description)
                .optional(),
            Field::<Self>::scalar("unlisted", |r| &r.file.unlisted, |r| &mut r.file.unlisted).optional(),
            Field::<Self>::scalar(
                "copy_to_sub_if_missing",
                |r| &r.file.copy_to_sub_if_missing,
                |r| &mut r.file.copy_to_sub_if_missing,
            )
            .optional(),
            Field::<Self>::scalar("text", |r| &r.text, |r| &mut r.text).optional(),
            Field::<Self>::scalar("instructor_only", |r| &r.instructor_only, |r| &mut r.instructor_only)
                .optional(),
            Field::<Self>::scalar("heading_level", |r| &r.heading_level, |r| &mut r.heading_level)
                .optional(),
            Field::<Self>::record_list("included_files", |r| &r.included_files, |r| &mut r.included_files)
                .optional(),
            Field::<Self>::record_list("included_sections", |r| &r.children, |r| &mut r.children)
                .optional(),
            Field::<Self>::scalar(
                "only_output_if_data",
                |r| &r.only_output_if_data,
                |r| &mut r.only_output_if_data,
            )
            .optional(),
            Field::<Self>::scalar("post_script", |r| &r.post_script, |r| &mut r.post_script).optional(),
            Field::<Self>::record_list("errors", |r| &r.errors, |r| &mut r.errors).optional(),
            Field::<Self>::record_list("warnings", |r| &r.warnings, |r| &mut r.warnings).optional(),
        ]
    }

    fn after_unmarshal(&mut self) -> Result<()> {
        self.file.after_unmarshal()?;
        if self.heading_level == 0 {
            return Err(agh_core::AghError::malformed(
                Self::NAME,
                "heading_level must be at least 1",
            ));
        }
        Ok(())
    }
}

fn callout(kind: &str, title: &str, notices: &[Notice]) -> String {
    if notices.is_empty() {
        return String::new();
    }
    let items: String = notices
        .iter()
        .map(|n| format!("\n\n+ **{}:** {}", n.title, n.message))
        .collect();
    format!(
        "\n\n::: {{.callout-{} title=\"{}\"}}\n\n{}\n\n:::\n\n",
        kind, title, items
    )
}

impl OutputSectionData {
    pub fn new(path: impl Into<PathBuf>, title: impl Into<String>, heading_level: usize) -> Self {
        OutputSectionData {
            file: SubmissionFileData::new(path).with_title(title),
            heading_level: heading_level.max(1),
            ..OutputSectionData::default()
        }
    }

    /// Appends `child` and sets its heading level one below this section.
    /// The child's own descendants keep their levels.
    pub fn add_section(&mut self, mut child: OutputSectionData) -> &mut Self {
        child.heading_level = self.heading_level + 1;
        self.children.push(child);
        self
    }

    pub fn add_file(&mut self, file: SubmissionFileData) -> &mut Self {
        self.included_files.push(file);
        self
    }

    pub fn add_error(&mut self, title: impl Into<String>, message: impl Into<String>) -> &mut Self {
        self.errors.push(Notice {
            title: title.into(),
            message: message.into(),
        });
        self
    }

    pub fn add_warning(&mut self, title: impl Into<String>, message: impl Into<String>) -> &mut Self {
        self.warnings.push(Notice {
            title: title.into(),
            message: message.into(),
        });
        self
    }

    pub fn has_data(&self) -> bool {
        self.has_data_in(Path::new(""))
    }

    /// Whether anything worth rendering exists, resolving included file paths
    /// against `base`.
    pub fn has_data_in(&self, base: &Path) -> bool {
        if !self.errors.is_empty() || !self.warnings.is_empty() {
            return true;
        }
        if !self.children.is_empty() || !self.included_files.is_empty() {
            return self.children.iter().any(|c| c.has_data_in(base))
                || self.included_files.iter().any(|f| f.has_content_in(base));
        }
        !self.text.trim().is_empty()
    }

    pub fn render(&self) -> Result<String> {
        self.render_in(Path::new(""), DEFAULT_MAX_OUT_FILE_SIZE)
    }

    pub fn render_in(&self, base: &Path, max_size: u64) -> Result<String> {
        if self.only_output_if_data && !self.has_data_in(base) {
            return Ok(String::new());
        }
        let mut files = Vec::with_capacity(self.included_files.len());
        for f in &self.included_files {
            files.push(f.render(self.heading_level + 1, max_size, base)?);
        }
        let mut children = Vec::with_capacity(self.children.len());
        for c in &self.children {
            children.push(c.render_in(base, max_size)?);
        }
        Ok(format!(
            "{} {}{}\n\n{}\n\n{}{}{}\n\n{}\n\n{}\n\n{}",
            "#".repeat(self.heading_level),
            self.file.title,
            self.file.section_attr(),
            self.file.description,
            self.text,
            callout("important", "Errors", &self.errors),
            callout("note", "To Consider", &self.warnings),
            files.join("\n\n"),
            children.join("\n\n"),
            self.post_script
        ))
    }
}
