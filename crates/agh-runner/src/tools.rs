//! Host-tool invocation: pytest phases and document rendering.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use agh_core::codec::{self, Field, Record};
use agh_core::fs::{atomic_write_bytes, ensure_dir};
use agh_core::{AghError, KeyPath, Result};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::assignment::Assignment;
use crate::output::OutputSectionData;
use crate::submission::{Submission, AS_SUBMITTED_DIR_NAME};

pub const EXECUTION_OUTPUT_KEY: &str = "Execution output";
pub const RESULTS_DIR_NAME: &str = "results";
pub const CODE_SECTION_FILE_NAME: &str = "code_section.md";
pub const TESTS_DIR_NAME: &str = "tests";

pub const RENDER_WARNING_KEY: &str = "render warning";
pub const RENDER_ERROR_KEY: &str = "render error";
pub const RENDER_ISSUE_KEY: &str = "render issue";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs a shell command line in a working directory.
pub trait CommandRunner {
    fn run(&self, command: &str, cwd: &Path) -> Result<CommandOutput>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, cwd: &Path) -> Result<CommandOutput> {
        debug!(command, cwd = %cwd.display(), "running");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code(),
        })
    }
}

/// Single-quotes `s` for `sh`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    All,
    Test,
    Build,
    Render,
}

impl Phase {
    pub fn marker_args(self) -> &'static str {
        match self {
            Phase::All => "",
            Phase::Test => "-m \"not build and not render\"",
            Phase::Build => "-m \"build\"",
            Phase::Render => "-m \"render\"",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::All => "run",
            Phase::Test => "test",
            Phase::Build => "build",
            Phase::Render => "render",
        }
    }

    pub fn command(self, evaluation_directory: &Path) -> String {
        let tests = format!("{}/{}/", evaluation_directory.display(), TESTS_DIR_NAME);
        let mut cmd = String::from("pytest -v -p agh-pytest-plugin ");
        if !self.marker_args().is_empty() {
            cmd.push_str(self.marker_args());
            cmd.push(' ');
        }
        cmd.push_str(&shell_quote(&tests));
        cmd.push('*');
        cmd
    }
}

/// Captured result of one phase run for one submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutputInfo {
    pub output: Vec<String>,
    pub error: Vec<String>,
    pub collected: Option<u64>,
    pub return_code: Option<i32>,
}

impl Record for RunOutputInfo {
    const NAME: &'static str = "RunOutputInfo";

    fn fields() -> Vec<Field<Self>> {
        vec![
            Field::<Self>::scalar("output", |r| &r.output, |r| &mut r.output).optional(),
            Field::<Self>::scalar("error", |r| &r.error, |r| &mut r.error).optional(),
            Field::<Self>::scalar("collected", |r| &r.collected, |r| &mut r.collected).optional(),
            Field::<Self>::scalar("return_code", |r| &r.return_code, |r| &mut r.return_code).optional(),
        ]
    }
}

fn lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

/// Number of tests pytest reports collecting, if it got that far.
pub fn collected_count(stdout: &str) -> Option<u64> {
    static COLLECTED: OnceLock<Option<Regex>> = OnceLock::new();
    COLLECTED
        .get_or_init(|| Regex::new(r"collected (\d+) items?").ok())
        .as_ref()?
        .captures(stdout)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

impl RunOutputInfo {
    fn from_output(output: &CommandOutput) -> Self {
        RunOutputInfo {
            output: lines(&output.stdout),
            error: lines(&output.stderr),
            collected: collected_count(&output.stdout),
            return_code: output.code,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub submission: String,
    pub passed: bool,
    /// `None` when the submission had nothing to run.
    pub info: Option<RunOutputInfo>,
}

fn execution_output_key(submission: &str) -> Result<KeyPath> {
    KeyPath::new([EXECUTION_OUTPUT_KEY, submission])
}

/// Runs `phase` for every submission and records each result in the
/// assignment's metadata. Commands run concurrently; results are applied in
/// submission order and the assignment is saved once.
pub fn run_phase(
    assignment: &mut Assignment,
    submissions: &[Submission],
    phase: Phase,
    runner: &(dyn CommandRunner + Sync),
) -> Result<Vec<PhaseOutcome>> {
    let results: Vec<Option<Result<CommandOutput>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = submissions
            .iter()
            .map(|sub| {
                let eval = sub.evaluation_directory().to_path_buf();
                if !eval.join(TESTS_DIR_NAME).is_dir() {
                    warn!(submission = sub.name(), "no tests directory; not running");
                    return None;
                }
                let command = phase.command(&eval);
                Some(scope.spawn(move || {
                    runner.run(&command, &eval).map_err(|e| match e {
                        AghError::Io(io) => AghError::ExternalTool {
                            command: command.clone(),
                            code: None,
                            stderr: io.to_string(),
                        },
                        other => other,
                    })
                }))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(AghError::ExternalTool {
                            command: phase.label().to_string(),
                            code: None,
                            stderr: "runner thread panicked".to_string(),
                        })
                    })
                })
            })
            .collect()
    });

    let mut outcomes = Vec::with_capacity(submissions.len());
    for (sub, result) in submissions.iter().zip(results) {
        let outcome = match result {
            None => PhaseOutcome {
                submission: sub.name().to_string(),
                passed: false,
                info: None,
            },
            Some(result) => {
                let info = match result {
                    Ok(output) => RunOutputInfo::from_output(&output),
                    Err(e) => RunOutputInfo {
                        error: vec![e.to_string()],
                        ..RunOutputInfo::default()
                    },
                };
                assignment
                    .data
                    .metadata
                    .set(&execution_output_key(sub.name())?, codec::marshal(&info)?);
                PhaseOutcome {
                    submission: sub.name().to_string(),
                    passed: info.return_code == Some(0),
                    info: Some(info),
                }
            }
        };
        info!(
            phase = phase.label(),
            submission = %outcome.submission,
            passed = outcome.passed,
            "phase finished"
        );
        outcomes.push(outcome);
    }
    assignment.save()?;
    Ok(outcomes)
}

/// Last recorded phase result for `submission`.
pub fn execution_output(assignment: &Assignment, submission: &str) -> Result<Option<RunOutputInfo>> {
    match assignment.data.metadata.get(&execution_output_key(submission)?) {
        Some(value) => Ok(Some(codec::unmarshal(value)?)),
        None => Ok(None),
    }
}

/// The "Your Code" section: every required file shown in output, read from
/// `as_submitted`. Missing files are stood in for by empty placeholders under
/// `results/missing` so the include directives still resolve.
pub fn code_section(assignment: &Assignment, submission: &Submission) -> Result<OutputSectionData> {
    let mut section = OutputSectionData::new(CODE_SECTION_FILE_NAME, "Your Code", 1);
    let eval = submission.evaluation_directory();
    for file in assignment.data.required_files.values() {
        if !file.include_in_output {
            continue;
        }
        let name = file.file_name();
        let mut rel = PathBuf::from(AS_SUBMITTED_DIR_NAME).join(&name);
        if !eval.join(&rel).exists() {
            rel = PathBuf::from(RESULTS_DIR_NAME).join("missing").join(&name);
            let placeholder = eval.join(&rel);
            if let Some(parent) = placeholder.parent() {
                ensure_dir(parent)?;
            }
            if !placeholder.exists() {
                fs::File::create(&placeholder)?;
            }
        }
        let mut included = file.clone();
        included.path = rel;
        section.add_file(included);
    }
    Ok(section)
}

/// Writes the code section, renders the template and publishes the result.
///
/// A failed render is recorded as a `render issue` warning on the submission
/// and returned as [`AghError::ExternalTool`].
pub fn render_submission(
    assignment: &Assignment,
    submission: &mut Submission,
    runner: &dyn CommandRunner,
) -> Result<CommandOutput> {
    let eval = submission.evaluation_directory().to_path_buf();
    let section = code_section(assignment, submission)?;
    let results = eval.join(RESULTS_DIR_NAME);
    ensure_dir(&results)?;
    let body = section.render_in(&eval, crate::output::DEFAULT_MAX_OUT_FILE_SIZE)?;
    atomic_write_bytes(&results.join(CODE_SECTION_FILE_NAME), body.as_bytes())?;

    submission
        .del_warning(RENDER_WARNING_KEY)?
        .del_error(RENDER_ERROR_KEY)?
        .del_warning(RENDER_ISSUE_KEY)?;

    let template = assignment.options().output_template_name();
    let command = format!("quarto render {}", shell_quote(&template));
    let output = runner.run(&command, &eval)?;
    if !output.success() {
        let message = format!(
            "Rendering {} exited with {:?}. See the render output for details.",
            template, output.code
        );
        submission.add_warning(RENDER_ISSUE_KEY, &message)?;
        submission.save()?;
        return Err(AghError::ExternalTool {
            command,
            code: output.code,
            stderr: output.stderr,
        });
    }

    let mut warnings: Vec<String> = Vec::new();
    assignment.post_process_render(submission, &mut |w| warnings.push(w))?;
    if !warnings.is_empty() {
        submission.add_warning(RENDER_WARNING_KEY, &warnings.join("\n"))?;
    }
    submission.save()?;
    info!(submission = submission.name(), "rendered");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SubmissionFileData;
    use crate::postprocess::LinkPolicy;
    use crate::test_support::temp_assignment;
    use std::sync::Mutex;

    /// Replies with canned output and remembers what it was asked to run.
    struct FakeRunner {
        reply: CommandOutput,
        /// File written into `cwd` when a command runs, as a renderer would.
        produce: Option<(&'static str, &'static str)>,
        calls: Mutex<Vec<(String, PathBuf)>>,
    }

    impl FakeRunner {
        fn new(reply: CommandOutput) -> Self {
            FakeRunner {
                reply,
                produce: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, PathBuf)> {
            self.calls.lock().expect("lock").clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, command: &str, cwd: &Path) -> Result<CommandOutput> {
            self.calls
                .lock()
                .expect("lock")
                .push((command.to_string(), cwd.to_path_buf()));
            if let Some((name, body)) = self.produce {
                fs::write(cwd.join(name), body)?;
            }
            Ok(self.reply.clone())
        }
    }

    fn ok_reply(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            code: Some(0),
        }
    }

    fn linked_submission(assignment: &Assignment, file: &str) -> Submission {
        let raw = assignment.layout().unprocessed.join(file);
        fs::write(&raw, "int main() { return 0; }\n").expect("write");
        let mut sink = |_: String| {};
        assignment.add_submission(&raw, None, &mut sink).expect("add")
    }

    #[test]
    fn phase_commands_carry_marker_args() {
        let eval = Path::new("/a/evaluations/x y");
        assert_eq!(
            Phase::All.command(eval),
            "pytest -v -p agh-pytest-plugin '/a/evaluations/x y/tests/'*"
        );
        assert_eq!(
            Phase::Test.command(eval),
            "pytest -v -p agh-pytest-plugin -m \"not build and not render\" '/a/evaluations/x y/tests/'*"
        );
        assert!(Phase::Build.command(eval).contains("-m \"build\""));
        assert!(Phase::Render.command(eval).contains("-m \"render\""));
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn collected_count_parses_pytest_header() {
        assert_eq!(
            collected_count("platform linux\ncollected 7 items\n\n"),
            Some(7)
        );
        assert_eq!(collected_count("collected 1 item"), Some(1));
        assert_eq!(collected_count("ERROR: no tests ran"), None);
    }

    #[test]
    fn run_phase_records_results_and_saves_once() {
        let (_dir, mut assignment) = temp_assignment();
        assignment.create_missing_directories().expect("dirs");
        let a = linked_submission(&assignment, "a.c");
        let b = linked_submission(&assignment, "b.c");
        // A submission linked before the tests directory existed.
        fs::remove_file(b.evaluation_directory().join(TESTS_DIR_NAME)).expect("unlink tests");

        let runner = FakeRunner::new(ok_reply("collected 3 items\n3 passed"));
        let outcomes = run_phase(&mut assignment, &[a.clone(), b.clone()], Phase::Test, &runner)
            .expect("run");

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].submission, a.name());
        assert!(outcomes[0].passed);
        assert!(!outcomes[1].passed);
        assert!(outcomes[1].info.is_none());

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, a.evaluation_directory());
        assert!(calls[0].0.contains("not build and not render"));

        let reloaded =
            Assignment::load(assignment.root(), assignment.defaults().clone()).expect("load");
        let info = execution_output(&reloaded, a.name())
            .expect("read")
            .expect("recorded");
        assert_eq!(info.collected, Some(3));
        assert_eq!(info.return_code, Some(0));
        assert_eq!(info.output, vec!["collected 3 items", "3 passed"]);
        assert!(execution_output(&reloaded, b.name()).expect("read").is_none());
    }

    #[test]
    fn failing_run_is_not_passed() {
        let (_dir, mut assignment) = temp_assignment();
        assignment.create_missing_directories().expect("dirs");
        let a = linked_submission(&assignment, "a.c");
        let runner = FakeRunner::new(CommandOutput {
            stdout: "collected 2 items\n1 failed".into(),
            stderr: "boom\n".into(),
            code: Some(1),
        });
        let outcomes = run_phase(&mut assignment, &[a], Phase::All, &runner).expect("run");
        assert!(!outcomes[0].passed);
        let info = outcomes[0].info.clone().expect("info");
        assert_eq!(info.error, vec!["boom"]);
        assert_eq!(info.return_code, Some(1));
    }

    #[test]
    fn code_section_points_into_as_submitted() {
        let (_dir, mut assignment) = temp_assignment();
        assignment
            .add_required_file(SubmissionFileData::new("main.c").with_kind("c"))
            .add_required_file(SubmissionFileData::new("util.h").with_kind("c"))
            .add_required_file(SubmissionFileData::new("hidden.c").with_include_in_output(false));
        assignment.create_missing_directories().expect("dirs");
        let raw = assignment.layout().unprocessed.join("main.c");
        fs::write(&raw, "int main;").expect("write");
        let sub = Submission::create(&assignment, &raw, Some(false)).expect("create");

        let section = code_section(&assignment, &sub).expect("section");
        assert_eq!(section.heading_level, 1);
        assert_eq!(section.file.title, "Your Code");
        let paths: Vec<PathBuf> = section.included_files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("as_submitted/main.c"),
                PathBuf::from("results/missing/util.h"),
            ]
        );
        assert!(sub.evaluation_directory().join("results/missing/util.h").is_file());
        assert_eq!(
            sub.check_missing_files(&assignment).expect("check"),
            vec!["hidden.c", "util.h"]
        );
        let text = section.render_in(sub.evaluation_directory(), 1024).expect("render");
        assert!(text.starts_with("# Your Code"));
        assert!(text.contains("{{< include as_submitted/main.c >}}"));
    }

    #[test]
    fn successful_render_publishes_output() {
        let (_dir, assignment) = temp_assignment();
        assignment.create_missing_directories().expect("dirs");
        let mut sub = linked_submission(&assignment, "a.c");
        sub.add_warning(RENDER_ISSUE_KEY, "old").expect("seed");

        let mut runner = FakeRunner::new(ok_reply("Output created: index.pdf"));
        runner.produce = Some(("index.pdf", "%PDF"));
        render_submission(&assignment, &mut sub, &runner).expect("render");

        let calls = runner.calls();
        assert_eq!(calls[0].0, "quarto render 'index.qmd'");
        assert!(sub
            .evaluation_directory()
            .join(RESULTS_DIR_NAME)
            .join(CODE_SECTION_FILE_NAME)
            .is_file());
        assert!(sub.warnings().expect("warnings").is_empty());
        let graded = sub
            .main_output_files(&assignment)
            .expect("outputs")
            .graded
            .expect("graded");
        assert_eq!(fs::read(graded).expect("read"), b"%PDF");

        let reloaded = Submission::load(sub.evaluation_directory()).expect("load");
        assert_eq!(reloaded, sub);
    }

    #[test]
    fn failed_render_records_issue() {
        let (_dir, assignment) = temp_assignment();
        assignment.create_missing_directories().expect("dirs");
        let mut sub = linked_submission(&assignment, "a.c");
        let runner = FakeRunner::new(CommandOutput {
            stdout: String::new(),
            stderr: "ERROR: template not found".into(),
            code: Some(1),
        });
        let err = render_submission(&assignment, &mut sub, &runner).expect_err("fails");
        assert!(matches!(err, AghError::ExternalTool { code: Some(1), .. }));
        let reloaded = Submission::load(sub.evaluation_directory()).expect("load");
        assert_eq!(reloaded.warnings().expect("warnings").len(), 1);
        assert!(reloaded.main_output_files(&assignment).expect("outputs").graded.is_none());
    }

    #[test]
    fn rerender_over_edited_graded_file_warns() {
        let (_dir, assignment) = temp_assignment();
        assignment.create_missing_directories().expect("dirs");
        let mut sub = linked_submission(&assignment, "a.c");
        let mut runner = FakeRunner::new(ok_reply(""));
        runner.produce = Some(("index.pdf", "%PDF v1"));
        render_submission(&assignment, &mut sub, &runner).expect("first");

        let graded = sub
            .main_output_files(&assignment)
            .expect("outputs")
            .graded
            .expect("graded");
        fs::write(&graded, "annotated").expect("edit");

        render_submission(&assignment, &mut sub, &runner).expect("second");
        let warnings = sub.warnings().expect("warnings");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("appears modified"));
        assert_eq!(fs::read_to_string(&graded).expect("read"), "annotated");

        let mut sink = |_: String| {};
        assignment
            .post_process_submission(&mut sub, LinkPolicy::Ignore, &mut sink)
            .expect("relink");
    }
}
