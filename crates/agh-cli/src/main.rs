use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use agh_runner::tools::{render_submission, run_phase};
use agh_runner::{
    Assignment, AssignmentData, LinkPolicy, Phase, PhaseOutcome, ShellRunner, Submission,
    SubmissionFileData, UserDefaults,
};

#[derive(Parser)]
#[command(name = "agh", version = "0.3.0", about = "Assignment grading helper")]
struct Cli {
    /// Directory inside the assignment (its nearest ancestor holding
    /// assignment.json is used).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Print a single JSON payload instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarise the assignment and every submission's errors and warnings.
    Status,
    #[command(subcommand)]
    Assignment(AssignmentCommands),
    #[command(subcommand)]
    Submission(SubmissionCommands),
    /// Run every test phase.
    Run(SelectArgs),
    /// Run tests not marked build or render.
    Test(SelectArgs),
    /// Run build-marked tests.
    Build(SelectArgs),
    /// Run render-marked tests, then render and publish each submission.
    Render(SelectArgs),
}

#[derive(Subcommand)]
enum AssignmentCommands {
    /// Create assignment.json and the directory layout under --root.
    New {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long = "term")]
        grade_period: Option<String>,
    },
    Info,
    AddRequired(FileArgs),
    AddOptional(FileArgs),
}

#[derive(Args)]
struct FileArgs {
    path: PathBuf,
    #[arg(long)]
    title: Option<String>,
    /// Code-fence language used when the file is shown in output.
    #[arg(long = "type")]
    kind: Option<String>,
    #[arg(long)]
    description: Option<String>,
    /// Leave the file out of rendered output.
    #[arg(long)]
    hidden: bool,
    /// Do not link the assignment's copy into submissions missing it.
    #[arg(long)]
    no_copy: bool,
}

#[derive(Subcommand)]
enum SubmissionCommands {
    /// Move files into new evaluation directories.
    Add {
        files: Vec<PathBuf>,
        #[arg(long, conflicts_with = "no_anonymize")]
        anonymize: bool,
        #[arg(long)]
        no_anonymize: bool,
    },
    /// Re-unpack, re-copy and re-link submissions.
    Fix(SelectArgs),
}

#[derive(Args)]
struct SelectArgs {
    /// Submission names or paths; all submissions when omitted.
    #[arg(short = 's', long = "submission")]
    submissions: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = cli.json;
    let result = run_command(&cli.root, cli.json, cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("AGH_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_assignment(root: &Path) -> Result<Assignment> {
    let defaults = UserDefaults::load()?;
    Ok(Assignment::load(root, defaults)?)
}

fn run_command(root: &Path, json: bool, command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Status => {
            let assignment = load_assignment(root)?;
            let subs = assignment.submissions()?;
            let mut rows = Vec::with_capacity(subs.len());
            for sub in &subs {
                rows.push(submission_to_json(&assignment, sub)?);
            }
            let missing_dirs = assignment.missing_directories();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "generated_at": Utc::now().to_rfc3339(),
                    "assignment": assignment.name(),
                    "root": assignment.root().display().to_string(),
                    "missing_directories": missing_dirs
                        .iter()
                        .map(|d| d.display().to_string())
                        .collect::<Vec<_>>(),
                    "submissions": rows
                })));
            }
            println!("assignment: {}", assignment.name());
            println!("root: {}", assignment.root().display());
            for dir in &missing_dirs {
                println!("missing_directory: {}", dir.display());
            }
            println!("submissions: {}", subs.len());
            for sub in &subs {
                let errors = sub.errors(&assignment)?;
                let warnings = sub.warnings()?;
                println!(
                    "  {}: {} error(s), {} warning(s)",
                    sub.name(),
                    errors.len(),
                    warnings.len()
                );
                for e in errors {
                    println!("    error: {}", e);
                }
                for w in warnings {
                    println!("    warning: {}", w);
                }
            }
        }
        Commands::Assignment(AssignmentCommands::New {
            name,
            course,
            year,
            grade_period,
        }) => {
            fs::create_dir_all(root)?;
            let mut data = AssignmentData::default();
            if let Some(name) = name {
                data.name = name;
            }
            if let Some(course) = course {
                data.course = course;
            }
            if let Some(year) = year {
                data.year = year;
            }
            if let Some(period) = grade_period {
                data.grade_period = period;
            }
            let assignment = Assignment::new(root, data, UserDefaults::load()?)?;
            if assignment.file().exists() {
                return Err(anyhow!(
                    "assignment already exists: {}",
                    assignment.file().display()
                ));
            }
            let created = assignment.create_missing_directories()?;
            assignment.save()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "assignment new",
                    "file": assignment.file().display().to_string(),
                    "created_directories": created
                        .iter()
                        .map(|d| d.display().to_string())
                        .collect::<Vec<_>>()
                })));
            }
            println!("assignment_file: {}", assignment.file().display());
            println!("created_directories: {}", created.len());
        }
        Commands::Assignment(AssignmentCommands::Info) => {
            let assignment = load_assignment(root)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "assignment info",
                    "root": assignment.root().display().to_string(),
                    "assignment": agh_core::codec::marshal(&assignment.data)?
                })));
            }
            let data = &assignment.data;
            let options = assignment.options();
            println!("name: {}", data.name);
            println!("course: {}", data.course);
            println!("term: {} {}", data.grade_period, data.year);
            println!("root: {}", assignment.root().display());
            println!("anonymize_names: {}", options.anonymize_names());
            println!("output_files: {}", options.output_files().join(", "));
            println!("output_template: {}", options.output_template_name());
            for file in data.required_files.values() {
                println!("required: {} ({})", file.key(), file.kind);
            }
            for file in data.optional_files.values() {
                println!("optional: {} ({})", file.key(), file.kind);
            }
        }
        Commands::Assignment(AssignmentCommands::AddRequired(args)) => {
            return add_file(root, json, args, true);
        }
        Commands::Assignment(AssignmentCommands::AddOptional(args)) => {
            return add_file(root, json, args, false);
        }
        Commands::Submission(SubmissionCommands::Add {
            files,
            anonymize,
            no_anonymize,
        }) => {
            if files.is_empty() {
                return Err(anyhow!("no submission files given"));
            }
            let assignment = load_assignment(root)?;
            assignment.create_missing_directories()?;
            let override_anon = match (anonymize, no_anonymize) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let mut added = Vec::new();
            for file in &files {
                let mut warnings: Vec<String> = Vec::new();
                let sub =
                    assignment.add_submission(file, override_anon, &mut |w| warnings.push(w))?;
                if !json {
                    println!("added: {} -> {}", file.display(), sub.name());
                    for w in &warnings {
                        println!("  warning: {}", w);
                    }
                }
                added.push(submission_to_json(&assignment, &sub)?);
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "submission add",
                    "submissions": added
                })));
            }
        }
        Commands::Submission(SubmissionCommands::Fix(select)) => {
            let assignment = load_assignment(root)?;
            let mut fixed = Vec::new();
            for mut sub in select_submissions(&assignment, &select)? {
                sub.fix(&assignment)?;
                sub.save()?;
                let mut warnings: Vec<String> = Vec::new();
                assignment.post_process_submission(&mut sub, LinkPolicy::Ignore, &mut |w| {
                    warnings.push(w)
                })?;
                if !json {
                    println!("fixed: {}", sub.name());
                    for w in &warnings {
                        println!("  warning: {}", w);
                    }
                }
                fixed.push(submission_to_json(&assignment, &sub)?);
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "submission fix",
                    "submissions": fixed
                })));
            }
        }
        Commands::Run(select) => return phase_command(root, json, Phase::All, &select),
        Commands::Test(select) => return phase_command(root, json, Phase::Test, &select),
        Commands::Build(select) => return phase_command(root, json, Phase::Build, &select),
        Commands::Render(select) => return phase_command(root, json, Phase::Render, &select),
    }
    Ok(None)
}

fn add_file(root: &Path, json: bool, args: FileArgs, required: bool) -> Result<Option<Value>> {
    let mut assignment = load_assignment(root)?;
    let mut file = SubmissionFileData::new(args.path)
        .with_include_in_output(!args.hidden)
        .with_copy_to_sub_if_missing(!args.no_copy);
    if let Some(title) = args.title {
        file = file.with_title(title);
    }
    if let Some(kind) = args.kind {
        file = file.with_kind(kind);
    }
    if let Some(description) = args.description {
        file = file.with_description(description);
    }
    let key = file.key();
    if required {
        assignment.add_required_file(file);
    } else {
        assignment.add_optional_file(file);
    }
    assignment.save()?;
    let which = if required { "required" } else { "optional" };
    if json {
        return Ok(Some(json!({
            "ok": true,
            "command": format!("assignment add-{}", which),
            "file": key
        })));
    }
    println!("{}: {}", which, key);
    Ok(None)
}

fn select_submissions(assignment: &Assignment, select: &SelectArgs) -> Result<Vec<Submission>> {
    if select.submissions.is_empty() {
        return Ok(assignment.submissions()?);
    }
    let mut out = Vec::with_capacity(select.submissions.len());
    for name in &select.submissions {
        out.push(assignment.find_submission(name)?);
    }
    Ok(out)
}

fn phase_command(
    root: &Path,
    json: bool,
    phase: Phase,
    select: &SelectArgs,
) -> Result<Option<Value>> {
    let mut assignment = load_assignment(root)?;
    let subs = select_submissions(&assignment, select)?;
    debug!(phase = phase.label(), count = subs.len(), "running phase");
    let outcomes = run_phase(&mut assignment, &subs, phase, &ShellRunner)?;

    let mut rendered = Vec::new();
    if phase == Phase::Render {
        for mut sub in subs {
            let entry = match render_submission(&assignment, &mut sub, &ShellRunner) {
                Ok(_) => json!({"submission": sub.name(), "ok": true}),
                Err(err) => json!({"submission": sub.name(), "ok": false, "error": err.to_string()}),
            };
            rendered.push(entry);
        }
    }

    if json {
        return Ok(Some(json!({
            "ok": true,
            "command": phase.label(),
            "results": outcomes.iter().map(outcome_to_json).collect::<Vec<_>>(),
            "rendered": rendered
        })));
    }
    for outcome in &outcomes {
        let collected = outcome
            .info
            .as_ref()
            .and_then(|i| i.collected)
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}: {} (collected: {})",
            outcome.submission,
            if outcome.passed { "passed" } else { "failed" },
            collected
        );
    }
    for entry in &rendered {
        if entry["ok"] == false {
            println!(
                "render_failed: {}: {}",
                entry["submission"].as_str().unwrap_or_default(),
                entry["error"].as_str().unwrap_or_default()
            );
        }
    }
    Ok(None)
}

fn outcome_to_json(outcome: &PhaseOutcome) -> Value {
    json!({
        "submission": outcome.submission,
        "passed": outcome.passed,
        "collected": outcome.info.as_ref().and_then(|i| i.collected),
        "return_code": outcome.info.as_ref().and_then(|i| i.return_code)
    })
}

fn submission_to_json(assignment: &Assignment, sub: &Submission) -> Result<Value> {
    let outputs = sub.main_output_files(assignment)?;
    let path_str = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());
    Ok(json!({
        "name": sub.name(),
        "original_name": sub.original_name(),
        "evaluation_directory": sub.evaluation_directory().display().to_string(),
        "section": sub.section(),
        "initial_missing_files": sub.initial_missing_files(),
        "errors": sub.errors(assignment)?,
        "warnings": sub.warnings()?,
        "graded": path_str(&outputs.graded),
        "non_anonymous": path_str(&outputs.non_anonymous)
    }))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn phase_commands_accept_submission_filters() {
        let cli = Cli::try_parse_from(["agh", "test", "-s", "a", "-s", "b", "--json"])
            .expect("parse");
        assert!(cli.json);
        match cli.command {
            Commands::Test(select) => assert_eq!(select.submissions, vec!["a", "b"]),
            _ => panic!("expected test"),
        }
    }

    #[test]
    fn anonymize_flags_conflict() {
        assert!(Cli::try_parse_from([
            "agh",
            "submission",
            "add",
            "x.c",
            "--anonymize",
            "--no-anonymize"
        ])
        .is_err());
    }

    #[test]
    fn new_then_add_then_status_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("p1");
        std::env::set_var("AGH_USER_DEFAULTS", dir.path().join("defaults.json"));

        let payload = run_command(
            &root,
            true,
            Commands::Assignment(AssignmentCommands::New {
                name: Some("p1".into()),
                course: None,
                year: Some(2025),
                grade_period: Some("Fall".into()),
            }),
        )
        .expect("new")
        .expect("payload");
        assert_eq!(payload["created_directories"].as_array().map(Vec::len), Some(9));

        let raw = root.join("submissions/unprocessed/alice.c");
        fs::write(&raw, "int main;").expect("write");
        run_command(
            &root,
            true,
            Commands::Submission(SubmissionCommands::Add {
                files: vec![raw],
                anonymize: false,
                no_anonymize: true,
            }),
        )
        .expect("add");

        let status = run_command(&root, true, Commands::Status)
            .expect("status")
            .expect("payload");
        assert_eq!(status["assignment"], "p1");
        assert_eq!(status["submissions"][0]["name"], "alice");
        assert_eq!(status["submissions"][0]["errors"], json!([]));
    }
}
