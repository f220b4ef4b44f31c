//! Assignments, submissions and the pipeline that turns an uploaded file into
//! graded output.

pub mod archive;
pub mod assignment;
pub mod options;
pub mod output;
pub mod postprocess;
pub mod submission;
pub mod tools;

pub use assignment::{Assignment, AssignmentData, AssignmentLayout};
pub use options::{GraderOptions, ResolvedOptions, UserDefaults};
pub use output::{Notice, OutputSectionData, SubmissionFileData};
pub use postprocess::LinkPolicy;
pub use submission::{MainOutputFiles, Submission, SubmissionData};
pub use tools::{CommandOutput, CommandRunner, Phase, PhaseOutcome, RunOutputInfo, ShellRunner};
