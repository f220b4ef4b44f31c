//! Deterministic, pronounceable pseudonyms for submission files.

use sha2::{Digest, Sha256};
use tracing::trace;

use crate::error::{AghError, Result};
use crate::fs::full_suffix;

pub const DEFAULT_PREFIX: &str = "edu.cofc";
pub const DEFAULT_WORD_COUNT: usize = 4;
pub const DEFAULT_SEPARATOR: &str = "-";

/// Short, distinct, alphabetic words; index is the byte value they encode.
pub const WORDS: [&str; 256] = [
    "aged", "acre", "afar", "agent", "affix", "agile", "aim", "alike",
    "aloha", "amend", "ample", "angel", "apple", "apron", "area", "argue",
    "armor", "art", "avert", "bacon", "boots", "book", "baker", "bunch",
    "barn", "baton", "both", "blade", "blank", "blog", "blimp", "blurt",
    "bring", "civil", "city", "come", "candy", "card", "carol", "crop",
    "crown", "clay", "comic", "cold", "civic", "clamp", "clip", "clasp",
    "class", "clear", "crust", "cycle", "data", "draw", "deal", "duke",
    "down", "debug", "decal", "drive", "ditch", "dress", "drift", "dust",
    "early", "east", "edge", "even", "essay", "elbow", "elk", "elude",
    "elm", "elves", "email", "empty", "enter", "erase", "fable", "food",
    "false", "fox", "fancy", "femur", "found", "fetal", "final", "flip",
    "flint", "flyer", "front", "gas", "frost", "going", "game", "grew",
    "genre", "glass", "giver", "golf", "glad", "good", "grass", "grill",
    "help", "halt", "hull", "happy", "harm", "hasty", "hug", "hatch",
    "haven", "hunt", "icon", "image", "ion", "item", "ivy", "jam",
    "july", "jolt", "jump", "jury", "kick", "kilt", "knee", "koala",
    "lunch", "level", "last", "left", "line", "life", "liver", "lilac",
    "lily", "lunar", "maker", "many", "manor", "march", "match", "most",
    "motor", "mulch", "mumbo", "niece", "name", "near", "next", "oak",
    "oat", "oil", "olive", "only", "open", "opt", "opera", "outer",
    "palm", "punch", "paper", "party", "photo", "poem", "puppy", "petal",
    "plank", "plus", "plant", "plot", "prism", "props", "pupil", "query",
    "quill", "raft", "radar", "rule", "range", "robin", "roman", "recap",
    "rope", "rigor", "river", "size", "salt", "silk", "same", "speed",
    "scan", "scrap", "scope", "squad", "ship", "seven", "share", "shirt",
    "shell", "shrug", "slurp", "swing", "snare", "snort", "speak", "spill",
    "stage", "stamp", "sting", "start", "storm", "those", "talon", "think",
    "trade", "tint", "tweet", "try", "thumb", "tidal", "tiger", "track",
    "trial", "tulip", "union", "upper", "upon", "urban", "vapor", "venue",
    "vest", "voice", "video", "viral", "visor", "volt", "wheat", "wager",
    "wafer", "wish", "wagon", "wind", "water", "whole", "word", "wolf",
    "woven", "xerox", "yard", "yeast", "yield", "yoga", "zero", "zippy",
];

/// Maps digests onto word sequences drawn from a fixed 256-entry list.
#[derive(Debug, Clone)]
pub struct HumanHasher {
    words: Vec<String>,
}

impl Default for HumanHasher {
    fn default() -> Self {
        HumanHasher {
            words: WORDS.iter().map(|w| w.to_string()).collect(),
        }
    }
}

impl HumanHasher {
    pub fn new<I, S>(wordlist: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = wordlist.into_iter().map(Into::into).collect();
        if words.len() != 256 {
            return Err(AghError::Validation(format!(
                "word list must have exactly 256 entries, got {}",
                words.len()
            )));
        }
        Ok(HumanHasher { words })
    }

    /// XOR-folds `bytes` into `target` values. Leftover bytes that do not
    /// divide evenly are folded into the last segment.
    pub fn compress(bytes: &[u8], target: usize) -> Result<Vec<u8>> {
        if target == 0 {
            return Err(AghError::Validation(
                "cannot compress to zero words".to_string(),
            ));
        }
        if target > bytes.len() {
            return Err(AghError::Validation(format!(
                "fewer input bytes ({}) than requested words ({})",
                bytes.len(),
                target
            )));
        }
        let seg = bytes.len() / target;
        let mut out = Vec::with_capacity(target);
        for i in 0..target {
            let end = if i + 1 == target { bytes.len() } else { (i + 1) * seg };
            out.push(bytes[i * seg..end].iter().fold(0u8, |acc, b| acc ^ b));
        }
        Ok(out)
    }

    pub fn humanize(&self, digest: &[u8], words: usize, separator: &str) -> Result<String> {
        let compressed = Self::compress(digest, words)?;
        Ok(compressed
            .iter()
            .map(|b| self.words[*b as usize].as_str())
            .collect::<Vec<_>>()
            .join(separator))
    }
}

/// Identity of one submission within one offering of one course.
#[derive(Debug, Clone, Copy)]
pub struct AssignmentIdentity<'a> {
    pub name: &'a str,
    pub year: &'a str,
    pub term: &'a str,
    pub course: &'a str,
}

pub fn anonymize(file_name: &str, assignment: AssignmentIdentity<'_>) -> Result<String> {
    anonymize_with(&HumanHasher::default(), DEFAULT_PREFIX, file_name, assignment)
}

pub fn anonymize_with(
    hasher: &HumanHasher,
    prefix: &str,
    file_name: &str,
    assignment: AssignmentIdentity<'_>,
) -> Result<String> {
    let full = format!(
        "{}.{}.{}.{}.{}-{}",
        prefix, assignment.year, assignment.term, assignment.course, assignment.name, file_name
    );
    let digest = Sha256::digest(full.as_bytes());
    trace!(digest = %hex::encode(digest), "hashed submission identity");
    hasher.humanize(&digest, DEFAULT_WORD_COUNT, DEFAULT_SEPARATOR)
}

/// Identity recovered from a submission file name when names are not
/// anonymized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub identity: String,
    /// Name the file should carry inside the evaluation directory, when the
    /// upload name is the LMS-decorated form.
    pub base_file_name: Option<String>,
}

/// Parses `"<ids> - <student name> - <timestamp> - <original file>"`. Any
/// other shape yields the file name with its extensions removed.
pub fn parse_submission_name(file_name: &str) -> ParsedName {
    let parts: Vec<&str> = file_name.split(" - ").collect();
    if parts.len() == 4 {
        return ParsedName {
            identity: parts[1].to_string(),
            base_file_name: Some(parts[3].to_string()),
        };
    }
    let suffix = full_suffix(file_name);
    let stem = &file_name[..file_name.len() - suffix.len()];
    ParsedName {
        identity: stem.to_string(),
        base_file_name: None,
    }
}
