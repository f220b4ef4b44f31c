use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use agh_core::codec::{self, Field, Record};
use agh_core::{AghError, KeyPath, Metadata, Result};
use serde_json::Value;
use tracing::debug;

pub const USER_DEFAULTS_ENV: &str = "AGH_USER_DEFAULTS";
pub const USER_DEFAULTS_FILE_NAME: &str = ".agh_user_defaults.json";

pub const BUILTIN_ANONYMIZE_NAMES: bool = true;
pub const BUILTIN_OUTPUT_FILE: &str = "index.pdf";
pub const BUILTIN_OUTPUT_TEMPLATE_NAME: &str = "index.qmd";
pub const BUILTIN_TEMPLATE_EDITOR_COMMAND: &str = "subl $file";
pub const BUILTIN_TEST_EDITOR_COMMAND: &str = "subl $file";
pub const BUILTIN_GENERAL_EDITOR_COMMAND: &str = "subl $files";
pub const BUILTIN_DEFAULT_TEST_FILE_NAME: &str = "test-assignment.py";

/// Grading options. Unset (`None`) fields fall back to the user defaults and
/// then to built-in values when read through [`ResolvedOptions`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraderOptions {
    pub anonymize_names: Option<bool>,
    /// Files produced by rendering; the first is the primary output.
    pub output_files: Option<Vec<String>>,
    pub output_template_name: Option<String>,
    pub template_editor_command: Option<String>,
    pub test_editor_command: Option<String>,
    pub general_editor_command: Option<String>,
    pub default_test_file_name: Option<String>,
    pub metadata: Metadata,
}

impl Record for GraderOptions {
    const NAME: &'static str = "GraderOptions";

    fn fields() -> Vec<Field<Self>> {
        vec![
            Field::<Self>::scalar("anonymize_names", |r| &r.anonymize_names, |r| &mut r.anonymize_names)
                .optional(),
            Field::<Self>::scalar("output_files", |r| &r.output_files, |r| &mut r.output_files).optional(),
            Field::<Self>::scalar(
                "output_template_name",
                |r| &r.output_template_name,
                |r| &mut r.output_template_name,
            )
            .optional(),
            Field::<Self>::scalar(
                "template_editor_command",
                |r| &r.template_editor_command,
                |r| &mut r.template_editor_command,
            )
            .optional(),
            Field::<Self>::scalar(
                "test_editor_command",
                |r| &r.test_editor_command,
                |r| &mut r.test_editor_command,
            )
            .optional(),
            Field::<Self>::scalar(
                "general_editor_command",
                |r| &r.general_editor_command,
                |r| &mut r.general_editor_command,
            )
            .optional(),
            Field::<Self>::scalar(
                "default_test_file_name",
                |r| &r.default_test_file_name,
                |r| &mut r.default_test_file_name,
            )
            .optional(),
            Field::<Self>::plain("metadata", |r| &r.metadata, |r| &mut r.metadata).optional(),
        ]
    }
}

impl GraderOptions {
    /// The instance's own value, else the defaults' value, else `builtin`.
    pub fn resolve<T: Clone>(
        &self,
        defaults: &GraderOptions,
        field: fn(&GraderOptions) -> &Option<T>,
        builtin: impl FnOnce() -> T,
    ) -> T {
        field(self)
            .as_ref()
            .or_else(|| field(defaults).as_ref())
            .cloned()
            .unwrap_or_else(builtin)
    }
}

/// Shared handle on the per-user default options.
///
/// Clones share state, so a change made through one handle is seen by every
/// [`ResolvedOptions`] read afterwards.
#[derive(Debug, Clone, Default)]
pub struct UserDefaults {
    options: Arc<RwLock<GraderOptions>>,
    path: Option<PathBuf>,
}

impl UserDefaults {
    pub fn from_options(options: GraderOptions) -> Self {
        UserDefaults {
            options: Arc::new(RwLock::new(options)),
            path: None,
        }
    }

    /// `$AGH_USER_DEFAULTS`, else `~/.config/agh/.agh_user_defaults.json`.
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(p) = std::env::var(USER_DEFAULTS_ENV) {
            if !p.trim().is_empty() {
                return Some(PathBuf::from(p));
            }
        }
        dirs::home_dir().map(|home| home.join(".config").join("agh").join(USER_DEFAULTS_FILE_NAME))
    }

    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Reads `path` if it exists; a missing file yields empty defaults that
    /// will be written there on `save`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let options = if path.is_file() {
            debug!(path = %path.display(), "loading user defaults");
            codec::load::<GraderOptions>(path)?
        } else {
            GraderOptions::default()
        };
        Ok(UserDefaults {
            options: Arc::new(RwLock::new(options)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| AghError::Validation("user defaults have no backing file".to_string()))?;
        codec::save(&self.snapshot(), path)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> GraderOptions {
        match self.options.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut GraderOptions)) {
        match self.options.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// Read-side view of an options instance layered over the user defaults.
pub struct ResolvedOptions<'a> {
    options: &'a GraderOptions,
    defaults: GraderOptions,
}

impl<'a> ResolvedOptions<'a> {
    pub fn new(options: &'a GraderOptions, defaults: &UserDefaults) -> Self {
        ResolvedOptions {
            options,
            defaults: defaults.snapshot(),
        }
    }

    pub fn anonymize_names(&self) -> bool {
        self.options
            .resolve(&self.defaults, |o| &o.anonymize_names, || BUILTIN_ANONYMIZE_NAMES)
    }

    pub fn output_files(&self) -> Vec<String> {
        self.options.resolve(&self.defaults, |o| &o.output_files, || {
            vec![BUILTIN_OUTPUT_FILE.to_string()]
        })
    }

    pub fn output_template_name(&self) -> String {
        self.options.resolve(&self.defaults, |o| &o.output_template_name, || {
            BUILTIN_OUTPUT_TEMPLATE_NAME.to_string()
        })
    }

    pub fn template_editor_command(&self) -> String {
        self.options.resolve(&self.defaults, |o| &o.template_editor_command, || {
            BUILTIN_TEMPLATE_EDITOR_COMMAND.to_string()
        })
    }

    pub fn test_editor_command(&self) -> String {
        self.options.resolve(&self.defaults, |o| &o.test_editor_command, || {
            BUILTIN_TEST_EDITOR_COMMAND.to_string()
        })
    }

    pub fn general_editor_command(&self) -> String {
        self.options.resolve(&self.defaults, |o| &o.general_editor_command, || {
            BUILTIN_GENERAL_EDITOR_COMMAND.to_string()
        })
    }

    pub fn default_test_file_name(&self) -> String {
        self.options.resolve(&self.defaults, |o| &o.default_test_file_name, || {
            BUILTIN_DEFAULT_TEST_FILE_NAME.to_string()
        })
    }

    /// Own metadata first, then the defaults' metadata.
    pub fn metadata(&self, key: &KeyPath) -> Option<Value> {
        self.options
            .metadata
            .get(key)
            .or_else(|| self.defaults.metadata.get(key))
            .cloned()
    }
}
