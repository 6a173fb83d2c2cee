//! Idempotent generation of system configuration files.
//!
//! A [`ConfigArtifact`] describes one generated file: where it lives, how
//! its content is produced, what gets patched into it, and what happens to
//! a previous version. Writing the same artifact twice with the same inputs
//! on a clean filesystem yields byte-identical files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::runner::CommandRunner;

/// What a failed `.bak` rename means for the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPolicy {
    /// The write fails if the previous file cannot be moved aside.
    Required,
    /// A failed rename is logged and the previous file is overwritten.
    BestEffort,
}

/// Where the artifact's initial content comes from.
#[derive(Debug, Clone)]
pub enum ContentSource {
    Literal(String),
    /// Captured stdout of an external dump command, e.g.
    /// `containerd config default`.
    CommandStdout { program: String, args: Vec<String> },
}

/// One plain-text replacement, applied to the file as it exists on disk.
#[derive(Debug, Clone)]
pub struct Substitution {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone)]
pub struct ConfigArtifact {
    pub name: String,
    pub path: PathBuf,
    pub backup: BackupPolicy,
    pub source: ContentSource,
    pub substitutions: Vec<Substitution>,
}

impl ConfigArtifact {
    pub fn literal(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            backup: BackupPolicy::BestEffort,
            source: ContentSource::Literal(content.into()),
            substitutions: Vec::new(),
        }
    }

    pub fn from_command(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        program: impl Into<String>,
        args: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            backup: BackupPolicy::BestEffort,
            source: ContentSource::CommandStdout {
                program: program.into(),
                args: args.iter().map(|s| s.to_string()).collect(),
            },
            substitutions: Vec::new(),
        }
    }

    pub fn backup(mut self, policy: BackupPolicy) -> Self {
        self.backup = policy;
        self
    }

    /// Append a replacement. Substitutions run in registration order, each
    /// over the file contents left by the previous one.
    pub fn substitute(mut self, pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.substitutions.push(Substitution {
            pattern: pattern.into(),
            replacement: replacement.into(),
        });
        self
    }

    /// Back up any previous file, write the generated content, then apply
    /// the substitutions in place.
    pub fn write(&self, runner: &dyn CommandRunner) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            // Pre-existing directory is not an error.
            let _ = fs::create_dir_all(parent);
        }

        if self.path.exists() {
            let bak = bak_path(&self.path);
            // An older .bak at the same path is overwritten by the rename.
            match fs::rename(&self.path, &bak) {
                Ok(()) => tracing::debug!(artifact = %self.name, bak = %bak.display(), "backed up previous file"),
                Err(err) => match self.backup {
                    BackupPolicy::Required => {
                        return Err(err).with_context(|| {
                            format!(
                                "failed to back up {} to {}",
                                self.path.display(),
                                bak.display()
                            )
                        });
                    }
                    BackupPolicy::BestEffort => {
                        tracing::warn!(artifact = %self.name, error = %err, "backup rename failed, overwriting");
                    }
                },
            }
        }

        let content = match &self.source {
            ContentSource::Literal(text) => text.clone(),
            ContentSource::CommandStdout { program, args } => {
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                runner
                    .output(program, &args)
                    .with_context(|| format!("failed to generate content for {}", self.name))?
            }
        };

        fs::write(&self.path, content)
            .with_context(|| format!("failed to write {}", self.path.display()))?;

        for sub in &self.substitutions {
            let current = fs::read_to_string(&self.path)
                .with_context(|| format!("failed to re-read {}", self.path.display()))?;
            fs::write(&self.path, current.replace(&sub.pattern, &sub.replacement))
                .with_context(|| format!("failed to patch {}", self.path.display()))?;
        }

        tracing::info!(artifact = %self.name, path = %self.path.display(), "wrote config artifact");
        Ok(())
    }

    /// Same artifact, retargeted to a different path. For tests.
    pub fn at(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }
}

fn bak_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".bak");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;
    use tempfile::TempDir;

    #[test]
    fn test_literal_write_creates_parent_and_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/dir/app.conf");
        let artifact = ConfigArtifact::literal("app", &path, "key=1");
        artifact.write(&MockRunner::new()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "key=1");
    }

    #[test]
    fn test_existing_file_is_renamed_to_bak() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.conf");
        fs::write(&path, "old").unwrap();

        ConfigArtifact::literal("app", &path, "new")
            .write(&MockRunner::new())
            .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        assert_eq!(
            fs::read_to_string(dir.path().join("app.conf.bak")).unwrap(),
            "old"
        );
    }

    #[test]
    fn test_stale_bak_is_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.conf");
        fs::write(&path, "current").unwrap();
        fs::write(dir.path().join("app.conf.bak"), "stale").unwrap();

        ConfigArtifact::literal("app", &path, "new")
            .write(&MockRunner::new())
            .unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("app.conf.bak")).unwrap(),
            "current"
        );
    }

    #[test]
    fn test_substitutions_apply_in_order_over_disk_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.conf");

        ConfigArtifact::literal("app", &path, "mode = a\n")
            .substitute("mode = a", "mode = b")
            .substitute("mode = b", "mode = c")
            .write(&MockRunner::new())
            .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "mode = c\n");
    }

    #[test]
    fn test_command_sourced_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dump.toml");
        let mock = MockRunner::new().with_output("dumper defaults", "flag = false");

        ConfigArtifact::from_command("dump", &path, "dumper", &["defaults"])
            .substitute("flag = false", "flag = true")
            .write(&mock)
            .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "flag = true");
    }

    #[test]
    fn test_write_twice_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.conf");
        let artifact = ConfigArtifact::literal("app", &path, "x=1\ny=2\n").substitute("y=2", "y=3");

        artifact.write(&MockRunner::new()).unwrap();
        let first = fs::read(&path).unwrap();
        artifact.write(&MockRunner::new()).unwrap();
        let second = fs::read(&path).unwrap();

        assert_eq!(first, second);
    }
}
