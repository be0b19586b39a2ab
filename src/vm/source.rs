use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use super::VmError;

/// File extension appended to identifiers that carry none.
const SCRIPT_EXTENSION: &str = "rhai";

/// Where a VM loads script text from.
pub trait ScriptSource: Send + Sync {
    fn load(&self, file: &str) -> Result<String, VmError>;
}

/// Loads scripts from a directory on disk.
///
/// The identifier `"ci/build"` maps to `<root>/ci/build.rhai`. Absolute
/// identifiers and identifiers with `..` components are rejected so a job
/// spec can never reach outside the root.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve an identifier to a path under the root.
    pub fn resolve(&self, file: &str) -> Result<PathBuf, VmError> {
        let invalid = |reason: &str| VmError::InvalidFile {
            file: file.to_string(),
            reason: reason.to_string(),
        };

        if file.trim().is_empty() {
            return Err(invalid("empty identifier"));
        }

        let relative = Path::new(file);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::CurDir => {}
                Component::ParentDir => return Err(invalid("parent directory components are not allowed")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("absolute paths are not allowed"));
                }
            }
        }

        let mut path = self.root.join(relative);
        if path.extension().is_none() {
            path.set_extension(SCRIPT_EXTENSION);
        }
        Ok(path)
    }
}

impl ScriptSource for DirectorySource {
    fn load(&self, file: &str) -> Result<String, VmError> {
        let path = self.resolve(file)?;
        std::fs::read_to_string(&path).map_err(|e| VmError::Load {
            file: file.to_string(),
            message: format!("{}: {}", path.display(), e),
        })
    }
}

/// In-memory scripts keyed by identifier.
impl ScriptSource for HashMap<String, String> {
    fn load(&self, file: &str) -> Result<String, VmError> {
        self.get(file).cloned().ok_or_else(|| VmError::Load {
            file: file.to_string(),
            message: "no such script".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_appends_extension() {
        let source = DirectorySource::new("/srv/scripts");
        let path = source.resolve("ci/build").unwrap();
        assert_eq!(path, PathBuf::from("/srv/scripts/ci/build.rhai"));
    }

    #[test]
    fn test_resolve_keeps_explicit_extension() {
        let source = DirectorySource::new("/srv/scripts");
        let path = source.resolve("build.rhai").unwrap();
        assert_eq!(path, PathBuf::from("/srv/scripts/build.rhai"));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let source = DirectorySource::new("/srv/scripts");
        assert!(matches!(
            source.resolve("../etc/passwd"),
            Err(VmError::InvalidFile { .. })
        ));
        assert!(matches!(
            source.resolve("ci/../../secret"),
            Err(VmError::InvalidFile { .. })
        ));
    }

    #[test]
    fn test_resolve_rejects_absolute() {
        let source = DirectorySource::new("/srv/scripts");
        assert!(matches!(
            source.resolve("/etc/passwd"),
            Err(VmError::InvalidFile { .. })
        ));
    }

    #[test]
    fn test_resolve_rejects_empty() {
        let source = DirectorySource::new("/srv/scripts");
        assert!(source.resolve("  ").is_err());
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("build.rhai"), "fn build() { 1 }").unwrap();

        let source = DirectorySource::new(dir.path());
        assert_eq!(source.load("build").unwrap(), "fn build() { 1 }");
        assert!(matches!(source.load("missing"), Err(VmError::Load { .. })));
    }

    #[test]
    fn test_load_from_map() {
        let mut scripts = HashMap::new();
        scripts.insert("build".to_string(), "fn build() { 2 }".to_string());

        assert_eq!(scripts.load("build").unwrap(), "fn build() { 2 }");
        assert!(scripts.load("deploy").is_err());
    }
}
