//! Modification-time fingerprinting for shader hot reload.
//!
//! Each frame the render loop probes the vertex and fragment source files and
//! recompiles when either timestamp moved. A file that is missing or briefly
//! unreadable (an editor mid-save) reads as the Unix epoch, so it compares as
//! "unchanged" until it reappears with a real modification time.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Absolute or working-directory-relative paths of the two trace shader
/// stages watched for edits.
#[derive(Debug, Clone)]
pub struct ShaderPaths {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

/// Combined modification-time signature of the watched shader sources.
///
/// The two stamps are compared as a pair rather than summed, so touching
/// either file alone is always detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFingerprint {
    vertex: SystemTime,
    fragment: SystemTime,
}

impl SourceFingerprint {
    /// Reads the current timestamps of both stages.
    pub fn probe(paths: &ShaderPaths) -> Self {
        Self {
            vertex: mtime_or_epoch(&paths.vertex),
            fragment: mtime_or_epoch(&paths.fragment),
        }
    }
}

fn mtime_or_epoch(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn paths_in(dir: &Path) -> ShaderPaths {
        ShaderPaths {
            vertex: dir.join("demo.vert"),
            fragment: dir.join("demo.frag"),
        }
    }

    #[test]
    fn missing_files_read_as_epoch_and_compare_equal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let first = SourceFingerprint::probe(&paths);
        let second = SourceFingerprint::probe(&paths);
        assert_eq!(first, second);
        assert_eq!(
            first,
            SourceFingerprint {
                vertex: SystemTime::UNIX_EPOCH,
                fragment: SystemTime::UNIX_EPOCH,
            }
        );
    }

    #[test]
    fn creating_either_file_changes_the_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let empty = SourceFingerprint::probe(&paths);

        fs::write(&paths.fragment, "void main() {}").unwrap();
        let with_fragment = SourceFingerprint::probe(&paths);
        assert_ne!(empty, with_fragment);

        fs::write(&paths.vertex, "void main() {}").unwrap();
        let with_both = SourceFingerprint::probe(&paths);
        assert_ne!(with_fragment, with_both);
    }

    #[test]
    fn touching_one_file_changes_the_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        fs::write(&paths.vertex, "a").unwrap();
        fs::write(&paths.fragment, "b").unwrap();
        let before = SourceFingerprint::probe(&paths);

        // An explicit future mtime sidesteps filesystem timestamp
        // granularity, which real edits also have to live with.
        let file = fs::File::options()
            .write(true)
            .open(&paths.fragment)
            .unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        drop(file);

        let after = SourceFingerprint::probe(&paths);
        assert_ne!(before, after);
    }
}
