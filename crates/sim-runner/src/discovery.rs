use crate::error::{Result, RunnerError};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A simulation input file found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationDescriptor {
    /// File name without its extension.
    pub name: String,
    pub path: PathBuf,
}

impl SimulationDescriptor {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_stem()?.to_str()?.to_string();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name,
            path: path.to_path_buf(),
        })
    }
}

/// Scans one directory level for descriptor files. Each call to
/// [`Discoverer::scan`] re-reads the directory, so the result can be
/// recomputed at any time and is always name-ordered.
#[derive(Debug, Clone)]
pub struct Discoverer {
    dir: PathBuf,
    extension: String,
}

impl Discoverer {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn scan(&self) -> Result<Vec<SimulationDescriptor>> {
        let meta = fs::metadata(&self.dir).map_err(|e| {
            RunnerError::discovery(&self.dir, format!("cannot access directory: {}", e))
        })?;
        if !meta.is_dir() {
            return Err(RunnerError::discovery(&self.dir, "not a directory"));
        }
        let root = self
            .dir
            .canonicalize()
            .map_err(|e| RunnerError::discovery(&self.dir, e.to_string()))?;

        let mut paths = Vec::new();
        let walker = walkdir::WalkDir::new(&root)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true);
        for entry in walker {
            // Only the directory itself is fatal; a broken entry inside it is skipped.
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() > 0 => {
                    warn!(
                        path = ?e.path(),
                        error = %e,
                        "skipping unreadable directory entry"
                    );
                    continue;
                }
                Err(e) => return Err(RunnerError::discovery(&root, e.to_string())),
            };
            if entry.file_type().is_file() {
                paths.push(entry.into_path());
            }
        }
        let descriptors = descriptors_from_paths(paths, &self.extension);
        debug!(
            dir = %root.display(),
            extension = %self.extension,
            count = descriptors.len(),
            "discovered simulation descriptors"
        );
        Ok(descriptors)
    }
}

pub fn discover(dir: &Path, extension: &str) -> Result<Vec<SimulationDescriptor>> {
    Discoverer::new(dir, extension).scan()
}

/// Applies the extension filter and name ordering to an already-listed set
/// of paths. No file-system access.
pub fn descriptors_from_paths<I>(paths: I, extension: &str) -> Vec<SimulationDescriptor>
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut out: Vec<SimulationDescriptor> = paths
        .into_iter()
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(extension))
        .filter_map(|p| {
            let descriptor = SimulationDescriptor::from_path(&p);
            if descriptor.is_none() {
                warn!(path = %p.display(), "skipping descriptor with unusable file name");
            }
            descriptor
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sim_runner_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn scan_filters_by_extension_and_sorts_by_name() {
        let dir = temp_dir("discover_sort");
        for name in ["zeta.yml", "alpha.yml", "mid.yml", "notes.txt", "data.yaml"] {
            fs::write(dir.join(name), "incarnation: sapere\n").expect("write");
        }
        fs::create_dir_all(dir.join("nested.yml")).expect("dir named like a file");
        fs::create_dir_all(dir.join("sub")).expect("sub");
        fs::write(dir.join("sub").join("deep.yml"), "").expect("deep");

        let found = discover(&dir, "yml").expect("scan");
        let names: Vec<&str> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert!(found.iter().all(|d| d.path.is_absolute()));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn scan_is_restartable() {
        let dir = temp_dir("discover_restart");
        fs::write(dir.join("b.yml"), "").expect("write");
        fs::write(dir.join("a.yml"), "").expect("write");
        let discoverer = Discoverer::new(&dir, "yml");
        let first = discoverer.scan().expect("first");
        let second = discoverer.scan().expect("second");
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_is_skipped() {
        let dir = temp_dir("discover_dangling");
        fs::write(dir.join("a.yml"), "").expect("write");
        std::os::unix::fs::symlink(dir.join("gone"), dir.join("notes.txt")).expect("symlink");
        std::os::unix::fs::symlink(dir.join("gone.yml"), dir.join("b.yml")).expect("symlink");
        let found = discover(&dir, "yml").expect("scan");
        let names: Vec<&str> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_directory_is_a_discovery_error() {
        let dir = std::env::temp_dir().join("sim_runner_definitely_missing_dir_7c1e");
        let err = discover(&dir, "yml").expect_err("must fail");
        assert!(matches!(err, RunnerError::Discovery { .. }), "{}", err);
    }

    #[test]
    fn file_instead_of_directory_is_a_discovery_error() {
        let dir = temp_dir("discover_file");
        let file = dir.join("plain.yml");
        fs::write(&file, "").expect("write");
        let err = discover(&file, "yml").expect_err("must fail");
        assert!(err.to_string().contains("not a directory"), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn in_memory_paths_follow_the_same_rules() {
        let paths = vec![
            PathBuf::from("/sims/c.yml"),
            PathBuf::from("/sims/a.yml"),
            PathBuf::from("/sims/b.YML"),
            PathBuf::from("/sims/.yml"),
            PathBuf::from("/sims/a.b.yml"),
        ];
        let found = descriptors_from_paths(paths, "yml");
        let names: Vec<&str> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "a.b", "c"]);
    }
}
