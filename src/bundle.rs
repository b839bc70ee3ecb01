//! Experiment artifact bundles.
//!
//! A bundle is unpacked under `<uploads>/<experiment_id>/` and must have this shape:
//!
//! ```text
//! <name>/
//! ├── pyproject.toml
//! └── <name>/
//!     ├── client_app.py
//!     └── server_app.py
//! ```
//!
//! Receiving and extracting uploads happens outside the coordinator; it only sees a
//! [`BundleSource`] that knows how to materialise the files in a directory.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

/// Dependency manifest at the root of the bundle.
pub const MANIFEST: &str = "pyproject.toml";
/// Entry point executed on the nodes.
pub const CLIENT_APP: &str = "client_app.py";
/// Entry point executed by the training driver.
pub const SERVER_APP: &str = "server_app.py";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("invalid bundle structure: missing experiment folder")]
    MissingExperimentFolder,
    #[error("invalid bundle structure: missing inner folder {0}")]
    MissingInnerFolder(String),
    #[error("missing required file: {0}")]
    MissingFile(&'static str),
    #[error("invalid file name {0:?}")]
    InvalidFileName(String),
    #[error("bundle I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Something that can lay out bundle files in a directory.
pub trait BundleSource: Send + Sync {
    /// Writes the bundle contents into `dir`, which already exists.
    fn unpack_into(&self, dir: &Path) -> io::Result<()>;
}

/// A bundle that was already extracted into a staging directory.
#[derive(Debug, Clone)]
pub struct StagedDirectory(PathBuf);

impl StagedDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }
}

impl BundleSource for StagedDirectory {
    fn unpack_into(&self, dir: &Path) -> io::Result<()> {
        copy_tree(&self.0, dir)
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if is_hidden(&entry.file_name()) {
            continue;
        }
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// A validated bundle on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    root: PathBuf,
    name: String,
}

impl Bundle {
    /// Finds and validates the bundle unpacked in `experiment_dir`.
    pub fn locate(experiment_dir: &Path) -> Result<Self, BundleError> {
        let mut folders = fs::read_dir(experiment_dir)?
            .filter_map(Result::ok)
            .filter(|entry| !is_hidden(&entry.file_name()))
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.path())
            .collect::<Vec<_>>();
        folders.sort();
        let root = folders
            .into_iter()
            .next()
            .ok_or(BundleError::MissingExperimentFolder)?;
        Self::open(root)
    }

    /// Refers to the bundle rooted at `root` without checking what is on disk.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self, BundleError> {
        let root = root.into();
        let name = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or(BundleError::MissingExperimentFolder)?;
        Ok(Self { root, name })
    }

    /// Validates the bundle rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BundleError> {
        let bundle = Self::at(root)?;

        if !bundle.package_dir().is_dir() {
            return Err(BundleError::MissingInnerFolder(bundle.name));
        }
        for (file, path) in [
            (MANIFEST, bundle.manifest()),
            (CLIENT_APP, bundle.client_app()),
            (SERVER_APP, bundle.server_app()),
        ] {
            if !path.is_file() {
                return Err(BundleError::MissingFile(file));
            }
        }
        Ok(bundle)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The experiment name, taken from the bundle folder.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn package_dir(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join(MANIFEST)
    }

    pub fn client_app(&self) -> PathBuf {
        self.package_dir().join(CLIENT_APP)
    }

    pub fn server_app(&self) -> PathBuf {
        self.package_dir().join(SERVER_APP)
    }

    /// Where an upload named `file_name` is stored, together with the name it is stored under.
    ///
    /// Only the last component of `file_name` is used. The manifest goes to the bundle root,
    /// everything else into the package folder.
    pub fn target_for(&self, file_name: &str) -> Result<(String, PathBuf), BundleError> {
        let base = Path::new(file_name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty() && name != "." && name != "..")
            .ok_or_else(|| BundleError::InvalidFileName(file_name.to_string()))?;
        let target = if base == MANIFEST {
            self.root.join(&base)
        } else {
            self.package_dir().join(&base)
        };
        Ok((base, target))
    }

    /// Writes replacement files next to their targets without touching the current ones.
    ///
    /// Every name is checked before anything is written. Of two uploads with the same stored
    /// name the later one wins.
    pub fn stage_replacements<'a, I>(&self, files: I) -> Result<StagedFiles, BundleError>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut planned: Vec<(String, PathBuf, &[u8])> = Vec::new();
        for (file_name, contents) in files {
            let (name, target) = self.target_for(file_name)?;
            match planned.iter_mut().find(|(stored, _, _)| *stored == name) {
                Some(entry) => entry.2 = contents,
                None => planned.push((name, target, contents)),
            }
        }

        let mut staged = StagedFiles {
            files: Vec::with_capacity(planned.len()),
        };
        for (name, target, contents) in planned {
            let temporary = sibling(&target, "replacement");
            staged.files.push(StagedFile {
                name,
                target,
                temporary: temporary.clone(),
            });
            fs::write(&temporary, contents)?;
        }
        Ok(staged)
    }
}

fn sibling(target: &Path, suffix: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}", name, suffix))
}

#[derive(Debug)]
struct StagedFile {
    name: String,
    target: PathBuf,
    temporary: PathBuf,
}

/// Replacement files written beside the bundle but not in place yet. Dropping them deletes the
/// temporary copies.
#[derive(Debug)]
pub struct StagedFiles {
    files: Vec<StagedFile>,
}

impl StagedFiles {
    /// The stored names, in upload order.
    pub fn names(&self) -> Vec<String> {
        self.files.iter().map(|file| file.name.clone()).collect()
    }

    /// Moves every staged file over its target. The previous contents are set aside until
    /// [`SwappedFiles::keep`]. If a move fails, the files already moved are put back.
    pub fn swap_in(mut self) -> Result<SwappedFiles, BundleError> {
        let mut swapped = SwappedFiles {
            files: Vec::with_capacity(self.files.len()),
            kept: false,
        };
        while let Some(file) = self.files.pop() {
            let backup = if file.target.exists() {
                let previous = sibling(&file.target, "previous");
                if let Err(err) = fs::rename(&file.target, &previous) {
                    self.files.push(file);
                    return Err(err.into());
                }
                Some(previous)
            } else {
                None
            };
            if let Err(err) = fs::rename(&file.temporary, &file.target) {
                if let Some(previous) = &backup {
                    restore(previous, &file.target);
                }
                self.files.push(file);
                return Err(err.into());
            }
            swapped.files.push(SwappedFile {
                target: file.target,
                backup,
            });
        }
        Ok(swapped)
    }
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        for file in &self.files {
            match fs::remove_file(&file.temporary) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => {
                    warn!(path = %file.temporary.display(), error = %err, "failed to remove staged file");
                }
                _ => {}
            }
        }
    }
}

#[derive(Debug)]
struct SwappedFile {
    target: PathBuf,
    backup: Option<PathBuf>,
}

/// Replacement files in place with the previous contents set aside. Dropping them without
/// calling [`keep`](Self::keep) restores the previous contents.
#[derive(Debug)]
pub struct SwappedFiles {
    files: Vec<SwappedFile>,
    kept: bool,
}

impl SwappedFiles {
    /// Makes the replacement permanent.
    pub fn keep(mut self) {
        self.kept = true;
        for file in &self.files {
            if let Some(backup) = &file.backup {
                if let Err(err) = fs::remove_file(backup) {
                    warn!(path = %backup.display(), error = %err, "failed to remove replaced file");
                }
            }
        }
    }
}

impl Drop for SwappedFiles {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        for file in self.files.iter().rev() {
            match &file.backup {
                Some(backup) => restore(backup, &file.target),
                None => {
                    if let Err(err) = fs::remove_file(&file.target) {
                        warn!(path = %file.target.display(), error = %err, "failed to roll back bundle file");
                    }
                }
            }
        }
    }
}

fn restore(backup: &Path, target: &Path) {
    if let Err(err) = fs::rename(backup, target) {
        warn!(path = %target.display(), error = %err, "failed to restore bundle file");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Writes a well-formed bundle named `name` into `dir`.
    pub fn write_bundle(dir: &Path, name: &str) {
        let package = dir.join(name).join(name);
        fs::create_dir_all(&package).unwrap();
        fs::write(dir.join(name).join(MANIFEST), "[project]\nname = \"demo\"\n").unwrap();
        fs::write(package.join(CLIENT_APP), "print('client')\n").unwrap();
        fs::write(package.join(SERVER_APP), "print('server')\n").unwrap();
    }

    #[test]
    fn test_locate_valid_bundle() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "mnist");
        let bundle = Bundle::locate(dir.path()).unwrap();
        assert_eq!(bundle.name(), "mnist");
        assert_eq!(bundle.client_app(), dir.path().join("mnist/mnist/client_app.py"));
    }

    #[test]
    fn test_locate_reports_missing_pieces() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Bundle::locate(dir.path()),
            Err(BundleError::MissingExperimentFolder)
        ));

        fs::create_dir(dir.path().join("mnist")).unwrap();
        assert!(matches!(
            Bundle::locate(dir.path()),
            Err(BundleError::MissingInnerFolder(_))
        ));

        fs::create_dir(dir.path().join("mnist/mnist")).unwrap();
        assert!(matches!(
            Bundle::locate(dir.path()),
            Err(BundleError::MissingFile(MANIFEST))
        ));
    }

    #[test]
    fn test_staged_directory_skips_hidden_files() {
        let staging = tempfile::tempdir().unwrap();
        write_bundle(staging.path(), "mnist");
        fs::write(staging.path().join(".DS_Store"), "junk").unwrap();

        let target = tempfile::tempdir().unwrap();
        StagedDirectory::new(staging.path())
            .unpack_into(target.path())
            .unwrap();
        assert!(!target.path().join(".DS_Store").exists());
        assert!(Bundle::locate(target.path()).is_ok());
    }

    fn package(dir: &Path) -> Bundle {
        write_bundle(dir, "mnist");
        Bundle::locate(dir).unwrap()
    }

    fn leftovers(bundle: &Bundle) -> Vec<String> {
        [bundle.root().to_path_buf(), bundle.package_dir()]
            .iter()
            .flat_map(|dir| fs::read_dir(dir).unwrap())
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with('.'))
            .collect()
    }

    #[test]
    fn test_target_for_placement() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = package(dir.path());

        assert_eq!(
            bundle.target_for("pyproject.toml").unwrap(),
            (MANIFEST.to_string(), bundle.manifest())
        );
        assert_eq!(
            bundle.target_for("../../client_app.py").unwrap(),
            (CLIENT_APP.to_string(), bundle.client_app())
        );
        assert!(matches!(
            bundle.target_for(".."),
            Err(BundleError::InvalidFileName(_))
        ));
    }

    #[test]
    fn test_kept_swap_replaces_files() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = package(dir.path());

        let staged = bundle
            .stage_replacements(vec![
                ("pyproject.toml", &b"new"[..]),
                ("client_app.py", &b"first"[..]),
                ("client_app.py", &b"patched"[..]),
            ])
            .unwrap();
        assert_eq!(staged.names(), vec![MANIFEST, CLIENT_APP]);
        // nothing visible before the swap
        assert_eq!(fs::read(bundle.client_app()).unwrap(), b"print('client')\n");

        staged.swap_in().unwrap().keep();
        assert_eq!(fs::read(bundle.manifest()).unwrap(), b"new");
        assert_eq!(fs::read(bundle.client_app()).unwrap(), b"patched");
        assert!(leftovers(&bundle).is_empty());
    }

    #[test]
    fn test_dropped_swap_restores_previous_files() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = package(dir.path());

        let swapped = bundle
            .stage_replacements(vec![
                ("client_app.py", &b"patched"[..]),
                ("utils.py", &b"helpers"[..]),
            ])
            .unwrap()
            .swap_in()
            .unwrap();
        assert_eq!(fs::read(bundle.client_app()).unwrap(), b"patched");
        drop(swapped);

        assert_eq!(fs::read(bundle.client_app()).unwrap(), b"print('client')\n");
        assert!(!bundle.package_dir().join("utils.py").exists());
        assert!(leftovers(&bundle).is_empty());
    }

    #[test]
    fn test_invalid_name_stages_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = package(dir.path());

        let err = bundle
            .stage_replacements(vec![("client_app.py", &b"patched"[..]), ("..", &b""[..])])
            .unwrap_err();
        assert!(matches!(err, BundleError::InvalidFileName(_)));
        assert!(leftovers(&bundle).is_empty());

        // a staged set that is never swapped in leaves no trace either
        drop(bundle.stage_replacements(vec![("client_app.py", &b"patched"[..])]).unwrap());
        assert_eq!(fs::read(bundle.client_app()).unwrap(), b"print('client')\n");
        assert!(leftovers(&bundle).is_empty());
    }
}
