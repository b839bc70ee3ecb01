use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
};

use tokio::{process::Command, sync::Mutex};

use super::SupervisorError;
use crate::{bundle::MANIFEST, settings::RuntimeSettings};

/// The shared Python environment the training backend runs in.
///
/// Created once at startup and shared by reference. Dependency installs are serialised because
/// they all write into the same environment.
#[derive(Debug)]
pub struct RuntimeEnvironment {
    venv: PathBuf,
    bin: PathBuf,
    settings: RuntimeSettings,
    install_lock: Mutex<()>,
}

impl RuntimeEnvironment {
    /// Uses the environment at `venv` as is.
    pub fn at(venv: impl Into<PathBuf>, settings: RuntimeSettings) -> Self {
        let venv = venv.into();
        Self {
            bin: venv.join("bin"),
            venv,
            settings,
            install_lock: Mutex::new(()),
        }
    }

    /// Prepares `<runtime_dir>/flower`, creating the environment if it is missing and
    /// installing the backend requirement into it.
    pub async fn initialize(
        runtime_dir: &Path,
        settings: RuntimeSettings,
    ) -> Result<Self, SupervisorError> {
        if !cfg!(target_os = "linux") {
            return Err(SupervisorError::Unsupported);
        }
        tokio::fs::create_dir_all(runtime_dir).await.map_err(|err| {
            SupervisorError::Environment(format!(
                "cannot create {}: {}",
                runtime_dir.display(),
                err
            ))
        })?;

        let this = Self::at(runtime_dir.join("flower"), settings);
        if !this.venv.exists() {
            info!(venv = %this.venv.display(), "creating shared environment");
            let mut command = Command::new(&this.settings.python);
            command.arg("-m").arg("venv").arg(&this.venv);
            run(command, &this.settings.python)
                .await
                .map_err(SupervisorError::Environment)?;
        }

        info!(requirement = %this.settings.flower_requirement, "installing backend requirement");
        let mut command = this.command(this.binary("pip"));
        command.arg("install").arg(&this.settings.flower_requirement);
        run(command, "pip")
            .await
            .map_err(SupervisorError::Environment)?;
        Ok(this)
    }

    pub fn venv(&self) -> &Path {
        &self.venv
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Path of the executable `name` inside the environment.
    pub fn binary(&self, name: &str) -> PathBuf {
        self.bin.join(name)
    }

    /// A command for `program` with `VIRTUAL_ENV` and `PATH` pointing at the environment.
    pub fn command(&self, program: impl Into<PathBuf>) -> Command {
        let mut command = Command::new(program.into());
        command.env("VIRTUAL_ENV", &self.venv);
        if let Some(path) = self.search_path() {
            command.env("PATH", path);
        }
        command
    }

    fn search_path(&self) -> Option<OsString> {
        let inherited = env::var_os("PATH").unwrap_or_default();
        let dirs = std::iter::once(self.bin.clone()).chain(env::split_paths(&inherited));
        env::join_paths(dirs).ok()
    }

    /// Installs the package declared by the manifest in `bundle` in editable mode.
    pub async fn install_dependencies(&self, bundle: &Path) -> Result<(), SupervisorError> {
        let _guard = self.install_lock.lock().await;

        if !bundle.join(MANIFEST).is_file() {
            return Err(SupervisorError::DependencyInstall(format!(
                "{} not found in {}",
                MANIFEST,
                bundle.display()
            )));
        }

        debug!(bundle = %bundle.display(), "installing bundle dependencies");
        let mut command = self.command(self.binary("pip"));
        command.arg("install").arg("-e").arg(".").current_dir(bundle);
        run(command, "pip")
            .await
            .map_err(SupervisorError::DependencyInstall)
    }
}

/// Runs `command` to completion, turning a spawn failure or a non-zero exit into a message that
/// carries the captured output.
async fn run(mut command: Command, label: &str) -> Result<(), String> {
    let output = command
        .output()
        .await
        .map_err(|err| format!("failed to run {}: {}", label, err))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{} exited with {}\nOutput: {}{}",
            label,
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ))
    }
}
