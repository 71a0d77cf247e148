use std::collections::BTreeMap;
use std::io;
use std::process::Command;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::{debug, info};

use super::core::tail_string;
use super::errors::RunTaskError;

const INSTALL_OUTPUT_TAIL_LEN: usize = 2000;

#[derive(Debug, Deserialize)]
struct InstalledPackage {
    name: String,
    version: String,
}

/// Installs task-declared package requirements through an external
/// installer (pip-compatible: `<installer> list --format=json` and
/// `<installer> install <spec>...`).
///
/// A hash over the sorted requirement list gates the work, so repeated
/// executions of the same task skip the installer entirely until the
/// declared requirements change.
pub struct DependencyProvisioner {
    installer: String,
    requirements_hash: Mutex<Option<String>>,
}

impl DependencyProvisioner {
    pub fn new(installer: impl Into<String>) -> Self {
        Self {
            installer: installer.into(),
            requirements_hash: Mutex::new(None),
        }
    }

    /// Make sure every requirement is installed at its pinned version.
    ///
    /// Requirements with no version pin are installed only when absent.
    pub fn ensure_installed(&self, requirements: &[String]) -> Result<(), RunTaskError> {
        if requirements.is_empty() {
            return Ok(());
        }
        if !self.requirements_changed(requirements) {
            debug!("requirement set unchanged, skipping installer");
            return Ok(());
        }

        let required = parse_requirements(requirements);
        if required.is_empty() {
            return Ok(());
        }
        let installed = self.installed_packages()?;

        let mut to_install = Vec::new();
        for (name, version) in &required {
            match (installed.get(name), version) {
                (None, Some(version)) => to_install.push(format!("{}=={}", name, version)),
                (None, None) => to_install.push(name.clone()),
                (Some(have), Some(want)) if have != want => {
                    to_install.push(format!("{}=={}", name, want));
                }
                _ => {}
            }
        }

        if to_install.is_empty() {
            debug!("all required packages already installed");
            return Ok(());
        }

        info!("installing packages: {:?}", to_install);
        let output = match Command::new(&self.installer)
            .arg("install")
            .args(&to_install)
            .output()
        {
            Ok(output) => output,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(RunTaskError::InstallerNotFound {
                    command: self.installer.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(RunTaskError::InstallFailed {
                packages: to_install,
                output: tail_string(&combined, INSTALL_OUTPUT_TAIL_LEN),
            });
        }

        info!("installed packages: {:?}", to_install);
        Ok(())
    }

    fn requirements_changed(&self, requirements: &[String]) -> bool {
        let mut sorted: Vec<&String> = requirements.iter().collect();
        sorted.sort();
        let joined = sorted
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let hash = format!("{:x}", md5::compute(joined.as_bytes()));

        let mut guard = self
            .requirements_hash
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.as_deref() == Some(hash.as_str()) {
            return false;
        }
        *guard = Some(hash);
        true
    }

    fn installed_packages(&self) -> Result<BTreeMap<String, String>, RunTaskError> {
        let output = match Command::new(&self.installer)
            .args(["list", "--format=json"])
            .output()
        {
            Ok(output) => output,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(RunTaskError::InstallerNotFound {
                    command: self.installer.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        if !output.status.success() {
            return Err(RunTaskError::PackageListFailed {
                output: tail_string(
                    &String::from_utf8_lossy(&output.stderr),
                    INSTALL_OUTPUT_TAIL_LEN,
                ),
            });
        }

        let packages: Vec<InstalledPackage> = serde_json::from_slice(&output.stdout)
            .map_err(|err| RunTaskError::PackageListFailed {
                output: format!("invalid package list JSON: {}", err),
            })?;
        Ok(packages
            .into_iter()
            .map(|pkg| (pkg.name.to_lowercase(), pkg.version))
            .collect())
    }
}

/// Split requirement specs into (name, pinned version) pairs. A spec
/// without a recognized version operator maps to an unpinned entry.
fn parse_requirements(requirements: &[String]) -> BTreeMap<String, Option<String>> {
    let mut parsed = BTreeMap::new();
    for req in requirements {
        let req = req.trim();
        if req.is_empty() || req.starts_with('#') {
            continue;
        }
        let split = req
            .split_once(">=")
            .or_else(|| req.split_once("=="))
            .or_else(|| req.split_once('>'));
        match split {
            Some((name, version)) => {
                parsed.insert(
                    name.trim().to_lowercase(),
                    Some(version.trim().to_string()),
                );
            }
            None => {
                parsed.insert(req.to_lowercase(), None);
            }
        }
    }
    parsed
}
