//! macOS launchd daemon model
//!
//! The helper daemon is described by a plist in `/Library/LaunchDaemons` and
//! bootstrapped into the system domain once, behind an administrator prompt.

use async_trait::async_trait;
use lynx_common::{PrivilegeBroker, PrivilegeReport, PrivilegeState, SetupError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, instrument};

const LAUNCH_DAEMONS: &str = "/Library/LaunchDaemons";

#[derive(Debug, Clone)]
pub struct LaunchdBroker {
    label: String,
    plist: PathBuf,
    launchctl: PathBuf,
    osascript: PathBuf,
}

impl LaunchdBroker {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let plist = Path::new(LAUNCH_DAEMONS).join(format!("{label}.plist"));
        Self {
            label,
            plist,
            launchctl: PathBuf::from("launchctl"),
            osascript: PathBuf::from("osascript"),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_plist(mut self, plist: impl Into<PathBuf>) -> Self {
        self.plist = plist.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_launchctl(mut self, program: impl Into<PathBuf>) -> Self {
        self.launchctl = program.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_osascript(mut self, program: impl Into<PathBuf>) -> Self {
        self.osascript = program.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// AppleScript that bootstraps the plist with administrator rights.
    pub fn bootstrap_script(&self) -> String {
        format!(
            r#"do shell script "launchctl bootstrap system '{}'" with administrator privileges"#,
            self.plist.display()
        )
    }
}

/// Whether `launchctl print-disabled system` lists `label` as disabled.
///
/// ```text
/// disabled services = {
///     "com.apple.ftpd" => disabled
///     "dev.lynx.netscan.helper" => enabled
/// }
/// ```
pub fn is_disabled(print_disabled: &str, label: &str) -> bool {
    let quoted = format!("\"{label}\"");
    print_disabled.lines().any(|line| {
        let Some((name, value)) = line.trim().split_once("=>") else {
            return false;
        };
        name.trim() == quoted && matches!(value.trim(), "disabled" | "true")
    })
}

/// Map a failed `osascript` run onto the setup outcome. -128 is "User canceled".
pub fn classify_osascript(stderr: &str) -> SetupError {
    let stderr = stderr.trim();
    if stderr.contains("-128") || stderr.contains("User canceled") {
        SetupError::Declined("administrator prompt was cancelled".to_string())
    } else {
        SetupError::Failed(format!("launchctl bootstrap failed: {stderr}"))
    }
}

#[async_trait]
impl PrivilegeBroker for LaunchdBroker {
    #[instrument(skip(self), fields(label = %self.label))]
    async fn check_privilege(&self) -> PrivilegeReport {
        if !tokio::fs::try_exists(&self.plist).await.unwrap_or(false) {
            return PrivilegeReport::new(PrivilegeState::NotFound)
                .with_reason(format!("{} is missing", self.plist.display()));
        }

        let service = format!("system/{}", self.label);
        let registered = Command::new(&self.launchctl)
            .arg("print")
            .arg(&service)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !registered {
            return PrivilegeReport::new(PrivilegeState::NotRegistered)
                .with_reason(format!("{service} is not loaded"));
        }

        match Command::new(&self.launchctl)
            .args(["print-disabled", "system"])
            .output()
            .await
        {
            Ok(output) if is_disabled(&String::from_utf8_lossy(&output.stdout), &self.label) => {
                PrivilegeReport::new(PrivilegeState::RequiresApproval)
                    .with_reason("the daemon is disabled pending approval in Login Items")
            }
            Ok(_) => PrivilegeReport::granted(),
            Err(e) => {
                debug!(error = %e, "print-disabled failed");
                PrivilegeReport::granted()
            }
        }
    }

    #[instrument(skip(self), fields(label = %self.label))]
    async fn request_setup(&self) -> Result<(), SetupError> {
        if !tokio::fs::try_exists(&self.plist).await.unwrap_or(false) {
            return Err(SetupError::BinaryNotFound(self.plist.clone()));
        }

        info!(plist = %self.plist.display(), "bootstrapping helper daemon");
        let output = Command::new(&self.osascript)
            .arg("-e")
            .arg(self.bootstrap_script())
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SetupError::Unavailable("osascript is not available".to_string()),
                _ => SetupError::Failed(format!("cannot run osascript: {e}")),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(classify_osascript(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    fn name(&self) -> &str {
        "launchd"
    }
}
