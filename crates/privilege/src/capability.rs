//! Linux file-capability model
//!
//! The worker binary carries `cap_net_raw` (and `cap_net_admin`) with the
//! effective bit, granted once through `pkexec setcap`.

use async_trait::async_trait;
use lynx_common::{PrivilegeBroker, PrivilegeReport, PrivilegeState, SetupError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, instrument};

/// Capability set requested from `setcap`.
pub const CAPABILITIES: &str = "cap_net_raw,cap_net_admin+ep";

#[derive(Debug, Clone)]
pub struct CapabilityBroker {
    worker: PathBuf,
    getcap: PathBuf,
    pkexec: PathBuf,
}

impl CapabilityBroker {
    pub fn new(worker: impl Into<PathBuf>) -> Self {
        Self {
            worker: worker.into(),
            getcap: PathBuf::from("getcap"),
            pkexec: PathBuf::from("pkexec"),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_getcap(mut self, program: impl Into<PathBuf>) -> Self {
        self.getcap = program.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_pkexec(mut self, program: impl Into<PathBuf>) -> Self {
        self.pkexec = program.into();
        self
    }

    pub fn worker(&self) -> &Path {
        &self.worker
    }
}

/// True when some line of `getcap` output grants `cap_net_raw` with the
/// effective bit. Accepts both `path cap_net_raw=ep` and `path = cap_net_raw+ep`.
pub fn has_net_raw(getcap_output: &str) -> bool {
    getcap_output.lines().any(|line| {
        line.split_whitespace()
            .skip(1)
            .filter(|clause| *clause != "=")
            .any(|clause| {
                let Some(split) = clause.find(|c: char| c == '=' || c == '+') else {
                    return false;
                };
                let (caps, flags) = (&clause[..split], &clause[split + 1..]);
                caps.split(',').any(|c| c == "cap_net_raw") && flags.contains('e')
            })
    })
}

/// Map a finished `pkexec setcap` run onto the setup outcome.
pub fn classify_pkexec(code: Option<i32>, stderr: &str) -> Result<(), SetupError> {
    let stderr = stderr.trim();
    match code {
        Some(0) => Ok(()),
        _ if stderr.contains("dismissed") || stderr.contains("Not authorized") => Err(
            SetupError::Declined("authorization dialog was dismissed".to_string()),
        ),
        Some(126) => Err(SetupError::Declined(
            "authorization was not granted".to_string(),
        )),
        Some(127) => Err(SetupError::Unavailable(
            "pkexec could not run setcap".to_string(),
        )),
        Some(code) => Err(SetupError::Failed(format!(
            "setcap exited with code {code}: {stderr}"
        ))),
        None => Err(SetupError::Failed("pkexec terminated by signal".to_string())),
    }
}

#[async_trait]
impl PrivilegeBroker for CapabilityBroker {
    #[instrument(skip(self), fields(worker = %self.worker.display()))]
    async fn check_privilege(&self) -> PrivilegeReport {
        if !tokio::fs::try_exists(&self.worker).await.unwrap_or(false) {
            return PrivilegeReport::new(PrivilegeState::NotFound)
                .with_reason(format!("worker binary not found at {}", self.worker.display()));
        }

        let output = match Command::new(&self.getcap).arg(&self.worker).output().await {
            Ok(output) => output,
            Err(e) => {
                return PrivilegeReport::new(PrivilegeState::NotRegistered)
                    .with_reason(format!("cannot run getcap: {e}"))
            }
        };

        let listing = String::from_utf8_lossy(&output.stdout);
        debug!(listing = %listing.trim(), "getcap");
        if has_net_raw(&listing) {
            PrivilegeReport::granted()
        } else {
            PrivilegeReport::new(PrivilegeState::NotRegistered).with_reason(format!(
                "cap_net_raw is not set on {}",
                self.worker.display()
            ))
        }
    }

    #[instrument(skip(self), fields(worker = %self.worker.display()))]
    async fn request_setup(&self) -> Result<(), SetupError> {
        if !tokio::fs::try_exists(&self.worker).await.unwrap_or(false) {
            return Err(SetupError::BinaryNotFound(self.worker.clone()));
        }

        info!("requesting {CAPABILITIES} through pkexec");
        let output = Command::new(&self.pkexec)
            .arg("setcap")
            .arg(CAPABILITIES)
            .arg(&self.worker)
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SetupError::Unavailable("pkexec is not installed".to_string()),
                _ => SetupError::Failed(format!("cannot run pkexec: {e}")),
            })?;

        classify_pkexec(
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        )
    }

    fn name(&self) -> &str {
        "capability"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getcap_formats() {
        assert!(has_net_raw("/opt/lynx/lynx-worker cap_net_admin,cap_net_raw=ep\n"));
        assert!(has_net_raw("/opt/lynx/lynx-worker = cap_net_raw+eip\n"));
        assert!(!has_net_raw("/opt/lynx/lynx-worker cap_net_raw=p\n"));
        assert!(!has_net_raw("/opt/lynx/lynx-worker cap_net_admin=ep\n"));
        assert!(!has_net_raw(""));
    }

    #[test]
    fn pkexec_outcomes() {
        assert!(classify_pkexec(Some(0), "").is_ok());
        assert!(matches!(
            classify_pkexec(Some(1), "Error executing command as another user: Request dismissed"),
            Err(SetupError::Declined(_))
        ));
        assert!(matches!(
            classify_pkexec(Some(127), "Error executing command as another user: Not authorized"),
            Err(SetupError::Declined(_))
        ));
        assert!(matches!(
            classify_pkexec(Some(126), ""),
            Err(SetupError::Declined(_))
        ));
        assert!(matches!(
            classify_pkexec(Some(127), ""),
            Err(SetupError::Unavailable(_))
        ));
        assert!(matches!(
            classify_pkexec(Some(1), "Failed to set capabilities"),
            Err(SetupError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn missing_worker_is_not_found() {
        let broker = CapabilityBroker::new("/nonexistent/lynx-worker");
        let report = broker.check_privilege().await;
        assert_eq!(report.state, PrivilegeState::NotFound);
        assert!(matches!(
            broker.request_setup().await,
            Err(SetupError::BinaryNotFound(_))
        ));
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use crate::test_support::script;

        #[tokio::test]
        async fn granted_when_getcap_lists_net_raw() {
            let worker = script("exit 0");
            let getcap = script(r#"echo "$1 cap_net_admin,cap_net_raw=ep""#);
            let broker = CapabilityBroker::new(&worker).with_getcap(&getcap);

            assert_eq!(broker.check_privilege().await.state, PrivilegeState::Granted);
        }

        #[tokio::test]
        async fn not_registered_without_capability() {
            let worker = script("exit 0");
            let getcap = script("exit 0");
            let broker = CapabilityBroker::new(&worker).with_getcap(&getcap);

            let report = broker.check_privilege().await;
            assert_eq!(report.state, PrivilegeState::NotRegistered);
            assert!(report.reason.unwrap().contains("cap_net_raw"));
        }

        #[tokio::test]
        async fn setup_passes_capabilities_to_setcap() {
            let worker = script("exit 0");
            let record = std::env::temp_dir().join(format!("lynx-args-{}", uuid::Uuid::new_v4()));
            let pkexec = script(&format!(r#"echo "$@" > "{}""#, record.display()));
            let broker = CapabilityBroker::new(&worker).with_pkexec(&pkexec);

            broker.request_setup().await.unwrap();
            let args = std::fs::read_to_string(&record).unwrap();
            assert_eq!(
                args.trim(),
                format!("setcap {CAPABILITIES} {}", worker.display())
            );
        }

        #[tokio::test]
        async fn dismissed_dialog_is_declined() {
            let worker = script("exit 0");
            let pkexec = script("echo 'Request dismissed' >&2; exit 126");
            let broker = CapabilityBroker::new(&worker).with_pkexec(&pkexec);

            assert!(matches!(
                broker.request_setup().await,
                Err(SetupError::Declined(_))
            ));
        }

        #[tokio::test]
        async fn missing_pkexec_is_unavailable() {
            let worker = script("exit 0");
            let broker =
                CapabilityBroker::new(&worker).with_pkexec("/nonexistent/pkexec-for-tests");

            assert!(matches!(
                broker.request_setup().await,
                Err(SetupError::Unavailable(_))
            ));
        }
    }
}
