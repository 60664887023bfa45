//! Caller authentication
//!
//! The daemon trusts a connection only after a [`CallerVerifier`] accepts the
//! peer's kernel-reported credentials. The default policy ties trust to the
//! install location: the caller's executable must sit in the daemon's own
//! directory.

use std::io;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;

/// Who is on the other end of a Unix socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
    /// Executable path resolved from `pid`, when the platform allows it.
    pub executable: Option<PathBuf>,
}

impl PeerCredentials {
    /// Credentials of the peer of `stream` (SO_PEERCRED / LOCAL_PEERCRED).
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let cred = stream.peer_cred()?;
        let pid = cred.pid();
        Ok(Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid,
            executable: pid.and_then(executable_of),
        })
    }
}

#[cfg(target_os = "linux")]
fn executable_of(pid: i32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/exe")).ok()
}

#[cfg(target_os = "macos")]
fn executable_of(pid: i32) -> Option<PathBuf> {
    use std::os::unix::ffi::OsStrExt;

    let mut buffer = vec![0u8; libc::PROC_PIDPATHINFO_MAXSIZE as usize];
    let len = unsafe {
        libc::proc_pidpath(pid, buffer.as_mut_ptr().cast(), buffer.len() as u32)
    };
    if len <= 0 {
        return None;
    }
    buffer.truncate(len as usize);
    Some(PathBuf::from(std::ffi::OsStr::from_bytes(&buffer)))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn executable_of(_pid: i32) -> Option<PathBuf> {
    None
}

/// Decides whether a connecting process may use the daemon.
pub trait CallerVerifier: Send + Sync {
    fn verify_caller(&self, peer: &PeerCredentials) -> bool;
}

impl<F> CallerVerifier for F
where
    F: Fn(&PeerCredentials) -> bool + Send + Sync,
{
    fn verify_caller(&self, peer: &PeerCredentials) -> bool {
        self(peer)
    }
}

/// Accepts listed user IDs only.
#[derive(Debug, Clone)]
pub struct UidVerifier {
    allowed: Vec<u32>,
}

impl UidVerifier {
    pub fn new(allowed: impl IntoIterator<Item = u32>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl CallerVerifier for UidVerifier {
    fn verify_caller(&self, peer: &PeerCredentials) -> bool {
        self.allowed.contains(&peer.uid)
    }
}

/// Accepts callers whose executable lives directly in a trusted directory.
#[derive(Debug, Clone)]
pub struct ExecutableVerifier {
    trusted: Vec<PathBuf>,
}

impl ExecutableVerifier {
    pub fn new(trusted: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            trusted: trusted
                .into_iter()
                .map(|dir| dir.canonicalize().unwrap_or(dir))
                .collect(),
        }
    }

    /// Trust the directory the running executable was installed in.
    pub fn beside_current_exe() -> io::Result<Self> {
        let exe = std::env::current_exe()?.canonicalize()?;
        let dir = exe
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "executable has no parent"))?;
        Ok(Self::new([dir.to_path_buf()]))
    }

    pub fn trusted(&self) -> &[PathBuf] {
        &self.trusted
    }
}

impl CallerVerifier for ExecutableVerifier {
    fn verify_caller(&self, peer: &PeerCredentials) -> bool {
        let Some(dir) = peer.executable.as_deref().and_then(Path::parent) else {
            return false;
        };
        self.trusted.iter().any(|trusted| trusted == dir)
    }
}

/// Accepts only when every inner verifier accepts. Empty accepts nobody.
#[derive(Default)]
pub struct AllOf {
    verifiers: Vec<Box<dyn CallerVerifier>>,
}

impl AllOf {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, verifier: impl CallerVerifier + 'static) -> Self {
        self.verifiers.push(Box::new(verifier));
        self
    }
}

impl CallerVerifier for AllOf {
    fn verify_caller(&self, peer: &PeerCredentials) -> bool {
        !self.verifiers.is_empty() && self.verifiers.iter().all(|v| v.verify_caller(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(uid: u32, exe: &str) -> PeerCredentials {
        PeerCredentials {
            uid,
            gid: uid,
            pid: Some(4242),
            executable: Some(PathBuf::from(exe)),
        }
    }

    #[test]
    fn uid_allow_list() {
        let verifier = UidVerifier::new([0, 501]);
        assert!(verifier.verify_caller(&peer(501, "/x")));
        assert!(!verifier.verify_caller(&peer(502, "/x")));
    }

    #[test]
    fn executable_must_sit_in_trusted_dir() {
        let verifier = ExecutableVerifier::new([PathBuf::from("/nonexistent/lynx/bin")]);
        assert!(verifier.verify_caller(&peer(501, "/nonexistent/lynx/bin/lynx")));
        assert!(!verifier.verify_caller(&peer(501, "/nonexistent/lynx/bin/sub/lynx")));
        assert!(!verifier.verify_caller(&peer(501, "/usr/bin/python3")));

        let mut unknown = peer(501, "/x");
        unknown.executable = None;
        assert!(!verifier.verify_caller(&unknown));
    }

    #[test]
    fn all_of_requires_every_verifier() {
        let verifier = AllOf::new()
            .with(UidVerifier::new([501]))
            .with(ExecutableVerifier::new([PathBuf::from("/nonexistent/app")]));
        assert!(verifier.verify_caller(&peer(501, "/nonexistent/app/lynx")));
        assert!(!verifier.verify_caller(&peer(0, "/nonexistent/app/lynx")));
        assert!(!verifier.verify_caller(&peer(501, "/tmp/lynx")));
        assert!(!AllOf::new().verify_caller(&peer(501, "/nonexistent/app/lynx")));
    }

    #[test]
    fn closures_are_verifiers() {
        let root_only = |p: &PeerCredentials| p.uid == 0;
        assert!(root_only.verify_caller(&peer(0, "/x")));
        assert!(!root_only.verify_caller(&peer(1, "/x")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn socket_pair_reports_own_process() {
        let (a, _b) = UnixStream::pair().unwrap();
        let creds = PeerCredentials::from_stream(&a).unwrap();
        assert_eq!(creds.uid, unsafe { libc::geteuid() });

        #[cfg(target_os = "linux")]
        {
            assert_eq!(creds.pid, Some(std::process::id() as i32));
            let own = std::env::current_exe().unwrap().canonicalize().unwrap();
            assert_eq!(creds.executable, Some(own.clone()));
            assert!(ExecutableVerifier::beside_current_exe()
                .unwrap()
                .verify_caller(&creds));
        }
    }
}
