//! Reader for the per-process files under `/proc`.
//!
//! Every read goes to the kernel at call time; nothing is cached. Errors are
//! classified into [`VerifierError`] so the resolver can tell a vanished
//! process from a transient failure.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use battd_core::identity::VerifierError;
use nix::errno::Errno;

/// Environment variables that make the dynamic loader pull in foreign code.
const LOADER_OVERRIDES: [&str; 3] = ["LD_PRELOAD", "LD_AUDIT", "LD_LIBRARY_PATH"];

/// Fields of `/proc/<pid>/stat` the daemon uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    /// Session id.
    pub session: u32,
    /// Start time in clock ticks since boot.
    pub start_time: u64,
}

/// Fields of `/proc/<pid>/status` the daemon uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStatus {
    /// Pid of the tracing process, 0 when untraced.
    pub tracer_pid: u32,
    /// `PR_SET_NO_NEW_PRIVS` is set.
    pub no_new_privs: bool,
}

/// Handle on a proc filesystem mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::system()
    }
}

impl ProcFs {
    /// Use the proc tree rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The system `/proc` mount.
    #[must_use]
    pub fn system() -> Self {
        Self::new("/proc")
    }

    /// Root of the tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry(&self, pid: u32, name: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(name)
    }

    /// Reads session id and start time.
    pub fn stat(&self, pid: u32) -> Result<ProcStat, VerifierError> {
        let raw = fs::read_to_string(self.entry(pid, "stat")).map_err(|e| classify(pid, &e))?;
        parse_stat(&raw)
    }

    /// Reads tracer and privilege fields.
    pub fn status(&self, pid: u32) -> Result<ProcStatus, VerifierError> {
        let raw = fs::read_to_string(self.entry(pid, "status")).map_err(|e| classify(pid, &e))?;
        parse_status(&raw)
    }

    /// Returns `true` if the process environment sets any loader override.
    ///
    /// Empty values are ignored since the loader ignores them too.
    pub fn has_loader_overrides(&self, pid: u32) -> Result<bool, VerifierError> {
        let raw = fs::read(self.entry(pid, "environ")).map_err(|e| classify(pid, &e))?;
        Ok(raw.split(|b| *b == 0).any(|var| {
            let Some(eq) = var.iter().position(|b| *b == b'=') else {
                return false;
            };
            let (name, value) = (&var[..eq], &var[eq + 1..]);
            !value.is_empty() && LOADER_OVERRIDES.iter().any(|o| o.as_bytes() == name)
        }))
    }

    /// Opens the image the process is executing.
    ///
    /// The returned file refers to the executing inode, even if the path it
    /// was started from has since been replaced or unlinked.
    pub fn open_exe(&self, pid: u32) -> Result<File, VerifierError> {
        File::open(self.entry(pid, "exe")).map_err(|e| classify(pid, &e))
    }

    /// Path the process image was started from.
    pub fn exe_path(&self, pid: u32) -> Result<PathBuf, VerifierError> {
        fs::read_link(self.entry(pid, "exe")).map_err(|e| classify(pid, &e))
    }
}

/// Maps an I/O failure on a `/proc/<pid>` entry onto a verifier error.
pub(crate) fn classify(pid: u32, err: &io::Error) -> VerifierError {
    match err.raw_os_error().map(Errno::from_raw) {
        Some(Errno::ENOENT | Errno::ESRCH) => VerifierError::ProcessGone { pid },
        Some(Errno::EACCES | Errno::EPERM) => VerifierError::AccessDenied { pid },
        _ if err.kind() == io::ErrorKind::NotFound => VerifierError::ProcessGone { pid },
        _ => VerifierError::subsystem(format!("/proc/{pid}: {err}")),
    }
}

fn parse_stat(raw: &str) -> Result<ProcStat, VerifierError> {
    // comm may contain spaces and parentheses; fields resume after the last ')'.
    let rest = raw
        .rfind(')')
        .map(|idx| &raw[idx + 1..])
        .ok_or_else(|| malformed("stat has no command field"))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    let session = fields
        .get(3)
        .and_then(|f| f.parse::<i64>().ok())
        .and_then(|s| u32::try_from(s).ok())
        .ok_or_else(|| malformed("stat session field"))?;
    let start_time = fields
        .get(19)
        .and_then(|f| f.parse::<u64>().ok())
        .ok_or_else(|| malformed("stat starttime field"))?;

    Ok(ProcStat {
        session,
        start_time,
    })
}

fn parse_status(raw: &str) -> Result<ProcStatus, VerifierError> {
    let field = |name: &str| {
        raw.lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .map(str::trim)
    };

    let tracer_pid = field("TracerPid")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| malformed("status TracerPid field"))?;
    // Absent on kernels older than 4.10.
    let no_new_privs = field("NoNewPrivs").is_some_and(|v| v == "1");

    Ok(ProcStatus {
        tracer_pid,
        no_new_privs,
    })
}

fn malformed(reason: &str) -> VerifierError {
    VerifierError::Malformed {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use tempfile::TempDir;

    use super::*;

    const STAT: &str = "4242 (my (odd) cmd) S 1 4242 4200 0 -1 4194560 100 0 0 0 1 2 0 0 20 0 1 0 987654 1000 200";

    fn fake_proc(pid: u32) -> (TempDir, ProcFs) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stat"), STAT).unwrap();
        fs::write(
            dir.join("status"),
            "Name:\tcmd\nTracerPid:\t0\nNoNewPrivs:\t1\n",
        )
        .unwrap();
        fs::write(dir.join("environ"), b"PATH=/usr/bin\0LD_PRELOAD=\0HOME=/root\0").unwrap();
        let procfs = ProcFs::new(tmp.path());
        (tmp, procfs)
    }

    #[test]
    fn test_parse_stat_handles_parenthesized_comm() {
        let stat = parse_stat(STAT).unwrap();
        assert_eq!(stat.session, 4200);
        assert_eq!(stat.start_time, 987_654);
    }

    #[test]
    fn test_parse_stat_rejects_truncated() {
        assert!(matches!(
            parse_stat("1 (init) S 0 1"),
            Err(VerifierError::Malformed { .. })
        ));
        assert!(parse_stat("garbage").is_err());
    }

    #[test]
    fn test_parse_status() {
        let status = parse_status("TracerPid:\t311\nNoNewPrivs:\t0\n").unwrap();
        assert_eq!(status.tracer_pid, 311);
        assert!(!status.no_new_privs);

        let old_kernel = parse_status("TracerPid:\t0\n").unwrap();
        assert!(!old_kernel.no_new_privs);
        assert!(parse_status("Name:\tx\n").is_err());
    }

    #[test]
    fn test_fake_tree_reads() {
        let (_tmp, procfs) = fake_proc(4242);
        assert_eq!(procfs.stat(4242).unwrap().start_time, 987_654);
        assert!(procfs.status(4242).unwrap().no_new_privs);
        // Empty LD_PRELOAD does not count.
        assert!(!procfs.has_loader_overrides(4242).unwrap());
    }

    #[test]
    fn test_loader_override_detected() {
        let (tmp, procfs) = fake_proc(7);
        fs::write(
            tmp.path().join("7/environ"),
            b"LD_LIBRARY_PATH=/tmp/evil\0",
        )
        .unwrap();
        assert!(procfs.has_loader_overrides(7).unwrap());
    }

    #[test]
    fn test_missing_process_is_gone() {
        let (_tmp, procfs) = fake_proc(1);
        assert_eq!(
            procfs.stat(99).unwrap_err(),
            VerifierError::ProcessGone { pid: 99 }
        );
    }

    #[test]
    fn test_exe_link() {
        let (tmp, procfs) = fake_proc(5);
        let image = tmp.path().join("image.bin");
        fs::write(&image, b"\x7fELF").unwrap();
        symlink(&image, tmp.path().join("5/exe")).unwrap();

        assert_eq!(procfs.exe_path(5).unwrap(), image);
        assert!(procfs.open_exe(5).is_ok());
    }

    #[test]
    fn test_classify_errno() {
        let gone = io::Error::from_raw_os_error(Errno::ESRCH as i32);
        assert_eq!(classify(3, &gone), VerifierError::ProcessGone { pid: 3 });

        let denied = io::Error::from_raw_os_error(Errno::EACCES as i32);
        assert_eq!(classify(3, &denied), VerifierError::AccessDenied { pid: 3 });

        let busy = io::Error::from_raw_os_error(Errno::EMFILE as i32);
        assert!(classify(3, &busy).is_transient());
    }

    #[test]
    fn test_system_procfs_reads_self() {
        let pid = std::process::id();
        let procfs = ProcFs::system();
        assert!(procfs.stat(pid).unwrap().start_time > 0);
        assert!(procfs.status(pid).is_ok());
        assert!(procfs.open_exe(pid).is_ok());
    }
}
