//! # procfs Access
//!
//! Small readers over `/proc/<pid>/*`, rooted at a configurable mount point so the locator
//! can be tested against a fake tree.
//!
//! ## References
//!
//! - [proc(5) man page](https://man7.org/linux/man-pages/man5/proc.5.html)

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::{MemoryRange, ProcessId, ThreadId};

/// A procfs mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcFs
{
    root: PathBuf,
}

impl Default for ProcFs
{
    fn default() -> Self
    {
        Self::new("/proc")
    }
}

impl ProcFs
{
    pub fn new(root: impl Into<PathBuf>) -> Self
    {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path
    {
        &self.root
    }

    pub fn pid_dir(&self, pid: ProcessId) -> PathBuf
    {
        self.root.join(pid.raw().to_string())
    }

    /// Memory interface of `pid`
    pub fn mem_path(&self, pid: ProcessId) -> PathBuf
    {
        self.pid_dir(pid).join("mem")
    }

    /// Every numeric entry under the root, ascending
    pub fn pids(&self) -> io::Result<Vec<ProcessId>>
    {
        let mut pids: Vec<ProcessId> = fs::read_dir(&self.root)?
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .map(ProcessId::from)
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    /// Target of the `exe` link
    pub fn exe(&self, pid: ProcessId) -> io::Result<PathBuf>
    {
        fs::read_link(self.pid_dir(pid).join("exe"))
    }

    /// Target of the `cwd` link
    pub fn cwd(&self, pid: ProcessId) -> io::Result<PathBuf>
    {
        fs::read_link(self.pid_dir(pid).join("cwd"))
    }

    /// Argument vector, split on NUL
    pub fn cmdline(&self, pid: ProcessId) -> io::Result<Vec<String>>
    {
        let raw = fs::read(self.pid_dir(pid).join("cmdline"))?;
        Ok(raw
            .split(|&b| b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect())
    }

    /// Parsed `maps`; unparseable lines are skipped
    pub fn maps(&self, pid: ProcessId) -> io::Result<Vec<MemoryRange>>
    {
        let text = fs::read_to_string(self.pid_dir(pid).join("maps"))?;
        Ok(text.lines().filter_map(MemoryRange::parse_maps_line).collect())
    }

    /// Thread ids from the `task` directory
    pub fn threads(&self, pid: ProcessId) -> io::Result<Vec<ThreadId>>
    {
        let mut tids: Vec<ThreadId> = fs::read_dir(self.pid_dir(pid).join("task"))?
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u64>().ok())
            .map(ThreadId::from)
            .collect();
        tids.sort_unstable_by_key(|tid| tid.raw());
        Ok(tids)
    }

    /// Scheduler state letter from `stat` (`R`, `S`, `T`, `t`, `Z`, ...)
    pub fn state(&self, pid: ProcessId) -> io::Result<char>
    {
        let stat = fs::read_to_string(self.pid_dir(pid).join("stat"))?;
        parse_stat_state(&stat).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed stat line"))
    }

    /// Exists and is neither a zombie nor dead
    pub fn is_alive(&self, pid: ProcessId) -> bool
    {
        matches!(self.state(pid), Ok(state) if state != 'Z' && state != 'X')
    }
}

/// The comm field may itself contain `)`, so the state follows the last one
fn parse_stat_state(stat: &str) -> Option<char>
{
    let after = &stat[stat.rfind(')')? + 1..];
    after.trim_start().chars().next()
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_stat_state()
    {
        assert_eq!(parse_stat_state("1234 (Dwarf Fortress) S 1 1234 ..."), Some('S'));
        assert_eq!(parse_stat_state("77 (a) b) Z 1 ..."), Some('Z'));
        assert_eq!(parse_stat_state("garbage"), None);
    }

    #[test]
    fn test_fake_tree()
    {
        let dir = tempfile::tempdir().unwrap();
        let proc = ProcFs::new(dir.path());
        let pid_dir = dir.path().join("314");
        fs::create_dir_all(pid_dir.join("task/314")).unwrap();
        fs::create_dir_all(pid_dir.join("task/316")).unwrap();
        fs::create_dir_all(dir.path().join("self")).unwrap();
        fs::write(pid_dir.join("stat"), "314 (df) T 1 314").unwrap();
        fs::write(pid_dir.join("cmdline"), b"wine\0Z:\\games\\df\\df.exe\0").unwrap();
        fs::write(pid_dir.join("maps"), "00400000-00401000 r-xp 00000000 08:01 42 /games/df/df.exe\nbogus\n").unwrap();

        let pid = ProcessId::from(314);
        assert_eq!(proc.pids().unwrap(), vec![pid]);
        assert_eq!(proc.threads(pid).unwrap(), vec![ThreadId::from(314), ThreadId::from(316)]);
        assert_eq!(proc.cmdline(pid).unwrap(), vec!["wine".to_string(), "Z:\\games\\df\\df.exe".to_string()]);
        assert_eq!(proc.maps(pid).unwrap().len(), 1);
        assert!(proc.is_alive(pid));
        assert!(!proc.is_alive(ProcessId::from(999)));
    }
}
