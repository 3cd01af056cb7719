//! # Process Locator
//!
//! Finds running targets, picks the layout for each one, and hands out sessions.
//!
//! A process is a candidate when the fingerprint of its executable image matches a known
//! [`LayoutDescriptor`]. Two probe strategies are tried per process, in order:
//!
//! 1. **Direct**: the process image is the target. Fingerprint: md5 of the file.
//! 2. **Wrapped**: the process is a compatibility-layer launcher (wine) running a Windows
//!    image. The image is found from the launcher's working directory and first argument.
//!    Fingerprints: md5 of the image and its PE link timestamp. Reads go through the
//!    launcher's memory file, and the layout is rebased if the image loaded somewhere other
//!    than its recorded base.
//!
//! Only layouts whose OS fits the strategy are compared: the host OS for direct images,
//! Windows for wrapped ones.
//!
//! ## One session at a time
//!
//! A locator owns an attach slot. Attaching claims it, and the session gives it back when it
//! detaches, sees the target exit, or is dropped. A second attach while the slot is taken
//! fails with [`AttachError::AlreadyAttached`] before any OS call is made.
//!
//! ## Example
//!
//! ```rust,no_run
//! use remora_core::Locator;
//!
//! # fn load_layouts() -> Vec<remora_core::LayoutDescriptor> { Vec::new() }
//! let locator = Locator::new(load_layouts());
//! for candidate in locator.find_candidates()? {
//!     println!("{} runs {}", candidate.pid, candidate.version);
//! }
//! # Ok::<(), remora_core::error::RemoraError>(())
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use object::pe::{ImageDosHeader, ImageNtHeaders32, ImageNtHeaders64};
use object::read::pe::ImageNtHeaders;
use object::LittleEndian;
use tracing::{debug, trace};

use crate::config::CoreConfig;
use crate::control::{create_control, ProcessControl};
use crate::error::{AttachError, LayoutMismatch, RemoraResult};
use crate::layout::{Fingerprint, LayoutDescriptor, IMAGE_NAME_KEY};
use crate::session::{AttachSlot, Session};
use crate::types::{Address, ProcessId, TargetOs};

/// How an image was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeStrategy
{
    /// The process image itself.
    Direct,
    /// A Windows image run by a compatibility-layer launcher.
    Wrapped,
}

/// An executable image worth fingerprinting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageProbe
{
    pub pid: ProcessId,
    pub image: PathBuf,
    /// Memory interface to use instead of the platform default.
    pub memory_file: Option<PathBuf>,
    pub strategy: ProbeStrategy,
}

/// Source of processes and their images
///
/// The native probe reads procfs (Linux) or libproc (macOS); tests supply their own.
pub trait ProcessProbe: fmt::Debug
{
    /// Every visible process
    fn pids(&self) -> RemoraResult<Vec<ProcessId>>;

    /// Images to try for `pid`, direct first
    fn images(&self, pid: ProcessId) -> Vec<ImageProbe>;

    /// Load address of a probed image, when it can be determined
    fn image_base(&self, probe: &ImageProbe) -> Option<Address>;
}

/// A process whose image matched a known layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate
{
    pub pid: ProcessId,
    /// Index into [`Locator::layouts`].
    pub layout_index: usize,
    /// Version label of the matched layout.
    pub version: String,
    pub image: PathBuf,
    pub memory_file: Option<PathBuf>,
    pub strategy: ProbeStrategy,
    /// Where the image is loaded, if known.
    pub image_base: Option<Address>,
}

/// Process discovery and session factory
#[derive(Debug)]
pub struct Locator
{
    layouts: Vec<LayoutDescriptor>,
    probe: Box<dyn ProcessProbe>,
    owner: Arc<AtomicU32>,
    config: CoreConfig,
}

impl Locator
{
    /// Locator over the native probe, configured from the environment
    pub fn new(layouts: Vec<LayoutDescriptor>) -> Self
    {
        Self::with_config(layouts, CoreConfig::from_env())
    }

    pub fn with_config(layouts: Vec<LayoutDescriptor>, config: CoreConfig) -> Self
    {
        let probe = native_probe(&config);
        Self::with_probe(layouts, probe, config)
    }

    pub fn with_probe(layouts: Vec<LayoutDescriptor>, probe: Box<dyn ProcessProbe>, config: CoreConfig) -> Self
    {
        Self {
            layouts,
            probe,
            owner: Arc::new(AtomicU32::new(0)),
            config,
        }
    }

    pub fn layouts(&self) -> &[LayoutDescriptor]
    {
        &self.layouts
    }

    pub fn config(&self) -> &CoreConfig
    {
        &self.config
    }

    /// Whether a session from this locator is attached
    pub fn is_attached(&self) -> bool
    {
        self.owner.load(Ordering::Acquire) != 0
    }

    /// Every running process matching a known layout
    ///
    /// A process matching several layouts yields one candidate per layout. Processes whose
    /// images cannot be read are skipped.
    pub fn find_candidates(&self) -> RemoraResult<Vec<Candidate>>
    {
        let mut cache = HashMap::new();
        let mut candidates = Vec::new();
        for pid in self.probe.pids()? {
            candidates.extend(self.match_process(pid, &mut cache).0);
        }
        debug!(found = candidates.len(), "candidate scan finished");
        Ok(candidates)
    }

    /// Candidates for one process
    ///
    /// ## Errors
    ///
    /// [`LayoutMismatch`] when no layout matches.
    pub fn identify(&self, pid: ProcessId) -> RemoraResult<Vec<Candidate>>
    {
        let (candidates, seen) = self.match_process(pid, &mut HashMap::new());
        if candidates.is_empty() {
            let fingerprint = if seen.is_empty() {
                "unreadable image".to_string()
            } else {
                seen.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            };
            return Err(LayoutMismatch { pid, fingerprint }.into());
        }
        Ok(candidates)
    }

    /// Attach to a candidate with the native backend
    pub fn attach(&self, candidate: &Candidate) -> RemoraResult<Session>
    {
        let slot = AttachSlot::claim(&self.owner, candidate.pid)?;
        let layout = self.layout_for(candidate)?;
        let control = create_control(candidate.pid, candidate.memory_file.as_deref())?;
        Ok(Session::establish(control, layout, slot, self.config.max_string_len)?)
    }

    /// Identify `pid` and attach with its first matching layout
    pub fn attach_pid(&self, pid: ProcessId) -> RemoraResult<Session>
    {
        let candidates = self.identify(pid)?;
        match candidates.first() {
            Some(candidate) => self.attach(candidate),
            None => Err(LayoutMismatch {
                pid,
                fingerprint: "none".to_string(),
            }
            .into()),
        }
    }

    /// Attach through a caller-supplied control with an explicit layout
    ///
    /// Still subject to the one-session rule.
    pub fn attach_with(&self, control: Box<dyn ProcessControl>, layout: LayoutDescriptor) -> Result<Session, AttachError>
    {
        let slot = AttachSlot::claim(&self.owner, control.pid())?;
        Session::establish(control, layout, slot, self.config.max_string_len)
    }

    fn layout_for(&self, candidate: &Candidate) -> Result<LayoutDescriptor, AttachError>
    {
        let mut layout = self
            .layouts
            .get(candidate.layout_index)
            .cloned()
            .ok_or_else(|| AttachError::Platform {
                pid: candidate.pid,
                reason: format!("candidate refers to unknown layout {}", candidate.layout_index),
            })?;
        if let Some(base) = candidate.image_base {
            if base != layout.base() {
                debug!(pid = %candidate.pid, from = %layout.base(), to = %base, "image relocated, rebasing layout");
                layout.rebase_all(base);
            }
        }
        Ok(layout)
    }

    /// Candidates for `pid` plus every fingerprint computed along the way
    fn match_process(
        &self,
        pid: ProcessId,
        cache: &mut HashMap<PathBuf, Vec<Fingerprint>>,
    ) -> (Vec<Candidate>, Vec<Fingerprint>)
    {
        let mut seen = Vec::new();
        for probe in self.probe.images(pid) {
            let eligible: Vec<usize> = (0..self.layouts.len())
                .filter(|&i| layout_accepts(&self.layouts[i], &probe))
                .collect();
            if eligible.is_empty() {
                continue;
            }

            let prints = match cache.get(&probe.image) {
                Some(prints) => prints.clone(),
                None => match fingerprint_image(&probe.image, probe.strategy) {
                    Ok(prints) => {
                        cache.insert(probe.image.clone(), prints.clone());
                        prints
                    }
                    Err(err) => {
                        trace!(%pid, image = %probe.image.display(), %err, "cannot fingerprint image");
                        continue;
                    }
                },
            };

            let matched: Vec<usize> = eligible
                .into_iter()
                .filter(|&i| prints.iter().any(|print| self.layouts[i].matches(print)))
                .collect();
            seen.extend(prints);
            if matched.is_empty() {
                continue;
            }

            let image_base = match probe.strategy {
                ProbeStrategy::Direct => None,
                ProbeStrategy::Wrapped => self.probe.image_base(&probe),
            };
            let candidates = matched
                .into_iter()
                .map(|i| Candidate {
                    pid,
                    layout_index: i,
                    version: self.layouts[i].version().to_string(),
                    image: probe.image.clone(),
                    memory_file: probe.memory_file.clone(),
                    strategy: probe.strategy,
                    image_base,
                })
                .collect::<Vec<_>>();
            debug!(%pid, strategy = ?probe.strategy, matches = candidates.len(), "process identified");
            return (candidates, seen);
        }
        (Vec::new(), seen)
    }
}

/// OS and image-name filter applied before hashing
fn layout_accepts(layout: &LayoutDescriptor, probe: &ImageProbe) -> bool
{
    let os_fits = match probe.strategy {
        ProbeStrategy::Direct => TargetOs::host() == Some(layout.os()),
        ProbeStrategy::Wrapped => layout.os() == TargetOs::Windows,
    };
    if !os_fits {
        return false;
    }
    match layout.try_get_string(IMAGE_NAME_KEY) {
        Some(expected) => probe
            .image
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.eq_ignore_ascii_case(&expected)),
        None => true,
    }
}

/// Fingerprints of the image at `path`
///
/// Always the md5; wrapped images also yield their PE timestamp when the file parses as PE.
pub fn fingerprint_image(path: &Path, strategy: ProbeStrategy) -> io::Result<Vec<Fingerprint>>
{
    let data = fs::read(path)?;
    let mut prints = vec![Fingerprint::Md5(format!("{:x}", md5::compute(&data)))];
    if strategy == ProbeStrategy::Wrapped {
        if let Some(stamp) = pe_timestamp(&data) {
            prints.push(Fingerprint::PeTimestamp(stamp));
        }
    }
    Ok(prints)
}

/// `TimeDateStamp` from the COFF file header of a PE image
pub fn pe_timestamp(data: &[u8]) -> Option<u32>
{
    let dos = ImageDosHeader::parse(data).ok()?;
    let nt_offset = u64::from(dos.nt_headers_offset());

    let mut offset = nt_offset;
    if let Ok((nt, _)) = ImageNtHeaders32::parse(data, &mut offset) {
        return Some(nt.file_header().time_date_stamp.get(LittleEndian));
    }
    let mut offset = nt_offset;
    ImageNtHeaders64::parse(data, &mut offset)
        .ok()
        .map(|(nt, _)| nt.file_header().time_date_stamp.get(LittleEndian))
}

/// Path of the image a launcher was started with
///
/// `Z:` is the compatibility layer's mapping of the host root; other drive letters cannot be
/// resolved without the layer's prefix and yield `None`. Relative paths are taken against
/// the launcher's working directory.
pub fn wrapped_image_path(arg: &str, cwd: &Path) -> Option<PathBuf>
{
    let bytes = arg.as_bytes();
    let has_drive = bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && matches!(bytes[2], b'\\' | b'/');
    if has_drive {
        if !bytes[0].eq_ignore_ascii_case(&b'z') {
            return None;
        }
        return Some(PathBuf::from(arg[2..].replace('\\', "/")));
    }

    let unix = arg.replace('\\', "/");
    let path = Path::new(&unix);
    if path.is_absolute() {
        Some(path.to_path_buf())
    } else {
        Some(cwd.join(path.strip_prefix("./").unwrap_or(path)))
    }
}

#[cfg(target_os = "linux")]
fn native_probe(config: &CoreConfig) -> Box<dyn ProcessProbe>
{
    Box::new(ProcFsProbe::new(config.proc_root.clone()))
}

#[cfg(target_os = "macos")]
fn native_probe(_config: &CoreConfig) -> Box<dyn ProcessProbe>
{
    Box::new(LibprocProbe)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn native_probe(_config: &CoreConfig) -> Box<dyn ProcessProbe>
{
    Box::new(NoProbe)
}

/// Probe over a procfs tree
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct ProcFsProbe
{
    proc: crate::platform::linux::ProcFs,
}

#[cfg(target_os = "linux")]
impl ProcFsProbe
{
    pub fn new(root: impl Into<PathBuf>) -> Self
    {
        Self {
            proc: crate::platform::linux::ProcFs::new(root),
        }
    }

    /// Wrapped image behind a launcher, found through `cwd` and the first argument
    fn wrapped(&self, pid: ProcessId) -> Option<ImageProbe>
    {
        let cwd = self.proc.cwd(pid).ok()?;
        let args = self.proc.cmdline(pid).ok()?;
        let image = args
            .iter()
            .find(|arg| arg.to_ascii_lowercase().ends_with(".exe"))
            .or_else(|| args.first())
            .and_then(|arg| wrapped_image_path(arg, &cwd))?;
        Some(ImageProbe {
            pid,
            image,
            memory_file: Some(self.proc.mem_path(pid)),
            strategy: ProbeStrategy::Wrapped,
        })
    }
}

#[cfg(target_os = "linux")]
impl ProcessProbe for ProcFsProbe
{
    fn pids(&self) -> RemoraResult<Vec<ProcessId>>
    {
        Ok(self.proc.pids()?)
    }

    fn images(&self, pid: ProcessId) -> Vec<ImageProbe>
    {
        let Ok(exe) = self.proc.exe(pid) else {
            return Vec::new();
        };
        let launcher = exe
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains("wine"));

        let mut probes = vec![ImageProbe {
            pid,
            image: exe,
            memory_file: None,
            strategy: ProbeStrategy::Direct,
        }];
        if launcher {
            probes.extend(self.wrapped(pid));
        }
        probes
    }

    /// Start of the first mapping backed by the image file
    fn image_base(&self, probe: &ImageProbe) -> Option<Address>
    {
        let file_name = probe.image.file_name()?.to_str()?.to_ascii_lowercase();
        self.proc
            .maps(probe.pid)
            .ok()?
            .into_iter()
            .filter(|range| {
                range
                    .name
                    .as_deref()
                    .is_some_and(|name| name.replace('\\', "/").to_ascii_lowercase().ends_with(&file_name))
            })
            .map(|range| range.start)
            .min()
    }
}

/// Probe over libproc
#[cfg(target_os = "macos")]
#[derive(Debug, Clone, Copy)]
pub struct LibprocProbe;

#[cfg(target_os = "macos")]
impl ProcessProbe for LibprocProbe
{
    fn pids(&self) -> RemoraResult<Vec<ProcessId>>
    {
        let pids = libproc::processes::pids_by_type(libproc::processes::ProcFilter::All)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        Ok(pids.into_iter().filter(|&pid| pid != 0).map(ProcessId::from).collect())
    }

    fn images(&self, pid: ProcessId) -> Vec<ImageProbe>
    {
        match libproc::proc_pid::pidpath(pid.raw() as i32) {
            Ok(path) => vec![ImageProbe {
                pid,
                image: PathBuf::from(path),
                memory_file: None,
                strategy: ProbeStrategy::Direct,
            }],
            Err(_) => Vec::new(),
        }
    }

    fn image_base(&self, _probe: &ImageProbe) -> Option<Address>
    {
        None
    }
}

/// Probe for hosts without a process backend
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
#[derive(Debug, Clone, Copy)]
pub struct NoProbe;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
impl ProcessProbe for NoProbe
{
    fn pids(&self) -> RemoraResult<Vec<ProcessId>>
    {
        Ok(Vec::new())
    }

    fn images(&self, _pid: ProcessId) -> Vec<ImageProbe>
    {
        Vec::new()
    }

    fn image_base(&self, _probe: &ImageProbe) -> Option<Address>
    {
        None
    }
}
