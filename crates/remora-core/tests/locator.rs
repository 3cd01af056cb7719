//! Tests for process discovery against a fake procfs tree
#![cfg(target_os = "linux")]

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use remora_core::error::RemoraError;
use remora_core::layout::{LayoutBuilder, LayoutDescriptor};
use remora_core::locator::{fingerprint_image, pe_timestamp, ProbeStrategy, ProcFsProbe};
use remora_core::types::{Address, ProcessId, TargetOs, WordSize};
use remora_core::{CoreConfig, Locator};

const LINK_STAMP: u32 = 0x5f1e_2a3b;

/// Smallest file the PE parser accepts: DOS header, NT headers, empty data directories
fn minimal_pe(stamp: u32) -> Vec<u8>
{
    let mut data = vec![0u8; 0x200];
    data[0..2].copy_from_slice(b"MZ");
    data[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());
    data[0x40..0x44].copy_from_slice(b"PE\0\0");
    data[0x44..0x46].copy_from_slice(&0x014cu16.to_le_bytes());
    data[0x48..0x4c].copy_from_slice(&stamp.to_le_bytes());
    data[0x54..0x56].copy_from_slice(&0x00e0u16.to_le_bytes());
    data[0x58..0x5a].copy_from_slice(&0x010bu16.to_le_bytes());
    data[0xb4..0xb8].copy_from_slice(&16u32.to_le_bytes());
    data
}

fn md5_hex(data: &[u8]) -> String
{
    format!("{:x}", md5::compute(data))
}

struct FakeHost
{
    _dir: tempfile::TempDir,
    proc: PathBuf,
    native: Vec<u8>,
    windows: Vec<u8>,
    windows_image: PathBuf,
}

impl FakeHost
{
    /// pid 100 runs the native image, pid 200 runs the Windows image under a launcher,
    /// pid 300 runs something unknown
    fn new() -> Self
    {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let proc = root.join("proc");
        let bin = root.join("bin");
        let game = root.join("game");
        for path in [&proc, &bin, &game] {
            fs::create_dir_all(path).unwrap();
        }
        fs::create_dir_all(proc.join("self")).unwrap();

        let native = b"\x7fELF native build of the target".to_vec();
        fs::write(bin.join("fortress"), &native).unwrap();
        fs::write(bin.join("wine-preloader"), b"launcher").unwrap();
        fs::write(bin.join("editor"), b"something else entirely").unwrap();
        let windows = minimal_pe(LINK_STAMP);
        let windows_image = game.join("df.exe");
        fs::write(&windows_image, &windows).unwrap();

        let pid_dir = |pid: u32| {
            let path = proc.join(pid.to_string());
            fs::create_dir_all(&path).unwrap();
            path
        };

        symlink(bin.join("fortress"), pid_dir(100).join("exe")).unwrap();

        let launcher = pid_dir(200);
        symlink(bin.join("wine-preloader"), launcher.join("exe")).unwrap();
        symlink(&game, launcher.join("cwd")).unwrap();
        fs::write(launcher.join("cmdline"), b"wine\0df.exe\0-nosound\0").unwrap();
        fs::write(
            launcher.join("maps"),
            format!(
                "00010000-00020000 rw-p 00000000 00:00 0 \n\
                 00500000-00501000 r--p 00000000 08:01 77 {image}\n\
                 00501000-00600000 r-xp 00001000 08:01 77 {image}\n",
                image = windows_image.display()
            ),
        )
        .unwrap();

        symlink(bin.join("editor"), pid_dir(300).join("exe")).unwrap();

        Self {
            _dir: dir,
            proc,
            native,
            windows,
            windows_image,
        }
    }

    fn locator(&self, layouts: Vec<LayoutDescriptor>) -> Locator
    {
        Locator::with_probe(layouts, Box::new(ProcFsProbe::new(&self.proc)), CoreConfig::default())
    }

    fn native_layout(&self) -> LayoutDescriptor
    {
        LayoutBuilder::new("v0.47.05 linux", TargetOs::Linux, WordSize::Eight)
            .with_md5(&md5_hex(&self.native))
            .build()
    }

    fn stamped_layout(&self) -> LayoutDescriptor
    {
        LayoutBuilder::new("v0.47.05 win32", TargetOs::Windows, WordSize::Four)
            .with_base(Address::new(0x0040_0000))
            .with_address("world", Address::new(0x0041_0000))
            .with_pe_timestamp(LINK_STAMP)
            .build()
    }

    fn hashed_layout(&self) -> LayoutDescriptor
    {
        LayoutBuilder::new("v0.47.05 win32 SDL", TargetOs::Windows, WordSize::Four)
            .with_md5(&md5_hex(&self.windows))
            .with_image_name("DF.EXE")
            .build()
    }
}

#[test]
fn test_fingerprints_of_images()
{
    let host = FakeHost::new();
    assert_eq!(pe_timestamp(&host.windows), Some(LINK_STAMP));

    let direct = fingerprint_image(&host.windows_image, ProbeStrategy::Direct).unwrap();
    assert_eq!(direct.len(), 1);

    let wrapped = fingerprint_image(&host.windows_image, ProbeStrategy::Wrapped).unwrap();
    assert_eq!(wrapped.len(), 2);
    assert!(fingerprint_image(Path::new("/nonexistent/image"), ProbeStrategy::Direct).is_err());
}

#[test]
fn test_direct_image_is_found()
{
    let host = FakeHost::new();
    let locator = host.locator(vec![host.native_layout()]);

    let candidates = locator.find_candidates().unwrap();
    assert_eq!(candidates.len(), 1);
    let candidate = &candidates[0];
    assert_eq!(candidate.pid, ProcessId::from(100));
    assert_eq!(candidate.layout_index, 0);
    assert_eq!(candidate.version, "v0.47.05 linux");
    assert_eq!(candidate.strategy, ProbeStrategy::Direct);
    assert_eq!(candidate.memory_file, None);
    assert_eq!(candidate.image_base, None);
}

#[test]
fn test_wrapped_image_is_found()
{
    let host = FakeHost::new();
    let locator = host.locator(vec![host.native_layout(), host.stamped_layout(), host.hashed_layout()]);

    let candidates = locator.identify(ProcessId::from(200)).unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].layout_index, 1);
    assert_eq!(candidates[1].layout_index, 2);
    for candidate in &candidates {
        assert_eq!(candidate.strategy, ProbeStrategy::Wrapped);
        assert_eq!(candidate.image, host.windows_image);
        assert_eq!(candidate.memory_file, Some(host.proc.join("200").join("mem")));
        assert_eq!(candidate.image_base, Some(Address::new(0x0050_0000)));
    }

    let all = locator.find_candidates().unwrap();
    let pids: Vec<u32> = all.iter().map(|c| c.pid.raw()).collect();
    assert_eq!(pids, vec![100, 200, 200]);
}

#[test]
fn test_rebased_layout_follows_image_base()
{
    let host = FakeHost::new();
    let locator = host.locator(vec![host.stamped_layout()]);
    let candidate = locator.identify(ProcessId::from(200)).unwrap().remove(0);

    let mut layout = locator.layouts()[candidate.layout_index].clone();
    layout.rebase_all(candidate.image_base.unwrap());
    assert_eq!(layout.base(), Address::new(0x0050_0000));
    assert_eq!(layout.get_address("world").unwrap(), Address::new(0x0051_0000));
}

#[test]
fn test_os_mismatch_is_not_compared()
{
    let host = FakeHost::new();
    let windows_by_native_hash = LayoutBuilder::new("odd", TargetOs::Windows, WordSize::Four)
        .with_md5(&md5_hex(&host.native))
        .build();
    let locator = host.locator(vec![windows_by_native_hash]);

    assert!(locator.find_candidates().unwrap().is_empty());
}

#[test]
fn test_unknown_image_is_a_mismatch()
{
    let host = FakeHost::new();
    let locator = host.locator(vec![host.native_layout()]);

    let err = locator.identify(ProcessId::from(300)).unwrap_err();
    match err {
        RemoraError::Mismatch(mismatch) => {
            assert_eq!(mismatch.pid, ProcessId::from(300));
            assert!(mismatch.fingerprint.contains(&md5_hex(b"something else entirely")));
        }
        other => panic!("expected a mismatch, got {other:?}"),
    }

    let missing = locator.identify(ProcessId::from(999)).unwrap_err();
    assert!(matches!(missing, RemoraError::Mismatch(ref m) if m.fingerprint == "unreadable image"));
    assert!(!locator.is_attached());
}
