//! Tests for session lifecycle and memory access against the in-memory target

use remora_core::error::{AccessError, AttachError, MissingReason, RemoraError};
use remora_core::layout::{LayoutBuilder, LayoutDescriptor};
use remora_core::mock::MockProcess;
use remora_core::types::{Address, AttachState, TargetOs, WordSize};
use remora_core::{Locator, MemoryRead, MemoryWrite};

fn layout() -> LayoutDescriptor
{
    LayoutBuilder::new("test", TargetOs::Linux, WordSize::Four)
        .with_address("tile_count", Address::new(0x1000))
        .build()
}

fn target() -> MockProcess
{
    MockProcess::builder().map(0x1000, 0x100).build()
}

#[test]
fn test_tile_count_scenario()
{
    let mock = target();
    mock.store(Address::new(0x1000), &42u32.to_le_bytes()).unwrap();

    let locator = Locator::new(vec![layout()]);
    let session = locator.attach_with(Box::new(mock), layout()).unwrap();

    let addr = session.layout().get_address("tile_count").unwrap();
    assert_eq!(addr, Address::new(0x1000));
    assert_eq!(session.read_u32(addr).unwrap(), 42);

    let missing = session.layout().get_address("nonexistent").unwrap_err();
    assert_eq!(missing.reason, MissingReason::Absent);
}

#[test]
fn test_second_attach_fails_until_detach()
{
    let locator = Locator::new(vec![layout()]);
    let mut first = locator.attach_with(Box::new(target()), layout()).unwrap();
    assert!(locator.is_attached());

    let second = MockProcess::builder().pid(7).map(0x1000, 0x10).build();
    let err = locator.attach_with(Box::new(second.clone()), layout()).unwrap_err();
    assert!(matches!(err, AttachError::AlreadyAttached(pid) if pid == first.pid()));
    // Rejected before the OS was touched.
    assert_eq!(second.attach_calls(), 0);

    assert!(first.detach().unwrap());
    assert!(!locator.is_attached());

    let again = locator.attach_with(Box::new(second), layout()).unwrap();
    assert!(again.is_attached());
}

#[test]
fn test_dropping_a_session_frees_the_slot()
{
    let locator = Locator::new(vec![layout()]);
    let mock = target();
    {
        let _session = locator.attach_with(Box::new(mock.clone()), layout()).unwrap();
        assert!(mock.is_stopped());
    }
    assert!(!locator.is_attached());
    assert!(!mock.is_attached());
    assert!(!mock.is_stopped());
}

#[test]
fn test_refused_attach_leaves_slot_free()
{
    let locator = Locator::new(vec![layout()]);
    let denied = MockProcess::builder().deny_attach().build();
    let err = locator.attach_with(Box::new(denied), layout()).unwrap_err();
    assert!(matches!(err, AttachError::PermissionDenied { .. }));
    assert!(!locator.is_attached());
}

#[test]
fn test_detach_is_idempotent()
{
    let locator = Locator::new(vec![layout()]);
    let mock = target();
    let mut session = locator.attach_with(Box::new(mock.clone()), layout()).unwrap();
    assert!(session.is_suspended());

    assert!(session.detach().unwrap());
    assert!(!session.detach().unwrap());
    assert_eq!(session.state(), AttachState::Detached);
    assert!(!mock.is_attached());
    assert!(!mock.is_stopped());
}

#[test]
fn test_access_after_detach_is_rejected()
{
    let locator = Locator::new(vec![layout()]);
    let mut session = locator.attach_with(Box::new(target()), layout()).unwrap();
    session.detach().unwrap();

    assert_eq!(session.read_u32(Address::new(0x1000)), Err(AccessError::NotAttached));
    assert_eq!(session.write_u8(Address::new(0x1000), 1), Err(AccessError::NotAttached));
    assert!(session.suspend().is_err());
}

#[test]
fn test_target_exit_detaches_implicitly()
{
    let locator = Locator::new(vec![layout()]);
    let mock = target();
    let mut session = locator.attach_with(Box::new(mock.clone()), layout()).unwrap();

    mock.kill();
    assert_eq!(session.read_u32(Address::new(0x1000)), Err(AccessError::TargetExited));
    assert!(!session.is_attached());
    assert!(!locator.is_attached());

    // Already detached: reported, not an error.
    assert!(!session.detach().unwrap());

    let fresh = locator.attach_with(Box::new(target()), layout()).unwrap();
    assert!(fresh.is_attached());
}

#[test]
fn test_exit_during_resume_is_target_exit()
{
    let locator = Locator::new(vec![layout()]);
    let mock = target();
    let mut session = locator.attach_with(Box::new(mock.clone()), layout()).unwrap();

    mock.kill();
    let err = session.resume().unwrap_err();
    assert!(err.is_target_exit());
    assert!(!session.is_attached());
}

#[test]
fn test_async_suspend_completes_through_polling()
{
    let locator = Locator::new(vec![layout()]);
    let mock = MockProcess::builder().map(0x1000, 0x10).stop_latency(2).build();
    let mut session = locator.attach_with(Box::new(mock.clone()), layout()).unwrap();

    session.resume().unwrap();
    assert_eq!(session.state(), AttachState::Attached);
    assert!(!mock.is_stopped());

    session.async_suspend().unwrap();
    assert!(!session.is_suspended());
    assert!(!session.poll_suspended().unwrap());
    assert!(!session.poll_suspended().unwrap());
    assert!(session.poll_suspended().unwrap());
    assert!(session.is_suspended());
    assert!(mock.is_stopped());
}

#[test]
fn test_blocking_suspend_after_async_request_sends_one_stop()
{
    let locator = Locator::new(vec![layout()]);
    let mock = MockProcess::builder().map(0x1000, 0x10).stop_latency(2).build();
    let mut session = locator.attach_with(Box::new(mock.clone()), layout()).unwrap();
    session.resume().unwrap();

    session.async_suspend().unwrap();
    session.async_suspend().unwrap();
    session.suspend().unwrap();
    assert!(session.is_suspended());
    assert!(mock.is_stopped());

    // A second stop signal would still be queued and freeze the target here.
    session.resume().unwrap();
    assert_eq!(mock.stop_signals(), 1);
    assert_eq!(session.state(), AttachState::Attached);
    assert!(!mock.is_stopped());
}

#[test]
fn test_suspend_and_resume_are_idempotent()
{
    let locator = Locator::new(vec![layout()]);
    let mock = target();
    let mut session = locator.attach_with(Box::new(mock.clone()), layout()).unwrap();

    session.suspend().unwrap();
    session.suspend().unwrap();
    assert!(session.is_suspended());

    session.resume().unwrap();
    session.resume().unwrap();
    assert!(!session.is_suspended());
    assert!(!mock.is_stopped());
}

#[test]
fn test_force_resume_ignores_believed_state()
{
    let locator = Locator::new(vec![layout()]);
    let mock = target();
    let mut session = locator.attach_with(Box::new(mock.clone()), layout()).unwrap();

    session.resume().unwrap();
    session.force_resume().unwrap();
    assert_eq!(mock.force_resumes(), 1);
    assert_eq!(session.state(), AttachState::Attached);
    assert!(!mock.is_stopped());
}

#[test]
fn test_round_trip_through_word_pokes()
{
    for width in [WordSize::Four, WordSize::Eight] {
        let locator = Locator::new(vec![layout()]);
        let mock = MockProcess::builder().map(0x1000, 0x40).poke_writes(width).build();
        mock.fill(Address::new(0x1000), 0x40, 0xee).unwrap();
        let session = locator.attach_with(Box::new(mock.clone()), layout()).unwrap();

        session.write_u32(Address::new(0x1006), 0x1122_3344).unwrap();
        assert_eq!(session.read_u32(Address::new(0x1006)).unwrap(), 0x1122_3344);
        assert_eq!(session.read_u8(Address::new(0x1005)).unwrap(), 0xee);
        assert_eq!(session.read_u8(Address::new(0x100a)).unwrap(), 0xee);

        session.write_u64(Address::new(0x1010), u64::MAX - 1).unwrap();
        assert_eq!(session.read_u64(Address::new(0x1010)).unwrap(), u64::MAX - 1);

        let log = mock.poke_log();
        assert!(!log.is_empty());
        assert!(log.windows(2).all(|pair| pair[0] < pair[1]));
    }
}

#[test]
fn test_round_trip_pointer_widths()
{
    for word in [WordSize::Four, WordSize::Eight] {
        let locator = Locator::new(vec![layout()]);
        let layout = LayoutBuilder::new("test", TargetOs::Linux, word).build();
        let session = locator.attach_with(Box::new(target()), layout).unwrap();

        session.write_word(Address::new(0x1020), word, 0x1040).unwrap();
        assert_eq!(session.read_ptr(Address::new(0x1020)).unwrap(), Address::new(0x1040));
    }
}

#[test]
fn test_hexdump_and_ranges()
{
    let locator = Locator::new(vec![layout()]);
    let mock = target();
    mock.store(Address::new(0x1000), b"remora").unwrap();
    let session = locator.attach_with(Box::new(mock), layout()).unwrap();

    let dump = session.hexdump(Address::new(0x1000), 16).unwrap();
    assert!(dump.contains("remora"));

    let ranges = session.memory_ranges().unwrap();
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].start, Address::new(0x1000));
    assert_eq!(session.thread_ids().unwrap().len(), 1);
}

#[test]
fn test_errors_convert_into_umbrella()
{
    let locator = Locator::new(vec![layout()]);
    let session = locator.attach_with(Box::new(target()), layout()).unwrap();

    let err: RemoraError = session.read_u32(Address::new(0x9000)).unwrap_err().into();
    assert!(matches!(err, RemoraError::Access(AccessError::Denied { .. })));
    assert!(!err.is_target_exit());
}
