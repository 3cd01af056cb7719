//! Tests for foreign string and array decoding in both container ABIs

use remora_core::abi::{self, ContainerAbi, StringAbi};
use remora_core::error::AccessError;
use remora_core::layout::LayoutBuilder;
use remora_core::mock::MockProcess;
use remora_core::types::{Address, TargetOs, WordSize};
use remora_core::MemoryRead;

const SENTINEL: u8 = 0xaa;

fn abi_for(os: TargetOs) -> ContainerAbi
{
    ContainerAbi::for_layout(&LayoutBuilder::new("test", os, WordSize::Four).build())
}

/// Inline-ABI string header at `header`, long strings stored at `heap`
fn store_inline(mock: &MockProcess, header: u64, heap: u64, text: &[u8])
{
    let len = text.len() as u32;
    if text.len() < 16 {
        mock.store(Address::new(header + 4), text).unwrap();
        mock.store(Address::new(header + 20), &len.to_le_bytes()).unwrap();
        mock.store(Address::new(header + 24), &15u32.to_le_bytes()).unwrap();
    } else {
        mock.store(Address::new(heap), text).unwrap();
        mock.store(Address::new(header + 4), &(heap as u32).to_le_bytes()).unwrap();
        mock.store(Address::new(header + 20), &len.to_le_bytes()).unwrap();
        mock.store(Address::new(header + 24), &len.to_le_bytes()).unwrap();
    }
}

/// Out-of-line string: header points at characters preceded by `{ length, capacity, refcount }`
fn store_out_of_line(mock: &MockProcess, header: u64, record: u64, text: &[u8])
{
    let data = record + 12;
    let len = text.len() as u32;
    mock.store(Address::new(record), &len.to_le_bytes()).unwrap();
    mock.store(Address::new(record + 4), &len.to_le_bytes()).unwrap();
    mock.store(Address::new(data), text).unwrap();
    mock.store(Address::new(header), &(data as u32).to_le_bytes()).unwrap();
}

fn check_bounded(mock: &MockProcess, abi: &ContainerAbi, header: u64, text: &[u8])
{
    for cap in [1usize, 4, 8, 64] {
        let mut buf = [SENTINEL; 80];
        let copied = abi::read_foreign_string_into(mock, abi, Address::new(header), &mut buf[..cap]).unwrap();

        let expected = text.len().min(cap - 1);
        assert_eq!(copied, expected, "cap {cap}");
        assert_eq!(&buf[..copied], &text[..copied]);
        assert_eq!(buf[copied], 0);
        assert!(buf[cap..].iter().all(|b| *b == SENTINEL), "wrote past cap {cap}");
    }
}

#[test]
fn test_inline_strings_short_and_long()
{
    let mock = MockProcess::builder().map(0x1000, 0x200).build();
    let abi = abi_for(TargetOs::Windows);
    assert!(matches!(abi.string, StringAbi::Inline { .. }));

    store_inline(&mock, 0x1000, 0x1100, b"dwarf");
    store_inline(&mock, 0x1040, 0x1100, b"a rather long creature name");

    assert_eq!(abi::read_foreign_string(&mock, &abi, Address::new(0x1000)).unwrap(), "dwarf");
    assert_eq!(
        abi::read_foreign_string(&mock, &abi, Address::new(0x1040)).unwrap(),
        "a rather long creature name"
    );
    check_bounded(&mock, &abi, 0x1000, b"dwarf");
    check_bounded(&mock, &abi, 0x1040, b"a rather long creature name");
}

#[test]
fn test_out_of_line_strings_short_and_long()
{
    let mock = MockProcess::builder().map(0x1000, 0x200).build();
    let abi = abi_for(TargetOs::Linux);
    assert!(matches!(abi.string, StringAbi::OutOfLine { .. }));

    store_out_of_line(&mock, 0x1000, 0x1020, b"elf");
    store_out_of_line(&mock, 0x1004, 0x1080, b"the forgotten beast of rust");

    assert_eq!(abi::read_foreign_string(&mock, &abi, Address::new(0x1000)).unwrap(), "elf");
    check_bounded(&mock, &abi, 0x1000, b"elf");
    check_bounded(&mock, &abi, 0x1004, b"the forgotten beast of rust");
}

#[test]
fn test_empty_buffer_receives_nothing()
{
    let mock = MockProcess::builder().map(0x1000, 0x100).build();
    let abi = abi_for(TargetOs::Linux);
    store_out_of_line(&mock, 0x1000, 0x1020, b"elf");
    assert_eq!(abi::read_foreign_string_into(&mock, &abi, Address::new(0x1000), &mut []).unwrap(), 0);
}

#[test]
fn test_implausible_string_headers()
{
    let mock = MockProcess::builder().map(0x1000, 0x100).build();

    // Inline: length above capacity.
    let windows = abi_for(TargetOs::Windows);
    mock.store(Address::new(0x1014), &40u32.to_le_bytes()).unwrap();
    mock.store(Address::new(0x1018), &15u32.to_le_bytes()).unwrap();
    assert!(matches!(
        abi::read_foreign_string(&mock, &windows, Address::new(0x1000)),
        Err(AccessError::Implausible { .. })
    ));

    // Out-of-line: null character pointer.
    let linux = abi_for(TargetOs::Linux);
    assert!(matches!(
        abi::read_foreign_string(&mock, &linux, Address::new(0x1080)),
        Err(AccessError::Implausible { .. })
    ));

    // Longer than the configured maximum.
    store_out_of_line(&mock, 0x10c0, 0x10c4, b"abcdefgh");
    let capped = linux.with_max_len(4);
    assert!(matches!(
        abi::read_foreign_string(&mock, &capped, Address::new(0x10c0)),
        Err(AccessError::Implausible { .. })
    ));
}

#[test]
fn test_inline_assignment_stays_in_buffer()
{
    let mock = MockProcess::builder().map(0x1000, 0x200).build();
    mock.fill(Address::new(0x1000), 0x200, SENTINEL).unwrap();
    let abi = abi_for(TargetOs::Windows);
    store_inline(&mock, 0x1000, 0x1100, b"dwarf");
    store_inline(&mock, 0x1040, 0x1100, b"a rather long creature name");

    abi::assign_foreign_string(&mock, &abi, Address::new(0x1000), "goblin").unwrap();
    assert_eq!(abi::read_foreign_string(&mock, &abi, Address::new(0x1000)).unwrap(), "goblin");
    assert_eq!(mock.read_u8(Address::new(0x100a)).unwrap(), 0);

    abi::assign_foreign_string(&mock, &abi, Address::new(0x1040), "a shorter name").unwrap();
    assert_eq!(abi::read_foreign_string(&mock, &abi, Address::new(0x1040)).unwrap(), "a shorter name");
    assert_eq!(mock.read_u32(Address::new(0x1044)).unwrap(), 0x1100);

    assert!(matches!(
        abi::assign_foreign_string(&mock, &abi, Address::new(0x1000), "sixteen letters!"),
        Err(AccessError::Implausible { .. })
    ));
    assert_eq!(abi::read_foreign_string(&mock, &abi, Address::new(0x1000)).unwrap(), "goblin");
}

#[test]
fn test_array_counts()
{
    let mock = MockProcess::builder().map(0x1000, 0x100).build();
    let element_size = 12usize;

    for (os, start_offset) in [(TargetOs::Linux, 0u64), (TargetOs::Windows, 4u64)] {
        let abi = abi_for(os);
        for count in [0usize, 1, 250_000] {
            let start = 0x4000_0000u32;
            let finish = start + (count * element_size) as u32;
            mock.store(Address::new(0x1000 + start_offset), &start.to_le_bytes()).unwrap();
            mock.store(Address::new(0x1004 + start_offset), &finish.to_le_bytes()).unwrap();

            let array = abi::read_foreign_array(&mock, &abi, Address::new(0x1000), element_size).unwrap();
            assert_eq!(array.count, count);
            assert_eq!(array.base, Address::new(u64::from(start)));
            assert_eq!(array.is_empty(), count == 0);
            if count > 0 {
                assert_eq!(
                    array.element(count - 1),
                    Some(Address::new(u64::from(finish) - element_size as u64))
                );
            }
            assert_eq!(array.element(count), None);
        }
    }
}

#[test]
fn test_inverted_array_is_implausible()
{
    let mock = MockProcess::builder().map(0x1000, 0x100).build();
    let abi = abi_for(TargetOs::Linux);
    mock.store(Address::new(0x1000), &0x2000u32.to_le_bytes()).unwrap();
    mock.store(Address::new(0x1004), &0x1000u32.to_le_bytes()).unwrap();

    assert!(matches!(
        abi::read_foreign_array(&mock, &abi, Address::new(0x1000), 4),
        Err(AccessError::Implausible { .. })
    ));
    assert!(matches!(
        abi::read_foreign_array(&mock, &abi, Address::new(0x1000), 0),
        Err(AccessError::Implausible { .. })
    ));
}

#[test]
fn test_pointer_array_elements()
{
    let mock = MockProcess::builder().map(0x1000, 0x100).build();
    let abi = abi_for(TargetOs::Linux);
    mock.store(Address::new(0x1000), &0x1040u32.to_le_bytes()).unwrap();
    mock.store(Address::new(0x1004), &0x104cu32.to_le_bytes()).unwrap();
    for (i, ptr) in [0x2000u32, 0x3000, 0x4000].iter().enumerate() {
        mock.store(Address::new(0x1040 + 4 * i as u64), &ptr.to_le_bytes()).unwrap();
    }

    let pointers = abi::read_pointer_array(&mock, &abi, Address::new(0x1000)).unwrap();
    assert_eq!(
        pointers,
        vec![Address::new(0x2000), Address::new(0x3000), Address::new(0x4000)]
    );
}
