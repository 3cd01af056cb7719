//! Tests for runtime type resolution through a session

use remora_core::error::AccessError;
use remora_core::layout::{ClassId, Discriminant, LayoutBuilder, LayoutDescriptor};
use remora_core::mock::MockProcess;
use remora_core::types::{Address, TargetOs, WordSize};
use remora_core::Locator;

const UNIT_VTABLE: u64 = 0x1010;
const ITEM_VTABLE: u64 = 0x1210;
const JOB_VTABLE: u64 = 0x1410;

/// Itanium chain: vtable - 4 → type_info, type_info + 4 → mangled name
fn store_rtti(mock: &MockProcess, vtable: u64, mangled: &[u8])
{
    let type_info = vtable + 0x30;
    let name = vtable + 0x70;
    mock.store(Address::new(vtable - 4), &(type_info as u32).to_le_bytes()).unwrap();
    mock.store(Address::new(type_info + 4), &(name as u32).to_le_bytes()).unwrap();
    mock.store(Address::new(name), mangled).unwrap();
}

fn store_object(mock: &MockProcess, object: u64, vtable: u64, kind: u16)
{
    mock.store(Address::new(object), &(vtable as u32).to_le_bytes()).unwrap();
    mock.store(Address::new(object + 8), &kind.to_le_bytes()).unwrap();
}

fn target() -> MockProcess
{
    let mock = MockProcess::builder().map(0x1000, 0x1000).build();
    store_rtti(&mock, UNIT_VTABLE, b"4unit\0");
    store_rtti(&mock, ITEM_VTABLE, b"N2df4itemE\0");
    store_rtti(&mock, JOB_VTABLE, b"3job\0");
    mock
}

fn layout() -> LayoutDescriptor
{
    LayoutBuilder::new("test", TargetOs::Linux, WordSize::Four)
        .with_class("unit", Some(Address::new(UNIT_VTABLE)))
        .with_variant_class(
            "job",
            Some(Address::new(JOB_VTABLE)),
            Discriminant::new(8),
            &[("dig", 1), ("haul", 2)],
        )
        .build()
}

#[test]
fn test_resolution_is_idempotent()
{
    let mock = target();
    store_object(&mock, 0x1800, UNIT_VTABLE, 0);
    store_object(&mock, 0x1820, UNIT_VTABLE, 0);

    let locator = Locator::new(vec![layout()]);
    let mut session = locator.attach_with(Box::new(mock), layout()).unwrap();

    let first = session.resolve_type(Address::new(0x1800)).unwrap();
    let again = session.resolve_type(Address::new(0x1800)).unwrap();
    let other_object = session.resolve_type(Address::new(0x1820)).unwrap();
    assert_eq!(first, again);
    assert_eq!(first, other_object);
    assert_eq!(session.type_resolver().class_name_to_id("unit"), Some(first));
}

#[test]
fn test_distinct_pointers_get_distinct_ids()
{
    let mock = target();
    store_object(&mock, 0x1800, UNIT_VTABLE, 0);
    store_object(&mock, 0x1820, ITEM_VTABLE, 0);

    let locator = Locator::new(vec![layout()]);
    let mut session = locator.attach_with(Box::new(mock), layout()).unwrap();
    let known = session.layout().classes().len();

    let unit = session.resolve_type(Address::new(0x1800)).unwrap();
    let item = session.resolve_type(Address::new(0x1820)).unwrap();
    assert_ne!(unit, item);
    assert_eq!(item, ClassId(known as u32));

    let resolver = session.type_resolver();
    assert_eq!(resolver.class_id_to_name(item), Some("df::item"));
    assert_eq!(resolver.class_name_to_dispatch_ptr("df::item"), Some(Address::new(ITEM_VTABLE)));
}

#[test]
fn test_same_name_from_second_table_is_same_class()
{
    let mock = target();
    let copy_vtable = 0x1610;
    store_rtti(&mock, copy_vtable, b"4unit\0");
    store_object(&mock, 0x1800, UNIT_VTABLE, 0);
    store_object(&mock, 0x1820, copy_vtable, 0);

    let locator = Locator::new(vec![layout()]);
    let mut session = locator.attach_with(Box::new(mock), layout()).unwrap();

    let first = session.resolve_type(Address::new(0x1800)).unwrap();
    let second = session.resolve_type(Address::new(0x1820)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_variants_and_fallback()
{
    let mock = target();
    store_object(&mock, 0x1800, JOB_VTABLE, 1);
    store_object(&mock, 0x1820, JOB_VTABLE, 2);
    store_object(&mock, 0x1840, JOB_VTABLE, 77);

    let locator = Locator::new(vec![layout()]);
    let mut session = locator.attach_with(Box::new(mock), layout()).unwrap();

    let dig = session.resolve_type(Address::new(0x1800)).unwrap();
    let haul = session.resolve_type(Address::new(0x1820)).unwrap();
    let unknown = session.resolve_type(Address::new(0x1840)).unwrap();

    let resolver = session.type_resolver();
    assert_eq!(resolver.class_id_to_name(dig), Some("dig"));
    assert_eq!(resolver.class_id_to_name(haul), Some("haul"));
    assert_eq!(Some(unknown), resolver.class_name_to_id("job"));
}

#[test]
fn test_resolution_needs_an_attached_session()
{
    let mock = target();
    store_object(&mock, 0x1800, UNIT_VTABLE, 0);

    let locator = Locator::new(vec![layout()]);
    let mut session = locator.attach_with(Box::new(mock), layout()).unwrap();
    session.detach().unwrap();

    assert_eq!(session.resolve_type(Address::new(0x1800)), Err(AccessError::NotAttached));
}
