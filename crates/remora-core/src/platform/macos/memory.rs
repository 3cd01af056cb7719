//! # Mach Memory Access
//!
//! Reads, writes and region enumeration on a Mach task port.
//!
//! - **mach_vm_read_overwrite()**: copy target memory straight into our buffer, in chunks
//! - **vm_write()**: copy an arbitrary-length buffer into the target
//! - **mach_vm_region_recurse()**: walk the target's address space, descending into submaps
//!
//! ## References
//!
//! - [mach_vm_read_overwrite](https://developer.apple.com/documentation/kernel/1402127-mach_vm_read_overwrite)
//! - [vm_write(3) man page](https://developer.apple.com/documentation/kernel/1585462-vm_write/)
//! - [mach_vm_region_recurse](https://developer.apple.com/documentation/kernel/1402149-mach_vm_region_recurse)

use std::cmp::min;

use libc::{mach_port_t, vm_address_t, vm_map_t, vm_offset_t};
use mach2::kern_return::KERN_SUCCESS;
use mach2::message::mach_msg_type_number_t;
use mach2::vm::{mach_vm_read_overwrite, mach_vm_region_recurse};
use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_region::{vm_region_recurse_info_t, vm_region_submap_short_info_data_64_t, VM_REGION_SUBMAP_SHORT_INFO_COUNT_64};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t, natural_t};
use once_cell::sync::Lazy;
use tracing::trace;

use super::error::MachError;
use super::ffi;
use crate::error::{AccessError, RemoraResult};
use crate::types::{Address, MemoryRange};

#[allow(unsafe_code)]
static SYSTEM_PAGE_SIZE: Lazy<usize> = Lazy::new(|| unsafe {
    let size = libc::sysconf(libc::_SC_PAGESIZE);
    if size <= 0 { 4096 } else { size as usize }
});

/// Upper bound for a single `mach_vm_read_overwrite()` call
fn read_chunk() -> usize
{
    *SYSTEM_PAGE_SIZE * 16
}

/// Fill `dst` from the target, resuming after partial chunks
#[allow(unsafe_code)]
pub fn read_into(task: mach_port_t, addr: Address, dst: &mut [u8]) -> Result<(), AccessError>
{
    let mut total = 0usize;
    while total < dst.len() {
        let chunk_len = min(read_chunk(), dst.len() - total);
        let mut actual: mach_vm_size_t = 0;
        let cursor = addr + total as u64;

        let result = unsafe {
            mach_vm_read_overwrite(
                task as vm_map_t,
                cursor.value(),
                chunk_len as mach_vm_size_t,
                dst[total..].as_mut_ptr() as mach_vm_address_t,
                &mut actual,
            )
        };

        if result != KERN_SUCCESS {
            let err = MachError::from(result);
            trace!(%cursor, %err, "mach_vm_read_overwrite failed");
            return Err(match (err, total) {
                (MachError::ProcessNotFound, _) => AccessError::TargetExited,
                (_, 0) => err.into_access(addr, dst.len()),
                _ => AccessError::PartialTransfer {
                    address: addr,
                    requested: dst.len(),
                    transferred: total,
                },
            });
        }
        if actual == 0 {
            return Err(AccessError::PartialTransfer {
                address: addr,
                requested: dst.len(),
                transferred: total,
            });
        }
        total += actual as usize;
    }
    Ok(())
}

/// Write all of `data` at `addr`
#[allow(unsafe_code)]
pub fn write(task: mach_port_t, addr: Address, data: &[u8]) -> Result<(), AccessError>
{
    if data.is_empty() {
        return Ok(());
    }

    let result = unsafe {
        ffi::vm_write(
            task as vm_map_t,
            addr.value() as vm_address_t,
            data.as_ptr() as vm_offset_t,
            data.len() as mach_msg_type_number_t,
        )
    };
    if result != KERN_SUCCESS {
        return Err(MachError::from(result).into_access(addr, data.len()));
    }
    Ok(())
}

/// Every leaf region of the task's address space
#[allow(unsafe_code)]
pub fn regions(task: mach_port_t) -> RemoraResult<Vec<MemoryRange>>
{
    let mut regions = Vec::new();
    let mut address: mach_vm_address_t = 0;
    let mut depth: natural_t = 0;

    loop {
        let mut size: mach_vm_size_t = 0;
        let mut info = vm_region_submap_short_info_data_64_t::default();
        let mut info_count = VM_REGION_SUBMAP_SHORT_INFO_COUNT_64;

        let result = unsafe {
            mach_vm_region_recurse(
                task as vm_map_t,
                &mut address,
                &mut size,
                &mut depth,
                &mut info as *mut _ as vm_region_recurse_info_t,
                &mut info_count,
            )
        };

        if result == libc::KERN_INVALID_ADDRESS {
            break;
        }
        if result != KERN_SUCCESS {
            return Err(MachError::from(result).into());
        }
        if info.is_submap != 0 {
            depth += 1;
            continue;
        }

        regions.push(MemoryRange {
            start: Address::new(address),
            end: Address::new(address + size),
            readable: info.protection & VM_PROT_READ != 0,
            writable: info.protection & VM_PROT_WRITE != 0,
            executable: info.protection & VM_PROT_EXECUTE != 0,
            // SM_SHARED, SM_TRUESHARED, SM_SHARED_ALIASED
            shared: matches!(info.share_mode, 4 | 5 | 7),
            file_offset: info.offset,
            name: None,
        });
        address += size;
    }

    Ok(regions)
}
