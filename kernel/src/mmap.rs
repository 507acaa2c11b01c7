//! Demand-paged user memory mappings, backed either by anonymous zero-filled pages or by a
//! file. Mappings live in the fixed window above `MMAPBASE`, well clear of `sbrk` growth and
//! the trapframe/trampoline pair just below `MAXVA`.

use core::mem::MaybeUninit;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::abi::{MAP_ANONYMOUS, MAP_POPULATE, PROT_READ, PROT_WRITE};
use crate::error::MmapError;
use crate::file::File;
use crate::memlayout::MMAPBASE;
use crate::param::MAX_MMAP_AREA;
use crate::proc::{PROC_TABLE, current_proc_and_data_mut};
use crate::riscv::{PGSIZE, PTE_R, PTE_U, PTE_W, pg_round_down, pg_round_up};
use crate::spinlock::SpinLock;
use crate::vm::{PA, Uvm, VA};

/// Upper bound of the mmap window, chosen so a bad `addr` can be rejected without ever
/// reaching the trapframe/trampoline pair mapped just below `MAXVA`.
const MMAP_WINDOW: usize = 0x10000000;

#[derive(Debug, Clone)]
struct MappingDescriptor {
    /// `Proc::id` of the owning process, not its `Pid`.
    owner: usize,
    start: VA,
    /// Page-rounded length in bytes.
    length: usize,
    prot: u32,
    file: Option<File>,
    file_offset: usize,
}

static MMAP_TABLE: SpinLock<[Option<MappingDescriptor>; MAX_MMAP_AREA]> =
    SpinLock::new([const { None }; MAX_MMAP_AREA], "mmap");

pub fn init() {
    println!("mmap init");
}

/// Creates a new mapping of `length` bytes. `addr == 0` asks the kernel to pick a free range
/// in the caller's mmap window; otherwise `addr` must be page-aligned and free. With
/// `MAP_POPULATE` every page is faulted in eagerly; otherwise pages are brought in lazily by
/// `page_fault`.
pub fn mmap(
    addr: usize,
    length: usize,
    prot: u32,
    flags: u32,
    file: Option<File>,
    offset: usize,
) -> Result<VA, MmapError> {
    if length == 0 {
        return Err(MmapError::BadRange);
    }
    if !offset.is_multiple_of(PGSIZE) {
        return Err(MmapError::Unaligned);
    }

    let anonymous = flags & MAP_ANONYMOUS != 0;
    let populate = flags & MAP_POPULATE != 0;
    let length = pg_round_up(length);

    if !anonymous {
        let backing = file.as_ref().ok_or(MmapError::BadRange)?;
        if prot & PROT_READ != 0 && !backing.is_readable() {
            return Err(MmapError::ProtectionViolation);
        }
        if prot & PROT_WRITE != 0 && !backing.is_writable() {
            return Err(MmapError::ProtectionViolation);
        }
    }

    let (proc, data) = current_proc_and_data_mut();
    let mut table = MMAP_TABLE.lock();

    let start = if addr != 0 {
        let start = VA::from(MMAPBASE + addr);
        if !start.is_aligned() {
            return Err(MmapError::Unaligned);
        }
        if start.as_usize() + length > MMAPBASE + MMAP_WINDOW {
            return Err(MmapError::BadRange);
        }
        if range_overlaps(&table, proc.id, start, length) {
            return Err(MmapError::BadRange);
        }
        start
    } else {
        find_free_range(&table, proc.id, length)?
    };

    let slot = table
        .iter()
        .position(|entry| entry.is_none())
        .ok_or(MmapError::OutOfArea)?;

    if populate {
        populate_range(
            data.pagetable_mut(),
            start,
            length,
            prot,
            anonymous,
            file.as_ref(),
            offset,
        )?;
    }

    table[slot] = Some(MappingDescriptor {
        owner: proc.id,
        start,
        length,
        prot,
        file,
        file_offset: offset,
    });

    Ok(start)
}

/// Removes the mapping starting exactly at `addr`, unmapping whatever pages of it are
/// currently present.
pub fn munmap(addr: VA) -> Result<(), MmapError> {
    let (proc, data) = current_proc_and_data_mut();
    let mut table = MMAP_TABLE.lock();

    let slot = table
        .iter()
        .position(|entry| entry.as_ref().is_some_and(|m| m.owner == proc.id && m.start == addr))
        .ok_or(MmapError::NoSuchMapping)?;

    let mapping = table[slot].take().unwrap();
    drop(table);

    unmap_present_pages(data.pagetable_mut(), mapping.start, mapping.length);

    Ok(())
}

/// Services a load/store page fault by populating the single page covering `fault_addr`, if
/// it falls inside one of the current process's mappings and isn't already present.
pub fn page_fault(fault_addr: usize, is_write: bool) -> Result<(), MmapError> {
    let (proc, data) = current_proc_and_data_mut();

    let mapping = {
        let table = MMAP_TABLE.lock();
        table
            .iter()
            .flatten()
            .find(|m| {
                m.owner == proc.id
                    && fault_addr >= m.start.as_usize()
                    && fault_addr < m.start.as_usize() + m.length
            })
            .cloned()
            .ok_or(MmapError::NoSuchMapping)?
    };

    if is_write && mapping.prot & PROT_WRITE == 0 {
        return Err(MmapError::ProtectionViolation);
    }

    let page_va = VA::from(pg_round_down(fault_addr));

    if data.pagetable_mut().is_mapped(page_va) {
        // already backed; a fault here means the access itself violated protection.
        return Err(MmapError::ProtectionViolation);
    }

    let offset_in_mapping = page_va.as_usize() - mapping.start.as_usize();

    populate_page(
        data.pagetable_mut(),
        page_va,
        page_perm(mapping.prot),
        mapping.file.is_none(),
        mapping.file.as_ref(),
        mapping.file_offset + offset_in_mapping,
    )
}

/// Gives the child an independent copy of every mapping the parent owns, eagerly copying
/// whatever pages of each are currently present. Lazily-paged regions stay lazy in the child.
pub fn fork_duplicate(
    parent_id: usize,
    child_id: usize,
    parent_pt: &mut Uvm,
    child_pt: &mut Uvm,
) -> Result<(), MmapError> {
    let parent_mappings: Vec<MappingDescriptor> = {
        let table = MMAP_TABLE.lock();
        table
            .iter()
            .flatten()
            .filter(|m| m.owner == parent_id)
            .cloned()
            .collect()
    };

    let mut child_mappings = Vec::with_capacity(parent_mappings.len());

    for mapping in parent_mappings {
        parent_pt
            .copy_range(child_pt, mapping.start, mapping.length)
            .map_err(|_| MmapError::Populate)?;

        let mut child_mapping = mapping;
        child_mapping.owner = child_id;
        if let Some(file) = child_mapping.file.as_mut() {
            file.dup();
        }
        child_mappings.push(child_mapping);
    }

    let mut table = MMAP_TABLE.lock();
    for mapping in child_mappings {
        let slot = table
            .iter()
            .position(|entry| entry.is_none())
            .ok_or(MmapError::OutOfArea)?;
        table[slot] = Some(mapping);
    }

    Ok(())
}

/// Tears down every mapping owned by `proc_id`, unmapping present pages and closing any
/// backing file. Must run before the process's page table itself is freed, since a leaf PTE
/// left behind in the mmap window would make `PageTable::free_walk` panic.
pub fn release_owner(proc_id: usize) {
    let owned: Vec<MappingDescriptor> = {
        let mut table = MMAP_TABLE.lock();
        table
            .iter_mut()
            .filter(|entry| entry.as_ref().is_some_and(|m| m.owner == proc_id))
            .filter_map(|entry| entry.take())
            .collect()
    };

    if owned.is_empty() {
        return;
    }

    let proc = PROC_TABLE.get(proc_id);
    let pagetable = unsafe { proc.data_mut() }.pagetable_mut();

    for mut mapping in owned {
        unmap_present_pages(pagetable, mapping.start, mapping.length);
        if let Some(file) = mapping.file.as_mut() {
            file.close();
        }
    }
}

fn range_overlaps(
    table: &[Option<MappingDescriptor>; MAX_MMAP_AREA],
    owner: usize,
    start: VA,
    length: usize,
) -> bool {
    let end = start.as_usize() + length;
    table.iter().flatten().any(|m| {
        m.owner == owner && start.as_usize() < m.start.as_usize() + m.length && m.start.as_usize() < end
    })
}

fn find_free_range(
    table: &[Option<MappingDescriptor>; MAX_MMAP_AREA],
    owner: usize,
    length: usize,
) -> Result<VA, MmapError> {
    let mut candidate = MMAPBASE;

    loop {
        if candidate + length > MMAPBASE + MMAP_WINDOW {
            return Err(MmapError::OutOfArea);
        }

        let start = VA::from(candidate);
        if !range_overlaps(table, owner, start, length) {
            return Ok(start);
        }

        candidate = table
            .iter()
            .flatten()
            .filter(|m| m.owner == owner)
            .filter(|m| candidate < m.start.as_usize() + m.length)
            .map(|m| m.start.as_usize() + m.length)
            .min()
            .unwrap_or(candidate + PGSIZE);
    }
}

/// Unmaps whichever pages of `[start, start+length)` are currently present, skipping the
/// ones a lazy mapping never ended up faulting in.
fn unmap_present_pages(pagetable: &mut Uvm, start: VA, length: usize) {
    for off in (0..length).step_by(PGSIZE) {
        let va = VA::from(start.as_usize() + off);
        if pagetable.is_mapped(va) {
            pagetable.unmap(va, 1, true);
        }
    }
}

fn page_perm(prot: u32) -> usize {
    let mut perm = PTE_U;
    if prot & PROT_READ != 0 {
        perm |= PTE_R;
    }
    if prot & PROT_WRITE != 0 {
        perm |= PTE_W;
    }
    perm
}

/// Maps every page in `[start, start+length)`, either zero-filled or read from `file`
/// starting at `offset`. Rolls back everything it mapped if any page fails partway through.
fn populate_range(
    pagetable: &mut Uvm,
    start: VA,
    length: usize,
    prot: u32,
    anonymous: bool,
    file: Option<&File>,
    offset: usize,
) -> Result<(), MmapError> {
    let perm = page_perm(prot);
    let mut mapped = 0;

    while mapped < length {
        let va = VA::from(start.as_usize() + mapped);

        if let Err(err) = populate_page(pagetable, va, perm, anonymous, file, offset + mapped) {
            if mapped > 0 {
                pagetable.unmap(start, mapped / PGSIZE, true);
            }
            return Err(err);
        }

        mapped += PGSIZE;
    }

    Ok(())
}

/// Allocates and maps a single zero-filled or file-backed page at `va`.
fn populate_page(
    pagetable: &mut Uvm,
    va: VA,
    perm: usize,
    anonymous: bool,
    file: Option<&File>,
    file_offset: usize,
) -> Result<(), MmapError> {
    let page: Box<MaybeUninit<[u8; PGSIZE]>> =
        Box::try_new_zeroed().map_err(|_| MmapError::Populate)?;
    let page = unsafe { page.assume_init() };
    let pa = Box::into_raw(page) as usize;

    if !anonymous {
        let backing = file.ok_or(MmapError::Populate)?;
        if backing
            .read_at(VA::from(pa), PGSIZE, file_offset as u32)
            .is_err()
        {
            let _drop = unsafe { Box::from_raw(pa as *mut [u8; PGSIZE]) };
            return Err(MmapError::Populate);
        }
    }

    if pagetable.map_pages(va, PA(pa), PGSIZE, perm).is_err() {
        let _drop = unsafe { Box::from_raw(pa as *mut [u8; PGSIZE]) };
        return Err(MmapError::Populate);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> [Option<MappingDescriptor>; MAX_MMAP_AREA] {
        [const { None }; MAX_MMAP_AREA]
    }

    fn mapping(owner: usize, start: usize, length: usize) -> MappingDescriptor {
        MappingDescriptor {
            owner,
            start: VA::from(start),
            length,
            prot: PROT_READ | PROT_WRITE,
            file: None,
            file_offset: 0,
        }
    }

    #[test]
    fn overlap_detects_intersecting_ranges_of_same_owner() {
        let mut t = table();
        t[0] = Some(mapping(1, MMAPBASE, PGSIZE));
        assert!(range_overlaps(&t, 1, VA::from(MMAPBASE), PGSIZE));
        assert!(range_overlaps(&t, 1, VA::from(MMAPBASE + PGSIZE / 2), PGSIZE));
        assert!(!range_overlaps(&t, 1, VA::from(MMAPBASE + PGSIZE), PGSIZE));
    }

    #[test]
    fn overlap_ignores_other_owners() {
        let mut t = table();
        t[0] = Some(mapping(1, MMAPBASE, PGSIZE));
        assert!(!range_overlaps(&t, 2, VA::from(MMAPBASE), PGSIZE));
    }

    #[test]
    fn find_free_range_skips_past_existing_mapping() {
        let mut t = table();
        t[0] = Some(mapping(1, MMAPBASE, PGSIZE));
        let found = find_free_range(&t, 1, PGSIZE).unwrap();
        assert_eq!(found, VA::from(MMAPBASE + PGSIZE));
    }

    #[test]
    fn find_free_range_reuses_gap_left_by_other_owner() {
        let t = table();
        let found = find_free_range(&t, 7, PGSIZE).unwrap();
        assert_eq!(found, VA::from(MMAPBASE));
    }

    #[test]
    fn find_free_range_errors_past_window() {
        let t = table();
        assert_eq!(
            find_free_range(&t, 1, MMAP_WINDOW + PGSIZE),
            Err(MmapError::OutOfArea)
        );
    }

    #[test]
    fn page_perm_respects_prot_bits() {
        assert_eq!(page_perm(PROT_READ) & PTE_R, PTE_R);
        assert_eq!(page_perm(PROT_READ) & PTE_W, 0);
        assert_eq!(page_perm(PROT_READ | PROT_WRITE) & PTE_W, PTE_W);
        assert_eq!(page_perm(0) & PTE_U, PTE_U);
    }
}
