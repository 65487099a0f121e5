use x86::bits64::paging::BASE_PAGE_SIZE;

pub const _4GB: u64 = 4 * 1024 * 1024 * 1024;
pub const _1MB: u64 = 1024 * 1024;

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_MASK: u64 = !(BASE_PAGE_SIZE as u64 - 1);

const_assert_eq!(BASE_PAGE_SIZE as u64, 1 << PAGE_SHIFT);

/// Rounds the address up to the next base page boundary.
pub const fn round_page_up(address: u64) -> u64 {
    (address + BASE_PAGE_SIZE as u64 - 1) & PAGE_MASK
}

pub const fn round_page_down(address: u64) -> u64 {
    address & PAGE_MASK
}

/// Checks whether `value` is a multiple of `alignment`.
///
/// `alignment` has to be a power of two, zero is treated as "no alignment
/// requirement".
pub const fn mem_aligned_check(value: u64, alignment: u64) -> bool {
    alignment == 0 || (value & (alignment - 1)) == 0
}

pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Calculates how many pages are required to hold the specified number of
/// bytes.
#[macro_export]
macro_rules! bytes_to_pages {
    ($bytes:expr) => {
        ($crate::utils::paging::round_page_up($bytes as u64)
            >> $crate::utils::paging::PAGE_SHIFT) as usize
    };
}
