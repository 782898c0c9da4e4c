//! Page-table entry encoding.
//!
//! [`MapFlags`] and [`CacheKind`] are the public mapping contract and must
//! stay bit-for-bit stable; the `ENTRY_*` bits below are the hardware
//! layout they are translated into when a leaf entry is written.

use bitflags::bitflags;

bitflags! {
    /// Mapping-flag contract exposed to callers of `map`.
    ///
    /// These bit positions are ABI: code built against this interface
    /// passes them as raw integers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const NO_EXECUTE = 1 << 3;
        const GLOBAL = 1 << 4;
    }
}

/// Cache behaviour requested for a mapping, selected through the
/// architecture's PAT/PCD/PWT leaf bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Normal,
    Uncacheable,
    WriteThrough,
    WriteBack,
    WriteCombining,
}

bitflags! {
    /// Hardware page-table entry bits (4 KiB leaf and intermediate levels).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const PAT = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

/// Mask to extract the physical address from a page-table entry.
pub const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Translate the public flags + cache kind into a leaf entry for `phys`.
///
/// Cache kinds select a PAT index: Normal and WriteBack use index 0,
/// WriteThrough index 1 (PWT), Uncacheable index 3 (PCD|PWT), and
/// WriteCombining index 4 (PAT), which boot-time PAT setup programs to WC.
pub fn encode_leaf(phys: u64, flags: MapFlags, cache: CacheKind) -> u64 {
    let mut bits = EntryFlags::empty();
    if flags.contains(MapFlags::PRESENT) {
        bits |= EntryFlags::PRESENT;
    }
    if flags.contains(MapFlags::WRITABLE) {
        bits |= EntryFlags::WRITABLE;
    }
    if flags.contains(MapFlags::USER) {
        bits |= EntryFlags::USER;
    }
    if flags.contains(MapFlags::NO_EXECUTE) {
        bits |= EntryFlags::NO_EXECUTE;
    }
    if flags.contains(MapFlags::GLOBAL) {
        bits |= EntryFlags::GLOBAL;
    }
    bits |= match cache {
        CacheKind::Normal | CacheKind::WriteBack => EntryFlags::empty(),
        CacheKind::WriteThrough => EntryFlags::WRITE_THROUGH,
        CacheKind::Uncacheable => EntryFlags::CACHE_DISABLE | EntryFlags::WRITE_THROUGH,
        CacheKind::WriteCombining => EntryFlags::PAT,
    };
    (phys & PHYS_ADDR_MASK) | bits.bits()
}

/// Indices into the four table levels for `virt`, root first.
#[inline]
pub fn table_indices(virt: u64) -> [usize; 4] {
    [
        ((virt >> 39) & 0x1FF) as usize,
        ((virt >> 30) & 0x1FF) as usize,
        ((virt >> 21) & 0x1FF) as usize,
        ((virt >> 12) & 0x1FF) as usize,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_flag_bits_are_abi_stable() {
        assert_eq!(MapFlags::PRESENT.bits(), 1 << 0);
        assert_eq!(MapFlags::WRITABLE.bits(), 1 << 1);
        assert_eq!(MapFlags::USER.bits(), 1 << 2);
        assert_eq!(MapFlags::NO_EXECUTE.bits(), 1 << 3);
        assert_eq!(MapFlags::GLOBAL.bits(), 1 << 4);
    }

    #[test]
    fn leaf_encoding_translates_flag_positions() {
        let entry = encode_leaf(
            0x5000,
            MapFlags::PRESENT | MapFlags::WRITABLE | MapFlags::NO_EXECUTE | MapFlags::GLOBAL,
            CacheKind::Normal,
        );
        assert_eq!(entry & PHYS_ADDR_MASK, 0x5000);
        let flags = EntryFlags::from_bits_retain(entry & !PHYS_ADDR_MASK);
        assert!(flags.contains(EntryFlags::PRESENT | EntryFlags::WRITABLE));
        assert!(flags.contains(EntryFlags::NO_EXECUTE));
        assert!(flags.contains(EntryFlags::GLOBAL));
        assert!(!flags.contains(EntryFlags::USER));
    }

    #[test]
    fn cache_kinds_select_pat_bits() {
        let uc = encode_leaf(0, MapFlags::PRESENT, CacheKind::Uncacheable);
        assert!(EntryFlags::from_bits_retain(uc)
            .contains(EntryFlags::CACHE_DISABLE | EntryFlags::WRITE_THROUGH));
        let wt = encode_leaf(0, MapFlags::PRESENT, CacheKind::WriteThrough);
        assert!(EntryFlags::from_bits_retain(wt).contains(EntryFlags::WRITE_THROUGH));
        let wc = encode_leaf(0, MapFlags::PRESENT, CacheKind::WriteCombining);
        assert!(EntryFlags::from_bits_retain(wc).contains(EntryFlags::PAT));
        let wb = encode_leaf(0, MapFlags::PRESENT, CacheKind::WriteBack);
        assert_eq!(wb & 0xFF8, 0);
    }

    #[test]
    fn indices_cover_all_levels() {
        let virt = (3u64 << 39) | (7 << 30) | (511 << 21) | (1 << 12);
        assert_eq!(table_indices(virt), [3, 7, 511, 1]);
    }
}
