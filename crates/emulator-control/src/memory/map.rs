//! Table of mapped guest regions and byte-level access over it.

use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Permissions};

/// Identifier assigned to a region when it is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u32);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// Read-only description of a mapped region, as returned by
/// [`MemoryMap::regions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    /// Identifier assigned at map time.
    pub id: RegionId,
    /// First guest address of the region.
    pub base: u64,
    /// Length in bytes.
    pub size: u64,
    /// Current permission set.
    pub perms: Permissions,
}

impl MemoryRegion {
    /// One past the last address of the region.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Returns `true` when `addr` lies inside the region.
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

struct MappedRegion {
    id: RegionId,
    perms: Permissions,
    data: Box<[u8]>,
}

impl MappedRegion {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Non-overlapping set of guest memory regions, keyed by base address.
///
/// `base + size` never overflows the 64-bit address space, so region ends are
/// always representable.
#[derive(Default)]
pub struct MemoryMap {
    regions: BTreeMap<u64, MappedRegion>,
    next_id: u32,
}

impl fmt::Debug for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.regions()).finish()
    }
}

impl MemoryMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `[base, base + size)` with zeroed backing storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `size` is zero, the range
    /// overflows the address space, or it overlaps a mapped region, and
    /// [`Error::OutOfMemory`] when backing storage cannot be allocated. The map
    /// is unchanged on error.
    pub fn map(&mut self, base: u64, size: u64, perms: Permissions) -> Result<RegionId, Error> {
        if size == 0 {
            return Err(Error::InvalidArgument("region size must be non-zero"));
        }
        let end = base
            .checked_add(size)
            .ok_or(Error::InvalidArgument("region overflows the address space"))?;
        if self.overlaps(base, end) {
            return Err(Error::InvalidArgument("region overlaps an existing mapping"));
        }

        let len = usize::try_from(size).map_err(|_| Error::OutOfMemory { size })?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| Error::OutOfMemory { size })?;
        data.resize(len, 0);

        let id = RegionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.regions.insert(
            base,
            MappedRegion {
                id,
                perms,
                data: data.into_boxed_slice(),
            },
        );
        log::debug!("mapped {id} at {base:#x}..{end:#x} ({perms})");
        Ok(id)
    }

    /// Unmaps the region that exactly spans `[base, base + size)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnmappedMemory`] when no region has exactly this base
    /// and size; partial unmapping is not supported.
    pub fn unmap(&mut self, base: u64, size: u64) -> Result<(), Error> {
        self.exact(base, size)?;
        if let Some(region) = self.regions.remove(&base) {
            log::debug!("unmapped {} at {base:#x} ({size:#x} bytes)", region.id);
        }
        Ok(())
    }

    /// Replaces the permissions of the region that exactly spans
    /// `[base, base + size)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnmappedMemory`] when no region has exactly this base
    /// and size.
    pub fn protect(&mut self, base: u64, size: u64, perms: Permissions) -> Result<(), Error> {
        self.exact(base, size)?;
        if let Some(region) = self.regions.get_mut(&base) {
            region.perms = perms;
            log::debug!("protected {} at {base:#x} as {perms}", region.id);
        }
        Ok(())
    }

    /// Reads `len` bytes starting at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnmappedMemory`] at the first uncovered byte, or
    /// [`Error::PermissionDenied`] at the first byte of a region without
    /// [`Permissions::READ`].
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.read_with(addr, len, Some(Permissions::READ))
    }

    /// Writes `bytes` starting at `addr`. No byte changes unless the whole
    /// range is covered and writable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnmappedMemory`] at the first uncovered byte, or
    /// [`Error::PermissionDenied`] at the first byte of a region without
    /// [`Permissions::WRITE`].
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Error> {
        self.write_with(addr, bytes, Some(Permissions::WRITE))
    }

    /// Writes `bytes` ignoring region permissions, for loading code and
    /// constant data into regions the guest may not write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnmappedMemory`] at the first uncovered byte.
    pub fn load(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Error> {
        self.write_with(addr, bytes, None)
    }

    /// Verifies that `[addr, addr + len)` is mapped and every covering region
    /// grants `perm`.
    ///
    /// # Errors
    ///
    /// Same as [`MemoryMap::read`], with `perm` as the required permission.
    pub fn check(&self, addr: u64, len: usize, perm: Permissions) -> Result<(), Error> {
        self.walk(addr, len, Some(perm), |_, _, _| {})
    }

    /// Snapshot of every region, sorted by base address.
    #[must_use]
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.regions
            .iter()
            .map(|(base, region)| MemoryRegion {
                id: region.id,
                base: *base,
                size: region.size(),
                perms: region.perms,
            })
            .collect()
    }

    /// Region covering `addr`, if any.
    #[must_use]
    pub fn region_at(&self, addr: u64) -> Option<MemoryRegion> {
        self.containing(addr).map(|(base, region)| MemoryRegion {
            id: region.id,
            base,
            size: region.size(),
            perms: region.perms,
        })
    }

    /// Number of mapped regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns `true` when nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Releases every region.
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub(crate) fn read_with(
        &self,
        addr: u64,
        len: usize,
        perm: Option<Permissions>,
    ) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(len);
        self.walk(addr, len, perm, |region, offset, count| {
            out.extend_from_slice(&region.data[offset..offset + count]);
        })?;
        Ok(out)
    }

    pub(crate) fn write_with(
        &mut self,
        addr: u64,
        bytes: &[u8],
        perm: Option<Permissions>,
    ) -> Result<(), Error> {
        self.walk(addr, bytes.len(), perm, |_, _, _| {})?;

        let mut cursor = addr;
        let mut written = 0;
        while written < bytes.len() {
            let Some((base, region)) = self.regions.range_mut(..=cursor).next_back() else {
                return Err(Error::UnmappedMemory(cursor));
            };
            let offset = offset_in(*base, cursor);
            let count = (region.data.len() - offset).min(bytes.len() - written);
            region.data[offset..offset + count].copy_from_slice(&bytes[written..written + count]);
            written += count;
            cursor = cursor.wrapping_add(count as u64);
        }
        Ok(())
    }

    /// Visits the covered chunks of `[addr, addr + len)` in address order after
    /// checking coverage and permissions for every byte of the range.
    fn walk(
        &self,
        addr: u64,
        len: usize,
        perm: Option<Permissions>,
        mut visit: impl FnMut(&MappedRegion, usize, usize),
    ) -> Result<(), Error> {
        let mut chunks = Vec::new();
        let mut cursor = addr;
        let mut remaining = len as u64;
        while remaining > 0 {
            let (base, region) = self
                .containing(cursor)
                .ok_or(Error::UnmappedMemory(cursor))?;
            if let Some(perm) = perm {
                if !region.perms.contains(perm) {
                    return Err(Error::PermissionDenied(cursor));
                }
            }
            let offset = offset_in(base, cursor);
            let count = (region.size() - offset as u64).min(remaining);
            chunks.push((region, offset, count));
            remaining -= count;
            cursor = base + region.size();
        }

        for (region, offset, count) in chunks {
            visit(region, offset, usize::try_from(count).unwrap_or(usize::MAX));
        }
        Ok(())
    }

    fn containing(&self, addr: u64) -> Option<(u64, &MappedRegion)> {
        self.regions
            .range(..=addr)
            .next_back()
            .filter(|(base, region)| addr - **base < region.size())
            .map(|(base, region)| (*base, region))
    }

    fn overlaps(&self, base: u64, end: u64) -> bool {
        self.regions
            .range(..end)
            .next_back()
            .is_some_and(|(other_base, other)| other_base + other.size() > base)
    }

    fn exact(&self, base: u64, size: u64) -> Result<(), Error> {
        match self.regions.get(&base) {
            Some(region) if region.size() == size => Ok(()),
            _ => Err(Error::UnmappedMemory(base)),
        }
    }
}

fn offset_in(base: u64, addr: u64) -> usize {
    usize::try_from(addr - base).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::{MemoryMap, MemoryRegion, RegionId};
    use crate::{Error, Permissions};

    #[test]
    fn mapped_regions_are_listed_in_base_order() {
        let mut map = MemoryMap::new();
        let high = map.map(0x20_0000, 0x1000, Permissions::READ).expect("free");
        let low = map.map(0x1000, 0x2000, Permissions::ALL).expect("free");

        assert_eq!(
            map.regions(),
            vec![
                MemoryRegion {
                    id: low,
                    base: 0x1000,
                    size: 0x2000,
                    perms: Permissions::ALL,
                },
                MemoryRegion {
                    id: high,
                    base: 0x20_0000,
                    size: 0x1000,
                    perms: Permissions::READ,
                },
            ]
        );
        assert_ne!(low, high);
    }

    #[test]
    fn map_rejects_empty_overflowing_and_overlapping_ranges() {
        let mut map = MemoryMap::new();
        map.map(0x1000, 0x1000, Permissions::ALL).expect("free");

        assert!(matches!(
            map.map(0x5000, 0, Permissions::ALL),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            map.map(u64::MAX - 0xFFF, 0x1000, Permissions::ALL),
            Err(Error::InvalidArgument(_))
        ));
        for (base, size) in [(0x1000, 0x1000), (0x800, 0x1000), (0x1FFF, 0x10), (0, 0x10000)] {
            assert!(matches!(
                map.map(base, size, Permissions::ALL),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert_eq!(map.len(), 1);

        map.map(0x2000, 0x1000, Permissions::ALL)
            .expect("adjacent range does not overlap");
        map.map(0, 0x1000, Permissions::ALL)
            .expect("adjacent range does not overlap");
    }

    #[test]
    fn new_regions_are_zero_filled() {
        let mut map = MemoryMap::new();
        map.map(0x4000, 0x100, Permissions::READ).expect("free");
        assert_eq!(map.read(0x4000, 0x100), Ok(vec![0; 0x100]));
    }

    #[test]
    fn accesses_may_span_contiguous_regions() {
        let mut map = MemoryMap::new();
        map.map(0x1000, 0x1000, Permissions::ALL).expect("free");
        map.map(0x2000, 0x1000, Permissions::READ | Permissions::WRITE)
            .expect("free");

        map.write(0x1FFE, &[1, 2, 3, 4]).expect("covered and writable");
        assert_eq!(map.read(0x1FFE, 4), Ok(vec![1, 2, 3, 4]));
        assert_eq!(map.read(0x2000, 2), Ok(vec![3, 4]));
    }

    #[test]
    fn gaps_and_missing_permissions_fail_without_partial_writes() {
        let mut map = MemoryMap::new();
        map.map(0x1000, 0x1000, Permissions::ALL).expect("free");
        map.map(0x3000, 0x1000, Permissions::READ).expect("free");

        assert_eq!(
            map.write(0x1FFE, &[9, 9, 9, 9]),
            Err(Error::UnmappedMemory(0x2000))
        );
        assert_eq!(map.read(0x1FFE, 2), Ok(vec![0, 0]));

        assert_eq!(map.write(0x3000, &[1]), Err(Error::PermissionDenied(0x3000)));
        assert_eq!(map.check(0x3000, 1, Permissions::EXEC), Err(Error::PermissionDenied(0x3000)));
        assert_eq!(map.read(0x5000, 1), Err(Error::UnmappedMemory(0x5000)));
    }

    #[test]
    fn load_ignores_permissions_but_not_coverage() {
        let mut map = MemoryMap::new();
        map.map(0x1000, 0x1000, Permissions::READ | Permissions::EXEC)
            .expect("free");

        map.load(0x1000, &[0x41, 0x4A]).expect("mapped");
        assert_eq!(map.read(0x1000, 2), Ok(vec![0x41, 0x4A]));
        assert_eq!(map.load(0x1FFF, &[1, 2]), Err(Error::UnmappedMemory(0x2000)));
    }

    #[test]
    fn unmap_and_protect_require_an_exact_region() {
        let mut map = MemoryMap::new();
        map.map(0x1000, 0x2000, Permissions::ALL).expect("free");

        assert_eq!(map.unmap(0x1000, 0x1000), Err(Error::UnmappedMemory(0x1000)));
        assert_eq!(map.unmap(0x2000, 0x1000), Err(Error::UnmappedMemory(0x2000)));
        assert_eq!(
            map.protect(0x1000, 0x1000, Permissions::READ),
            Err(Error::UnmappedMemory(0x1000))
        );

        map.protect(0x1000, 0x2000, Permissions::READ).expect("exact");
        assert_eq!(map.write(0x1000, &[1]), Err(Error::PermissionDenied(0x1000)));

        map.unmap(0x1000, 0x2000).expect("exact");
        assert!(map.is_empty());
        assert_eq!(map.read(0x1000, 1), Err(Error::UnmappedMemory(0x1000)));
    }

    #[test]
    fn region_lookup_reports_the_covering_region() {
        let mut map = MemoryMap::new();
        let id = map.map(0x1000, 0x10, Permissions::READ).expect("free");
        assert_eq!(map.region_at(0x100F).map(|region| region.id), Some(id));
        assert_eq!(map.region_at(0x1010), None);
        assert_eq!(map.region_at(0xFFF), None);
        assert_eq!(RegionId(3).to_string(), "region#3");
    }

    #[test]
    fn region_lookup_picks_the_right_neighbour() {
        let mut map = MemoryMap::new();
        map.map(0x1000, 0x1000, Permissions::READ).expect("free");
        let upper = map.map(0x3000, 0x800, Permissions::ALL).expect("free");

        assert_eq!(
            map.region_at(0x37FF),
            Some(MemoryRegion {
                id: upper,
                base: 0x3000,
                size: 0x800,
                perms: Permissions::ALL,
            })
        );
        assert_eq!(map.region_at(0x2800), None);
        assert_eq!(map.region_at(0x3800), None);
    }

    #[test]
    fn zero_length_accesses_succeed_anywhere() {
        let mut map = MemoryMap::new();
        assert_eq!(map.read(0xDEAD, 0), Ok(Vec::new()));
        assert_eq!(map.write(0xDEAD, &[]), Ok(()));
    }

    #[test]
    fn access_running_past_the_top_of_memory_is_unmapped() {
        let mut map = MemoryMap::new();
        map.map(u64::MAX - 0x1FFF, 0x1000, Permissions::ALL).expect("free");
        assert_eq!(
            map.read(u64::MAX - 0x1001, 4),
            Err(Error::UnmappedMemory(u64::MAX - 0xFFF))
        );
    }
}
