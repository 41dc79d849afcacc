use crate::virtual_machine::errors::VmError;
use bytes::{Bytes, BytesMut};

/// Number of low address bits holding the offset inside a region.
const OFFSET_BITS: u32 = 32;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
/// Largest region the heap hands out.
pub const MAX_REGION_LEN: u64 = OFFSET_MASK;

/// Who may release a region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Owner {
    /// Pool, array and raw allocations made by guest code.
    Guest,
    /// A module memory segment; released only when its module goes away.
    Module,
}

#[derive(Debug)]
struct Region {
    bytes: BytesMut,
    owner: Owner,
}

/// Guest-visible memory.
///
/// Every allocation and every mapped module memory segment is one region.
/// A guest address is `region << 32 | offset`; region 0 is never handed out,
/// so address 0 is null.
///
/// With debug assertions a freed region id is never reused, which turns
/// use-after-free and double free into `IllegalAccess`. Release builds
/// recycle ids and ignore frees they cannot match.
#[derive(Debug, Default)]
pub struct Heap {
    regions: Vec<Option<Region>>,
    free: Vec<usize>,
}

/// Splits an address into region slot and offset.
fn split(address: u64) -> Option<(usize, usize)> {
    let region = (address >> OFFSET_BITS) as usize;
    let offset = (address & OFFSET_MASK) as usize;
    region.checked_sub(1).map(|slot| (slot, offset))
}

fn join(slot: usize, offset: usize) -> u64 {
    ((slot as u64 + 1) << OFFSET_BITS) | offset as u64
}

/// Zeroed buffer of `size` bytes, or `None` if the host is out of memory.
fn zeroed(size: usize) -> Option<BytesMut> {
    let mut raw = Vec::new();
    raw.try_reserve_exact(size).ok()?;
    raw.resize(size, 0);
    Some(BytesMut::from(Bytes::from(raw)))
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, region: Region) -> u64 {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.regions[slot] = Some(region);
                slot
            }
            None => {
                self.regions.push(Some(region));
                self.regions.len() - 1
            }
        };
        join(slot, 0)
    }

    fn remove(&mut self, address: u64, owner: Owner) -> Result<Option<BytesMut>, VmError> {
        let found = split(address).filter(|(slot, offset)| {
            *offset == 0
                && self
                    .regions
                    .get(*slot)
                    .and_then(Option::as_ref)
                    .is_some_and(|region| region.owner == owner)
        });
        let Some((slot, _)) = found else {
            return if cfg!(debug_assertions) {
                Err(VmError::IllegalAccess)
            } else {
                Ok(None)
            };
        };
        let region = self.regions[slot].take();
        if !cfg!(debug_assertions) {
            self.free.push(slot);
        }
        Ok(region.map(|region| region.bytes))
    }

    /// Allocates `size` zeroed bytes and returns their address.
    ///
    /// Sizes beyond [`MAX_REGION_LEN`], or more than the host can provide,
    /// yield the null address.
    pub fn allocate(&mut self, size: u64) -> u64 {
        if size > MAX_REGION_LEN {
            return 0;
        }
        let Some(bytes) = usize::try_from(size).ok().and_then(zeroed) else {
            return 0;
        };
        self.insert(Region {
            bytes,
            owner: Owner::Guest,
        })
    }

    /// Releases a guest allocation. Freeing null does nothing.
    pub fn release(&mut self, address: u64) -> Result<(), VmError> {
        if address == 0 {
            return Ok(());
        }
        self.remove(address, Owner::Guest).map(|_| ())
    }

    /// Maps a module memory segment and returns its base address.
    pub fn map_segment(&mut self, bytes: BytesMut) -> u64 {
        self.insert(Region {
            bytes,
            owner: Owner::Module,
        })
    }

    /// Unmaps a module memory segment and hands its bytes back.
    pub fn unmap_segment(&mut self, base: u64) -> Result<Option<BytesMut>, VmError> {
        self.remove(base, Owner::Module)
    }

    /// Address `by` bytes past `address`, staying inside its region.
    pub fn offset(address: u64, by: u64) -> Result<u64, VmError> {
        let offset = (address & OFFSET_MASK)
            .checked_add(by)
            .filter(|offset| *offset <= OFFSET_MASK)
            .ok_or(VmError::IllegalAccess)?;
        Ok((address & !OFFSET_MASK) | offset)
    }

    /// Number of live regions.
    pub fn live_regions(&self) -> usize {
        self.regions.iter().filter(|r| r.is_some()).count()
    }

    /// Borrows `len` bytes at `address`.
    pub fn slice(&self, address: u64, len: usize) -> Result<&[u8], VmError> {
        let (slot, offset) = split(address).ok_or(VmError::IllegalAccess)?;
        let region = self
            .regions
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or(VmError::IllegalAccess)?;
        let end = offset.checked_add(len).ok_or(VmError::IllegalAccess)?;
        region.bytes.get(offset..end).ok_or(VmError::IllegalAccess)
    }

    /// Mutably borrows `len` bytes at `address`.
    pub fn slice_mut(&mut self, address: u64, len: usize) -> Result<&mut [u8], VmError> {
        let (slot, offset) = split(address).ok_or(VmError::IllegalAccess)?;
        let region = self
            .regions
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or(VmError::IllegalAccess)?;
        let end = offset.checked_add(len).ok_or(VmError::IllegalAccess)?;
        region.bytes.get_mut(offset..end).ok_or(VmError::IllegalAccess)
    }

    /// Reads a little-endian value of `width` bytes (0..=8), zero-extended.
    pub fn read(&self, address: u64, width: u64) -> Result<u64, VmError> {
        if width > 8 {
            return Err(VmError::IllegalAccess);
        }
        let bytes = self.slice(address, width as usize)?;
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Writes the low `width` bytes (0..=8) of `value`, little-endian.
    pub fn write(&mut self, address: u64, value: u64, width: u64) -> Result<(), VmError> {
        if width > 8 {
            return Err(VmError::IllegalAccess);
        }
        let bytes = self.slice_mut(address, width as usize)?;
        bytes.copy_from_slice(&value.to_le_bytes()[..width as usize]);
        Ok(())
    }

    /// Reads a NUL-terminated byte string starting at `address`.
    pub fn read_c_string(&self, address: u64) -> Result<&[u8], VmError> {
        let (slot, offset) = split(address).ok_or(VmError::IllegalAccess)?;
        let tail = self
            .regions
            .get(slot)
            .and_then(Option::as_ref)
            .and_then(|region| region.bytes.get(offset..))
            .ok_or(VmError::IllegalAccess)?;
        let end = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or(VmError::IllegalAccess)?;
        Ok(&tail[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_zeroed_and_distinct() {
        let mut heap = Heap::new();
        let a = heap.allocate(16);
        let b = heap.allocate(16);
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(heap.read(a, 8).unwrap(), 0);
        assert_eq!(heap.live_regions(), 2);
    }

    #[test]
    fn width_exact_little_endian() {
        let mut heap = Heap::new();
        let a = heap.allocate(8);
        heap.write(a, u64::MAX, 8).unwrap();
        heap.write(a + 1, 0x1234, 2).unwrap();
        assert_eq!(heap.slice(a, 4).unwrap(), &[0xFF, 0x34, 0x12, 0xFF]);
        assert_eq!(heap.read(a + 1, 2).unwrap(), 0x1234);
        assert_eq!(heap.read(a, 0).unwrap(), 0);
    }

    #[test]
    fn out_of_bounds_is_illegal_access() {
        let mut heap = Heap::new();
        let a = heap.allocate(4);
        assert!(matches!(heap.read(a, 8), Err(VmError::IllegalAccess)));
        assert!(matches!(heap.write(a + 3, 1, 2), Err(VmError::IllegalAccess)));
        assert!(matches!(heap.read(a, 9), Err(VmError::IllegalAccess)));
        assert!(matches!(heap.read(0, 1), Err(VmError::IllegalAccess)));
    }

    #[test]
    fn null_free_is_a_no_op() {
        let mut heap = Heap::new();
        heap.release(0).unwrap();
    }

    #[test]
    fn freed_region_is_gone() {
        let mut heap = Heap::new();
        let a = heap.allocate(4);
        heap.release(a).unwrap();
        assert_eq!(heap.live_regions(), 0);
        assert!(matches!(heap.read(a, 1), Err(VmError::IllegalAccess)));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn double_free_is_detected() {
        let mut heap = Heap::new();
        let a = heap.allocate(4);
        heap.release(a).unwrap();
        assert!(matches!(heap.release(a), Err(VmError::IllegalAccess)));
        let b = heap.allocate(4);
        assert_ne!(a, b);
    }

    #[test]
    fn module_segments_cannot_be_freed_by_guest() {
        let mut heap = Heap::new();
        let base = heap.map_segment(BytesMut::from(&b"abc\0"[..]));
        let result = heap.release(base);
        assert!(result.is_err() || !cfg!(debug_assertions));
        assert_eq!(heap.read_c_string(base).unwrap(), b"abc");
        let bytes = heap.unmap_segment(base).unwrap().unwrap();
        assert_eq!(&bytes[..], b"abc\0");
    }

    #[test]
    fn c_string_needs_terminator() {
        let mut heap = Heap::new();
        let base = heap.map_segment(BytesMut::from(&b"no end"[..]));
        assert!(matches!(heap.read_c_string(base), Err(VmError::IllegalAccess)));
        assert_eq!(heap.read_c_string(base + 6).ok(), None);
    }

    #[test]
    fn offsets_stay_in_region() {
        let mut heap = Heap::new();
        let a = heap.allocate(8);
        assert_eq!(Heap::offset(a, 3).unwrap(), a + 3);
        assert_eq!(Heap::offset(a + 3, 2).unwrap(), a + 5);
        assert!(matches!(
            Heap::offset(a, MAX_REGION_LEN + 1),
            Err(VmError::IllegalAccess)
        ));
    }

    #[test]
    fn oversized_allocation_is_null() {
        let mut heap = Heap::new();
        assert_eq!(heap.allocate(MAX_REGION_LEN + 1), 0);
    }

    #[test]
    fn host_allocation_failure_is_not_fatal() {
        assert!(zeroed(usize::MAX).is_none());
        assert_eq!(&zeroed(3).unwrap()[..], &[0, 0, 0]);
        assert!(zeroed(0).unwrap().is_empty());
    }
}
