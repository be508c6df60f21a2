//! Tracks reserved and committed address ranges in debug builds, so
//! contract checks on `PageAllocator` and the allocators built on top
//! of it can catch overlapping or out-of-order calls.
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Clone, Copy)]
struct Range {
    begin: usize,
    size: usize,
}

#[derive(Clone, Copy)]
struct ReservedRange {
    begin: usize,
    size: usize,

    /// The one committed sub-range inside this reservation, if any.
    /// Unlike the teacher's metadata/data split, there is only one
    /// kind of sub-region here: every reservation backs exactly one
    /// allocator.
    committed: Option<Range>,
}

lazy_static::lazy_static! {
    static ref RANGE_MAP: Mutex<BTreeMap<usize, ReservedRange>> = Default::default();
}

fn predecessor(ptr: usize) -> Option<ReservedRange> {
    let map = RANGE_MAP.lock().unwrap();
    map.range(0..=ptr).last().map(|x| *x.1)
}

/// Registers a new reserved range.  It must not overlap any other
/// reserved range.
pub fn reserve_range(begin: usize, size: usize) -> Result<(), &'static str> {
    if usize::MAX - begin < size {
        return Err("Address is too high.");
    }

    let mut map = RANGE_MAP.lock().unwrap();

    for (_, info) in map.range(0..=(begin + size)).rev() {
        if info.begin >= begin + size {
            continue;
        }

        if begin >= info.begin + info.size {
            break;
        }

        return Err("Reservation overlaps an existing one");
    }

    map.insert(
        begin,
        ReservedRange {
            begin,
            size,
            committed: None,
        },
    );
    Ok(())
}

/// Unregisters a fragment of a previously reserved range.  The
/// fragment must be at either end of the registered range, and must
/// not overlap the committed sub-range unless the whole reservation
/// is released at once.
pub fn release_range(begin: usize, size: usize) -> Result<(), &'static str> {
    if size > usize::MAX - begin {
        return Err("Range too large");
    }

    let reserved = predecessor(begin).ok_or("Parent range not found")?;

    if begin >= reserved.begin + reserved.size {
        return Err("Parent range too short for begin");
    }

    if begin + size > reserved.begin + reserved.size {
        return Err("Parent range too short for size");
    }

    let mut map = RANGE_MAP.lock().unwrap();

    if reserved.begin == begin && reserved.size == size {
        map.remove(&begin);
        return Ok(());
    }

    if let Some(committed) = reserved.committed {
        if !(begin >= committed.begin + committed.size || begin + size <= committed.begin) {
            return Err("Released range overlaps the committed sub-range");
        }
    }

    if reserved.begin == begin {
        map.remove(&begin);
        assert!(size < reserved.size);
        map.insert(
            begin + size,
            ReservedRange {
                begin: begin + size,
                size: reserved.size - size,
                committed: reserved.committed,
            },
        );
        return Ok(());
    }

    if reserved.begin + reserved.size == begin + size {
        let entry = map
            .get_mut(&reserved.begin)
            .ok_or("Parent range not found on second lookup")?;

        assert!(size < entry.size);
        entry.size -= size;
        return Ok(());
    }

    Err("Released range is in the middle of the reservation")
}

/// Marks a sub-range of a reservation as committed.  A reservation
/// may have at most one committed sub-range tracked at a time.
pub fn mark_committed(begin: usize, size: usize) -> Result<(), &'static str> {
    if size > usize::MAX - begin {
        return Err("Range too large");
    }

    let reserved = predecessor(begin).ok_or("Parent range not found")?;
    if begin < reserved.begin {
        return Err("Committed address too low");
    }

    if begin + size > reserved.begin + reserved.size {
        return Err("Committed address too high");
    }

    let mut map = RANGE_MAP.lock().unwrap();
    let entry = map
        .get_mut(&reserved.begin)
        .ok_or("Parent range not found on second lookup")?;

    entry.committed = Some(Range { begin, size });
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reserve_then_release() {
        reserve_range(0x1000, 0x2000).expect("reserve should succeed");
        mark_committed(0x1000, 0x1000).expect("commit should succeed");
        release_range(0x1000, 0x2000).expect("release should succeed");
    }

    #[test]
    fn overlapping_reservations_rejected() {
        reserve_range(0x10000, 0x1000).expect("first reservation should succeed");
        assert!(reserve_range(0x10000, 0x1000).is_err());
        release_range(0x10000, 0x1000).expect("release should succeed");
    }
}
