//! Static partition planning.
//!
//! Documents are striped round-robin over partitions by their absolute (1-based)
//! position in a full scan: partition `p` of `n` owns indices `p, p + n, p + 2n, ...`.
//! Striping means a partition never needs another partition's boundaries to
//! resume; every partition walks the whole result set and keeps only its own
//! stripe.
//!
//! All functions here are pure and take 1-based partition identities.

/// Number of documents partition `partition` is expected to process when the
/// collection holds `total` matching documents split `workers` ways.
///
/// The first `total % workers` partitions receive one extra document.
///
/// # Panics
///
/// Panics if `workers == 0` or `partition` is outside `1..=workers`.
#[must_use]
pub fn expected_count(partition: usize, total: u64, workers: usize) -> u64 {
    assert_partition(partition, workers);
    let n = workers as u64;
    let base = total / n;
    let remainder = total % n;
    if (partition as u64) <= remainder {
        base + 1
    } else {
        base
    }
}

/// Whether the document at `absolute_index` (1-based) is owned by `partition`.
///
/// Index `0` means "nothing scanned yet" and belongs to no partition.
///
/// # Panics
///
/// Panics if `workers == 0` or `partition` is outside `1..=workers`.
#[must_use]
pub fn belongs_to(partition: usize, absolute_index: u64, workers: usize) -> bool {
    assert_partition(partition, workers);
    if absolute_index == 0 {
        return false;
    }
    (absolute_index - 1) % (workers as u64) + 1 == partition as u64
}

/// The partition that owns `absolute_index`.
///
/// # Panics
///
/// Panics if `workers == 0` or `absolute_index == 0`.
#[must_use]
pub fn owner_of(absolute_index: u64, workers: usize) -> usize {
    assert!(workers > 0, "worker count must be at least 1");
    assert!(absolute_index > 0, "absolute indices are 1-based");
    ((absolute_index - 1) % workers as u64) as usize + 1
}

/// Iterator over the absolute indices in `1..=total` owned by `partition`.
pub fn owned_indices(partition: usize, total: u64, workers: usize) -> impl Iterator<Item = u64> {
    assert_partition(partition, workers);
    (partition as u64..=total).step_by(workers)
}

fn assert_partition(partition: usize, workers: usize) {
    assert!(workers > 0, "worker count must be at least 1");
    assert!(
        (1..=workers).contains(&partition),
        "partition {partition} outside 1..={workers}"
    );
}
