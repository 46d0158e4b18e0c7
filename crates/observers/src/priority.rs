//! Drive priority for the replicator assignment queue.

use drivenet_types::{DriveEntry, PriorityQueueEntry};

/// Need score of a drive; under-served drives rank above merely short ones.
///
/// With `R` staying replicators, `N` ordered replicators and `Rmin` the
/// minimum count: `(R + 1) / Rmin` while `R < Rmin`, otherwise
/// `(N - R) / (2 * Rmin * (N - Rmin))`.
pub fn drive_priority(drive: &DriveEntry, min_replicator_count: u16) -> f64 {
    let rmin = min_replicator_count.max(1) as f64;
    let ordered = drive.replicator_count as f64;
    let staying = drive
        .replicators
        .len()
        .saturating_sub(drive.offboarding_replicators.len()) as f64;

    if staying < rmin {
        return (staying + 1.0) / rmin;
    }
    let denominator = 2.0 * rmin * (ordered - rmin);
    if denominator <= 0.0 {
        return 0.0;
    }
    ((ordered - staying) / denominator).max(0.0)
}

/// Queue the drive with its current priority while it is short of replicators.
pub fn update_drive_priority(
    queue: &mut PriorityQueueEntry,
    drive: &DriveEntry,
    min_replicator_count: u16,
) {
    if drive.missing_replicators() > 0 {
        queue.set(drive.key, drive_priority(drive, min_replicator_count));
    } else {
        queue.remove(&drive.key);
    }
}
