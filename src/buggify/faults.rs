//! Named fault injection sites.
//!
//! IDs are `<category>.<fault>` strings so stats group naturally when
//! sorted.

pub mod disk {
    pub const WRITE_FAIL: &str = "disk.write_fail";
    pub const PARTIAL_WRITE: &str = "disk.partial_write";
    pub const FSYNC_FAIL: &str = "disk.fsync_fail";
    pub const DISK_FULL: &str = "disk.disk_full";
    /// Segment preallocation fails (file create / set_len).
    pub const ALLOCATE_FAIL: &str = "disk.allocate_fail";
}

pub mod network {
    /// Request is lost before reaching the target broker.
    pub const PACKET_DROP: &str = "network.packet_drop";
    /// Reply is lost on the way back; the handler still ran.
    pub const RESPONSE_DROP: &str = "network.response_drop";
    pub const DELAY: &str = "network.delay";
    /// Topic publication is lost for one subscriber.
    pub const BROADCAST_DROP: &str = "network.broadcast_drop";
}

pub mod process {
    /// Partition context restarts from its last snapshot.
    pub const CRASH: &str = "process.crash";
}

/// Every fault ID, with the probability used by `FaultConfig::moderate()`.
pub const ALL_FAULTS: &[(&str, f64)] = &[
    (disk::WRITE_FAIL, 0.01),
    (disk::PARTIAL_WRITE, 0.005),
    (disk::FSYNC_FAIL, 0.005),
    (disk::DISK_FULL, 0.001),
    (disk::ALLOCATE_FAIL, 0.001),
    (network::PACKET_DROP, 0.01),
    (network::RESPONSE_DROP, 0.01),
    (network::DELAY, 0.05),
    (network::BROADCAST_DROP, 0.01),
    (process::CRASH, 0.001),
];
