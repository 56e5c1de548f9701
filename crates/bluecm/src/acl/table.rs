//! ACL connection record table.
//!
//! One slot per peer device, fixed capacity, indexed by linear scan over
//! the device address. The zero address marks a free slot. Capacity is
//! product configuration; the object count never justifies an index
//! structure.

use bitflags::bitflags;

use crate::error::{CmError, CmResult};
use crate::types::{AddressType, BdAddr, ClassOfDevice, EncryptionType, LinkMode, Role};

/// Number of simultaneous ACL connections supported.
pub const NUM_ACL_CONNECTIONS: usize = 3;

/// Default link-supervision timeout in baseband slots (20 s).
pub const DEFAULT_LSTO: u16 = 0x7D00;

/// Sentinel for an LMP version that has not been read yet.
pub const INVALID_LMP_VERSION: u8 = 0xFF;

/// Default flush timeout: no automatic flush.
pub const DEFAULT_FLUSH_TIMEOUT: u16 = 0xFFFF;

/// Default QoS latency in microseconds.
const DEFAULT_QOS_LATENCY: u32 = 0x0000_61A8;

bitflags! {
    /// Types of logical channels currently multiplexed on a link.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LogicalChannelMask: u8 {
        const CONTROL = 0x01;
        const DATA = 0x02;
        const STREAM = 0x04;
    }
}

/// HCI quality-of-service parameters for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosSettings {
    pub service_type: u8,
    pub token_rate: u32,
    pub peak_bandwidth: u32,
    pub latency: u32,
    pub delay_variation: u32,
}

impl Default for QosSettings {
    fn default() -> Self {
        Self {
            service_type: 0, // no traffic
            token_rate: 0,
            peak_bandwidth: 0,
            latency: DEFAULT_QOS_LATENCY,
            delay_variation: 0xFFFF_FFFF,
        }
    }
}

/// Per-peer ACL state. The record persists across many link instances;
/// `clear` returns the slot to the pool.
#[derive(Debug, Clone)]
pub struct AclRecord {
    pub addr: BdAddr,
    pub address_type: AddressType,
    pub incoming: bool,
    pub role: Role,
    pub class_of_device: ClassOfDevice,

    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
    pub remote_features: [u8; 8],
    pub remote_features_valid: bool,
    pub role_checked: bool,

    pub mode: LinkMode,
    pub sniff_interval: u16,
    pub encryption: EncryptionType,
    pub lsto: u16,

    /// Stakeholder accounting: an application holds the link open.
    pub requested_by_app: bool,
    /// Stakeholder accounting: a GATT connection is active on the link.
    pub gatt_active: bool,
    pub logical_channels: LogicalChannelMask,
    pub guaranteed_channels: u8,

    pub flush_timeout: u16,
    pub qos: QosSettings,

    /// L2CAP extended-features cache. `None` means never queried, which is
    /// distinct from `Some(0)` (queried, peer advertises none).
    pub extended_features: Option<u32>,

    pub link_policy: u16,
}

impl Default for AclRecord {
    fn default() -> Self {
        Self {
            addr: BdAddr::ZERO,
            address_type: AddressType::Public,
            incoming: false,
            role: Role::Master,
            class_of_device: 0,
            lmp_version: INVALID_LMP_VERSION,
            manufacturer: 0,
            lmp_subversion: 0,
            // Assume everything is supported until the real bitmap arrives.
            remote_features: [0xFF; 8],
            remote_features_valid: false,
            role_checked: false,
            mode: LinkMode::Active,
            sniff_interval: 0,
            encryption: EncryptionType::None,
            lsto: DEFAULT_LSTO,
            requested_by_app: false,
            gatt_active: false,
            logical_channels: LogicalChannelMask::empty(),
            guaranteed_channels: 0,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            qos: QosSettings::default(),
            extended_features: None,
            link_policy: 0,
        }
    }
}

impl AclRecord {
    pub fn is_free(&self) -> bool {
        self.addr.is_zero()
    }

    /// Seeds the slot for a freshly opened link to `addr`.
    pub fn init_for(&mut self, addr: BdAddr, incoming: bool, class_of_device: ClassOfDevice) {
        *self = AclRecord::default();
        self.addr = addr;
        self.incoming = incoming;
        self.class_of_device = class_of_device;
        self.role = if incoming { Role::Slave } else { Role::Master };
    }

    /// Returns the slot to the pool. Reusable only once the address is
    /// zeroed and stakeholder counts are gone, which this does atomically.
    pub fn clear(&mut self) {
        *self = AclRecord::default();
    }

    /// Number of stakeholder contributions held directly on the record.
    pub fn stakeholders(&self) -> u8 {
        u8::from(self.requested_by_app) + u8::from(self.gatt_active)
    }
}

/// The fixed-capacity ACL table. All lookups are linear scans.
#[derive(Debug, Default)]
pub struct AclTable {
    slots: [AclRecord; NUM_ACL_CONNECTIONS],
}

impl AclTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, addr: &BdAddr) -> Option<&AclRecord> {
        if addr.is_zero() {
            return None;
        }
        self.slots.iter().find(|s| s.addr == *addr)
    }

    pub fn find_mut(&mut self, addr: &BdAddr) -> Option<&mut AclRecord> {
        if addr.is_zero() {
            return None;
        }
        self.slots.iter_mut().find(|s| s.addr == *addr)
    }

    pub fn find_or_fail(&self, addr: &BdAddr) -> CmResult<&AclRecord> {
        self.find(addr).ok_or(CmError::UnknownConnection)
    }

    /// Claims the next free slot, if any. The caller seeds it.
    pub fn allocate(&mut self) -> Option<&mut AclRecord> {
        self.slots.iter_mut().find(|s| s.is_free())
    }

    /// Zeroes the slot for `addr`, returning whether one was occupied.
    pub fn clear(&mut self, addr: &BdAddr) -> bool {
        if let Some(slot) = self.find_mut(addr) {
            slot.clear();
            true
        } else {
            false
        }
    }

    pub fn count_active(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }

    pub fn is_full(&self) -> bool {
        self.count_active() == NUM_ACL_CONNECTIONS
    }

    pub fn iter(&self) -> impl Iterator<Item = &AclRecord> {
        self.slots.iter().filter(|s| !s.is_free())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AclRecord> {
        self.slots.iter_mut().filter(|s| !s.is_free())
    }
}
