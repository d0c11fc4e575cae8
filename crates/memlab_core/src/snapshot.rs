//! Storage groups and report snapshots

use crate::{BufferId, NamedTensor};
use memlab_env::{DeviceId, DeviceMemory};
use std::collections::HashMap;

/// One logical tensor aliasing a group's buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMember {
    pub name: String,
    pub shape: Vec<usize>,
    pub structural: bool,
}

/// One physical buffer and every name that aliases it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageGroup {
    buffer: BufferId,
    device: DeviceId,
    bytes: u64,
    members: Vec<GroupMember>,
}

impl StorageGroup {
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// The member the group is reported under.
    pub fn primary(&self) -> &GroupMember {
        &self.members[0]
    }

    pub fn aliases(&self) -> &[GroupMember] {
        &self.members[1..]
    }

    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }
}

/// Per-device totals of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceTotals {
    pub device: DeviceId,
    /// Logical tensors, aliases included.
    pub tensors: usize,
    /// Bytes of distinct buffers.
    pub bytes: u64,
    /// What the allocator reported, `None` if it could not be queried.
    pub allocated: Option<u64>,
}

/// The result of one traversal.
#[derive(Clone, Debug, Default)]
pub struct ReportSnapshot {
    groups: Vec<StorageGroup>,
    devices: Vec<DeviceTotals>,
    unresolved: usize,
}

impl ReportSnapshot {
    /// Groups ordered by device, then by discovery.
    pub fn groups(&self) -> &[StorageGroup] {
        &self.groups
    }

    pub fn group(&self, buffer: BufferId) -> Option<&StorageGroup> {
        self.groups.iter().find(|g| g.buffer == buffer)
    }

    pub fn devices(&self) -> &[DeviceTotals] {
        &self.devices
    }

    pub fn device(&self, device: DeviceId) -> Option<&DeviceTotals> {
        self.devices.iter().find(|d| d.device == device)
    }

    pub fn tensor_count(&self) -> usize {
        self.groups.iter().map(|g| g.members.len()).sum()
    }

    /// Each buffer counted once.
    pub fn total_bytes(&self) -> u64 {
        self.groups.iter().map(|g| g.bytes).sum()
    }

    /// Tensor-like objects whose buffer could not be resolved.
    pub fn unresolved(&self) -> usize {
        self.unresolved
    }

    /// Bucket tensors by buffer identity. The first member of a group is
    /// the first one in `tensors`, so callers pass structural finds first.
    pub(crate) fn build(tensors: Vec<NamedTensor>, memory: &dyn DeviceMemory) -> Self {
        let mut groups: Vec<StorageGroup> = Vec::new();
        let mut index: HashMap<BufferId, usize> = HashMap::new();
        let mut unresolved = 0;

        for found in tensors {
            let Some(buffer) = found.tensor.buffer_id() else {
                tracing::warn!(name = %found.name, "skipping tensor with unresolvable buffer");
                unresolved += 1;
                continue;
            };
            let member = GroupMember {
                name: found.name,
                shape: found.tensor.shape(),
                structural: found.structural,
            };
            match index.get(&buffer) {
                Some(&i) => groups[i].members.push(member),
                None => {
                    index.insert(buffer, groups.len());
                    groups.push(StorageGroup {
                        buffer,
                        device: found.tensor.device(),
                        bytes: found.tensor.byte_size(),
                        members: vec![member],
                    });
                }
            }
        }

        // stable: discovery order is kept within a device
        groups.sort_by_key(|g| g.device);

        let mut devices: Vec<DeviceTotals> = Vec::new();
        for group in &groups {
            match devices.last_mut() {
                Some(totals) if totals.device == group.device => {
                    totals.tensors += group.members.len();
                    totals.bytes += group.bytes;
                }
                _ => devices.push(DeviceTotals {
                    device: group.device,
                    tensors: group.members.len(),
                    bytes: group.bytes,
                    allocated: None,
                }),
            }
        }
        // The active device is always reported, tensors or not.
        if let Ok(current) = memory.current_device() {
            if !devices.iter().any(|d| d.device == current) {
                devices.push(DeviceTotals {
                    device: current,
                    tensors: 0,
                    bytes: 0,
                    allocated: None,
                });
                devices.sort_by_key(|d| d.device);
            }
        }
        for totals in &mut devices {
            totals.allocated = match memory.allocated_bytes(totals.device) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    tracing::warn!(device = %totals.device, %err, "allocator query failed");
                    None
                }
            };
        }

        tracing::debug!(groups = groups.len(), unresolved, "snapshot built");
        Self {
            groups,
            devices,
            unresolved,
        }
    }
}
