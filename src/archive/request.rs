use std::collections::{BTreeMap, BTreeSet};

use super::{split_part_name, AddressMode, ArchiveAddress, PhysicalKey};

/// How the addresses of a request map onto the remote object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Direct,
    Split { parts: u32 },
    /// Distinct entries requested from the container
    Container { entries: BTreeSet<String> },
}

/// All requested addresses served by one remote object
#[derive(Clone, Debug)]
pub struct ObjectRequest {
    pub key: PhysicalKey,
    pub kind: RequestKind,
    pub addresses: Vec<ArchiveAddress>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum GroupMode {
    Direct,
    Split(u32),
    Container,
}

impl ObjectRequest {
    /// Remote paths of the object (all parts for split files).
    pub fn remote_paths(&self) -> Vec<String> {
        match &self.kind {
            RequestKind::Split { parts } => (0..*parts as usize)
                .map(|index| {
                    super::remote_path(&self.key.node, &split_part_name(&self.key.file_name, index))
                })
                .collect(),
            _ => vec![self.key.remote_path()],
        }
    }
}

/// Group addresses by the remote object they need.
///
/// Entries of the same container end up in one request, so the container
/// is only transferred once. Duplicate addresses are kept, each gets its
/// own result.
pub fn group_addresses(addresses: &[ArchiveAddress]) -> Vec<ObjectRequest> {
    let mut groups: BTreeMap<(PhysicalKey, GroupMode), ObjectRequest> = BTreeMap::new();

    for address in addresses {
        let mode = match &address.mode {
            AddressMode::Direct => GroupMode::Direct,
            AddressMode::Split { parts } => GroupMode::Split(*parts),
            AddressMode::Container { .. } => GroupMode::Container,
        };

        let request = groups
            .entry((address.physical_key(), mode))
            .or_insert_with(|| ObjectRequest {
                key: address.physical_key(),
                kind: match mode {
                    GroupMode::Direct => RequestKind::Direct,
                    GroupMode::Split(parts) => RequestKind::Split { parts },
                    GroupMode::Container => RequestKind::Container {
                        entries: BTreeSet::new(),
                    },
                },
                addresses: Vec::new(),
            });

        if let (RequestKind::Container { entries }, AddressMode::Container { entry }) =
            (&mut request.kind, &address.mode)
        {
            entries.insert(entry.clone());
        }
        request.addresses.push(address.clone());
    }

    groups.into_values().collect()
}
