use serde::{Deserialize, Serialize};

use crate::inventory::{Network, NetworkVariant};

/// Identifies a source object by id, or by name when no id is given.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct SourceRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl SourceRef {
    pub fn matches(&self, id: &str, name: &str) -> bool {
        match (&self.id, &self.name) {
            (Some(want), _) => want == id,
            (None, Some(want)) => want == name,
            (None, None) => false,
        }
    }

    /// Port groups and opaque networks also match on their key
    pub fn matches_network(&self, network: &Network) -> bool {
        let keyed = matches!(
            network.variant,
            NetworkVariant::DvPortGroup | NetworkVariant::Opaque
        );

        match &self.id {
            Some(want) if keyed && !network.key.is_empty() && want == &network.key => true,
            _ => self.matches(&network.id, &network.name),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DestinationNetwork {
    /// The destination's default pod network
    Pod,
    /// A secondary network attachment
    Multus { namespace: String, name: String },
    /// NICs on the source network are dropped
    Ignored,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NetworkPair {
    pub source: SourceRef,
    pub destination: DestinationNetwork,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageDestination {
    pub storage_class: String,
    #[serde(default)]
    pub access_mode: Option<String>,
    #[serde(default)]
    pub volume_mode: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoragePair {
    pub source: SourceRef,
    pub destination: StorageDestination,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_networks_match_by_key() {
        let net = Network {
            id: "network-o-1".into(),
            key: "c6e6a8c5-opaque".into(),
            variant: NetworkVariant::Opaque,
            ..Default::default()
        };
        let by_key = SourceRef {
            id: Some("c6e6a8c5-opaque".into()),
            name: None,
        };
        let by_id = SourceRef {
            id: Some("network-o-1".into()),
            name: None,
        };
        let nothing = SourceRef::default();

        assert!(by_key.matches_network(&net));
        assert!(by_id.matches_network(&net));
        assert!(!nothing.matches_network(&net));
    }

    #[test]
    fn id_wins_over_name() {
        let r = SourceRef {
            id: Some("datastore-1".into()),
            name: Some("ds-a".into()),
        };
        assert!(r.matches("datastore-1", "other"));
        assert!(!r.matches("datastore-2", "ds-a"));
    }
}
