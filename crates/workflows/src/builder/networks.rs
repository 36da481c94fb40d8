// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::collections::HashSet;

use dal::Readable;
use models::{
    inventory::{Inventory, Network, Nic, Page, QueryError, Vm},
    plan::{DestinationNetwork, Plan},
};

use super::{
    Attachment, Binding, BuildError, Builder, Interface, NetworkAttachment, VIRTIO,
};
use crate::destination::TargetVm;

/// The inventory network a NIC backing or VM network ref points at.
///
/// Port group backings carry the port group key rather than the object id,
/// so a miss by id falls back to a search by key.
pub fn network_by_id<R: Readable>(inv: &Inventory<'_, R>, id: &str) -> Result<Network, QueryError> {
    match inv.get_as::<Network>(id) {
        Err(e) if e.is_not_found() => {
            let id = id.to_owned();
            inv.list(move |n: &Network| n.key == id, Page::default())
                .next()
                .ok_or(e)
        }
        other => other,
    }
}

pub fn nic_network<R: Readable>(inv: &Inventory<'_, R>, nic: &Nic) -> Result<Network, QueryError> {
    network_by_id(inv, &nic.network.id)
}

/// NICs of `vm` that would land on the pod network
pub fn pod_nics<R: Readable>(
    plan: &Plan,
    inv: &Inventory<'_, R>,
    vm: &Vm,
) -> Result<Vec<Nic>, QueryError> {
    let mut out = Vec::new();
    for nic in &vm.nics {
        let network = nic_network(inv, nic)?;
        if let Some(pair) = plan.network_pair(&network) {
            if pair.destination == DestinationNetwork::Pod {
                out.push(nic.clone());
            }
        }
    }
    Ok(out)
}

/// Destination VMs, as `namespace/name`, already using one of `vm`'s MACs.
///
/// The VM at `own_namespace/own_name` is the one this migration creates and
/// never conflicts with itself.
pub fn mac_conflicts(
    vm: &Vm,
    destination: &[TargetVm],
    own_namespace: &str,
    own_name: &str,
) -> Vec<String> {
    let macs: HashSet<String> = vm.nics.iter().map(|n| n.mac.to_lowercase()).collect();

    destination
        .iter()
        .filter(|t| !(t.namespace == own_namespace && t.name == own_name))
        .filter(|t| t.macs.iter().any(|m| macs.contains(&m.to_lowercase())))
        .map(TargetVm::path)
        .collect()
}

impl<'a, R: Readable> Builder<'a, R> {
    /// Interfaces and their attachments, in the order the NICs were collected
    pub(super) fn map_networks(
        &self,
        vm: &Vm,
    ) -> Result<(Vec<Interface>, Vec<NetworkAttachment>), BuildError> {
        let mut interfaces = Vec::new();
        let mut networks = Vec::new();

        for nic in &vm.nics {
            let network = nic_network(&self.inventory, nic)?;
            let pair = self
                .plan
                .network_pair(&network)
                .ok_or_else(|| BuildError::NetworkUnmapped(network.name.clone()))?;

            let (binding, attachment) = match &pair.destination {
                DestinationNetwork::Ignored => continue,
                DestinationNetwork::Pod => (Binding::Masquerade, Attachment::Pod),
                DestinationNetwork::Multus { namespace, name } => (
                    Binding::Bridge,
                    Attachment::Multus {
                        network_name: format!("{namespace}/{name}"),
                    },
                ),
            };

            let name = format!("net-{}", interfaces.len());
            interfaces.push(Interface {
                name: name.clone(),
                mac_address: nic.mac.clone(),
                model: VIRTIO.to_owned(),
                binding,
            });
            networks.push(NetworkAttachment { name, attachment });
        }

        Ok((interfaces, networks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::ConversionConfig;
    use models::inventory::{Kind, NetworkVariant, Ref};
    use models::plan::{NetworkPair, SourceRef};
    use pretty_assertions::assert_eq;
    use testing_utils::fixtures;

    fn target(ns: &str, name: &str, macs: &[&str]) -> TargetVm {
        TargetVm {
            namespace: ns.into(),
            name: name.into(),
            macs: macs.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn conflicts_ignore_case_and_the_own_target() {
        let vm = Vm {
            nics: vec![Nic {
                mac: "00:50:56:AB:CD:EF".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let dest = vec![
            target("ns", "self", &["00:50:56:ab:cd:ef"]),
            target("ns", "other", &["00:50:56:ab:cd:ef"]),
            target("other-ns", "self", &["00:50:56:AB:CD:EF"]),
            target("ns", "clean", &["00:50:56:00:00:01"]),
        ];

        assert_eq!(mac_conflicts(&vm, &dest, "ns", "self"), vec!["ns/other", "other-ns/self"]);
    }

    #[tokio::test]
    async fn ignored_networks_are_dropped_and_multus_is_bridged() {
        let mut f = fixtures::s1();
        let pod = f.vm.nics[0].network.clone();
        let second = fixtures::network("network-9", "backend");
        f.extra_networks.push(second);
        f.vm.nics = vec![
            Nic { mac: "00:00:00:00:00:01".into(), network: pod, index: 0 },
            Nic { mac: "00:00:00:00:00:02".into(), network: Ref::new(Kind::Network, "network-9"), index: 1 },
        ];
        f.plan.network_map.push(NetworkPair {
            source: SourceRef { id: Some("network-9".into()), name: None },
            destination: DestinationNetwork::Multus { namespace: "net".into(), name: "backend".into() },
        });

        let store = f.store().await;
        let view = store.snapshot();
        let conversion = ConversionConfig::default();
        let builder = Builder::new(&f.plan, &f.provider, "", &view, &conversion, false);

        let (ifaces, nets) = builder.map_networks(&f.vm).unwrap();
        assert_eq!(ifaces[1].binding, Binding::Bridge);
        assert_eq!(
            nets[1],
            NetworkAttachment {
                name: "net-1".into(),
                attachment: Attachment::Multus { network_name: "net/backend".into() }
            }
        );

        f.plan.network_map[0].destination = DestinationNetwork::Ignored;
        let builder = Builder::new(&f.plan, &f.provider, "", &view, &conversion, false);
        let (ifaces, nets) = builder.map_networks(&f.vm).unwrap();
        assert_eq!(ifaces.len(), 1);
        assert_eq!(ifaces[0].name, "net-0");
        assert_eq!(ifaces[0].mac_address, "00:00:00:00:00:02");
        assert_eq!(nets[0].name, "net-0");
    }

    #[tokio::test]
    async fn unmapped_network_is_an_error() {
        let mut f = fixtures::s1();
        f.plan.network_map.clear();
        let store = f.store().await;
        let view = store.snapshot();
        let conversion = ConversionConfig::default();
        let builder = Builder::new(&f.plan, &f.provider, "", &view, &conversion, false);

        let err = builder.map_networks(&f.vm).unwrap_err();
        assert_eq!(err.reason(), "NetworkNotMapped");
    }

    #[tokio::test]
    async fn port_group_backings_resolve_by_key() {
        let mut f = fixtures::s1();
        let mut pg = fixtures::network("dvportgroup-20", "dvpg");
        pg.variant = NetworkVariant::DvPortGroup;
        pg.key = "dvportgroup-20-key".into();
        f.extra_networks.push(pg);

        let store = f.store().await;
        let view = store.snapshot();
        let inv = Inventory::new(&view);
        let nic = Nic {
            network: Ref::new(Kind::Network, "dvportgroup-20-key"),
            ..Default::default()
        };
        assert_eq!(nic_network(&inv, &nic).unwrap().id, "dvportgroup-20");
    }

    #[tokio::test]
    async fn pod_nics_counts_pod_mapped_nics_only() {
        let mut f = fixtures::s1();
        let pod = f.vm.nics[0].network.clone();
        f.vm.nics = fixtures::nics(&["00:00:00:00:00:01", "00:00:00:00:00:02"], &pod);
        let store = f.store().await;
        let view = store.snapshot();
        let inv = Inventory::new(&view);

        assert_eq!(pod_nics(&f.plan, &inv, &f.vm).unwrap().len(), 2);
    }
}
