//! A single vCenter with one datacenter, one cluster, one host and the
//! cold EFI VM most builder and orchestrator tests start from.
//!
//! Tests tweak the public fields and then call [`Fixture::store`] to get a
//! store seeded with exactly what the fixture holds.

use std::sync::Arc;

use config::SdkEndpoint;
use dal::{NewRow, Store};
use models::{
    inventory::{
        Bus, Cluster, ClusterVariant, Controller, Datacenter, Datastore, Disk, Firmware, Folder,
        Host, Kind, Network, Nic, Ref, Vm,
    },
    plan::{
        DestinationNetwork, NetworkPair, Plan, PlanVm, SourceRef, StorageDestination, StoragePair,
    },
    provider::{Credentials, Provider},
};

pub const HOST_THUMBPRINT: &str = "7E:9D:1A:0C:33:5B:52:46:81:F2:0A:5C:14:2D:D0:77:8E:1B:4F:E3";
pub const VM_ID: &str = "vm-16";
pub const VM_UUID: &str = "422c6a2a-5ea9-1083-39f3-3b140fffb444";
pub const HOST_ID: &str = "host-20";
pub const DATASTORE_ID: &str = "datastore-11";
pub const NETWORK_ID: &str = "network-7";
pub const GIB: i64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Fixture {
    pub plan: Plan,
    pub provider: Provider,
    pub vm: Vm,
    pub host: Host,
    pub cluster: Cluster,
    pub datacenter: Datacenter,
    pub folders: Vec<Folder>,
    pub datastore: Datastore,
    pub network: Network,
    /// Networks beyond the one the fixture VM is attached to
    pub extra_networks: Vec<Network>,
    /// VMs beyond the fixture VM
    pub extra_vms: Vec<Vm>,
}

impl Fixture {
    /// A fresh store holding every record of the fixture
    pub async fn store(&self) -> Arc<Store> {
        let store = Store::new();
        let mut t = store.easy_transaction().await;

        for f in &self.folders {
            NewRow::new(f.clone()).insert(&mut t).expect("insert folder");
        }
        NewRow::new(self.datacenter.clone()).insert(&mut t).expect("insert datacenter");
        NewRow::new(self.cluster.clone()).insert(&mut t).expect("insert cluster");
        NewRow::new(self.host.clone()).insert(&mut t).expect("insert host");
        NewRow::new(self.datastore.clone()).insert(&mut t).expect("insert datastore");
        NewRow::new(self.network.clone()).insert(&mut t).expect("insert network");
        for n in &self.extra_networks {
            NewRow::new(n.clone()).insert(&mut t).expect("insert network");
        }
        NewRow::new(self.vm.clone()).insert(&mut t).expect("insert vm");
        for vm in &self.extra_vms {
            NewRow::new(vm.clone()).insert(&mut t).expect("insert vm");
        }

        t.commit().expect("commit fixture");
        Arc::new(store)
    }
}

fn folder(id: &str, name: &str, parent: Option<Ref>) -> Folder {
    Folder {
        id: id.to_owned(),
        name: name.to_owned(),
        parent,
        ..Default::default()
    }
}

pub fn network(id: &str, name: &str) -> Network {
    Network {
        id: id.to_owned(),
        name: name.to_owned(),
        parent: Some(Ref::new(Kind::Folder, "group-n5")),
        ..Default::default()
    }
}

/// NICs in order, all on `network`
pub fn nics(macs: &[&str], network: &Ref) -> Vec<Nic> {
    macs.iter()
        .enumerate()
        .map(|(index, mac)| Nic {
            mac: (*mac).to_owned(),
            network: network.clone(),
            index,
        })
        .collect()
}

/// Cold migration of one EFI VM with a single 20 GiB disk and one pod NIC
pub fn s1() -> Fixture {
    let root = Ref::new(Kind::Folder, "group-d1");
    let dc = Ref::new(Kind::Datacenter, "datacenter-2");
    let host_folder = Ref::new(Kind::Folder, "group-h4");
    let cluster = Ref::new(Kind::Cluster, "domain-c8");
    let host = Ref::new(Kind::Host, HOST_ID);
    let datastore = Ref::new(Kind::Datastore, DATASTORE_ID);
    let net = Ref::new(Kind::Network, NETWORK_ID);

    let folders = vec![
        folder("group-d1", "Datacenters", None),
        folder("group-h4", "host", Some(dc.clone())),
        folder("group-v3", "vm", Some(dc.clone())),
        folder("group-n5", "network", Some(dc.clone())),
        folder("group-s6", "datastore", Some(dc.clone())),
    ];

    let datacenter = Datacenter {
        id: dc.id.clone(),
        name: "DC0".into(),
        parent: Some(root),
        vms: Some(Ref::new(Kind::Folder, "group-v3")),
        clusters: Some(host_folder.clone()),
        networks: Some(Ref::new(Kind::Folder, "group-n5")),
        datastores: Some(Ref::new(Kind::Folder, "group-s6")),
        ..Default::default()
    };

    let cluster_rec = Cluster {
        id: cluster.id.clone(),
        name: "cluster0".into(),
        parent: Some(host_folder),
        variant: ClusterVariant::Cluster,
        hosts: vec![host.clone()],
        networks: vec![net.clone()],
        datastores: vec![datastore.clone()],
        ..Default::default()
    };

    let host_rec = Host {
        id: host.id.clone(),
        name: "host.example.com".into(),
        parent: Some(cluster),
        status: "green".into(),
        thumbprint: HOST_THUMBPRINT.into(),
        product_name: "VMware ESXi".into(),
        product_version: "7.0.3".into(),
        timezone: "UTC".into(),
        networks: vec![net.clone()],
        datastores: vec![datastore.clone()],
        vms: vec![Ref::new(Kind::Vm, VM_ID)],
        ..Default::default()
    };

    let datastore_rec = Datastore {
        id: datastore.id.clone(),
        name: "ds1".into(),
        parent: Some(Ref::new(Kind::Folder, "group-s6")),
        datastore_type: "VMFS".into(),
        capacity: 500 * GIB,
        free: 300 * GIB,
        maintenance_mode: "normal".into(),
        hosts: vec![host.clone()],
        ..Default::default()
    };

    let vm = Vm {
        id: VM_ID.into(),
        name: "test-vm".into(),
        parent: Some(Ref::new(Kind::Folder, "group-v3")),
        uuid: VM_UUID.into(),
        firmware: Firmware::Efi,
        power_state: "poweredOn".into(),
        connection_state: "connected".into(),
        guest_id: "rhel8_64Guest".into(),
        guest_name: "Red Hat Enterprise Linux 8 (64-bit)".into(),
        cpu_count: 4,
        cores_per_socket: 2,
        memory_mb: 4096,
        change_tracking_enabled: true,
        host: Some(host),
        networks: vec![net.clone()],
        controllers: vec![Controller {
            key: 1000,
            bus: Bus::Scsi,
            bus_number: 0,
        }],
        nics: nics(&["00:50:56:83:25:47"], &net),
        disks: vec![Disk {
            key: 2000,
            file: "[ds1] vm/disk1.vmdk".into(),
            capacity: 20 * GIB,
            datastore,
            bus: Bus::Scsi,
            controller_key: 1000,
            unit_number: 0,
            mode: "persistent".into(),
            change_tracking_enabled: true,
            ..Default::default()
        }],
        ..Default::default()
    };

    let plan = Plan {
        id: "plan-1".into(),
        name: "wave-1".into(),
        target_namespace: "migrated".into(),
        vms: vec![PlanVm {
            id: Some(VM_ID.into()),
            ..Default::default()
        }],
        network_map: vec![NetworkPair {
            source: SourceRef {
                id: Some(NETWORK_ID.into()),
                name: None,
            },
            destination: DestinationNetwork::Pod,
        }],
        storage_map: vec![StoragePair {
            source: SourceRef {
                id: Some(DATASTORE_ID.into()),
                name: None,
            },
            destination: StorageDestination {
                storage_class: "standard".into(),
                ..Default::default()
            },
        }],
        migrate_shared_disks: true,
        ..Default::default()
    };

    let provider = Provider {
        name: "vcenter".into(),
        url: "https://vcenter.example.com/sdk".into(),
        sdk_endpoint: SdkEndpoint::VCenter,
        credentials: Credentials {
            user: "administrator@vsphere.local".into(),
            password: "Passw0rd!".into(),
            ..Default::default()
        },
        vddk_image: None,
    };

    Fixture {
        plan,
        provider,
        vm,
        host: host_rec,
        cluster: cluster_rec,
        datacenter,
        folders,
        datastore: datastore_rec,
        network: network(NETWORK_ID, "VM Network"),
        extra_networks: Vec::new(),
        extra_vms: Vec::new(),
    }
}

/// The S1 VM as a warm migration with two CBT enabled disks
pub fn s2() -> Fixture {
    let mut f = s1();
    f.plan.warm = true;
    let mut second = f.vm.disks[0].clone();
    second.key = 2001;
    second.file = "[ds1] vm/disk2.vmdk".into();
    second.unit_number = 1;
    second.capacity = 10 * GIB;
    f.vm.disks.push(second);
    f
}
