// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Per-VM migration concerns, recomputed by the collector whenever a VM changes.

use models::inventory::{Concern, Severity, Vm};

struct Rule {
    id: &'static str,
    category: Severity,
    label: &'static str,
    /// Returns the assessment when the rule applies
    check: fn(&Vm) -> Option<String>,
}

const RULES: &[Rule] = &[
    Rule {
        id: "vmware.changeTracking.disabled",
        category: Severity::Warning,
        label: "Changed Block Tracking (CBT) not enabled",
        check: |vm| {
            (!vm.change_tracking_enabled)
                .then(|| "Warm migration needs CBT enabled on every disk of the VM.".to_owned())
        },
    },
    Rule {
        id: "vmware.disk.rdm",
        category: Severity::Critical,
        label: "Raw Device Mapped disk detected",
        check: |vm| {
            let rdm: Vec<_> = vm.disks.iter().filter(|d| d.rdm).map(|d| d.file.as_str()).collect();
            (!rdm.is_empty()).then(|| format!("RDM disks are not migrated: {}", rdm.join(", ")))
        },
    },
    Rule {
        id: "vmware.disk.shared",
        category: Severity::Warning,
        label: "Shared disk detected",
        check: |vm| {
            vm.has_shared_disks().then(|| {
                "Shared disks are transferred once; other VMs using them must be migrated with shared disks skipped."
                    .to_owned()
            })
        },
    },
    Rule {
        id: "vmware.device.passthrough",
        category: Severity::Critical,
        label: "Passthrough device detected",
        check: |vm| {
            let found: Vec<_> = vm
                .devices
                .iter()
                .filter(|d| d.as_str() == "VirtualPCIPassthrough" || d.as_str() == "VirtualSCSIPassthrough")
                .map(String::as_str)
                .collect();
            (!found.is_empty()).then(|| format!("Passthrough devices are not carried over: {}", found.join(", ")))
        },
    },
    Rule {
        id: "vmware.device.sriov",
        category: Severity::Warning,
        label: "SR-IOV interface detected",
        check: |vm| {
            vm.devices
                .iter()
                .any(|d| d == "VirtualSriovEthernetCard")
                .then(|| "SR-IOV interfaces are recreated as regular interfaces.".to_owned())
        },
    },
    Rule {
        id: "vmware.device.usb",
        category: Severity::Advisory,
        label: "USB device detected",
        check: |vm| {
            vm.devices
                .iter()
                .any(|d| d.starts_with("VirtualUSB"))
                .then(|| "USB controllers and devices are not carried over.".to_owned())
        },
    },
    Rule {
        id: "vmware.faultTolerance.enabled",
        category: Severity::Warning,
        label: "Fault tolerance enabled",
        check: |vm| {
            vm.fault_tolerance
                .then(|| "Fault tolerance has no equivalent on the destination.".to_owned())
        },
    },
    Rule {
        id: "vmware.cpuAffinity.set",
        category: Severity::Warning,
        label: "CPU affinity detected",
        check: |vm| {
            (!vm.cpu_affinity.is_empty()).then(|| {
                let cpus: Vec<_> = vm.cpu_affinity.iter().map(i32::to_string).collect();
                format!("The VM is pinned to CPUs {}; pinning is dropped.", cpus.join(","))
            })
        },
    },
    Rule {
        id: "vmware.numaAffinity.set",
        category: Severity::Warning,
        label: "NUMA node affinity detected",
        check: |vm| {
            (!vm.numa_node_affinity.is_empty()).then(|| {
                format!(
                    "The VM is bound to NUMA nodes {}; the binding is dropped.",
                    vm.numa_node_affinity.join(",")
                )
            })
        },
    },
    Rule {
        id: "vmware.secureBoot.enabled",
        category: Severity::Warning,
        label: "UEFI secure boot enabled",
        check: |vm| {
            vm.secure_boot
                .then(|| "The destination VM boots with UEFI but secure boot disabled.".to_owned())
        },
    },
    Rule {
        id: "vmware.snapshot.present",
        category: Severity::Advisory,
        label: "Snapshot detected",
        check: |vm| {
            vm.snapshot
                .is_some()
                .then(|| "Only the current state is migrated, snapshots are not.".to_owned())
        },
    },
    Rule {
        id: "vmware.hotplug.enabled",
        category: Severity::Advisory,
        label: "CPU or memory hot plug enabled",
        check: |vm| {
            (vm.cpu_hot_add || vm.cpu_hot_remove || vm.memory_hot_add)
                .then(|| "Hot plug settings are not carried over.".to_owned())
        },
    },
    Rule {
        id: "vmware.nestedVirtualization.enabled",
        category: Severity::Advisory,
        label: "Nested virtualization enabled",
        check: |vm| {
            vm.nested_hv
                .then(|| "Nested virtualization must be enabled on the destination nodes.".to_owned())
        },
    },
];

pub fn concerns(vm: &Vm) -> Vec<Concern> {
    RULES
        .iter()
        .filter_map(|rule| {
            (rule.check)(vm).map(|assessment| Concern {
                id: rule.id.to_owned(),
                category: rule.category,
                label: rule.label.to_owned(),
                assessment,
            })
        })
        .collect()
}
