// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::collections::HashMap;

use client::source::trim_backing_file;
use dal::Readable;
use models::{
    inventory::{Datastore, Disk, Vm},
    plan::Plan,
};

use super::{
    converter_transfers, plan_vm, target_name,
    template::{file_stem, pvc_name, PvcNameData},
    BuildError, Builder, DataVolume, DiskDevice, Volume, VolumeSource, ANN_DISK_INDEX,
    ANN_DISK_SOURCE, LABEL_SHAREABLE, VIRTIO,
};

/// The disks that are migrated, in destination order: SCSI and NVMe first,
/// then SATA, then IDE, and by controller and unit within a bus.
pub fn ordered_disks(vm: &Vm, migrate_shared: bool) -> Vec<Disk> {
    let mut disks: Vec<Disk> = vm
        .disks
        .iter()
        .filter(|d| migrate_shared || !d.shared)
        .cloned()
        .collect();

    disks.sort_by_key(|d| (d.bus.priority(), d.controller_key, d.unit_number));
    disks
}

/// What the mover reads from: the base disk for warm migrations, since
/// precopies address deltas through checkpoints, else the current file.
fn base_volume(file: &str, warm: bool) -> String {
    if warm {
        trim_backing_file(file)
    } else {
        file.to_owned()
    }
}

impl<'a, R: Readable> Builder<'a, R> {
    fn pvc_name(&self, vm: &Vm, disk: &Disk, index: usize, root: usize) -> Result<String, BuildError> {
        let target = target_name(plan_vm(self.plan, vm), vm);

        match self.plan.pvc_name_template.as_deref().filter(|t| !t.is_empty()) {
            Some(template) => Ok(pvc_name(template, &pvc_data(self.plan, vm, &target, disk, index, root))?),
            None => Ok(format!("{target}-disk-{index}")),
        }
    }

    /// One transfer descriptor per migrated disk, in destination disk order
    pub fn volumes(&self, vm: &Vm, secret: &str) -> Result<Vec<DataVolume>, BuildError> {
        let disks = ordered_disks(vm, self.plan.migrate_shared_disks);
        let root = self.root_disk(vm, disks.len());
        let blank = converter_transfers(self.plan, self.local);

        let (url, thumbprint) = match vm.host.as_ref().and_then(|h| self.plan.host_override(&h.id)) {
            Some(o) => {
                let host = self.host(vm)?;
                (
                    format!("https://{}/sdk", o.ip_address),
                    host.map(|h| h.thumbprint).unwrap_or_default(),
                )
            }
            None => (self.provider.url.clone(), self.fingerprint.clone()),
        };

        let mut out = Vec::with_capacity(disks.len());
        for (index, disk) in disks.iter().enumerate() {
            let datastore = self.inventory.get_as::<Datastore>(&disk.datastore.id)?;
            let mapped = self
                .plan
                .storage_pair(&datastore)
                .ok_or_else(|| BuildError::StorageUnmapped {
                    disk: disk.file.clone(),
                    datastore: datastore.name.clone(),
                })?;

            let source = if blank {
                VolumeSource::Blank
            } else {
                VolumeSource::Vddk {
                    url: url.clone(),
                    thumbprint: thumbprint.clone(),
                    uuid: vm.uuid.clone(),
                    backing_file: base_volume(&disk.file, self.plan.warm),
                    secret: secret.to_owned(),
                    init_image: self.provider.vddk_image.clone(),
                }
            };

            let mut labels = self.labels(vm);
            if disk.shared {
                labels.insert(LABEL_SHAREABLE.to_owned(), "true".to_owned());
            }

            out.push(DataVolume {
                name: self.pvc_name(vm, disk, index, root)?,
                namespace: self.plan.target_namespace.clone(),
                labels,
                annotations: [
                    (ANN_DISK_SOURCE.to_owned(), base_volume(&disk.file, self.plan.warm)),
                    (ANN_DISK_INDEX.to_owned(), index.to_string()),
                ]
                .into(),
                source,
                storage_class: mapped.destination.storage_class.clone(),
                access_mode: mapped.destination.access_mode.clone(),
                volume_mode: mapped.destination.volume_mode.clone(),
                capacity: disk.capacity,
                disk_index: index,
                checkpoints: Vec::new(),
                final_checkpoint: false,
            });
        }

        Ok(out)
    }

    /// Disk devices and the volumes backing them, matched by source file
    pub(super) fn map_disks(
        &self,
        vm: &Vm,
        volumes: &[DataVolume],
    ) -> Result<(Vec<DiskDevice>, Vec<Volume>), BuildError> {
        let by_source: HashMap<String, &DataVolume> = volumes
            .iter()
            .filter_map(|v| v.disk_source().map(|s| (s, v)))
            .collect();

        let disks = ordered_disks(vm, self.plan.migrate_shared_disks);
        let root = self.root_disk(vm, disks.len());

        let mut devices = Vec::with_capacity(disks.len());
        let mut bound = Vec::with_capacity(disks.len());
        for (i, disk) in disks.iter().enumerate() {
            // a snapshot taken mid migration renames the current file, volumes keep the base name
            let volume = by_source
                .get(&trim_backing_file(&disk.file))
                .ok_or_else(|| BuildError::MissingVolume(disk.file.clone()))?;
            let name = format!("vol-{i}");

            devices.push(DiskDevice {
                name: name.clone(),
                bus: VIRTIO.to_owned(),
                shareable: disk.shared,
                cache: disk.shared.then(|| "none".to_owned()),
                boot_order: (i == root).then_some(1),
            });
            bound.push(Volume {
                name,
                claim_name: volume.name.clone(),
            });
        }

        Ok((devices, bound))
    }
}

pub fn pvc_data(
    plan: &Plan,
    vm: &Vm,
    target: &str,
    disk: &Disk,
    index: usize,
    root: usize,
) -> PvcNameData {
    PvcNameData {
        vm_name: target.to_owned(),
        target_vm_name: target.to_owned(),
        plan_name: plan.name.clone(),
        disk_index: index,
        root_disk_index: root,
        shared: disk.shared,
        file_name: file_stem(&disk.file),
        win_drive_letter: disk.win_drive_letter.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::inventory::{Bus, Ref};
    use proptest::prelude::*;

    fn disk(file: &str, bus: Bus, controller_key: i32, unit_number: i32) -> Disk {
        Disk {
            file: file.into(),
            bus,
            controller_key,
            unit_number,
            datastore: Ref::default(),
            ..Default::default()
        }
    }

    #[test]
    fn buses_sort_scsi_nvme_sata_ide() {
        let vm = Vm {
            disks: vec![
                disk("ide", Bus::Ide, 200, 0),
                disk("sata", Bus::Sata, 15000, 0),
                disk("scsi-1", Bus::Scsi, 1000, 1),
                disk("nvme", Bus::Nvme, 31000, 0),
                disk("scsi-0", Bus::Scsi, 1000, 0),
            ],
            ..Default::default()
        };

        let files: Vec<_> = ordered_disks(&vm, true).into_iter().map(|d| d.file).collect();
        assert_eq!(files, vec!["scsi-0", "scsi-1", "nvme", "sata", "ide"]);
    }

    #[test]
    fn shared_disks_can_be_left_behind() {
        let mut shared = disk("shared", Bus::Scsi, 1000, 1);
        shared.shared = true;
        let vm = Vm {
            disks: vec![disk("own", Bus::Scsi, 1000, 0), shared],
            ..Default::default()
        };

        assert_eq!(ordered_disks(&vm, true).len(), 2);
        assert_eq!(ordered_disks(&vm, false).len(), 1);
    }

    #[test]
    fn warm_volumes_use_the_base_file() {
        assert_eq!(base_volume("[ds] vm/disk-000015.vmdk", true), "[ds] vm/disk.vmdk");
        assert_eq!(base_volume("[ds] vm/disk-000015.vmdk", false), "[ds] vm/disk-000015.vmdk");
    }

    fn arb_disk() -> impl Strategy<Value = Disk> {
        (
            prop_oneof![Just(Bus::Scsi), Just(Bus::Sata), Just(Bus::Nvme), Just(Bus::Ide)],
            0..4i32,
            0..16i32,
        )
            .prop_map(|(bus, c, u)| disk(&format!("{bus}{c}:{u}"), bus, 1000 + c, u))
    }

    proptest! {
        #[test]
        fn order_is_stable_and_independent_of_input_order(
            disks in prop::collection::vec(arb_disk(), 0..12),
            seed in any::<u64>(),
        ) {
            let vm = Vm { disks: disks.clone(), ..Default::default() };
            let first = ordered_disks(&vm, true);
            prop_assert_eq!(&first, &ordered_disks(&vm, true));

            let mut shuffled = disks;
            if !shuffled.is_empty() {
                let k = (seed % shuffled.len() as u64) as usize;
                shuffled.rotate_left(k);
            }
            let again = ordered_disks(&Vm { disks: shuffled, ..Default::default() }, true);
            let keys = |v: &[Disk]| v.iter().map(|d| (d.bus.priority(), d.controller_key, d.unit_number)).collect::<Vec<_>>();
            prop_assert_eq!(keys(&first), keys(&again));
        }
    }
}
