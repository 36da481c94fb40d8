// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Guest operating system tables: VMware guest ids to osinfo ids, osinfo ids to
//! destination preferences, and the legacy Windows releases that need the
//! older driver image.

use std::collections::{BTreeMap, HashMap};

use models::inventory::Vm;

pub const DEFAULT_WINDOWS: &str = "win10";
pub const DEFAULT_LINUX: &str = "rhel8.1";
pub const UNKNOWN: &str = "unknown";

pub const TEMPLATE_OS_LABEL: &str = "os.template.kubevirt.io";
pub const TEMPLATE_WORKLOAD_LABEL: &str = "workload.template.kubevirt.io/server";
pub const TEMPLATE_FLAVOR_LABEL: &str = "flavor.template.kubevirt.io/medium";

const GUEST_OSINFO: &[(&str, &str)] = &[
    ("centos64Guest", "centos5.11"),
    ("centos6_64Guest", "centos6.10"),
    ("centos6Guest", "centos6.10"),
    ("centos7_64Guest", "centos7.0"),
    ("centos7Guest", "centos7.0"),
    ("centos8_64Guest", "centos8"),
    ("centos8Guest", "centos8"),
    ("debian4_64Guest", "debian4"),
    ("debian4Guest", "debian4"),
    ("debian5_64Guest", "debian5"),
    ("debian5Guest", "debian5"),
    ("debian6_64Guest", "debian6"),
    ("debian6Guest", "debian6"),
    ("debian7_64Guest", "debian7"),
    ("debian7Guest", "debian7"),
    ("debian8_64Guest", "debian8"),
    ("debian8Guest", "debian8"),
    ("debian9_64Guest", "debian9"),
    ("debian9Guest", "debian9"),
    ("debian10_64Guest", "debian10"),
    ("debian10Guest", "debian10"),
    ("fedora64Guest", "fedora31"),
    ("fedoraGuest", "fedora31"),
    ("genericLinuxGuest", "linux"),
    ("rhel6_64Guest", "rhel6.10"),
    ("rhel6Guest", "rhel6.10"),
    ("rhel7_64Guest", "rhel7.7"),
    ("rhel7Guest", "rhel7.7"),
    ("rhel8_64Guest", "rhel8.1"),
    ("rhel9_64Guest", "rhel9.4"),
    ("ubuntu64Guest", "ubuntu18.04"),
    ("ubuntuGuest", "ubuntu18.04"),
    ("win2000AdvServGuest", "win2k"),
    ("win2000ProGuest", "win2k"),
    ("win2000ServGuest", "win2k"),
    ("windows7Guest", "win7"),
    ("windows7Server64Guest", "win2k8r2"),
    ("windows8_64Guest", "win8"),
    ("windows8Guest", "win8"),
    ("windows8Server64Guest", "win2k12r2"),
    ("windows9_64Guest", "win10"),
    ("windows9Guest", "win10"),
    ("windows9Server64Guest", "win2k19"),
    ("windows2019srv_64Guest", "win2k19"),
    ("windows2019srvNext_64Guest", "win2k19"),
    ("windows2022srvNext_64Guest", "win2k22"),
];

/// Guest ids and name fragments of Windows releases without SHA-2 driver signing
const LEGACY_WINDOWS: &[&str] = &[
    "windows xp",
    "winxpproguest",
    "server 2003",
    "winnetenterpriseguest",
    "winnetstandardguest",
    "winnetenterprise64guest",
    "vista",
    "windowsvistaguest",
    "server 2008",
    "longhornguest",
    "windows 7",
    "windows7guest",
    "server 2008 r2",
    "windows7server64guest",
];

/// osinfo id prefixes to destination preference names, longest prefix wins
const PREFERENCES: &[(&str, &str)] = &[
    ("centos-stream8", "centos.stream8"),
    ("centos-stream9", "centos.stream9"),
    ("centos7", "centos.7"),
    ("fedora", "fedora"),
    ("opensuse", "opensuse.leap"),
    ("rhel7", "rhel.7"),
    ("rhel8", "rhel.8"),
    ("rhel9", "rhel.9"),
    ("sles", "sles"),
    ("ubuntu", "ubuntu"),
    ("win10", "windows.10.virtio"),
    ("win11", "windows.11.virtio"),
    ("win2k12", "windows.2k12.virtio"),
    ("win2k16", "windows.2k16.virtio"),
    ("win2k19", "windows.2k19.virtio"),
    ("win2k22", "windows.2k22.virtio"),
    ("win2k25", "windows.2k25.virtio"),
];

pub fn osinfo_for_guest(guest_id: &str) -> &'static str {
    if let Some((_, os)) = GUEST_OSINFO.iter().find(|(g, _)| *g == guest_id) {
        return os;
    }

    if guest_id.contains("linux") || guest_id.contains("rhel") {
        DEFAULT_LINUX
    } else if guest_id.contains("win") {
        DEFAULT_WINDOWS
    } else {
        UNKNOWN
    }
}

pub fn is_legacy_windows(vm: &Vm) -> bool {
    let id = vm.guest_id.to_lowercase();
    let name = vm.guest_name.to_lowercase();

    LEGACY_WINDOWS
        .iter()
        .any(|l| id.contains(l) || name.contains(l))
}

pub fn template_labels(vm: &Vm) -> BTreeMap<String, String> {
    let os = osinfo_for_guest(&vm.guest_id);

    BTreeMap::from([
        (format!("{TEMPLATE_OS_LABEL}/{os}"), "true".to_owned()),
        (TEMPLATE_WORKLOAD_LABEL.to_owned(), "true".to_owned()),
        (TEMPLATE_FLAVOR_LABEL.to_owned(), "true".to_owned()),
    ])
}

/// Destination preference for an inspected operating system.
///
/// `overrides` is consulted first, keyed by exact osinfo id.
pub fn preference_for(osinfo: &str, overrides: &HashMap<String, String>) -> Option<String> {
    if let Some(p) = overrides.get(osinfo) {
        return Some(p.clone());
    }

    PREFERENCES
        .iter()
        .filter(|(prefix, _)| osinfo.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, p)| (*p).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_ids_map_to_osinfo() {
        assert_eq!(osinfo_for_guest("rhel8_64Guest"), "rhel8.1");
        assert_eq!(osinfo_for_guest("windows9Guest"), "win10");
        assert_eq!(osinfo_for_guest("otherLinux64Guest"), UNKNOWN);
        assert_eq!(osinfo_for_guest("other4xLinux64Guest"), UNKNOWN);
        assert_eq!(osinfo_for_guest("otherlinux64Guest"), DEFAULT_LINUX);
        assert_eq!(osinfo_for_guest("windows11_64Guest"), DEFAULT_WINDOWS);
        assert_eq!(osinfo_for_guest("solaris11_64Guest"), UNKNOWN);
    }

    #[test]
    fn labels_carry_the_os() {
        let vm = Vm {
            guest_id: "rhel9_64Guest".into(),
            ..Default::default()
        };
        let labels = template_labels(&vm);
        assert_eq!(labels.len(), 3);
        assert_eq!(labels["os.template.kubevirt.io/rhel9.4"], "true");
        assert_eq!(labels[TEMPLATE_WORKLOAD_LABEL], "true");
    }

    #[test]
    fn legacy_windows_by_id_or_name() {
        let xp = Vm {
            guest_id: "winXPProGuest".into(),
            ..Default::default()
        };
        let named = Vm {
            guest_name: "Microsoft Windows Server 2008 R2 (64-bit)".into(),
            ..Default::default()
        };
        let modern = Vm {
            guest_id: "windows2019srv_64Guest".into(),
            guest_name: "Microsoft Windows Server 2019 (64-bit)".into(),
            ..Default::default()
        };

        assert!(is_legacy_windows(&xp));
        assert!(is_legacy_windows(&named));
        assert!(!is_legacy_windows(&modern));
    }

    #[test]
    fn preferences_prefer_overrides_then_longest_prefix() {
        let mut overrides = HashMap::new();
        overrides.insert("rhel8.1".to_owned(), "custom.rhel8".to_owned());

        assert_eq!(preference_for("rhel8.1", &overrides).as_deref(), Some("custom.rhel8"));
        assert_eq!(preference_for("rhel8.6", &overrides).as_deref(), Some("rhel.8"));
        assert_eq!(preference_for("win2k19", &overrides).as_deref(), Some("windows.2k19.virtio"));
        assert_eq!(preference_for("centos-stream9", &overrides).as_deref(), Some("centos.stream9"));
        assert_eq!(preference_for("haiku", &overrides), None);
    }
}
