// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::net::IpAddr;

use models::inventory::Vm;

const MANUAL: &str = "manual";

fn is_v4(ip: &str) -> Option<bool> {
    ip.parse::<IpAddr>().ok().map(|a| a.is_ipv4())
}

/// Default gateway of the guest interface carrying `ip`, from the guest ip stack.
///
/// vSphere reports the default route as network 0.0.0.0 for both families.
fn gateway(vm: &Vm, ip: &str, device: &str) -> String {
    let family = is_v4(ip);

    vm.guest_ip_stack
        .iter()
        .filter(|s| is_v4(&s.gateway) == family)
        .filter(|s| s.device == device)
        .filter(|s| s.network == "0.0.0.0")
        .last()
        .map(|s| s.gateway.clone())
        .unwrap_or_default()
}

/// The guest's addresses in the form the converter re-applies them,
/// `mac:ip:addr,gateway,prefix,dns1,dns2` per address joined by `_`.
///
/// Windows guests only carry manually configured addresses over.
pub fn static_ips(vm: &Vm) -> String {
    let windows = vm.is_windows();

    vm.guest_networks
        .iter()
        .filter(|n| !windows || n.origin == MANUAL)
        .map(|n| {
            let entry = format!(
                "{}:ip:{},{},{},{}",
                n.mac,
                n.ip,
                gateway(vm, &n.ip, &n.device),
                n.prefix,
                n.dns.join(",")
            );
            entry.strip_suffix(',').map(str::to_owned).unwrap_or(entry)
        })
        .collect::<Vec<_>>()
        .join("_")
}
