// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

/// Formats a BIOS uuid the way VMware reports it as the system serial number,
/// `VMware-42 2c 6a 2a 5e a9 10 83-39 f3 3b 14 0f ff b4 44`.
///
/// Anything that is not a dashed uuid is returned unchanged.
pub fn uuid_to_vmware_serial(uuid: &str) -> String {
    let groups: Vec<&str> = uuid.split('-').collect();
    let lengths: Vec<usize> = groups.iter().map(|g| g.len()).collect();
    let well_formed = lengths == [8, 4, 4, 4, 12]
        && groups
            .iter()
            .all(|g| g.chars().all(|c| c.is_ascii_hexdigit()));

    if !well_formed {
        return uuid.to_owned();
    }

    let hex: String = groups.concat().to_ascii_lowercase();
    let pairs: Vec<&str> = (0..16).map(|i| &hex[i * 2..i * 2 + 2]).collect();

    format!("VMware-{}-{}", pairs[..8].join(" "), pairs[8..].join(" "))
}
