//! Shared test fixtures: a small seeded inventory, a scripted source and
//! proptest strategies for the inventory models.

pub mod fixtures;
pub mod source;

pub use fixtures::Fixture;
pub use source::{FakeSource, Op};

use chrono::{DateTime, Utc};
use macaddr::MacAddr6;
use models::inventory::{Bus, Disk, Kind, Nic, Ref};
use proptest::prelude::*;

/// Generates a random [`DateTime<Utc>`] within a reasonable range.
pub fn datetime_utc_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..=4102444800i64) // timestamps from 1970-01-01 to 2100-01-01
        .prop_map(|timestamp| DateTime::from_timestamp(timestamp, 0).unwrap_or_default())
}

/// Generates a random [`macaddr::MacAddr6`] for property testing.
pub fn mac_addr6_strategy() -> impl Strategy<Value = MacAddr6> {
    (any::<u64>()).prop_map(|value| {
        let bytes = value.to_be_bytes();
        MacAddr6::new(bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7])
    })
}

/// A VMware style MAC, as the SDK reports them (lowercase, colon separated)
pub fn mac_string_strategy() -> impl Strategy<Value = String> {
    mac_addr6_strategy().prop_map(|m| m.to_string().to_lowercase())
}

pub fn bus_strategy() -> impl Strategy<Value = Bus> {
    prop_oneof![Just(Bus::Scsi), Just(Bus::Sata), Just(Bus::Nvme), Just(Bus::Ide)]
}

/// A disk on datastore `datastore-11` with a plausible backing file
pub fn disk_strategy() -> impl Strategy<Value = Disk> {
    (bus_strategy(), 0..4i32, 0..16i32, 1i64..1 << 40, any::<bool>()).prop_map(
        |(bus, controller, unit, capacity, shared)| Disk {
            key: 2000 + controller * 16 + unit,
            file: format!("[ds1] vm/disk-{controller}-{unit}.vmdk"),
            capacity,
            datastore: Ref::new(Kind::Datastore, fixtures::DATASTORE_ID),
            bus,
            controller_key: 1000 + controller,
            unit_number: unit,
            shared,
            ..Default::default()
        },
    )
}

pub fn nic_strategy(network: Ref) -> impl Strategy<Value = Vec<Nic>> {
    prop::collection::vec(mac_string_strategy(), 0..6).prop_map(move |macs| {
        macs.into_iter()
            .enumerate()
            .map(|(index, mac)| Nic {
                mac,
                network: network.clone(),
                index,
            })
            .collect()
    })
}

/// Runs an async block to completion inside `proptest!`, which cannot use
/// `#[tokio::test]`.
#[macro_export]
macro_rules! block_on_runtime {
    ($($block:tt)+) => {{
        let runtime = ::tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
        runtime.block_on(async { $($block)+ })
    }};
}
