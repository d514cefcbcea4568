//! Fleet fixture - デモ用のライブラリ・ドライブ・テープ構成
//!
//! Read from the same TOML file as the scheduler settings:
//!
//! ```toml
//! [[mount_policies]]
//! name = "default"
//! archive_priority = 1
//! retrieve_priority = 1
//! max_files_queued = 2
//! max_bytes_queued = 1000000
//! max_request_age = 60
//! max_drives_allowed = 2
//!
//! [[storage_classes]]
//! name = "dual"
//! mount_policy = "default"
//! pools = ["pool_a", "pool_b"]   # copy 1, copy 2
//!
//! [[tapes]]
//! vid = "V00001"
//! tape_pool = "pool_a"
//! logical_library = "LIB1"
//!
//! [[drives]]
//! name = "D1"
//! logical_library = "LIB1"
//! ```
//!
//! Without any `[[drives]]` the built-in fleet is used.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tapesched_core::domain::{DedicationEntry, DriveInfo, MountPolicy};
use tapesched_core::impls::InMemoryCatalogue;

#[derive(Debug, Clone, Deserialize)]
pub struct DriveEntry {
    pub name: String,
    pub logical_library: String,
    #[serde(default = "default_host")]
    pub host: String,
    /// Empty means any pool.
    #[serde(default)]
    pub dedicated_pools: Vec<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TapeEntry {
    pub vid: String,
    pub tape_pool: String,
    pub logical_library: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageClassEntry {
    pub name: String,
    pub mount_policy: String,
    pub pools: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Fleet {
    pub disabled_libraries: Vec<String>,
    pub admins: Vec<String>,
    pub mount_policies: Vec<MountPolicy>,
    pub storage_classes: Vec<StorageClassEntry>,
    pub tapes: Vec<TapeEntry>,
    pub drives: Vec<DriveEntry>,
}

impl Fleet {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let fleet = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                toml::from_str::<Fleet>(&data)
                    .with_context(|| format!("invalid fleet in {}", path.display()))?
            }
            None => Fleet::default(),
        };
        Ok(if fleet.drives.is_empty() {
            Fleet::builtin()
        } else {
            fleet
        })
    }

    /// Two libraries, two dual-copy pools and three drives.
    pub fn builtin() -> Self {
        let drive = |name: &str, lib: &str| DriveEntry {
            name: name.into(),
            logical_library: lib.into(),
            host: default_host(),
            dedicated_pools: Vec::new(),
        };
        let tape = |vid: &str, pool: &str, lib: &str| TapeEntry {
            vid: vid.into(),
            tape_pool: pool.into(),
            logical_library: lib.into(),
        };
        Fleet {
            disabled_libraries: Vec::new(),
            admins: vec!["operator".into()],
            mount_policies: vec![MountPolicy {
                name: "default".into(),
                archive_priority: 1,
                retrieve_priority: 2,
                max_files_queued: 2,
                max_bytes_queued: 64 << 20,
                max_request_age: Duration::from_secs(5),
                max_drives_allowed: 2,
            }],
            storage_classes: vec![StorageClassEntry {
                name: "dual".into(),
                mount_policy: "default".into(),
                pools: vec!["pool_a".into(), "pool_b".into()],
            }],
            tapes: vec![
                tape("V00001", "pool_a", "LIB1"),
                tape("V00002", "pool_a", "LIB1"),
                tape("V00101", "pool_b", "LIB2"),
            ],
            drives: vec![drive("D1", "LIB1"), drive("D2", "LIB1"), drive("D3", "LIB2")],
        }
    }

    pub fn catalogue(&self) -> anyhow::Result<InMemoryCatalogue> {
        let mut builder = InMemoryCatalogue::builder();
        for drive in &self.drives {
            builder = builder.logical_library(drive.logical_library.as_str());
        }
        for tape in &self.tapes {
            builder = builder.logical_library(tape.logical_library.as_str());
        }
        for lib in &self.disabled_libraries {
            builder = builder.disabled_logical_library(lib.as_str());
        }
        for policy in &self.mount_policies {
            builder = builder.mount_policy(policy.clone());
        }
        for class in &self.storage_classes {
            let copies = class
                .pools
                .iter()
                .enumerate()
                .map(|(i, pool)| (i as u32 + 1, pool.as_str()));
            builder = builder.storage_class(class.name.as_str(), copies, class.mount_policy.as_str());
        }
        for tape in &self.tapes {
            builder = builder.tape(
                tape.vid.as_str(),
                tape.tape_pool.as_str(),
                tape.logical_library.as_str(),
            );
        }
        for admin in &self.admins {
            builder = builder.admin(admin.as_str());
        }
        builder.build().context("invalid fleet")
    }

    pub fn drive_infos(&self) -> Vec<DriveInfo> {
        self.drives
            .iter()
            .map(|d| DriveInfo {
                name: d.name.clone(),
                logical_library: d.logical_library.clone(),
                host: d.host.clone(),
                dedication: DedicationEntry {
                    tape_pools: d.dedicated_pools.clone(),
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_fleet_builds() {
        let fleet = Fleet::builtin();
        fleet.catalogue().unwrap();
        assert_eq!(fleet.drive_infos().len(), 3);
    }

    #[test]
    fn fleet_is_read_next_to_scheduler_settings() {
        let fleet: Fleet = toml::from_str(
            r#"
            poll_interval_ms = 100

            [[mount_policies]]
            name = "p"
            archive_priority = 1
            retrieve_priority = 1
            max_files_queued = 1
            max_bytes_queued = 1
            max_request_age = 30
            max_drives_allowed = 1

            [[storage_classes]]
            name = "single"
            mount_policy = "p"
            pools = ["pool_a"]

            [[tapes]]
            vid = "V1"
            tape_pool = "pool_a"
            logical_library = "LIB1"

            [[drives]]
            name = "D1"
            logical_library = "LIB1"
            dedicated_pools = ["pool_a"]
            "#,
        )
        .unwrap();
        assert_eq!(fleet.mount_policies[0].max_request_age, Duration::from_secs(30));
        assert_eq!(fleet.drives[0].host, "localhost");
        fleet.catalogue().unwrap();
    }
}
