//! Disk and partition enumeration via lsblk.
//!
//! lsblk's pair format (`KNAME="sda" TYPE="disk" ...`) is parsed into disks
//! with their partitions grouped underneath. Virtual devices that cannot be
//! imaged (nbd, loop, rom) are ignored.

use regex::Regex;
use serde::Serialize;

use super::error::{Error, Result};
use super::runner::{Capture, Runner};

const LSBLK_ARGS: &[&str] = &["lsblk", "-P", "-b", "-o", "KNAME,TYPE,FSTYPE,SIZE"];
const IGNORED_DEVICES: &[&str] = &["nbd", "loop", "rom"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub name: String,
    pub size: u64,
    pub fs_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    pub name: String,
    pub size: u64,
    pub partitions: Vec<PartitionInfo>,
}

/// All imageable disks currently visible, with their partitions.
pub async fn list_disks() -> Result<Vec<DiskInfo>> {
    let lsblk = Runner::new(
        LSBLK_ARGS.iter().map(|s| s.to_string()).collect(),
        Box::new(Capture::default()),
    );
    if lsblk.run().await? != 0 {
        return Err(Error::Detection("lsblk".into()));
    }
    parse_lsblk(&lsblk.output().unwrap_or_default())
}

/// Details of a single disk, or `NotFound`.
pub async fn disk_details(disk: &str) -> Result<DiskInfo> {
    list_disks()
        .await?
        .into_iter()
        .find(|d| d.name == disk)
        .ok_or_else(|| Error::NotFound(disk.to_string()))
}

pub(crate) fn parse_lsblk(output: &str) -> Result<Vec<DiskInfo>> {
    let pair = Regex::new(r#"(\w+)="([^"]*)""#).expect("static regex");
    let mut disks: Vec<DiskInfo> = Vec::new();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let mut kname = None;
        let mut kind = None;
        let mut fs_type = String::new();
        let mut size = 0u64;
        for caps in pair.captures_iter(line) {
            match &caps[1] {
                "KNAME" => kname = Some(caps[2].to_string()),
                "TYPE" => kind = Some(caps[2].to_string()),
                "FSTYPE" => fs_type = caps[2].to_string(),
                "SIZE" => size = caps[2].parse().unwrap_or(0),
                _ => {}
            }
        }
        let Some(name) = kname else {
            return Err(Error::Detection(format!(
                "cannot detect a device name in lsblk line: {line}"
            )));
        };
        if IGNORED_DEVICES.iter().any(|ig| name.starts_with(ig)) {
            continue;
        }
        match kind.as_deref() {
            Some("disk") => disks.push(DiskInfo {
                name,
                size,
                partitions: Vec::new(),
            }),
            Some("part") => {
                // lsblk lists partitions directly after their disk
                if let Some(disk) = disks.last_mut() {
                    disk.partitions.push(PartitionInfo {
                        name,
                        size,
                        fs_type,
                    });
                }
            }
            _ => {}
        }
    }
    Ok(disks)
}
