// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reports the resources this host offers to instances.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::Context;
use compute_api_types::{CallContext, HostResources};

use crate::manager::{ComputeError, ComputeManager};

const MEMINFO_PATH: &str = "/proc/meminfo";
const GIB: u64 = 1024 * 1024 * 1024;

/// Extracts `MemTotal` (reported in kB) from the contents of `/proc/meminfo`,
/// in MiB.
pub fn parse_mem_total_mib(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kib / 1024)
    })
}

pub fn mem_size_mib() -> anyhow::Result<u64> {
    let meminfo = std::fs::read_to_string(MEMINFO_PATH)
        .with_context(|| format!("reading {}", MEMINFO_PATH))?;
    parse_mem_total_mib(&meminfo)
        .with_context(|| format!("no MemTotal entry in {}", MEMINFO_PATH))
}

/// The size, in GiB, of the filesystem holding `path`.
pub fn hdd_size_gib(path: &Path) -> anyhow::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("invalid path {}", path.display()))?;
    let mut stat = std::mem::MaybeUninit::<libc::statvfs>::uninit();

    // Safety: `c_path` is NUL-terminated and `stat` is valid for writes.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs({})", path.display()));
    }

    // Safety: statvfs succeeded, so it initialized `stat`.
    let stat = unsafe { stat.assume_init() };
    #[allow(clippy::unnecessary_cast)]
    let bytes = (stat.f_bsize as u64) * (stat.f_blocks as u64);
    Ok(bytes / GIB)
}

impl ComputeManager {
    pub async fn host_resources(
        &self,
        _ctx: &CallContext,
    ) -> Result<HostResources, ComputeError> {
        let vcpus = self.driver.get_vcpu_number().await?;
        let memory_mib = mem_size_mib().map_err(ComputeError::HostInventory)?;
        let disk_gib = hdd_size_gib(&self.instances_path)
            .map_err(ComputeError::HostInventory)?;
        Ok(HostResources { vcpus, memory_mib, disk_gib })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "\
MemTotal:        8167848 kB
MemFree:          304184 kB
MemAvailable:    5133908 kB
";

    #[test]
    fn mem_total_is_converted_to_mib() {
        assert_eq!(parse_mem_total_mib(MEMINFO), Some(7976));
    }

    #[test]
    fn missing_mem_total() {
        assert_eq!(parse_mem_total_mib("MemFree: 304184 kB\n"), None);
        assert_eq!(parse_mem_total_mib("MemTotal: lots\n"), None);
    }

    #[test]
    fn statvfs_of_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(hdd_size_gib(&dir.path().join("nope")).is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn reports_host_resources() {
        use crate::manager::testing::{ctx, TestHost};

        let dir = tempfile::tempdir().unwrap();
        let mut host = TestHost::new();
        host.manager.instances_path = dir.path().to_path_buf();

        let resources = host.manager.host_resources(&ctx()).await.unwrap();
        assert_eq!(resources.vcpus, 8);
        assert!(resources.memory_mib > 0);
    }
}
