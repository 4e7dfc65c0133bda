//! Host probes
//!
//! One-shot, best-effort inspections and mutations of the host the
//! database lives on: block-device detection, storage-media
//! classification, huge-page accounting, ZFS property reconciliation and
//! the bold-mode OS tweaks. Failures degrade the feature and are only
//! logged.

use chrono::Local;
use tokio::process::Command;

use super::TunerService;
use crate::config::StorageKind;
use crate::error::{Error, Result};
use crate::notify::Message;
use crate::tuner::persist::PersistedSetting;
use crate::util;

const MEMINFO_PATH: &str = "/proc/meminfo";
const THP_PATH: &str = "/sys/kernel/mm/transparent_hugepage/enabled";

/// The block device backing the server's data directory
#[derive(Debug, Clone)]
pub struct Device {
    pub kernel_name: String,
    /// Set when the data directory lives on ZFS
    pub zfs_volume: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LsblkRow {
    kname: String,
    #[allow(dead_code)]
    fstype: String,
    mountpoint: String,
}

/// Run a command and capture stdout, failing on a nonzero exit
async fn run_capture(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|err| Error::Subprocess(format!("running {program} failed: {err}")))?;

    if !output.status.success() {
        return Err(Error::Subprocess(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Find the block device whose mountpoint is the longest prefix of the
/// data directory; datadirs mounted under a `zfs` path additionally get
/// their volume name resolved.
pub(crate) async fn detect_device(datadir: &str) -> Result<Device> {
    let output = run_capture("lsblk", &["-d", "-o", "KNAME,FSTYPE,MOUNTPOINT"]).await?;
    let rows = parse_lsblk(&output);
    if rows.is_empty() {
        return Err(Error::Parse("no block device found".to_string()));
    }

    let row = choose_device(rows, datadir)
        .ok_or_else(|| Error::Parse(format!("no device matches datadir {datadir:?}")))?;

    let mut device = Device {
        kernel_name: row.kname,
        zfs_volume: None,
    };

    if row.mountpoint.starts_with("zfs") {
        let listing = run_capture("zfs", &["list", datadir]).await?;
        device.zfs_volume = Some(parse_zfs_list(&listing)?);
    }

    Ok(device)
}

fn parse_lsblk(output: &str) -> Vec<LsblkRow> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(LsblkRow {
                kname: fields.next()?.to_string(),
                fstype: fields.next().unwrap_or_default().to_string(),
                mountpoint: fields.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

fn choose_device(mut rows: Vec<LsblkRow>, datadir: &str) -> Option<LsblkRow> {
    rows.sort_by(|a, b| b.mountpoint.len().cmp(&a.mountpoint.len()));
    rows.into_iter()
        .find(|row| datadir.starts_with(&row.mountpoint))
}

fn parse_zfs_list(output: &str) -> Result<String> {
    let row = output
        .lines()
        .nth(1)
        .ok_or_else(|| Error::Parse("no zfs volume matches datadir".to_string()))?;

    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::Parse(format!(
            "unexpected zfs list output line: {row:?}"
        )));
    }

    Ok(fields[0].to_string())
}

/// Classify the storage medium behind a kernel device name with smartctl
pub(crate) async fn detect_storage(kernel_name: &str) -> Result<StorageKind> {
    let device = format!("/dev/{kernel_name}");
    let output = run_capture("smartctl", &["-i", &device]).await?;
    Ok(classify_storage(&output))
}

fn classify_storage(smartctl_output: &str) -> StorageKind {
    let is_ssd = smartctl_output.lines().any(|line| {
        line.strip_prefix("Rotation Rate:")
            .map(|rate| rate.trim() == "Solid State Device")
            .unwrap_or(false)
    });

    if is_ssd {
        StorageKind::Ssd
    } else {
        StorageKind::Spinning
    }
}

/// Total bytes the kernel reserved for explicit huge pages
pub(crate) fn huge_page_allocation() -> Result<u64> {
    let meminfo = std::fs::read_to_string(MEMINFO_PATH)?;
    Ok(parse_huge_page_allocation(&meminfo))
}

fn parse_huge_page_allocation(meminfo: &str) -> u64 {
    let field = |prefix: &str| -> u64 {
        meminfo
            .lines()
            .find(|line| line.starts_with(prefix))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    };

    // Hugepagesize is reported in kB.
    field("HugePages_Total:") * field("Hugepagesize:") * 1024
}

/// The `[selected]` token of a sysfs choice file
fn bracketed(content: &str) -> Option<&str> {
    let start = content.find('[')?;
    let end = content[start..].find(']')? + start;
    Some(&content[start..=end])
}

fn parse_tuned_active(output: &str) -> Result<Vec<String>> {
    let fields: Vec<&str> = output.split_whitespace().collect();
    if !output.starts_with("Current active profile:") || fields.len() < 4 {
        return Err(Error::Parse(format!(
            "unexpected tuned-adm active output: {output:?}"
        )));
    }

    Ok(fields[3..].iter().map(|s| s.to_string()).collect())
}

impl TunerService {
    /// Bold mode only: zero out the legacy query cache
    pub(crate) async fn tune_query_cache(&self) {
        if !self.bold {
            return;
        }

        let rows = match self.db.show_variables_like("query_cache_%").await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::error!(error = %err, "reading query_cache variables failed");
                return;
            }
        };

        let mut assignments = Vec::new();
        let mut notices = Vec::new();
        let mut settings = Vec::new();
        for row in rows {
            if (row.name == "query_cache_size" || row.name == "query_cache_type")
                && row.value != "0"
            {
                assignments.push(format!("{} = 0", row.name));
                notices.push((
                    format!("{} changed", row.name),
                    format!("{} has been changed from {} to 0", row.name, row.value),
                ));
                settings.push(PersistedSetting::mysqld(&row.name, "0".to_string()));
            }
        }

        if assignments.is_empty() {
            return;
        }

        for setting in settings {
            self.persist.send(setting).await;
        }

        let statement = format!("SET GLOBAL {}", assignments.join(", "));
        if let Err(err) = self.db.exec(&statement).await {
            tracing::error!(error = %err, "disabling query cache failed");
            return;
        }

        let now = Local::now();
        for (subject, content) in notices {
            self.notify
                .notify(Message {
                    subject,
                    content,
                    time: now,
                })
                .await;
        }
    }

    /// Reconcile ZFS dataset properties and the InnoDB settings that go
    /// with them. Only runs when the data directory lives on ZFS.
    pub(crate) async fn tune_zfs(&self) {
        let Some(volume) = self
            .device
            .as_ref()
            .and_then(|device| device.zfs_volume.clone())
        else {
            return;
        };

        let vars = match self.db.get_global_variables().await {
            Ok(vars) => vars,
            Err(err) => {
                tracing::error!(error = %err, "get global variables failed");
                return;
            }
        };

        let properties = match run_capture(
            "zfs",
            &[
                "get",
                "atime,compression,logbias,primarycache,recordsize",
                &volume,
            ],
        )
        .await
        {
            Ok(output) => output,
            Err(err) => {
                tracing::error!(error = %err, "get zfs properties failed");
                return;
            }
        };

        let recordsize = vars.innodb_page_size.to_string();
        let expected = [
            ("atime", "off"),
            ("compression", "lz4"),
            ("logbias", "throughput"),
            ("primarycache", "metadata"),
            ("recordsize", recordsize.as_str()),
        ];

        let mut assignments = Vec::new();
        let mut changes = Vec::new();
        for line in properties.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 4 {
                tracing::warn!(line, "unexpected zfs property line");
                continue;
            }

            let (property, value) = (fields[1], fields[2]);
            let Some((_, want)) = expected.iter().find(|(name, _)| *name == property) else {
                tracing::warn!(line, "unexpected zfs property line");
                continue;
            };

            if value != *want {
                assignments.push(format!("{property}={want}"));
                changes.push(format!("{property}: {value} -> {want}"));
            }
        }

        if !assignments.is_empty() {
            let mut args = vec!["set".to_string()];
            args.extend(assignments);
            args.push(volume.clone());
            let args: Vec<&str> = args.iter().map(String::as_str).collect();

            match run_capture("zfs", &args).await {
                Ok(_) => {
                    self.notify
                        .notify(Message {
                            subject: "zfs properties changed".to_string(),
                            content: format!(
                                "Following zfs properties have been changed:\n{}",
                                changes.join("\n")
                            ),
                            time: Local::now(),
                        })
                        .await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "set zfs properties failed");
                }
            }
        }

        // InnoDB settings that ZFS subsumes or conflicts with.
        let mut queries = Vec::new();
        let mut changes = Vec::new();
        let mut settings = Vec::new();

        if vars.innodb_checksum_algorithm != "none" {
            queries.push("innodb_checksum_algorithm = 'none'".to_string());
            changes.push(format!(
                "innodb_checksum_algorithm: {} -> none",
                vars.innodb_checksum_algorithm
            ));
            settings.push(PersistedSetting::mysqld(
                "innodb_checksum_algorithm",
                "none".to_string(),
            ));
        }

        // Not dynamic: persisted only, applied at the next restart.
        let doublewrite = util::parse_bool(&vars.innodb_doublewrite);
        if doublewrite.unwrap_or(true) {
            changes.push("innodb_doublewrite: ON -> OFF".to_string());
            settings.push(PersistedSetting::mysqld("innodb_doublewrite", "0".to_string()));
        }

        if vars.innodb_flush_neighbors != 0 {
            queries.push("innodb_flush_neighbors = 0".to_string());
            changes.push(format!(
                "innodb_flush_neighbors: {} -> 0",
                vars.innodb_flush_neighbors
            ));
            settings.push(PersistedSetting::mysqld(
                "innodb_flush_neighbors",
                "0".to_string(),
            ));
        }

        // Not dynamic either.
        if vars.innodb_use_native_aio {
            changes.push("innodb_use_native_aio: ON -> OFF".to_string());
            settings.push(PersistedSetting::mysqld(
                "innodb_use_native_aio",
                "0".to_string(),
            ));
        }

        if vars.innodb_log_write_ahead_size != vars.innodb_page_size {
            queries.push(format!(
                "innodb_log_write_ahead_size = {}",
                vars.innodb_page_size
            ));
            changes.push(format!(
                "innodb_log_write_ahead_size: {} -> {}",
                vars.innodb_log_write_ahead_size, vars.innodb_page_size
            ));
            settings.push(PersistedSetting::mysqld(
                "innodb_log_write_ahead_size",
                util::to_size_string(vars.innodb_page_size),
            ));
        }

        if settings.is_empty() {
            return;
        }

        for setting in settings {
            self.persist.send(setting).await;
        }

        if !queries.is_empty() {
            let statement = format!("SET GLOBAL {}", queries.join(", "));
            if let Err(err) = self.db.exec(&statement).await {
                tracing::error!(error = %err, "set global variables failed");
                return;
            }
        }

        self.notify
            .notify(Message {
                subject: "MySQL/MariaDB global variables changed".to_string(),
                content: format!(
                    "Following global variables have been changed:\n{}",
                    changes.join("\n")
                ),
                time: Local::now(),
            })
            .await;
    }

    /// Bold mode only: host-level tweaks outside the database
    pub(crate) async fn tune_os(&self) {
        if !self.bold {
            return;
        }

        match self.db.get_global_variables().await {
            Ok(vars) => {
                if self.hp_alloc == 0 || !vars.large_pages {
                    self.notify
                        .notify(Message {
                            subject: "Huge Page Advice".to_string(),
                            content: "The large pages feature is not fully configured yet; \
                                      it should be enabled at kernel level at boot time and \
                                      in the database configuration."
                                .to_string(),
                            time: Local::now(),
                        })
                        .await;
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "get global variables failed");
            }
        }

        if self.storage == StorageKind::Ssd {
            if let Some(device) = &self.device {
                self.tune_scheduler(&device.kernel_name).await;
            }
        }

        if let Err(err) = self.tune_os_profile().await {
            tracing::error!(error = %err, "tuning profile with tuned-adm failed");
        }

        let enabled = match std::fs::read_to_string(THP_PATH) {
            Ok(content) => content,
            Err(err) => {
                tracing::error!(error = %err, "reading transparent hugepage state failed");
                return;
            }
        };

        let current = bracketed(&enabled).unwrap_or("").to_string();
        if current == "[never]" {
            return;
        }

        if let Err(err) = std::fs::write(THP_PATH, "never") {
            tracing::error!(error = %err, "disabling transparent hugepage failed");
            return;
        }

        self.notify
            .notify(Message {
                subject: "Transparent hugepage changed".to_string(),
                content: format!("{THP_PATH} has been changed from {current} to [never]"),
                time: Local::now(),
            })
            .await;
    }

    /// Switch an SSD-backed device's I/O scheduler to none
    async fn tune_scheduler(&self, kernel_name: &str) {
        let path = format!("/sys/block/{kernel_name}/queue/scheduler");
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                tracing::error!(error = %err, "reading I/O scheduler failed");
                return;
            }
        };

        let current = bracketed(&content).unwrap_or("").to_string();
        if current == "[none]" {
            return;
        }

        if let Err(err) = std::fs::write(&path, "none") {
            tracing::error!(error = %err, "setting I/O scheduler to none failed");
            return;
        }

        self.notify
            .notify(Message {
                subject: "I/O scheduler changed".to_string(),
                content: format!("{path} has been changed from {current} to [none]"),
                time: Local::now(),
            })
            .await;
    }

    /// Switch the tuned-adm profile to throughput-performance when the
    /// host is not a cloud instance and the profile exists
    async fn tune_os_profile(&self) -> Result<()> {
        let output = match Command::new("tuned-adm").arg("active").output().await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(Error::Subprocess(format!("running tuned-adm failed: {err}")))
            }
            Ok(output) => output,
        };

        if !output.status.success() {
            return Err(Error::Subprocess(format!(
                "tuned-adm active exited with {}",
                output.status
            )));
        }

        let profile = parse_tuned_active(&String::from_utf8_lossy(&output.stdout))?;
        if profile.iter().any(|part| part.starts_with("oci-")) {
            return Ok(());
        }

        let listing = run_capture("tuned-adm", &["list"]).await?;
        let exists = listing
            .lines()
            .any(|line| line.starts_with("- throughput-performance"));
        if !exists {
            return Ok(());
        }

        run_capture("tuned-adm", &["profile", "throughput-performance"]).await?;

        self.notify
            .notify(Message {
                subject: "tuned-adm profile changed".to_string(),
                content: "tuned-adm profile switched to throughput-performance".to_string(),
                time: Local::now(),
            })
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsblk_picks_longest_mountpoint() {
        let output = "\
KNAME FSTYPE MOUNTPOINT
sda   ext4   /
sdb   ext4   /var/lib
sdc   ext4
";
        let rows = parse_lsblk(output);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].mountpoint, "");

        let chosen = choose_device(rows, "/var/lib/mysql/").unwrap();
        assert_eq!(chosen.kname, "sdb");
    }

    #[test]
    fn test_choose_device_falls_back_to_root() {
        let rows = parse_lsblk("KNAME FSTYPE MOUNTPOINT\nsda ext4 /\n");
        let chosen = choose_device(rows, "/srv/mysql/").unwrap();
        assert_eq!(chosen.kname, "sda");
    }

    #[test]
    fn test_parse_zfs_list() {
        let output = "\
NAME        USED  AVAIL  REFER  MOUNTPOINT
tank/mysql  1.2G  50.3G  1.2G   /var/lib/mysql
";
        assert_eq!(parse_zfs_list(output).unwrap(), "tank/mysql");
        assert!(parse_zfs_list("NAME USED\n").is_err());
    }

    #[test]
    fn test_classify_storage() {
        let ssd = "Model Number: Foo\nRotation Rate:    Solid State Device\n";
        assert_eq!(classify_storage(ssd), StorageKind::Ssd);

        let spinning = "Rotation Rate:    7200 rpm\n";
        assert_eq!(classify_storage(spinning), StorageKind::Spinning);

        assert_eq!(classify_storage(""), StorageKind::Spinning);
    }

    #[test]
    fn test_parse_huge_page_allocation() {
        let meminfo = "\
MemTotal:       16384000 kB
HugePages_Total:      64
HugePages_Free:       64
Hugepagesize:       2048 kB
";
        assert_eq!(parse_huge_page_allocation(meminfo), 64 * 2048 * 1024);
        assert_eq!(parse_huge_page_allocation("MemTotal: 1 kB\n"), 0);
    }

    #[test]
    fn test_bracketed() {
        assert_eq!(bracketed("mq-deadline kyber [none]"), Some("[none]"));
        assert_eq!(bracketed("always madvise [never]\n"), Some("[never]"));
        assert_eq!(bracketed("none"), None);
    }

    #[test]
    fn test_parse_tuned_active() {
        let parts = parse_tuned_active("Current active profile: throughput-performance\n").unwrap();
        assert_eq!(parts, vec!["throughput-performance"]);

        let parts = parse_tuned_active("Current active profile: oci-rps-xps oci-busy-polling\n").unwrap();
        assert!(parts.iter().any(|p| p.starts_with("oci-")));

        assert!(parse_tuned_active("something else\n").is_err());
    }
}
