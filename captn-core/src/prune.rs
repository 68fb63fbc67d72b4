//! Post-run prune: old backup containers and unreferenced images.
//!
//! A backup is deletable only when it is old enough AND enough newer backups
//! of the same base name remain. Images are removed only when no container
//! references them.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::PruneConfig;
use crate::docker::{ContainerDriver, ContainerSummary};
use crate::report::PruneSummary;

fn backup_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<base>.+)_bak_cu_(?P<ts>\d{8}_\d{6})$").unwrap())
}

#[derive(Debug, Clone)]
struct Backup {
    id: String,
    name: String,
    base: String,
    created: DateTime<Local>,
}

fn parse_backup(summary: &ContainerSummary, now: DateTime<Local>) -> Option<Backup> {
    let caps = backup_regex().captures(&summary.name)?;
    let naive = NaiveDateTime::parse_from_str(&caps["ts"], "%Y%m%d_%H%M%S").ok()?;
    let created = Local
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or(now);
    Some(Backup {
        id: summary.id.clone(),
        name: summary.name.clone(),
        base: caps["base"].to_string(),
        created,
    })
}

/// Which backups of one base name may go, given the retention settings.
/// `backups` must be sorted newest first.
fn deletable<'a>(
    backups: &'a [Backup],
    min_age: Duration,
    min_keep: usize,
    now: DateTime<Local>,
) -> Vec<&'a Backup> {
    backups
        .iter()
        .skip(min_keep)
        .filter(|backup| {
            let age = (now - backup.created).to_std().unwrap_or(Duration::ZERO);
            age >= min_age
        })
        .collect()
}

/// Run the prune pass.
pub async fn run_prune(
    driver: &dyn ContainerDriver,
    cfg: &PruneConfig,
    dry_run: bool,
    now: DateTime<Local>,
) -> PruneSummary {
    let mut summary = PruneSummary::default();

    if !cfg.remove_old_containers && !cfg.remove_unused_images {
        debug!("all prune operations disabled by configuration");
        return summary;
    }

    let all = match driver.list_containers(true).await {
        Ok(containers) => containers,
        Err(e) => {
            summary.errors.push(format!("listing containers: {e}"));
            return summary;
        }
    };

    if cfg.remove_old_containers {
        info!(
            "{} backup containers",
            if dry_run {
                "would check and remove"
            } else {
                "checking and removing"
            }
        );

        let mut by_base: BTreeMap<String, Vec<Backup>> = BTreeMap::new();
        for summary_entry in all.iter().filter(|c| c.state == "exited") {
            if let Some(backup) = parse_backup(summary_entry, now) {
                by_base.entry(backup.base.clone()).or_default().push(backup);
            }
        }

        for backups in by_base.values_mut() {
            backups.sort_by(|a, b| b.created.cmp(&a.created));
            for backup in deletable(backups, cfg.min_backup_age, cfg.min_backups_to_keep, now) {
                if dry_run {
                    info!(container = %backup.name, "would remove backup container");
                    summary.backup_containers_removed += 1;
                    continue;
                }
                match driver.remove(&backup.id, false).await {
                    Ok(()) => {
                        info!(container = %backup.name, "removed backup container");
                        summary.backup_containers_removed += 1;
                    }
                    Err(e) => {
                        warn!(container = %backup.name, error = %e, "backup removal failed");
                        summary.errors.push(format!("{}: {e}", backup.name));
                    }
                }
            }
        }
    }

    if cfg.remove_unused_images {
        info!(
            "{} unused images",
            if dry_run { "would remove" } else { "removing" }
        );

        let images = match driver.list_images().await {
            Ok(images) => images,
            Err(e) => {
                summary.errors.push(format!("listing images: {e}"));
                return summary;
            }
        };

        let referenced: HashSet<&str> = all.iter().map(|c| c.image.as_str()).collect();
        for image in images {
            let in_use = referenced.contains(image.id.as_str())
                || image
                    .repo_tags
                    .iter()
                    .any(|tag| referenced.contains(tag.as_str()));
            if in_use {
                continue;
            }
            if dry_run {
                debug!(image = %image.id, "would remove unused image");
                summary.images_removed += 1;
                continue;
            }
            match driver.remove_image(&image.id).await {
                Ok(()) => {
                    debug!(image = %image.id, "removed unused image");
                    summary.images_removed += 1;
                }
                Err(e) => {
                    warn!(image = %image.id, error = %e, "image removal failed");
                    summary.errors.push(format!("{}: {e}", image.id));
                }
            }
        }
    }

    summary
}
