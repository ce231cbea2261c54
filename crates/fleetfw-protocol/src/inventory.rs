use std::collections::HashMap;

use fleetfw_domain::{
    Credentials, Host, Inventory, InventoryDiff, InventoryRecord, UpdateError, VersionChange,
};
use tracing::debug;

use crate::redfish::RedfishClient;

/// Read the firmware inventory from `/redfish/v1/UpdateService/FirmwareInventory`.
///
/// Only `Installed-*` entries count; `Previous-*` and `Available-*` slots
/// would make every diff report phantom changes.
pub async fn collect_software_inventory(
    redfish: &RedfishClient,
    host: &Host,
    creds: &Credentials,
) -> Result<Inventory, UpdateError> {
    let members = redfish.firmware_inventory_raw(host, creds).await?;
    let mut inventory: Inventory = members
        .iter()
        .filter_map(|m| {
            let id = m["Id"].as_str()?;
            if id.starts_with("Previous-") || id.starts_with("Available-") {
                return None;
            }
            Some(InventoryRecord {
                id: id.to_string(),
                name: m["Name"].as_str().unwrap_or(id).to_string(),
                version: m["Version"].as_str().unwrap_or_default().to_string(),
            })
        })
        .collect();
    inventory.sort_by(|a, b| a.id.cmp(&b.id));
    debug!(host_id = %host.id, components = inventory.len(), "software inventory collected");
    Ok(inventory)
}

/// Diff two inventories keyed by component identity. A change is reported
/// iff the (id, version) pair differs or one side is missing.
pub fn diff_inventories(before: &Inventory, after: &Inventory) -> InventoryDiff {
    let before_map: HashMap<&str, &InventoryRecord> =
        before.iter().map(|r| (r.id.as_str(), r)).collect();
    let after_map: HashMap<&str, &InventoryRecord> =
        after.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut diff = InventoryDiff::default();

    for record in after {
        match before_map.get(record.id.as_str()) {
            None => diff.added.push(record.clone()),
            Some(prev) if prev.version != record.version => {
                diff.version_changed.push(VersionChange {
                    id: record.id.clone(),
                    before: prev.version.clone(),
                    after: record.version.clone(),
                });
            }
            Some(_) => {}
        }
    }
    for record in before {
        if !after_map.contains_key(record.id.as_str()) {
            diff.removed.push(record.clone());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, version: &str) -> InventoryRecord {
        InventoryRecord {
            id: id.to_string(),
            name: id.to_string(),
            version: version.to_string(),
        }
    }

    #[test]
    fn diff_reports_version_changes() {
        let before = vec![record("Installed-iDRAC", "6.10.00.00"), record("Installed-BIOS", "2.10")];
        let after = vec![record("Installed-iDRAC", "7.10.30.00"), record("Installed-BIOS", "2.10")];
        let diff = diff_inventories(&before, &after);
        assert_eq!(diff.version_changed.len(), 1);
        assert_eq!(diff.version_changed[0].id, "Installed-iDRAC");
        assert_eq!(diff.version_changed[0].before, "6.10.00.00");
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn diff_reports_added_and_removed() {
        let before = vec![record("a", "1")];
        let after = vec![record("b", "1")];
        let diff = diff_inventories(&before, &after);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.added[0].id, "b");
        assert_eq!(diff.removed[0].id, "a");
    }

    #[test]
    fn identical_inventories_diff_empty() {
        let inv = vec![record("a", "1"), record("b", "2")];
        let diff = diff_inventories(&inv, &inv);
        assert!(diff.is_empty());
    }

    #[test]
    fn change_reported_iff_pair_differs() {
        // Property 6: for any pair, a change appears iff (id, version)
        // differs or one side is missing.
        let before = vec![record("x", "1"), record("y", "1"), record("z", "1")];
        let after = vec![record("x", "1"), record("y", "2"), record("w", "1")];
        let diff = diff_inventories(&before, &after);

        let mentioned: Vec<&str> = diff
            .added
            .iter()
            .map(|r| r.id.as_str())
            .chain(diff.removed.iter().map(|r| r.id.as_str()))
            .chain(diff.version_changed.iter().map(|c| c.id.as_str()))
            .collect();
        assert!(mentioned.contains(&"y"));
        assert!(mentioned.contains(&"z"));
        assert!(mentioned.contains(&"w"));
        assert!(!mentioned.contains(&"x"));
    }
}
