use std::collections::HashMap;
use std::path::Path;

/// Atomically snapshots a flat string map to `<dbname>/stats.json`:
/// create-new `stats.json.new`, rename any existing `stats.json` aside to
/// `stats.json.old`, then rename the new file into place. Logged and
/// reported as `false` on I/O failure; never retried here.
pub fn snapshot_stats(dbname: &Path, stats: &HashMap<String, String>) -> bool {
    let target = dbname.join("stats.json");
    let staging = dbname.join("stats.json.new");
    let backup = dbname.join("stats.json.old");

    if let Err(e) = write_new(&staging, stats) {
        tracing::warn!(path = %staging.display(), error = %e, "failed to write stats sidecar");
        return false;
    }

    if target.exists() {
        if let Err(e) = std::fs::rename(&target, &backup) {
            tracing::warn!(path = %target.display(), error = %e, "failed to back up previous stats.json");
            return false;
        }
    }

    if let Err(e) = std::fs::rename(&staging, &target) {
        tracing::warn!(path = %staging.display(), error = %e, "failed to promote stats.json.new");
        return false;
    }

    true
}

fn write_new(path: &Path, stats: &HashMap<String, String>) -> std::io::Result<()> {
    let json = serde_json::to_vec(stats)?;
    std::fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trips_and_backs_up_previous() {
        let dir = tempfile::tempdir().unwrap();

        let mut first = HashMap::new();
        first.insert("x".to_string(), "1".to_string());
        assert!(snapshot_stats(dir.path(), &first));

        let mut second = HashMap::new();
        second.insert("x".to_string(), "1".to_string());
        second.insert("y".to_string(), "2".to_string());
        assert!(snapshot_stats(dir.path(), &second));

        let written: HashMap<String, String> =
            serde_json::from_slice(&std::fs::read(dir.path().join("stats.json")).unwrap()).unwrap();
        assert_eq!(written, second);

        let backed_up: HashMap<String, String> =
            serde_json::from_slice(&std::fs::read(dir.path().join("stats.json.old")).unwrap()).unwrap();
        assert_eq!(backed_up, first);
    }
}
