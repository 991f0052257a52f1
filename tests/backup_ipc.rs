mod test_support;

use serde_json::json;
use test_support::{create_student, i64_at, str_at, temp_dir, Sidecar};

fn student_count(sc: &mut Sidecar) -> i64 {
    let stats = sc.ok("students.stats", json!({}));
    i64_at(&stats, "/total")
}

#[test]
fn exported_bundle_restores_an_earlier_state() {
    let (mut sc, workspace) = Sidecar::with_workspace("asistencia-backup-ipc");
    let out_dir = temp_dir("asistencia-backup-ipc-out");
    let bundle = out_dir.join("respaldo.zip");

    create_student(&mut sc, "U001", "Ana", "Torres");
    let exported = sc.ok(
        "backup.exportWorkspace",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(str_at(&exported, "/bundleFormat"), "asistencia-workspace-v1");
    assert_eq!(str_at(&exported, "/dbSha256").len(), 64);
    assert!(i64_at(&exported, "/dbBytes") > 0);

    create_student(&mut sc, "U002", "Luis", "Alva");
    assert_eq!(student_count(&mut sc), 2);

    let imported = sc.ok(
        "backup.importWorkspace",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        str_at(&imported, "/bundleFormatDetected"),
        "asistencia-workspace-v1"
    );
    // The reopened database is the exported one.
    assert_eq!(student_count(&mut sc), 1);

    drop(sc);
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn backup_requests_are_validated() {
    let mut sc = Sidecar::spawn();
    assert_eq!(
        sc.err_code("backup.exportWorkspace", json!({ "outPath": "/tmp/x.zip" })),
        "no_workspace"
    );

    let (mut sc, workspace) = Sidecar::with_workspace("asistencia-backup-ipc-errors");
    assert_eq!(sc.err_code("backup.exportWorkspace", json!({})), "bad_params");
    let missing = workspace.join("no-such-bundle.zip");
    assert_eq!(
        sc.err_code(
            "backup.importWorkspace",
            json!({ "inPath": missing.to_string_lossy() })
        ),
        "not_found"
    );
    // The workspace stays usable after a refused import.
    sc.ok("students.list", json!({}));

    drop(sc);
    let _ = std::fs::remove_dir_all(workspace);
}
