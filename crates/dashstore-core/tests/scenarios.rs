//! End-to-end scenarios: datafiles, calculated values, freezing and saving
//! working together through the public API.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;
use tempfile::TempDir;

use dashstore_core::durability::staging_path;
use dashstore_core::{Config, DataEvent, DataListener, DataRepository, FreezeState, StoredValue, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn repo_in(dir: &Path) -> Arc<DataRepository> {
    DataRepository::new(Config::testing().with_template_dir(dir)).unwrap()
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<DataEvent>>,
}

impl DataListener for Recorder {
    fn data_values_changed(&self, events: &[DataEvent]) {
        self.events.lock().extend_from_slice(events);
    }
}

fn number(repo: &DataRepository, name: &str) -> Option<f64> {
    repo.get(name).and_then(|v| v.as_number())
}

// ---------------------------------------------------------------------------
// Calculated values
// ---------------------------------------------------------------------------

#[test]
fn test_diamond_dependencies_settle() {
    let repo = DataRepository::new(Config::testing()).unwrap();
    repo.put("/p/A", Value::number(1.0));
    repo.put_text("/p/B", "!(* A 2)", "/p");
    repo.put_text("/p/C", "!(+ A B)", "/p");
    assert_eq!(number(&repo, "/p/C"), Some(3.0));

    let recorder = Arc::new(Recorder::default());
    let id = repo.register_listener(Arc::clone(&recorder) as Arc<dyn DataListener>);
    repo.add_data_listener("/p/C", id);
    repo.flush();

    repo.put("/p/A", Value::number(10.0));
    repo.flush();
    assert_eq!(number(&repo, "/p/B"), Some(20.0));
    assert_eq!(number(&repo, "/p/C"), Some(30.0));
    let last = recorder.events.lock().last().cloned().unwrap();
    assert_eq!(last.name, "/p/C");
    assert_eq!(last.value.and_then(|v| v.as_number()), Some(30.0));
}

#[test]
fn test_expression_follows_the_branch_it_reads() {
    let repo = DataRepository::new(Config::testing()).unwrap();
    repo.put("/p/UseActual", Value::number(0.0));
    repo.put("/p/Plan", Value::number(5.0));
    repo.put("/p/Actual", Value::number(7.0));
    repo.put_text("/p/Size", "!(if UseActual Actual Plan)", "/p");
    assert_eq!(number(&repo, "/p/Size"), Some(5.0));

    repo.put("/p/UseActual", Value::number(1.0));
    repo.flush();
    assert_eq!(number(&repo, "/p/Size"), Some(7.0));

    // no longer read, so no longer watched
    assert_eq!(repo.listener_count("/p/Plan"), 0);
    repo.put("/p/Actual", Value::number(9.0));
    repo.flush();
    assert_eq!(number(&repo, "/p/Size"), Some(9.0));
}

#[test]
fn test_mutual_recursion_terminates() {
    let repo = DataRepository::new(Config::testing()).unwrap();
    repo.put_text("/p/A", "!(+ B 1)", "/p");
    repo.put_text("/p/B", "!(+ A 1)", "/p");
    let _ = repo.get("/p/A");
    let _ = repo.get("/p/B");
    repo.flush();
    assert!(repo.stats().recursion_aborts >= 1);

    repo.put("/p/C", Value::number(1.0));
    assert_eq!(repo.get("/p/C"), Some(Value::number(1.0)));
}

// ---------------------------------------------------------------------------
// Datafiles
// ---------------------------------------------------------------------------

#[test]
fn test_project_lifecycle_round_trip() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("base.txt"), "Size=5\nRate=2\nCost=!(* Size Rate)\n").unwrap();
    let path = dir.path().join("p.dat");
    fs::write(&path, "#include <base.txt>\nSize=8\n").unwrap();

    {
        let repo = repo_in(dir.path());
        repo.open_datafile("/p", &path).unwrap();
        repo.start_workers().unwrap();
        assert_eq!(number(&repo, "/p/Cost"), Some(16.0));

        repo.put("/p/Size", Value::number(10.0));
        repo.remove_value("/p/Rate");
        repo.flush();
        assert!(repo.get("/p/Cost").is_some_and(|v| !v.is_defined()));
        repo.shutdown();
    }

    let saved = fs::read_to_string(&path).unwrap();
    assert_eq!(saved, "#include <base.txt>\nRate=null\nSize=10\n");

    let repo = repo_in(dir.path());
    repo.open_datafile("/p", &path).unwrap();
    assert_eq!(repo.get("/p/Rate"), None);
    assert_eq!(number(&repo, "/p/Size"), Some(10.0));
    repo.restore_default_value("/p/Rate");
    repo.flush();
    assert_eq!(number(&repo, "/p/Cost"), Some(20.0));
}

#[test]
fn test_failed_save_keeps_original_and_retries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("p.dat");
    fs::write(&path, "A=1\n").unwrap();
    let repo = repo_in(dir.path());
    repo.open_datafile("/p", &path).unwrap();
    repo.put("/p/A", Value::number(2.0));

    let blocker = staging_path(&path);
    fs::create_dir(&blocker).unwrap();
    assert!(repo.save_datafile("/p").is_err());
    assert_eq!(fs::read_to_string(&path).unwrap(), "A=1\n");
    assert_eq!(repo.stats().save_failures, 1);

    fs::remove_dir(&blocker).unwrap();
    assert_eq!(repo.save_all_datafiles(), 1);
    assert_eq!(fs::read_to_string(&path).unwrap(), "A=2\n");
}

#[test]
fn test_close_then_reopen_sees_saved_edits() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("p.dat");
    fs::write(&path, "Name=\"draft\n").unwrap();
    let repo = repo_in(dir.path());
    repo.open_datafile("/p", &path).unwrap();
    repo.put("/p/Name", Value::text("final"));
    repo.close_datafile("/p").unwrap();
    assert!(!repo.contains("/p/Name"));

    repo.open_datafile("/p", &path).unwrap();
    assert_eq!(repo.get("/p/Name"), Some(Value::text("final")));
}

// ---------------------------------------------------------------------------
// Freezing
// ---------------------------------------------------------------------------

#[test]
fn test_frozen_values_survive_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("p.dat");
    fs::write(&path, "Size=10\nCompleted=0\n").unwrap();

    {
        let repo = repo_in(dir.path());
        repo.open_datafile("/p", &path).unwrap();
        let set = repo.add_frozen_set("Completed", "/p", "/Size$").unwrap();
        repo.put("/p/Completed", Value::number(1.0));
        repo.flush();
        assert_eq!(set.state(), FreezeState::Frozen);
        assert!(!repo.user_put_value("/p/Size", Value::number(99.0)));
        assert!(repo.save_datafile("/p").unwrap());
    }
    assert!(fs::read_to_string(&path).unwrap().contains("Size=#10\u{1}10\n"));

    let repo = repo_in(dir.path());
    repo.open_datafile("/p", &path).unwrap();
    assert!(matches!(repo.peek_value("/p/Size"), Some(StoredValue::Frozen(_))));
    assert_eq!(repo.get("/p/Size"), Some(Value::number(10.0).with_editable(false)));

    let set = repo.add_frozen_set("Completed", "/p", "/Size$").unwrap();
    repo.flush();
    assert_eq!(set.state(), FreezeState::Frozen);

    repo.put("/p/Completed", Value::number(0.0));
    repo.flush();
    assert_eq!(set.state(), FreezeState::Thawed);
    assert_eq!(repo.get("/p/Size"), Some(Value::number(10.0)));
    assert!(repo.user_put_value("/p/Size", Value::number(11.0)));
}

#[test]
fn test_freeze_waits_for_datafile_to_finish_opening() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("p.dat");
    fs::write(&path, "Done=TAG\nEstimate=4\n").unwrap();
    let repo = repo_in(dir.path());
    let set = repo.add_frozen_set("Done", "/p", "Estimate$").unwrap();
    repo.open_datafile("/p", &path).unwrap();
    repo.flush();

    assert_eq!(set.state(), FreezeState::Frozen);
    assert_eq!(set.tracked(), vec!["/p/Estimate".to_string()]);
    assert!(repo.peek_value("/p/Estimate").is_some_and(|v| v.is_frozen()));
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Edit {
    Put(usize, i32),
    Remove(usize),
}

const NAMES: [&str; 4] = ["Size", "Time", "Defects", "Notes/Size"];

fn arb_edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (0..NAMES.len(), -1000..1000i32).prop_map(|(n, v)| Edit::Put(n, v)),
        (0..NAMES.len()).prop_map(Edit::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_saved_datafile_reloads_same_values(edits in proptest::collection::vec(arb_edit(), 1..20)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.dat");
        fs::write(&path, "Size=1\n").unwrap();

        let repo = repo_in(dir.path());
        repo.open_datafile("/p", &path).unwrap();
        for edit in &edits {
            match *edit {
                Edit::Put(n, v) => repo.put(&format!("/p/{}", NAMES[n]), Value::number(v as f64)),
                Edit::Remove(n) => repo.remove_value(&format!("/p/{}", NAMES[n])),
            }
        }
        repo.save_datafile("/p").unwrap();

        let reloaded = repo_in(dir.path());
        reloaded.open_datafile("/p", &path).unwrap();
        for name in NAMES {
            let name = format!("/p/{}", name);
            prop_assert_eq!(reloaded.get(&name), repo.get(&name));
        }
    }
}
