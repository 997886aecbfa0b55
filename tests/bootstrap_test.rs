mod common;

use std::sync::Arc;
use std::thread;

use cluster_journal::{
    ConnectionDriver, DataSourceDirectory, Error, Journal, JournalConfig, LegacyRevisionFile,
    LegacyRevisionSource, Result,
};
use rusqlite::Connection;

#[test]
fn reopening_a_node_keeps_its_revision() {
    let (_dir, path) = common::create_temp_db_file("bootstrap.db");

    let journal = common::open_node("node-a", &path);
    journal.append_one("items", b"a".to_vec()).unwrap();
    journal.append_one("items", b"b".to_vec()).unwrap();
    drop(journal);

    let journal = Journal::builder(common::test_config("node-a", &path))
        .initial_revision(99)
        .open()
        .unwrap();
    assert_eq!(journal.local_revision().unwrap(), 2);
    assert_eq!(journal.global_revision().unwrap(), 2);
    assert_eq!(
        journal.revision_store().all_local_revisions().unwrap(),
        vec![("node-a".to_string(), 2)]
    );
}

#[test]
fn nodes_registering_concurrently_each_get_one_row() {
    let (_dir, path) = common::create_temp_db_file("concurrent.db");
    let first = common::open_node("node-0", &path);

    let path = Arc::new(path);
    let handles: Vec<_> = (1..4)
        .map(|i| {
            let path = Arc::clone(&path);
            thread::spawn(move || {
                let journal = common::open_node(&format!("node-{i}"), &path);
                journal.local_revision().unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 0);
    }

    let rows = first.revision_store().all_local_revisions().unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(first.global_revision().unwrap(), 0);

    let conn = Connection::open(path.as_path()).unwrap();
    let counters: i64 = conn
        .query_row("SELECT COUNT(*) FROM global_revision", [], |row| row.get(0))
        .unwrap();
    assert_eq!(counters, 1);
}

#[test]
fn missing_counter_row_is_restored() {
    let (_dir, path) = common::create_temp_db_file("counter.db");
    drop(common::open_node("node-a", &path));

    Connection::open(&path)
        .unwrap()
        .execute_batch("DELETE FROM global_revision")
        .unwrap();

    let journal = common::open_node("node-a", &path);
    assert_eq!(journal.global_revision().unwrap(), 0);
    assert_eq!(journal.append_one("items", b"x".to_vec()).unwrap(), 1);
}

#[test]
fn legacy_revision_seeds_only_first_registration() {
    let (dir, path) = common::create_temp_db_file("legacy.db");
    let legacy = LegacyRevisionFile::new(dir.path().join("node-a.revision"));
    legacy.write(42).unwrap();

    let mut config = common::test_config("node-a", &path);
    config.legacy_revision_file = Some(legacy.path().to_path_buf());

    let journal = Journal::open(config.clone()).unwrap();
    assert_eq!(journal.local_revision().unwrap(), 42);
    drop(journal);

    legacy.write(99).unwrap();
    let journal = Journal::open(config).unwrap();
    assert_eq!(journal.local_revision().unwrap(), 42);
}

#[test]
fn custom_legacy_source_and_empty_legacy_file() {
    #[derive(Debug)]
    struct Fixed(Option<i64>);

    impl LegacyRevisionSource for Fixed {
        fn read(&self) -> Result<Option<i64>> {
            Ok(self.0)
        }
    }

    let (dir, path) = common::create_temp_db_file("legacy_source.db");

    let journal = Journal::builder(common::test_config("node-a", &path))
        .legacy_revision(Box::new(Fixed(Some(17))))
        .open()
        .unwrap();
    assert_eq!(journal.local_revision().unwrap(), 17);

    let journal = Journal::builder(common::test_config("node-b", &path))
        .legacy_revision(Box::new(Fixed(None)))
        .initial_revision(5)
        .open()
        .unwrap();
    assert_eq!(journal.local_revision().unwrap(), 5);

    let empty = dir.path().join("empty.revision");
    std::fs::write(&empty, b"").unwrap();
    let mut config = common::test_config("node-c", &path);
    config.legacy_revision_file = Some(empty);
    assert_eq!(Journal::open(config).unwrap().local_revision().unwrap(), 0);
}

#[test]
fn directory_provider_with_generic_dialect() {
    let (_dir, path) = common::create_temp_db_file("directory.db");
    let directory = DataSourceDirectory::new();
    directory.bind("jdbc/journal", common::sqlite_url(&path));

    let mut config = common::test_config("node-a", &path);
    config.driver = ConnectionDriver::Directory;
    config.url = "jdbc/journal".to_string();
    config.database_type = Some("h2".to_string());
    config.schema_object_prefix = "cj_".to_string();

    let journal = Journal::builder(config)
        .directory(directory.clone())
        .open()
        .unwrap();
    assert_eq!(journal.dialect_tag(), "h2");
    assert_eq!(journal.tables().journal, "CJ_JOURNAL");
    assert_eq!(journal.connections().provider().describe(), "directory:jdbc/journal");

    journal.append_one("items", b"x".to_vec()).unwrap();
    assert_eq!(common::revisions_and_payloads(&journal, 0).len(), 1);

    let conn = Connection::open(&path).unwrap();
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .unwrap();
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(
        names,
        vec!["CJ_GLOBAL_REVISION", "CJ_JOURNAL", "CJ_LOCAL_REVISIONS"]
    );
}

#[test]
fn configured_tablespace_reaches_the_generic_ddl() {
    let (_dir, path) = common::create_temp_db_file("tablespace.db");
    let mut config = common::test_config("node-a", &path);
    config.database_type = Some("oracle".to_string());
    config.tablespace = Some("journal_ts".to_string());

    // SQLite has no tablespaces, so the clause is what makes creation fail.
    let err = Journal::open(config).unwrap_err();
    assert!(matches!(err, Error::Schema(_)), "{err}");
    assert!(err.to_string().contains("TABLESPACE"), "{err}");

    let mut config = common::test_config("node-a", &path);
    config.database_type = Some("oracle".to_string());
    let journal = Journal::open(config).unwrap();
    assert_eq!(journal.tables().journal, "JOURNAL");
}

#[test]
fn sqlite_and_generic_nodes_share_one_schema() {
    let (_dir, path) = common::create_temp_db_file("mixed_case.db");

    let mut config = common::test_config("node-generic", &path);
    config.database_type = Some("h2".to_string());
    let generic = Journal::open(config).unwrap();
    let sqlite = common::open_node("node-sqlite", &path);
    assert_eq!(sqlite.tables().journal, "journal");

    generic.append_one("items", b"upper".to_vec()).unwrap();
    sqlite.append_one("items", b"lower".to_vec()).unwrap();
    assert_eq!(
        common::revisions_and_payloads(&generic, 0),
        vec![(1, b"upper".to_vec()), (2, b"lower".to_vec())]
    );
    assert_eq!(sqlite.revision_store().all_local_revisions().unwrap().len(), 2);
}

#[test]
fn directory_driver_requires_bound_name() {
    let (_dir, path) = common::create_temp_db_file("unbound.db");
    let mut config = common::test_config("node-a", &path);
    config.driver = ConnectionDriver::Directory;
    config.url = "jdbc/missing".to_string();

    assert!(matches!(
        Journal::open(config.clone()),
        Err(Error::Configuration(_))
    ));
    assert!(matches!(
        Journal::builder(config)
            .directory(DataSourceDirectory::new())
            .open(),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn generated_node_id_is_persisted() {
    let (dir, path) = common::create_temp_db_file("node_id.db");
    let id_file = dir.path().join("node.id");

    let mut config = JournalConfig::new("unused", common::sqlite_url(&path));
    config.node_id = None;
    config.node_id_file = Some(id_file.clone());

    let first = Journal::open(config.clone()).unwrap().node_id().clone();
    assert_eq!(std::fs::read_to_string(&id_file).unwrap(), first.as_str());

    let second = Journal::open(config).unwrap().node_id().clone();
    assert_eq!(first, second);
}

#[test]
fn invalid_configuration_is_rejected_before_connecting() {
    let (_dir, path) = common::create_temp_db_file("invalid.db");

    let mut config = common::test_config("node-a", &path);
    config.page_size = 0;
    assert!(matches!(Journal::open(config), Err(Error::Configuration(_))));

    let mut config = common::test_config("node-a", &path);
    config.schema_object_prefix = "bad-prefix".to_string();
    assert!(matches!(Journal::open(config), Err(Error::Configuration(_))));

    assert!(!path.exists());
}

#[test]
fn disabled_schema_check_fails_on_first_use() {
    let (_dir, path) = common::create_temp_db_file("no_schema.db");
    let mut config = common::test_config("node-a", &path);
    config.schema_check_enabled = false;

    let err = Journal::open(config).unwrap_err();
    assert!(matches!(err, Error::Connectivity { .. }), "{err}");
}

#[test]
fn configuration_loads_from_json() {
    let (dir, path) = common::create_temp_db_file("json.db");
    let file = dir.path().join("journal.json");
    std::fs::write(
        &file,
        format!(
            r#"{{
                "node_id": "node-json",
                "url": "{}",
                "reconnect_delay_ms": 0,
                "page_size": 16,
                "nested_unlock_policy": "outermost_decides"
            }}"#,
            common::sqlite_url(&path)
        ),
    )
    .unwrap();

    let config = JournalConfig::from_json_file(&file).unwrap();
    let journal = Journal::open(config).unwrap();
    assert_eq!(journal.node_id().as_str(), "node-json");
    assert_eq!(journal.config().page_size, 16);
    assert_eq!(
        journal.lock_manager().policy(),
        cluster_journal::NestedUnlockPolicy::OutermostDecides
    );
}
