//! Registry and mailbox behavior against a file-backed database.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use sigpost_core::server::{ServerContext, sweep_once};
use sigpost_core::store::unix_now;
use sigpost_core::{DiagnosticEvent, MemorySink, Store};
use sigpost_test_utils::{TestConfigBuilder, TestStore};

#[test]
fn register_twice_keeps_one_record() {
    let fixture = TestStore::new();
    assert!(fixture.store.register(12_344).unwrap());
    assert!(!fixture.store.register(12_344).unwrap());
    assert_eq!(fixture.store.list_alive().unwrap().len(), 1);
}

#[test]
fn commands_come_back_in_order_once() {
    let fixture = TestStore::new();
    let items = ["LS", "echo one", "2097152", "echo two"];
    for item in items {
        fixture.store.enqueue_command(40, item).unwrap();
    }
    assert_eq!(fixture.store.take_commands(40).unwrap(), items.to_vec());
    assert!(fixture.store.take_commands(40).unwrap().is_empty());
}

#[test]
fn queues_survive_reopen_until_purged() {
    let fixture = TestStore::new();
    fixture.store.register(4).unwrap();
    fixture.store.enqueue_outbound_file(4, "a.bin").unwrap();

    let reopened = Store::open(&fixture.db_path).unwrap();
    assert_eq!(reopened.alive_ids().unwrap(), vec![4]);
    assert_eq!(reopened.pending(4).unwrap().outbound_files, 1);

    reopened.purge_all().unwrap();
    assert!(fixture.store.list_alive().unwrap().is_empty());
    assert!(fixture.store.pending(4).unwrap().is_empty());
}

#[tokio::test]
async fn sweep_evicts_only_past_threshold() {
    let fixture = TestStore::new();
    let now = unix_now();
    fixture.store.register_at(4, now - 61.0).unwrap();
    fixture.store.register_at(8, now - 59.0).unwrap();

    let diag = MemorySink::default();
    let config = TestConfigBuilder::new().build();
    let ctx = Arc::new(ServerContext::new(
        &config,
        fixture.store.clone(),
        Arc::new(diag.clone()),
    ));

    assert_eq!(sweep_once(&ctx, Duration::from_secs(60)).await, vec![4]);
    assert_eq!(fixture.store.alive_ids().unwrap(), vec![8]);
    assert_eq!(
        diag.events(),
        vec![DiagnosticEvent::ClientEvicted { stream_id: 4 }]
    );
}

#[tokio::test]
async fn sweep_and_handlers_race_safely() {
    let fixture = TestStore::new();
    let store = fixture.store.clone();
    let stale = unix_now() - 3_600.0;
    for i in 0..50u64 {
        store.register_at(i * 4, stale).unwrap();
    }

    let mut tasks = Vec::new();
    for worker in 0..4u64 {
        let store = store.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            for i in 0..50u64 {
                let id = i * 4;
                if i % 4 == worker {
                    let _ = store.remove(id);
                } else {
                    let _ = store.sweep_stale(Duration::from_secs(60));
                }
                store.enqueue_command(id, "whoami").unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(store.list_alive().unwrap().is_empty());
    let total: usize = (0..50u64)
        .map(|i| store.take_commands(i * 4).unwrap().len())
        .sum();
    assert_eq!(total, 200);
}
