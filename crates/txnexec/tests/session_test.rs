mod setup;

use std::time::Duration;

use setup::*;
use tablemeta::replica::ApplyFault;
use tablemeta::types::TableIdentity;
use tokio::time::timeout;
use txnexec::errors::ExecError;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_running_statement() {
    let cluster = TestCluster::new(1).await;
    let orders = cluster.create_table(1, "orders", &[1]).await;

    let session = cluster.node(1).session();
    let running = {
        let session = session.clone();
        let mut stmt = TestStatement::update("UPDATE orders SET a = 1", &[&orders])
            .with_work(100, Duration::from_millis(10));
        tokio::spawn(async move { session.execute(&mut stmt).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    session.cancel();
    let err = timeout(DEFAULT_TIMEOUT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err.root(), ExecError::Cancelled), "{err}");
    assert!(cluster.node(1).store.committed().is_empty());

    let manager = cluster.node(1).services.manager(&orders).unwrap();
    assert!(manager.holders().is_empty());

    // A cancel only applies to the statement it interrupted.
    session
        .execute(&mut TestStatement::update("UPDATE orders SET a = 2", &[&orders]))
        .await
        .unwrap();
    assert_eq!(
        vec!["UPDATE orders SET a = 2".to_string()],
        cluster.node(1).store.committed()
    );
}

#[tokio::test]
async fn enabling_auto_commit_commits() {
    let cluster = TestCluster::new(1).await;
    let orders = cluster.create_table(1, "orders", &[1]).await;

    let session = cluster.node(1).session();
    session.set_setting("AUTO_COMMIT", "false").await.unwrap();
    assert_eq!("false", session.get_setting("auto_commit").await.unwrap());
    session
        .execute(&mut TestStatement::update("INSERT INTO orders VALUES (1)", &[&orders]))
        .await
        .unwrap();
    assert!(session.in_transaction().await);
    assert!(cluster.node(1).store.committed().is_empty());

    session.set_setting("auto_commit", "true").await.unwrap();
    assert!(!session.in_transaction().await);
    assert_eq!(1, cluster.node(1).store.committed().len());
}

#[tokio::test]
async fn rejected_settings() {
    let cluster = TestCluster::new(1).await;
    let session = cluster.node(1).session();

    let err = session.set_setting("isolation", "serializable").await.unwrap_err();
    assert!(matches!(err, ExecError::UnknownSetting(_)), "{err}");

    let err = session.set_setting("auto_commit", "maybe").await.unwrap_err();
    assert!(matches!(err, ExecError::InvalidSetting { .. }), "{err}");

    let err = session.set_setting("lock_timeout", "0").await.unwrap_err();
    assert!(matches!(err, ExecError::InvalidSetting { .. }), "{err}");

    session.set_setting("lock_timeout", "250").await.unwrap();
    assert_eq!("250", session.get_setting("lock_timeout").await.unwrap());
    assert_eq!("true", session.get_setting("auto_commit").await.unwrap());

    session.reset_settings().await.unwrap();
    assert_eq!("2000", session.get_setting("lock_timeout").await.unwrap());
}

#[tokio::test]
async fn out_of_memory_during_rollback_closes_database() {
    let cluster = TestCluster::new(1).await;
    let items = cluster.create_table(1, "items", &[1]).await;
    let node = cluster.node(1);

    let session = node.session();
    session.set_setting("auto_commit", "off").await.unwrap();
    session
        .execute(&mut TestStatement::update("INSERT INTO items VALUES (1)", &[&items]))
        .await
        .unwrap();

    node.store
        .inject_fault("VALUES (2)", ApplyFault::Exhausted, None);
    node.store.inject_finish_fault(ApplyFault::Exhausted);
    let err = session
        .execute(&mut TestStatement::update("INSERT INTO items VALUES (2)", &[&items]))
        .await
        .unwrap_err();
    assert!(err.is_out_of_memory(), "{err}");

    assert!(node.engine.is_closed());
    assert!(!node.engine.reserve().is_held());

    let err = session
        .execute(&mut TestStatement::query("SELECT * FROM items", &[&items]))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::DatabaseClosed), "{err}");
    assert!(matches!(
        node.engine.new_session(),
        Err(ExecError::DatabaseClosed)
    ));
}

#[tokio::test]
async fn out_of_memory_with_clean_rollback_keeps_running() {
    let cluster = TestCluster::new(1).await;
    let items = cluster.create_table(1, "items", &[1]).await;
    let node = cluster.node(1);

    node.store
        .inject_fault("VALUES (1)", ApplyFault::Exhausted, Some(1));
    let session = node.session();
    let err = session
        .execute(&mut TestStatement::update("INSERT INTO items VALUES (1)", &[&items]))
        .await
        .unwrap_err();
    assert!(err.is_out_of_memory(), "{err}");
    assert!(!node.engine.is_closed());

    // The reserve is back for the next statement.
    session
        .execute(&mut TestStatement::update("INSERT INTO items VALUES (1)", &[&items]))
        .await
        .unwrap();
    assert!(node.engine.reserve().is_held());
}

#[tokio::test]
async fn stale_statements_recompiled() {
    let cluster = TestCluster::new(1).await;
    let orders = cluster.create_table(1, "orders", &[1]).await;
    let session = cluster.node(1).session();

    let mut select = TestStatement::query("SELECT * FROM orders", &[&orders]);
    session.execute(&mut select).await.unwrap();
    assert_eq!(1, select.recompiles);
    assert_eq!(cluster.node(1).engine.schema_version(), select.modification_id);

    session.execute(&mut select).await.unwrap();
    assert_eq!(1, select.recompiles);

    cluster.create_table(1, "items", &[1]).await;
    session.execute(&mut select).await.unwrap();
    assert_eq!(2, select.recompiles);

    let mut always = TestStatement::query("SELECT * FROM orders", &[&orders]);
    always.always_recompile = true;
    always.modification_id = cluster.node(1).engine.schema_version();
    session.execute(&mut always).await.unwrap();
    session.execute(&mut always).await.unwrap();
    assert_eq!(2, always.recompiles);
}

#[tokio::test]
async fn metadata_queries_take_no_locks() {
    let cluster = TestCluster::new(2).await;
    let tables = TableIdentity::new("information_schema", "tables");
    assert!(tables.is_system());

    // No manager exists for metadata tables, so going through the broker
    // would fail.
    let session = cluster.node(2).session();
    session
        .execute(&mut TestStatement::query("SELECT * FROM information_schema.tables", &[&tables]))
        .await
        .unwrap();
    assert!(cluster.node(1).services.manager(&tables).is_err());
}

#[tokio::test]
async fn non_transactional_statement_completes_transaction() {
    let cluster = TestCluster::new(1).await;
    let orders = cluster.create_table(1, "orders", &[1]).await;

    let session = cluster.node(1).session();
    session.set_setting("auto_commit", "off").await.unwrap();
    session
        .execute(&mut TestStatement::update("INSERT INTO orders VALUES (1)", &[&orders]))
        .await
        .unwrap();
    session
        .execute(
            &mut TestStatement::update("ALTER TABLE orders ADD COLUMN b INT", &[&orders])
                .non_transactional(),
        )
        .await
        .unwrap();

    assert!(!session.in_transaction().await);
    assert_eq!(2, cluster.node(1).store.committed().len());
}

#[tokio::test]
async fn close_rolls_back() {
    let cluster = TestCluster::new(2).await;
    let orders = cluster.create_table(1, "orders", &[1, 2]).await;

    let session = cluster.node(1).session();
    session.set_setting("auto_commit", "off").await.unwrap();
    session
        .execute(&mut TestStatement::update("DELETE FROM orders", &[&orders]))
        .await
        .unwrap();

    session.close().await.unwrap();
    for n in 1..=2 {
        assert!(cluster.node(n).store.committed().is_empty());
        assert!(cluster.node(n).store.finished().iter().all(|(_, commit)| !commit));
    }
    let manager = cluster.node(1).services.manager(&orders).unwrap();
    assert!(manager.holders().is_empty());

    let err = session
        .execute(&mut TestStatement::query("SELECT * FROM orders", &[&orders]))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::SessionClosed), "{err}");
    // Closing twice is fine.
    session.close().await.unwrap();
}

#[tokio::test]
async fn dropped_session_rolls_back() {
    let cluster = TestCluster::new(2).await;
    let orders = cluster.create_table(1, "orders", &[1, 2]).await;

    let session = cluster.node(1).session();
    session.set_setting("auto_commit", "off").await.unwrap();
    session
        .execute(&mut TestStatement::update("UPDATE orders SET a = 1", &[&orders]))
        .await
        .unwrap();
    drop(session);

    // Waits for the background rollback to release the write lock.
    cluster
        .node(2)
        .session()
        .execute(&mut TestStatement::update("UPDATE orders SET a = 2", &[&orders]))
        .await
        .unwrap();

    for n in 1..=2 {
        assert_eq!(
            vec!["UPDATE orders SET a = 2".to_string()],
            cluster.node(n).store.committed()
        );
    }
    let manager = cluster.node(1).services.manager(&orders).unwrap();
    assert!(manager.holders().is_empty());
    assert_eq!(1, manager.update_id());
}

#[tokio::test]
async fn drop_and_recreate_table() {
    let cluster = TestCluster::new(1).await;
    let orders = cluster.create_table(1, "orders", &[1]).await;
    let engine = &cluster.node(1).engine;

    let err = engine
        .create_table(&orders, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::TableExists(_)), "{err}");

    engine.drop_table(&orders).await.unwrap();
    let err = cluster
        .node(1)
        .session()
        .execute(&mut TestStatement::query("SELECT * FROM orders", &[&orders]))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), ExecError::TableOrViewNotFound(_)), "{err}");

    engine.create_table(&orders, &[]).await.unwrap();
    assert!(matches!(
        engine.drop_table(&TableIdentity::new("public", "nope")).await,
        Err(ExecError::TableOrViewNotFound(_))
    ));
}

#[tokio::test]
async fn unregistered_table_links_to_remote_replica() {
    let cluster = TestCluster::new(3).await;
    let archive = TableIdentity::new("public", "archive");
    cluster
        .node(1)
        .services
        .system_table()
        .unwrap()
        .add_replica(&archive, cluster.node(3).handle().clone())
        .unwrap();
    cluster.node(3).store.add_table(archive.clone());

    let session = cluster.node(2).session();
    for _ in 0..2 {
        session
            .execute(&mut TestStatement::query("SELECT * FROM archive", &[&archive]))
            .await
            .unwrap();
    }
    let directory = cluster.node(2).engine.directory();
    assert_eq!(1, directory.stats().remote_links);
    assert_eq!(Some(cluster.node(3).handle().clone()), directory.linked_replica(&archive));

    // Replicas on inactive nodes aren't candidates.
    let other = TableIdentity::new("public", "other");
    cluster
        .node(1)
        .services
        .system_table()
        .unwrap()
        .add_replica(&other, cluster.node(3).handle().clone())
        .unwrap();
    cluster.node(3).store.add_table(other.clone());
    cluster.node(3).engine.set_active(false).await.unwrap();
    let err = session
        .execute(&mut TestStatement::query("SELECT * FROM other", &[&other]))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), ExecError::TableOrViewNotFound(_)), "{err}");
}
