//! Store decorator that fails inserts into chosen tables, the way a
//! constraint violation would. Every other statement reaches the wrapped store.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::debug;

use crate::{Statement, Store, StoreError, StoreTransaction};

pub struct FailingStore<S> {
    inner: S,
    tables: BTreeSet<String>,
}

impl<S: Store> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            tables: BTreeSet::new(),
        }
    }

    pub fn fail_inserts_into(mut self, table: &str) -> Self {
        self.tables.insert(table.to_string());
        self
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: Store> Store for FailingStore<S> {
    async fn begin<'a>(&'a mut self) -> Result<Box<dyn StoreTransaction + 'a>, StoreError> {
        let inner = self.inner.begin().await?;
        Ok(Box::new(FailingTransaction {
            inner,
            tables: &self.tables,
        }))
    }
}

struct FailingTransaction<'a> {
    inner: Box<dyn StoreTransaction + 'a>,
    tables: &'a BTreeSet<String>,
}

/// Target table of an `INSERT INTO <table> ...` statement.
fn insert_target(sql: &str) -> Option<&str> {
    let mut words = sql.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("insert") || !words.next()?.eq_ignore_ascii_case("into") {
        return None;
    }
    words.next()?.split('(').next().filter(|t| !t.is_empty())
}

impl<'a> FailingTransaction<'a> {
    fn check(&self, statement: &Statement) -> Result<(), StoreError> {
        match insert_target(statement.sql()) {
            Some(table) if self.tables.contains(table) => {
                debug!(table, "failing insert on request");
                Err(StoreError::Write(format!("injected failure inserting into {table}")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<'a> StoreTransaction for FailingTransaction<'a> {
    async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
        self.check(statement)?;
        self.inner.execute(statement).await
    }

    async fn fetch_id(&mut self, statement: &Statement) -> Result<Option<i64>, StoreError> {
        self.check(statement)?;
        self.inner.fetch_id(statement).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records what reaches it; stands in for a connection.
    #[derive(Default, Clone)]
    struct RecordingStore {
        seen: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingTransaction {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Store for RecordingStore {
        async fn begin<'a>(&'a mut self) -> Result<Box<dyn StoreTransaction + 'a>, StoreError> {
            Ok(Box::new(RecordingTransaction {
                seen: Arc::clone(&self.seen),
            }))
        }
    }

    #[async_trait]
    impl StoreTransaction for RecordingTransaction {
        async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
            self.seen.lock().unwrap().push(statement.sql().to_string());
            Ok(1)
        }

        async fn fetch_id(&mut self, statement: &Statement) -> Result<Option<i64>, StoreError> {
            self.seen.lock().unwrap().push(statement.sql().to_string());
            Ok(Some(1))
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.seen.lock().unwrap().push("COMMIT".to_string());
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            self.seen.lock().unwrap().push("ROLLBACK".to_string());
            Ok(())
        }
    }

    fn stmt(sql: &'static str) -> Statement {
        Statement::new(sql, vec![]).unwrap()
    }

    #[test]
    fn insert_target_reads_the_table_name() {
        assert_eq!(insert_target("INSERT INTO rehab (a) VALUES (1)"), Some("rehab"));
        assert_eq!(insert_target("insert into hoa(a) values (1)"), Some("hoa"));
        assert_eq!(insert_target("SELECT id FROM rehab"), None);
    }

    #[tokio::test]
    async fn only_inserts_into_failing_tables_are_blocked() {
        let recording = RecordingStore::default();
        let mut store = FailingStore::new(recording.clone()).fail_inserts_into("rehab");

        let mut tx = store.begin().await.unwrap();
        tx.execute(&stmt("INSERT INTO hoa (a) VALUES (1)")).await.unwrap();
        let err = tx.execute(&stmt("INSERT INTO rehab (a) VALUES (1)")).await.unwrap_err();
        assert!(matches!(err, StoreError::Write(_)));
        assert!(!err.is_fatal());
        tx.rollback().await.unwrap();

        let seen = recording.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["INSERT INTO hoa (a) VALUES (1)", "ROLLBACK"]);
    }
}
