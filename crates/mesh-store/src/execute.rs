//! Managed execution: run an action in a transaction, retrying on contention.
//!
//! [`MeshBase::execute_now`] and [`MeshBase::execute_asap`] are the only
//! places that classify failures and retry. Everything below them reports
//! narrow, typed errors and leaves the decision to the caller.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::extension::ObjectExtension;
use crate::meshbase::MeshBase;
use crate::transaction::Transaction;

/// Signals an action may return instead of a value.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// Roll back and try again, within the retry bound.
    #[error("action asked to be retried")]
    Retry,

    /// Roll back and stop. Not an error from the caller's point of view.
    #[error("action asked to be rolled back")]
    Rollback,

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ActionError {
    /// Whether another attempt may succeed. Unexpected failures count as
    /// retryable; policy and consistency failures do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Retry | Self::Other(_) => true,
            Self::Mesh(e) => e.is_retryable(),
            Self::Rollback => false,
        }
    }
}

/// Failure of a managed execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// No transaction could be started.
    #[error("cannot create transaction: {0}")]
    TransactionCreation(#[source] MeshError),

    /// The action, or the commit, failed with a store error.
    #[error("transaction action failed: {0}")]
    Action(#[source] MeshError),

    #[error("transaction action failed unexpectedly: {0}")]
    Unexpected(anyhow::Error),
}

impl From<ActionError> for ExecuteError {
    fn from(e: ActionError) -> Self {
        match e {
            ActionError::Mesh(e) => Self::Action(e),
            ActionError::Other(e) => Self::Unexpected(e),
            ActionError::Retry => Self::Unexpected(anyhow::anyhow!("retries exhausted")),
            ActionError::Rollback => Self::Unexpected(anyhow::anyhow!("rolled back")),
        }
    }
}

/// Work to run inside a transaction.
///
/// Closures taking `&Arc<Transaction>` implement this with the default
/// retry bound and no rollback hooks.
pub trait TransactionAction<T> {
    fn execute(&mut self, tx: &Arc<Transaction>) -> Result<T, ActionError>;

    /// How often to retry after a retryable failure. The store's
    /// `max_commit_retries` caps this.
    fn max_retries(&self) -> u32 {
        3
    }

    /// Runs before a failed attempt is rolled back.
    fn pre_rollback(&mut self, _tx: &Arc<Transaction>, _cause: &ActionError) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after a failed attempt has been rolled back.
    fn post_rollback(&mut self, _tx: &Arc<Transaction>, _cause: &ActionError) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<T, F> TransactionAction<T> for F
where
    F: FnMut(&Arc<Transaction>) -> Result<T, ActionError>,
{
    fn execute(&mut self, tx: &Arc<Transaction>) -> Result<T, ActionError> {
        self(tx)
    }
}

impl<E: ObjectExtension> MeshBase<E> {
    /// Run `action` in a new transaction, failing at once if another thread
    /// holds one. Inside a transaction of the calling thread the action runs
    /// inline and the enclosing transaction is left alone.
    ///
    /// Returns `Ok(None)` if the action asked to be rolled back.
    pub fn execute_now<T>(&self, action: impl TransactionAction<T>) -> Result<Option<T>, ExecuteError> {
        self.execute_managed(action, Self::create_transaction_now_if_needed)
    }

    /// As [`execute_now`](Self::execute_now), but waits for a transaction of
    /// another thread to finish first.
    pub fn execute_asap<T>(&self, action: impl TransactionAction<T>) -> Result<Option<T>, ExecuteError> {
        self.execute_managed(action, Self::create_transaction_asap_if_needed)
    }

    fn execute_managed<T, A>(
        &self,
        mut action: A,
        create: fn(&Self) -> MeshResult<Option<Arc<Transaction>>>,
    ) -> Result<Option<T>, ExecuteError>
    where
        A: TransactionAction<T>,
    {
        let retries = action.max_retries().min(self.config().max_commit_retries);
        let mut first_failure: Option<ActionError> = None;

        for attempt in 0..=retries {
            let tx = match create(self) {
                Ok(Some(tx)) => tx,
                Ok(None) => return self.execute_inline(&mut action),
                Err(e) => {
                    let Some(earlier) = first_failure else {
                        return Err(ExecuteError::TransactionCreation(e));
                    };
                    warn!(
                        store = %self.identifier(),
                        attempt,
                        error = %e,
                        earlier = %earlier,
                        "cannot start retry, giving up"
                    );
                    return Err(earlier.into());
                }
            };

            let err = match action.execute(&tx) {
                Ok(value) => {
                    tx.commit().map_err(ExecuteError::Action)?;
                    return Ok(Some(value));
                }
                Err(ActionError::Rollback) => {
                    tx.rollback().map_err(ExecuteError::Action)?;
                    debug!(store = %self.identifier(), tx = %tx.id(), "action rolled back on request");
                    return Ok(None);
                }
                Err(err) => err,
            };

            self.rollback_with_hooks(&mut action, &tx, &err);
            let retryable = err.is_retryable();
            debug!(
                store = %self.identifier(),
                tx = %tx.id(),
                attempt,
                retryable,
                error = %err,
                "transaction action failed"
            );
            if first_failure.is_none() {
                first_failure = Some(err);
            }
            if !retryable {
                break;
            }
        }

        Err(first_failure.map_or_else(
            || ExecuteError::Unexpected(anyhow::anyhow!("no attempt was made")),
            ExecuteError::from,
        ))
    }

    fn execute_inline<T>(&self, action: &mut impl TransactionAction<T>) -> Result<Option<T>, ExecuteError> {
        let tx = self
            .check_transaction()
            .map_err(ExecuteError::TransactionCreation)?;
        match action.execute(&tx) {
            Ok(value) => Ok(Some(value)),
            Err(ActionError::Rollback) => {
                debug!(store = %self.identifier(), tx = %tx.id(), "rollback requested inside enclosing transaction");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn rollback_with_hooks<T>(
        &self,
        action: &mut impl TransactionAction<T>,
        tx: &Arc<Transaction>,
        cause: &ActionError,
    ) {
        if let Err(e) = action.pre_rollback(tx, cause) {
            warn!(store = %self.identifier(), tx = %tx.id(), error = %e, "pre-rollback hook failed");
        }
        if let Err(e) = tx.rollback() {
            warn!(store = %self.identifier(), tx = %tx.id(), error = %e, "rollback failed");
        }
        if let Err(e) = action.post_rollback(tx, cause) {
            warn!(store = %self.identifier(), tx = %tx.id(), error = %e, "post-rollback hook failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Operation;
    use crate::config::MeshBaseConfig;
    use mesh_types::{MeshBaseIdentifier, MeshObjectIdentifier};
    use std::sync::Mutex;

    fn base(max_commit_retries: u32) -> Arc<MeshBase> {
        MeshBase::builder(MeshBaseIdentifier::parse("exec").unwrap())
            .config(MeshBaseConfig {
                max_commit_retries,
                asap_attempts: 2,
                asap_interval_ms: 5,
                ..Default::default()
            })
            .build()
    }

    fn busy() -> MeshError {
        MeshError::CannotObtainLock {
            object: MeshObjectIdentifier::new("x").unwrap(),
            cause: None,
        }
    }

    #[test]
    fn commits_on_success() {
        let mb = base(5);
        let id = mb
            .execute_now(|_tx: &Arc<Transaction>| -> Result<_, ActionError> {
                let obj = mb.lifecycle().create_mesh_object()?;
                Ok(obj.identifier().clone())
            })
            .unwrap()
            .unwrap();
        assert!(mb.current_transaction().is_none());
        assert!(mb.find_by_identifier(&id).is_some());
    }

    #[test]
    fn rollback_signal_undoes_and_returns_none() {
        let mb = base(5);
        let result: Option<()> = mb
            .execute_now(|_tx: &Arc<Transaction>| -> Result<(), ActionError> {
                mb.lifecycle().create_mesh_object()?;
                Err(ActionError::Rollback)
            })
            .unwrap();
        assert!(result.is_none());
        assert_eq!(mb.size(), 1);
    }

    #[test]
    fn retryable_failures_are_retried_up_to_bound() {
        let mb = base(5);
        let mut calls = 0;
        let err = mb
            .execute_now(|_tx: &Arc<Transaction>| -> Result<(), ActionError> {
                calls += 1;
                mb.lifecycle().create_mesh_object()?;
                Err(busy().into())
            })
            .unwrap_err();
        // default bound of 3 retries, below the store's cap of 5
        assert_eq!(calls, 4);
        assert!(matches!(err, ExecuteError::Action(MeshError::CannotObtainLock { .. })));
        assert_eq!(mb.size(), 1);
    }

    #[test]
    fn store_config_caps_retries() {
        let mb = base(1);
        let mut calls = 0;
        let _ = mb.execute_now(|_tx: &Arc<Transaction>| -> Result<(), ActionError> {
            calls += 1;
            Err(ActionError::Retry)
        });
        assert_eq!(calls, 2);
    }

    #[test]
    fn succeeds_after_transient_failure() {
        let mb = base(5);
        let mut calls = 0;
        let value = mb
            .execute_asap(|_tx: &Arc<Transaction>| -> Result<i32, ActionError> {
                calls += 1;
                if calls < 3 {
                    Err(ActionError::Retry)
                } else {
                    Ok(calls)
                }
            })
            .unwrap();
        assert_eq!(value, Some(3));
    }

    #[test]
    fn consistency_errors_are_not_retried() {
        let mb = base(5);
        let mut calls = 0;
        let err = mb
            .execute_now(|_tx: &Arc<Transaction>| -> Result<(), ActionError> {
                calls += 1;
                let a = mb.lifecycle().create_mesh_object()?;
                a.relate(&a)?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, ExecuteError::Action(MeshError::CannotRelateToItself(_))));
    }

    #[test]
    fn unexpected_errors_surface_as_first_failure() {
        let mb = base(5);
        let mut calls = 0;
        let err = mb
            .execute_now(|_tx: &Arc<Transaction>| -> Result<(), ActionError> {
                calls += 1;
                if calls == 1 {
                    Err(anyhow::anyhow!("disk on fire").into())
                } else {
                    Err(ActionError::Retry)
                }
            })
            .unwrap_err();
        match err {
            ExecuteError::Unexpected(e) => assert!(e.to_string().contains("disk on fire")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn nested_execution_runs_inline() {
        let mb = base(5);
        let tx = mb.create_transaction_now().unwrap();
        let inner = mb
            .execute_now(|inner: &Arc<Transaction>| -> Result<_, ActionError> { Ok(inner.id()) })
            .unwrap();
        assert_eq!(inner, Some(tx.id()));
        assert!(tx.is_active());
        tx.commit().unwrap();
    }

    #[test]
    fn busy_store_fails_creation() {
        let mb = base(5);
        let tx = {
            let mb = Arc::clone(&mb);
            std::thread::spawn(move || mb.create_transaction_now().unwrap())
                .join()
                .unwrap()
        };
        let err = mb
            .execute_now(|_tx: &Arc<Transaction>| -> Result<(), ActionError> { Ok(()) })
            .unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::TransactionCreation(MeshError::TransactionActiveAlready { .. })
        ));
        assert!(tx.is_active());
    }

    #[test]
    fn failed_retry_creation_reports_the_action_failure() {
        struct Contended {
            base: Arc<MeshBase>,
        }
        impl TransactionAction<()> for Contended {
            fn execute(&mut self, _tx: &Arc<Transaction>) -> Result<(), ActionError> {
                Err(busy().into())
            }
            fn post_rollback(&mut self, _tx: &Arc<Transaction>, _cause: &ActionError) -> anyhow::Result<()> {
                let mb = Arc::clone(&self.base);
                std::thread::spawn(move || mb.create_transaction_now().map(|_| ()))
                    .join()
                    .unwrap()?;
                Ok(())
            }
        }

        let mb = base(5);
        let err = mb
            .execute_now(Contended { base: Arc::clone(&mb) })
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Action(MeshError::CannotObtainLock { .. })));
        assert!(mb.current_transaction().is_some_and(|tx| tx.is_active()));
    }

    #[test]
    fn rollback_hooks_run_around_each_failed_attempt() {
        struct Hooked {
            log: Arc<Mutex<Vec<&'static str>>>,
        }
        impl Hooked {
            fn push(&self, entry: &'static str) {
                self.log.lock().unwrap().push(entry);
            }
        }
        impl TransactionAction<()> for Hooked {
            fn execute(&mut self, _tx: &Arc<Transaction>) -> Result<(), ActionError> {
                self.push("execute");
                Err(MeshError::NotPermitted {
                    object: MeshObjectIdentifier::new("x").unwrap(),
                    operation: Operation::Bless,
                }
                .into())
            }
            fn pre_rollback(&mut self, tx: &Arc<Transaction>, _cause: &ActionError) -> anyhow::Result<()> {
                assert!(tx.is_active());
                self.push("pre");
                anyhow::bail!("hook failures are only logged")
            }
            fn post_rollback(&mut self, tx: &Arc<Transaction>, _cause: &ActionError) -> anyhow::Result<()> {
                assert!(!tx.is_active());
                self.push("post");
                Ok(())
            }
        }

        let mb = base(5);
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = mb
            .execute_now(Hooked {
                log: Arc::clone(&log),
            })
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Action(MeshError::NotPermitted { .. })));
        assert_eq!(*log.lock().unwrap(), vec!["execute", "pre", "post"]);
    }
}
