//! Transaction operations and their compensations.
//!
//! Every store call a transaction can make is one [`OperationKind`] variant.
//! Executing a mutating operation may produce a compensating operation, built
//! from the forward result and, when available, a snapshot of the document
//! taken just before the mutation:
//!
//! | forward                 | compensation                                   |
//! |-------------------------|------------------------------------------------|
//! | insert                  | remove (forward CAS)                           |
//! | upsert                  | remove if the document was absent, else replace with the prior value |
//! | replace                 | replace with the prior value (forward CAS)     |
//! | remove                  | insert the prior value                         |
//! | increment / decrement   | the opposite counter by the applied change; remove if the counter was created |
//! | touch                   | touch with the prior expiry                    |
//! | unlock                  | get                                            |
//! | get / query             | none                                           |

use crate::error::{ClientError, ClientResult};
use crate::store::{
    Cas, CounterOptions, DurabilityLevel, QueryOptions, RemoveOptions, StoreClient, StoreMode,
    StoreOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Get,
    Insert,
    Upsert,
    Replace,
    Remove,
    Increment,
    Decrement,
    Touch,
    Unlock,
    Query,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Get => "get",
            OperationType::Insert => "insert",
            OperationType::Upsert => "upsert",
            OperationType::Replace => "replace",
            OperationType::Remove => "remove",
            OperationType::Increment => "increment",
            OperationType::Decrement => "decrement",
            OperationType::Touch => "touch",
            OperationType::Unlock => "unlock",
            OperationType::Query => "query",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    Get,
    Insert { value: Value, options: StoreOptions },
    Upsert { value: Value, options: StoreOptions },
    Replace { value: Value, options: StoreOptions },
    Remove { options: RemoveOptions },
    Increment { delta: u64, options: CounterOptions },
    Decrement { delta: u64, options: CounterOptions },
    Touch { expiry: Option<Duration> },
    Unlock { cas: Cas },
    Query { statement: String, options: QueryOptions },
}

impl OperationKind {
    pub fn operation_type(&self) -> OperationType {
        match self {
            OperationKind::Get => OperationType::Get,
            OperationKind::Insert { .. } => OperationType::Insert,
            OperationKind::Upsert { .. } => OperationType::Upsert,
            OperationKind::Replace { .. } => OperationType::Replace,
            OperationKind::Remove { .. } => OperationType::Remove,
            OperationKind::Increment { .. } => OperationType::Increment,
            OperationKind::Decrement { .. } => OperationType::Decrement,
            OperationKind::Touch { .. } => OperationType::Touch,
            OperationKind::Unlock { .. } => OperationType::Unlock,
            OperationKind::Query { .. } => OperationType::Query,
        }
    }

    /// Operations that change the document and hand back its new CAS
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            OperationKind::Get | OperationKind::Unlock { .. } | OperationKind::Query { .. }
        )
    }

    /// Operations whose compensation depends on the document's prior state
    pub fn needs_snapshot(&self) -> bool {
        matches!(
            self,
            OperationKind::Upsert { .. }
                | OperationKind::Replace { .. }
                | OperationKind::Remove { .. }
                | OperationKind::Increment { .. }
                | OperationKind::Decrement { .. }
                | OperationKind::Touch { .. }
        )
    }
}

/// What a document looked like before a transaction mutated it
#[derive(Debug, Clone, PartialEq)]
pub enum PriorState {
    Absent,
    Present {
        value: Value,
        cas: Cas,
        expiry: Option<Duration>,
    },
}

impl PriorState {
    /// Read `key`; a missing document is a valid snapshot, any other error is not
    pub fn capture<S: StoreClient + ?Sized>(client: &S, key: &str) -> ClientResult<Self> {
        match client.get(key) {
            Ok(found) => Ok(PriorState::Present {
                value: found.value,
                cas: found.cas,
                expiry: found.expiry,
            }),
            Err(ClientError::DocumentNotFound { .. }) => Ok(PriorState::Absent),
            Err(error) => Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOperation {
    pub key: String,
    pub kind: OperationKind,
    pub result_cas: Option<Cas>,
    pub result_value: Option<Value>,
}

impl TransactionOperation {
    pub fn new(key: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            key: key.into(),
            kind,
            result_cas: None,
            result_value: None,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(key, OperationKind::Get)
    }

    pub fn insert(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(
            key,
            OperationKind::Insert {
                value: value.into(),
                options: StoreOptions::default(),
            },
        )
    }

    pub fn upsert(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(
            key,
            OperationKind::Upsert {
                value: value.into(),
                options: StoreOptions::default(),
            },
        )
    }

    pub fn replace(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(
            key,
            OperationKind::Replace {
                value: value.into(),
                options: StoreOptions::default(),
            },
        )
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self::new(
            key,
            OperationKind::Remove {
                options: RemoveOptions::default(),
            },
        )
    }

    /// A missing counter is created holding `delta`
    pub fn increment(key: impl Into<String>, delta: u64) -> Self {
        Self::new(
            key,
            OperationKind::Increment {
                delta,
                options: CounterOptions {
                    initial: Some(delta),
                    ..Default::default()
                },
            },
        )
    }

    /// A missing counter is created holding zero
    pub fn decrement(key: impl Into<String>, delta: u64) -> Self {
        Self::new(
            key,
            OperationKind::Decrement {
                delta,
                options: CounterOptions {
                    initial: Some(0),
                    ..Default::default()
                },
            },
        )
    }

    pub fn touch(key: impl Into<String>, expiry: Option<Duration>) -> Self {
        Self::new(key, OperationKind::Touch { expiry })
    }

    pub fn unlock(key: impl Into<String>, cas: Cas) -> Self {
        Self::new(key, OperationKind::Unlock { cas })
    }

    pub fn query(statement: impl Into<String>, options: QueryOptions) -> Self {
        let statement = statement.into();
        Self::new(statement.clone(), OperationKind::Query { statement, options })
    }

    /// Require the document to carry `cas`. Applies to store and remove operations.
    pub fn with_cas(mut self, cas: Cas) -> Self {
        match &mut self.kind {
            OperationKind::Insert { options, .. }
            | OperationKind::Upsert { options, .. }
            | OperationKind::Replace { options, .. } => options.cas = Some(cas),
            OperationKind::Remove { options } => options.cas = Some(cas),
            _ => {}
        }
        self
    }

    /// Applies to store and counter operations
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        match &mut self.kind {
            OperationKind::Insert { options, .. }
            | OperationKind::Upsert { options, .. }
            | OperationKind::Replace { options, .. } => options.expiry = Some(expiry),
            OperationKind::Increment { options, .. } | OperationKind::Decrement { options, .. } => {
                options.expiry = Some(expiry)
            }
            _ => {}
        }
        self
    }

    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        match &mut self.kind {
            OperationKind::Insert { options, .. }
            | OperationKind::Upsert { options, .. }
            | OperationKind::Replace { options, .. } => options.durability = durability,
            OperationKind::Remove { options } => options.durability = durability,
            OperationKind::Increment { options, .. } | OperationKind::Decrement { options, .. } => {
                options.durability = durability
            }
            _ => {}
        }
        self
    }

    /// Counter value to create a missing document with. `None` makes a
    /// missing counter fail the operation.
    pub fn with_initial(mut self, initial: Option<u64>) -> Self {
        if let OperationKind::Increment { options, .. } | OperationKind::Decrement { options, .. } =
            &mut self.kind
        {
            options.initial = initial;
        }
        self
    }

    pub fn operation_type(&self) -> OperationType {
        self.kind.operation_type()
    }

    /// Move an existing CAS guard to `cas`. Unguarded operations stay unguarded.
    pub(crate) fn rebase_cas(&mut self, cas: Cas) {
        let guard = match &mut self.kind {
            OperationKind::Insert { options, .. }
            | OperationKind::Upsert { options, .. }
            | OperationKind::Replace { options, .. } => &mut options.cas,
            OperationKind::Remove { options } => &mut options.cas,
            _ => return,
        };
        if guard.is_some() {
            *guard = Some(cas);
        }
    }

    /// Run the operation and record its result
    pub(crate) fn apply<S: StoreClient + ?Sized>(&mut self, client: &S) -> ClientResult<()> {
        let key = self.key.as_str();
        match &self.kind {
            OperationKind::Get => {
                let found = client.get(key)?;
                self.result_cas = Some(found.cas);
                self.result_value = Some(found.value);
            }
            OperationKind::Insert { value, options } => {
                self.result_cas = Some(client.store(key, value.clone(), StoreMode::Insert, options)?.cas);
            }
            OperationKind::Upsert { value, options } => {
                self.result_cas = Some(client.store(key, value.clone(), StoreMode::Upsert, options)?.cas);
            }
            OperationKind::Replace { value, options } => {
                self.result_cas = Some(client.store(key, value.clone(), StoreMode::Replace, options)?.cas);
            }
            OperationKind::Remove { options } => {
                self.result_cas = Some(client.remove(key, options)?.cas);
            }
            OperationKind::Increment { delta, options } => {
                let result = client.counter(key, signed_delta(*delta)?, options)?;
                self.result_cas = Some(result.cas);
                self.result_value = Some(json!(result.value));
            }
            OperationKind::Decrement { delta, options } => {
                let result = client.counter(key, -signed_delta(*delta)?, options)?;
                self.result_cas = Some(result.cas);
                self.result_value = Some(json!(result.value));
            }
            OperationKind::Touch { expiry } => {
                self.result_cas = Some(client.touch(key, *expiry)?.cas);
            }
            OperationKind::Unlock { cas } => {
                client.unlock(key, *cas)?;
            }
            OperationKind::Query { statement, options } => {
                let result = client.query(statement, options)?;
                self.result_value = Some(Value::Array(result.rows));
            }
        }
        Ok(())
    }

    /// The operation that undoes this one, given its recorded result and the
    /// snapshot taken before it ran. Without a snapshot only blind inverses are
    /// possible: upsert becomes remove and counters reverse by `delta`.
    pub(crate) fn compensation(&self, prior: Option<&PriorState>) -> Option<TransactionOperation> {
        let remove = |cas: Option<Cas>| {
            TransactionOperation::new(
                self.key.clone(),
                OperationKind::Remove {
                    options: RemoveOptions {
                        cas,
                        ..Default::default()
                    },
                },
            )
        };
        let restore = |value: &Value, expiry: Option<Duration>| {
            TransactionOperation::new(
                self.key.clone(),
                OperationKind::Replace {
                    value: value.clone(),
                    options: StoreOptions {
                        cas: self.result_cas,
                        expiry,
                        ..Default::default()
                    },
                },
            )
        };

        match (&self.kind, prior) {
            (OperationKind::Get, _) | (OperationKind::Query { .. }, _) => None,

            (OperationKind::Insert { .. }, _) => Some(remove(self.result_cas)),

            (OperationKind::Upsert { .. }, Some(PriorState::Present { value, expiry, .. }))
            | (OperationKind::Replace { .. }, Some(PriorState::Present { value, expiry, .. })) => {
                Some(restore(value, *expiry))
            }
            (OperationKind::Upsert { .. }, _) => Some(remove(self.result_cas)),
            (OperationKind::Replace { .. }, _) => None,

            (OperationKind::Remove { .. }, Some(PriorState::Present { value, expiry, .. })) => {
                Some(TransactionOperation::new(
                    self.key.clone(),
                    OperationKind::Insert {
                        value: value.clone(),
                        options: StoreOptions {
                            expiry: *expiry,
                            ..Default::default()
                        },
                    },
                ))
            }
            (OperationKind::Remove { .. }, _) => None,

            (OperationKind::Increment { .. }, Some(PriorState::Absent))
            | (OperationKind::Decrement { .. }, Some(PriorState::Absent)) => {
                Some(remove(self.result_cas))
            }
            (OperationKind::Increment { delta, .. }, prior) => {
                let change = self.applied_change(prior).unwrap_or(*delta);
                (change > 0).then(|| self.counter(OperationType::Decrement, change))
            }
            (OperationKind::Decrement { delta, .. }, prior) => {
                let change = self.applied_change(prior).unwrap_or(*delta);
                (change > 0).then(|| self.counter(OperationType::Increment, change))
            }

            (OperationKind::Touch { .. }, Some(PriorState::Present { expiry, .. })) => Some(
                TransactionOperation::new(self.key.clone(), OperationKind::Touch { expiry: *expiry }),
            ),
            (OperationKind::Touch { .. }, _) => None,

            (OperationKind::Unlock { .. }, _) => Some(TransactionOperation::get(self.key.clone())),
        }
    }

    /// Distance between the counter before and after the operation. Decrements
    /// saturate at zero, so this can be smaller than the requested delta.
    fn applied_change(&self, prior: Option<&PriorState>) -> Option<u64> {
        let before = match prior? {
            PriorState::Present { value, .. } => value.as_u64()?,
            PriorState::Absent => return None,
        };
        let after = self.result_value.as_ref()?.as_u64()?;
        Some(before.abs_diff(after))
    }

    fn counter(&self, direction: OperationType, delta: u64) -> TransactionOperation {
        let options = CounterOptions::default();
        let kind = match direction {
            OperationType::Increment => OperationKind::Increment { delta, options },
            _ => OperationKind::Decrement { delta, options },
        };
        TransactionOperation::new(self.key.clone(), kind)
    }
}

fn signed_delta(delta: u64) -> ClientResult<i64> {
    i64::try_from(delta)
        .map_err(|_| ClientError::InvalidArgument(format!("counter delta {delta} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn present(value: Value) -> PriorState {
        PriorState::Present {
            value,
            cas: Cas(1),
            expiry: None,
        }
    }

    #[test]
    fn test_read_only_operations_have_no_compensation() {
        assert!(TransactionOperation::get("k").compensation(None).is_none());
        let query = TransactionOperation::query("SELECT 1", QueryOptions::default());
        assert!(query.compensation(None).is_none());
    }

    #[test]
    fn test_upsert_compensation_depends_on_prior_state() {
        let mut op = TransactionOperation::upsert("k", "new");
        op.result_cas = Some(Cas(9));

        let undo = op.compensation(Some(&PriorState::Absent)).unwrap();
        assert_eq!(undo.operation_type(), OperationType::Remove);

        let undo = op.compensation(Some(&present(json!("old")))).unwrap();
        assert_eq!(undo.operation_type(), OperationType::Replace);
        match undo.kind {
            OperationKind::Replace { value, options } => {
                assert_eq!(value, json!("old"));
                assert_eq!(options.cas, Some(Cas(9)));
            }
            other => panic!("unexpected compensation {other:?}"),
        }
    }

    #[test]
    fn test_counter_compensation_uses_applied_change() {
        let mut op = TransactionOperation::decrement("ctr", 10);
        op.result_value = Some(json!(0));
        let undo = op.compensation(Some(&present(json!(4)))).unwrap();
        assert_eq!(
            undo.kind,
            OperationKind::Increment {
                delta: 4,
                options: CounterOptions::default()
            }
        );

        let mut blind = TransactionOperation::increment("ctr", 5);
        blind.result_value = Some(json!(12));
        let undo = blind.compensation(None).unwrap();
        assert_eq!(undo.operation_type(), OperationType::Decrement);

        let created = TransactionOperation::increment("ctr", 5);
        let undo = created.compensation(Some(&PriorState::Absent)).unwrap();
        assert_eq!(undo.operation_type(), OperationType::Remove);
    }

    #[test]
    fn test_unlock_maps_to_get() {
        let op = TransactionOperation::unlock("k", Cas(3));
        let undo = op.compensation(None).unwrap();
        assert_eq!(undo.operation_type(), OperationType::Get);
    }

    #[test]
    fn test_apply_records_results() {
        let store = InMemoryStore::new();
        let mut insert = TransactionOperation::insert("k", json!({"n": 1}));
        insert.apply(&store).unwrap();
        assert!(insert.result_cas.is_some());

        let mut get = TransactionOperation::get("k");
        get.apply(&store).unwrap();
        assert_eq!(get.result_value, Some(json!({"n": 1})));
        assert_eq!(get.result_cas, insert.result_cas);

        let mut counter = TransactionOperation::increment("ctr", 5);
        counter.apply(&store).unwrap();
        assert_eq!(counter.result_value, Some(json!(5)));
    }

    #[test]
    fn test_capture_snapshot() {
        let store = InMemoryStore::new();
        assert_eq!(PriorState::capture(&store, "k").unwrap(), PriorState::Absent);
        store
            .store("k", json!(1), StoreMode::Upsert, &StoreOptions::default())
            .unwrap();
        assert!(matches!(
            PriorState::capture(&store, "k").unwrap(),
            PriorState::Present { .. }
        ));
    }

    #[test]
    fn test_builders_apply_to_matching_variants() {
        let op = TransactionOperation::remove("k").with_cas(Cas(7));
        assert_eq!(
            op.kind,
            OperationKind::Remove {
                options: RemoveOptions {
                    cas: Some(Cas(7)),
                    ..Default::default()
                }
            }
        );
        let op = TransactionOperation::increment("c", 1).with_initial(None);
        assert!(matches!(
            op.kind,
            OperationKind::Increment { options: CounterOptions { initial: None, .. }, .. }
        ));
    }
}
