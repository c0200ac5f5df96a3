//! Identity resolution.
//!
//! An [`Identity`] is the ordered list of `(column, value)` pairs that
//! identifies a persisted row: by default the primary key, or any other
//! set of columns chosen with [`make_identity`]. Objects whose identity
//! columns are not all set have no identity and are always treated as new.

use crate::model::Model;
use crate::object::{AnyObj, Entity};
use crate::statement::Filter;
use crate::value::{Value, hash_value};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// The identifying column values of one object.
#[derive(Debug, Clone)]
pub struct Identity(Vec<(&'static str, Value)>);

impl Identity {
    /// Build an identity; returns `None` when any value is NULL.
    pub fn new(pairs: Vec<(&'static str, Value)>) -> Option<Self> {
        if pairs.is_empty() || pairs.iter().any(|(_, v)| v.is_null()) {
            return None;
        }
        Some(Self(pairs))
    }

    pub fn pairs(&self) -> &[(&'static str, Value)] {
        &self.0
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(|(c, _)| *c)
    }

    pub fn values(&self) -> Vec<Value> {
        self.0.iter().map(|(_, v)| v.clone()).collect()
    }

    /// A single value for the identity: the scalar itself for one column,
    /// an array for composite identities.
    pub fn value(&self) -> Value {
        match self.0.as_slice() {
            [(_, single)] => single.clone(),
            many => Value::Array(many.iter().map(|(_, v)| v.clone()).collect()),
        }
    }

    /// Predicate matching exactly this identity.
    pub fn to_filter(&self) -> Filter {
        match self.0.as_slice() {
            [(column, value)] => Filter::Eq(*column, value.clone()),
            many => Filter::And(
                many.iter()
                    .map(|(column, value)| Filter::Eq(*column, value.clone()))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|((ca, va), (cb, vb))| ca == cb && va.key_eq(vb))
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (column, value) in &self.0 {
            column.hash(state);
            hash_value(value, state);
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, (column, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{column}={}", value.to_json())?;
        }
        f.write_str(")")
    }
}

/// Computes the identity of an object, or `None` when it has none.
pub type IdentityFn = Arc<dyn Fn(&dyn Entity) -> Option<Identity> + Send + Sync>;

/// The primary-key identity of an object.
pub fn identity(obj: &dyn Entity) -> Option<Identity> {
    let columns = obj.primary_key_columns();
    let values = obj.primary_key_value();
    if columns.len() != values.len() {
        return None;
    }
    Identity::new(columns.iter().copied().zip(values).collect())
}

/// The primary-key identity function.
pub fn primary_identity() -> IdentityFn {
    Arc::new(identity)
}

/// Build an identity function over an arbitrary column list.
///
/// Columns missing from the object's row count as NULL.
pub fn make_identity(columns: &'static [&'static str]) -> IdentityFn {
    Arc::new(move |obj: &dyn Entity| {
        let row = obj.to_row();
        let pairs = columns
            .iter()
            .map(|column| {
                let value = row
                    .iter()
                    .find(|(name, _)| name == column)
                    .map_or(Value::Null, |(_, v)| v.clone());
                (*column, value)
            })
            .collect();
        Identity::new(pairs)
    })
}

/// The primary-key identity as a single value.
///
/// Returns the scalar for single-column keys and an array for composite keys.
pub fn identity_value(obj: &dyn Entity) -> Option<Value> {
    identity(obj).map(|id| id.value())
}

/// A predicate selecting every row whose identity matches one of `objects`.
///
/// Objects without an identity are ignored. Single-column identities sharing
/// a column collapse to one `IN` list; anything else becomes an OR of ANDs.
pub fn identity_filter(objects: &[AnyObj], identity_fn: &IdentityFn) -> Filter {
    let identities: Vec<Identity> = objects
        .iter()
        .filter_map(|obj| identity_fn(&**obj))
        .collect();
    identities_filter(&identities)
}

/// A predicate selecting every row matching one of `identities`.
pub fn identities_filter(identities: &[Identity]) -> Filter {
    let single_column = identities.first().and_then(|first| match first.pairs() {
        [(column, _)] => Some(*column),
        _ => None,
    });
    if let Some(column) = single_column {
        if identities
            .iter()
            .all(|id| matches!(id.pairs(), [(c, _)] if *c == column))
        {
            return Filter::In(column, identities.iter().map(Identity::value).collect());
        }
    }
    Filter::Or(identities.iter().map(Identity::to_filter).collect())
}

/// A predicate selecting rows of `M` by primary key.
///
/// Each key lists one value per primary key column; keys with the wrong
/// arity or a NULL component are ignored.
pub fn primary_key_filter<M: Model>(keys: &[Vec<Value>]) -> Filter {
    let identities: Vec<Identity> = keys
        .iter()
        .filter(|key| key.len() == M::PRIMARY_KEY.len())
        .filter_map(|key| {
            Identity::new(
                M::PRIMARY_KEY
                    .iter()
                    .copied()
                    .zip(key.iter().cloned())
                    .collect(),
            )
        })
        .collect();
    identities_filter(&identities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use crate::object::Obj;
    use crate::row::Row;

    #[derive(Debug, Clone)]
    struct Account {
        org: i64,
        number: Option<i64>,
        email: Option<String>,
    }

    impl Model for Account {
        const TABLE_NAME: &'static str = "accounts";
        const PRIMARY_KEY: &'static [&'static str] = &["org", "number"];

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![
                ("org", self.org.into()),
                ("number", self.number.into()),
                ("email", self.email.clone().into()),
            ]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                org: row.get_named("org")?,
                number: row.get_named("number")?,
                email: row.get_named("email")?,
            })
        }

        fn primary_key_value(&self) -> Vec<Value> {
            vec![self.org.into(), self.number.into()]
        }

        fn set_primary_key_value(&mut self, values: &[Value]) -> Result<()> {
            if let [org, number] = values {
                self.org = org.clone().try_into()?;
                self.number = number.clone().try_into()?;
            }
            Ok(())
        }
    }

    fn account(org: i64, number: Option<i64>, email: Option<&str>) -> AnyObj {
        Obj::new(Account {
            org,
            number,
            email: email.map(str::to_string),
        })
        .erase()
    }

    #[test]
    fn test_composite_identity_and_value() {
        let obj = account(1, Some(2), None);
        let id = identity(&*obj).unwrap();
        assert_eq!(id.columns().collect::<Vec<_>>(), vec!["org", "number"]);
        assert_eq!(
            identity_value(&*obj),
            Some(Value::Array(vec![Value::BigInt(1), Value::BigInt(2)]))
        );
        assert_eq!(id.to_string(), "(org=1, number=2)");
    }

    #[test]
    fn test_partial_key_has_no_identity() {
        let obj = account(1, None, None);
        assert!(identity(&*obj).is_none());
        assert!(identity_value(&*obj).is_none());
    }

    #[test]
    fn test_custom_identity_uses_named_columns() {
        let by_email = make_identity(&["email"]);
        let a = account(1, None, Some("a@example.com"));
        let b = account(1, None, None);
        assert_eq!(
            by_email(&*a).unwrap().value(),
            Value::Text("a@example.com".into())
        );
        assert!(by_email(&*b).is_none());

        let filter = identity_filter(&[a, b], &by_email);
        assert_eq!(
            filter,
            Filter::In("email", vec![Value::Text("a@example.com".into())])
        );
    }

    #[test]
    fn test_composite_filter_is_or_of_ands() {
        let objs = vec![account(1, Some(1), None), account(1, Some(2), None)];
        let filter = identity_filter(&objs, &primary_identity());
        assert_eq!(
            filter,
            Filter::Or(vec![
                Filter::And(vec![
                    Filter::Eq("org", Value::BigInt(1)),
                    Filter::Eq("number", Value::BigInt(1)),
                ]),
                Filter::And(vec![
                    Filter::Eq("org", Value::BigInt(1)),
                    Filter::Eq("number", Value::BigInt(2)),
                ]),
            ])
        );
    }

    #[test]
    fn test_primary_key_filter_skips_malformed_keys() {
        let filter = primary_key_filter::<Account>(&[
            vec![Value::BigInt(1), Value::BigInt(5)],
            vec![Value::BigInt(1)],
            vec![Value::BigInt(1), Value::Null],
        ]);
        assert_eq!(
            filter,
            Filter::Or(vec![Filter::And(vec![
                Filter::Eq("org", Value::BigInt(1)),
                Filter::Eq("number", Value::BigInt(5)),
            ])])
        );
    }

    #[test]
    fn test_identities_hash_by_value() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        assert!(seen.insert(identity(&*account(1, Some(1), None)).unwrap()));
        assert!(!seen.insert(identity(&*account(1, Some(1), Some("x"))).unwrap()));
    }
}
