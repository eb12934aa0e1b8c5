use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Identifies a request by the name of the coordinator and its arguments.
///
/// The fingerprint is the compact JSON serialization of `[request_name, ...args]`. It doubles as
/// the key under which results are persisted in the value store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of calling `request_name` with `args`.
    ///
    /// Arguments that serialize to a JSON array, like tuples and sequences, are spliced into the
    /// argument list. `()` and `None` contribute no argument at all. Every other value is a
    /// single argument.
    ///
    /// Distinct arguments therefore share a fingerprint whenever they contribute the same
    /// arguments. For instance, `None` and `Some(vec![])` both contribute none.
    pub fn compute<A>(request_name: &str, args: &A) -> Result<Self, serde_json::Error>
    where
        A: Serialize + ?Sized,
    {
        let mut parts = vec![Value::String(request_name.to_owned())];
        match serde_json::to_value(args)? {
            Value::Null => {}
            Value::Array(items) => parts.extend(items),
            value => parts.push(value),
        }

        serde_json::to_string(&parts).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
