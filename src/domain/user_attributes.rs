use serde_json::Map;
use serde_json::Value;

use crate::domain::EmailAddress;

/// A user's attribute document. Always a JSON object, and always carries a
/// valid `email` string; everything else is operator-defined.
#[derive(Debug, Clone, PartialEq)]
pub struct UserAttributes(Map<String, Value>);

impl UserAttributes {
    /// Parsing is the only way to construct this type, so any instance held
    /// by the engine is known to carry a sendable address.
    pub fn parse(value: Value) -> Result<Self, String> {
        let Value::Object(map) = value else {
            return Err("Attributes must be a JSON object".to_string());
        };
        match map.get("email") {
            Some(Value::String(email)) => EmailAddress::parse(email.clone()).map(|_| Self(map)),
            Some(_) => Err("Attribute 'email' must be a string".to_string()),
            None => Err("Missing required attribute 'email'".to_string()),
        }
    }

    pub fn email(&self) -> EmailAddress {
        // guaranteed by `parse`
        match self.0.get("email") {
            Some(Value::String(email)) => EmailAddress(email.clone()),
            _ => unreachable!("attributes lost their email"),
        }
    }

    /// Shallow merge: top-level keys of `partial` overwrite existing keys,
    /// everything else is left alone. The merged document must still parse
    /// (e.g. `email` cannot be clobbered with a number).
    pub fn merge(
        &self,
        partial: Map<String, Value>,
    ) -> Result<Self, String> {
        let mut merged = self.0.clone();
        for (k, v) in partial {
            merged.insert(k, v);
        }
        Self::parse(Value::Object(merged))
    }

    pub fn as_value(&self) -> Value { Value::Object(self.0.clone()) }

    pub fn into_value(self) -> Value { Value::Object(self.0) }
}

impl TryFrom<Value> for UserAttributes {
    type Error = String;
    fn try_from(value: Value) -> Result<Self, Self::Error> { Self::parse(value) }
}

#[cfg(test)]
mod tests {
    use claims::assert_err;
    use claims::assert_ok;
    use serde_json::json;

    use crate::domain::UserAttributes;

    #[test]
    fn email_required() {
        assert_err!(UserAttributes::parse(json!({ "name": "A" })));
        assert_err!(UserAttributes::parse(json!({ "email": 42 })));
        assert_err!(UserAttributes::parse(json!([1, 2])));
        assert_ok!(UserAttributes::parse(json!({ "email": "a@x.com" })));
    }

    #[test]
    fn merge_is_shallow() {
        let attrs = UserAttributes::parse(json!({
            "email": "a@x.com",
            "prefs": { "weekly": true },
            "name": "A",
        }))
        .unwrap();
        let merged = attrs
            .merge(
                json!({ "prefs": { "daily": true }, "active": false })
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .unwrap();
        // replaced wholesale, not deep-merged
        assert_eq!(merged.as_value()["prefs"], json!({ "daily": true }));
        assert_eq!(merged.as_value()["name"], json!("A"));
        assert_eq!(merged.as_value()["active"], json!(false));
    }

    #[test]
    fn merge_cannot_drop_email() {
        let attrs = UserAttributes::parse(json!({ "email": "a@x.com" })).unwrap();
        assert_err!(attrs.merge(json!({ "email": 1 }).as_object().cloned().unwrap()));
    }
}
