//! # User Model & Attribute Redaction
//!
//! A `User` is the evaluation context: a required key plus optional built-in
//! attributes and a free-form `custom` object. Users are immutable once
//! built, which is what lets evaluation and event recording share them across
//! threads without locking.
//!
//! The event-safe JSON form of a user honors three redaction sources: the
//! global all-attributes-private switch, the configured global private
//! attribute names, and the per-user private attribute names. Hidden
//! attributes are removed entirely and their names recorded in a
//! `privateAttrs` array. The user key is never redacted.

use crate::config::Config;
use crate::value::Value;

/// Names of the built-in user attributes, in the order they serialize.
const BUILT_INS: &[&str] = &[
    "secondary",
    "ip",
    "firstName",
    "lastName",
    "email",
    "name",
    "avatar",
    "country",
];

/// An immutable evaluation context.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    key: String,
    anonymous: bool,
    secondary: Option<String>,
    ip: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    name: Option<String>,
    avatar: Option<String>,
    country: Option<String>,
    custom: Option<Value>,
    private_attribute_names: Vec<String>,
}

/// Builder for [`User`]. The key is required and must be non-empty.
#[derive(Debug, Clone)]
pub struct UserBuilder {
    user: User,
}

impl User {
    /// Start building a user with the given key.
    pub fn builder(key: impl Into<String>) -> UserBuilder {
        UserBuilder {
            user: User {
                key: key.into(),
                anonymous: false,
                secondary: None,
                ip: None,
                first_name: None,
                last_name: None,
                email: None,
                name: None,
                avatar: None,
                country: None,
                custom: None,
                private_attribute_names: Vec::new(),
            },
        }
    }

    /// Shorthand for a user with only a key.
    pub fn with_key(key: impl Into<String>) -> Option<User> {
        User::builder(key).build()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn secondary(&self) -> Option<&str> {
        self.secondary.as_deref()
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    /// Resolve an attribute by name: built-ins map to their typed fields,
    /// anything else reads from the `custom` object. `key` and `anonymous`
    /// are addressable like any other built-in.
    pub fn attribute_value(&self, attribute: &str) -> Option<Value> {
        let text = |s: &Option<String>| s.clone().map(Value::String);
        match attribute {
            "key" => Some(Value::String(self.key.clone())),
            "anonymous" => Some(Value::Bool(self.anonymous)),
            "secondary" => text(&self.secondary),
            "ip" => text(&self.ip),
            "firstName" => text(&self.first_name),
            "lastName" => text(&self.last_name),
            "email" => text(&self.email),
            "name" => text(&self.name),
            "avatar" => text(&self.avatar),
            "country" => text(&self.country),
            other => self
                .custom
                .as_ref()
                .and_then(|custom| custom.get(other))
                .cloned(),
        }
    }

    fn built_in_value(&self, attribute: &str) -> Option<&str> {
        match attribute {
            "secondary" => self.secondary.as_deref(),
            "ip" => self.ip.as_deref(),
            "firstName" => self.first_name.as_deref(),
            "lastName" => self.last_name.as_deref(),
            "email" => self.email.as_deref(),
            "name" => self.name.as_deref(),
            "avatar" => self.avatar.as_deref(),
            "country" => self.country.as_deref(),
            _ => None,
        }
    }

    /// Produce the event-safe JSON document for this user.
    ///
    /// With `redact` set, an attribute is hidden when the config marks all
    /// attributes private, when its name appears in the config's global
    /// private list, or when it appears in this user's own private list.
    pub fn event_json(&self, config: &Config, redact: bool) -> Value {
        let mut entries = vec![("key".to_owned(), Value::String(self.key.clone()))];
        let mut private_attrs: Vec<String> = Vec::new();

        let hidden = |name: &str| {
            redact
                && (config.all_attributes_private
                    || config
                        .private_attribute_names
                        .iter()
                        .any(|p| p == name)
                    || self.private_attribute_names.iter().any(|p| p == name))
        };

        if self.anonymous {
            entries.push(("anonymous".to_owned(), Value::Bool(true)));
        }

        for &name in BUILT_INS {
            if let Some(value) = self.built_in_value(name) {
                if hidden(name) {
                    private_attrs.push(name.to_owned());
                } else {
                    entries.push((name.to_owned(), Value::String(value.to_owned())));
                }
            }
        }

        if let Some(Value::Object(custom_entries)) = &self.custom {
            let mut kept = Vec::new();
            for (name, value) in custom_entries {
                if hidden(name) {
                    private_attrs.push(name.clone());
                } else {
                    kept.push((name.clone(), value.clone()));
                }
            }
            if !kept.is_empty() {
                entries.push(("custom".to_owned(), Value::Object(kept)));
            }
        }

        if !private_attrs.is_empty() {
            entries.push((
                "privateAttrs".to_owned(),
                Value::Array(private_attrs.into_iter().map(Value::String).collect()),
            ));
        }

        Value::Object(entries)
    }
}

impl UserBuilder {
    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.user.anonymous = anonymous;
        self
    }

    pub fn secondary(mut self, secondary: impl Into<String>) -> Self {
        self.user.secondary = Some(secondary.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.user.ip = Some(ip.into());
        self
    }

    pub fn first_name(mut self, first_name: impl Into<String>) -> Self {
        self.user.first_name = Some(first_name.into());
        self
    }

    pub fn last_name(mut self, last_name: impl Into<String>) -> Self {
        self.user.last_name = Some(last_name.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.user.email = Some(email.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.user.name = Some(name.into());
        self
    }

    pub fn avatar(mut self, avatar: impl Into<String>) -> Self {
        self.user.avatar = Some(avatar.into());
        self
    }

    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.user.country = Some(country.into());
        self
    }

    /// Attach the free-form custom attribute object. Non-object values are
    /// ignored.
    pub fn custom(mut self, custom: Value) -> Self {
        if matches!(custom, Value::Object(_)) {
            self.user.custom = Some(custom);
        }
        self
    }

    /// Mark one of this user's attributes as private.
    pub fn private_attribute(mut self, name: impl Into<String>) -> Self {
        self.user.private_attribute_names.push(name.into());
        self
    }

    /// Finish building. Returns `None` if the key is empty.
    pub fn build(self) -> Option<User> {
        if self.user.key.is_empty() {
            return None;
        }
        Some(self.user)
    }
}
