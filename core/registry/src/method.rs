// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref SIMPLE_NAMES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("java.lang.String", "String");
        m.insert("java.lang.Integer", "int");
        m.insert("java.lang.Character", "char");
        m.insert("java.lang.Boolean", "boolean");
        m.insert("java.lang.Long", "long");
        m.insert("java.lang.Double", "double");
        m.insert("java.lang.Float", "float");
        m.insert("java.util.List", "List");
        m.insert("java.util.Queue", "Queue");
        m.insert("java.util.Collection", "Collection");
        m.insert("java.util.Map", "Map");
        m.insert("java.util.Set", "Set");
        m.insert("java.lang.Iterable", "Iterable");
        m
    };
}

/// Short form of a fully qualified type name, as shown in method keys.
pub fn simplify_type(name: &str) -> String {
    let name = name.trim();
    let base = name.trim_end_matches("[]");
    let suffix = &name[base.len()..];

    let simple = match SIMPLE_NAMES.get(base) {
        Some(s) => s,
        None => base.rsplit('.').next().unwrap_or(base),
    };

    format!("{}{}", simple, suffix)
}

/// `name(SimpleArg1,SimpleArg2)`
pub fn method_key(name: &str, argument_types: &[String]) -> String {
    let args = argument_types
        .iter()
        .map(|t| simplify_type(t))
        .collect::<Vec<_>>()
        .join(",");
    format!("{}({})", name, args)
}

/// Recover the method name from a key built by [`method_key`].
pub fn method_name(key: &str) -> &str {
    match key.find('(') {
        Some(idx) => &key[..idx],
        None => key,
    }
}

/// One method exposed by a provider interface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MethodInfo {
    name: String,
    argument_types: Vec<String>,
    return_type: String,
    #[serde(skip)]
    key: OnceLock<String>,
}

impl MethodInfo {
    pub fn new(name: &str, argument_types: Vec<String>, return_type: &str) -> Self {
        MethodInfo {
            name: name.to_string(),
            argument_types,
            return_type: return_type.to_string(),
            key: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn argument_types(&self) -> &[String] {
        &self.argument_types
    }

    pub fn return_type(&self) -> &str {
        &self.return_type
    }

    /// Lookup key shared by the directory and the invocation history.
    pub fn key(&self) -> &str {
        self.key
            .get_or_init(|| method_key(&self.name, &self.argument_types))
    }
}

impl PartialEq for MethodInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.argument_types == other.argument_types
            && self.return_type == other.return_type
    }
}

impl Eq for MethodInfo {}

impl Hash for MethodInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.argument_types.hash(state);
        self.return_type.hash(state);
    }
}
