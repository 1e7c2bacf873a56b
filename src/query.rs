// src/query.rs

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ParseError;

/// Represents a query against a Parse Server class, in the shape LiveQuery
/// subscriptions use: a class name, a `where` constraint set and an optional
/// field selection.
///
/// Two queries are equal when their class name, constraints and fields are equal,
/// regardless of how they were built. See [`ParseQuery::identity`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParseQuery {
    class_name: String,
    conditions: Map<String, Value>,
    fields: Option<Vec<String>>,
}

/// Hashable structural identity of a [`ParseQuery`].
///
/// `serde_json::Map` keeps its keys sorted, so the canonical string form of the
/// `where` clause is the same for logically identical constraint sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryIdentity {
    class_name: String,
    where_clause: String,
    fields: Option<Vec<String>>,
}

impl QueryIdentity {
    pub fn class_name(&self) -> &str {
        &self.class_name
    }
}

impl ParseQuery {
    /// Creates a new `ParseQuery` for the specified class name.
    ///
    /// # Arguments
    /// * `class_name` - The name of the Parse class to query.
    pub fn new(class_name: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            conditions: Map::new(),
            fields: None,
        }
    }

    /// Builds a query whose results match any of the given queries (`$or`).
    ///
    /// All queries must target the same class.
    pub fn or(queries: &[ParseQuery]) -> Result<Self, ParseError> {
        let first = queries.first().ok_or_else(|| {
            ParseError::InvalidQuery("An $or query needs at least one subquery".to_string())
        })?;
        if let Some(other) = queries.iter().find(|q| q.class_name != first.class_name) {
            return Err(ParseError::InvalidQuery(format!(
                "All $or subqueries must target '{}', found '{}'",
                first.class_name, other.class_name
            )));
        }
        let mut query = ParseQuery::new(&first.class_name);
        let clauses = queries
            .iter()
            .map(|q| Value::Object(q.conditions.clone()))
            .collect();
        query
            .conditions
            .insert("$or".to_string(), Value::Array(clauses));
        Ok(query)
    }

    /// Returns the class name this query targets.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// The `where` constraint set.
    pub fn where_clause(&self) -> &Map<String, Value> {
        &self.conditions
    }

    /// The fields LiveQuery events should carry, if restricted.
    pub fn selected_fields(&self) -> Option<&[String]> {
        self.fields.as_deref()
    }

    /// The structural identity used to match subscriptions.
    pub fn identity(&self) -> QueryIdentity {
        QueryIdentity {
            class_name: self.class_name.clone(),
            where_clause: Value::Object(self.conditions.clone()).to_string(),
            fields: self.fields.clone(),
        }
    }

    // Helper to add a simple condition like "field": "value"
    fn add_simple_condition(&mut self, key: &str, value: Value) -> &mut Self {
        self.conditions.insert(key.to_string(), value);
        self
    }

    // Helper to add an operator condition like "field": {"$op": "value"}.
    // Operators on the same field accumulate, so `greater_than` + `less_than` form a range.
    fn add_operator_condition(&mut self, key: &str, operator: &str, value: Value) -> &mut Self {
        match self.conditions.get_mut(key) {
            Some(Value::Object(op_map)) => {
                op_map.insert(operator.to_string(), value);
            }
            _ => {
                let mut op_map = Map::new();
                op_map.insert(operator.to_string(), value);
                self.conditions
                    .insert(key.to_string(), Value::Object(op_map));
            }
        }
        self
    }

    fn serialize_or_warn<V: Serialize>(key: &str, value: V) -> Option<Value> {
        match serde_json::to_value(value) {
            Ok(json_val) => Some(json_val),
            Err(e) => {
                log::warn!("Ignoring constraint on '{}': {}", key, e);
                None
            }
        }
    }

    /// Adds a constraint to the query that a field must be equal to a specified value.
    pub fn equal_to<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        match Self::serialize_or_warn(key, value) {
            Some(json_val) => self.add_simple_condition(key, json_val),
            None => self,
        }
    }

    /// Adds a constraint to the query that a field must not be equal to a specified value.
    pub fn not_equal_to<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        match Self::serialize_or_warn(key, value) {
            Some(json_val) => self.add_operator_condition(key, "$ne", json_val),
            None => self,
        }
    }

    /// Adds a constraint to the query that a field must exist.
    pub fn exists(&mut self, key: &str) -> &mut Self {
        self.add_operator_condition(key, "$exists", Value::Bool(true))
    }

    /// Adds a constraint to the query that a field must not exist.
    pub fn does_not_exist(&mut self, key: &str) -> &mut Self {
        self.add_operator_condition(key, "$exists", Value::Bool(false))
    }

    /// Adds a constraint for finding objects where a field's value is greater than the provided value.
    pub fn greater_than<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        match Self::serialize_or_warn(key, value) {
            Some(json_val) => self.add_operator_condition(key, "$gt", json_val),
            None => self,
        }
    }

    /// Adds a constraint for finding objects where a field's value is greater than or equal to the provided value.
    pub fn greater_than_or_equal_to<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        match Self::serialize_or_warn(key, value) {
            Some(json_val) => self.add_operator_condition(key, "$gte", json_val),
            None => self,
        }
    }

    /// Adds a constraint for finding objects where a field's value is less than the provided value.
    pub fn less_than<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        match Self::serialize_or_warn(key, value) {
            Some(json_val) => self.add_operator_condition(key, "$lt", json_val),
            None => self,
        }
    }

    /// Adds a constraint for finding objects where a field's value is less than or equal to the provided value.
    pub fn less_than_or_equal_to<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        match Self::serialize_or_warn(key, value) {
            Some(json_val) => self.add_operator_condition(key, "$lte", json_val),
            None => self,
        }
    }

    /// Adds a constraint for finding objects where a field's value is contained in the provided list of values.
    pub fn contained_in<V: Serialize>(&mut self, key: &str, values: Vec<V>) -> &mut Self {
        match Self::serialize_or_warn(key, values) {
            Some(json_val_array) => self.add_operator_condition(key, "$in", json_val_array),
            None => self,
        }
    }

    /// Adds a constraint for finding objects where a field's value is not contained in the provided list of values.
    pub fn not_contained_in<V: Serialize>(&mut self, key: &str, values: Vec<V>) -> &mut Self {
        match Self::serialize_or_warn(key, values) {
            Some(json_val_array) => self.add_operator_condition(key, "$nin", json_val_array),
            None => self,
        }
    }

    /// Adds a constraint for finding objects where a field contains all of the provided values (for array fields).
    pub fn contains_all<V: Serialize>(&mut self, key: &str, values: Vec<V>) -> &mut Self {
        match Self::serialize_or_warn(key, values) {
            Some(json_val_array) => self.add_operator_condition(key, "$all", json_val_array),
            None => self,
        }
    }

    /// Adds a constraint for finding objects where a string field starts with a given prefix.
    pub fn starts_with(&mut self, key: &str, prefix: &str) -> &mut Self {
        self.add_operator_condition(
            key,
            "$regex",
            Value::String(format!("^{}", regex::escape(prefix))),
        )
    }

    /// Adds a constraint for finding objects where a string field ends with a given suffix.
    pub fn ends_with(&mut self, key: &str, suffix: &str) -> &mut Self {
        self.add_operator_condition(
            key,
            "$regex",
            Value::String(format!("{}$", regex::escape(suffix))),
        )
    }

    /// Adds a constraint for finding objects where a string field contains a given substring.
    pub fn contains(&mut self, key: &str, substring: &str) -> &mut Self {
        self.add_operator_condition(
            key,
            "$regex",
            Value::String(format!(".*{}.*", regex::escape(substring))),
        )
    }

    /// Adds a constraint for finding objects where a string field matches a given regex pattern.
    /// Modifiers can be 'i' for case-insensitive, 'm' for multiline, etc.
    pub fn matches_regex(
        &mut self,
        key: &str,
        regex_pattern: &str,
        modifiers: Option<&str>,
    ) -> &mut Self {
        self.add_operator_condition(key, "$regex", Value::String(regex_pattern.to_string()));
        if let Some(mods) = modifiers {
            self.add_operator_condition(key, "$options", Value::String(mods.to_string()));
        }
        self
    }

    /// Restricts the fields LiveQuery sends with each event.
    ///
    /// Calling this again adds to the selection. Field order is kept as given and
    /// duplicates are ignored.
    pub fn fields(&mut self, keys_to_select: &[&str]) -> &mut Self {
        let fields = self.fields.get_or_insert_with(Vec::new);
        for key in keys_to_select {
            if !fields.iter().any(|existing| existing == key) {
                fields.push(key.to_string());
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_ignores_construction_order() {
        let mut first = ParseQuery::new("GameScore");
        first.greater_than("points", 9).equal_to("playerName", "Sean");
        let mut second = ParseQuery::new("GameScore");
        second.equal_to("playerName", "Sean").greater_than("points", 9);

        assert_eq!(first.identity(), second.identity());
        assert_eq!(first, second);

        second.fields(&["points"]);
        assert_ne!(first.identity(), second.identity());
    }

    #[test]
    fn operators_on_one_field_form_a_range() {
        let mut query = ParseQuery::new("GameScore");
        query.greater_than("points", 9).less_than_or_equal_to("points", 100);
        assert_eq!(
            Value::Object(query.where_clause().clone()),
            json!({ "points": { "$gt": 9, "$lte": 100 } })
        );
    }

    #[test]
    fn string_constraints_escape_their_input() {
        let mut query = ParseQuery::new("Player");
        query.starts_with("name", "a.b");
        assert_eq!(query.where_clause()["name"], json!({ "$regex": "^a\\.b" }));

        let mut query = ParseQuery::new("Player");
        query.matches_regex("name", "^sea", Some("i"));
        assert_eq!(
            query.where_clause()["name"],
            json!({ "$regex": "^sea", "$options": "i" })
        );
    }

    #[test]
    fn fields_are_deduplicated() {
        let mut query = ParseQuery::new("GameScore");
        query.fields(&["points", "playerName"]).fields(&["points"]);
        assert_eq!(
            query.selected_fields(),
            Some(&["points".to_string(), "playerName".to_string()][..])
        );
    }

    #[test]
    fn or_requires_a_single_class() {
        let mut high = ParseQuery::new("GameScore");
        high.greater_than("points", 100);
        let mut low = ParseQuery::new("GameScore");
        low.less_than("points", 10);

        let query = ParseQuery::or(&[high.clone(), low]).unwrap();
        assert_eq!(query.class_name(), "GameScore");
        assert_eq!(
            query.where_clause()["$or"],
            json!([{ "points": { "$gt": 100 } }, { "points": { "$lt": 10 } }])
        );

        assert!(ParseQuery::or(&[]).is_err());
        assert!(matches!(
            ParseQuery::or(&[high, ParseQuery::new("Player")]),
            Err(ParseError::InvalidQuery(_))
        ));
    }
}
