//! Recursive object merge of two JSON documents, preferring the first document's value
//! wherever the two disagree. Arrays and scalars are never merged element-wise — the
//! first document's value wins wholesale.

use serde_json::Value;

pub fn merge(first: Value, second: Value) -> Value {
    match (first, second) {
        (Value::Object(mut first_fields), Value::Object(second_fields)) => {
            for (key, second_value) in second_fields {
                match first_fields.remove(&key) {
                    Some(first_value) => {
                        first_fields.insert(key, merge(first_value, second_value));
                    }
                    None => {
                        first_fields.insert(key, second_value);
                    }
                }
            }
            Value::Object(first_fields)
        }
        (first, _second) => first,
    }
}
