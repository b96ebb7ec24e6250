//! Applies an ordered list of edit directives to a JSON document. Each directive is
//! tried first as an RFC 6902 JSON Patch; if it doesn't parse as one, it's applied as an
//! RFC 7386 merge-patch instead, via [`crate::merge::merge`].

use serde_json::Value;

use crate::merge::merge;

#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    #[error("directive {index} failed to apply as a JSON patch: {source}")]
    Patch {
        index: usize,
        #[source]
        source: json_patch::PatchError,
    },
}

pub fn apply_directives(document: &mut Value, directives: &[Value]) -> Result<(), EditorError> {
    for (index, directive) in directives.iter().enumerate() {
        if let Ok(patch) = serde_json::from_value::<json_patch::Patch>(directive.clone()) {
            json_patch::patch(document, &patch).map_err(|source| EditorError::Patch { index, source })?;
        } else {
            let current = std::mem::take(document);
            *document = merge(directive.clone(), current);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rfc6902_patch_directive_is_applied() {
        let mut document = json!({"a": 1});
        let directives = vec![json!([{"op": "add", "path": "/b", "value": 2}])];

        apply_directives(&mut document, &directives).unwrap();

        assert_eq!(document, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn rfc7386_merge_patch_directive_is_applied() {
        let mut document = json!({"a": 1, "b": 2});
        let directives = vec![json!({"b": 99, "c": 3})];

        apply_directives(&mut document, &directives).unwrap();

        assert_eq!(document, json!({"a": 1, "b": 99, "c": 3}));
    }

    #[test]
    fn directives_apply_in_order() {
        let mut document = json!({});
        let directives = vec![
            json!([{"op": "add", "path": "/a", "value": 1}]),
            json!({"a": 2}),
        ];

        apply_directives(&mut document, &directives).unwrap();

        assert_eq!(document, json!({"a": 2}));
    }

    #[test]
    fn invalid_patch_operation_is_an_error() {
        let mut document = json!({"a": 1});
        let directives = vec![json!([{"op": "remove", "path": "/missing"}])];

        assert!(apply_directives(&mut document, &directives).is_err());
    }
}
