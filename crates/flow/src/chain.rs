//! Parent chain codec
//!
//! A parent chain addresses every ancestor scope of a message. The head is the
//! nearest ancestor, `path[0]` the next one out, and so on towards the
//! definition. Chains are plain values: every operation returns a new chain
//! and never touches its input.

use serde::{Deserialize, Serialize};

/// Address of one element instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementRef {
    pub id: String,
    #[serde(rename = "type")]
    pub element_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

impl ElementRef {
    pub fn new(id: impl Into<String>, element_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            element_type: element_type.into(),
            execution_id: None,
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }
}

/// Ancestor addresses of a message, nearest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentChain {
    #[serde(flatten)]
    pub head: ElementRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<ElementRef>,
}

impl ParentChain {
    /// Chain with a single ancestor
    pub fn new(head: ElementRef) -> Self {
        Self {
            head,
            path: Vec::new(),
        }
    }

    /// Number of ancestors addressed
    pub fn depth(&self) -> usize {
        1 + self.path.len()
    }

    /// Ancestors from nearest to most distant
    pub fn iter(&self) -> impl Iterator<Item = &ElementRef> {
        std::iter::once(&self.head).chain(self.path.iter())
    }

    /// Find the execution id of an ancestor by element id
    pub fn execution_id_of(&self, id: &str) -> Option<&str> {
        self.iter()
            .find(|r| r.id == id)
            .and_then(|r| r.execution_id.as_deref())
    }
}

/// Wrap a chain one scope up: `ancestor` becomes the head and the old head
/// moves to `path[0]`.
///
/// When the chain already starts at `ancestor` only the execution id is
/// refreshed, so re-wrapping a redelivered message does not grow the chain.
pub fn unshift_parent(ancestor: &ElementRef, chain: Option<&ParentChain>) -> ParentChain {
    let Some(chain) = chain else {
        return ParentChain::new(ancestor.clone());
    };

    let mut next = chain.clone();
    if next.head.id == ancestor.id {
        if ancestor.execution_id.is_some() {
            next.head.execution_id = ancestor.execution_id.clone();
        }
        return next;
    }

    let old_head = std::mem::replace(&mut next.head, ancestor.clone());
    next.path.insert(0, old_head);
    next
}

/// Unwrap a chain one scope down: `path[0]` is promoted to head.
///
/// Returns `None` when there is no ancestor left to promote.
pub fn shift_parent(chain: Option<&ParentChain>) -> Option<ParentChain> {
    let chain = chain?;
    let mut path = chain.path.clone();
    if path.is_empty() {
        return None;
    }
    let head = path.remove(0);
    Some(ParentChain { head, path })
}

/// Append a distant ancestor to the tail of the chain.
///
/// An ancestor already present by id only gets its execution id refreshed.
pub fn push_parent(chain: Option<&ParentChain>, ancestor: &ElementRef) -> ParentChain {
    let Some(chain) = chain else {
        return ParentChain::new(ancestor.clone());
    };

    let mut next = chain.clone();
    if let Some(existing) = std::iter::once(&mut next.head)
        .chain(next.path.iter_mut())
        .find(|r| r.id == ancestor.id)
    {
        if ancestor.execution_id.is_some() {
            existing.execution_id = ancestor.execution_id.clone();
        }
        return next;
    }

    next.path.push(ancestor.clone());
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn process() -> ElementRef {
        ElementRef::new("process_1", "bpmn:Process").with_execution_id("process_1_a")
    }

    fn activity() -> ElementRef {
        ElementRef::new("task_1", "bpmn:Task").with_execution_id("task_1_b")
    }

    #[test]
    fn test_unshift_onto_empty_chain() {
        let chain = unshift_parent(&process(), None);
        assert_eq!(chain.head, process());
        assert!(chain.path.is_empty());
    }

    #[test]
    fn test_unshift_moves_head_into_path() {
        let base = ParentChain::new(process());
        let wrapped = unshift_parent(&activity(), Some(&base));

        assert_eq!(wrapped.head, activity());
        assert_eq!(wrapped.path, vec![process()]);
        // input untouched
        assert!(base.path.is_empty());
    }

    #[test]
    fn test_unshift_same_head_refreshes_execution_id() {
        let base = ParentChain::new(activity());
        let refreshed = unshift_parent(
            &ElementRef::new("task_1", "bpmn:Task").with_execution_id("task_1_c"),
            Some(&base),
        );
        assert_eq!(refreshed.depth(), 1);
        assert_eq!(refreshed.head.execution_id.as_deref(), Some("task_1_c"));
    }

    #[test]
    fn test_shift_promotes_nearest_ancestor() {
        let chain = unshift_parent(&activity(), Some(&ParentChain::new(process())));
        let shifted = shift_parent(Some(&chain)).expect("should have an ancestor");
        assert_eq!(shifted.head, process());
        assert!(shifted.path.is_empty());
    }

    #[test]
    fn test_shift_without_path_is_none() {
        assert!(shift_parent(Some(&ParentChain::new(process()))).is_none());
        assert!(shift_parent(None).is_none());
    }

    #[test]
    fn test_push_appends_and_dedupes() {
        let definition = ElementRef::new("def", "bpmn:Definitions");
        let chain = push_parent(Some(&ParentChain::new(activity())), &process());
        let chain = push_parent(Some(&chain), &definition);
        assert_eq!(chain.path, vec![process(), definition.clone()]);

        let again = push_parent(
            Some(&chain),
            &ElementRef::new("process_1", "bpmn:Process").with_execution_id("process_1_z"),
        );
        assert_eq!(again.depth(), 3);
        assert_eq!(again.execution_id_of("process_1"), Some("process_1_z"));
    }

    #[test]
    fn test_serialized_shape_is_flat() {
        let chain = unshift_parent(&activity(), Some(&ParentChain::new(process())));
        let value = serde_json::to_value(&chain).unwrap();
        assert_eq!(value["id"], "task_1");
        assert_eq!(value["executionId"], "task_1_b");
        assert_eq!(value["path"][0]["id"], "process_1");
    }

    fn element_ref() -> impl Strategy<Value = ElementRef> {
        ("[a-z]{1,6}", "[a-z]{1,6}", proptest::option::of("[a-z0-9_]{1,8}")).prop_map(
            |(id, element_type, execution_id)| ElementRef {
                id,
                element_type,
                execution_id,
            },
        )
    }

    proptest! {
        #[test]
        fn test_shift_undoes_unshift(
            head in element_ref(),
            path in proptest::collection::vec(element_ref(), 0..5),
            ancestor in element_ref(),
        ) {
            prop_assume!(ancestor.id != head.id);
            let chain = ParentChain { head, path };
            let wrapped = unshift_parent(&ancestor, Some(&chain));
            prop_assert_eq!(wrapped.depth(), chain.depth() + 1);
            let restored = shift_parent(Some(&wrapped));
            prop_assert_eq!(restored, Some(chain));
        }
    }
}
