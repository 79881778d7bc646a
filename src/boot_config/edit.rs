/// One change to a text buffer.
///
/// Edits are ordered. `offset` is a byte offset into the buffer as it stands
/// after every earlier edit of the same list has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub offset: usize,
    pub delete_len: usize,
    pub insert_text: String,
    /// Mark the inserted text in an editing view.
    pub highlight: bool,
}

impl TextEdit {
    /// Deletions and insertions this edit performs.
    pub fn update_count(&self) -> usize {
        usize::from(self.delete_len > 0) + usize::from(!self.insert_text.is_empty())
    }
}

/// Apply `edits` in order. Returns `None` if an edit falls outside the
/// buffer or splits a UTF-8 character.
pub fn apply_edits(original: &str, edits: &[TextEdit]) -> Option<String> {
    let mut text = original.to_string();
    for edit in edits {
        let end = edit.offset.checked_add(edit.delete_len)?;
        if end > text.len() || !text.is_char_boundary(edit.offset) || !text.is_char_boundary(end) {
            return None;
        }
        text.replace_range(edit.offset..end, &edit.insert_text);
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edits_apply_in_order() {
        let edits = vec![
            TextEdit {
                offset: 0,
                delete_len: 5,
                insert_text: "hi".to_string(),
                highlight: true,
            },
            TextEdit {
                offset: 3,
                delete_len: 5,
                insert_text: "there".to_string(),
                highlight: true,
            },
        ];
        assert_eq!(apply_edits("hello world", &edits).as_deref(), Some("hi there"));
        assert_eq!(edits[0].update_count(), 2);
    }

    #[test]
    fn out_of_range_edit_is_rejected() {
        let edit = TextEdit {
            offset: 4,
            delete_len: 10,
            insert_text: String::new(),
            highlight: false,
        };
        assert_eq!(apply_edits("short", &[edit]), None);
    }
}
