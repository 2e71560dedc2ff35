//! Edit translation between the local editor widget and the wire.
//!
//! The widget reports edits in its native form (a contiguous replaced range
//! plus replacement text); the wire carries [`ChangeDescriptor`]s. Both
//! directions are pure functions with no shared state, so they are safe to
//! call concurrently for any number of open documents.
//!
//! All offsets are character offsets, not byte offsets: the widget addresses
//! text by characters and the relay never inspects payload text.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A local edit as reported by the text-editing widget.
///
/// Offsets come straight from the widget's native representation, which is
/// signed, so they are validated at encode time rather than trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditEvent {
    pub from_offset: i64,
    pub to_offset: i64,
    pub inserted_text: String,
}

impl EditEvent {
    pub fn new(from_offset: i64, to_offset: i64, inserted_text: impl Into<String>) -> Self {
        Self {
            from_offset,
            to_offset,
            inserted_text: inserted_text.into(),
        }
    }
}

/// Wire-level representation of one atomic edit.
///
/// `from_offset` and `to_offset` are character offsets into the document as
/// it existed at `origin_revision`. Descriptors are never mutated after
/// creation and are discarded once relayed and applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDescriptor {
    pub from_offset: u64,
    pub to_offset: u64,
    pub inserted_text: String,
    /// The revision the sender believed was current when the edit was made.
    /// Advisory only: staleness detection, never the authoritative order.
    pub origin_revision: u64,
    /// Connection that produced the edit.
    pub originator: Uuid,
}

impl ChangeDescriptor {
    /// Net character-length delta this change applies to a document.
    pub fn len_delta(&self) -> i64 {
        self.inserted_text.chars().count() as i64 - (self.to_offset - self.from_offset) as i64
    }
}

/// An accepted edit, stamped by the relay with its assigned revision.
///
/// This is what peers receive; `assigned_revision` is the authoritative
/// position of the change in the session's total order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub change: ChangeDescriptor,
    pub assigned_revision: u64,
}

impl AppliedChange {
    pub fn new(change: ChangeDescriptor, assigned_revision: u64) -> Self {
        Self {
            change,
            assigned_revision,
        }
    }

    /// Instruction form of the stamped change, validated against a document
    /// of `document_len` characters.
    pub fn instruction(&self, document_len: usize) -> Result<EditInstruction, ChangeError> {
        decode(&self.change, document_len)
    }
}

/// The form the widget's apply API expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditInstruction {
    pub from_offset: usize,
    pub to_offset: usize,
    pub inserted_text: String,
}

/// Errors from edit translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeError {
    /// The widget reported an invalid range. Discarded locally, never sent.
    MalformedEdit { from_offset: i64, to_offset: i64 },
    /// Offsets exceed the local document bounds. Triggers a forced resync,
    /// not a crash.
    OutOfRange { to_offset: u64, document_len: usize },
}

impl std::fmt::Display for ChangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedEdit {
                from_offset,
                to_offset,
            } => write!(f, "malformed edit range [{from_offset}, {to_offset})"),
            Self::OutOfRange {
                to_offset,
                document_len,
            } => write!(
                f,
                "offset {to_offset} exceeds document length {document_len}"
            ),
        }
    }
}

impl std::error::Error for ChangeError {}

/// Translate a widget edit event into a wire descriptor.
///
/// Fails with [`ChangeError::MalformedEdit`] when the range is invalid
/// (negative offsets or an inverted range); the event is then discarded
/// locally and never sent.
pub fn encode(
    event: &EditEvent,
    current_revision: u64,
    connection_id: Uuid,
) -> Result<ChangeDescriptor, ChangeError> {
    if event.from_offset < 0 || event.to_offset < event.from_offset {
        return Err(ChangeError::MalformedEdit {
            from_offset: event.from_offset,
            to_offset: event.to_offset,
        });
    }
    Ok(ChangeDescriptor {
        from_offset: event.from_offset as u64,
        to_offset: event.to_offset as u64,
        inserted_text: event.inserted_text.clone(),
        origin_revision: current_revision,
        originator: connection_id,
    })
}

/// Translate a wire descriptor back into the widget's apply form.
///
/// Never fails for a well-formed descriptor whose offsets fit a document of
/// `document_len` characters; out-of-bounds offsets signal
/// [`ChangeError::OutOfRange`].
pub fn decode(
    descriptor: &ChangeDescriptor,
    document_len: usize,
) -> Result<EditInstruction, ChangeError> {
    if descriptor.to_offset < descriptor.from_offset {
        return Err(ChangeError::MalformedEdit {
            from_offset: descriptor.from_offset as i64,
            to_offset: descriptor.to_offset as i64,
        });
    }
    if descriptor.to_offset as usize > document_len {
        return Err(ChangeError::OutOfRange {
            to_offset: descriptor.to_offset,
            document_len,
        });
    }
    Ok(EditInstruction {
        from_offset: descriptor.from_offset as usize,
        to_offset: descriptor.to_offset as usize,
        inserted_text: descriptor.inserted_text.clone(),
    })
}

/// Splice an instruction into `text` at character offsets.
///
/// The instruction must have been validated against this text's length;
/// [`decode`] is the validating path.
pub fn apply(text: &str, instruction: &EditInstruction) -> String {
    let mut out = String::with_capacity(text.len() + instruction.inserted_text.len());
    out.extend(text.chars().take(instruction.from_offset));
    out.push_str(&instruction.inserted_text);
    out.extend(text.chars().skip(instruction.to_offset));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_valid_edit() {
        let conn = Uuid::new_v4();
        let event = EditEvent::new(5, 5, " world");
        let desc = encode(&event, 3, conn).unwrap();

        assert_eq!(desc.from_offset, 5);
        assert_eq!(desc.to_offset, 5);
        assert_eq!(desc.inserted_text, " world");
        assert_eq!(desc.origin_revision, 3);
        assert_eq!(desc.originator, conn);
    }

    #[test]
    fn test_encode_rejects_negative_offset() {
        let event = EditEvent::new(-1, 4, "x");
        let err = encode(&event, 0, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, ChangeError::MalformedEdit { .. }));
    }

    #[test]
    fn test_encode_rejects_inverted_range() {
        let event = EditEvent::new(4, 2, "x");
        let err = encode(&event, 0, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, ChangeError::MalformedEdit { .. }));
    }

    #[test]
    fn test_decode_out_of_range() {
        let desc = ChangeDescriptor {
            from_offset: 10,
            to_offset: 12,
            inserted_text: String::new(),
            origin_revision: 0,
            originator: Uuid::new_v4(),
        };
        let err = decode(&desc, 5).unwrap_err();
        assert!(matches!(err, ChangeError::OutOfRange { .. }));
    }

    #[test]
    fn test_roundtrip_reproduces_edit() {
        let doc = "hello";
        let event = EditEvent::new(5, 5, " world");
        let desc = encode(&event, 0, Uuid::new_v4()).unwrap();
        let instr = decode(&desc, doc.chars().count()).unwrap();

        let direct = apply(
            doc,
            &EditInstruction {
                from_offset: 5,
                to_offset: 5,
                inserted_text: " world".to_string(),
            },
        );
        assert_eq!(apply(doc, &instr), direct);
        assert_eq!(apply(doc, &instr), "hello world");
    }

    #[test]
    fn test_apply_replacement() {
        let instr = EditInstruction {
            from_offset: 0,
            to_offset: 1,
            inserted_text: "X".to_string(),
        };
        assert_eq!(apply("abcdef", &instr), "Xbcdef");
    }

    #[test]
    fn test_apply_deletion() {
        let instr = EditInstruction {
            from_offset: 1,
            to_offset: 4,
            inserted_text: String::new(),
        };
        assert_eq!(apply("abcdef", &instr), "aef");
    }

    #[test]
    fn test_apply_multibyte_chars() {
        // Offsets count characters, not bytes.
        let instr = EditInstruction {
            from_offset: 1,
            to_offset: 2,
            inserted_text: "über".to_string(),
        };
        assert_eq!(apply("héllo", &instr), "hüberllo");
    }

    #[test]
    fn test_len_delta() {
        let same = encode(&EditEvent::new(0, 1, "X"), 0, Uuid::new_v4()).unwrap();
        assert_eq!(same.len_delta(), 0);

        let grow = encode(&EditEvent::new(5, 5, " world"), 0, Uuid::new_v4()).unwrap();
        assert_eq!(grow.len_delta(), 6);

        let shrink = encode(&EditEvent::new(0, 4, "x"), 0, Uuid::new_v4()).unwrap();
        assert_eq!(shrink.len_delta(), -3);
    }

    #[test]
    fn test_applied_change_instruction() {
        let desc = encode(&EditEvent::new(2, 3, "zz"), 4, Uuid::new_v4()).unwrap();
        let applied = AppliedChange::new(desc, 5);

        let instr = applied.instruction(6).unwrap();
        assert_eq!(instr.from_offset, 2);
        assert_eq!(instr.to_offset, 3);

        assert!(applied.instruction(2).is_err());
    }
}
