//! Parser for textual tracepoint specifications.
//!
//! A spec line is one of:
//!
//! - `:system:name` or `:name`: an identifier referring to a tracepoint
//!   that is assumed to already exist in the kernel.
//! - `system:name fields` or `name fields`: a definition to pre-register
//!   (the literal fields text ` ;` means "no fields").
//! - `system:name` or `name` where the event name matches the EventHeader
//!   provider suffix grammar (`..._L<hex>K<hex>`): an EventHeader
//!   definition; the payload layout is implied, so no fields section.
//!
//! Parsing is pure: no I/O, total over all inputs.

use compact_str::CompactString;
use compact_str::ToCompactString;

/// System name used when a spec does not name one explicitly.
pub const USER_EVENTS_SYSTEM: &str = "user_events";

static EVENTHEADER_NAME_REGEX: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| {
        regex::Regex::new(r"^[A-Za-z0-9_]+_L[0-9a-fA-F]+K[0-9a-fA-F]+[A-Za-z0-9]*$")
            .expect("Failed to compile regex")
    });

/// Why a spec line could not be parsed. One variant per violated rule so
/// the caller can print an actionable diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    /// System or event name is empty.
    #[error("empty system or event name")]
    EmptyName,
    /// A name contains a character outside `[A-Za-z0-9_]`.
    #[error("invalid character {0:?} in name {1:?}")]
    InvalidNameChar(char, CompactString),
    /// An identifier spec (leading `:`) carried a fields section.
    #[error("identifier spec cannot have fields")]
    IdentifierCannotHaveFields,
    /// An identifier spec (leading `:`) carried a `:flags` suffix.
    #[error("identifier spec cannot have flags")]
    IdentifierCannotHaveFlags,
    /// A definition-shaped spec had no fields and the event name does not
    /// match the EventHeader suffix grammar.
    #[error("definition spec {0:?} requires a fields section (use \" ;\" for none)")]
    MissingFields(CompactString),
}

/// One parsed tracepoint specification line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TracepointSpec {
    /// Blank (or whitespace-only) input. Valid and ignorable.
    Empty,
    /// `:system:name`, refers to an already-registered tracepoint.
    Identifier {
        system: CompactString,
        event: CompactString,
    },
    /// `system:name[:flags] fields`, a user_events definition to register.
    Definition {
        system: CompactString,
        event: CompactString,
        flags: Option<CompactString>,
        /// Raw field-definition text, exactly as written after the space.
        fields: CompactString,
    },
    /// `system:name[:flags]` where the name carries an EventHeader
    /// provider suffix. The payload layout is implied by the convention.
    EventHeaderDefinition {
        system: CompactString,
        event: CompactString,
        flags: Option<CompactString>,
    },
    /// Malformed input; carries the diagnostic. Must never be used to
    /// build a session.
    Error(SpecError),
}

impl TracepointSpec {
    /// Parse one line of text. Total: every input maps to exactly one
    /// variant, malformed input maps to [`TracepointSpec::Error`].
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }

        if let Some(rest) = line.strip_prefix(':') {
            return Self::parse_identifier(rest);
        }

        // Definition shape: name part up to the first space, raw fields after.
        let (name_part, fields) = match line.split_once(' ') {
            Some((name, fields)) => (name, Some(fields)),
            None => (line, None),
        };

        let (system, event, flags) = match split_name(name_part) {
            Ok(parts) => parts,
            Err(err) => return Self::Error(err),
        };

        match fields {
            Some(fields) => Self::Definition {
                system,
                event,
                flags,
                fields: fields.to_compact_string(),
            },
            None if EVENTHEADER_NAME_REGEX.is_match(&event) => Self::EventHeaderDefinition {
                system,
                event,
                flags,
            },
            None => Self::Error(SpecError::MissingFields(event)),
        }
    }

    fn parse_identifier(rest: &str) -> Self {
        if rest.contains(' ') {
            return Self::Error(SpecError::IdentifierCannotHaveFields);
        }
        let (system, event, flags) = match split_name(rest) {
            Ok(parts) => parts,
            Err(err) => return Self::Error(err),
        };
        if flags.is_some() {
            return Self::Error(SpecError::IdentifierCannotHaveFlags);
        }
        Self::Identifier { system, event }
    }

    /// True for the variants that name a usable tracepoint.
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Empty | Self::Error(_))
    }

    /// The `(system, event)` key this spec resolves to, if it is usable.
    pub fn key(&self) -> Option<(&str, &str)> {
        match self {
            Self::Identifier { system, event }
            | Self::Definition { system, event, .. }
            | Self::EventHeaderDefinition { system, event, .. } => {
                Some((system.as_str(), event.as_str()))
            }
            Self::Empty | Self::Error(_) => None,
        }
    }
}

/// Split `name`, `system:name` or `system:name:flags`, validating each part.
fn split_name(
    text: &str,
) -> Result<(CompactString, CompactString, Option<CompactString>), SpecError> {
    let mut parts = text.splitn(3, ':');
    let first = parts.next().unwrap_or("");
    let second = parts.next();
    let third = parts.next();

    let (system, event, flags) = match (second, third) {
        (None, _) => (
            CompactString::const_new(USER_EVENTS_SYSTEM),
            validate_name(first)?,
            None,
        ),
        (Some(event), None) => (validate_name(first)?, validate_name(event)?, None),
        (Some(event), Some(flags)) => (
            validate_name(first)?,
            validate_name(event)?,
            Some(flags.to_compact_string()),
        ),
    };
    Ok((system, event, flags))
}

fn validate_name(name: &str) -> Result<CompactString, SpecError> {
    if name.is_empty() {
        return Err(SpecError::EmptyName);
    }
    if let Some(bad) = name.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(SpecError::InvalidNameChar(bad, name.to_compact_string()));
    }
    Ok(name.to_compact_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_empty_not_error() {
        assert_eq!(TracepointSpec::parse(""), TracepointSpec::Empty);
        assert_eq!(TracepointSpec::parse("   "), TracepointSpec::Empty);
        assert_eq!(TracepointSpec::parse("\t \t"), TracepointSpec::Empty);
    }

    #[test]
    fn identifier_forms() {
        assert_eq!(
            TracepointSpec::parse(":sched:sched_switch"),
            TracepointSpec::Identifier {
                system: "sched".into(),
                event: "sched_switch".into(),
            }
        );
        // Bare `:name` defaults to user_events.
        assert_eq!(
            TracepointSpec::parse(":MyEvent"),
            TracepointSpec::Identifier {
                system: USER_EVENTS_SYSTEM.into(),
                event: "MyEvent".into(),
            }
        );
    }

    #[test]
    fn identifier_rejects_fields_and_flags() {
        assert_eq!(
            TracepointSpec::parse(":sys:name ;"),
            TracepointSpec::Error(SpecError::IdentifierCannotHaveFields)
        );
        assert_eq!(
            TracepointSpec::parse(":sys:name:flag"),
            TracepointSpec::Error(SpecError::IdentifierCannotHaveFlags)
        );
    }

    #[test]
    fn definition_with_fields() {
        assert_eq!(
            TracepointSpec::parse("mysys:MyEvent u32 count; char name[16]"),
            TracepointSpec::Definition {
                system: "mysys".into(),
                event: "MyEvent".into(),
                flags: None,
                fields: "u32 count; char name[16]".into(),
            }
        );
    }

    #[test]
    fn definition_shorthand_defaults_system() {
        assert_eq!(
            TracepointSpec::parse("MyEvent u32 count"),
            TracepointSpec::Definition {
                system: USER_EVENTS_SYSTEM.into(),
                event: "MyEvent".into(),
                flags: None,
                fields: "u32 count".into(),
            }
        );
    }

    #[test]
    fn definition_zero_fields_semicolon() {
        assert_eq!(
            TracepointSpec::parse("MyEvent ;"),
            TracepointSpec::Definition {
                system: USER_EVENTS_SYSTEM.into(),
                event: "MyEvent".into(),
                flags: None,
                fields: ";".into(),
            }
        );
    }

    #[test]
    fn definition_with_flags() {
        assert_eq!(
            TracepointSpec::parse("user_events:MyEvent:flag u64 ts"),
            TracepointSpec::Definition {
                system: "user_events".into(),
                event: "MyEvent".into(),
                flags: Some("flag".into()),
                fields: "u64 ts".into(),
            }
        );
    }

    #[test]
    fn eventheader_definition() {
        assert_eq!(
            TracepointSpec::parse("user_events:MyProvider_L5K1f"),
            TracepointSpec::EventHeaderDefinition {
                system: "user_events".into(),
                event: "MyProvider_L5K1f".into(),
                flags: None,
            }
        );
        // Shorthand without system.
        assert_eq!(
            TracepointSpec::parse("MyProvider_L2Kff"),
            TracepointSpec::EventHeaderDefinition {
                system: USER_EVENTS_SYSTEM.into(),
                event: "MyProvider_L2Kff".into(),
                flags: None,
            }
        );
    }

    #[test]
    fn plain_name_without_fields_is_error() {
        assert_eq!(
            TracepointSpec::parse("NotEventHeader"),
            TracepointSpec::Error(SpecError::MissingFields("NotEventHeader".into()))
        );
    }

    #[test]
    fn name_validation() {
        assert_eq!(
            TracepointSpec::parse(":sys:"),
            TracepointSpec::Error(SpecError::EmptyName)
        );
        assert_eq!(
            TracepointSpec::parse("::name u32 x"),
            TracepointSpec::Error(SpecError::EmptyName)
        );
        assert!(matches!(
            TracepointSpec::parse("bad-name u32 x"),
            TracepointSpec::Error(SpecError::InvalidNameChar('-', _))
        ));
    }

    #[test]
    fn key_names_the_resolved_tracepoint() {
        assert_eq!(
            TracepointSpec::parse(":sched:sched_switch").key(),
            Some(("sched", "sched_switch"))
        );
        assert_eq!(
            TracepointSpec::parse("MyEvent u32 x").key(),
            Some((USER_EVENTS_SYSTEM, "MyEvent"))
        );
        assert_eq!(TracepointSpec::parse("").key(), None);
        assert_eq!(TracepointSpec::parse(":bad name").key(), None);
    }

    /// Every parse returns exactly one tagged value; a grab bag of hostile
    /// inputs must not panic.
    #[test]
    fn parser_is_total() {
        let inputs = [
            "", " ", ":", "::", ":::", ": ", "a:b:c:d e", "\u{0}x", "名前 u32 x",
            ":a:b:c:d", "x ", "x  ;", " : ", "a b c d e f", ":a b",
        ];
        for input in inputs {
            let _ = TracepointSpec::parse(input);
        }
    }

    /// Definition captures concatenate back to the trimmed input line.
    #[test]
    fn definition_round_trip() {
        let lines = [
            "mysys:MyEvent u32 count; char name[16]",
            "user_events:MyEvent:myflag u64 ts",
            "sys:Ev ;",
        ];
        for line in lines {
            let TracepointSpec::Definition {
                system,
                event,
                flags,
                fields,
            } = TracepointSpec::parse(line)
            else {
                panic!("expected definition for {line:?}");
            };
            let rebuilt = match flags {
                Some(flags) => format!("{system}:{event}:{flags} {fields}"),
                None => format!("{system}:{event} {fields}"),
            };
            assert_eq!(rebuilt, line);
        }
    }
}
